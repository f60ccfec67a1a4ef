//! Lock/thread-safety adapter
//!
//! Every entry into the foreign runtime goes through [`enter`], which holds
//! the runtime's execution lock for exactly one closure and marks the calling
//! thread as inside the runtime. The lock is not reentrant from the bridge's
//! point of view: a thread that is already inside gets
//! [`BridgeError::Reentrant`] instead of a deadlock.

use crate::error::BridgeError;
use crate::foreign::ForeignRuntime;
use std::cell::Cell;
use std::time::Instant;

thread_local! {
    static INSIDE_FOREIGN: Cell<bool> = const { Cell::new(false) };
}

/// Fail if the current thread is already running foreign-runtime code.
pub fn ensure_not_reentrant() -> Result<(), BridgeError> {
    if INSIDE_FOREIGN.with(Cell::get) {
        return Err(BridgeError::Reentrant);
    }
    Ok(())
}

/// Marks the current thread as inside the runtime until dropped.
struct CallScope {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl CallScope {
    fn enter() -> Result<Self, BridgeError> {
        ensure_not_reentrant()?;
        INSIDE_FOREIGN.with(|flag| flag.set(true));
        Ok(Self {
            _not_send: std::marker::PhantomData,
        })
    }
}

impl Drop for CallScope {
    fn drop(&mut self) {
        INSIDE_FOREIGN.with(|flag| flag.set(false));
    }
}

/// Run `f` inside the runtime under its execution lock.
pub fn enter<R, T, F>(runtime: &R, what: &str, f: F) -> Result<T, BridgeError>
where
    R: ForeignRuntime,
    F: for<'s> FnOnce(&mut R::Session<'s>) -> Result<T, BridgeError>,
{
    let _scope = CallScope::enter()?;
    let started = Instant::now();
    let result = runtime.with_lock(f);
    log::debug!(
        "{}: execution lock released after {:?} (ok={})",
        what,
        started.elapsed(),
        result.is_ok()
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedRuntime;

    #[test]
    fn nested_entry_is_rejected() {
        let runtime = ScriptedRuntime::new();
        let inner = enter(&runtime, "outer", |_| Ok(enter(&runtime, "inner", |_| Ok(()))));
        assert_eq!(inner, Ok(Err(BridgeError::Reentrant)));
    }

    #[test]
    fn scope_is_cleared_after_errors_and_panics() {
        let runtime = ScriptedRuntime::new();
        let failed: Result<(), _> = enter(&runtime, "failing", |_| {
            Err(BridgeError::ForeignRuntime("boom".into()))
        });
        assert!(failed.is_err());
        assert_eq!(ensure_not_reentrant(), Ok(()));

        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: Result<(), _> = enter(&runtime, "panicking", |_| panic!("fault"));
        }));
        assert!(panicked.is_err());
        assert_eq!(ensure_not_reentrant(), Ok(()));
        // The execution lock itself was released by unwinding.
        assert_eq!(enter(&runtime, "after", |_| Ok(7)), Ok(7));
    }
}
