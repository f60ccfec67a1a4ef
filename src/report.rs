//! Process-wide last-error slot
//!
//! Every public entry point clears the slot before doing any work and records
//! its failure, if any, before returning. Last writer wins; callers read the
//! slot immediately after their own failing call.

use crate::error::BridgeError;
use parking_lot::Mutex;

/// Used when the foreign runtime's active error cannot itself be formatted.
pub const FALLBACK_FOREIGN_ERROR: &str = "unknown python error";

#[derive(Debug, Default)]
pub struct ErrorReporter {
    slot: Mutex<Option<String>>,
}

impl ErrorReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, message: impl Into<String>) {
        *self.slot.lock() = Some(message.into());
    }

    pub fn clear(&self) {
        *self.slot.lock() = None;
    }

    /// The pending error message, if any.
    pub fn last(&self) -> Option<String> {
        self.slot.lock().clone()
    }

    /// Log and store a bridge failure.
    pub fn record(&self, err: &BridgeError) {
        log::error!("mt5bridge call failed (code {}): {}", err.code(), err);
        self.set(err.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty() {
        assert_eq!(ErrorReporter::new().last(), None);
    }

    #[test]
    fn last_writer_wins_until_cleared() {
        let reporter = ErrorReporter::new();
        reporter.set("first");
        reporter.record(&BridgeError::UnknownMethod("bogus_method".into()));
        assert_eq!(reporter.last().as_deref(), Some("unknown method: bogus_method"));

        reporter.clear();
        assert_eq!(reporter.last(), None);
    }
}
