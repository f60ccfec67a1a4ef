//! Seam between the bridge and an embedded foreign runtime
//!
//! The bridge never sees the runtime's object model. It works with:
//! - [`ForeignRuntime`]: process-level start/finalize and the single global
//!   execution lock, exposed only as a scoped acquisition (`with_lock`)
//! - [`ForeignSession`]: what may be done while the lock is held
//! - `ForeignSession::Value`: an owned handle into the runtime's object graph.
//!   Dropping it releases exactly one reference; it cannot outlive the session
//!   that produced it when the backend ties it to the lock scope.

use crate::codec::Document;
use crate::error::BridgeError;
use std::path::Path;

/// Start-up parameters handed to the runtime.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig<'a> {
    pub program_name: &'a str,
    pub home: Option<&'a Path>,
}

/// Operations available while the execution lock is held.
///
/// Every method returning a value hands out a new owned handle. Errors raised
/// inside the runtime are reported as [`BridgeError::ForeignRuntime`] and
/// marshaling failures as [`BridgeError::Serialization`].
pub trait ForeignSession {
    type Value;

    fn import_module(&mut self, name: &str) -> Result<Self::Value, BridgeError>;

    fn get_attr(&mut self, target: &Self::Value, name: &str) -> Result<Self::Value, BridgeError>;

    fn call_method(
        &mut self,
        target: &Self::Value,
        name: &str,
        args: &[&Self::Value],
    ) -> Result<Self::Value, BridgeError>;

    /// Marshal a document into a runtime value.
    fn to_foreign(&mut self, doc: &Document) -> Result<Self::Value, BridgeError>;

    /// Marshal a runtime value back into a document. The runtime's own null
    /// becomes [`Document::Null`].
    fn to_document(&mut self, value: &Self::Value) -> Result<Document, BridgeError>;
}

/// A process-wide embedded runtime.
pub trait ForeignRuntime: Send + Sync + 'static {
    type Session<'s>: ForeignSession;

    /// Configure and start the runtime. Returns with the execution lock
    /// released; after start the lock is only taken through [`with_lock`].
    ///
    /// [`with_lock`]: ForeignRuntime::with_lock
    fn start(&self, config: &RuntimeConfig<'_>) -> Result<(), BridgeError>;

    /// Tear the runtime down. Called at most once per successful `start`.
    fn finalize(&self);

    /// Run `f` holding the execution lock. The lock is released when `f`
    /// returns or unwinds.
    fn with_lock<T, F>(&self, f: F) -> T
    where
        F: for<'s> FnOnce(&mut Self::Session<'s>) -> T;
}
