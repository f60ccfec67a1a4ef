//! mt5bridge: drive the MetaTrader5 Python module from native code through
//! JSON request documents.
//!
//! The bridge embeds one interpreter per process. Callers initialize it once,
//! then evaluate `{"method": ..., ...}` documents from any thread; each call
//! takes the interpreter's global lock only for its own duration.

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod foreign;
pub mod lifecycle;
pub mod lock;
pub mod report;
pub mod scripted;

#[cfg(feature = "python")]
mod ffi;
#[cfg(feature = "python")]
mod python_runtime;

pub use codec::Document;
pub use config::BridgeConfig;
pub use dispatch::{Method, MethodCall};
pub use error::{BridgeError, Outcome};
pub use foreign::{ForeignRuntime, ForeignSession};
pub use lifecycle::BridgeLifecycle;

#[cfg(feature = "python")]
pub use ffi::*;
#[cfg(feature = "python")]
pub use python_runtime::PythonRuntime;

/// Initialize `env_logger` once, honoring `MT5BRIDGE_LOG`. Later calls and
/// hosts that installed their own logger are left alone.
pub fn init_logging(default_filter: &str) {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().filter_or(config::ENV_LOG, default_filter),
    )
    .try_init();
}

#[cfg(feature = "python")]
static BRIDGE: once_cell::sync::Lazy<BridgeLifecycle<PythonRuntime>> =
    once_cell::sync::Lazy::new(|| {
        BridgeLifecycle::new(PythonRuntime::new(), BridgeConfig::from_env())
    });

/// The process-wide bridge. There is exactly one per process.
#[cfg(feature = "python")]
pub fn get_bridge() -> &'static BridgeLifecycle<PythonRuntime> {
    &BRIDGE
}

/// Initialize the process-wide bridge.
#[cfg(feature = "python")]
pub fn init_bridge(home: Option<&std::path::Path>) -> Result<Outcome, BridgeError> {
    get_bridge().initialize(home)
}
