//! Bridge lifecycle and public entry points
//!
//! [`BridgeLifecycle`] owns one foreign runtime and runs the
//! uninitialized → initialized → uninitialized state machine around it.
//!
//! # Locking
//!
//! The lifecycle lock is an `RwLock`. `initialize` and `shutdown` hold it
//! exclusively; every `eval` holds it shared for the whole call, so a shutdown
//! waits for in-flight calls and no call starts while the runtime is being
//! torn down. Foreign code runs under the runtime's execution lock, which is
//! always taken after the lifecycle lock and only for one call.

use crate::codec::{self, Document};
use crate::config::BridgeConfig;
use crate::dispatch::{self, ForeignCall, MethodCall, SETUP_ENTRY, TEARDOWN_ENTRY};
use crate::error::{BridgeError, Outcome};
use crate::foreign::{ForeignRuntime, RuntimeConfig};
use crate::lock;
use crate::report::ErrorReporter;
use parking_lot::RwLock;
use std::path::Path;

#[derive(Debug, Default)]
struct State {
    initialized: bool,
}

pub struct BridgeLifecycle<R: ForeignRuntime> {
    runtime: R,
    config: BridgeConfig,
    state: RwLock<State>,
    errors: ErrorReporter,
}

impl<R: ForeignRuntime> BridgeLifecycle<R> {
    pub fn new(runtime: R, config: BridgeConfig) -> Self {
        Self {
            runtime,
            config,
            state: RwLock::new(State::default()),
            errors: ErrorReporter::new(),
        }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().initialized
    }

    /// Last recorded failure, if any.
    pub fn last_error(&self) -> Option<String> {
        self.errors.last()
    }

    /// Start the runtime, import the vendor module and run its setup.
    ///
    /// Idempotent: an initialized bridge returns `AlreadyHandled` and ignores
    /// `home`. On failure the bridge stays uninitialized and any runtime that
    /// was started is finalized again.
    pub fn initialize(&self, home: Option<&Path>) -> Result<Outcome, BridgeError> {
        self.entry(|| {
            let mut state = self.state.write();
            if state.initialized {
                log::debug!("initialize: already initialized");
                return Ok(Outcome::AlreadyHandled);
            }

            self.start(home)?;
            state.initialized = true;
            log::info!(
                "mt5bridge initialized (vendor module {})",
                self.config.vendor_module
            );
            Ok(Outcome::Performed)
        })
    }

    fn start(&self, home: Option<&Path>) -> Result<(), BridgeError> {
        let home = self.config.resolve_home(home);
        log::info!(
            "starting embedded runtime as {} (home: {})",
            self.config.program_name,
            home.map_or_else(|| "<default>".to_string(), |h| h.display().to_string())
        );
        self.runtime.start(&RuntimeConfig {
            program_name: &self.config.program_name,
            home,
        })?;

        let vendor = self.config.vendor_module.as_str();
        let setup = lock::enter(&self.runtime, "initialize", |session| {
            dispatch::execute(session, vendor, &ForeignCall::bare(SETUP_ENTRY))
        });
        match setup {
            Ok(Document::Bool(false)) => {
                log::warn!("{}.{}() reported failure; continuing", vendor, SETUP_ENTRY);
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) => {
                log::warn!("vendor setup failed, finalizing runtime: {}", e);
                self.runtime.finalize();
                Err(e)
            }
        }
    }

    /// Disconnect the vendor module and finalize the runtime.
    ///
    /// Idempotent. A failing disconnect is recorded as the last error but does
    /// not stop the teardown. Waits for in-flight calls to finish.
    pub fn shutdown(&self) -> Result<Outcome, BridgeError> {
        self.entry(|| {
            let mut state = self.state.write();
            if !state.initialized {
                log::debug!("shutdown: not initialized");
                return Ok(Outcome::AlreadyHandled);
            }

            let vendor = self.config.vendor_module.as_str();
            let teardown = lock::enter(&self.runtime, "shutdown", |session| {
                dispatch::execute(session, vendor, &ForeignCall::bare(TEARDOWN_ENTRY))
            });
            if let Err(e) = teardown {
                log::warn!("vendor disconnect failed: {}", e);
                self.errors.set(e.to_string());
            }

            self.runtime.finalize();
            state.initialized = false;
            log::info!("mt5bridge shut down");
            Ok(Outcome::Performed)
        })
    }

    /// Evaluate one request document.
    ///
    /// The absent document (`null`) is a successful response: it means the
    /// vendor call had no data to return.
    pub fn eval(&self, request: &Document) -> Result<Document, BridgeError> {
        self.entry(|| self.eval_document(request))
    }

    /// Evaluate a request given as interchange text and return the response
    /// as compact text.
    pub fn eval_json(&self, request: &str) -> Result<String, BridgeError> {
        self.entry(|| {
            let request = codec::decode_request(request)?;
            let response = self.eval_document(&request)?;
            codec::encode(&response)
        })
    }

    fn eval_document(&self, request: &Document) -> Result<Document, BridgeError> {
        let state = self.state.read();
        if !state.initialized {
            return Err(BridgeError::NotInitialized);
        }

        let call = MethodCall::from_request(request)?;
        let method = call.method();
        log::debug!("dispatching {}", method.name());

        let vendor = self.config.vendor_module.as_str();
        let plan = call.plan();
        lock::enter(&self.runtime, method.name(), |session| {
            dispatch::execute(session, vendor, &plan)
        })
    }

    /// Record a failure detected before any bridge work, e.g. a null pointer
    /// at the C boundary.
    pub fn reject(&self, err: BridgeError) -> BridgeError {
        self.errors.clear();
        self.errors.record(&err);
        err
    }

    /// Wraps a public entry point: refuse reentry from foreign code, clear the
    /// last error, record the failure if there is one.
    ///
    /// A reentrant call is refused before the shared slot is touched, so the
    /// outer call's outcome stays the one reported.
    fn entry<T>(&self, f: impl FnOnce() -> Result<T, BridgeError>) -> Result<T, BridgeError> {
        lock::ensure_not_reentrant()?;
        self.errors.clear();
        let result = f();
        if let Err(e) = &result {
            self.errors.record(e);
        }
        result
    }
}

impl<R: ForeignRuntime> Drop for BridgeLifecycle<R> {
    fn drop(&mut self) {
        if self.state.get_mut().initialized {
            let _ = self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedRuntime;
    use serde_json::json;

    fn bridge() -> BridgeLifecycle<ScriptedRuntime> {
        BridgeLifecycle::new(ScriptedRuntime::metatrader(), BridgeConfig::default())
    }

    #[test]
    fn eval_before_initialize_never_enters_the_runtime() {
        let bridge = bridge();
        let err = bridge
            .eval(&json!({"method": "get_m1_bars", "symbol": "EURUSD", "count": 1}))
            .unwrap_err();
        assert_eq!(err, BridgeError::NotInitialized);
        assert_eq!(bridge.last_error().as_deref(), Some("bridge not initialized"));
        assert_eq!(bridge.runtime().lock_entries(), 0);
    }

    #[test]
    fn initialize_runs_vendor_setup_and_releases_the_lock() {
        let bridge = bridge();
        assert_eq!(bridge.initialize(None), Ok(Outcome::Performed));
        assert!(bridge.is_initialized());
        let calls = bridge.runtime().calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].entry, "initialize");
        assert!(bridge.eval(&json!({"method": "terminal_info"})).is_ok());
    }

    #[test]
    fn configured_home_is_used_when_none_is_given() {
        let bridge = BridgeLifecycle::new(
            ScriptedRuntime::metatrader(),
            BridgeConfig::default().with_runtime_home("/opt/mt5-python"),
        );
        bridge.initialize(None).unwrap();
        assert_eq!(
            bridge.runtime().started_home(),
            Some(std::path::PathBuf::from("/opt/mt5-python"))
        );
    }

    #[test]
    fn failed_start_leaves_bridge_uninitialized() {
        let bridge = bridge();
        bridge.runtime().fail_start("Py_Initialize failed");
        let err = bridge.initialize(None).unwrap_err();
        assert_eq!(err, BridgeError::ForeignRuntime("Py_Initialize failed".into()));
        assert!(!bridge.is_initialized());
        assert_eq!(bridge.runtime().finalizes(), 0);
        assert_eq!(bridge.last_error().as_deref(), Some("Py_Initialize failed"));
    }

    #[test]
    fn failed_import_finalizes_the_started_runtime() {
        let bridge = BridgeLifecycle::new(
            ScriptedRuntime::metatrader(),
            BridgeConfig::default().with_vendor_module("NotInstalled"),
        );
        let err = bridge.initialize(None).unwrap_err();
        assert_eq!(
            err,
            BridgeError::ForeignRuntime("No module named 'NotInstalled'".into())
        );
        assert!(!bridge.is_initialized());
        assert!(!bridge.runtime().is_running());
        assert_eq!(bridge.runtime().starts(), 1);
        assert_eq!(bridge.runtime().finalizes(), 1);
        assert_eq!(bridge.runtime().live_values(), 0);
    }

    #[test]
    fn shutdown_disconnects_then_finalizes() {
        let bridge = bridge();
        bridge.initialize(None).unwrap();
        assert_eq!(bridge.shutdown(), Ok(Outcome::Performed));
        assert!(!bridge.is_initialized());
        assert_eq!(bridge.runtime().finalizes(), 1);
        let entries: Vec<_> = bridge.runtime().calls().into_iter().map(|c| c.entry).collect();
        assert_eq!(entries, vec!["initialize", "shutdown"]);
    }

    #[test]
    fn drop_shuts_an_initialized_bridge_down() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let disconnected = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&disconnected);
        let runtime = ScriptedRuntime::new().with_module(
            crate::scripted::metatrader_module("MetaTrader5").function("shutdown", move |_| {
                flag.store(true, Ordering::SeqCst);
                Ok(Document::Null)
            }),
        );
        let bridge = BridgeLifecycle::new(runtime, BridgeConfig::default());
        bridge.initialize(None).unwrap();
        drop(bridge);
        assert!(disconnected.load(Ordering::SeqCst));
    }

    #[test]
    fn eval_json_round_trips_text() {
        let bridge = bridge();
        bridge.initialize(None).unwrap();
        let out = bridge
            .eval_json(r#"{"method":"last_error"}"#)
            .unwrap();
        assert_eq!(out, r#"[-10004,"No IPC connection"]"#);
    }

    #[test]
    fn eval_json_rejects_malformed_text() {
        let bridge = bridge();
        bridge.initialize(None).unwrap();
        let err = bridge.eval_json("{not json").unwrap_err();
        assert!(matches!(err, BridgeError::Serialization(_)));
        assert!(bridge.last_error().unwrap().starts_with("serialization error"));
    }

    #[test]
    fn reject_replaces_the_pending_error() {
        let bridge = bridge();
        let _ = bridge.eval(&json!({"method": "terminal_info"}));
        let err = bridge.reject(BridgeError::InvalidRequest("request is null".into()));
        assert_eq!(err.code(), -3);
        assert_eq!(
            bridge.last_error().as_deref(),
            Some("invalid request: request is null")
        );
    }
}
