//! In-memory scripted runtime
//!
//! A [`ForeignRuntime`] whose modules are assembled from Rust closures. It
//! runs the whole bridge protocol without an interpreter and records what
//! happened inside it:
//! - live handle count (every handle it hands out is counted until dropped)
//! - a journal of every foreign call with its marshaled arguments
//! - the interval each thread held the execution lock
//!
//! [`ScriptedRuntime::metatrader`] mimics the vendor module with no terminal
//! running.

use crate::codec::Document;
use crate::error::BridgeError;
use crate::foreign::{ForeignRuntime, ForeignSession, RuntimeConfig};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Instant;

/// A scripted module function: marshaled arguments in, document or error message out.
pub type Handler = Box<dyn Fn(&[Document]) -> Result<Document, String> + Send + Sync>;

enum Member {
    Function(Handler),
    /// Returns an object with no document form.
    Opaque(String),
}

/// A module the scripted runtime can import.
pub struct ScriptedModule {
    name: String,
    constants: HashMap<String, Document>,
    members: HashMap<String, Member>,
}

impl ScriptedModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            constants: HashMap::new(),
            members: HashMap::new(),
        }
    }

    pub fn constant(mut self, name: impl Into<String>, value: Document) -> Self {
        self.constants.insert(name.into(), value);
        self
    }

    pub fn function<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&[Document]) -> Result<Document, String> + Send + Sync + 'static,
    {
        self.members
            .insert(name.into(), Member::Function(Box::new(handler)));
        self
    }

    /// A function returning a value of `type_name` that cannot be marshaled.
    pub fn opaque_function(mut self, name: impl Into<String>, type_name: impl Into<String>) -> Self {
        self.members
            .insert(name.into(), Member::Opaque(type_name.into()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// One foreign call as seen by the runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub module: String,
    pub entry: String,
    pub args: Vec<Document>,
}

/// One acquisition of the execution lock.
#[derive(Debug, Clone, Copy)]
pub struct LockHold {
    pub thread: ThreadId,
    pub acquired: Instant,
    pub released: Instant,
}

impl LockHold {
    pub fn overlaps(&self, other: &LockHold) -> bool {
        self.acquired < other.released && other.acquired < self.released
    }
}

#[derive(Debug, Default)]
struct Lifecycle {
    running: bool,
    starts: usize,
    finalizes: usize,
    program_name: Option<String>,
    home: Option<PathBuf>,
    start_failure: Option<String>,
}

#[derive(Default)]
pub struct ScriptedRuntime {
    lock: Mutex<()>,
    modules: RwLock<HashMap<String, Arc<ScriptedModule>>>,
    lifecycle: Mutex<Lifecycle>,
    calls: Mutex<Vec<CallRecord>>,
    holds: Mutex<Vec<LockHold>>,
    live: Arc<AtomicUsize>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Vendor module with no terminal attached: setup reports `false` and
    /// every data call returns null.
    pub fn metatrader() -> Self {
        Self::new().with_module(metatrader_module("MetaTrader5"))
    }

    pub fn with_module(self, module: ScriptedModule) -> Self {
        self.install(module);
        self
    }

    /// Add or replace a module.
    pub fn install(&self, module: ScriptedModule) {
        self.modules
            .write()
            .insert(module.name.clone(), Arc::new(module));
    }

    /// Make the next `start` calls fail with `message`.
    pub fn fail_start(&self, message: impl Into<String>) {
        self.lifecycle.lock().start_failure = Some(message.into());
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.lock().running
    }

    pub fn starts(&self) -> usize {
        self.lifecycle.lock().starts
    }

    pub fn finalizes(&self) -> usize {
        self.lifecycle.lock().finalizes
    }

    /// Home directory passed to the last `start`.
    pub fn started_home(&self) -> Option<PathBuf> {
        self.lifecycle.lock().home.clone()
    }

    pub fn started_program_name(&self) -> Option<String> {
        self.lifecycle.lock().program_name.clone()
    }

    /// Handles handed out and not yet released.
    pub fn live_values(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().clone()
    }

    pub fn holds(&self) -> Vec<LockHold> {
        self.holds.lock().clone()
    }

    /// Number of times the execution lock was taken.
    pub fn lock_entries(&self) -> usize {
        self.holds.lock().len()
    }

    fn value(&self, object: Object) -> ScriptedValue {
        self.live.fetch_add(1, Ordering::SeqCst);
        ScriptedValue {
            object,
            live: Arc::clone(&self.live),
        }
    }
}

/// A scripted module shaped like the vendor module without a terminal.
pub fn metatrader_module(name: &str) -> ScriptedModule {
    ScriptedModule::new(name)
        .constant("TIMEFRAME_M1", json!(1))
        .function("initialize", |_| Ok(json!(false)))
        .function("shutdown", |_| Ok(Document::Null))
        .function("copy_rates_from_pos", |_| Ok(Document::Null))
        .function("order_send", |_| Ok(Document::Null))
        .function("terminal_info", |_| Ok(Document::Null))
        .function("account_info", |_| Ok(Document::Null))
        .function("symbol_info", |_| Ok(Document::Null))
        .function("last_error", |_| Ok(json!([-10004, "No IPC connection"])))
}

enum Object {
    Module(Arc<ScriptedModule>),
    Data(Document),
    Opaque(String),
}

/// Counted handle into the scripted object graph.
pub struct ScriptedValue {
    object: Object,
    live: Arc<AtomicUsize>,
}

impl Drop for ScriptedValue {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedValue {
    fn type_name(&self) -> String {
        match &self.object {
            Object::Module(_) => "module".to_string(),
            Object::Data(doc) => crate::codec::kind_of(doc).to_string(),
            Object::Opaque(name) => name.clone(),
        }
    }

    fn journal_form(&self) -> Document {
        match &self.object {
            Object::Module(m) => Document::String(format!("<module '{}'>", m.name)),
            Object::Data(doc) => doc.clone(),
            Object::Opaque(name) => Document::String(format!("<{} object>", name)),
        }
    }
}

pub struct ScriptedSession<'s> {
    runtime: &'s ScriptedRuntime,
}

impl ForeignSession for ScriptedSession<'_> {
    type Value = ScriptedValue;

    fn import_module(&mut self, name: &str) -> Result<ScriptedValue, BridgeError> {
        if !self.runtime.is_running() {
            return Err(BridgeError::ForeignRuntime(
                "interpreter is not running".to_string(),
            ));
        }
        let module = self.runtime.modules.read().get(name).cloned();
        match module {
            Some(module) => Ok(self.runtime.value(Object::Module(module))),
            None => Err(BridgeError::ForeignRuntime(format!(
                "No module named '{}'",
                name
            ))),
        }
    }

    fn get_attr(&mut self, target: &ScriptedValue, name: &str) -> Result<ScriptedValue, BridgeError> {
        let Object::Module(module) = &target.object else {
            return Err(BridgeError::ForeignRuntime(format!(
                "'{}' object has no attribute '{}'",
                target.type_name(),
                name
            )));
        };
        match module.constants.get(name) {
            Some(value) => Ok(self.runtime.value(Object::Data(value.clone()))),
            None => Err(BridgeError::ForeignRuntime(format!(
                "module '{}' has no attribute '{}'",
                module.name, name
            ))),
        }
    }

    fn call_method(
        &mut self,
        target: &ScriptedValue,
        name: &str,
        args: &[&ScriptedValue],
    ) -> Result<ScriptedValue, BridgeError> {
        let Object::Module(module) = &target.object else {
            return Err(BridgeError::ForeignRuntime(format!(
                "'{}' object has no attribute '{}'",
                target.type_name(),
                name
            )));
        };
        let args: Vec<Document> = args.iter().map(|a| a.journal_form()).collect();
        self.runtime.calls.lock().push(CallRecord {
            module: module.name.clone(),
            entry: name.to_string(),
            args: args.clone(),
        });

        match module.members.get(name) {
            Some(Member::Function(handler)) => handler(&args)
                .map(|doc| self.runtime.value(Object::Data(doc)))
                .map_err(BridgeError::ForeignRuntime),
            Some(Member::Opaque(type_name)) => {
                Ok(self.runtime.value(Object::Opaque(type_name.clone())))
            }
            None => Err(BridgeError::ForeignRuntime(format!(
                "module '{}' has no attribute '{}'",
                module.name, name
            ))),
        }
    }

    fn to_foreign(&mut self, doc: &Document) -> Result<ScriptedValue, BridgeError> {
        Ok(self.runtime.value(Object::Data(doc.clone())))
    }

    fn to_document(&mut self, value: &ScriptedValue) -> Result<Document, BridgeError> {
        match &value.object {
            Object::Data(doc) => Ok(doc.clone()),
            _ => Err(BridgeError::Serialization(format!(
                "cannot convert {} to a document",
                value.type_name()
            ))),
        }
    }
}

/// Appends the hold interval when dropped, before the lock guard is.
struct HoldRecorder<'a> {
    holds: &'a Mutex<Vec<LockHold>>,
    acquired: Instant,
}

impl Drop for HoldRecorder<'_> {
    fn drop(&mut self) {
        self.holds.lock().push(LockHold {
            thread: thread::current().id(),
            acquired: self.acquired,
            released: Instant::now(),
        });
    }
}

impl ForeignRuntime for ScriptedRuntime {
    type Session<'s> = ScriptedSession<'s>;

    fn start(&self, config: &RuntimeConfig<'_>) -> Result<(), BridgeError> {
        let mut lifecycle = self.lifecycle.lock();
        if let Some(message) = &lifecycle.start_failure {
            return Err(BridgeError::ForeignRuntime(message.clone()));
        }
        if lifecycle.running {
            return Err(BridgeError::ForeignRuntime(
                "interpreter already running".to_string(),
            ));
        }
        lifecycle.running = true;
        lifecycle.starts += 1;
        lifecycle.program_name = Some(config.program_name.to_string());
        lifecycle.home = config.home.map(PathBuf::from);
        Ok(())
    }

    fn finalize(&self) {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.running = false;
        lifecycle.finalizes += 1;
    }

    fn with_lock<T, F>(&self, f: F) -> T
    where
        F: for<'s> FnOnce(&mut Self::Session<'s>) -> T,
    {
        let _guard = self.lock.lock();
        let _hold = HoldRecorder {
            holds: &self.holds,
            acquired: Instant::now(),
        };
        let mut session = ScriptedSession { runtime: self };
        f(&mut session)
    }
}
