//! Embedded CPython backend
//!
//! Provides [`PythonRuntime`], the [`ForeignRuntime`] used by the process-wide
//! bridge:
//! - Lifecycle (`PyConfig` + `Py_InitializeFromConfig`, `Py_FinalizeEx`)
//! - The GIL as the execution lock (`Python::with_gil`)
//! - Marshaling between documents and Python objects
//!
//! Handles are `Bound<'py, PyAny>`: dropping one decrements the reference
//! count, and the `'py` lifetime keeps it from escaping the GIL scope.

use crate::codec::Document;
use crate::error::BridgeError;
use crate::foreign::{ForeignRuntime, ForeignSession, RuntimeConfig};
use crate::report::FALLBACK_FOREIGN_ERROR;
use parking_lot::Mutex;
use pyo3::exceptions::PyModuleNotFoundError;
use pyo3::ffi;
use pyo3::prelude::*;
use pyo3::types::{PyBool, PyDict, PyFloat, PyInt, PyList, PyString, PyTuple};
use serde_json::{Map, Number};
use std::ffi::{CStr, CString};
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

/// Nesting limit when converting Python objects into documents.
const MAX_DEPTH: usize = 64;

/// Module code has run in the interpreter: an import succeeded or failed
/// past the point of locating the module.
static IMPORTED: AtomicBool = AtomicBool::new(false);

/// An interpreter that ran module code was finalized. CPython extension
/// modules do not survive a restart, so no interpreter is started again.
static RETIRED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interpreter {
    NotStarted,
    /// Started by this bridge; finalized at shutdown.
    Owned,
    /// Already running in the host process; never finalized here.
    Borrowed,
}

pub struct PythonRuntime {
    interpreter: Mutex<Interpreter>,
}

impl PythonRuntime {
    /// Only the process-wide bridge constructs this.
    pub(crate) fn new() -> Self {
        Self {
            interpreter: Mutex::new(Interpreter::NotStarted),
        }
    }
}

impl ForeignRuntime for PythonRuntime {
    type Session<'s> = PySession<'s>;

    fn start(&self, config: &RuntimeConfig<'_>) -> Result<(), BridgeError> {
        let mut interpreter = self.interpreter.lock();
        if *interpreter != Interpreter::NotStarted {
            return Err(BridgeError::ForeignRuntime(
                "the embedded interpreter is already running".to_string(),
            ));
        }
        if RETIRED.load(Ordering::SeqCst) {
            return Err(BridgeError::ForeignRuntime(
                "the embedded interpreter was finalized and cannot be restarted".to_string(),
            ));
        }

        if unsafe { ffi::Py_IsInitialized() } != 0 {
            log::info!("host process already runs an interpreter; borrowing it");
            *interpreter = Interpreter::Borrowed;
            return Ok(());
        }

        IMPORTED.store(false, Ordering::SeqCst);
        unsafe {
            initialize_interpreter(config)?;
            // Py_InitializeFromConfig returns holding the GIL; after start it
            // is only taken per call.
            ffi::PyEval_SaveThread();
        }
        *interpreter = Interpreter::Owned;
        log::info!("embedded interpreter started");
        Ok(())
    }

    fn finalize(&self) {
        let mut interpreter = self.interpreter.lock();
        match *interpreter {
            Interpreter::Owned => {
                unsafe {
                    ffi::PyGILState_Ensure();
                    if ffi::Py_FinalizeEx() != 0 {
                        log::warn!("Py_FinalizeEx could not flush buffered data");
                    }
                }
                *interpreter = Interpreter::NotStarted;
                if IMPORTED.swap(false, Ordering::SeqCst) {
                    RETIRED.store(true, Ordering::SeqCst);
                    log::info!("embedded interpreter finalized");
                } else {
                    log::info!(
                        "embedded interpreter finalized before any module loaded; \
                         it may be started again"
                    );
                }
            }
            Interpreter::Borrowed => {
                log::debug!("leaving the host interpreter running");
                *interpreter = Interpreter::NotStarted;
            }
            Interpreter::NotStarted => {}
        }
    }

    fn with_lock<T, F>(&self, f: F) -> T
    where
        F: for<'s> FnOnce(&mut Self::Session<'s>) -> T,
    {
        Python::with_gil(|py| f(&mut PySession { py }))
    }
}

/// Configure program name and home, then start the interpreter.
///
/// # Safety
///
/// Must not run concurrently with any other interpreter initialization.
unsafe fn initialize_interpreter(config: &RuntimeConfig<'_>) -> Result<(), BridgeError> {
    let program_name = CString::new(config.program_name).map_err(|_| {
        BridgeError::InvalidRequest("program name contains a NUL byte".to_string())
    })?;
    let home = match config.home {
        Some(home) => Some(CString::new(home.to_string_lossy().into_owned()).map_err(|_| {
            BridgeError::InvalidRequest("runtime home contains a NUL byte".to_string())
        })?),
        None => None,
    };

    let mut storage = MaybeUninit::<ffi::PyConfig>::uninit();
    let py_config = storage.as_mut_ptr();
    ffi::PyConfig_InitPythonConfig(py_config);

    let mut status = ffi::PyConfig_SetBytesString(
        py_config,
        ptr::addr_of_mut!((*py_config).program_name),
        program_name.as_ptr(),
    );
    if ffi::PyStatus_Exception(status) == 0 {
        if let Some(home) = &home {
            status = ffi::PyConfig_SetBytesString(
                py_config,
                ptr::addr_of_mut!((*py_config).home),
                home.as_ptr(),
            );
        }
    }
    if ffi::PyStatus_Exception(status) == 0 {
        status = ffi::Py_InitializeFromConfig(py_config);
    }
    ffi::PyConfig_Clear(py_config);

    if ffi::PyStatus_Exception(status) != 0 {
        return Err(BridgeError::ForeignRuntime(status_message(&status)));
    }
    if ffi::Py_IsInitialized() == 0 {
        return Err(BridgeError::ForeignRuntime("Py_Initialize failed".to_string()));
    }
    Ok(())
}

fn status_message(status: &ffi::PyStatus) -> String {
    let text = |p: *const std::ffi::c_char| {
        (!p.is_null()).then(|| unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned())
    };
    match (text(status.func), text(status.err_msg)) {
        (Some(func), Some(msg)) => format!("{}: {}", func, msg),
        (None, Some(msg)) => msg,
        _ => "Py_Initialize failed".to_string(),
    }
}

/// Format the active Python exception.
fn foreign_error(py: Python<'_>, err: PyErr) -> BridgeError {
    let value = err.value(py);
    let message = match value.str().and_then(|s| s.to_cow().map(|c| c.into_owned())) {
        Ok(text) if !text.is_empty() => text,
        Ok(_) => value
            .get_type()
            .name()
            .map(|name| name.to_string())
            .unwrap_or_else(|_| FALLBACK_FOREIGN_ERROR.to_string()),
        Err(_) => FALLBACK_FOREIGN_ERROR.to_string(),
    };
    BridgeError::ForeignRuntime(message)
}

/// The import failed because `name` itself could not be located, so none of
/// its code ran.
fn module_not_found(py: Python<'_>, err: &PyErr, name: &str) -> bool {
    err.is_instance_of::<PyModuleNotFoundError>(py)
        && err
            .value(py)
            .getattr("name")
            .and_then(|missing| missing.extract::<String>())
            .is_ok_and(|missing| missing == name)
}

/// GIL-holding session.
pub struct PySession<'py> {
    py: Python<'py>,
}

impl<'py> ForeignSession for PySession<'py> {
    type Value = Bound<'py, PyAny>;

    fn import_module(&mut self, name: &str) -> Result<Self::Value, BridgeError> {
        match PyModule::import(self.py, name) {
            Ok(module) => {
                IMPORTED.store(true, Ordering::SeqCst);
                Ok(module.into_any())
            }
            Err(e) => {
                if !module_not_found(self.py, &e, name) {
                    IMPORTED.store(true, Ordering::SeqCst);
                }
                Err(foreign_error(self.py, e))
            }
        }
    }

    fn get_attr(&mut self, target: &Self::Value, name: &str) -> Result<Self::Value, BridgeError> {
        target.getattr(name).map_err(|e| foreign_error(self.py, e))
    }

    fn call_method(
        &mut self,
        target: &Self::Value,
        name: &str,
        args: &[&Self::Value],
    ) -> Result<Self::Value, BridgeError> {
        let py = self.py;
        let args = PyTuple::new(py, args.iter().copied()).map_err(|e| foreign_error(py, e))?;
        target
            .call_method1(name, args)
            .map_err(|e| foreign_error(py, e))
    }

    fn to_foreign(&mut self, doc: &Document) -> Result<Self::Value, BridgeError> {
        document_to_py(self.py, doc).map_err(|e| foreign_error(self.py, e))
    }

    fn to_document(&mut self, value: &Self::Value) -> Result<Document, BridgeError> {
        py_to_document(value, 0)
    }
}

fn document_to_py<'py>(py: Python<'py>, doc: &Document) -> PyResult<Bound<'py, PyAny>> {
    let value = match doc {
        Document::Null => py.None().into_bound(py),
        Document::Bool(b) => PyBool::new(py, *b).to_owned().into_any(),
        Document::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.into_pyobject(py)?.into_any()
            } else if let Some(u) = n.as_u64() {
                u.into_pyobject(py)?.into_any()
            } else {
                PyFloat::new(py, n.as_f64().unwrap_or(f64::NAN)).into_any()
            }
        }
        Document::String(s) => PyString::new(py, s).into_any(),
        Document::Array(items) => {
            let list = PyList::empty(py);
            for item in items {
                list.append(document_to_py(py, item)?)?;
            }
            list.into_any()
        }
        Document::Object(fields) => {
            let dict = PyDict::new(py);
            for (key, item) in fields {
                dict.set_item(key, document_to_py(py, item)?)?;
            }
            dict.into_any()
        }
    };
    Ok(value)
}

fn py_to_document(value: &Bound<'_, PyAny>, depth: usize) -> Result<Document, BridgeError> {
    let py = value.py();
    let err = |e: PyErr| foreign_error(py, e);

    if depth > MAX_DEPTH {
        return Err(BridgeError::Serialization(format!(
            "value nested deeper than {} levels",
            MAX_DEPTH
        )));
    }
    if value.is_none() {
        return Ok(Document::Null);
    }
    if let Ok(b) = value.downcast::<PyBool>() {
        return Ok(Document::Bool(b.is_true()));
    }
    if value.is_instance_of::<PyInt>() {
        if let Ok(i) = value.extract::<i64>() {
            return Ok(Document::from(i));
        }
        if let Ok(u) = value.extract::<u64>() {
            return Ok(Document::from(u));
        }
        return Err(BridgeError::Serialization(
            "integer does not fit in 64 bits".to_string(),
        ));
    }
    if let Ok(f) = value.downcast::<PyFloat>() {
        let f = f.value();
        return Number::from_f64(f)
            .map(Document::Number)
            .ok_or_else(|| BridgeError::Serialization(format!("non-finite float {}", f)));
    }
    if let Ok(s) = value.downcast::<PyString>() {
        return Ok(Document::String(s.to_cow().map_err(err)?.into_owned()));
    }
    if let Ok(dict) = value.downcast::<PyDict>() {
        let mut fields = Map::new();
        for (key, item) in dict.iter() {
            let key = match key.downcast::<PyString>() {
                Ok(s) => s.to_cow().map_err(err)?.into_owned(),
                Err(_) => key.str().map_err(err)?.to_cow().map_err(err)?.into_owned(),
            };
            fields.insert(key, py_to_document(&item, depth + 1)?);
        }
        return Ok(Document::Object(fields));
    }
    if let Ok(tuple) = value.downcast::<PyTuple>() {
        // Named tuples (TerminalInfo, OrderSendResult, ...) become records.
        if value.hasattr("_asdict").map_err(err)? {
            let record = value.call_method0("_asdict").map_err(err)?;
            return py_to_document(&record, depth + 1);
        }
        let items = tuple
            .iter()
            .map(|item| py_to_document(&item, depth + 1))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Document::Array(items));
    }
    if let Ok(list) = value.downcast::<PyList>() {
        let items = list
            .iter()
            .map(|item| py_to_document(&item, depth + 1))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Document::Array(items));
    }
    if value.hasattr("dtype").map_err(err)? && value.hasattr("tolist").map_err(err)? {
        return numpy_to_document(value, depth);
    }

    let type_name = value
        .get_type()
        .name()
        .map(|n| n.to_string())
        .unwrap_or_else(|_| "object".to_string());
    Err(BridgeError::Serialization(format!(
        "cannot convert Python object of type {} to a document",
        type_name
    )))
}

/// numpy values: structured arrays (rates) become arrays of records keyed by
/// field name, everything else goes through `tolist()`.
fn numpy_to_document(value: &Bound<'_, PyAny>, depth: usize) -> Result<Document, BridgeError> {
    let py = value.py();
    let err = |e: PyErr| foreign_error(py, e);

    let names = value
        .getattr("dtype")
        .and_then(|dtype| dtype.getattr("names"))
        .map_err(err)?;
    let plain = value.call_method0("tolist").map_err(err)?;
    if names.is_none() {
        return py_to_document(&plain, depth + 1);
    }

    let names: Vec<String> = names.extract().map_err(err)?;
    let record = |row: &Bound<'_, PyAny>| -> Result<Document, BridgeError> {
        let row = row.downcast::<PyTuple>().map_err(|e| err(e.into()))?;
        let mut fields = Map::new();
        for (name, item) in names.iter().zip(row.iter()) {
            fields.insert(name.clone(), py_to_document(&item, depth + 2)?);
        }
        Ok(Document::Object(fields))
    };

    if let Ok(rows) = plain.downcast::<PyList>() {
        let records = rows
            .iter()
            .map(|row| record(&row))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Document::Array(records))
    } else {
        record(&plain)
    }
}
