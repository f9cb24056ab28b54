use std::collections::BTreeMap;
use std::sync::Arc;

use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyAnyMethods, PyDict, PyDictMethods, PyModule, PyTuple};
use serde_json::Value;

use super::modules::ModuleGate;
use super::output::{CapturedOutput, OutputSink};
use super::runtime::{SandboxError, SandboxResult, SandboxRuntime};
use super::types::{Capability, HostFunction};

/// `__name__` seen by sandboxed code, so `if __name__ == "__main__":` blocks
/// run the way they would in a script.
pub const SANDBOX_MODULE_NAME: &str = "__main__";

/// The namespace pair for one execution.
pub(crate) struct SandboxEnvironment {
    pub(crate) globals: Py<PyDict>,
    pub(crate) locals: Py<PyDict>,
}

pub(crate) struct EnvironmentBuilder<'a> {
    runtime: &'a SandboxRuntime,
}

impl<'a> EnvironmentBuilder<'a> {
    pub(crate) fn new(runtime: &'a SandboxRuntime) -> Self {
        Self { runtime }
    }

    /// Globals hold the restricted builtins, identity markers and exactly the
    /// allow-listed capabilities. Modules are bound as
    /// proxies from the same gate the import hook uses. Locals start empty.
    pub(crate) fn build(
        &self,
        py: Python<'_>,
        capabilities: &BTreeMap<String, Capability>,
        output: Arc<CapturedOutput>,
    ) -> SandboxResult<SandboxEnvironment> {
        for name in capabilities.keys() {
            if !is_capability_name(name) {
                return Err(SandboxError::InvalidCapabilityName(name.clone()));
            }
        }

        let sink = Bound::new(py, OutputSink::new(output))?;
        let modules: Vec<&str> = capabilities
            .values()
            .filter_map(Capability::module_name)
            .collect();
        let gate = Bound::new(py, ModuleGate::new(modules.iter().copied()))?;
        let builtins = self
            .runtime
            .call(py, "_sandbox_builtins", (modules, &sink, &gate))?;

        let globals = PyDict::new(py);
        globals.set_item("__builtins__", builtins)?;
        globals.set_item("__name__", SANDBOX_MODULE_NAME)?;
        globals.set_item("__doc__", py.None())?;
        for (name, capability) in capabilities {
            globals.set_item(name, materialize(py, gate.get(), name, capability)?)?;
        }

        Ok(SandboxEnvironment {
            globals: globals.unbind(),
            locals: PyDict::new(py).unbind(),
        })
    }
}

fn is_capability_name(name: &str) -> bool {
    let mut chars = name.chars();
    let starts_ok = chars
        .next()
        .is_some_and(|ch| ch == '_' || ch.is_ascii_alphabetic());
    starts_ok
        && chars.all(|ch| ch == '_' || ch.is_ascii_alphanumeric())
        && !name.starts_with("__")
}

fn materialize<'py>(
    py: Python<'py>,
    gate: &ModuleGate,
    name: &str,
    capability: &Capability,
) -> SandboxResult<Bound<'py, PyAny>> {
    match capability {
        Capability::Module(module) => {
            let module = PyModule::import(py, module.as_str())?;
            Ok(gate.expose(module.as_any())?)
        }
        Capability::Value(value) => Ok(json_to_python(py, value)?),
        Capability::Function(function) => {
            let callable = HostCallable {
                name: name.to_string(),
                function: Arc::clone(function),
            };
            Ok(Bound::new(py, callable)?.into_any())
        }
    }
}

pub(crate) fn json_to_python<'py>(py: Python<'py>, value: &Value) -> PyResult<Bound<'py, PyAny>> {
    let encoded = serde_json::to_string(value).map_err(|err| PyValueError::new_err(err.to_string()))?;
    PyModule::import(py, "json")?.call_method1("loads", (encoded,))
}

/// Python-side wrapper for a [`HostFunction`]. The GIL is released while the
/// host function runs.
#[pyclass(frozen, name = "HostFunction")]
struct HostCallable {
    name: String,
    function: Arc<dyn HostFunction>,
}

#[pymethods]
impl HostCallable {
    #[pyo3(signature = (*args))]
    fn __call__<'py>(
        &self,
        py: Python<'py>,
        args: &Bound<'py, PyTuple>,
    ) -> PyResult<Bound<'py, PyAny>> {
        let encoded: String = PyModule::import(py, "json")?
            .call_method1("dumps", (args,))?
            .extract()?;
        let values: Vec<Value> = serde_json::from_str(&encoded)
            .map_err(|err| PyValueError::new_err(format!("{}: {err}", self.name)))?;

        let function = Arc::clone(&self.function);
        let result = py
            .detach(move || function.call(values))
            .map_err(|message| PyRuntimeError::new_err(format!("{}: {message}", self.name)))?;
        json_to_python(py, &result)
    }

    fn __repr__(&self) -> String {
        format!("<host function {}>", self.name)
    }
}
