use std::collections::BTreeSet;
use std::sync::Arc;

use pyo3::exceptions::{PyAttributeError, PyTypeError};
use pyo3::prelude::*;
use pyo3::types::{PyAnyMethods, PyModule};

/// Hands allow-listed modules to sandboxed code. Sandboxed code only ever
/// holds a [`ModuleProxy`], whether the module was pre-bound as a capability
/// or came back from the import gate.
#[pyclass(frozen, name = "SandboxModuleGate")]
pub(crate) struct ModuleGate {
    allowed: Arc<BTreeSet<String>>,
}

impl ModuleGate {
    pub(crate) fn new<'a>(modules: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            allowed: Arc::new(modules.into_iter().map(str::to_string).collect()),
        }
    }

    pub(crate) fn expose<'py>(&self, module: &Bound<'py, PyAny>) -> PyResult<Bound<'py, PyAny>> {
        let module = module
            .cast::<PyModule>()
            .map_err(|_| PyTypeError::new_err("only modules can be exposed to the sandbox"))?;
        let proxy = ModuleProxy {
            name: module_name(module)?,
            module: module.clone().unbind(),
            allowed: Arc::clone(&self.allowed),
        };
        Ok(Bound::new(module.py(), proxy)?.into_any())
    }
}

#[pymethods]
impl ModuleGate {
    fn __call__<'py>(&self, module: &Bound<'py, PyAny>) -> PyResult<Bound<'py, PyAny>> {
        self.expose(module)
    }
}

/// Attribute view of a host module. Dunder attributes are hidden and
/// submodules resolve only when they are allow-listed themselves.
#[pyclass(frozen, name = "SandboxModule")]
pub(crate) struct ModuleProxy {
    name: String,
    module: Py<PyModule>,
    allowed: Arc<BTreeSet<String>>,
}

#[pymethods]
impl ModuleProxy {
    fn __getattr__<'py>(&self, py: Python<'py>, attr: &str) -> PyResult<Bound<'py, PyAny>> {
        if attr.starts_with("__") {
            return Err(PyAttributeError::new_err(format!(
                "module '{}' has no attribute '{attr}'",
                self.name
            )));
        }

        let value = self.module.bind(py).getattr(attr)?;
        let Ok(submodule) = value.cast::<PyModule>() else {
            return Ok(value);
        };
        let name = module_name(submodule)?;
        if !self.allowed.contains(&name) {
            return Err(PyAttributeError::new_err(format!(
                "module '{name}' is not available in the sandbox"
            )));
        }
        let proxy = ModuleProxy {
            name,
            module: submodule.clone().unbind(),
            allowed: Arc::clone(&self.allowed),
        };
        Ok(Bound::new(py, proxy)?.into_any())
    }

    fn __dir__(&self, py: Python<'_>) -> PyResult<Vec<String>> {
        let names: Vec<String> = self.module.bind(py).dir()?.extract()?;
        Ok(names
            .into_iter()
            .filter(|name| !name.starts_with("__"))
            .collect())
    }

    fn __repr__(&self) -> String {
        format!("<sandbox module '{}'>", self.name)
    }
}

fn module_name(module: &Bound<'_, PyModule>) -> PyResult<String> {
    module.getattr("__name__")?.extract()
}
