use std::ffi::CString;

use pyo3::prelude::*;
use pyo3::types::{PyAnyMethods, PyDict, PyDictMethods, PyModule};
use thiserror::Error;

use super::types::ExceptionInfo;

const RUNTIME_MODULE_NAME: &str = "_agrichart_sandbox_runtime";

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("python runtime error: {0}")]
    Python(#[from] PyErr),
    #[error("runtime helpers contain an interior NUL byte")]
    InvalidHelperSource(#[from] std::ffi::NulError),
    #[error("invalid capability name '{0}': expected a Python identifier not starting with '__'")]
    InvalidCapabilityName(String),
    #[error("invalid helper result: {0}")]
    InvalidResultShape(String),
    #[error("sandbox runtime failed health check")]
    Unhealthy,
}

pub type SandboxResult<T> = std::result::Result<T, SandboxError>;

/// Host-side namespace holding the interpreter helpers. It is loaded once
/// and never exposed to sandboxed code; helpers are stateless so one
/// runtime serves any number of concurrent executions.
pub(crate) struct SandboxRuntime {
    helpers: Py<PyDict>,
}

impl SandboxRuntime {
    pub(crate) fn load() -> SandboxResult<Self> {
        Python::attach(|py| -> SandboxResult<Self> {
            let helpers = PyDict::new(py);
            helpers.set_item("__builtins__", PyModule::import(py, "builtins")?)?;
            helpers.set_item("__name__", RUNTIME_MODULE_NAME)?;
            let helper_code = CString::new(include_str!("runtime_helpers.py"))?;
            py.run(helper_code.as_c_str(), Some(&helpers), None)?;

            let runtime = Self {
                helpers: helpers.unbind(),
            };
            runtime.health_check(py)?;
            Ok(runtime)
        })
    }

    pub(crate) fn health_check(&self, py: Python<'_>) -> SandboxResult<()> {
        let value: i64 = self.call(py, "_sandbox_ping", ())?.extract()?;
        if value == 2 {
            Ok(())
        } else {
            Err(SandboxError::Unhealthy)
        }
    }

    pub(crate) fn call<'py, A>(
        &self,
        py: Python<'py>,
        helper_name: &str,
        args: A,
    ) -> SandboxResult<Bound<'py, PyAny>>
    where
        A: pyo3::call::PyCallArgs<'py>,
    {
        let helper = self
            .helpers
            .bind(py)
            .get_item(helper_name)?
            .ok_or_else(|| SandboxError::InvalidResultShape(format!("missing helper {helper_name}")))?;
        Ok(helper.call1(args)?)
    }
}

pub(crate) fn result_ok(result: &Bound<'_, PyAny>) -> SandboxResult<bool> {
    let dict = cast_dict(result)?;
    Ok(dict
        .get_item("ok")?
        .ok_or_else(|| SandboxError::InvalidResultShape("missing ok in helper result".to_string()))?
        .extract()?)
}

pub(crate) fn dict_exception(result: &Bound<'_, PyAny>) -> SandboxResult<ExceptionInfo> {
    let dict = cast_dict(result)?;
    let exception = dict.get_item("exception")?.ok_or_else(|| {
        SandboxError::InvalidResultShape("missing exception in helper result".to_string())
    })?;
    let exception = cast_dict(&exception)?;
    Ok(ExceptionInfo {
        exc_type: dict_string(exception, "exc_type")?,
        message: dict_string(exception, "message")?,
        traceback: dict_string(exception, "traceback")?,
    })
}

fn dict_string(dict: &Bound<'_, PyDict>, key: &str) -> SandboxResult<String> {
    Ok(dict
        .get_item(key)?
        .ok_or_else(|| SandboxError::InvalidResultShape(format!("missing {key}")))?
        .extract()?)
}

fn cast_dict<'a>(value: &'a Bound<'a, PyAny>) -> SandboxResult<&'a Bound<'a, PyDict>> {
    value
        .cast::<PyDict>()
        .map_err(|err| SandboxError::InvalidResultShape(err.to_string()))
}

#[cfg(test)]
mod tests {
    use pyo3::prelude::*;

    use super::{SandboxRuntime, dict_exception, result_ok};

    #[test]
    fn runtime_loads_and_passes_health_check() {
        let runtime = SandboxRuntime::load().expect("runtime");
        Python::attach(|py| runtime.health_check(py).expect("healthy"));
    }

    #[test]
    fn helper_run_reports_structured_exception() {
        let runtime = SandboxRuntime::load().expect("runtime");
        Python::attach(|py| {
            let globals = pyo3::types::PyDict::new(py);
            let locals = pyo3::types::PyDict::new(py);
            let result = runtime
                .call(py, "_sandbox_run", ("1 / 0", &globals, &locals))
                .expect("helper call");
            assert!(!result_ok(&result).expect("ok flag"));
            let exception = dict_exception(&result).expect("exception");
            assert_eq!(exception.exc_type, "ZeroDivisionError");
            assert!(exception.message.contains("division by zero"));
            assert!(exception.traceback.contains("Traceback"));
        });
    }

    #[test]
    fn missing_helper_is_a_shape_error() {
        let runtime = SandboxRuntime::load().expect("runtime");
        Python::attach(|py| {
            let err = runtime
                .call(py, "_sandbox_does_not_exist", ())
                .expect_err("missing helper");
            assert!(err.to_string().contains("missing helper"));
        });
    }
}
