use std::collections::{BTreeMap, BTreeSet};

use pyo3::prelude::*;
use pyo3::types::{PyAnyMethods, PyDictMethods};
use serde_json::Value;

use super::environment::SandboxEnvironment;
use super::runtime::{SandboxError, SandboxResult, SandboxRuntime};

/// Looks up each expected name in locals, then globals. Names found in
/// neither are left out of the result.
pub(crate) fn extract_bindings(
    py: Python<'_>,
    runtime: &SandboxRuntime,
    env: &SandboxEnvironment,
    expected: &BTreeSet<String>,
) -> SandboxResult<BTreeMap<String, Value>> {
    let locals = env.locals.bind(py);
    let globals = env.globals.bind(py);
    let mut bindings = BTreeMap::new();

    for name in expected {
        let found = match locals.get_item(name)? {
            Some(value) => Some(value),
            None => globals.get_item(name)?,
        };
        let Some(found) = found else {
            continue;
        };

        let encoded: String = runtime.call(py, "_sandbox_export", (found,))?.extract()?;
        let value = serde_json::from_str(&encoded).map_err(|err| {
            SandboxError::InvalidResultShape(format!("binding {name} exported invalid JSON: {err}"))
        })?;
        bindings.insert(name.clone(), value);
    }

    Ok(bindings)
}
