use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A Rust callable exposed to sandboxed code.
///
/// Arguments and the return value cross the interpreter boundary as JSON.
/// Implementations are shared between concurrent executions.
pub trait HostFunction: Send + Sync {
    fn call(&self, args: Vec<Value>) -> Result<Value, String>;
}

impl<F> HostFunction for F
where
    F: Fn(Vec<Value>) -> Result<Value, String> + Send + Sync,
{
    fn call(&self, args: Vec<Value>) -> Result<Value, String> {
        self(args)
    }
}

/// A pre-approved resource injected into the sandbox globals under its
/// allow-list name.
#[derive(Clone)]
pub enum Capability {
    /// A host Python module, imported on the host side. The dotted name is
    /// also the only spelling accepted by `import` inside the sandbox.
    Module(String),
    /// Plain configuration materialised as a fresh Python object per
    /// execution.
    Value(Value),
    Function(Arc<dyn HostFunction>),
}

impl Capability {
    pub fn module(name: impl Into<String>) -> Self {
        Self::Module(name.into())
    }

    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }

    pub fn function<F: HostFunction + 'static>(function: F) -> Self {
        Self::Function(Arc::new(function))
    }

    pub fn module_name(&self) -> Option<&str> {
        match self {
            Self::Module(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Module(name) => f.debug_tuple("Module").field(name).finish(),
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Function(_) => f.write_str("Function(..)"),
        }
    }
}

/// Everything the executor needs for one run. Built once, then only read.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    id: Uuid,
    source_text: String,
    expected_bindings: BTreeSet<String>,
    timeout: Duration,
    capability_allowlist: BTreeMap<String, Capability>,
}

impl ExecutionRequest {
    pub fn new(source_text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_text: source_text.into(),
            expected_bindings: BTreeSet::new(),
            timeout: DEFAULT_TIMEOUT,
            capability_allowlist: BTreeMap::new(),
        }
    }

    pub fn expect_binding(mut self, name: impl Into<String>) -> Self {
        self.expected_bindings.insert(name.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_capability(mut self, name: impl Into<String>, capability: Capability) -> Self {
        self.capability_allowlist.insert(name.into(), capability);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn source_text(&self) -> &str {
        &self.source_text
    }

    pub fn expected_bindings(&self) -> &BTreeSet<String> {
        &self.expected_bindings
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn capability_allowlist(&self) -> &BTreeMap<String, Capability> {
        &self.capability_allowlist
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Timeout,
    Fault,
    SanitizationRejected,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Success => "success",
            Self::Timeout => "timeout",
            Self::Fault => "fault",
            Self::SanitizationRejected => "sanitization_rejected",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExceptionInfo {
    pub exc_type: String,
    pub message: String,
    pub traceback: String,
}

impl ExceptionInfo {
    pub fn host(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            exc_type: "SandboxHostError".to_string(),
            traceback: format!("SandboxHostError: {message}\n"),
            message,
        }
    }
}

/// Terminal result of one request. Fields are only readable; the executor is
/// the only producer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionOutcome {
    request_id: Uuid,
    status: OutcomeStatus,
    bindings: BTreeMap<String, Value>,
    stdout: String,
    fault_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exception: Option<ExceptionInfo>,
    elapsed_ms: u64,
}

impl ExecutionOutcome {
    pub(crate) fn success(
        request_id: Uuid,
        bindings: BTreeMap<String, Value>,
        stdout: String,
        elapsed: Duration,
    ) -> Self {
        Self {
            request_id,
            status: OutcomeStatus::Success,
            bindings,
            stdout,
            fault_detail: None,
            exception: None,
            elapsed_ms: millis(elapsed),
        }
    }

    pub(crate) fn fault(
        request_id: Uuid,
        exception: ExceptionInfo,
        stdout: String,
        elapsed: Duration,
    ) -> Self {
        let mut detail = format!("{}: {}", exception.exc_type, exception.message);
        if detail.trim().is_empty() || exception.exc_type.is_empty() {
            detail = "execution raised an unnamed error".to_string();
        }
        Self {
            request_id,
            status: OutcomeStatus::Fault,
            bindings: BTreeMap::new(),
            stdout,
            fault_detail: Some(detail),
            exception: Some(exception),
            elapsed_ms: millis(elapsed),
        }
    }

    pub(crate) fn timeout(
        request_id: Uuid,
        limit: Duration,
        stdout: String,
        elapsed: Duration,
    ) -> Self {
        Self {
            request_id,
            status: OutcomeStatus::Timeout,
            bindings: BTreeMap::new(),
            stdout,
            fault_detail: Some(format!(
                "execution exceeded the {} ms time limit",
                millis(limit)
            )),
            exception: None,
            elapsed_ms: millis(elapsed),
        }
    }

    pub(crate) fn rejected(request_id: Uuid, reason: &str) -> Self {
        Self {
            request_id,
            status: OutcomeStatus::SanitizationRejected,
            bindings: BTreeMap::new(),
            stdout: String::new(),
            fault_detail: Some(reason.to_string()),
            exception: None,
            elapsed_ms: 0,
        }
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn status(&self) -> OutcomeStatus {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }

    pub fn bindings(&self) -> &BTreeMap<String, Value> {
        &self.bindings
    }

    pub fn binding(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn fault_detail(&self) -> Option<&str> {
        self.fault_detail.as_deref()
    }

    pub fn exception(&self) -> Option<&ExceptionInfo> {
        self.exception.as_ref()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    local_reference: String,
    external_reference: Option<String>,
}

impl Artifact {
    pub fn new(local_reference: impl Into<String>) -> Self {
        Self {
            local_reference: local_reference.into(),
            external_reference: None,
        }
    }

    /// Reads `binding_name` from a successful outcome. Only a string binding
    /// that is not blank becomes an artifact, and it is kept verbatim.
    pub fn from_outcome(outcome: &ExecutionOutcome, binding_name: &str) -> Option<Self> {
        if !outcome.is_success() {
            return None;
        }
        outcome
            .binding(binding_name)
            .and_then(Value::as_str)
            .filter(|path| !path.trim().is_empty())
            .map(Self::new)
    }

    pub fn local_reference(&self) -> &str {
        &self.local_reference
    }

    pub fn external_reference(&self) -> Option<&str> {
        self.external_reference.as_deref()
    }

    pub(crate) fn published(mut self, external_reference: String) -> Self {
        self.external_reference = Some(external_reference);
        self
    }
}
