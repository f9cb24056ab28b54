mod environment;
mod executor;
mod extract;
mod modules;
mod output;
mod runtime;
mod sanitize;
mod types;

pub use environment::SANDBOX_MODULE_NAME;
pub use executor::{DEFAULT_MAX_OUTPUT_BYTES, ExecutorConfig, SandboxExecutor};
pub use output::TRUNCATION_MARKER;
pub use runtime::{SandboxError, SandboxResult};
pub use sanitize::{SanitizeError, sanitize};
pub use types::{
    Artifact, Capability, DEFAULT_TIMEOUT, ExceptionInfo, ExecutionOutcome, ExecutionRequest,
    HostFunction, OutcomeStatus,
};
