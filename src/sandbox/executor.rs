use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Instant;

use pyo3::prelude::*;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::environment::EnvironmentBuilder;
use super::extract::extract_bindings;
use super::output::CapturedOutput;
use super::runtime::{SandboxResult, SandboxRuntime, dict_exception, result_ok};
use super::sanitize::sanitize;
use super::types::{Capability, ExceptionInfo, ExecutionOutcome, ExecutionRequest};

pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorConfig {
    pub max_output_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

/// Runs sanitized source on a dedicated worker thread, one namespace pair
/// per request.
///
/// `execute` waits for the worker until the request deadline and never
/// touches the interpreter itself, so a run that holds the GIL cannot delay
/// the caller past its timeout. On deadline the worker is abandoned and a
/// watchdog thread asks the interpreter to raise `SandboxTimeout` inside it.
/// Cloning is cheap and clones may be used from any number of threads.
#[derive(Clone)]
pub struct SandboxExecutor {
    runtime: Arc<SandboxRuntime>,
    config: ExecutorConfig,
}

enum WorkerReport {
    Completed {
        bindings: BTreeMap<String, Value>,
    },
    Faulted {
        exception: ExceptionInfo,
    },
    Cancelled,
}

/// Coordination between a worker and the watchdog. The interpreter thread id
/// is only written or cleared with the GIL released, and the watchdog holds
/// the slot while delivering the interrupt, so it can never target a thread
/// that has already left its run.
#[derive(Default)]
struct WorkerState {
    thread_id: Mutex<Option<u64>>,
    cancelled: AtomicBool,
}

impl WorkerState {
    fn set_thread_id(&self, thread_id: Option<u64>) {
        *self.thread_id.lock().unwrap_or_else(PoisonError::into_inner) = thread_id;
    }
}

struct WorkerJob {
    runtime: Arc<SandboxRuntime>,
    state: Arc<WorkerState>,
    output: Arc<CapturedOutput>,
    source: String,
    capabilities: BTreeMap<String, Capability>,
    expected: BTreeSet<String>,
}

impl SandboxExecutor {
    pub fn new(config: ExecutorConfig) -> SandboxResult<Self> {
        let runtime = SandboxRuntime::load()?;
        Ok(Self {
            runtime: Arc::new(runtime),
            config,
        })
    }

    pub fn config(&self) -> ExecutorConfig {
        self.config
    }

    pub fn health_check(&self) -> SandboxResult<()> {
        Python::attach(|py| self.runtime.health_check(py))
    }

    pub fn execute(&self, request: &ExecutionRequest) -> ExecutionOutcome {
        let request_id = request.id();
        let source = match sanitize(request.source_text()) {
            Ok(source) => source.to_string(),
            Err(err) => {
                info!(%request_id, reason = %err, "sandbox request rejected");
                return ExecutionOutcome::rejected(request_id, &err.to_string());
            }
        };

        let started = Instant::now();
        let timeout = request.timeout();
        debug!(%request_id, timeout_ms = timeout.as_millis() as u64, "sandbox execution started");

        let state = Arc::new(WorkerState::default());
        let output = Arc::new(CapturedOutput::new(self.config.max_output_bytes));
        let job = WorkerJob {
            runtime: Arc::clone(&self.runtime),
            state: Arc::clone(&state),
            output: Arc::clone(&output),
            source,
            capabilities: request.capability_allowlist().clone(),
            expected: request.expected_bindings().clone(),
        };

        let (tx, rx) = mpsc::sync_channel(1);
        let spawned = thread::Builder::new()
            .name(format!("sandbox-{request_id}"))
            .spawn(move || {
                let report = job.run();
                // The caller is gone once it has declared a timeout.
                let _ = tx.send(report);
            });
        if let Err(err) = spawned {
            warn!(%request_id, error = %err, "failed to spawn sandbox worker");
            return ExecutionOutcome::fault(
                request_id,
                ExceptionInfo::host(format!("failed to spawn sandbox worker: {err}")),
                String::new(),
                started.elapsed(),
            );
        }

        let outcome = match rx.recv_timeout(timeout) {
            Ok(WorkerReport::Completed { bindings }) => {
                ExecutionOutcome::success(request_id, bindings, output.snapshot(), started.elapsed())
            }
            Ok(WorkerReport::Faulted { exception }) => {
                ExecutionOutcome::fault(request_id, exception, output.snapshot(), started.elapsed())
            }
            Ok(WorkerReport::Cancelled) | Err(RecvTimeoutError::Timeout) => {
                state.cancelled.store(true, Ordering::SeqCst);
                spawn_watchdog(Arc::clone(&self.runtime), state, request_id);
                ExecutionOutcome::timeout(request_id, timeout, output.snapshot(), started.elapsed())
            }
            Err(RecvTimeoutError::Disconnected) => ExecutionOutcome::fault(
                request_id,
                ExceptionInfo::host("sandbox worker exited without reporting"),
                output.snapshot(),
                started.elapsed(),
            ),
        };

        info!(
            %request_id,
            status = %outcome.status(),
            elapsed_ms = outcome.elapsed_ms(),
            bindings = outcome.bindings().len(),
            "sandbox execution finished"
        );
        outcome
    }
}

impl WorkerJob {
    fn run(self) -> WorkerReport {
        Python::attach(|py| {
            let thread_id = match self
                .runtime
                .call(py, "_sandbox_thread_id", ())
                .and_then(|id| Ok(id.extract::<u64>()?))
            {
                Ok(thread_id) => thread_id,
                Err(err) => {
                    return WorkerReport::Faulted {
                        exception: ExceptionInfo::host(err.to_string()),
                    };
                }
            };
            py.detach(|| self.state.set_thread_id(Some(thread_id)));
            if self.state.cancelled.load(Ordering::SeqCst) {
                py.detach(|| self.state.set_thread_id(None));
                return WorkerReport::Cancelled;
            }

            let report = match self.execute_in(py) {
                Ok(report) => report,
                Err(err) => WorkerReport::Faulted {
                    exception: ExceptionInfo::host(err.to_string()),
                },
            };
            py.detach(|| self.state.set_thread_id(None));
            report
        })
    }

    fn execute_in(&self, py: Python<'_>) -> SandboxResult<WorkerReport> {
        let env = EnvironmentBuilder::new(&self.runtime).build(
            py,
            &self.capabilities,
            Arc::clone(&self.output),
        )?;
        let result = self.runtime.call(
            py,
            "_sandbox_run",
            (self.source.as_str(), env.globals.bind(py), env.locals.bind(py)),
        )?;

        if !result_ok(&result)? {
            return Ok(WorkerReport::Faulted {
                exception: dict_exception(&result)?,
            });
        }

        let bindings = extract_bindings(py, &self.runtime, &env, &self.expected)?;
        Ok(WorkerReport::Completed { bindings })
    }
}

fn spawn_watchdog(runtime: Arc<SandboxRuntime>, state: Arc<WorkerState>, request_id: Uuid) {
    let spawned = thread::Builder::new()
        .name(format!("sandbox-watchdog-{request_id}"))
        .spawn(move || {
            Python::attach(|py| {
                let slot = state.thread_id.lock().unwrap_or_else(PoisonError::into_inner);
                let Some(thread_id) = *slot else {
                    return;
                };
                let delivered = runtime
                    .call(py, "_sandbox_interrupt", (thread_id,))
                    .and_then(|delivered| Ok(delivered.extract::<bool>()?));
                match delivered {
                    Ok(true) => debug!(%request_id, "timeout delivered to sandbox worker"),
                    Ok(false) => warn!(%request_id, "sandbox worker could not be interrupted"),
                    Err(err) => warn!(%request_id, error = %err, "sandbox interrupt failed"),
                }
            });
        });
    if let Err(err) = spawned {
        warn!(%request_id, error = %err, "failed to spawn sandbox watchdog");
    }
}
