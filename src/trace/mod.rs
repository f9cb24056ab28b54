use anyhow::{Result, anyhow, bail};
use reqwest::header::HeaderMap;
use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use time::OffsetDateTime;
use tracing::warn;

use crate::http::debug::redact_header_value;
use crate::sandbox::{ExecutionOutcome, ExecutionRequest};

const TRACE_DIR_NAME: &str = "agrichart-sandbox/traces";

/// Record of one CLI run: the submitted source, what the sandbox produced and
/// any upload exchange. Bodies are kept whole; credential headers are masked.
/// Files are owner-only.
#[derive(Clone)]
pub struct RunTrace {
    inner: Arc<TraceInner>,
}

struct TraceInner {
    writer: Mutex<BufWriter<File>>,
    file_path: PathBuf,
    write_failed: AtomicBool,
}

impl RunTrace {
    pub fn create(run_id: &str) -> Result<Self> {
        let trace_dir = resolve_trace_dir_from_env()?;
        Self::create_in_dir(run_id, &trace_dir)
    }

    fn create_in_dir(run_id: &str, trace_dir: &Path) -> Result<Self> {
        fs::create_dir_all(trace_dir).map_err(|err| {
            anyhow!(
                "Failed to create trace directory {}: {err}",
                trace_dir.display()
            )
        })?;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |duration| duration.as_secs());
        let file_name = format!("run-{run_id}-{timestamp}.log");
        let file_path = trace_dir.join(&file_name);
        let file = create_trace_file(&file_path)
            .map_err(|err| anyhow!("Failed to create trace file {}: {err}", file_path.display()))?;

        Ok(Self {
            inner: Arc::new(TraceInner {
                writer: Mutex::new(BufWriter::new(file)),
                file_path,
                write_failed: AtomicBool::new(false),
            }),
        })
    }

    #[cfg(any(test, feature = "test-support"))]
    pub fn create_in_temp_dir(run_id: &str, trace_dir: &Path) -> Result<Self> {
        Self::create_in_dir(run_id, trace_dir)
    }

    pub fn file_path(&self) -> &Path {
        &self.inner.file_path
    }

    pub fn log_request(&self, request: &ExecutionRequest) {
        self.log_single("request", &format!("id {}", request.id()));
        self.log_single(
            "request",
            &format!("timeout {} ms", request.timeout().as_millis()),
        );
        for name in request.capability_allowlist().keys() {
            self.log_single("capability", name);
        }
        self.log_lines("source", request.source_text());
    }

    pub fn log_outcome(&self, outcome: &ExecutionOutcome) {
        self.log_single(
            "outcome",
            &format!("{} in {} ms", outcome.status(), outcome.elapsed_ms()),
        );
        for (name, value) in outcome.bindings() {
            self.log_single("binding", &format!("{name} = {value}"));
        }
        self.log_lines("stdout", outcome.stdout());
        if let Some(exception) = outcome.exception() {
            self.log_lines("traceback", &exception.traceback);
        } else if let Some(detail) = outcome.fault_detail() {
            self.log_single("fault", detail);
        }
    }

    pub fn log_publish(&self, local_reference: &str, result: &str) {
        self.log_single("publish", &format!("{local_reference} -> {result}"));
    }

    pub fn log_http_request(&self, method: &str, url: &str, headers: &HeaderMap, body: &str) {
        self.log_single("http.out", &format!("{method} {url}"));
        self.log_headers("http.out", headers);
        self.log_lines("http.out", body);
    }

    pub fn log_http_response(&self, status: u16, headers: &HeaderMap, body: &str) {
        self.log_single("http.in", &format!("HTTP {status}"));
        self.log_headers("http.in", headers);
        self.log_lines("http.in", body);
    }

    pub fn log_http_error(&self, message: &str) {
        self.log_single("http.err", message);
    }

    fn log_headers(&self, kind: &str, headers: &HeaderMap) {
        for (name, value) in headers {
            let shown = redact_header_value(name.as_str(), value, true);
            self.log_single(kind, &format!("{}: {shown}", name.as_str()));
        }
    }

    fn log_lines(&self, kind: &str, text: &str) {
        if text.is_empty() {
            self.log_single(kind, "<empty>");
            return;
        }

        for line in text.lines() {
            self.log_single(kind, line);
        }
    }

    fn log_single(&self, kind: &str, text: &str) {
        let timestamp = current_timestamp();
        self.write_raw(&format!("[{timestamp}] [{:<11}] {text}\n", kind));
    }

    fn write_raw(&self, text: &str) {
        let Ok(mut writer) = self.inner.writer.lock() else {
            self.report_write_failure("failed to acquire trace writer lock");
            return;
        };

        if writer.write_all(text.as_bytes()).is_err() || writer.flush().is_err() {
            self.report_write_failure("failed to write to trace file");
        }
    }

    fn report_write_failure(&self, message: &str) {
        if !self.inner.write_failed.swap(true, Ordering::Relaxed) {
            warn!(path = %self.inner.file_path.display(), "trace disabled: {message}");
        }
    }
}

#[cfg(unix)]
fn create_trace_file(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn create_trace_file(path: &Path) -> std::io::Result<File> {
    File::create(path)
}

fn current_timestamp() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}Z",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
        now.millisecond()
    )
}

pub fn resolve_trace_dir_from_env() -> Result<PathBuf> {
    let xdg_state = env::var("XDG_STATE_HOME").ok();
    let home = dirs::home_dir();
    resolve_trace_dir(xdg_state.as_deref(), home.as_deref())
}

fn resolve_trace_dir(xdg_state_home: Option<&str>, home_dir: Option<&Path>) -> Result<PathBuf> {
    if let Some(xdg) = xdg_state_home {
        let trimmed = xdg.trim();
        if trimmed.is_empty() {
            bail!("Failed to resolve trace path: XDG_STATE_HOME is set but empty");
        }
        return Ok(PathBuf::from(trimmed).join(TRACE_DIR_NAME));
    }

    let home = home_dir
        .ok_or_else(|| anyhow!("Failed to resolve trace path: HOME directory is unavailable"))?;
    Ok(home.join(".local/state").join(TRACE_DIR_NAME))
}
