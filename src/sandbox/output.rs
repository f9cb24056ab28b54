use std::sync::{Arc, Mutex, PoisonError};

use pyo3::prelude::*;

pub const TRUNCATION_MARKER: &str = "\n[output truncated]\n";

/// Output captured from one execution, capped at `limit` bytes.
///
/// Readable from any thread without touching the interpreter, so a timed-out
/// caller can collect what was printed even while the worker still runs.
#[derive(Debug)]
pub(crate) struct CapturedOutput {
    limit: usize,
    state: Mutex<OutputState>,
}

#[derive(Debug, Default)]
struct OutputState {
    text: String,
    truncated: bool,
}

impl CapturedOutput {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            limit,
            state: Mutex::new(OutputState::default()),
        }
    }

    pub(crate) fn write(&self, text: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.truncated {
            return;
        }

        let remaining = self.limit.saturating_sub(state.text.len());
        if text.len() <= remaining {
            state.text.push_str(text);
            return;
        }

        let mut cut = remaining;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        state.text.push_str(&text[..cut]);
        state.text.push_str(TRUNCATION_MARKER);
        state.truncated = true;
    }

    pub(crate) fn snapshot(&self) -> String {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .text
            .clone()
    }
}

/// File-like object handed to the sandboxed `print`.
#[pyclass(frozen, name = "SandboxOutput")]
pub(crate) struct OutputSink {
    inner: Arc<CapturedOutput>,
}

impl OutputSink {
    pub(crate) fn new(inner: Arc<CapturedOutput>) -> Self {
        Self { inner }
    }
}

#[pymethods]
impl OutputSink {
    fn write(&self, text: &str) -> usize {
        self.inner.write(text);
        text.chars().count()
    }

    fn flush(&self) {}

    fn getvalue(&self) -> String {
        self.inner.snapshot()
    }
}
