use super::debug::{
    HttpDebugConfig, redact_header_value, redact_text_body, redact_url, truncate_for_log,
};
use crate::trace::RunTrace;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use std::fmt;
#[cfg(test)]
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Clone)]
pub struct HttpClient {
    inner: Client,
    debug: HttpDebugConfig,
    sink: LogSink,
    trace: Option<RunTrace>,
}

#[derive(Clone)]
enum LogSink {
    Tracing,
    #[cfg(test)]
    Buffer(Arc<Mutex<Vec<String>>>),
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("debug", &self.debug)
            .finish()
    }
}

/// One file sent as a multipart form: the bytes under `file` and the name
/// under `fileName`.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl HttpClient {
    pub fn new(inner: Client, debug: HttpDebugConfig) -> Self {
        Self {
            inner,
            debug,
            sink: LogSink::Tracing,
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: RunTrace) -> Self {
        self.trace = Some(trace);
        self
    }

    pub async fn post_file(
        &self,
        url: &str,
        bearer: Option<&str>,
        upload: FileUpload,
    ) -> Result<HttpResponseData, reqwest::Error> {
        let body_summary = format!(
            "<multipart file={} fileName={} ({} bytes)>",
            upload.file_name,
            upload.file_name,
            upload.bytes.len()
        );

        let part = Part::bytes(upload.bytes).file_name(upload.file_name.clone());
        let form = Form::new()
            .part("file", part)
            .text("fileName", upload.file_name);

        let mut builder = self.inner.post(url).multipart(form);
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }
        let request = builder.build()?;

        self.log_request(&request, &body_summary);
        if let Some(trace) = &self.trace {
            trace.log_http_request(
                request.method().as_str(),
                request.url().as_str(),
                request.headers(),
                &body_summary,
            );
        }

        let response = match self.inner.execute(request).await {
            Ok(response) => response,
            Err(err) => {
                if let Some(trace) = &self.trace {
                    trace.log_http_error(&err.to_string());
                }
                return Err(err);
            }
        };
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.text().await?;

        self.log_response(status, &headers, &body);
        if let Some(trace) = &self.trace {
            trace.log_http_response(status, &headers, &body);
        }

        Ok(HttpResponseData { status, body })
    }

    fn log_request(&self, request: &reqwest::Request, body: &str) {
        if !self.debug.enabled {
            return;
        }

        for line in request_log_lines(self.debug, request, body) {
            self.log_line(line);
        }
    }

    fn log_response(&self, status: u16, headers: &reqwest::header::HeaderMap, body: &str) {
        if !self.debug.enabled {
            return;
        }

        for line in response_log_lines(self.debug, status, headers, body) {
            self.log_line(line);
        }
    }

    fn log_line(&self, line: String) {
        match &self.sink {
            LogSink::Tracing => debug!(target: "agrichart_sandbox::http", "{line}"),
            #[cfg(test)]
            LogSink::Buffer(buffer) => {
                if let Ok(mut b) = buffer.lock() {
                    b.push(line);
                }
            }
        }
    }

    #[cfg(test)]
    pub fn with_buffer_sink(
        inner: Client,
        debug: HttpDebugConfig,
    ) -> (Self, Arc<Mutex<Vec<String>>>) {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let client = Self {
            inner,
            debug,
            sink: LogSink::Buffer(Arc::clone(&buffer)),
            trace: None,
        };
        (client, buffer)
    }
}

fn request_log_lines(debug: HttpDebugConfig, request: &reqwest::Request, body: &str) -> Vec<String> {
    let url = redact_url(request.url(), debug.redact_secrets);
    let body = truncate_for_log(body, debug.max_body_chars);

    let mut lines = Vec::new();
    lines.push(format!("[http-debug] > {} {}", request.method(), url));
    for (name, value) in request.headers() {
        lines.push(format!(
            "[http-debug] > {}: {}",
            name.as_str(),
            redact_header_value(name.as_str(), value, debug.redact_secrets)
        ));
    }
    lines.push("[http-debug] >".to_string());
    append_body_lines(&mut lines, '>', &body);
    lines
}

fn response_log_lines(
    debug: HttpDebugConfig,
    status: u16,
    headers: &reqwest::header::HeaderMap,
    body: &str,
) -> Vec<String> {
    let body = redact_text_body(body, debug.redact_secrets);
    let body = truncate_for_log(&body, debug.max_body_chars);

    let mut lines = Vec::new();
    lines.push(format!("[http-debug] < HTTP {status}"));
    for (name, value) in headers {
        lines.push(format!(
            "[http-debug] < {}: {}",
            name.as_str(),
            redact_header_value(name.as_str(), value, debug.redact_secrets)
        ));
    }
    lines.push("[http-debug] <".to_string());
    append_body_lines(&mut lines, '<', &body);
    lines
}

fn append_body_lines(lines: &mut Vec<String>, direction: char, body: &str) {
    if body.is_empty() {
        lines.push(format!("[http-debug] {direction} <empty body>"));
        return;
    }

    for line in body.lines() {
        lines.push(format!("[http-debug] {direction} {line}"));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponseData {
    pub status: u16,
    pub body: String,
}
