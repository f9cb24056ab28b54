use std::io::ErrorKind;
use std::path::Path;

use serde::Deserialize;

use super::{ArtifactPublisher, PublishError, PublishResult};
use crate::http::client::{FileUpload, HttpClient};

/// Uploads the artifact file as multipart form data and reads the external
/// URL from a `{"url": "..."}` reply.
#[derive(Debug, Clone)]
pub struct HttpPublisher {
    client: HttpClient,
    url: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    url: String,
}

impl HttpPublisher {
    pub fn new(client: HttpClient, url: String, api_key: Option<String>) -> Self {
        Self {
            client,
            url,
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        }
    }

    fn parse_response(body: &str) -> PublishResult<String> {
        let parsed: UploadResponse =
            serde_json::from_str(body).map_err(|err| PublishError::Parse(err.to_string()))?;
        let url = parsed.url.trim();
        if url.is_empty() {
            return Err(PublishError::Parse("response url is empty".to_string()));
        }
        Ok(url.to_string())
    }
}

impl ArtifactPublisher for HttpPublisher {
    async fn publish(&self, local_reference: &str) -> PublishResult<String> {
        let path = Path::new(local_reference);
        let bytes = tokio::fs::read(path).await.map_err(|err| match err.kind() {
            ErrorKind::NotFound => PublishError::MissingFile(local_reference.to_string()),
            _ => PublishError::Io(format!("{local_reference}: {err}")),
        })?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| local_reference.to_string());

        let response = self
            .client
            .post_file(
                &self.url,
                self.api_key.as_deref(),
                FileUpload { file_name, bytes },
            )
            .await
            .map_err(|err| PublishError::Transport(err.to_string()))?;

        if !(200..300).contains(&response.status) {
            let body = response.body.chars().take(400).collect::<String>();
            return Err(PublishError::HttpStatus {
                status: response.status,
                body,
            });
        }

        Self::parse_response(&response.body)
    }
}
