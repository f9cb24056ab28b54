mod http;

pub use http::HttpPublisher;

use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use crate::sandbox::{Artifact, ExecutionOutcome};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("artifact file not found: {0}")]
    MissingFile(String),
    #[error("artifact is not a file inside the output directory: {0}")]
    OutsideOutputDir(String),
    #[error("failed to read artifact: {0}")]
    Io(String),
    #[error("upload failed with status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("upload transport error: {0}")]
    Transport(String),
    #[error("upload response parse error: {0}")]
    Parse(String),
}

pub type PublishResult<T> = std::result::Result<T, PublishError>;

/// Sends a local artifact somewhere durable and returns its external
/// reference.
pub trait ArtifactPublisher {
    fn publish(&self, local_reference: &str) -> impl Future<Output = PublishResult<String>> + Send;
}

/// Builds an artifact from the named binding of a successful outcome.
pub fn artifact_from_outcome(outcome: &ExecutionOutcome, binding_name: &str) -> Option<Artifact> {
    Artifact::from_outcome(outcome, binding_name)
}

/// Resolves `local_reference` to a regular file under `output_dir`, both
/// canonicalized, so symlinks and `..` cannot point the upload elsewhere.
pub async fn confine_to_output_dir(local_reference: &str, output_dir: &Path) -> PublishResult<PathBuf> {
    let root = tokio::fs::canonicalize(output_dir)
        .await
        .map_err(|err| PublishError::Io(format!("{}: {err}", output_dir.display())))?;
    let path = tokio::fs::canonicalize(local_reference)
        .await
        .map_err(|err| match err.kind() {
            ErrorKind::NotFound => PublishError::MissingFile(local_reference.to_string()),
            _ => PublishError::Io(format!("{local_reference}: {err}")),
        })?;
    if !path.starts_with(&root) {
        return Err(PublishError::OutsideOutputDir(local_reference.to_string()));
    }

    let metadata = tokio::fs::metadata(&path)
        .await
        .map_err(|err| PublishError::Io(format!("{local_reference}: {err}")))?;
    if !metadata.is_file() {
        return Err(PublishError::OutsideOutputDir(local_reference.to_string()));
    }
    Ok(path)
}

/// One publish attempt for an artifact confined to `output_dir`. A refused
/// path or a failed upload is logged and leaves the artifact with only its
/// local reference.
pub async fn handoff<P>(publisher: &P, artifact: Artifact, output_dir: &Path) -> Artifact
where
    P: ArtifactPublisher + Sync,
{
    let path = match confine_to_output_dir(artifact.local_reference(), output_dir).await {
        Ok(path) => path,
        Err(err) => {
            warn!(
                local = artifact.local_reference(),
                output_dir = %output_dir.display(),
                error = %err,
                "artifact refused; keeping local reference"
            );
            return artifact;
        }
    };
    let Some(path) = path.to_str() else {
        warn!(
            local = artifact.local_reference(),
            "artifact path is not valid UTF-8; keeping local reference"
        );
        return artifact;
    };

    match publisher.publish(path).await {
        Ok(external) => {
            info!(
                local = artifact.local_reference(),
                external = %external,
                "artifact published"
            );
            artifact.published(external)
        }
        Err(err) => {
            warn!(
                local = artifact.local_reference(),
                error = %err,
                "artifact publish failed; keeping local reference"
            );
            artifact
        }
    }
}
