use serde::Serialize;

use crate::sandbox::{Artifact, ExecutionOutcome};

#[derive(Serialize)]
struct RunReport<'a> {
    outcome: &'a ExecutionOutcome,
    artifact: Option<&'a Artifact>,
}

pub fn render_json(outcome: &ExecutionOutcome, artifact: Option<&Artifact>) -> String {
    let report = RunReport { outcome, artifact };
    serde_json::to_string_pretty(&report)
        .unwrap_or_else(|err| format!("{{\"_serialization_error\":\"{err}\"}}"))
}

pub fn render_text(outcome: &ExecutionOutcome, artifact: Option<&Artifact>) -> String {
    let mut lines = vec![format!(
        "status: {} ({} ms)",
        outcome.status(),
        outcome.elapsed_ms()
    )];

    if let Some(detail) = outcome.fault_detail() {
        lines.push(format!("error: {detail}"));
    }
    for (name, value) in outcome.bindings() {
        lines.push(format!("{name} = {value}"));
    }
    if let Some(artifact) = artifact {
        match artifact.external_reference() {
            Some(external) => lines.push(format!(
                "artifact: {} -> {external}",
                artifact.local_reference()
            )),
            None => lines.push(format!("artifact: {}", artifact.local_reference())),
        }
    }
    if !outcome.stdout().is_empty() {
        lines.push("--- stdout ---".to_string());
        lines.extend(outcome.stdout().lines().map(str::to_string));
    }
    if let Some(exception) = outcome.exception() {
        lines.push("--- traceback ---".to_string());
        lines.extend(exception.traceback.lines().map(str::to_string));
    }

    lines.join("\n")
}
