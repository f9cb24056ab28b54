pub mod cli;
pub mod config;
pub mod http;
pub mod publish;
pub mod sandbox;
pub mod trace;

use anyhow::{Context, Result, anyhow};
use cli::{CliArgs, render_json, render_text};
use config::AppConfig;
use http::client::HttpClient;
use http::debug::HttpDebugConfig;
use publish::{HttpPublisher, artifact_from_outcome, handoff};
use sandbox::{
    Artifact, Capability, ExecutionOutcome, ExecutionRequest, ExecutorConfig, SandboxExecutor,
};
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{info, warn};
use trace::RunTrace;

/// Matplotlib backend handed to chart code; rendering never needs a display.
pub const CHART_BACKEND: &str = "Agg";

pub async fn run(args: CliArgs) -> Result<ExitCode> {
    if args.smoke_python {
        return smoke_python();
    }

    let config = AppConfig::load_with_path(args.config.as_deref())?;
    let source = read_source(args.file.as_ref())?;

    fs::create_dir_all(&config.output_dir).with_context(|| {
        format!(
            "Failed to create output directory {}",
            config.output_dir.display()
        )
    })?;

    let request = build_request(&args, &config, source);
    let trace = match RunTrace::create(&request.id().simple().to_string()) {
        Ok(trace) => Some(trace),
        Err(err) => {
            warn!(error = %err, "run trace disabled");
            None
        }
    };
    if let Some(trace) = &trace {
        trace.log_request(&request);
    }

    let executor = SandboxExecutor::new(ExecutorConfig {
        max_output_bytes: config.max_output_bytes,
    })?;
    let outcome = tokio::task::spawn_blocking(move || executor.execute(&request))
        .await
        .map_err(|err| anyhow!("sandbox task failed: {err}"))?;
    if let Some(trace) = &trace {
        trace.log_outcome(&outcome);
    }

    let artifact = publish_artifact(&args, &config, &outcome, trace.as_ref()).await;

    let rendered = if args.json {
        render_json(&outcome, artifact.as_ref())
    } else {
        render_text(&outcome, artifact.as_ref())
    };
    println!("{rendered}");

    Ok(if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn smoke_python() -> Result<ExitCode> {
    let executor = SandboxExecutor::new(ExecutorConfig::default())?;
    executor.health_check()?;
    println!("smoke-python: ok");
    Ok(ExitCode::SUCCESS)
}

fn read_source(file: Option<&PathBuf>) -> Result<String> {
    match file {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("Failed to read source file {}", path.display())),
        None => {
            let mut source = String::new();
            io::stdin()
                .read_to_string(&mut source)
                .context("Failed to read source from stdin")?;
            Ok(source)
        }
    }
}

/// Expected bindings come from `--bind` when given, else from config; the
/// artifact binding is always read back. Modules from config and `--module`
/// are merged.
fn build_request(args: &CliArgs, config: &AppConfig, source: String) -> ExecutionRequest {
    let timeout = args
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(config.timeout);
    let bindings = if args.bindings.is_empty() {
        &config.expected_bindings
    } else {
        &args.bindings
    };

    let mut request = ExecutionRequest::new(source)
        .with_timeout(timeout)
        .expect_binding(config.artifact_binding.as_str())
        .with_capability(
            "output_dir",
            Capability::value(config.output_dir.to_string_lossy().into_owned()),
        )
        .with_capability("backend", Capability::value(CHART_BACKEND));
    for name in bindings {
        request = request.expect_binding(name.as_str());
    }
    for module in config.allowed_modules.iter().chain(&args.modules) {
        request = request.with_capability(module_global_name(module), Capability::module(module.as_str()));
    }
    request
}

/// Global name under which an allow-listed module is pre-bound:
/// `matplotlib.pyplot` becomes `matplotlib_pyplot`.
fn module_global_name(module: &str) -> String {
    module.replace('.', "_")
}

async fn publish_artifact(
    args: &CliArgs,
    config: &AppConfig,
    outcome: &ExecutionOutcome,
    trace: Option<&RunTrace>,
) -> Option<Artifact> {
    let artifact = artifact_from_outcome(outcome, &config.artifact_binding)?;
    let Some(publish) = &config.publish else {
        info!(local = artifact.local_reference(), "no publisher configured");
        return Some(artifact);
    };

    let mut client = HttpClient::new(reqwest::Client::new(), HttpDebugConfig::from_verbose(args.verbose));
    if let Some(trace) = trace {
        client = client.with_trace(trace.clone());
    }
    let publisher = HttpPublisher::new(client, publish.url.clone(), publish.api_key.clone());
    let artifact = handoff(&publisher, artifact, &config.output_dir).await;

    if let Some(trace) = trace {
        trace.log_publish(
            artifact.local_reference(),
            artifact.external_reference().unwrap_or("<not published>"),
        );
    }
    Some(artifact)
}
