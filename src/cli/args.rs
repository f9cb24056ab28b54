use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser, Clone, PartialEq, Eq)]
#[command(name = "agrichart_sandbox")]
#[command(
    about = "Run model-generated chart code in a restricted Python sandbox",
    long_about = "Run model-generated chart code in a restricted Python sandbox\n\nSource is read from FILE, or from stdin when FILE is omitted. Markdown code\nfences are stripped before execution.\n\nConfig file loading:\n  - --config <path> (explicit file, overrides default path discovery)\n  - Default search path when --config is not provided:\n    1. $XDG_CONFIG_HOME/agrichart-sandbox/config.toml\n    2. ~/.config/agrichart-sandbox/config.toml"
)]
pub struct CliArgs {
    /// Load config from this file path instead of the default discovery path.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Wall-clock limit for the run, overriding the configured timeout.
    #[arg(long, value_name = "MS", value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout_ms: Option<u64>,

    /// Variable to read back after the run. Repeatable; replaces the configured list.
    #[arg(long = "bind", value_name = "NAME")]
    pub bindings: Vec<String>,

    /// Module the code may import. Repeatable; added to the configured allow-list.
    #[arg(long = "module", value_name = "NAME")]
    pub modules: Vec<String>,

    /// Print the outcome as JSON.
    #[arg(long)]
    pub json: bool,

    /// Log HTTP exchanges (secrets redacted) and debug events to stderr.
    #[arg(long)]
    pub verbose: bool,

    /// Start the interpreter, report, and exit.
    #[arg(long)]
    pub smoke_python: bool,

    /// Source file to execute.
    #[arg(value_name = "FILE")]
    pub file: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::CliArgs;
    use clap::Parser;
    use std::path::Path;

    #[test]
    fn parse_defaults() {
        let args = CliArgs::try_parse_from(["agrichart_sandbox"]).expect("should parse");
        assert_eq!(args.config, None);
        assert_eq!(args.timeout_ms, None);
        assert!(args.bindings.is_empty());
        assert!(args.modules.is_empty());
        assert!(!args.json);
        assert_eq!(args.file, None);
    }

    #[test]
    fn parse_config_flag() {
        let args = CliArgs::try_parse_from(["agrichart_sandbox", "--config", "/tmp/custom.toml"])
            .expect("parse");
        assert_eq!(args.config.as_deref(), Some(Path::new("/tmp/custom.toml")));
    }

    #[test]
    fn parse_repeated_bindings_and_modules() {
        let args = CliArgs::try_parse_from([
            "agrichart_sandbox",
            "--bind",
            "chart_path",
            "--bind",
            "summary",
            "--module",
            "math",
            "--timeout-ms",
            "1500",
            "--json",
            "chart.py",
        ])
        .expect("parse");
        assert_eq!(args.bindings, vec!["chart_path", "summary"]);
        assert_eq!(args.modules, vec!["math"]);
        assert_eq!(args.timeout_ms, Some(1500));
        assert!(args.json);
        assert_eq!(args.file.as_deref(), Some(Path::new("chart.py")));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        assert!(CliArgs::try_parse_from(["agrichart_sandbox", "--timeout-ms", "0"]).is_err());
    }
}
