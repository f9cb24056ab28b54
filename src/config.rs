use anyhow::{Result, anyhow, bail};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sandbox::{DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_TIMEOUT};

pub const DEFAULT_OUTPUT_DIR: &str = "./generated_charts";
pub const DEFAULT_ARTIFACT_BINDING: &str = "chart_path";

const CONFIG_DIR_NAME: &str = "agrichart-sandbox";
const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub config_path: PathBuf,
    pub timeout: Duration,
    pub max_output_bytes: usize,
    pub output_dir: PathBuf,
    pub allowed_modules: Vec<String>,
    pub expected_bindings: Vec<String>,
    pub artifact_binding: String,
    pub publish: Option<PublishConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishConfig {
    pub url: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFileConfig {
    timeout_ms: Option<u64>,
    max_output_bytes: Option<usize>,
    output_dir: Option<String>,
    allowed_modules: Option<Vec<String>>,
    expected_bindings: Option<Vec<String>>,
    artifact_binding: Option<String>,
    publish: Option<RawPublishConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPublishConfig {
    url: Option<String>,
    api_key: Option<String>,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        Self::load_with_path(None)
    }

    /// Resolves the config file (explicit path, else the XDG location), then
    /// layers `.env` and process environment on top of it.
    pub fn load_with_path(explicit: Option<&Path>) -> Result<Self> {
        let config_path = match explicit {
            Some(path) => {
                if !path.is_file() {
                    bail!(
                        "Failed to load config {}: file does not exist",
                        path.display()
                    );
                }
                path.to_path_buf()
            }
            None => discover_config_path()?,
        };
        let file_config = load_file_config(&config_path)?.unwrap_or_default();

        dotenvy::dotenv().ok();

        let timeout_ms = match env_non_empty("SANDBOX_TIMEOUT_MS") {
            Some(raw) => parse_env_number("SANDBOX_TIMEOUT_MS", &raw)?,
            None => file_config
                .timeout_ms
                .unwrap_or(DEFAULT_TIMEOUT.as_millis() as u64),
        };
        if timeout_ms == 0 {
            return Err(config_error(&config_path, "timeout_ms", "must be greater than 0"));
        }

        let max_output_bytes = match env_non_empty("SANDBOX_MAX_OUTPUT_BYTES") {
            Some(raw) => parse_env_number("SANDBOX_MAX_OUTPUT_BYTES", &raw)?,
            None => file_config
                .max_output_bytes
                .unwrap_or(DEFAULT_MAX_OUTPUT_BYTES),
        };

        let output_dir = env_non_empty("SANDBOX_OUTPUT_DIR")
            .or_else(|| file_config.output_dir.as_deref().and_then(non_empty).map(ToOwned::to_owned))
            .unwrap_or_else(|| DEFAULT_OUTPUT_DIR.to_string());

        let allowed_modules = validate_names(
            file_config.allowed_modules.unwrap_or_default(),
            &config_path,
            "allowed_modules",
            is_module_path,
        )?;
        let expected_bindings = validate_names(
            file_config
                .expected_bindings
                .unwrap_or_else(|| vec![DEFAULT_ARTIFACT_BINDING.to_string()]),
            &config_path,
            "expected_bindings",
            is_identifier,
        )?;

        let artifact_binding = file_config
            .artifact_binding
            .as_deref()
            .and_then(non_empty)
            .unwrap_or(DEFAULT_ARTIFACT_BINDING)
            .to_string();
        if !is_identifier(&artifact_binding) {
            return Err(config_error(
                &config_path,
                "artifact_binding",
                &format!("'{artifact_binding}' is not a valid identifier"),
            ));
        }

        let raw_publish = file_config.publish.unwrap_or_default();
        let publish_url = env_non_empty("SANDBOX_PUBLISH_URL")
            .or_else(|| raw_publish.url.as_deref().and_then(non_empty).map(ToOwned::to_owned));
        let publish_key = env_non_empty("SANDBOX_PUBLISH_API_KEY").or_else(|| {
            raw_publish
                .api_key
                .as_deref()
                .and_then(non_empty)
                .map(ToOwned::to_owned)
        });
        let publish = match publish_url {
            Some(url) => {
                reqwest::Url::parse(&url).map_err(|err| {
                    config_error(&config_path, "publish.url", &format!("invalid url: {err}"))
                })?;
                Some(PublishConfig {
                    url,
                    api_key: publish_key,
                })
            }
            None => None,
        };

        Ok(Self {
            config_path,
            timeout: Duration::from_millis(timeout_ms),
            max_output_bytes,
            output_dir: PathBuf::from(output_dir),
            allowed_modules,
            expected_bindings,
            artifact_binding,
            publish,
        })
    }
}

fn discover_config_path() -> Result<PathBuf> {
    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let trimmed = xdg.trim();
        if trimmed.is_empty() {
            bail!("Failed to resolve config path: XDG_CONFIG_HOME is set but empty");
        }

        return Ok(PathBuf::from(trimmed)
            .join(CONFIG_DIR_NAME)
            .join(CONFIG_FILE_NAME));
    }

    let home = dirs::home_dir().ok_or_else(|| {
        anyhow!("Failed to resolve config path: HOME directory is unavailable")
    })?;

    Ok(home
        .join(".config")
        .join(CONFIG_DIR_NAME)
        .join(CONFIG_FILE_NAME))
}

fn load_file_config(config_path: &Path) -> Result<Option<RawFileConfig>> {
    if !config_path.is_file() {
        return Ok(None);
    }

    let config_text = fs::read_to_string(config_path).map_err(|err| {
        anyhow!(
            "Failed to load config {}: unable to read file: {err}",
            config_path.display()
        )
    })?;

    toml::from_str(&config_text).map(Some).map_err(|err| {
        anyhow!(
            "Failed to load config {}: {err}",
            config_path.display()
        )
    })
}

fn validate_names(
    values: Vec<String>,
    config_path: &Path,
    key: &str,
    is_valid: fn(&str) -> bool,
) -> Result<Vec<String>> {
    let mut names = Vec::with_capacity(values.len());
    for value in values {
        let trimmed = value.trim();
        if !is_valid(trimmed) {
            return Err(config_error(
                config_path,
                key,
                &format!("'{value}' is not a valid name"),
            ));
        }
        if !names.iter().any(|name| name == trimmed) {
            names.push(trimmed.to_string());
        }
    }
    Ok(names)
}

pub(crate) fn is_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    chars
        .next()
        .is_some_and(|ch| ch == '_' || ch.is_ascii_alphabetic())
        && chars.all(|ch| ch == '_' || ch.is_ascii_alphanumeric())
}

fn is_module_path(value: &str) -> bool {
    value.split('.').all(is_identifier)
}

fn parse_env_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| anyhow!("Failed to load config: {key}: expected a non-negative integer, got '{raw}'"))
}

fn env_non_empty(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn config_error(config_path: &Path, key_path: &str, reason: &str) -> anyhow::Error {
    anyhow!(
        "Failed to load config {}: {key_path}: {reason}",
        config_path.display()
    )
}

#[cfg(test)]
mod tests {
    use super::{AppConfig, DEFAULT_ARTIFACT_BINDING, DEFAULT_OUTPUT_DIR, PublishConfig};
    use crate::sandbox::{DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_TIMEOUT};
    use serial_test::serial;
    use std::env;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    fn reset_vars() {
        unsafe {
            env::remove_var("SANDBOX_TIMEOUT_MS");
            env::remove_var("SANDBOX_MAX_OUTPUT_BYTES");
            env::remove_var("SANDBOX_OUTPUT_DIR");
            env::remove_var("SANDBOX_PUBLISH_URL");
            env::remove_var("SANDBOX_PUBLISH_API_KEY");
            env::remove_var("XDG_CONFIG_HOME");
        }
    }

    fn with_cwd<T>(path: &Path, f: impl FnOnce() -> T) -> T {
        let cwd = env::current_dir().expect("current dir");
        env::set_current_dir(path).expect("set current dir");
        let result = f();
        env::set_current_dir(cwd).expect("restore current dir");
        result
    }

    fn write_config(root: &Path, body: &str) -> PathBuf {
        let config_dir = root.join("agrichart-sandbox");
        fs::create_dir_all(&config_dir).expect("create config dir");
        let path = config_dir.join("config.toml");
        fs::write(&path, body).expect("write config");
        path
    }

    #[test]
    #[serial]
    fn load_uses_defaults_when_nothing_is_configured() {
        let tmp = tempfile::tempdir().expect("tempdir");
        reset_vars();
        unsafe {
            env::set_var("XDG_CONFIG_HOME", tmp.path());
        }

        let cfg = with_cwd(tmp.path(), || AppConfig::load().expect("load config"));
        assert_eq!(cfg.timeout, DEFAULT_TIMEOUT);
        assert_eq!(cfg.max_output_bytes, DEFAULT_MAX_OUTPUT_BYTES);
        assert_eq!(cfg.output_dir, PathBuf::from(DEFAULT_OUTPUT_DIR));
        assert!(cfg.allowed_modules.is_empty());
        assert_eq!(cfg.expected_bindings, vec![DEFAULT_ARTIFACT_BINDING]);
        assert_eq!(cfg.artifact_binding, DEFAULT_ARTIFACT_BINDING);
        assert_eq!(cfg.publish, None);
        assert_eq!(
            cfg.config_path,
            tmp.path().join("agrichart-sandbox").join("config.toml")
        );
    }

    #[test]
    #[serial]
    fn load_reads_file_values() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_config(
            tmp.path(),
            r#"
timeout_ms = 5000
max_output_bytes = 1024
output_dir = "/srv/charts"
allowed_modules = ["math", "matplotlib.pyplot", "math"]
expected_bindings = ["chart_path", "summary"]

[publish]
url = "https://uploads.example.com/v1/files"
api_key = "file-key"
"#,
        );

        reset_vars();
        unsafe {
            env::set_var("XDG_CONFIG_HOME", tmp.path());
        }

        let cfg = with_cwd(tmp.path(), || AppConfig::load().expect("load config"));
        assert_eq!(cfg.timeout, Duration::from_millis(5000));
        assert_eq!(cfg.max_output_bytes, 1024);
        assert_eq!(cfg.output_dir, PathBuf::from("/srv/charts"));
        assert_eq!(cfg.allowed_modules, vec!["math", "matplotlib.pyplot"]);
        assert_eq!(cfg.expected_bindings, vec!["chart_path", "summary"]);
        assert_eq!(
            cfg.publish,
            Some(PublishConfig {
                url: "https://uploads.example.com/v1/files".to_string(),
                api_key: Some("file-key".to_string()),
            })
        );
    }

    #[test]
    #[serial]
    fn load_env_overrides_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_config(
            tmp.path(),
            r#"
timeout_ms = 5000
output_dir = "/srv/charts"

[publish]
url = "https://uploads.example.com/v1/files"
api_key = "file-key"
"#,
        );

        reset_vars();
        unsafe {
            env::set_var("XDG_CONFIG_HOME", tmp.path());
            env::set_var("SANDBOX_TIMEOUT_MS", "750");
            env::set_var("SANDBOX_OUTPUT_DIR", "/tmp/override");
            env::set_var("SANDBOX_PUBLISH_API_KEY", "os-key");
        }

        let cfg = with_cwd(tmp.path(), || AppConfig::load().expect("load config"));
        reset_vars();
        assert_eq!(cfg.timeout, Duration::from_millis(750));
        assert_eq!(cfg.output_dir, PathBuf::from("/tmp/override"));
        let publish = cfg.publish.expect("publish configured");
        assert_eq!(publish.url, "https://uploads.example.com/v1/files");
        assert_eq!(publish.api_key.as_deref(), Some("os-key"));
    }

    #[test]
    #[serial]
    fn load_with_explicit_path_ignores_xdg_location() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_config(tmp.path(), "timeout_ms = 9000");
        let explicit = tmp.path().join("custom.toml");
        fs::write(&explicit, "timeout_ms = 1234").expect("write explicit config");

        reset_vars();
        unsafe {
            env::set_var("XDG_CONFIG_HOME", tmp.path());
        }

        let cfg = with_cwd(tmp.path(), || {
            AppConfig::load_with_path(Some(&explicit)).expect("load config")
        });
        assert_eq!(cfg.timeout, Duration::from_millis(1234));
        assert_eq!(cfg.config_path, explicit);
    }

    #[test]
    #[serial]
    fn load_fails_when_explicit_path_is_missing() {
        reset_vars();
        let err = AppConfig::load_with_path(Some(Path::new("/no/such/config.toml")))
            .expect_err("load should fail");
        assert!(
            err.to_string()
                .contains("Failed to load config /no/such/config.toml: file does not exist")
        );
    }

    #[test]
    #[serial]
    fn load_fails_when_xdg_config_home_is_empty() {
        reset_vars();
        unsafe {
            env::set_var("XDG_CONFIG_HOME", "   ");
        }

        let err = AppConfig::load().expect_err("load should fail");
        reset_vars();
        assert!(
            err.to_string()
                .contains("Failed to resolve config path: XDG_CONFIG_HOME is set but empty")
        );
    }

    #[test]
    #[serial]
    fn load_fails_on_unknown_root_key() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_config(tmp.path(), "unknown_key = 1");

        reset_vars();
        unsafe {
            env::set_var("XDG_CONFIG_HOME", tmp.path());
        }

        let err = with_cwd(tmp.path(), || AppConfig::load().expect_err("load should fail"));
        assert!(err.to_string().contains("Failed to load config"));
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    #[serial]
    fn load_fails_on_invalid_module_name() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_config(tmp.path(), r#"allowed_modules = ["os; rm"]"#);

        reset_vars();
        unsafe {
            env::set_var("XDG_CONFIG_HOME", tmp.path());
        }

        let err = with_cwd(tmp.path(), || AppConfig::load().expect_err("load should fail"));
        assert!(
            err.to_string()
                .contains("allowed_modules: 'os; rm' is not a valid name")
        );
    }

    #[test]
    #[serial]
    fn load_fails_on_zero_timeout() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_config(tmp.path(), "timeout_ms = 0");

        reset_vars();
        unsafe {
            env::set_var("XDG_CONFIG_HOME", tmp.path());
        }

        let err = with_cwd(tmp.path(), || AppConfig::load().expect_err("load should fail"));
        assert!(err.to_string().contains("timeout_ms: must be greater than 0"));
    }

    #[test]
    #[serial]
    fn load_fails_on_invalid_publish_url() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_config(tmp.path(), "[publish]\nurl = \"not a url\"");

        reset_vars();
        unsafe {
            env::set_var("XDG_CONFIG_HOME", tmp.path());
        }

        let err = with_cwd(tmp.path(), || AppConfig::load().expect_err("load should fail"));
        assert!(err.to_string().contains("publish.url: invalid url"));
    }

    #[test]
    #[serial]
    fn load_fails_on_non_numeric_env_timeout() {
        let tmp = tempfile::tempdir().expect("tempdir");
        reset_vars();
        unsafe {
            env::set_var("XDG_CONFIG_HOME", tmp.path());
            env::set_var("SANDBOX_TIMEOUT_MS", "soon");
        }

        let err = with_cwd(tmp.path(), || AppConfig::load().expect_err("load should fail"));
        reset_vars();
        assert!(err.to_string().contains("SANDBOX_TIMEOUT_MS"));
    }
}
