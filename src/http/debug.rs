use reqwest::Url;
use reqwest::header::HeaderValue;
use serde_json::Value;

pub const REDACTED: &str = "***REDACTED***";

/// Headers that carry upload credentials or session state.
const CREDENTIAL_HEADERS: [&str; 5] = [
    "authorization",
    "proxy-authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
];

/// Query parameters and response fields an upload endpoint may use for
/// credentials or signed links, matched case-insensitively. Names ending in
/// `_key`, `_token` or `_secret` are covered too.
const CREDENTIAL_FIELDS: [&str; 5] = ["key", "token", "signature", "password", "credential"];

/// Controls the `--verbose` dump of the upload exchange. Secrets are masked
/// unless redaction is explicitly turned off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpDebugConfig {
    pub enabled: bool,
    pub redact_secrets: bool,
    pub max_body_chars: usize,
}

impl HttpDebugConfig {
    pub fn from_verbose(verbose: bool) -> Self {
        Self {
            enabled: verbose,
            redact_secrets: true,
            max_body_chars: 4_000,
        }
    }

    #[cfg(test)]
    pub fn disabled() -> Self {
        Self::from_verbose(false)
    }
}

/// Masks credential query parameters. A URL without any is returned as is.
pub fn redact_url(url: &Url, redact: bool) -> String {
    if !redact || !url.query_pairs().any(|(name, _)| is_credential_field(&name)) {
        return url.as_str().to_string();
    }

    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(name, value)| {
            let shown = if is_credential_field(&name) {
                REDACTED.to_string()
            } else {
                value.into_owned()
            };
            (name.into_owned(), shown)
        })
        .collect();

    let mut redacted = url.clone();
    redacted.query_pairs_mut().clear().extend_pairs(pairs);
    redacted.to_string()
}

/// Credential headers keep their auth scheme: `Bearer abc` is shown as
/// `Bearer ***REDACTED***`.
pub fn redact_header_value(name: &str, value: &HeaderValue, redact: bool) -> String {
    let Ok(text) = value.to_str() else {
        return "<non-utf8>".to_string();
    };
    if !redact || !is_credential_header(name) {
        return text.to_string();
    }

    match text.split_once(' ') {
        Some((scheme, _)) if name.eq_ignore_ascii_case("authorization")
            || name.eq_ignore_ascii_case("proxy-authorization") =>
        {
            format!("{scheme} {REDACTED}")
        }
        _ => REDACTED.to_string(),
    }
}

/// Masks credential fields anywhere in a JSON response body. Other bodies
/// are returned unchanged.
pub fn redact_text_body(raw: &str, redact: bool) -> String {
    if !redact {
        return raw.to_string();
    }
    let Ok(mut json) = serde_json::from_str::<Value>(raw) else {
        return raw.to_string();
    };
    if !mask_credential_fields(&mut json) {
        return raw.to_string();
    }
    serde_json::to_string(&json).unwrap_or_else(|_| raw.to_string())
}

pub fn truncate_for_log(input: &str, max_chars: usize) -> String {
    match input.char_indices().nth(max_chars) {
        None => input.to_string(),
        Some((cut, _)) => {
            let dropped = input[cut..].chars().count();
            format!("{}... <truncated {dropped} chars>", &input[..cut])
        }
    }
}

/// Returns whether anything was masked.
fn mask_credential_fields(value: &mut Value) -> bool {
    match value {
        Value::Object(map) => {
            let mut masked = false;
            for (key, item) in map.iter_mut() {
                if is_credential_field(key) {
                    *item = Value::String(REDACTED.to_string());
                    masked = true;
                } else {
                    masked |= mask_credential_fields(item);
                }
            }
            masked
        }
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |masked, item| mask_credential_fields(item) || masked),
        _ => false,
    }
}

fn is_credential_header(name: &str) -> bool {
    CREDENTIAL_HEADERS
        .iter()
        .any(|header| header.eq_ignore_ascii_case(name))
}

fn is_credential_field(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    CREDENTIAL_FIELDS.contains(&name.as_str())
        || ["_key", "_token", "_secret"]
            .iter()
            .any(|suffix| name.ends_with(suffix))
}

#[cfg(test)]
mod tests {
    use super::{
        HttpDebugConfig, REDACTED, is_credential_field, redact_header_value, redact_text_body,
        redact_url, truncate_for_log,
    };
    use reqwest::Url;
    use reqwest::header::HeaderValue;

    #[test]
    fn from_verbose_defaults_to_redaction() {
        let cfg = HttpDebugConfig::from_verbose(true);
        assert!(cfg.enabled);
        assert!(cfg.redact_secrets);
        assert_eq!(cfg.max_body_chars, 4_000);
        assert!(!HttpDebugConfig::disabled().enabled);
    }

    #[test]
    fn upload_credentials_are_recognised() {
        for name in ["key", "api_key", "Upload_Token", "client_secret", "signature"] {
            assert!(is_credential_field(name), "{name}");
        }
        for name in ["url", "fileName", "keyboard", "tokens"] {
            assert!(!is_credential_field(name), "{name}");
        }
    }

    #[test]
    fn redact_url_masks_credential_query_params() {
        let url = Url::parse("https://uploads.example.com/v1?api_key=super-secret&folder=charts")
            .expect("url");
        let redacted = redact_url(&url, true);
        assert!(redacted.contains("folder=charts"));
        assert!(redacted.contains("api_key=%2A%2A%2AREDACTED%2A%2A%2A"));
        assert!(!redacted.contains("super-secret"));
    }

    #[test]
    fn redact_url_leaves_plain_urls_byte_identical() {
        let url = Url::parse("https://uploads.example.com/v1/files?folder=a%20b").expect("url");
        assert_eq!(redact_url(&url, true), url.as_str());
    }

    #[test]
    fn bearer_header_keeps_scheme_only() {
        let value = HeaderValue::from_static("Bearer upload-secret");
        assert_eq!(
            redact_header_value("Authorization", &value, true),
            format!("Bearer {REDACTED}")
        );
        assert_eq!(
            redact_header_value("set-cookie", &HeaderValue::from_static("sid=abc; Path=/"), true),
            REDACTED
        );
        assert_eq!(
            redact_header_value("content-type", &HeaderValue::from_static("image/png"), true),
            "image/png"
        );
        assert_eq!(
            redact_header_value("authorization", &value, false),
            "Bearer upload-secret"
        );
    }

    #[test]
    fn redact_text_body_masks_nested_credentials() {
        let raw = r#"{"url":"https://cdn.example.com/a.png","auth":{"upload_token":"t0k"},"links":[{"signature":"s1g"}]}"#;
        let redacted = redact_text_body(raw, true);
        assert!(redacted.contains("\"url\":\"https://cdn.example.com/a.png\""));
        assert!(!redacted.contains("t0k"));
        assert!(!redacted.contains("s1g"));
        assert_eq!(redacted.matches(REDACTED).count(), 2);
    }

    #[test]
    fn bodies_without_credentials_are_unchanged() {
        let text = "upload failed: quota exceeded";
        assert_eq!(redact_text_body(text, true), text);
        let json = r#"{ "url": "https://cdn.example.com/a.png" }"#;
        assert_eq!(redact_text_body(json, true), json);
        let secret = r#"{"api_key":"abc"}"#;
        assert_eq!(redact_text_body(secret, false), secret);
    }

    #[test]
    fn truncate_for_log_counts_characters() {
        assert_eq!(truncate_for_log("short", 5), "short");
        assert_eq!(
            truncate_for_log("éééééééé", 3),
            "ééé... <truncated 5 chars>"
        );
    }
}
