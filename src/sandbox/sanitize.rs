use thiserror::Error;

const FENCE: &str = "```";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SanitizeError {
    #[error("source text is empty after removing code fences")]
    EmptySource,
}

/// Unwraps model-supplied source text.
///
/// Surrounding whitespace is trimmed. When the text opens with a fence line
/// (e.g. "```python") that line is dropped, and a final line consisting only
/// of a fence is dropped too. Everything between is returned untouched; an
/// unterminated fence keeps the rest of the text as the body. No syntax
/// checking happens here.
pub fn sanitize(raw: &str) -> Result<&str, SanitizeError> {
    let text = raw.trim();
    let body = if text.starts_with(FENCE) {
        strip_closing_fence(after_opening_fence(text))
    } else {
        text
    };

    if body.trim().is_empty() {
        return Err(SanitizeError::EmptySource);
    }
    Ok(body)
}

fn after_opening_fence(text: &str) -> &str {
    match text.find('\n') {
        Some(idx) => &text[idx + 1..],
        None => "",
    }
}

fn strip_closing_fence(rest: &str) -> &str {
    match rest.rfind('\n') {
        Some(idx) if rest[idx + 1..].trim() == FENCE => {
            let body = &rest[..idx];
            body.strip_suffix('\r').unwrap_or(body)
        }
        None if rest.trim() == FENCE => "",
        _ => rest,
    }
}
