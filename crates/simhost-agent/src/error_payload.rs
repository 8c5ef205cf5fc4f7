pub const PREFIX: &str = "SIMHOST_ERROR_JSON:";

const MAX_MESSAGE_BYTES: usize = 32 * 1024;
const MAX_HINT_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub outcome: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

pub fn encode(
    code: &str,
    outcome: crate::error::Outcome,
    message: impl Into<String>,
    hint: Option<String>,
) -> String {
    let payload = ErrorPayload {
        code: code.to_string(),
        outcome: match outcome {
            crate::error::Outcome::Success => "success",
            crate::error::Outcome::Retryable => "retryable",
            crate::error::Outcome::Fatal => "fatal",
        },
        message: truncate_utf8(&message.into(), MAX_MESSAGE_BYTES),
        hint: hint.map(|h| truncate_utf8(&h, MAX_HINT_BYTES)),
    };

    let json = serde_json::to_string(&payload)
        .unwrap_or_else(|_| "{\"code\":\"internal\",\"message\":\"serialize_failed\"}".to_string());

    format!("{PREFIX}{json}")
}

pub fn for_error<E: crate::error::Classify + std::fmt::Display>(err: &E) -> String {
    encode(err.code(), err.outcome(), err.to_string(), err.hint())
}
