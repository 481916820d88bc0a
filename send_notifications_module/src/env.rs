use crate::SendError;

pub(crate) fn required(key: &'static str) -> Result<String, SendError> {
    optional(key).ok_or(SendError::MissingConfig(key))
}

pub(crate) fn optional(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn api_base(key: &str, default_value: &str) -> String {
    optional(key)
        .unwrap_or_else(|| default_value.to_string())
        .trim_end_matches('/')
        .to_string()
}

pub(crate) fn non_empty(value: &str, what: &str) -> Result<String, SendError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(SendError::InvalidRecipient(format!("{} missing", what)));
    }
    Ok(trimmed.to_string())
}
