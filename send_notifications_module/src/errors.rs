#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("missing configuration: {0}")]
    MissingConfig(&'static str),
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider {provider} returned {status}: {body}")]
    Provider {
        provider: &'static str,
        status: u16,
        body: String,
    },
}
