use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("AI credits exhausted: {0}")]
    CreditsExhausted(String),

    #[error("chat endpoint returned {status}: {message}")]
    Http { status: StatusCode, message: String },

    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("no readable response body: {0}")]
    Body(reqwest::Error),
}

impl ChatError {
    /// Map a non-2xx status and its error message to a [`ChatError`].
    pub fn from_status(status: StatusCode, message: String) -> Self {
        match status {
            StatusCode::TOO_MANY_REQUESTS => ChatError::RateLimited(message),
            StatusCode::PAYMENT_REQUIRED => ChatError::CreditsExhausted(message),
            _ => ChatError::Http { status, message },
        }
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Please upload an image file")]
    NotAnImage,

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Api(String),

    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),
}
