use thiserror::Error;

/// A classified failure on the realtime stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SseError {
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("heartbeat timeout")]
    TimeoutError,
    #[error("server error {code}: {message}")]
    ServerError {
        code: u16,
        message: String,
        retryable: bool,
    },
    #[error("unknown error: {0}")]
    UnknownError(String),
}

impl SseError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SseError::NetworkError(_) | SseError::TimeoutError | SseError::UnknownError(_) => true,
            SseError::ServerError { retryable, .. } => *retryable,
        }
    }
}

/// Low-level cause of a failed request, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFault {
    /// Connect, read, write or timeout failure on the socket.
    Io(String),
    /// Anything else, e.g. a malformed request or a redirect loop.
    Other(String),
}

impl TransportFault {
    pub fn from_reqwest(e: &reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() || e.is_body() || e.is_request() {
            TransportFault::Io(e.to_string())
        } else {
            TransportFault::Other(e.to_string())
        }
    }

    fn describe(&self) -> &str {
        match self {
            TransportFault::Io(message) | TransportFault::Other(message) => message,
        }
    }
}

/// Maps a failure and optional HTTP status onto an [`SseError`].
///
/// Socket-level faults win over any status. A status of 408, 429 or 5xx is
/// retryable, other 4xx are not, and anything else is treated as retryable.
pub fn classify_sse_error(fault: Option<&TransportFault>, status: Option<u16>) -> SseError {
    if let Some(TransportFault::Io(message)) = fault {
        return SseError::NetworkError(message.clone());
    }

    let Some(code) = status else {
        let message = fault
            .map(|f| f.describe().to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        return SseError::UnknownError(message);
    };

    let retryable = match code {
        408 | 429 => true,
        400..=499 => false,
        _ => true,
    };
    let message = fault
        .map(|f| f.describe().to_string())
        .unwrap_or_else(|| format!("HTTP {code}"));

    SseError::ServerError {
        code,
        message,
        retryable,
    }
}
