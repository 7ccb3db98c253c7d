use threespeak_core::{ErrorKind, RawHttpError};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway returned {kind:?}: {}", raw.body)]
    Classified { kind: ErrorKind, raw: RawHttpError },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("request timed out")]
    Timeout,
    #[error("no job available")]
    NoJob,
    #[error("failed to sign envelope: {0}")]
    Signing(String),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Classified { kind, .. } => *kind,
            GatewayError::Transport(err) => classify_transport(err),
            GatewayError::Timeout => ErrorKind::TransientNetwork,
            GatewayError::NoJob => ErrorKind::TransientNetwork,
            GatewayError::Signing(_) => ErrorKind::StateConflict,
        }
    }
}

/// `reqwest::Error` never carries an HTTP status for connect/timeout
/// failures, so it needs its own classification separate from
/// `threespeak_core::classify_*` (which only sees HTTP responses).
pub fn classify_transport(err: &reqwest::Error) -> ErrorKind {
    if err.is_timeout() || err.is_connect() {
        return ErrorKind::TransientNetwork;
    }
    if let Some(status) = err.status() {
        if matches!(status.as_u16(), 502 | 503 | 504) {
            return ErrorKind::TransientNetwork;
        }
    }
    ErrorKind::TransientNetwork
}
