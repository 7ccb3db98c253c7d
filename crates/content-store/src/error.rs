#[derive(Debug, thiserror::Error)]
pub enum ContentStoreError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse upload response: {0}")]
    UploadParseError(String),
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("content store daemon unreachable: {0}")]
    DaemonUnavailable(String),
    #[error("invalid uri: {0}")]
    InvalidUri(String),
}
