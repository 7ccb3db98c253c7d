#[derive(Debug, thiserror::Error)]
pub enum TranscoderError {
    #[error("probe failed: {0}")]
    ProbeFailed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoder exhausted the codec cascade for profile {0}")]
    CascadeExhausted(String),
    #[error("content store error: {0}")]
    ContentStore(#[from] threespeak_content_store::ContentStoreError),
    #[error("upload failed after successful encode, aborting: {0}")]
    UploadFailed(String),
    #[error("input media fatal: {0}")]
    InputMediaFatal(String),
}
