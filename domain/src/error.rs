use thiserror::Error;

/// Errors raised by sessions and the job supervision layer.
///
/// Validation variants are produced before the DRM is contacted. Anything the
/// DRM adapter reports is kept as is in [`DrmaaError::Adapter`].
#[derive(Debug, Error)]
pub enum DrmaaError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("No active session: {0}")]
    NoActiveSession(String),

    #[error("Already active session: {0}")]
    AlreadyActiveSession(String),

    #[error("DRM system initialization failed: {0}")]
    DrmsInit(String),

    #[error("Timeout expired before job completion")]
    ExitTimeout,

    #[error("Unsupported attribute: {0}")]
    UnsupportedAttribute(String),

    #[error(transparent)]
    Adapter(#[from] anyhow::Error),
}

impl DrmaaError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn unknown_job(job_id: &str, session: &str) -> Self {
        Self::InvalidArgument(format!(
            "No jobs with id {job_id} were found in session {session}"
        ))
    }
}

pub type DrmaaResult<T> = Result<T, DrmaaError>;
