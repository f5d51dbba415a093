use thiserror::Error;

use crate::capture::StreamKind;

pub type ProctorResult<T> = Result<T, ProctorError>;

#[derive(Debug, Error)]
pub enum ProctorError {
    #[error("{0} recording was not permitted")]
    PermissionDenied(StreamKind),

    #[error("screen and camera recording is not supported here: {0}")]
    PlatformUnsupported(String),

    #[error("capture failure on {kind} stream: {reason}")]
    Capture { kind: StreamKind, reason: String },

    #[error("could not load test {test_id}: {reason}")]
    TestUnavailable { test_id: String, reason: String },

    #[error("test cannot be attempted: {0}")]
    CannotAttempt(String),

    #[error("submission failed, do not leave this page: {0}")]
    SubmissionFailed(String),

    #[error("recording upload failed: {0}")]
    UploadFailed(String),

    #[error("session is not ready for {0}")]
    InvalidPhase(&'static str),

    #[error("http failure: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json failure: {0}")]
    Json(#[from] serde_json::Error),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal failure: {0}")]
    Journal(#[from] rusqlite::Error),
}

impl ProctorError {
    /// Stable machine-readable code for every variant.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::PermissionDenied(_) => "PT-PERMISSION-DENIED",
            Self::PlatformUnsupported(_) => "PT-PLATFORM-UNSUPPORTED",
            Self::Capture { .. } => "PT-CAPTURE",
            Self::TestUnavailable { .. } => "PT-TEST-UNAVAILABLE",
            Self::CannotAttempt(_) => "PT-CANNOT-ATTEMPT",
            Self::SubmissionFailed(_) => "PT-SUBMISSION-FAILED",
            Self::UploadFailed(_) => "PT-UPLOAD-FAILED",
            Self::InvalidPhase(_) => "PT-INVALID-PHASE",
            Self::Http(_) => "PT-HTTP",
            Self::Json(_) => "PT-JSON",
            Self::Io(_) => "PT-IO",
            Self::Journal(_) => "PT-JOURNAL",
        }
    }

    /// Errors that end the attempt before any typing is allowed.
    #[must_use]
    pub const fn blocks_typing(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied(_)
                | Self::PlatformUnsupported(_)
                | Self::Capture { .. }
                | Self::CannotAttempt(_)
        )
    }
}
