use std::path::PathBuf;
use std::time::Duration;

use chatrelay_provider::BackendError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("failed to upload {}: {source}", path.display())]
    Upload {
        path: PathBuf,
        #[source]
        source: BackendError,
    },
    #[error("failed to download file {file_id}: {source}")]
    Download {
        file_id: String,
        #[source]
        source: BackendError,
    },
    #[error("run did not finish within {elapsed:?}")]
    DeadlineExceeded { elapsed: Duration },
    #[error("scratch file error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunError {
    /// Text shown to the user when a turn ends with this error.
    pub fn user_message(&self) -> String {
        match self {
            Self::Backend(e) if e.is_transient() => e.user_message().to_string(),
            Self::DeadlineExceeded { .. } => {
                "AI backend error - the answer took too long, please try again".to_string()
            }
            _ => GENERIC_APOLOGY.to_string(),
        }
    }
}

pub const GENERIC_APOLOGY: &str = "Sorry, something went wrong while handling your message.";
