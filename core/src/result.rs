//! Command and transfer outcome

use crate::Error;

/// Outcome of a command or transfer
///
/// Returned by value instead of `Err` so a failing command never aborts the
/// caller's operation.
#[derive(Debug)]
pub enum SshResult {
    /// Completed; carries captured stdout when there was any
    Success(Option<String>),
    /// Failed; carries the cause (stderr text, timeout, transport error...)
    Failure(Error),
}

impl SshResult {
    /// Bare success with no output
    pub fn ok() -> Self {
        Self::Success(None)
    }

    /// Success carrying captured output
    pub fn with_output(output: impl Into<String>) -> Self {
        Self::Success(Some(output.into()))
    }

    pub fn failure(cause: Error) -> Self {
        Self::Failure(cause)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }

    /// Captured output, only on success
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::Success(output) => output.as_deref(),
            Self::Failure(_) => None,
        }
    }

    /// Failure cause, only on failure
    pub fn cause(&self) -> Option<&Error> {
        match self {
            Self::Success(_) => None,
            Self::Failure(cause) => Some(cause),
        }
    }

    /// Output on success, the cause's message on failure
    pub fn message(&self) -> Option<String> {
        match self {
            Self::Success(output) => output.clone(),
            Self::Failure(cause) => Some(cause.to_string()),
        }
    }

    /// Convert into a `Result`, mapping failure to `Err`
    pub fn into_result(self) -> crate::Result<Option<String>> {
        match self {
            Self::Success(output) => Ok(output),
            Self::Failure(cause) => Err(cause),
        }
    }
}

impl From<Error> for SshResult {
    fn from(cause: Error) -> Self {
        Self::Failure(cause)
    }
}
