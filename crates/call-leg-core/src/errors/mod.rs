//! Error types for call-leg-core
//!
//! Every operation of the engine returns a [`CallLegResult`]. The error
//! variants follow the result taxonomy of the call-leg layer:
//!
//! - **InvalidHandle**: the call-leg, invite or transaction handle is stale or unknown
//! - **IllegalAction**: the operation is not legal in the current state combination
//! - **BadParam**: out-of-range status code, missing header, malformed buffer
//! - **OutOfResources**: a collaborator could not allocate a transaction or object
//! - **TryAgain**: blocked by the reentrancy guard while a callback is running
//! - **Unknown**: a send failure that is not otherwise classified
//!
//! Guard checks always run before mutation, so an `IllegalAction`, `BadParam`
//! or `TryAgain` result leaves the call-leg exactly as it was.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transaction::CollaboratorError;

/// Result type alias for call-leg operations
pub type CallLegResult<T> = Result<T, CallLegError>;

/// Error returned by call-leg operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallLegError {
    /// The handle does not reference a live object
    #[error("Invalid handle: {handle}")]
    InvalidHandle { handle: String },

    /// Operation not permitted in the current state
    #[error("Illegal action: {operation} is not allowed in state {state}")]
    IllegalAction { operation: &'static str, state: String },

    /// Parameter validation failed
    #[error("Bad parameter: {message}")]
    BadParam { message: String },

    /// A collaborator ran out of resources
    #[error("Out of resources: {message}")]
    OutOfResources { message: String },

    /// The operation is blocked while a callback is executing
    #[error("Try again: {operation} is blocked inside the {context} callback")]
    TryAgain { operation: &'static str, context: String },

    /// Unclassified failure, usually a send that did not go out
    #[error("Unknown error: {message}")]
    Unknown { message: String },
}

/// Flat category of a [`CallLegError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidHandle,
    IllegalAction,
    BadParam,
    OutOfResources,
    TryAgain,
    Unknown,
}

impl CallLegError {
    /// Create an invalid handle error
    pub fn invalid_handle(handle: impl std::fmt::Display) -> Self {
        Self::InvalidHandle {
            handle: handle.to_string(),
        }
    }

    /// Create an illegal action error for `operation` attempted in `state`
    pub fn illegal_action(operation: &'static str, state: impl std::fmt::Debug) -> Self {
        Self::IllegalAction {
            operation,
            state: format!("{:?}", state),
        }
    }

    /// Create a bad parameter error
    pub fn bad_param(message: impl Into<String>) -> Self {
        Self::BadParam {
            message: message.into(),
        }
    }

    /// Create an out of resources error
    pub fn out_of_resources(message: impl Into<String>) -> Self {
        Self::OutOfResources {
            message: message.into(),
        }
    }

    /// Create a retry-later error
    pub fn try_again(operation: &'static str, context: impl std::fmt::Debug) -> Self {
        Self::TryAgain {
            operation,
            context: format!("{:?}", context),
        }
    }

    /// Create an unknown error
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown {
            message: message.into(),
        }
    }

    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidHandle { .. } => ErrorKind::InvalidHandle,
            Self::IllegalAction { .. } => ErrorKind::IllegalAction,
            Self::BadParam { .. } => ErrorKind::BadParam,
            Self::OutOfResources { .. } => ErrorKind::OutOfResources,
            Self::TryAgain { .. } => ErrorKind::TryAgain,
            Self::Unknown { .. } => ErrorKind::Unknown,
        }
    }

    /// Whether the caller may retry the same operation later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TryAgain { .. })
    }
}

impl From<CollaboratorError> for CallLegError {
    fn from(err: CollaboratorError) -> Self {
        match err {
            CollaboratorError::OutOfResources(message) => Self::OutOfResources { message },
            CollaboratorError::InvalidHandle(handle) => Self::InvalidHandle { handle },
            CollaboratorError::Failed(message) => Self::Unknown { message },
        }
    }
}

/// Validate a final rejection status (300..700)
pub(crate) fn check_reject_status(status: u16) -> CallLegResult<()> {
    if (300..700).contains(&status) {
        Ok(())
    } else {
        Err(CallLegError::bad_param(format!(
            "rejection status {} is outside 300-699",
            status
        )))
    }
}

/// Validate a provisional status; the reliable variant may not be 100
pub(crate) fn check_provisional_status(status: u16, reliable: bool) -> CallLegResult<()> {
    let lower = if reliable { 101 } else { 100 };
    if (lower..200).contains(&status) {
        Ok(())
    } else {
        Err(CallLegError::bad_param(format!(
            "provisional status {} is outside {}-199",
            status, lower
        )))
    }
}

/// CSeq numbers must stay below 2**31 (RFC 3261 8.1.1.5)
pub(crate) const MAX_CSEQ: u32 = 1 << 31;

pub(crate) fn check_cseq(cseq: u32) -> CallLegResult<()> {
    if cseq < MAX_CSEQ {
        Ok(())
    } else {
        Err(CallLegError::bad_param(format!("CSeq {} is not below 2^31", cseq)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(CallLegError::bad_param("x").kind(), ErrorKind::BadParam);
        assert_eq!(
            CallLegError::illegal_action("connect", "Offering").kind(),
            ErrorKind::IllegalAction
        );
        assert!(CallLegError::try_again("terminate", "Created").is_retryable());
        assert!(!CallLegError::unknown("send").is_retryable());
    }

    #[test]
    fn test_collaborator_conversion() {
        let err: CallLegError = CollaboratorError::OutOfResources("pool".into()).into();
        assert_eq!(err.kind(), ErrorKind::OutOfResources);

        let err: CallLegError = CollaboratorError::Failed("socket".into()).into();
        assert_eq!(err.kind(), ErrorKind::Unknown);
    }

    #[test]
    fn test_status_ranges() {
        assert!(check_reject_status(299).is_err());
        assert!(check_reject_status(300).is_ok());
        assert!(check_reject_status(699).is_ok());
        assert!(check_reject_status(700).is_err());

        assert!(check_provisional_status(100, false).is_ok());
        assert!(check_provisional_status(100, true).is_err());
        assert!(check_provisional_status(183, true).is_ok());
        assert!(check_provisional_status(200, false).is_err());

        assert!(check_cseq(0).is_ok());
        assert!(check_cseq(MAX_CSEQ - 1).is_ok());
        assert!(check_cseq(MAX_CSEQ).is_err());
        assert!(check_cseq(u32::MAX).is_err());
    }

    #[test]
    fn test_display() {
        let err = CallLegError::illegal_action("cancel", crate::callleg::CallLegState::Connected);
        assert_eq!(
            err.to_string(),
            "Illegal action: cancel is not allowed in state Connected"
        );
    }
}
