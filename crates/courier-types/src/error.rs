use thiserror::Error;

use crate::events::AckError;

/// Failure taxonomy for dispatch and mutation operations.
///
/// Every variant is returned synchronously to the originating caller
/// through its acknowledgement; none of them ever crosses the
/// push/broadcast boundary. Connection-level auth rejection happens
/// before dispatch is reachable and is not represented here.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Malformed or missing input — recoverable by correcting the request
    #[error("{0}")]
    Validation(String),

    /// Target user, group, or message does not exist
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Authenticated, but not authorized for this target
    #[error("{0}")]
    Forbidden(&'static str),

    /// The durable store failed — fatal to the operation, not the process
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl DispatchError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not-found",
            Self::Forbidden(_) => "forbidden",
            Self::Storage(_) => "storage",
        }
    }

    pub fn to_ack(&self) -> AckError {
        AckError {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_variants() {
        assert_eq!(DispatchError::Validation("x".into()).code(), "validation");
        assert_eq!(DispatchError::NotFound("group").code(), "not-found");
        assert_eq!(DispatchError::Forbidden("not a member").code(), "forbidden");
    }

    #[test]
    fn not_found_formats_subject() {
        let err = DispatchError::NotFound("message");
        assert_eq!(err.to_string(), "message not found");
    }
}
