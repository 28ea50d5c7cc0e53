//! Error types for the weft RPC layer.

use crate::status::Status;

/// weft error type.
///
/// Local errors (`InvalidArgument`, `Call`) are returned synchronously at the
/// call site. `Rpc` carries a non-OK status observed from the peer (or
/// synthesized locally for deadlines and cancellation) together with the
/// trailing metadata attached to it.
#[derive(Debug, thiserror::Error)]
pub enum WeftError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("call error: {0}")]
    Call(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Rpc(#[from] Status),
}

impl WeftError {
    /// Create an invalid-argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a call error (the transport rejected a batch).
    pub fn call(msg: impl Into<String>) -> Self {
        Self::Call(msg.into())
    }

    /// The remote status carried by this error, if any.
    pub fn status(&self) -> Option<&Status> {
        match self {
            Self::Rpc(status) => Some(status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;

    #[test]
    fn test_status_accessor() {
        let err = WeftError::from(Status::new(Code::Cancelled, "cancelled"));
        assert_eq!(err.status().unwrap().code(), Code::Cancelled);

        let err = WeftError::invalid_argument("bad");
        assert!(err.status().is_none());
    }
}
