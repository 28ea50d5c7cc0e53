//! RPC status codes and the remote-status model.
//!
//! A [`Status`] is the terminal outcome of every call: a code, a details
//! string, and the trailing metadata delivered alongside it. `OK` implies a
//! valid response; any other code implies no response.

use crate::metadata::Metadata;
use std::fmt;

/// The fixed RPC status code enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    /// Decode a code from its wire representation. Out-of-range values map
    /// to `Unknown`.
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => Code::Ok,
            1 => Code::Cancelled,
            2 => Code::Unknown,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            6 => Code::AlreadyExists,
            7 => Code::PermissionDenied,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            10 => Code::Aborted,
            11 => Code::OutOfRange,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            15 => Code::DataLoss,
            16 => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::OutOfRange => "OUT_OF_RANGE",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::DataLoss => "DATA_LOSS",
            Code::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

/// Terminal outcome of a call: `(code, details)` plus trailing metadata.
#[derive(Debug, Clone)]
pub struct Status {
    code: Code,
    details: String,
    metadata: Metadata,
}

impl Status {
    pub fn new(code: Code, details: impl Into<String>) -> Self {
        Self {
            code,
            details: details.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(Code::Ok, "")
    }

    pub fn cancelled(details: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, details)
    }

    pub fn deadline_exceeded(details: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, details)
    }

    pub fn internal(details: impl Into<String>) -> Self {
        Self::new(Code::Internal, details)
    }

    pub fn unimplemented(details: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, details)
    }

    pub fn resource_exhausted(details: impl Into<String>) -> Self {
        Self::new(Code::ResourceExhausted, details)
    }

    pub fn unauthenticated(details: impl Into<String>) -> Self {
        Self::new(Code::Unauthenticated, details)
    }

    pub fn unavailable(details: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, details)
    }

    /// Attach trailing metadata to this status.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn details(&self) -> &str {
        &self.details
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code.as_str())?;
        if !self.details.is_empty() {
            write!(f, ": {}", self.details)?;
        }
        Ok(())
    }
}

impl std::error::Error for Status {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        for value in 0..=16u32 {
            let code = Code::from_u32(value);
            assert_eq!(code as u32, value);
        }
        assert_eq!(Code::from_u32(99), Code::Unknown);
    }

    #[test]
    fn test_status_display() {
        let status = Status::new(Code::DeadlineExceeded, "deadline elapsed");
        assert_eq!(status.to_string(), "DEADLINE_EXCEEDED: deadline elapsed");
        assert_eq!(Status::ok().to_string(), "OK");
    }

    #[test]
    fn test_status_metadata() {
        let mut trailer = Metadata::new();
        trailer.add("x-detail", "value").unwrap();
        let status = Status::internal("boom").with_metadata(trailer);

        assert!(!status.is_ok());
        assert_eq!(status.metadata().get("x-detail").len(), 1);
    }
}
