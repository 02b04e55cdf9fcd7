//! Error types for MiniDFS
//!
//! Defines a unified error type for all components, plus the numeric error
//! codes that travel on the wire inside ERROR responses.

use std::fmt;
use std::io;

/// Wire-level error codes carried by ERROR responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The transaction id does not name a known transaction
    InvalidTransactionId,
    /// The operation is not valid for the transaction's current status
    InvalidOperation,
    /// The request frame could not be parsed
    WrongMessageFormat,
    /// Writing or reading a file failed
    FileIoError,
    /// The target file or directory does not exist or is not accessible
    FileNotFound,
}

impl ErrorCode {
    /// Numeric code sent on the wire
    pub fn code(&self) -> u16 {
        match self {
            ErrorCode::InvalidTransactionId => 201,
            ErrorCode::InvalidOperation => 202,
            ErrorCode::WrongMessageFormat => 204,
            ErrorCode::FileIoError => 205,
            ErrorCode::FileNotFound => 206,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            201 => Some(ErrorCode::InvalidTransactionId),
            202 => Some(ErrorCode::InvalidOperation),
            204 => Some(ErrorCode::WrongMessageFormat),
            205 => Some(ErrorCode::FileIoError),
            206 => Some(ErrorCode::FileNotFound),
            _ => None,
        }
    }

    /// Classify a storage-layer failure.
    ///
    /// A missing or inaccessible destination is reported as `FileNotFound`;
    /// everything else is a general I/O failure.
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => ErrorCode::FileNotFound,
            _ => ErrorCode::FileIoError,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Unified error type for MiniDFS operations
#[derive(Debug)]
pub enum DfsError {
    /// I/O error (file operations, network)
    Io(io::Error),
    /// Malformed request frame
    Protocol(String),
    /// Recovery log append or flush failed. Fatal once a file write succeeded.
    RecoveryLog(String),
    /// Log record could not be encoded or decoded
    Codec(String),
    /// Generic internal error
    Internal(String),
}

impl DfsError {
    /// Wire error code for this error
    pub fn error_code(&self) -> ErrorCode {
        match self {
            DfsError::Io(e) => ErrorCode::from_io(e),
            DfsError::Protocol(_) => ErrorCode::WrongMessageFormat,
            DfsError::RecoveryLog(_) | DfsError::Codec(_) | DfsError::Internal(_) => {
                ErrorCode::FileIoError
            }
        }
    }

    /// Whether the process must stop rather than keep serving
    pub fn is_fatal(&self) -> bool {
        matches!(self, DfsError::RecoveryLog(_))
    }
}

impl fmt::Display for DfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfsError::Io(e) => write!(f, "{}", e),
            DfsError::Protocol(msg) => write!(f, "malformed message: {}", msg),
            DfsError::RecoveryLog(msg) => write!(f, "recovery log failure: {}", msg),
            DfsError::Codec(msg) => write!(f, "{}", msg),
            DfsError::Internal(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for DfsError {}

impl From<io::Error> for DfsError {
    fn from(e: io::Error) -> Self {
        DfsError::Io(e)
    }
}

impl From<bincode::Error> for DfsError {
    fn from(e: bincode::Error) -> Self {
        DfsError::Codec(e.to_string())
    }
}

/// Result type alias for MiniDFS operations
pub type Result<T> = std::result::Result<T, DfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_roundtrip() {
        for code in [201, 202, 204, 205, 206] {
            assert_eq!(ErrorCode::from_code(code).unwrap().code(), code);
        }
        assert!(ErrorCode::from_code(203).is_none());
    }

    #[test]
    fn test_from_io_classification() {
        let missing = io::Error::new(io::ErrorKind::NotFound, "no such directory");
        assert_eq!(ErrorCode::from_io(&missing), ErrorCode::FileNotFound);

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(ErrorCode::from_io(&denied), ErrorCode::FileNotFound);

        let full = io::Error::new(io::ErrorKind::Other, "disk full");
        assert_eq!(ErrorCode::from_io(&full), ErrorCode::FileIoError);
    }

    #[test]
    fn test_only_recovery_log_errors_are_fatal() {
        assert!(DfsError::RecoveryLog("fsync failed".into()).is_fatal());
        assert!(!DfsError::Protocol("bad header".into()).is_fatal());
        assert!(!DfsError::Io(io::Error::new(io::ErrorKind::Other, "x")).is_fatal());
    }

    #[test]
    fn test_error_codes_for_internal_failures() {
        let err = DfsError::Protocol("unknown method 'FROB'".into());
        assert_eq!(err.error_code(), ErrorCode::WrongMessageFormat);
        assert_eq!(err.to_string(), "malformed message: unknown method 'FROB'");

        let err = DfsError::RecoveryLog("fsync failed".into());
        assert_eq!(err.error_code(), ErrorCode::FileIoError);
        assert_eq!(err.to_string(), "recovery log failure: fsync failed");
    }
}
