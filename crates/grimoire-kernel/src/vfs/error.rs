//! Kernel error types.
//!
//! Everything inside the kernel returns [`KernelResult`]. At the descriptor
//! boundary each error still maps to a stable negative code via
//! [`ErrorKind::code`], so callers that speak the integer convention can
//! round-trip through [`ErrorKind::from_code`].

use std::io;
use thiserror::Error;

use crate::capability::DriverError;

/// Coarse classification of a [`KernelError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// No node at the path.
    PathNotFound,
    /// Node exists but is the wrong kind for the operation.
    TypeMismatch,
    /// Capability is missing or not in a usable state.
    BackendUnavailable,
    /// A driver call failed.
    IoFailure,
    /// Payload read back is empty or structurally invalid.
    DataIntegrity,
    /// Descriptor is not open.
    BadDescriptor,
    /// Descriptor mode does not allow the operation.
    PermissionDenied,
    /// A capability is already mounted at the device path.
    AlreadyMounted,
    /// Path cannot be normalized or is reserved.
    InvalidPath,
    /// Operation is not supported by the target.
    Unsupported,
}

impl ErrorKind {
    /// Negative result code for this kind. `0` is reserved for success.
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::PathNotFound => -1,
            ErrorKind::TypeMismatch => -2,
            ErrorKind::BackendUnavailable => -3,
            ErrorKind::IoFailure => -4,
            ErrorKind::DataIntegrity => -5,
            ErrorKind::BadDescriptor => -6,
            ErrorKind::PermissionDenied => -7,
            ErrorKind::AlreadyMounted => -8,
            ErrorKind::InvalidPath => -9,
            ErrorKind::Unsupported => -10,
        }
    }

    /// Inverse of [`ErrorKind::code`].
    pub fn from_code(code: i32) -> Option<Self> {
        use strum::IntoEnumIterator;
        ErrorKind::iter().find(|kind| kind.code() == code)
    }
}

/// Kernel error type.
#[derive(Debug, Error)]
pub enum KernelError {
    /// No node at the path.
    #[error("not found: {0}")]
    PathNotFound(String),

    /// Node exists as the wrong kind.
    #[error("type mismatch at {path}: expected {expected}, found {found}")]
    TypeMismatch {
        path: String,
        expected: &'static str,
        found: &'static str,
    },

    /// Capability not mounted or not ready.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Driver call failed.
    #[error("I/O failure: {0}")]
    Io(#[from] DriverError),

    /// Payload failed validation.
    #[error("data integrity error at {path}: {reason}")]
    DataIntegrity { path: String, reason: String },

    /// Descriptor is not open.
    #[error("bad file descriptor: {0}")]
    BadDescriptor(i32),

    /// Descriptor mode forbids the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Device path already has a capability.
    #[error("already mounted: {0}")]
    AlreadyMounted(String),

    /// Invalid or reserved path.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Operation not supported.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Every recovery tier failed and degraded reads are disabled.
    #[error("all recovery tiers exhausted for {0}")]
    Exhausted(String),
}

impl KernelError {
    /// Create a PathNotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::PathNotFound(path.into())
    }

    /// Create a TypeMismatch error.
    pub fn type_mismatch(path: impl Into<String>, expected: &'static str, found: &'static str) -> Self {
        Self::TypeMismatch {
            path: path.into(),
            expected,
            found,
        }
    }

    /// Create a BackendUnavailable error.
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::BackendUnavailable(msg.into())
    }

    /// Create a DataIntegrity error.
    pub fn integrity(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DataIntegrity {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a PermissionDenied error.
    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    /// Create an InvalidPath error.
    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath(path.into())
    }

    /// Create an Unsupported error.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            KernelError::PathNotFound(_) => ErrorKind::PathNotFound,
            KernelError::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            KernelError::BackendUnavailable(_) | KernelError::Exhausted(_) => {
                ErrorKind::BackendUnavailable
            }
            KernelError::Io(DriverError::Unavailable(_)) => ErrorKind::BackendUnavailable,
            KernelError::Io(DriverError::Unsupported(_)) => ErrorKind::Unsupported,
            KernelError::Io(_) => ErrorKind::IoFailure,
            KernelError::DataIntegrity { .. } => ErrorKind::DataIntegrity,
            KernelError::BadDescriptor(_) => ErrorKind::BadDescriptor,
            KernelError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            KernelError::AlreadyMounted(_) => ErrorKind::AlreadyMounted,
            KernelError::InvalidPath(_) => ErrorKind::InvalidPath,
            KernelError::Unsupported(_) => ErrorKind::Unsupported,
        }
    }

    /// Negative result code for the integer calling convention.
    pub fn code(&self) -> i32 {
        self.kind().code()
    }
}

/// Convert KernelError to std::io::Error for compatibility.
impl From<KernelError> for io::Error {
    fn from(e: KernelError) -> Self {
        let kind = match e.kind() {
            ErrorKind::PathNotFound => io::ErrorKind::NotFound,
            ErrorKind::TypeMismatch => io::ErrorKind::InvalidInput,
            ErrorKind::BackendUnavailable => io::ErrorKind::NotConnected,
            ErrorKind::PermissionDenied => io::ErrorKind::PermissionDenied,
            ErrorKind::AlreadyMounted => io::ErrorKind::AlreadyExists,
            ErrorKind::InvalidPath | ErrorKind::BadDescriptor => io::ErrorKind::InvalidInput,
            ErrorKind::DataIntegrity => io::ErrorKind::InvalidData,
            ErrorKind::Unsupported => io::ErrorKind::Unsupported,
            ErrorKind::IoFailure => io::ErrorKind::Other,
        };
        io::Error::new(kind, e.to_string())
    }
}

/// Kernel result type.
pub type KernelResult<T> = Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_codes_are_negative_and_unique() {
        let codes: Vec<i32> = ErrorKind::iter().map(ErrorKind::code).collect();
        assert!(codes.iter().all(|c| *c < 0));

        let mut deduped = codes.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), codes.len());
    }

    #[test]
    fn test_code_roundtrip() {
        for kind in ErrorKind::iter() {
            assert_eq!(ErrorKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(ErrorKind::from_code(0), None);
    }

    #[test]
    fn test_driver_errors_classify() {
        let err = KernelError::from(DriverError::unavailable("db down"));
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);

        let err = KernelError::from(DriverError::query("bad column"));
        assert_eq!(err.kind(), ErrorKind::IoFailure);

        let err = KernelError::Exhausted("/proc/character/1".into());
        assert_eq!(err.code(), ErrorKind::BackendUnavailable.code());
    }
}
