//! Error kinds shared by every component of the service.
//!
//! Mirrors the wire-facing error taxonomy in the protocol: each variant
//! maps to exactly one `Result` code and is reported back to the host
//! as an `ErrorRecord` (see [`crate::protocol::ErrorRecord`]).

use thiserror::Error;

/// Crate-wide result alias.
pub type GcsResult<T> = Result<T, GcsError>;

#[derive(Debug, Error)]
pub enum GcsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("runtime failure: {0}")]
    RuntimeFailure(String),

    #[error("i/o failure: {0}")]
    IoFailure(String),

    #[error("frame malformed: {0}")]
    FrameMalformed(String),

    #[error("frame truncated: {0}")]
    FrameTruncated(String),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl GcsError {
    /// The signed 32-bit `Result` code carried on the wire.
    ///
    /// Values are stable and loosely track the HRESULT-style codes the
    /// original host protocol expects (negative on failure); exact bit
    /// patterns are not otherwise significant to the core.
    pub fn code(&self) -> i32 {
        match self {
            GcsError::NotFound(_) => -2,
            GcsError::AlreadyExists(_) => -3,
            GcsError::Invalid(_) => -4,
            GcsError::Unsupported(_) => -5,
            GcsError::Busy(_) => -6,
            GcsError::RuntimeFailure(_) => -7,
            GcsError::IoFailure(_) => -8,
            GcsError::FrameMalformed(_) => -9,
            GcsError::FrameTruncated(_) => -10,
            GcsError::FrameTooLarge(_) => -11,
            GcsError::Fatal(_) => -12,
        }
    }

    /// True for frame-level errors, which are terminal for the connection.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GcsError::FrameMalformed(_) | GcsError::FrameTruncated(_) | GcsError::FrameTooLarge(_)
        )
    }
}

impl From<std::io::Error> for GcsError {
    fn from(e: std::io::Error) -> Self {
        GcsError::IoFailure(e.to_string())
    }
}

impl From<serde_json::Error> for GcsError {
    fn from(e: serde_json::Error) -> Self {
        GcsError::Invalid(format!("json: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_errors_are_frame_level_only() {
        assert!(GcsError::FrameMalformed("x".into()).is_terminal());
        assert!(GcsError::FrameTruncated("x".into()).is_terminal());
        assert!(GcsError::FrameTooLarge(1).is_terminal());
        assert!(!GcsError::NotFound("x".into()).is_terminal());
        assert!(!GcsError::Busy("x".into()).is_terminal());
    }

    #[test]
    fn codes_are_distinct() {
        let errs = [
            GcsError::NotFound("".into()),
            GcsError::AlreadyExists("".into()),
            GcsError::Invalid("".into()),
            GcsError::Unsupported("".into()),
            GcsError::Busy("".into()),
            GcsError::RuntimeFailure("".into()),
            GcsError::IoFailure("".into()),
            GcsError::FrameMalformed("".into()),
            GcsError::FrameTruncated("".into()),
            GcsError::FrameTooLarge(0),
            GcsError::Fatal("".into()),
        ];
        let mut codes: Vec<i32> = errs.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errs.len());
    }
}
