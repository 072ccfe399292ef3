//! Status taxonomy shared by every buffer-channel operation.
//!
//! The numeric codes returned by [`Status::code`] follow the platform's
//! generic status values so callers that bridge into native code can pass
//! them through untouched.

use thiserror::Error;

/// Failure returned by a channel, buffer set, pool or crypto operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Status {
    #[error("out of memory")]
    NoMemory,

    #[error("invalid operation")]
    InvalidOperation,

    #[error("bad value")]
    BadValue,

    #[error("not enough data")]
    NotEnoughData,

    #[error("name not found")]
    NameNotFound,

    /// The channel is stopped, or the backend does not implement the request.
    #[error("operation not supported in the current state")]
    NotSupported,

    /// Unknown or foreign buffer.
    #[error("buffer not found")]
    NotFound,

    /// Transient: no free slot to register into right now.
    #[error("operation would block")]
    WouldBlock,

    #[error("unknown error")]
    Unknown,

    /// Raw negative result from a crypto, descrambler or component backend.
    #[error("backend error {0}")]
    Backend(i32),
}

impl Status {
    /// Numeric platform status code. `OK` (0) is represented by `Ok(())`.
    pub fn code(&self) -> i32 {
        match self {
            Status::NoMemory => -12,
            Status::InvalidOperation => -38,
            Status::BadValue => -22,
            Status::NotEnoughData => -61,
            Status::NameNotFound => -2,
            Status::NotSupported => -38,
            Status::NotFound => -2,
            Status::WouldBlock => -11,
            Status::Unknown => i32::MIN,
            Status::Backend(code) => *code,
        }
    }

    /// Inverse of [`Status::code`]. Codes shared by two variants map to the
    /// more general one; unknown codes are kept as [`Status::Backend`].
    pub fn from_code(code: i32) -> Status {
        match code {
            -12 => Status::NoMemory,
            -38 => Status::InvalidOperation,
            -22 => Status::BadValue,
            -61 => Status::NotEnoughData,
            -2 => Status::NotFound,
            -11 => Status::WouldBlock,
            i32::MIN => Status::Unknown,
            other => Status::Backend(other),
        }
    }
}

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, Status>;

/// How the session should react to an error reported through
/// [`SessionCallback::on_error`](crate::component::SessionCallback::on_error).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// The session must be torn down and recreated.
    Fatal,
    /// The codec can be reset and reconfigured.
    Recoverable,
}

impl std::fmt::Display for ErrorAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorAction::Fatal => write!(f, "fatal"),
            ErrorAction::Recoverable => write!(f, "recoverable"),
        }
    }
}
