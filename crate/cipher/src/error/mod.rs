use std::num::TryFromIntError;

use thiserror::Error;

pub(crate) mod result;

/// Failures surfaced by every block cipher backend.
///
/// HSM backends convert their own errors into this type at the
/// [`BlockCipher`](crate::BlockCipher) boundary so that callers of the
/// capability contract match on a single taxonomy.
#[derive(Error, Debug)]
pub enum CipherError {
    #[error("{0}")]
    Default(String),

    #[error("invalid AES key size: {0} bytes, expected 16, 24 or 32")]
    InvalidKeySize(usize),

    #[error("failed allocating locked memory: {0}")]
    AllocationError(String),

    #[error("size mismatch: the buffer holds {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("the locked buffer has already been destroyed")]
    AlreadyDestroyed,

    #[error("the cipher has been destroyed and can no longer be used")]
    UseAfterDestroy,

    #[error("{buffer} buffer is {len} bytes, a full {block_size} bytes block is required")]
    ShortBuffer {
        buffer: &'static str,
        len: usize,
        block_size: usize,
    },

    #[error("failed loading the HSM module: {0}")]
    ModuleLoadError(String),

    #[error("no slot available: {0}")]
    NoSlotsAvailable(String),

    #[error("HSM authentication failed: {0}")]
    AuthenticationError(String),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("{count} objects share the identifier {identifier}")]
    AmbiguousKeyIdentifier { identifier: String, count: usize },

    #[error("HSM operation failed: {operation} (CK_RV: {rv:#x})")]
    HardwareOperationFailed { operation: String, rv: u64 },

    #[error("the HSM session is closed")]
    SessionClosed,

    #[error(transparent)]
    TryFromIntError(#[from] TryFromIntError),
}

/// Return early with an error if a condition is not satisfied.
///
/// This macro is equivalent to `if !$cond { return Err(From::from($err)); }`.
#[macro_export]
macro_rules! cipher_ensure {
    ($cond:expr, $msg:literal $(,)?) => {
        if !$cond {
            return ::core::result::Result::Err($crate::cipher_error!($msg));
        }
    };
    ($cond:expr, $err:expr $(,)?) => {
        if !$cond {
            return ::core::result::Result::Err($err);
        }
    };
    ($cond:expr, $fmt:expr, $($arg:tt)*) => {
        if !$cond {
            return ::core::result::Result::Err($crate::cipher_error!($fmt, $($arg)*));
        }
    };
}

/// Construct a cipher error from a string.
#[macro_export]
macro_rules! cipher_error {
    ($msg:literal) => {
        $crate::CipherError::Default(::core::format_args!($msg).to_string())
    };
    ($err:expr $(,)?) => ({
        $crate::CipherError::Default($err.to_string())
    });
    ($fmt:expr, $($arg:tt)*) => {
        $crate::CipherError::Default(::core::format_args!($fmt, $($arg)*).to_string())
    };
}

/// Return early with an error.
#[macro_export]
macro_rules! cipher_bail {
    ($msg:literal) => {
        return ::core::result::Result::Err($crate::cipher_error!($msg))
    };
    ($err:expr $(,)?) => {
        return ::core::result::Result::Err($err)
    };
    ($fmt:expr, $($arg:tt)*) => {
        return ::core::result::Result::Err($crate::cipher_error!($fmt, $($arg)*))
    };
}
