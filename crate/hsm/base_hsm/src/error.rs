use std::num::TryFromIntError;

use cosmian_block_cipher::CipherError;
use pkcs11_sys::CK_RV;
use thiserror::Error;

pub type HResult<T> = Result<T, HError>;

#[derive(Error, Debug)]
pub enum HError {
    #[error("{0}")]
    Default(String),

    #[error("failed loading the PKCS#11 module: {0}")]
    ModuleLoad(String),

    #[error(transparent)]
    LibLoading(#[from] libloading::Error),

    #[error("no slot available: {0}")]
    NoSlotsAvailable(String),

    #[error("HSM login failed: {0}")]
    Authentication(String),

    #[error("no key with identifier {0}")]
    KeyNotFound(String),

    #[error("{count} keys share the identifier {identifier}")]
    AmbiguousKeyIdentifier { identifier: String, count: usize },

    #[error("{message} (CK_RV: {rv:#x})")]
    Pkcs11 { message: String, rv: CK_RV },

    #[error("the HSM session is closed")]
    SessionClosed,

    #[error(transparent)]
    TryFromIntError(#[from] TryFromIntError),

    #[error(transparent)]
    Cipher(#[from] CipherError),
}

impl From<HError> for CipherError {
    fn from(e: HError) -> Self {
        match e {
            HError::Default(message) => Self::Default(message),
            HError::ModuleLoad(message) => Self::ModuleLoadError(message),
            HError::LibLoading(e) => Self::ModuleLoadError(e.to_string()),
            HError::NoSlotsAvailable(message) => Self::NoSlotsAvailable(message),
            HError::Authentication(message) => Self::AuthenticationError(message),
            HError::KeyNotFound(identifier) => Self::KeyNotFound(identifier),
            HError::AmbiguousKeyIdentifier { identifier, count } => {
                Self::AmbiguousKeyIdentifier { identifier, count }
            }
            HError::Pkcs11 { message, rv } => Self::HardwareOperationFailed {
                operation: message,
                rv: u64::from(rv),
            },
            HError::SessionClosed => Self::SessionClosed,
            HError::TryFromIntError(e) => Self::TryFromIntError(e),
            HError::Cipher(e) => e,
        }
    }
}
