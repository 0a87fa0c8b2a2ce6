//! Copyright 2024 Cosmian Tech SAS

#![deny(
    unsafe_code,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

#[cfg(not(unix))]
compile_error!("locked key material requires a unix platform (mmap/mlock)");

pub use block_cipher::{AES_BLOCK_SIZE, BlockCipher, check_block_buffers};
pub use error::{
    CipherError,
    result::{CResult, CipherResultHelper},
};
pub use key_schedule::{AesKeySize, ScheduleStrategy, derive_into};
pub use locked_buffer::{LockedBuffer, ProtectionState};
pub use software::SoftwareAesCipher;

mod block_cipher;
mod error;
mod key_schedule;
mod locked_buffer;
mod software;

pub mod test_helpers;
