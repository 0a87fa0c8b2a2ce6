//! AES key schedule derivation.
//!
//! A schedule is `4 * (rounds + 1)` words of 4 bytes, stored as consecutive
//! 16 bytes round keys in FIPS-197 byte order. The decryption schedule is the
//! one of the equivalent inverse cipher:
//! `[rk_N, InvMixColumns(rk_N-1), .., InvMixColumns(rk_1), rk_0]`.
//!
//! Two strategies produce these schedules and the matching block transforms:
//! a portable one and, on `x86_64` CPUs with AES-NI, an accelerated one.
//! Both write byte-identical schedules, but a schedule must only ever be used
//! with the strategy that derived it.

#[cfg(target_arch = "x86_64")]
#[allow(unsafe_code, clippy::indexing_slicing)]
mod aesni;
#[allow(clippy::indexing_slicing)]
mod generic;

use cosmian_logger::debug;

use crate::{AES_BLOCK_SIZE, CResult, CipherError, LockedBuffer};

/// Round constants of the key expansion
const RCON: [u8; 10] = [0x01, 0x02, 0x04, 0x08, 0x10, 0x20, 0x40, 0x80, 0x1b, 0x36];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AesKeySize {
    Aes128,
    Aes192,
    Aes256,
}

impl AesKeySize {
    /// Classify a raw key by its length.
    pub fn try_from_key_len(len: usize) -> CResult<Self> {
        match len {
            16 => Ok(Self::Aes128),
            24 => Ok(Self::Aes192),
            32 => Ok(Self::Aes256),
            _ => Err(CipherError::InvalidKeySize(len)),
        }
    }

    #[must_use]
    pub const fn key_len(self) -> usize {
        match self {
            Self::Aes128 => 16,
            Self::Aes192 => 24,
            Self::Aes256 => 32,
        }
    }

    #[must_use]
    pub const fn rounds(self) -> usize {
        match self {
            Self::Aes128 => 10,
            Self::Aes192 => 12,
            Self::Aes256 => 14,
        }
    }

    /// Number of 32-bit words in one schedule
    #[must_use]
    pub const fn schedule_words(self) -> usize {
        4 * (self.rounds() + 1)
    }

    /// Size in bytes of one schedule
    #[must_use]
    pub const fn schedule_len(self) -> usize {
        4 * self.schedule_words()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Implementation {
    Generic,
    #[cfg(target_arch = "x86_64")]
    AesNi,
}

/// Selects how schedules are derived and blocks transformed.
///
/// The accelerated strategy can only be obtained through a successful CPU
/// feature check, so holding one proves the instructions are available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleStrategy(Implementation);

impl ScheduleStrategy {
    /// The portable strategy, available everywhere
    #[must_use]
    pub const fn generic() -> Self {
        Self(Implementation::Generic)
    }

    /// The hardware accelerated strategy, if this CPU supports it
    #[must_use]
    pub fn accelerated() -> Option<Self> {
        #[cfg(target_arch = "x86_64")]
        {
            if std::arch::is_x86_feature_detected!("aes")
                && std::arch::is_x86_feature_detected!("sse2")
            {
                return Some(Self(Implementation::AesNi));
            }
        }
        None
    }

    /// Probe the CPU once and pick the fastest available strategy.
    #[must_use]
    pub fn detect() -> Self {
        let strategy = Self::accelerated().unwrap_or_else(Self::generic);
        debug!("AES key schedule strategy: {}", strategy.name());
        strategy
    }

    #[must_use]
    pub const fn is_accelerated(self) -> bool {
        !matches!(self.0, Implementation::Generic)
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self.0 {
            Implementation::Generic => "generic",
            #[cfg(target_arch = "x86_64")]
            Implementation::AesNi => "aes-ni",
        }
    }

    /// `enc` and `dec` must be exactly `key_size.schedule_len()` bytes long.
    fn expand(self, key: &[u8], enc: &mut [u8], dec: &mut [u8], key_size: AesKeySize) {
        debug_assert_eq!(enc.len(), key_size.schedule_len());
        debug_assert_eq!(dec.len(), key_size.schedule_len());
        match self.0 {
            Implementation::Generic => {
                generic::expand_key(key, enc);
                generic::invert_key_schedule(enc, dec, key_size.rounds());
            }
            #[cfg(target_arch = "x86_64")]
            // SAFETY: `AesNi` is only built after the CPU features were detected
            #[expect(unsafe_code)]
            Implementation::AesNi => unsafe {
                aesni::expand_key(key, enc);
                aesni::invert_key_schedule(enc, dec, key_size.rounds());
            },
        }
    }

    pub(crate) fn encrypt_block(
        self,
        enc: &[u8],
        key_size: AesKeySize,
        block: &mut [u8; AES_BLOCK_SIZE],
    ) {
        match self.0 {
            Implementation::Generic => generic::encrypt_block(enc, key_size.rounds(), block),
            #[cfg(target_arch = "x86_64")]
            // SAFETY: `AesNi` is only built after the CPU features were detected
            #[expect(unsafe_code)]
            Implementation::AesNi => unsafe {
                aesni::encrypt_block(enc, key_size.rounds(), block);
            },
        }
    }

    pub(crate) fn decrypt_block(
        self,
        dec: &[u8],
        key_size: AesKeySize,
        block: &mut [u8; AES_BLOCK_SIZE],
    ) {
        match self.0 {
            Implementation::Generic => generic::decrypt_block(dec, key_size.rounds(), block),
            #[cfg(target_arch = "x86_64")]
            // SAFETY: `AesNi` is only built after the CPU features were detected
            #[expect(unsafe_code)]
            Implementation::AesNi => unsafe {
                aesni::decrypt_block(dec, key_size.rounds(), block);
            },
        }
    }
}

/// Derive the encryption and decryption schedules of `raw_key` straight into
/// the caller's locked buffers, so the round keys never exist in ordinary memory.
///
/// Both buffers must be `schedule_len()` bytes long for the size of `raw_key`.
pub fn derive_into(
    strategy: ScheduleStrategy,
    raw_key: &[u8],
    enc: &mut LockedBuffer,
    dec: &mut LockedBuffer,
) -> CResult<AesKeySize> {
    let key_size = AesKeySize::try_from_key_len(raw_key.len())?;
    let expected = key_size.schedule_len();
    for buffer in [&*enc, &*dec] {
        if buffer.len() != expected {
            return Err(CipherError::SizeMismatch {
                expected,
                actual: buffer.len(),
            });
        }
    }
    strategy.expand(raw_key, enc.view_mut()?, dec.view_mut()?, key_size);
    Ok(key_size)
}
