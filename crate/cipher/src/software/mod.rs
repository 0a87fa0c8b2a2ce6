//! AES with round keys held in locked memory.


use cosmian_logger::{debug, trace, warn};
use zeroize::Zeroize;

use crate::{
    AES_BLOCK_SIZE, AesKeySize, BlockCipher, CResult, CipherError, LockedBuffer,
    ScheduleStrategy, check_block_buffers, derive_into,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CipherState {
    Ready,
    Destroyed,
}

/// A software AES block cipher.
///
/// The encryption and decryption schedules are derived once, at construction,
/// straight into two [`LockedBuffer`]s; the raw key is never kept. The
/// strategy that derived the schedules is the one used for every block.
///
/// Call [`SoftwareAesCipher::destroy`] once the cipher is no longer needed.
/// A cipher dropped while still usable is destroyed on drop.
#[derive(Debug)]
pub struct SoftwareAesCipher {
    strategy: ScheduleStrategy,
    key_size: AesKeySize,
    enc: LockedBuffer,
    dec: LockedBuffer,
    state: CipherState,
}

impl SoftwareAesCipher {
    /// Build a cipher using the fastest strategy this CPU supports.
    pub fn new(raw_key: &[u8]) -> CResult<Self> {
        Self::with_strategy(raw_key, ScheduleStrategy::detect())
    }

    pub fn with_strategy(raw_key: &[u8], strategy: ScheduleStrategy) -> CResult<Self> {
        let key_size = AesKeySize::try_from_key_len(raw_key.len())?;

        let mut key = LockedBuffer::allocate(key_size.key_len())?;
        key.write(raw_key)?;
        let mut enc = LockedBuffer::allocate(key_size.schedule_len())?;
        let mut dec = LockedBuffer::allocate(key_size.schedule_len())?;
        // on error every buffer allocated so far is destroyed when dropped
        derive_into(strategy, key.view()?, &mut enc, &mut dec)?;
        key.destroy()?;

        debug!(
            "software cipher ready: {key_size:?} with the {} strategy",
            strategy.name()
        );
        Ok(Self {
            strategy,
            key_size,
            enc,
            dec,
            state: CipherState::Ready,
        })
    }

    #[must_use]
    pub const fn key_size(&self) -> AesKeySize {
        self.key_size
    }

    #[must_use]
    pub const fn is_accelerated(&self) -> bool {
        self.strategy.is_accelerated()
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.state == CipherState::Destroyed
    }

    /// Zero both schedules and make the cipher unusable.
    ///
    /// Every later block operation fails with [`CipherError::UseAfterDestroy`]
    /// and a second call fails with [`CipherError::AlreadyDestroyed`].
    pub fn destroy(&mut self) -> CResult<()> {
        if self.is_destroyed() {
            return Err(CipherError::AlreadyDestroyed);
        }
        self.state = CipherState::Destroyed;
        let enc = self.enc.destroy();
        let dec = self.dec.destroy();
        debug!("software cipher destroyed");
        enc.and(dec)
    }

    fn check_ready(&self) -> CResult<()> {
        if self.is_destroyed() {
            return Err(CipherError::UseAfterDestroy);
        }
        Ok(())
    }

    fn transform(
        &self,
        dst: &mut [u8],
        src: &[u8],
        op: fn(ScheduleStrategy, &[u8], AesKeySize, &mut [u8; AES_BLOCK_SIZE]),
        schedule: &LockedBuffer,
    ) -> CResult<()> {
        self.check_ready()?;
        check_block_buffers(dst, src, AES_BLOCK_SIZE)?;
        let schedule = schedule.view().map_err(|_e| CipherError::UseAfterDestroy)?;

        let mut block = [0_u8; AES_BLOCK_SIZE];
        block.copy_from_slice(&src[..AES_BLOCK_SIZE]);
        op(self.strategy, schedule, self.key_size, &mut block);
        dst[..AES_BLOCK_SIZE].copy_from_slice(&block);
        block.zeroize();
        Ok(())
    }

    /// Whether both schedules read back as zeros, destroyed or not.
    #[cfg(test)]
    pub(crate) fn schedules_are_zeroed(&self) -> bool {
        self.enc.is_zeroed() && self.dec.is_zeroed()
    }
}

impl BlockCipher for SoftwareAesCipher {
    fn block_size(&self) -> usize {
        AES_BLOCK_SIZE
    }

    fn encrypt(&self, dst: &mut [u8], src: &[u8]) -> CResult<()> {
        trace!("software cipher: encrypt one block");
        self.transform(dst, src, ScheduleStrategy::encrypt_block, &self.enc)
    }

    fn decrypt(&self, dst: &mut [u8], src: &[u8]) -> CResult<()> {
        trace!("software cipher: decrypt one block");
        self.transform(dst, src, ScheduleStrategy::decrypt_block, &self.dec)
    }
}

impl Drop for SoftwareAesCipher {
    fn drop(&mut self) {
        if !self.is_destroyed() {
            warn!("software cipher dropped without being destroyed, destroying it now");
            if let Err(e) = self.destroy() {
                warn!("software cipher: failed destroying on drop: {e}");
            }
        }
    }
}
