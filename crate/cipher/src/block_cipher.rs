use crate::{CResult, CipherError};

/// AES block size in bytes
pub const AES_BLOCK_SIZE: usize = 16;

/// The capability shared by every backend: a fixed block size and
/// single-block encryption and decryption.
///
/// Higher level algorithms (format preserving encryption, key wrapping, ...)
/// take a `&dyn BlockCipher` and never learn whether the key lives in locked
/// host memory or inside an HSM.
///
/// Each call transforms exactly one block: the first `block_size()` bytes of
/// `src` are read and the first `block_size()` bytes of `dst` are written.
/// Short buffers, a destroyed cipher or a failed hardware operation are
/// reported as errors. They are never recoverable at the call site and the
/// content of `dst` must then be ignored.
pub trait BlockCipher {
    /// Size of a block in bytes.
    fn block_size(&self) -> usize;

    /// Encrypt the first block of `src` into `dst`.
    fn encrypt(&self, dst: &mut [u8], src: &[u8]) -> CResult<()>;

    /// Decrypt the first block of `src` into `dst`.
    fn decrypt(&self, dst: &mut [u8], src: &[u8]) -> CResult<()>;

    /// Encrypt the first block of `block` in place.
    fn encrypt_in_place(&self, block: &mut [u8]) -> CResult<()> {
        let src = first_block(block, self.block_size())?;
        self.encrypt(block, &src)
    }

    /// Decrypt the first block of `block` in place.
    fn decrypt_in_place(&self, block: &mut [u8]) -> CResult<()> {
        let src = first_block(block, self.block_size())?;
        self.decrypt(block, &src)
    }
}

fn first_block(block: &[u8], block_size: usize) -> CResult<Vec<u8>> {
    block
        .get(..block_size)
        .map(<[u8]>::to_vec)
        .ok_or(CipherError::ShortBuffer {
            buffer: "in place",
            len: block.len(),
            block_size,
        })
}

/// Check that both buffers hold at least one full block.
pub fn check_block_buffers(dst: &[u8], src: &[u8], block_size: usize) -> CResult<()> {
    if src.len() < block_size {
        return Err(CipherError::ShortBuffer {
            buffer: "source",
            len: src.len(),
            block_size,
        });
    }
    if dst.len() < block_size {
        return Err(CipherError::ShortBuffer {
            buffer: "destination",
            len: dst.len(),
            block_size,
        });
    }
    Ok(())
}
