use cosmian_block_cipher::{AES_BLOCK_SIZE, BlockCipher, CResult, check_block_buffers};
use cosmian_logger::trace;
use pkcs11_sys::{CK_MECHANISM_TYPE, CKM_AES_ECB};

use crate::{HResult, HsmSession, KeyObjectHandle};

/// The hardware operation applied to every block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mechanism {
    /// Single block AES, no parameters
    #[default]
    AesEcb,
}

impl Mechanism {
    pub(crate) const fn ck_type(self) -> CK_MECHANISM_TYPE {
        match self {
            Self::AesEcb => CKM_AES_ECB,
        }
    }
}

/// An AES block cipher whose key stays inside the HSM.
///
/// Every block is sent to the module; nothing secret is held locally, so
/// there is nothing to destroy. Once the session is closed every operation
/// fails with `SessionClosed`.
#[derive(Debug, Clone)]
pub struct HsmAesCipher {
    session: HsmSession,
    key: KeyObjectHandle,
    mechanism: Mechanism,
}

impl HsmAesCipher {
    /// Bind `key`, found in or created by `session`, to AES-ECB.
    pub fn new(session: &HsmSession, key: KeyObjectHandle) -> HResult<Self> {
        session.check_key(&key)?;
        Ok(Self {
            session: session.clone(),
            key,
            mechanism: Mechanism::AesEcb,
        })
    }

    #[must_use]
    pub const fn mechanism(&self) -> Mechanism {
        self.mechanism
    }

    #[must_use]
    pub const fn key(&self) -> &KeyObjectHandle {
        &self.key
    }

    fn transform(&self, dst: &mut [u8], src: &[u8], encrypt: bool) -> CResult<()> {
        check_block_buffers(dst, src, AES_BLOCK_SIZE)?;
        let mut block = [0_u8; AES_BLOCK_SIZE];
        block.copy_from_slice(&src[..AES_BLOCK_SIZE]);
        let output = self
            .session
            .transform_block(&self.key, self.mechanism, encrypt, &block)?;
        dst[..AES_BLOCK_SIZE].copy_from_slice(&output);
        Ok(())
    }
}

impl BlockCipher for HsmAesCipher {
    fn block_size(&self) -> usize {
        AES_BLOCK_SIZE
    }

    fn encrypt(&self, dst: &mut [u8], src: &[u8]) -> CResult<()> {
        trace!("HSM cipher: encrypt one block with key {}", self.key.handle());
        self.transform(dst, src, true)
    }

    fn decrypt(&self, dst: &mut [u8], src: &[u8]) -> CResult<()> {
        trace!("HSM cipher: decrypt one block with key {}", self.key.handle());
        self.transform(dst, src, false)
    }
}
