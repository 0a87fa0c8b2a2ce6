use pkcs11_sys::{CK_ATTRIBUTE_TYPE, CK_ULONG, CKA_ID, CKA_LABEL};

/// The attribute matched when looking a key up by its identifier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeyIdentifierAttribute {
    #[default]
    Id,
    /// For vendors that do not allow `CKA_ID` on secret keys
    Label,
}

impl KeyIdentifierAttribute {
    pub(crate) const fn attribute_type(self) -> CK_ATTRIBUTE_TYPE {
        match self {
            Self::Id => CKA_ID,
            Self::Label => CKA_LABEL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HsmCapabilities {
    /// Maximum number of handles requested per `C_FindObjects` call
    pub find_max_object_count: CK_ULONG,
    pub key_identifier: KeyIdentifierAttribute,
}

impl Default for HsmCapabilities {
    fn default() -> Self {
        Self {
            find_max_object_count: 16,
            key_identifier: KeyIdentifierAttribute::default(),
        }
    }
}

pub trait HsmProvider: Send + Sync + 'static {
    fn capabilities() -> HsmCapabilities;
}

pub struct DefaultCapabilityProvider;

impl HsmProvider for DefaultCapabilityProvider {
    fn capabilities() -> HsmCapabilities {
        HsmCapabilities::default()
    }
}
