//! Copyright 2024 Cosmian Tech SAS
use cosmian_hsm_cipher::{HsmCapabilities, HsmProvider, HsmSession};

/// Default path to the SoftHSM2 `PKCS#11` shared library
pub const SOFTHSM2_PKCS11_LIB: &str = "/usr/lib/softhsm/libsofthsm2.so";

pub struct SofthsmCapabilityProvider;

impl HsmProvider for SofthsmCapabilityProvider {
    fn capabilities() -> HsmCapabilities {
        HsmCapabilities {
            find_max_object_count: 64,
            ..HsmCapabilities::default()
        }
    }
}

/// The softhsm2 is fully supported by the generic session
pub type Softhsm2 = HsmSession;
