//! Copyright 2024 Cosmian Tech SAS

#![deny(
    unsafe_code,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]

pub use error::{HError, HResult};
pub use hsm_capabilities::{
    DefaultCapabilityProvider, HsmCapabilities, HsmProvider, KeyIdentifierAttribute,
};
pub use hsm_cipher::{HsmAesCipher, Mechanism};
pub use info::Info;
pub use session::{HsmSession, KeyObjectHandle, KeyPersistence};
pub use slots::SlotSelector;

mod error;
mod hsm_capabilities;
mod hsm_cipher;
mod hsm_lib;
mod info;
mod session;
mod slots;

pub mod test_helpers;
pub mod tests_shared;

#[cfg(test)]
#[allow(unsafe_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod mock;
