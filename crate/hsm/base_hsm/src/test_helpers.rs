use std::env;

use crate::{HError, HResult};

/// The user PIN of the test token, read from `HSM_USER_PASSWORD`
pub fn get_hsm_password() -> HResult<String> {
    env::var("HSM_USER_PASSWORD").map_err(|_e| {
        HError::Default(
            "The user password for the HSM is not set. Please set the HSM_USER_PASSWORD \
             environment variable"
                .to_owned(),
        )
    })
}

/// The slot of the test token, read from `HSM_SLOT_ID`
pub fn get_hsm_slot_id() -> HResult<usize> {
    let slot = env::var("HSM_SLOT_ID")
        .map_err(|_e| HError::Default("HSM_SLOT_ID is not set".to_owned()))?;
    slot.trim()
        .parse()
        .map_err(|e| HError::Default(format!("invalid HSM_SLOT_ID {slot}: {e}")))
}

/// The module path from `env_var`, or `default` when it is not set
#[must_use]
pub fn lib_path(env_var: &str, default: &str) -> String {
    env::var(env_var).unwrap_or_else(|_e| default.to_owned())
}
