use std::ptr;

use cosmian_logger::debug;
use pkcs11_sys::{CK_BBOOL, CK_SLOT_ID, CK_TRUE, CK_ULONG};

use crate::{
    HError, HResult,
    hsm_lib::{HsmLib, hsm_call},
};

/// Which slot a session is opened on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SlotSelector {
    /// The first slot with a token present
    #[default]
    First,
    Id(usize),
}

/// List the slots that have a token present.
pub(crate) fn list_slots(hsm: &HsmLib) -> HResult<Vec<CK_SLOT_ID>> {
    let token_present = CK_BBOOL::try_from(CK_TRUE)
        .map_err(|e| HError::Default(format!("invalid CK_TRUE value: {e}")))?;
    let mut count: CK_ULONG = 0;
    hsm_call!(
        hsm,
        "Failed counting the slots",
        C_GetSlotList,
        token_present,
        ptr::null_mut(),
        &raw mut count
    );
    let mut slots = vec![CK_SLOT_ID::default(); usize::try_from(count)?];
    if slots.is_empty() {
        return Ok(slots);
    }
    hsm_call!(
        hsm,
        "Failed listing the slots",
        C_GetSlotList,
        token_present,
        slots.as_mut_ptr(),
        &raw mut count
    );
    slots.truncate(usize::try_from(count)?);
    Ok(slots)
}

impl SlotSelector {
    pub(crate) fn resolve(self, hsm: &HsmLib) -> HResult<CK_SLOT_ID> {
        let slots = list_slots(hsm)?;
        debug!("available slots: {slots:?}");
        match self {
            Self::First => slots
                .first()
                .copied()
                .ok_or_else(|| HError::NoSlotsAvailable("no slot with a token".to_owned())),
            Self::Id(id) => {
                let id = CK_SLOT_ID::try_from(id)?;
                slots.contains(&id).then_some(id).ok_or_else(|| {
                    HError::NoSlotsAvailable(format!("slot {id} has no token or does not exist"))
                })
            }
        }
    }
}
