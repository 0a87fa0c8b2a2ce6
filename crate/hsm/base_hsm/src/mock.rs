//! An in-process PKCS#11 module for tests.
//!
//! The functions implement the subset of PKCS#11 the sessions use, over a
//! thread local token: every test thread sees its own module. AES is
//! computed by the software backend so results can be checked against
//! known answers.
#![allow(non_snake_case, clippy::missing_safety_doc)]

use std::{cell::RefCell, collections::BTreeMap, slice, sync::Arc};

use cosmian_block_cipher::{AES_BLOCK_SIZE, BlockCipher, ScheduleStrategy, SoftwareAesCipher};
use pkcs11_sys::{
    CK_ATTRIBUTE, CK_ATTRIBUTE_PTR, CK_ATTRIBUTE_TYPE, CK_BBOOL, CK_BYTE_PTR, CK_FLAGS, CK_INFO,
    CK_INFO_PTR, CK_MECHANISM_PTR, CK_NOTIFY, CK_OBJECT_CLASS, CK_OBJECT_HANDLE,
    CK_OBJECT_HANDLE_PTR, CK_RV, CK_SESSION_HANDLE, CK_SESSION_HANDLE_PTR, CK_SLOT_ID,
    CK_SLOT_ID_PTR, CK_ULONG, CK_ULONG_PTR, CK_USER_TYPE, CK_UTF8CHAR_PTR, CK_VERSION,
    CK_VOID_PTR, CKA_CLASS, CKA_ID, CKA_LABEL, CKA_TOKEN, CKA_VALUE, CKF_SERIAL_SESSION,
    CKM_AES_ECB, CKR_ARGUMENTS_BAD, CKR_ATTRIBUTE_VALUE_INVALID, CKR_BUFFER_TOO_SMALL,
    CKR_CRYPTOKI_ALREADY_INITIALIZED, CKR_CRYPTOKI_NOT_INITIALIZED, CKR_DATA_LEN_RANGE,
    CKR_FUNCTION_FAILED, CKR_KEY_HANDLE_INVALID, CKR_MECHANISM_INVALID, CKR_OBJECT_HANDLE_INVALID,
    CKR_OK, CKR_OPERATION_ACTIVE, CKR_OPERATION_NOT_INITIALIZED, CKR_PIN_INCORRECT,
    CKR_SESSION_HANDLE_INVALID, CKR_SESSION_PARALLEL_NOT_SUPPORTED, CKR_SLOT_ID_INVALID,
    CKR_TEMPLATE_INCOMPLETE, CKR_USER_ALREADY_LOGGED_IN, CKR_USER_NOT_LOGGED_IN,
};

use crate::{
    DefaultCapabilityProvider, HResult, HsmCapabilities, HsmProvider, HsmSession, SlotSelector,
    hsm_lib::{HsmLib, SharedModuleUsage},
};

pub(crate) const MOCK_PIN: &str = "12345678";
pub(crate) const MOCK_SLOT: CK_SLOT_ID = 7;
pub(crate) const MOCK_MANUFACTURER: &str = "Cosmian Mock Token";

type MockResult<T> = Result<T, CK_RV>;

#[derive(Debug, Clone)]
pub(crate) struct MockObject {
    pub(crate) class: CK_OBJECT_CLASS,
    pub(crate) id: Vec<u8>,
    pub(crate) label: Vec<u8>,
    pub(crate) value: Vec<u8>,
    pub(crate) on_token: bool,
    owner: CK_SESSION_HANDLE,
}

#[derive(Debug, Clone, Copy)]
struct Operation {
    encrypt: bool,
    key: CK_OBJECT_HANDLE,
}

#[derive(Debug)]
pub(crate) struct MockState {
    pub(crate) initialized: bool,
    pub(crate) slots: Vec<CK_SLOT_ID>,
    pub(crate) logged_in: bool,
    pub(crate) sessions: Vec<CK_SESSION_HANDLE>,
    pub(crate) objects: BTreeMap<CK_OBJECT_HANDLE, MockObject>,
    /// Function name and the `CK_RV` it answers instead of running
    pub(crate) failures: Vec<(&'static str, CK_RV)>,
    /// Reported output length of `C_Encrypt` and `C_Decrypt`
    pub(crate) output_len: Option<CK_ULONG>,
    pub(crate) calls: Vec<&'static str>,
    /// Shared by every function table of this thread's module
    usage: SharedModuleUsage,
    next_handle: CK_ULONG,
    search: Option<Vec<CK_OBJECT_HANDLE>>,
    operation: Option<Operation>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            initialized: false,
            slots: vec![MOCK_SLOT],
            logged_in: false,
            sessions: Vec::new(),
            objects: BTreeMap::new(),
            failures: Vec::new(),
            output_len: None,
            calls: Vec::new(),
            usage: SharedModuleUsage::default(),
            next_handle: 100,
            search: None,
            operation: None,
        }
    }
}

impl MockState {
    fn next_handle(&mut self) -> CK_ULONG {
        self.next_handle += 1;
        self.next_handle
    }

    fn check_initialized(&self) -> MockResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(CKR_CRYPTOKI_NOT_INITIALIZED)
        }
    }

    fn check_session(&self, handle: CK_SESSION_HANDLE) -> MockResult<()> {
        self.check_initialized()?;
        if self.sessions.contains(&handle) {
            Ok(())
        } else {
            Err(CKR_SESSION_HANDLE_INVALID)
        }
    }

    fn check_logged_in(&self, handle: CK_SESSION_HANDLE) -> MockResult<()> {
        self.check_session(handle)?;
        if self.logged_in {
            Ok(())
        } else {
            Err(CKR_USER_NOT_LOGGED_IN)
        }
    }

    /// Drop the session objects of `owner`, or of every session.
    fn drop_session_objects(&mut self, owner: Option<CK_SESSION_HANDLE>) {
        self.objects
            .retain(|_, object| object.on_token || owner.is_some_and(|o| o != object.owner));
    }

    pub(crate) fn count(&self, function: &str) -> usize {
        self.calls.iter().filter(|call| **call == function).count()
    }
}

thread_local! {
    static STATE: RefCell<MockState> = RefCell::new(MockState::default());
}

/// Start every test from a fresh, uninitialized module.
pub(crate) fn reset() {
    STATE.with(|state| *state.borrow_mut() = MockState::default());
}

pub(crate) fn with_state<R>(f: impl FnOnce(&mut MockState) -> R) -> R {
    STATE.with(|state| f(&mut state.borrow_mut()))
}

/// Answer `rv` on the next calls of `function`.
pub(crate) fn fail(function: &'static str, rv: CK_RV) {
    with_state(|state| state.failures.push((function, rv)));
}

fn result_to_rv(result: MockResult<()>) -> CK_RV {
    match result {
        Ok(()) => CKR_OK,
        Err(rv) => rv,
    }
}

macro_rules! mock_fn {
    ($state:ident, fn $name:ident ( $($arg:ident : $type:ty),* $(,)?) $body:block) => {
        pub(crate) unsafe extern "C" fn $name($($arg: $type),*) -> CK_RV {
            with_state(|$state| {
                $state.calls.push(stringify!($name));
                if let Some((_, rv)) = $state
                    .failures
                    .iter()
                    .find(|(function, _)| *function == stringify!($name))
                {
                    return *rv;
                }
                let mut run = || -> MockResult<()> { $body };
                result_to_rv(run())
            })
        }
    };
}

macro_rules! not_null {
    ($ptr:expr) => {
        if $ptr.is_null() {
            return Err(CKR_ARGUMENTS_BAD);
        }
    };
}

fn padded<const N: usize>(text: &str) -> [u8; N] {
    let mut out = [b' '; N];
    out[..text.len()].copy_from_slice(text.as_bytes());
    out
}

fn to_usize(value: CK_ULONG) -> MockResult<usize> {
    usize::try_from(value).map_err(|_e| CKR_ARGUMENTS_BAD)
}

fn to_ulong(value: usize) -> MockResult<CK_ULONG> {
    CK_ULONG::try_from(value).map_err(|_e| CKR_ARGUMENTS_BAD)
}

/// # Safety
/// `pointer` is valid for `len` bytes or null with a zero length.
unsafe fn bytes<'a>(pointer: *const u8, len: CK_ULONG) -> MockResult<&'a [u8]> {
    let len = to_usize(len)?;
    if len == 0 {
        return Ok(&[]);
    }
    not_null!(pointer);
    Ok(unsafe { slice::from_raw_parts(pointer, len) })
}

/// # Safety
/// `template` points to `count` attributes whose values are valid.
unsafe fn attributes(
    template: CK_ATTRIBUTE_PTR,
    count: CK_ULONG,
) -> MockResult<Vec<(CK_ATTRIBUTE_TYPE, Vec<u8>)>> {
    let count = to_usize(count)?;
    if count == 0 {
        return Ok(Vec::new());
    }
    not_null!(template);
    let template: &[CK_ATTRIBUTE] = unsafe { slice::from_raw_parts(template, count) };
    template
        .iter()
        .map(|attribute| {
            let value =
                unsafe { bytes(attribute.pValue.cast::<u8>(), attribute.ulValueLen) }?.to_vec();
            Ok((attribute.type_, value))
        })
        .collect()
}

fn ulong_value(bytes: &[u8]) -> MockResult<CK_ULONG> {
    let bytes: [u8; size_of::<CK_ULONG>()] =
        bytes.try_into().map_err(|_e| CKR_ATTRIBUTE_VALUE_INVALID)?;
    Ok(CK_ULONG::from_ne_bytes(bytes))
}

fn matches_template(object: &MockObject, template: &[(CK_ATTRIBUTE_TYPE, Vec<u8>)]) -> bool {
    template.iter().all(|(type_, value)| match *type_ {
        CKA_CLASS => ulong_value(value).is_ok_and(|class| class == object.class),
        CKA_ID => *value == object.id,
        CKA_LABEL => *value == object.label,
        _ => false,
    })
}

mock_fn!(state, fn C_Initialize(_init_args: CK_VOID_PTR) {
    if state.initialized {
        return Err(CKR_CRYPTOKI_ALREADY_INITIALIZED);
    }
    state.initialized = true;
    Ok(())
});

mock_fn!(state, fn C_Finalize(_reserved: CK_VOID_PTR) {
    state.check_initialized()?;
    state.initialized = false;
    state.logged_in = false;
    state.sessions.clear();
    state.drop_session_objects(None);
    Ok(())
});

mock_fn!(state, fn C_GetInfo(info: CK_INFO_PTR) {
    state.check_initialized()?;
    not_null!(info);
    let ck_info = CK_INFO {
        cryptokiVersion: CK_VERSION { major: 2, minor: 40 },
        manufacturerID: padded(MOCK_MANUFACTURER),
        flags: 0,
        libraryDescription: padded("in-process test module"),
        libraryVersion: CK_VERSION { major: 1, minor: 0 },
    };
    unsafe { *info = ck_info };
    Ok(())
});

mock_fn!(state, fn C_GetSlotList(
    _token_present: CK_BBOOL,
    slot_list: CK_SLOT_ID_PTR,
    count: CK_ULONG_PTR,
) {
    state.check_initialized()?;
    not_null!(count);
    let available = to_ulong(state.slots.len())?;
    if slot_list.is_null() {
        unsafe { *count = available };
        return Ok(());
    }
    let capacity = unsafe { *count };
    unsafe { *count = available };
    if capacity < available {
        return Err(CKR_BUFFER_TOO_SMALL);
    }
    let slot_list = unsafe { slice::from_raw_parts_mut(slot_list, state.slots.len()) };
    slot_list.copy_from_slice(&state.slots);
    Ok(())
});

mock_fn!(state, fn C_OpenSession(
    slot_id: CK_SLOT_ID,
    flags: CK_FLAGS,
    _application: CK_VOID_PTR,
    _notify: CK_NOTIFY,
    session: CK_SESSION_HANDLE_PTR,
) {
    state.check_initialized()?;
    not_null!(session);
    if !state.slots.contains(&slot_id) {
        return Err(CKR_SLOT_ID_INVALID);
    }
    if flags & CKF_SERIAL_SESSION == 0 {
        return Err(CKR_SESSION_PARALLEL_NOT_SUPPORTED);
    }
    let handle = state.next_handle();
    state.sessions.push(handle);
    unsafe { *session = handle };
    Ok(())
});

mock_fn!(state, fn C_CloseSession(session: CK_SESSION_HANDLE) {
    state.check_session(session)?;
    state.sessions.retain(|handle| *handle != session);
    state.drop_session_objects(Some(session));
    if state.sessions.is_empty() {
        state.logged_in = false;
    }
    Ok(())
});

mock_fn!(state, fn C_Login(
    session: CK_SESSION_HANDLE,
    _user_type: CK_USER_TYPE,
    pin: CK_UTF8CHAR_PTR,
    pin_len: CK_ULONG,
) {
    state.check_session(session)?;
    if state.logged_in {
        return Err(CKR_USER_ALREADY_LOGGED_IN);
    }
    let pin = unsafe { bytes(pin, pin_len) }?;
    if pin != MOCK_PIN.as_bytes() {
        return Err(CKR_PIN_INCORRECT);
    }
    state.logged_in = true;
    Ok(())
});

mock_fn!(state, fn C_Logout(session: CK_SESSION_HANDLE) {
    state.check_logged_in(session)?;
    state.logged_in = false;
    Ok(())
});

mock_fn!(state, fn C_CreateObject(
    session: CK_SESSION_HANDLE,
    template: CK_ATTRIBUTE_PTR,
    count: CK_ULONG,
    object: CK_OBJECT_HANDLE_PTR,
) {
    state.check_logged_in(session)?;
    not_null!(object);
    let template = unsafe { attributes(template, count) }?;
    let find = |type_: CK_ATTRIBUTE_TYPE| {
        template
            .iter()
            .find(|(t, _)| *t == type_)
            .map(|(_, value)| value.clone())
    };
    let class = ulong_value(&find(CKA_CLASS).ok_or(CKR_TEMPLATE_INCOMPLETE)?)?;
    let value = find(CKA_VALUE).ok_or(CKR_TEMPLATE_INCOMPLETE)?;
    if ![16, 24, 32].contains(&value.len()) {
        return Err(CKR_ATTRIBUTE_VALUE_INVALID);
    }
    let new_object = MockObject {
        class,
        id: find(CKA_ID).unwrap_or_default(),
        label: find(CKA_LABEL).unwrap_or_default(),
        value,
        on_token: find(CKA_TOKEN).is_some_and(|token| token.first().is_some_and(|b| *b != 0)),
        owner: session,
    };
    let handle = state.next_handle();
    state.objects.insert(handle, new_object);
    unsafe { *object = handle };
    Ok(())
});

mock_fn!(state, fn C_DestroyObject(session: CK_SESSION_HANDLE, object: CK_OBJECT_HANDLE) {
    state.check_logged_in(session)?;
    state
        .objects
        .remove(&object)
        .map(|_| ())
        .ok_or(CKR_OBJECT_HANDLE_INVALID)
});

mock_fn!(state, fn C_FindObjectsInit(
    session: CK_SESSION_HANDLE,
    template: CK_ATTRIBUTE_PTR,
    count: CK_ULONG,
) {
    state.check_session(session)?;
    if state.search.is_some() {
        return Err(CKR_OPERATION_ACTIVE);
    }
    let template = unsafe { attributes(template, count) }?;
    let found = state
        .objects
        .iter()
        .filter(|(_, object)| matches_template(object, &template))
        .map(|(handle, _)| *handle)
        .collect();
    state.search = Some(found);
    Ok(())
});

mock_fn!(state, fn C_FindObjects(
    session: CK_SESSION_HANDLE,
    objects: CK_OBJECT_HANDLE_PTR,
    max_object_count: CK_ULONG,
    object_count: CK_ULONG_PTR,
) {
    state.check_session(session)?;
    not_null!(objects);
    not_null!(object_count);
    let search = state.search.as_mut().ok_or(CKR_OPERATION_NOT_INITIALIZED)?;
    let take = search.len().min(to_usize(max_object_count)?);
    let batch: Vec<CK_OBJECT_HANDLE> = search.drain(..take).collect();
    if !batch.is_empty() {
        unsafe { slice::from_raw_parts_mut(objects, batch.len()) }.copy_from_slice(&batch);
    }
    unsafe { *object_count = to_ulong(batch.len())? };
    Ok(())
});

mock_fn!(state, fn C_FindObjectsFinal(session: CK_SESSION_HANDLE) {
    state.check_session(session)?;
    state
        .search
        .take()
        .map(|_| ())
        .ok_or(CKR_OPERATION_NOT_INITIALIZED)
});

/// # Safety
/// `mechanism` is null or points to a valid mechanism.
unsafe fn start_operation(
    state: &mut MockState,
    session: CK_SESSION_HANDLE,
    mechanism: CK_MECHANISM_PTR,
    key: CK_OBJECT_HANDLE,
    encrypt: bool,
) -> MockResult<()> {
    state.check_logged_in(session)?;
    not_null!(mechanism);
    if state.operation.is_some() {
        return Err(CKR_OPERATION_ACTIVE);
    }
    if unsafe { (*mechanism).mechanism } != CKM_AES_ECB {
        return Err(CKR_MECHANISM_INVALID);
    }
    if !state.objects.contains_key(&key) {
        return Err(CKR_KEY_HANDLE_INVALID);
    }
    state.operation = Some(Operation { encrypt, key });
    Ok(())
}

/// # Safety
/// The buffers are valid for the lengths passed with them.
unsafe fn run_operation(
    state: &mut MockState,
    session: CK_SESSION_HANDLE,
    encrypt: bool,
    input: (CK_BYTE_PTR, CK_ULONG),
    output: (CK_BYTE_PTR, CK_ULONG_PTR),
) -> MockResult<()> {
    state.check_logged_in(session)?;
    let (output, output_len) = output;
    not_null!(output_len);
    let operation = state
        .operation
        .filter(|operation| operation.encrypt == encrypt)
        .ok_or(CKR_OPERATION_NOT_INITIALIZED)?;
    let input = unsafe { bytes(input.0, input.1) }?;
    if input.is_empty() || input.len() % AES_BLOCK_SIZE != 0 {
        state.operation = None;
        return Err(CKR_DATA_LEN_RANGE);
    }
    let required = to_ulong(input.len())?;
    if output.is_null() {
        // size query, the operation stays active
        unsafe { *output_len = required };
        return Ok(());
    }
    if unsafe { *output_len } < required {
        unsafe { *output_len = required };
        return Err(CKR_BUFFER_TOO_SMALL);
    }
    state.operation = None;

    let key = state
        .objects
        .get(&operation.key)
        .ok_or(CKR_KEY_HANDLE_INVALID)?;
    let cipher = SoftwareAesCipher::with_strategy(&key.value, ScheduleStrategy::generic())
        .map_err(|_e| CKR_FUNCTION_FAILED)?;
    let output = unsafe { slice::from_raw_parts_mut(output, input.len()) };
    for (dst, src) in output
        .chunks_exact_mut(AES_BLOCK_SIZE)
        .zip(input.chunks_exact(AES_BLOCK_SIZE))
    {
        if encrypt {
            cipher.encrypt(dst, src)
        } else {
            cipher.decrypt(dst, src)
        }
        .map_err(|_e| CKR_FUNCTION_FAILED)?;
    }
    unsafe { *output_len = state.output_len.unwrap_or(required) };
    Ok(())
}

mock_fn!(state, fn C_EncryptInit(
    session: CK_SESSION_HANDLE,
    mechanism: CK_MECHANISM_PTR,
    key: CK_OBJECT_HANDLE,
) {
    unsafe { start_operation(state, session, mechanism, key, true) }
});

mock_fn!(state, fn C_Encrypt(
    session: CK_SESSION_HANDLE,
    data: CK_BYTE_PTR,
    data_len: CK_ULONG,
    encrypted_data: CK_BYTE_PTR,
    encrypted_data_len: CK_ULONG_PTR,
) {
    unsafe {
        run_operation(
            state,
            session,
            true,
            (data, data_len),
            (encrypted_data, encrypted_data_len),
        )
    }
});

mock_fn!(state, fn C_DecryptInit(
    session: CK_SESSION_HANDLE,
    mechanism: CK_MECHANISM_PTR,
    key: CK_OBJECT_HANDLE,
) {
    unsafe { start_operation(state, session, mechanism, key, false) }
});

mock_fn!(state, fn C_Decrypt(
    session: CK_SESSION_HANDLE,
    encrypted_data: CK_BYTE_PTR,
    encrypted_data_len: CK_ULONG,
    data: CK_BYTE_PTR,
    data_len: CK_ULONG_PTR,
) {
    unsafe {
        run_operation(
            state,
            session,
            false,
            (encrypted_data, encrypted_data_len),
            (data, data_len),
        )
    }
});

/// The function table of the mock module
pub(crate) fn mock_lib() -> HsmLib {
    HsmLib {
        _library: None,
        usage: with_state(|state| Arc::clone(&state.usage)),
        C_Initialize: Some(C_Initialize),
        C_Finalize: Some(C_Finalize),
        C_GetInfo: Some(C_GetInfo),
        C_GetSlotList: Some(C_GetSlotList),
        C_OpenSession: Some(C_OpenSession),
        C_CloseSession: Some(C_CloseSession),
        C_Login: Some(C_Login),
        C_Logout: Some(C_Logout),
        C_CreateObject: Some(C_CreateObject),
        C_DestroyObject: Some(C_DestroyObject),
        C_FindObjectsInit: Some(C_FindObjectsInit),
        C_FindObjects: Some(C_FindObjects),
        C_FindObjectsFinal: Some(C_FindObjectsFinal),
        C_EncryptInit: Some(C_EncryptInit),
        C_Encrypt: Some(C_Encrypt),
        C_DecryptInit: Some(C_DecryptInit),
        C_Decrypt: Some(C_Decrypt),
    }
}

pub(crate) fn open_mock(pin: &str, capabilities: HsmCapabilities) -> HResult<HsmSession> {
    HsmSession::open_with_lib(mock_lib(), pin, SlotSelector::First, capabilities)
}

pub(crate) fn open_default() -> HResult<HsmSession> {
    open_mock(MOCK_PIN, DefaultCapabilityProvider::capabilities())
}
