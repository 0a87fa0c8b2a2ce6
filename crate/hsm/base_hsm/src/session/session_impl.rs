//! A single authenticated PKCS#11 session.
//!
//! [`HsmSession`] owns the loaded module, the session handle and the login
//! state. It is opened in one step (load, initialize, pick a slot, open a
//! serial read/write session, log in) and closed in one step (log out, close
//! the session, finalize). Any failure while opening tears down what was
//! already set up before the error is returned.
//!
//! Initialization and login belong to the module rather than to a session.
//! Sessions of the same module share them: only the first session initializes
//! and logs in, and only the last one to close logs out and finalizes.
//!
//! The handle is cheap to clone; clones share the same session and every
//! PKCS#11 call goes through one mutex, since a PKCS#11 session runs a single
//! operation at a time.

use std::{
    ffi::OsStr,
    fmt, ptr,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use cosmian_block_cipher::{AES_BLOCK_SIZE, AesKeySize};
use cosmian_logger::{debug, trace, warn};
use pkcs11_sys::{
    CK_ATTRIBUTE, CK_BBOOL, CK_FALSE, CK_INFO, CK_KEY_TYPE, CK_MECHANISM, CK_OBJECT_CLASS,
    CK_OBJECT_HANDLE, CK_SESSION_HANDLE, CK_SLOT_ID, CK_TRUE, CK_ULONG, CKA_CLASS, CKA_DECRYPT,
    CKA_ENCRYPT, CKA_ID, CKA_KEY_TYPE, CKA_LABEL, CKA_TOKEN, CKA_UNWRAP, CKA_VALUE, CKA_WRAP,
    CKF_RW_SESSION, CKF_SERIAL_SESSION, CKK_AES, CKO_SECRET_KEY, CKR_OK,
};
use zeroize::Zeroizing;

use crate::{
    HError, HResult, Info, SlotSelector,
    hsm_capabilities::HsmCapabilities,
    hsm_cipher::Mechanism,
    hsm_lib::{HsmLib, hsm_call, hsm_rv},
};

/// Distinguishes sessions even when a module reuses handle values
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Whether a created key object outlives the session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeyPersistence {
    /// Destroyed by the module when the session closes
    #[default]
    Session,
    /// Stored on the token
    Token,
}

/// A reference to a key object inside the HSM.
///
/// It is only valid with the session it was obtained from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyObjectHandle {
    handle: CK_OBJECT_HANDLE,
    session_id: u64,
}

impl KeyObjectHandle {
    #[must_use]
    pub const fn handle(&self) -> CK_OBJECT_HANDLE {
        self.handle
    }
}

/// What this context set up, so that teardown undoes exactly that.
struct SessionState {
    hsm: HsmLib,
    capabilities: HsmCapabilities,
    slot_id: CK_SLOT_ID,
    handle: Option<CK_SESSION_HANDLE>,
    /// Counted in the module usage
    registered: bool,
    logged_in: bool,
}

impl SessionState {
    fn session_handle(&self) -> HResult<CK_SESSION_HANDLE> {
        self.handle.ok_or(HError::SessionClosed)
    }

    /// Release the login, close the session and release the module. The
    /// module only logs out and finalizes when no other session of this
    /// process still relies on it. All steps are attempted; the first
    /// failure is returned.
    fn teardown(&mut self) -> HResult<()> {
        let mut result = Ok(());
        if let Some(handle) = self.handle.take() {
            if std::mem::take(&mut self.logged_in) {
                if let Err(e) = self.hsm.logout(handle, self.slot_id) {
                    warn!("session {handle}: {e}");
                    result = result.and(Err(e));
                }
            }
            if let Err(e) = self.close_session(handle) {
                warn!("session {handle}: {e}");
                result = result.and(Err(e));
            }
            debug!("session {handle} closed");
        }
        if std::mem::take(&mut self.registered) {
            if let Err(e) = self.hsm.release() {
                warn!("{e}");
                result = result.and(Err(e));
            }
        }
        result
    }

    fn close_session(&self, handle: CK_SESSION_HANDLE) -> HResult<()> {
        hsm_call!(self.hsm, "Failed closing a session", C_CloseSession, handle);
        Ok(())
    }

    /// A slot that refuses a session is reported as unavailable.
    fn open_session(&mut self) -> HResult<()> {
        let mut handle: CK_SESSION_HANDLE = 0;
        let rv = hsm_rv!(
            self.hsm,
            C_OpenSession,
            self.slot_id,
            CKF_SERIAL_SESSION | CKF_RW_SESSION,
            ptr::null_mut(),
            None,
            &raw mut handle
        );
        if rv != CKR_OK {
            return Err(HError::NoSlotsAvailable(format!(
                "failed opening a session on slot {} (CK_RV: {rv:#x})",
                self.slot_id
            )));
        }
        debug!("session {handle} opened on slot {}", self.slot_id);
        self.handle = Some(handle);
        Ok(())
    }

    fn login(&mut self, pin: &str) -> HResult<()> {
        let handle = self.session_handle()?;
        self.hsm.login(handle, self.slot_id, pin)?;
        self.logged_in = true;
        Ok(())
    }

    /// Run a `C_FindObjects` search; the search is always finalized.
    fn find_object_handles(
        &self,
        mut template: Vec<CK_ATTRIBUTE>,
    ) -> HResult<Vec<CK_OBJECT_HANDLE>> {
        let handle = self.session_handle()?;
        hsm_call!(
            self.hsm,
            "Failed to initialize object search: C_FindObjectsInit failed",
            C_FindObjectsInit,
            handle,
            template.as_mut_ptr(),
            CK_ULONG::try_from(template.len())?
        );
        let found = self.collect_found_objects(handle);
        hsm_call!(
            self.hsm,
            "Failed to finalize object search",
            C_FindObjectsFinal,
            handle
        );
        found
    }

    fn collect_found_objects(&self, handle: CK_SESSION_HANDLE) -> HResult<Vec<CK_OBJECT_HANDLE>> {
        let max_object_count = usize::try_from(self.capabilities.find_max_object_count)?.max(1);
        let mut handles_buf = vec![CK_OBJECT_HANDLE::default(); max_object_count];
        let mut object_handles = Vec::new();
        loop {
            let mut object_count: CK_ULONG = 0;
            hsm_call!(
                self.hsm,
                "Failed to find objects",
                C_FindObjects,
                handle,
                handles_buf.as_mut_ptr(),
                CK_ULONG::try_from(max_object_count)?,
                &raw mut object_count
            );
            if object_count == 0 {
                break;
            }
            trace!("found {object_count} objects");
            object_handles.extend_from_slice(
                handles_buf
                    .get(..usize::try_from(object_count)?)
                    .ok_or_else(|| {
                        HError::Default("More objects returned than requested".to_owned())
                    })?,
            );
        }
        Ok(object_handles)
    }
}

impl Drop for SessionState {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            warn!("failed closing the HSM session on drop: {e}");
        }
    }
}

fn bool_attribute(type_: pkcs11_sys::CK_ATTRIBUTE_TYPE, value: &CK_BBOOL) -> CK_ATTRIBUTE {
    CK_ATTRIBUTE {
        type_,
        pValue: ptr::from_ref(value).cast::<std::ffi::c_void>().cast_mut(),
        ulValueLen: 1,
    }
}

fn bytes_attribute(type_: pkcs11_sys::CK_ATTRIBUTE_TYPE, value: &[u8]) -> HResult<CK_ATTRIBUTE> {
    Ok(CK_ATTRIBUTE {
        type_,
        pValue: value.as_ptr().cast::<std::ffi::c_void>().cast_mut(),
        ulValueLen: CK_ULONG::try_from(value.len())?,
    })
}

fn ulong_attribute<T>(type_: pkcs11_sys::CK_ATTRIBUTE_TYPE, value: &T) -> HResult<CK_ATTRIBUTE> {
    Ok(CK_ATTRIBUTE {
        type_,
        pValue: ptr::from_ref(value).cast::<std::ffi::c_void>().cast_mut(),
        ulValueLen: CK_ULONG::try_from(size_of::<T>())?,
    })
}

fn ck_bool(value: bool) -> HResult<CK_BBOOL> {
    let value = if value { CK_TRUE } else { CK_FALSE };
    CK_BBOOL::try_from(value).map_err(|e| HError::Default(format!("invalid CK_BBOOL: {e}")))
}

/// An open, authenticated session with a PKCS#11 module.
#[derive(Clone)]
pub struct HsmSession {
    id: u64,
    state: Arc<Mutex<SessionState>>,
}

impl HsmSession {
    /// Open a session with the default capabilities.
    ///
    /// Fails with `ModuleLoad` when the module cannot be loaded or
    /// initialized, `NoSlotsAvailable` when no slot matches `slot` or the
    /// slot refuses a session, and `Authentication` when the login fails.
    pub fn open<P: AsRef<OsStr>>(module_path: P, pin: &str, slot: SlotSelector) -> HResult<Self> {
        Self::open_with_capabilities(module_path, pin, slot, HsmCapabilities::default())
    }

    pub fn open_with_capabilities<P: AsRef<OsStr>>(
        module_path: P,
        pin: &str,
        slot: SlotSelector,
        capabilities: HsmCapabilities,
    ) -> HResult<Self> {
        let hsm = HsmLib::instantiate(module_path)?;
        Self::open_with_lib(hsm, pin, slot, capabilities)
    }

    pub(crate) fn open_with_lib(
        hsm: HsmLib,
        pin: &str,
        slot: SlotSelector,
        capabilities: HsmCapabilities,
    ) -> HResult<Self> {
        debug!("opening an HSM session with {capabilities:?}");
        hsm.acquire()?;
        // from here on, dropping `state` on an error undoes the steps taken
        let mut state = SessionState {
            hsm,
            capabilities,
            slot_id: CK_SLOT_ID::default(),
            handle: None,
            registered: true,
            logged_in: false,
        };
        state.slot_id = slot.resolve(&state.hsm)?;
        state.open_session()?;
        state.login(pin)?;

        Ok(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            state: Arc::new(Mutex::new(state)),
        })
    }

    fn lock(&self) -> HResult<MutexGuard<'_, SessionState>> {
        self.state
            .lock()
            .map_err(|e| HError::Default(format!("Failed to acquire the session lock: {e}")))
    }

    /// Lock the session, checking it is open and `key` belongs to it.
    fn lock_for(&self, key: &KeyObjectHandle) -> HResult<MutexGuard<'_, SessionState>> {
        if key.session_id != self.id {
            return Err(HError::SessionClosed);
        }
        let state = self.lock()?;
        state.session_handle()?;
        Ok(state)
    }

    /// Close the session.
    ///
    /// The last session of this process on the module also logs out and
    /// finalizes it; other open sessions keep working. Closing an already
    /// closed session succeeds. Every clone of this handle sees the session
    /// closed afterwards.
    pub fn close(&self) -> HResult<()> {
        self.lock()?.teardown()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.lock()
            .map(|state| state.handle.is_some())
            .unwrap_or(false)
    }

    pub fn slot_id(&self) -> HResult<CK_SLOT_ID> {
        Ok(self.lock()?.slot_id)
    }

    /// General information about the loaded module
    pub fn get_info(&self) -> HResult<Info> {
        let state = self.lock()?;
        state.session_handle()?;
        let mut info = CK_INFO::default();
        hsm_call!(
            state.hsm,
            "Failed getting HSM info",
            C_GetInfo,
            &raw mut info
        );
        Ok(info.into())
    }

    /// Locate the single secret key whose identifier attribute is `identifier`.
    ///
    /// The attribute is `CKA_ID` unless the capabilities select `CKA_LABEL`.
    pub fn find_key(&self, identifier: &[u8]) -> HResult<KeyObjectHandle> {
        let state = self.lock()?;
        let key_class: CK_OBJECT_CLASS = CKO_SECRET_KEY;
        let template = vec![
            ulong_attribute(CKA_CLASS, &key_class)?,
            bytes_attribute(
                state.capabilities.key_identifier.attribute_type(),
                identifier,
            )?,
        ];
        let handles = state.find_object_handles(template)?;
        let shown = String::from_utf8_lossy(identifier).into_owned();
        match handles.as_slice() {
            [] => Err(HError::KeyNotFound(shown)),
            [handle] => {
                debug!("key {shown} found: handle {handle}");
                Ok(KeyObjectHandle {
                    handle: *handle,
                    session_id: self.id,
                })
            }
            _ => Err(HError::AmbiguousKeyIdentifier {
                identifier: shown,
                count: handles.len(),
            }),
        }
    }

    /// Import a raw AES key as a secret key object usable for
    /// encryption, decryption, wrapping and unwrapping.
    ///
    /// `identifier` is set as both `CKA_ID` and `CKA_LABEL`.
    pub fn create_aes_key(
        &self,
        identifier: &[u8],
        value: &[u8],
        persistence: KeyPersistence,
    ) -> HResult<KeyObjectHandle> {
        AesKeySize::try_from_key_len(value.len())?;
        let state = self.lock()?;
        let session_handle = state.session_handle()?;

        let key_class: CK_OBJECT_CLASS = CKO_SECRET_KEY;
        let key_type: CK_KEY_TYPE = CKK_AES;
        let enabled = ck_bool(true)?;
        let on_token = ck_bool(persistence == KeyPersistence::Token)?;
        let value = Zeroizing::new(value.to_vec());
        let mut template = vec![
            ulong_attribute(CKA_CLASS, &key_class)?,
            ulong_attribute(CKA_KEY_TYPE, &key_type)?,
            bool_attribute(CKA_TOKEN, &on_token),
            bytes_attribute(CKA_LABEL, identifier)?,
            bytes_attribute(CKA_ID, identifier)?,
            bool_attribute(CKA_ENCRYPT, &enabled),
            bool_attribute(CKA_DECRYPT, &enabled),
            bool_attribute(CKA_WRAP, &enabled),
            bool_attribute(CKA_UNWRAP, &enabled),
            bytes_attribute(CKA_VALUE, &value)?,
        ];
        let mut handle = CK_OBJECT_HANDLE::default();
        hsm_call!(
            state.hsm,
            "Failed creating an AES key object",
            C_CreateObject,
            session_handle,
            template.as_mut_ptr(),
            CK_ULONG::try_from(template.len())?,
            &raw mut handle
        );
        debug!(
            "AES key {} created: handle {handle}, {persistence:?} object",
            String::from_utf8_lossy(identifier)
        );
        Ok(KeyObjectHandle {
            handle,
            session_id: self.id,
        })
    }

    pub fn destroy_key(&self, key: &KeyObjectHandle) -> HResult<()> {
        let state = self.lock_for(key)?;
        hsm_call!(
            state.hsm,
            "Failed to destroy object",
            C_DestroyObject,
            state.session_handle()?,
            key.handle
        );
        Ok(())
    }

    pub(crate) fn check_key(&self, key: &KeyObjectHandle) -> HResult<()> {
        self.lock_for(key).map(|_state| ())
    }

    /// Encrypt or decrypt one block with `key` under `mechanism`.
    pub(crate) fn transform_block(
        &self,
        key: &KeyObjectHandle,
        mechanism: Mechanism,
        encrypt: bool,
        input: &[u8; AES_BLOCK_SIZE],
    ) -> HResult<[u8; AES_BLOCK_SIZE]> {
        let state = self.lock_for(key)?;
        let session_handle = state.session_handle()?;
        let mut ck_mechanism = CK_MECHANISM {
            mechanism: mechanism.ck_type(),
            pParameter: ptr::null_mut(),
            ulParameterLen: 0,
        };
        let mut input = *input;
        let mut output = [0_u8; AES_BLOCK_SIZE];
        let mut output_len = CK_ULONG::try_from(AES_BLOCK_SIZE)?;
        let input_len = CK_ULONG::try_from(AES_BLOCK_SIZE)?;
        if encrypt {
            hsm_call!(
                state.hsm,
                "Failed to initialize encryption",
                C_EncryptInit,
                session_handle,
                &raw mut ck_mechanism,
                key.handle
            );
            hsm_call!(
                state.hsm,
                "Failed to encrypt data",
                C_Encrypt,
                session_handle,
                input.as_mut_ptr(),
                input_len,
                output.as_mut_ptr(),
                &raw mut output_len
            );
        } else {
            hsm_call!(
                state.hsm,
                "Failed to initialize decryption",
                C_DecryptInit,
                session_handle,
                &raw mut ck_mechanism,
                key.handle
            );
            hsm_call!(
                state.hsm,
                "Failed to decrypt data",
                C_Decrypt,
                session_handle,
                input.as_mut_ptr(),
                input_len,
                output.as_mut_ptr(),
                &raw mut output_len
            );
        }
        if usize::try_from(output_len)? != AES_BLOCK_SIZE {
            return Err(HError::Pkcs11 {
                message: format!(
                    "{} returned {output_len} bytes instead of one {AES_BLOCK_SIZE} bytes block",
                    if encrypt { "C_Encrypt" } else { "C_Decrypt" }
                ),
                rv: CKR_OK,
            });
        }
        Ok(output)
    }
}

impl fmt::Debug for HsmSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HsmSession")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

