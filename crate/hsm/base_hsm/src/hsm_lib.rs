use std::{
    collections::{HashMap, hash_map::Entry},
    ffi::OsStr,
    fs,
    path::PathBuf,
    ptr,
    sync::{Arc, LazyLock, Mutex, MutexGuard, Weak},
};

use cosmian_logger::{debug, warn};
use libloading::Library;
use pkcs11_sys::{
    CK_C_CloseSession, CK_C_CreateObject, CK_C_Decrypt, CK_C_DecryptInit, CK_C_DestroyObject,
    CK_C_Encrypt, CK_C_EncryptInit, CK_C_Finalize, CK_C_FindObjects, CK_C_FindObjectsFinal,
    CK_C_FindObjectsInit, CK_C_GetInfo, CK_C_GetSlotList, CK_C_INITIALIZE_ARGS, CK_C_Initialize,
    CK_C_Login, CK_C_Logout, CK_C_OpenSession, CK_SESSION_HANDLE, CK_SLOT_ID, CK_ULONG,
    CK_UTF8CHAR_PTR, CKF_OS_LOCKING_OK, CKR_CRYPTOKI_ALREADY_INITIALIZED, CKR_OK,
    CKR_USER_ALREADY_LOGGED_IN, CKU_USER,
};
use zeroize::Zeroizing;

use crate::{HError, HResult};

/// Call a PKCS#11 function of an [`HsmLib`] and evaluate to its `CK_RV`.
///
/// Returns early with an error when the library does not provide the function.
macro_rules! hsm_rv {
    ($hsm:expr, $function:ident $(, $arg:expr)* $(,)?) => {{
        let function = $hsm.$function.ok_or_else(|| {
            $crate::HError::Default(format!(
                "{} not available on library",
                stringify!($function)
            ))
        })?;
        #[expect(unsafe_code)]
        let rv = unsafe { function($($arg),*) };
        rv
    }};
}

/// Call a PKCS#11 function of an [`HsmLib`] and return early with
/// [`HError::Pkcs11`] unless it answers `CKR_OK`.
macro_rules! hsm_call {
    ($hsm:expr, $message:expr, $function:ident $(, $arg:expr)* $(,)?) => {{
        let rv = $crate::hsm_lib::hsm_rv!($hsm, $function $(, $arg)*);
        if rv != ::pkcs11_sys::CKR_OK {
            return Err($crate::HError::Pkcs11 {
                message: ::std::string::ToString::to_string(&$message),
                rv,
            });
        }
    }};
}

pub(crate) use hsm_call;
pub(crate) use hsm_rv;

/// What the sessions of this process did to one module.
///
/// Initialization and login are process wide in PKCS#11, so every session
/// opened on a module shares this record: the first session performs them and
/// the last one to close undoes them.
#[derive(Debug, Default)]
pub(crate) struct ModuleUsage {
    /// Sessions relying on the module being initialized
    sessions: usize,
    /// Whether `C_Initialize` was run by one of those sessions
    owns_initialization: bool,
    logins: HashMap<CK_SLOT_ID, SlotLogin>,
}

#[derive(Debug)]
struct SlotLogin {
    sessions: usize,
    /// `false` when the user was already logged in by someone else
    owned: bool,
}

pub(crate) type SharedModuleUsage = Arc<Mutex<ModuleUsage>>;

/// Usage of the modules loaded from a path, keyed by the canonical path
static MODULES: LazyLock<Mutex<HashMap<PathBuf, Weak<Mutex<ModuleUsage>>>>> =
    LazyLock::new(Mutex::default);

fn module_usage(path: &OsStr) -> HResult<SharedModuleUsage> {
    let key = fs::canonicalize(path).unwrap_or_else(|_e| PathBuf::from(path));
    let mut modules = MODULES
        .lock()
        .map_err(|e| HError::Default(format!("Failed to acquire the module registry lock: {e}")))?;
    modules.retain(|_, usage| usage.strong_count() > 0);
    if let Some(usage) = modules.get(&key).and_then(Weak::upgrade) {
        return Ok(usage);
    }
    let usage = SharedModuleUsage::default();
    modules.insert(key, Arc::downgrade(&usage));
    Ok(usage)
}

/// The PKCS#11 functions of a loaded module.
///
/// The module stays loaded as long as this value lives. Initialization and
/// login go through the [`ModuleUsage`] shared by every `HsmLib` of the same
/// module, since another session of the process may already rely on them.
#[allow(non_snake_case)]
pub(crate) struct HsmLib {
    /// `None` for a module linked in-process
    pub(crate) _library: Option<Library>,
    pub(crate) usage: SharedModuleUsage,
    pub(crate) C_Initialize: CK_C_Initialize,
    pub(crate) C_Finalize: CK_C_Finalize,
    pub(crate) C_GetInfo: CK_C_GetInfo,
    pub(crate) C_GetSlotList: CK_C_GetSlotList,

    pub(crate) C_OpenSession: CK_C_OpenSession,
    pub(crate) C_CloseSession: CK_C_CloseSession,
    pub(crate) C_Login: CK_C_Login,
    pub(crate) C_Logout: CK_C_Logout,

    pub(crate) C_CreateObject: CK_C_CreateObject,
    pub(crate) C_DestroyObject: CK_C_DestroyObject,
    pub(crate) C_FindObjectsInit: CK_C_FindObjectsInit,
    pub(crate) C_FindObjects: CK_C_FindObjects,
    pub(crate) C_FindObjectsFinal: CK_C_FindObjectsFinal,

    pub(crate) C_EncryptInit: CK_C_EncryptInit,
    pub(crate) C_Encrypt: CK_C_Encrypt,
    pub(crate) C_DecryptInit: CK_C_DecryptInit,
    pub(crate) C_Decrypt: CK_C_Decrypt,
}

fn symbol<T: Copy>(library: &Library, name: &str) -> HResult<T> {
    // SAFETY: `T` is the PKCS#11 prototype of the exported function `name`
    #[expect(unsafe_code)]
    let function = unsafe { library.get::<T>(name.as_bytes()) }
        .map_err(|e| HError::ModuleLoad(format!("missing symbol {name}: {e}")))?;
    Ok(*function)
}

impl HsmLib {
    /// Load the PKCS#11 module at `path` and resolve the functions used by
    /// the sessions of this crate.
    pub(crate) fn instantiate<P>(path: P) -> HResult<Self>
    where
        P: AsRef<OsStr>,
    {
        let path = path.as_ref();
        // SAFETY: loading a PKCS#11 module runs its initialization routines,
        // which is the expected way of using it
        #[expect(unsafe_code)]
        let library = unsafe { Library::new(path) }
            .map_err(|e| HError::ModuleLoad(format!("{}: {e}", path.to_string_lossy())))?;
        debug!("loaded PKCS#11 module {}", path.to_string_lossy());
        Ok(Self {
            usage: module_usage(path)?,
            C_Initialize: Some(symbol(&library, "C_Initialize")?),
            C_Finalize: Some(symbol(&library, "C_Finalize")?),
            C_GetInfo: Some(symbol(&library, "C_GetInfo")?),
            C_GetSlotList: Some(symbol(&library, "C_GetSlotList")?),
            C_OpenSession: Some(symbol(&library, "C_OpenSession")?),
            C_CloseSession: Some(symbol(&library, "C_CloseSession")?),
            C_Login: Some(symbol(&library, "C_Login")?),
            C_Logout: Some(symbol(&library, "C_Logout")?),
            C_CreateObject: Some(symbol(&library, "C_CreateObject")?),
            C_DestroyObject: Some(symbol(&library, "C_DestroyObject")?),
            C_FindObjectsInit: Some(symbol(&library, "C_FindObjectsInit")?),
            C_FindObjects: Some(symbol(&library, "C_FindObjects")?),
            C_FindObjectsFinal: Some(symbol(&library, "C_FindObjectsFinal")?),
            C_EncryptInit: Some(symbol(&library, "C_EncryptInit")?),
            C_Encrypt: Some(symbol(&library, "C_Encrypt")?),
            C_DecryptInit: Some(symbol(&library, "C_DecryptInit")?),
            C_Decrypt: Some(symbol(&library, "C_Decrypt")?),
            // we need to keep the library alive
            _library: Some(library),
        })
    }

    fn lock_usage(&self) -> HResult<MutexGuard<'_, ModuleUsage>> {
        self.usage
            .lock()
            .map_err(|e| HError::Default(format!("Failed to acquire the module usage lock: {e}")))
    }

    /// Register a session on the module. The first one initializes it.
    pub(crate) fn acquire(&self) -> HResult<()> {
        let mut usage = self.lock_usage()?;
        if usage.sessions == 0 {
            usage.owns_initialization = self.initialize()?;
        }
        usage.sessions += 1;
        Ok(())
    }

    /// Unregister a session. The last one finalizes the module, unless it
    /// was initialized outside this crate.
    pub(crate) fn release(&self) -> HResult<()> {
        let mut usage = self.lock_usage()?;
        usage.sessions = usage.sessions.saturating_sub(1);
        if usage.sessions == 0 && std::mem::take(&mut usage.owns_initialization) {
            self.finalize()?;
        }
        Ok(())
    }

    /// Log the user in on `slot_id` through `session`, unless another
    /// session of this process already did.
    pub(crate) fn login(
        &self,
        session: CK_SESSION_HANDLE,
        slot_id: CK_SLOT_ID,
        pin: &str,
    ) -> HResult<()> {
        let mut usage = self.lock_usage()?;
        let login = match usage.logins.entry(slot_id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let owned = self.user_login(session, slot_id, pin)?;
                entry.insert(SlotLogin { sessions: 0, owned })
            }
        };
        login.sessions += 1;
        Ok(())
    }

    /// Release the login of one session on `slot_id`. The last session logs
    /// out through `session`, which must still be open.
    pub(crate) fn logout(&self, session: CK_SESSION_HANDLE, slot_id: CK_SLOT_ID) -> HResult<()> {
        let mut usage = self.lock_usage()?;
        let Entry::Occupied(mut entry) = usage.logins.entry(slot_id) else {
            return Ok(());
        };
        let login = entry.get_mut();
        login.sessions = login.sessions.saturating_sub(1);
        if login.sessions > 0 {
            return Ok(());
        }
        if entry.remove().owned {
            hsm_call!(self, "Failed logging out", C_Logout, session);
        }
        Ok(())
    }

    fn user_login(
        &self,
        session: CK_SESSION_HANDLE,
        slot_id: CK_SLOT_ID,
        pin: &str,
    ) -> HResult<bool> {
        let mut pin = Zeroizing::new(pin.as_bytes().to_vec());
        let pin_len = CK_ULONG::try_from(pin.len())?;
        let rv = hsm_rv!(
            self,
            C_Login,
            session,
            CKU_USER,
            pin.as_mut_ptr() as CK_UTF8CHAR_PTR,
            pin_len
        );
        match rv {
            CKR_OK => Ok(true),
            CKR_USER_ALREADY_LOGGED_IN => {
                warn!("user already logged in on slot {slot_id}, ignoring login");
                Ok(false)
            }
            rv => Err(HError::Authentication(format!(
                "C_Login failed on slot {slot_id} (CK_RV: {rv:#x})"
            ))),
        }
    }

    /// Initialize the module with OS locking.
    ///
    /// Returns `false` when the module had already been initialized by
    /// someone else in this process: it must then not be finalized.
    fn initialize(&self) -> HResult<bool> {
        let mut init_args = CK_C_INITIALIZE_ARGS {
            CreateMutex: None,
            DestroyMutex: None,
            LockMutex: None,
            UnlockMutex: None,
            flags: CKF_OS_LOCKING_OK,
            pReserved: ptr::null_mut(),
        };
        let rv = hsm_rv!(
            self,
            C_Initialize,
            (&raw mut init_args).cast::<std::ffi::c_void>()
        );
        match rv {
            CKR_OK => Ok(true),
            CKR_CRYPTOKI_ALREADY_INITIALIZED => {
                warn!("the PKCS#11 module was already initialized, it will not be finalized");
                Ok(false)
            }
            rv => Err(HError::ModuleLoad(format!(
                "C_Initialize failed (CK_RV: {rv:#x})"
            ))),
        }
    }

    fn finalize(&self) -> HResult<()> {
        hsm_call!(
            self,
            "Failed to finalize the PKCS#11 module",
            C_Finalize,
            ptr::null_mut()
        );
        Ok(())
    }
}
