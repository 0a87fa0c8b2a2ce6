mod session_impl;

pub use session_impl::{HsmSession, KeyObjectHandle, KeyPersistence};
