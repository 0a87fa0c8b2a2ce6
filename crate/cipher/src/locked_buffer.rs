//! Memory regions pinned in RAM and erased on release.
//!
//! A [`LockedBuffer`] is backed by its own anonymous private mapping:
//! - the pages are locked with `mlock` so they are never written to swap,
//! - on Linux they are excluded from core dumps,
//! - `destroy` overwrites every byte with zeros, unlocks the pages and makes
//!   them inaccessible; the mapping itself is returned to the OS on drop.
//!
//! Dropping a buffer that was never destroyed destroys it first, so every
//! exit path of the code owning a buffer erases it.

use std::{fmt, io, ptr, ptr::NonNull, slice};

use cosmian_logger::{trace, warn};
use zeroize::Zeroize;

use crate::{CResult, CipherError};

/// Protection state of a [`LockedBuffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionState {
    /// Pinned, readable and writable
    Locked,
    /// Zeroed, unpinned and inaccessible
    Destroyed,
}

pub struct LockedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    mapped_len: usize,
    state: ProtectionState,
}

// The buffer exclusively owns its mapping; shared access only ever reads it.
#[expect(unsafe_code)]
unsafe impl Send for LockedBuffer {}
#[expect(unsafe_code)]
unsafe impl Sync for LockedBuffer {}

fn page_size() -> CResult<usize> {
    #[expect(unsafe_code)]
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(page_size)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| CipherError::AllocationError("cannot determine the page size".to_owned()))
}

impl LockedBuffer {
    /// Reserve `size` bytes of pinned, zero-initialized memory.
    ///
    /// Fails with [`CipherError::AllocationError`] when the pages cannot be
    /// mapped or locked, typically because `RLIMIT_MEMLOCK` is exhausted.
    pub fn allocate(size: usize) -> CResult<Self> {
        let page_size = page_size()?;
        let mapped_len = size
            .max(1)
            .div_ceil(page_size)
            .checked_mul(page_size)
            .ok_or_else(|| {
                CipherError::AllocationError(format!("{size} bytes is too large to be locked"))
            })?;

        #[expect(unsafe_code)]
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapped_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(CipherError::AllocationError(format!(
                "mmap of {mapped_len} bytes failed: {}",
                io::Error::last_os_error()
            )));
        }

        #[expect(unsafe_code)]
        let rv = unsafe { libc::mlock(addr, mapped_len) };
        if rv != 0 {
            let err = io::Error::last_os_error();
            #[expect(unsafe_code)]
            let _unmapped = unsafe { libc::munmap(addr, mapped_len) };
            return Err(CipherError::AllocationError(format!(
                "mlock of {mapped_len} bytes failed: {err}"
            )));
        }

        #[cfg(target_os = "linux")]
        {
            #[expect(unsafe_code)]
            let rv = unsafe { libc::madvise(addr, mapped_len, libc::MADV_DONTDUMP) };
            if rv != 0 {
                trace!(
                    "locked buffer: MADV_DONTDUMP not applied: {}",
                    io::Error::last_os_error()
                );
            }
        }

        let Some(ptr) = NonNull::new(addr.cast::<u8>()) else {
            #[expect(unsafe_code)]
            let _unmapped = unsafe {
                libc::munlock(addr, mapped_len);
                libc::munmap(addr, mapped_len)
            };
            return Err(CipherError::AllocationError(
                "mmap returned a null address".to_owned(),
            ));
        };

        trace!("locked buffer: allocated {size} bytes ({mapped_len} bytes mapped)");
        Ok(Self {
            ptr,
            len: size,
            mapped_len,
            state: ProtectionState::Locked,
        })
    }

    /// Number of usable bytes
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn state(&self) -> ProtectionState {
        self.state
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.state == ProtectionState::Destroyed
    }

    /// Copy `data` into the buffer; `data` must fill it exactly.
    pub fn write(&mut self, data: &[u8]) -> CResult<()> {
        let len = self.len;
        let bytes = self.view_mut()?;
        if data.len() != len {
            return Err(CipherError::SizeMismatch {
                expected: len,
                actual: data.len(),
            });
        }
        bytes.copy_from_slice(data);
        Ok(())
    }

    /// Borrow the protected bytes without copying them out.
    pub fn view(&self) -> CResult<&[u8]> {
        if self.is_destroyed() {
            return Err(CipherError::AlreadyDestroyed);
        }
        // SAFETY: the mapping is live, readable and at least `len` bytes long
        #[expect(unsafe_code)]
        let bytes = unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) };
        Ok(bytes)
    }

    /// Mutably borrow the protected bytes, e.g. as the output of a key derivation.
    pub fn view_mut(&mut self) -> CResult<&mut [u8]> {
        if self.is_destroyed() {
            return Err(CipherError::AlreadyDestroyed);
        }
        // SAFETY: the mapping is live, writable, at least `len` bytes long
        // and exclusively borrowed through `&mut self`
        #[expect(unsafe_code)]
        let bytes = unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) };
        Ok(bytes)
    }

    /// Zero the whole region, unpin it and revoke access to it.
    ///
    /// Destroying twice is a programming error reported as
    /// [`CipherError::AlreadyDestroyed`].
    pub fn destroy(&mut self) -> CResult<()> {
        if self.is_destroyed() {
            return Err(CipherError::AlreadyDestroyed);
        }
        self.state = ProtectionState::Destroyed;

        // SAFETY: the mapping is still readable and writable at this point
        #[expect(unsafe_code)]
        let mapping = unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.mapped_len) };
        mapping.zeroize();

        let addr = self.ptr.as_ptr().cast::<libc::c_void>();
        #[expect(unsafe_code)]
        let rv = unsafe { libc::munlock(addr, self.mapped_len) };
        if rv != 0 {
            warn!(
                "locked buffer: munlock failed after zeroization: {}",
                io::Error::last_os_error()
            );
        }
        #[expect(unsafe_code)]
        let rv = unsafe { libc::mprotect(addr, self.mapped_len, libc::PROT_NONE) };
        if rv != 0 {
            warn!(
                "locked buffer: mprotect failed after zeroization: {}",
                io::Error::last_os_error()
            );
        }
        trace!("locked buffer: destroyed {} bytes", self.len);
        Ok(())
    }

    /// Read back the whole mapping, including a destroyed one.
    #[cfg(test)]
    pub(crate) fn is_zeroed(&self) -> bool {
        let addr = self.ptr.as_ptr().cast::<libc::c_void>();
        #[expect(unsafe_code)]
        let zeroed = unsafe {
            if self.is_destroyed() {
                libc::mprotect(addr, self.mapped_len, libc::PROT_READ);
            }
            let zeroed = slice::from_raw_parts(self.ptr.as_ptr(), self.mapped_len)
                .iter()
                .all(|b| *b == 0);
            if self.is_destroyed() {
                libc::mprotect(addr, self.mapped_len, libc::PROT_NONE);
            }
            zeroed
        };
        zeroed
    }
}

impl Drop for LockedBuffer {
    fn drop(&mut self) {
        if !self.is_destroyed() {
            if let Err(e) = self.destroy() {
                warn!("locked buffer: failed destroying on drop: {e}");
            }
        }
        #[expect(unsafe_code)]
        let rv = unsafe { libc::munmap(self.ptr.as_ptr().cast::<libc::c_void>(), self.mapped_len) };
        if rv != 0 {
            warn!("locked buffer: munmap failed: {}", io::Error::last_os_error());
        }
    }
}

impl fmt::Debug for LockedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedBuffer")
            .field("len", &self.len)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::{LockedBuffer, ProtectionState};
    use crate::CipherError;

    #[test]
    fn allocate_is_zero_initialized() {
        let buffer = LockedBuffer::allocate(176).unwrap();
        assert_eq!(buffer.len(), 176);
        assert_eq!(buffer.state(), ProtectionState::Locked);
        assert!(buffer.view().unwrap().iter().all(|b| *b == 0));
    }

    #[test]
    fn allocate_then_destroy_leaves_zeros() {
        let mut buffer = LockedBuffer::allocate(64).unwrap();
        buffer.destroy().unwrap();
        assert!(buffer.is_destroyed());
        assert!(buffer.is_zeroed());
    }

    #[test]
    fn write_then_destroy_erases_content() {
        let mut buffer = LockedBuffer::allocate(32).unwrap();
        buffer.write(&[0xA5; 32]).unwrap();
        assert_eq!(buffer.view().unwrap(), &[0xA5; 32]);
        assert!(!buffer.is_zeroed());
        buffer.destroy().unwrap();
        assert!(buffer.is_zeroed());
    }

    #[test]
    fn write_rejects_size_mismatch() {
        let mut buffer = LockedBuffer::allocate(16).unwrap();
        let err = buffer.write(&[1; 15]).unwrap_err();
        assert!(matches!(
            err,
            CipherError::SizeMismatch {
                expected: 16,
                actual: 15
            }
        ));
        let err = buffer.write(&[1; 17]).unwrap_err();
        assert!(matches!(err, CipherError::SizeMismatch { .. }));
    }

    #[test]
    fn double_destroy_is_reported() {
        let mut buffer = LockedBuffer::allocate(16).unwrap();
        buffer.destroy().unwrap();
        assert!(matches!(
            buffer.destroy().unwrap_err(),
            CipherError::AlreadyDestroyed
        ));
    }

    #[test]
    fn destroyed_buffer_is_unusable() {
        let mut buffer = LockedBuffer::allocate(16).unwrap();
        buffer.destroy().unwrap();
        assert!(matches!(
            buffer.view().unwrap_err(),
            CipherError::AlreadyDestroyed
        ));
        assert!(matches!(
            buffer.view_mut().unwrap_err(),
            CipherError::AlreadyDestroyed
        ));
        assert!(matches!(
            buffer.write(&[0; 16]).unwrap_err(),
            CipherError::AlreadyDestroyed
        ));
    }

    #[test]
    fn empty_buffer() {
        let mut buffer = LockedBuffer::allocate(0).unwrap();
        assert!(buffer.is_empty());
        buffer.write(&[]).unwrap();
        buffer.destroy().unwrap();
    }

    #[test]
    fn buffer_spanning_several_pages() {
        let mut buffer = LockedBuffer::allocate(3 * 4096 + 5).unwrap();
        buffer.view_mut().unwrap().fill(0x42);
        buffer.destroy().unwrap();
        assert!(buffer.is_zeroed());
    }
}
