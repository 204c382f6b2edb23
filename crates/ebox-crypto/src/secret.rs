//! Secret-memory buffers.
//!
//! Every key, share, token, and recovered plaintext in the ebox model lives
//! in a [`SecretBuf`]: a fixed-capacity byte buffer that is zeroized before
//! its memory is released, locked against swap with `mlock(2)`, and (on
//! Linux) excluded from core dumps with `madvise(MADV_DONTDUMP)`. The
//! syscalls are best-effort; failures are logged and never fatal, since an
//! unprivileged process may exceed `RLIMIT_MEMLOCK`.

#![allow(unsafe_code)]

use crate::errors::{CryptoError, Result};
use rand::RngCore;
use tracing::warn;
use zeroize::Zeroize;

/// A byte buffer holding secret material.
///
/// The buffer never reallocates, so the locked region stays valid for the
/// lifetime of the value.
pub struct SecretBuf {
    bytes: Box<[u8]>,
}

impl SecretBuf {
    /// Take ownership of `bytes` as secret material.
    ///
    /// The source vector's memory is moved, not copied, so no unprotected
    /// copy of the secret is left behind by this constructor itself.
    pub fn new(bytes: Vec<u8>) -> Self {
        let buf = Self {
            bytes: bytes.into_boxed_slice(),
        };
        buf.protect();
        buf
    }

    /// Copy `bytes` into a fresh secret buffer.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }

    /// Allocate `len` bytes of secret memory filled from the system CSPRNG.
    pub fn random(len: usize) -> Result<Self> {
        let mut bytes = vec![0u8; len];
        rand::thread_rng()
            .try_fill_bytes(&mut bytes)
            .map_err(|e| CryptoError::RandomFailed(e.to_string()))?;
        Ok(Self::new(bytes))
    }

    /// View the secret bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn protect(&self) {
        if self.bytes.is_empty() {
            return;
        }
        let ptr = self.bytes.as_ptr() as *const libc::c_void;
        let len = self.bytes.len();
        // SAFETY: ptr/len describe a live allocation owned by self.bytes.
        let rc = unsafe { libc::mlock(ptr, len) };
        if rc != 0 {
            warn!(
                error = %std::io::Error::last_os_error(),
                "mlock failed; secret memory may be swapped"
            );
        }
        #[cfg(target_os = "linux")]
        {
            // madvise operates on whole pages; round the range outward.
            let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
            let addr = ptr as usize & !(page - 1);
            let span = (ptr as usize + len).div_ceil(page) * page - addr;
            let rc = unsafe {
                libc::madvise(addr as *mut libc::c_void, span, libc::MADV_DONTDUMP)
            };
            if rc != 0 {
                warn!(
                    error = %std::io::Error::last_os_error(),
                    "madvise(MADV_DONTDUMP) failed"
                );
            }
        }
    }
}

impl Drop for SecretBuf {
    fn drop(&mut self) {
        self.bytes.zeroize();
        if !self.bytes.is_empty() {
            let ptr = self.bytes.as_ptr() as *const libc::c_void;
            // SAFETY: same allocation that protect() locked.
            unsafe {
                libc::munlock(ptr, self.bytes.len());
            }
        }
    }
}

impl Clone for SecretBuf {
    fn clone(&self) -> Self {
        Self::from_slice(&self.bytes)
    }
}

impl PartialEq for SecretBuf {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for SecretBuf {}

impl std::fmt::Debug for SecretBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Contents are never printed.
        write!(f, "SecretBuf({} bytes)", self.bytes.len())
    }
}
