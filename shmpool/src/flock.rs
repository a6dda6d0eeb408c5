//! Advisory file locks over group metadata files.

use std::fs::File;
use std::os::fd::AsRawFd;

use nix::errno::Errno;

use crate::error::{PoolError, Result};

/// Advisory lock held for the guard's lifetime, released on drop so error
/// paths unwind cleanly.
pub(crate) struct FlockGuard<'a> {
    file: &'a File,
}

impl<'a> FlockGuard<'a> {
    pub(crate) fn exclusive(file: &'a File) -> Result<FlockGuard<'a>> {
        Self::lock(file, libc::LOCK_EX)
    }

    pub(crate) fn shared(file: &'a File) -> Result<FlockGuard<'a>> {
        Self::lock(file, libc::LOCK_SH)
    }

    fn lock(file: &'a File, op: libc::c_int) -> Result<FlockGuard<'a>> {
        Errno::result(unsafe { libc::flock(file.as_raw_fd(), op) })
            .map_err(|e| PoolError::system("flock", e))?;
        Ok(FlockGuard { file })
    }
}

impl Drop for FlockGuard<'_> {
    fn drop(&mut self) {
        let _ = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
    }
}
