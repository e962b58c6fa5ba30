//! Exclusive directory lock so only one process opens a memory store.
//!
//! The lock lives in `<dir>/kyromem.lock` and is held for the lifetime of the
//! [`FileLock`]; closing the file releases it.

use std::fs::{File, OpenOptions};
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};

/// Name of the lock file inside the store directory.
pub const LOCK_FILE: &str = "kyromem.lock";

/// Held exclusive lock on a store directory.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Takes the lock without blocking.
    ///
    /// # Errors
    /// - `ErrorKind::WouldBlock` if another process holds the lock
    /// - any I/O error from creating the lock file
    pub fn acquire(dir: &Path) -> IoResult<Self> {
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        Self::try_lock(&file)?;
        tracing::debug!(path = %path.display(), "acquired store lock");

        Ok(Self { _file: file, path })
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> IoResult<()> {
        use std::os::unix::io::AsRawFd;

        // SAFETY: the descriptor is owned by `file`, which outlives this call.
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = IoError::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Err(IoError::new(
                    ErrorKind::WouldBlock,
                    "memory store is locked by another process",
                ));
            }
            return Err(err);
        }
        Ok(())
    }

    #[cfg(windows)]
    fn try_lock(file: &File) -> IoResult<()> {
        use std::os::windows::io::AsRawHandle;
        use windows_sys::Win32::Foundation::HANDLE;
        use windows_sys::Win32::Storage::FileSystem::{
            LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
        };

        let handle = file.as_raw_handle() as HANDLE;
        // SAFETY: `handle` is valid for the duration of the call and the
        // OVERLAPPED structure is zero-initialised as LockFileEx expects.
        let result = unsafe {
            let mut overlapped = std::mem::zeroed::<windows_sys::Win32::System::IO::OVERLAPPED>();
            LockFileEx(
                handle,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                1,
                0,
                &mut overlapped,
            )
        };
        if result == 0 {
            let err = IoError::last_os_error();
            return Err(IoError::new(
                ErrorKind::WouldBlock,
                format!("memory store is locked by another process: {err}"),
            ));
        }
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn try_lock(_file: &File) -> IoResult<()> {
        Err(IoError::new(
            ErrorKind::Unsupported,
            "file locking not supported on this platform",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempdir().unwrap();
        {
            let lock = FileLock::acquire(dir.path()).unwrap();
            assert!(lock.path().ends_with(LOCK_FILE));
        }
        assert!(FileLock::acquire(dir.path()).is_ok());
    }

    #[test]
    fn second_acquire_would_block() {
        let dir = tempdir().unwrap();
        let _held = FileLock::acquire(dir.path()).unwrap();

        let err = FileLock::acquire(dir.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
    }
}
