//! Advisory file locks for files shared by the service and admin commands.
//!
//! An OS lock on an open file is held per file description, so threads of
//! one process would not exclude each other through it. Each `FileLock`
//! therefore pairs the OS lock with an in-process mutex.

use eyre::{Result, WrapErr};
use parking_lot::{Mutex, MutexGuard};
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Path of the lock file guarding `path`.
pub fn lock_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

#[derive(Debug)]
pub struct FileLock<T> {
    path: PathBuf,
    file: File,
    state: Mutex<T>,
}

impl<T> FileLock<T> {
    /// Open the lock file for `guarded`, creating it when missing.
    pub fn open(guarded: &Path, state: T) -> Result<Self> {
        let path = lock_path(guarded);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .wrap_err_with(|| format!("failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to open lock file {}", path.display()))?;
        Ok(Self {
            path,
            file,
            state: Mutex::new(state),
        })
    }

    /// Block until both this process and every other process yield the lock.
    pub fn acquire(&self) -> Result<FileLockGuard<'_, T>> {
        let state = self.state.lock();
        self.file
            .lock()
            .wrap_err_with(|| format!("failed to lock {}", self.path.display()))?;
        Ok(FileLockGuard {
            file: &self.file,
            state,
        })
    }
}

pub struct FileLockGuard<'a, T> {
    file: &'a File,
    state: MutexGuard<'a, T>,
}

impl<T> std::ops::Deref for FileLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.state
    }
}

impl<T> std::ops::DerefMut for FileLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.state
    }
}

impl<T> Drop for FileLockGuard<'_, T> {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            tracing::warn!(error = %err, "failed to release file lock");
        }
    }
}
