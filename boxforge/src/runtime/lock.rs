//! Home directory lock.
//!
//! An exclusive `flock` on `<home>/.lock` keeps two BoxForge processes from
//! sharing one blob cache and build workspace area.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::runtime::constants::filenames;
use boxforge_shared::errors::{BoxforgeError, BoxforgeResult};

/// Exclusive lock on a home directory, released on drop or process exit.
#[derive(Debug)]
pub struct RuntimeLock {
    file: File,
    path: PathBuf,
}

impl RuntimeLock {
    /// Try to lock `home_dir` without blocking.
    ///
    /// Returns `BoxforgeError::Internal` when another process holds it.
    pub fn acquire(home_dir: &Path) -> BoxforgeResult<Self> {
        std::fs::create_dir_all(home_dir)
            .map_err(|e| BoxforgeError::Storage(format!("failed to create home dir: {}", e)))?;

        let lock_path = home_dir.join(filenames::LOCK);

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| BoxforgeError::Storage(format!("failed to open lock file: {}", e)))?;

        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Err(BoxforgeError::Internal(format!(
                    "Another boxforge process is already using directory: {}\n\
                     Only one process can use a BOXFORGE_HOME directory at a time.",
                    home_dir.display()
                )));
            }
            return Err(BoxforgeError::Storage(format!(
                "failed to acquire lock: {}",
                err
            )));
        }

        tracing::debug!(lock_path = %lock_path.display(), "Acquired home lock");

        Ok(RuntimeLock {
            file,
            path: lock_path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RuntimeLock {
    fn drop(&mut self) {
        // Closing the file releases it too; unlock explicitly anyway.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        tracing::debug!(lock_path = %self.path.display(), "Released home lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_lock() {
        let temp_dir = TempDir::new().unwrap();
        let lock = RuntimeLock::acquire(temp_dir.path()).unwrap();

        assert!(lock.path().exists());
        assert_eq!(lock.path(), temp_dir.path().join(".lock"));
    }

    #[test]
    fn test_lock_prevents_concurrent_access() {
        let temp_dir = TempDir::new().unwrap();

        let _lock1 = RuntimeLock::acquire(temp_dir.path()).unwrap();

        let err = RuntimeLock::acquire(temp_dir.path()).unwrap_err();
        assert!(matches!(err, BoxforgeError::Internal(_)));
        assert!(err.to_string().contains("Another boxforge process"));
    }

    #[test]
    fn test_lock_released_on_drop() {
        let temp_dir = TempDir::new().unwrap();

        {
            let _lock = RuntimeLock::acquire(temp_dir.path()).unwrap();
        }

        let _lock2 = RuntimeLock::acquire(temp_dir.path()).unwrap();
    }

    #[test]
    fn test_lock_across_threads() {
        let temp_dir = TempDir::new().unwrap();
        let dir_path = Arc::new(temp_dir.path().to_path_buf());

        let _lock1 = RuntimeLock::acquire(&dir_path).unwrap();

        let dir_clone = Arc::clone(&dir_path);
        let handle = thread::spawn(move || RuntimeLock::acquire(&dir_clone));

        assert!(handle.join().unwrap().is_err());
    }
}
