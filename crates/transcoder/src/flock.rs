use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use fs2::FileExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Shared,
    Exclusive,
}

/// Held advisory lock on a control file; released when dropped.
///
/// Locks belong to the open file, so two handles in one process exclude each
/// other just like two processes do.
#[derive(Debug)]
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Block until an exclusive lock on `path` is granted, creating the file if needed
    pub fn exclusive(path: &Path) -> io::Result<Self> {
        Self::acquire(path, Mode::Exclusive)
    }

    /// Block until a shared lock on `path` is granted, creating the file if needed
    pub fn shared(path: &Path) -> io::Result<Self> {
        Self::acquire(path, Mode::Shared)
    }

    fn acquire(path: &Path, mode: Mode) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        loop {
            let locked = match mode {
                Mode::Shared => FileExt::lock_shared(&file),
                Mode::Exclusive => FileExt::lock_exclusive(&file),
            };
            match locked {
                Ok(()) => return Ok(Self { file }),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Closing the file releases the lock too; unlocking first keeps the window short
        let _ = FileExt::unlock(&self.file);
    }
}

/// `<path>.lock`
pub fn control_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_control_path_appends_suffix() {
        assert_eq!(
            control_path(Path::new("/tmp/av1batch/locks.ndjson")),
            PathBuf::from("/tmp/av1batch/locks.ndjson.lock")
        );
    }

    #[test]
    fn test_exclusive_blocks_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.lock");
        let held = FileLock::exclusive(&path).unwrap();

        let acquired = Arc::new(AtomicBool::new(false));
        let waiter = {
            let acquired = Arc::clone(&acquired);
            let path = path.clone();
            std::thread::spawn(move || {
                let _lock = FileLock::exclusive(&path).unwrap();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(100));
        assert!(!acquired.load(Ordering::SeqCst), "second exclusive lock must wait");
        drop(held);
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_shared_locks_coexist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.lock");
        let _a = FileLock::shared(&path).unwrap();
        let _b = FileLock::shared(&path).unwrap();
    }

    #[test]
    fn test_shared_waits_for_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.lock");
        let held = FileLock::exclusive(&path).unwrap();

        let acquired = Arc::new(AtomicBool::new(false));
        let reader = {
            let acquired = Arc::clone(&acquired);
            let path = path.clone();
            std::thread::spawn(move || {
                let _lock = FileLock::shared(&path).unwrap();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(100));
        assert!(!acquired.load(Ordering::SeqCst), "reader must wait for the writer");
        drop(held);
        reader.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_missing_parent_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileLock::exclusive(&dir.path().join("nope").join("ctl.lock")).is_err());
    }
}
