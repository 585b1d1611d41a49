use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flock::{control_path, FileLock};
use crate::liveness::{LivenessProbe, Owner, ProcessProbe};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("lock {name:?} already held by {owner}")]
    Held { name: String, owner: Owner },
    #[error("lock registry I/O on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl RegistryError {
    fn io(path: &Path, source: io::Error) -> Self {
        RegistryError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// One line of the registry file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEntry {
    pub name: String,
    #[serde(flatten)]
    pub owner: Owner,
}

/// Named cross-process mutual exclusion with stale-owner reclamation.
///
/// Every mutation reads the whole file under the exclusive control lock, drops
/// entries whose owner is dead, and rewrites it.
#[derive(Debug)]
pub struct LockRegistry<P = ProcessProbe> {
    path: PathBuf,
    control: PathBuf,
    owner: Owner,
    probe: P,
}

impl LockRegistry<ProcessProbe> {
    /// Registry owned by the calling process, using OS process liveness
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        Self::with_probe(path, Owner::current(), ProcessProbe)
    }
}

impl<P: LivenessProbe> LockRegistry<P> {
    /// Creates the registry directory and checks that the control file can be locked
    pub fn with_probe(path: impl Into<PathBuf>, owner: Owner, probe: P) -> Result<Self, RegistryError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| RegistryError::io(parent, e))?;
        }
        let control = control_path(&path);
        FileLock::exclusive(&control).map_err(|e| RegistryError::io(&control, e))?;
        Ok(Self {
            path,
            control,
            owner,
            probe,
        })
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    /// Register `name` as held by this registry's owner.
    ///
    /// Fails with [`RegistryError::Held`] when a live owner (this one included)
    /// already holds it. The returned guard releases on drop.
    pub fn try_acquire(&self, name: &str) -> Result<LockGuard<'_, P>, RegistryError> {
        let owner = self.owner;
        self.update(|entries| {
            if let Some(held) = entries.iter().find(|e| e.name == name) {
                return Err(RegistryError::Held {
                    name: name.to_string(),
                    owner: held.owner,
                });
            }
            entries.push(LockEntry {
                name: name.to_string(),
                owner,
            });
            Ok(())
        })??;

        debug!("Acquired lock {:?} as {}", name, owner);
        Ok(LockGuard {
            registry: self,
            name: name.to_string(),
            released: false,
        })
    }

    /// Drop every entry for `name` owned by this registry's owner. Releasing a
    /// name that is not held is a no-op.
    pub fn release(&self, name: &str) -> Result<(), RegistryError> {
        let owner = self.owner;
        self.update(|entries| entries.retain(|e| !(e.name == name && e.owner == owner)))?;
        debug!("Released lock {:?} as {}", name, owner);
        Ok(())
    }

    /// Live entries, read under the control lock
    pub fn entries(&self) -> Result<Vec<LockEntry>, RegistryError> {
        self.update(|entries| entries.clone())
    }

    /// Read-filter-write under the exclusive control lock. `f` sees only
    /// entries with a live owner; the file is rewritten if anything changed.
    fn update<R>(&self, f: impl FnOnce(&mut Vec<LockEntry>) -> R) -> Result<R, RegistryError> {
        let _guard = FileLock::exclusive(&self.control).map_err(|e| RegistryError::io(&self.control, e))?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| RegistryError::io(&self.path, e))?;

        let stored = read_entries(&mut file, &self.path).map_err(|e| RegistryError::io(&self.path, e))?;
        let stored_len = stored.len();

        let mut entries: Vec<LockEntry> = stored
            .into_iter()
            .filter(|entry| {
                let alive = self.probe.is_alive(&entry.owner);
                if !alive {
                    warn!("Reclaiming stale lock {:?} held by dead {}", entry.name, entry.owner);
                }
                alive
            })
            .collect();
        let reclaimed = entries.len() != stored_len;
        let before = entries.clone();

        let result = f(&mut entries);

        if reclaimed || entries != before {
            write_entries(&mut file, &entries).map_err(|e| RegistryError::io(&self.path, e))?;
        }
        Ok(result)
    }
}

/// Scoped ownership of a registry entry
#[derive(Debug)]
pub struct LockGuard<'a, P: LivenessProbe> {
    registry: &'a LockRegistry<P>,
    name: String,
    released: bool,
}

impl<P: LivenessProbe> LockGuard<'_, P> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release now and surface any I/O error instead of logging it
    pub fn release(mut self) -> Result<(), RegistryError> {
        self.released = true;
        self.registry.release(&self.name)
    }
}

impl<P: LivenessProbe> Drop for LockGuard<'_, P> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.registry.release(&self.name) {
            warn!("Failed to release lock {:?}: {}", self.name, e);
        }
    }
}

fn read_entries(file: &mut File, path: &Path) -> io::Result<Vec<LockEntry>> {
    file.seek(SeekFrom::Start(0))?;
    let mut entries = Vec::new();
    for line in BufReader::new(&*file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LockEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!("Dropping unreadable lock entry in {}: {}", path.display(), e),
        }
    }
    Ok(entries)
}

fn write_entries(file: &mut File, entries: &[LockEntry]) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    let mut buf = Vec::new();
    for entry in entries {
        serde_json::to_writer(&mut buf, entry)?;
        buf.push(b'\n');
    }
    file.write_all(&buf)?;
    file.flush()
}
