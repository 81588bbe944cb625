use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use crate::{error::*, Sha1Hash};

/// The durable store for a transfer's state.
///
/// The state is an opaque blob to the persister, it only needs to hand back
/// the last saved blob, or nothing if there is none.
pub trait Persister: Send + Sync {
    /// Replaces the saved state with the given blob.
    fn save_state(&self, state: &[u8]) -> Result<()>;

    /// Returns the last saved state, if any.
    fn read_state(&self) -> Result<Option<Vec<u8>>>;
}

/// Persists the state in a file inside a state directory, named after the
/// transfer's info hash.
#[derive(Debug)]
pub struct FilePersister {
    path: PathBuf,
}

impl FilePersister {
    /// Creates the persister, creating the state directory if needed.
    pub fn new(state_dir: &Path, info_hash: &Sha1Hash) -> Result<Self> {
        fs::create_dir_all(state_dir)?;
        let path = state_dir.join(format!("{}.state", hex::encode(info_hash)));
        Ok(Self { path })
    }

    /// The path of the state file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Persister for FilePersister {
    fn save_state(&self, state: &[u8]) -> Result<()> {
        log::trace!("Saving {} byte state to {:?}", state.len(), self.path);
        // write to a sibling file first so that a crash mid-write doesn't
        // leave a truncated state behind
        let tmp_path = self.path.with_extension("state.tmp");
        fs::write(&tmp_path, state)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn read_state(&self) -> Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(state) => Ok(Some(state)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Keeps the state in memory. Clones share the same slot, which allows
/// simulating a restart by handing a clone to a new client.
#[derive(Clone, Debug, Default)]
pub struct MemoryPersister(Arc<Mutex<Option<Vec<u8>>>>);

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persister for MemoryPersister {
    fn save_state(&self, state: &[u8]) -> Result<()> {
        let mut slot = self.0.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(state.to_vec());
        Ok(())
    }

    fn read_state(&self) -> Result<Option<Vec<u8>>> {
        let slot = self.0.lock().unwrap_or_else(|e| e.into_inner());
        Ok(slot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_persister() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");
        let persister = FilePersister::new(&state_dir, &[7; 20]).unwrap();
        assert!(persister.path().starts_with(&state_dir));

        // fresh bootstrap
        assert_eq!(persister.read_state().unwrap(), None);

        persister.save_state(b"first").unwrap();
        persister.save_state(b"second").unwrap();
        assert_eq!(persister.read_state().unwrap(), Some(b"second".to_vec()));

        // a new persister for the same transfer sees the same state
        let persister = FilePersister::new(&state_dir, &[7; 20]).unwrap();
        assert_eq!(persister.read_state().unwrap(), Some(b"second".to_vec()));

        // but not one for another transfer
        let other = FilePersister::new(&state_dir, &[8; 20]).unwrap();
        assert_eq!(other.read_state().unwrap(), None);
    }

    #[test]
    fn test_memory_persister_clones_share_state() {
        let persister = MemoryPersister::new();
        assert_eq!(persister.read_state().unwrap(), None);
        let clone = persister.clone();
        persister.save_state(b"state").unwrap();
        assert_eq!(clone.read_state().unwrap(), Some(b"state".to_vec()));
    }
}
