//! Authoritative profile stores the engine bootstraps from.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::{DefinitionError, SyncError};

use super::{Profile, ProfileId};

/// Read access to the external profile store.
pub trait ProfileSource: Send + Sync {
    /// Every profile currently marked active.
    fn load_active_profiles(&self) -> Result<Vec<Profile>, SyncError>;
}

/// A process-local profile store, used for embedding and tests.
#[derive(Debug, Default)]
pub struct InMemoryProfileSource {
    profiles: RwLock<Vec<Profile>>,
}

impl InMemoryProfileSource {
    pub fn new(profiles: Vec<Profile>) -> Self {
        Self {
            profiles: RwLock::new(profiles),
        }
    }

    /// Insert or replace by id.
    pub fn put(&self, profile: Profile) -> Result<(), SyncError> {
        let mut profiles = self
            .profiles
            .write()
            .map_err(|_| SyncError::Source("profile store lock poisoned".into()))?;
        match profiles.iter_mut().find(|p| p.id == profile.id) {
            Some(existing) => *existing = profile,
            None => profiles.push(profile),
        }
        Ok(())
    }

    pub fn remove(&self, id: ProfileId) -> Result<Option<Profile>, SyncError> {
        let mut profiles = self
            .profiles
            .write()
            .map_err(|_| SyncError::Source("profile store lock poisoned".into()))?;
        let index = profiles.iter().position(|p| p.id == id);
        Ok(index.map(|i| profiles.remove(i)))
    }
}

impl ProfileSource for InMemoryProfileSource {
    fn load_active_profiles(&self) -> Result<Vec<Profile>, SyncError> {
        let profiles = self
            .profiles
            .read()
            .map_err(|_| SyncError::Source("profile store lock poisoned".into()))?;
        Ok(profiles.iter().filter(|p| p.active).cloned().collect())
    }
}

/// Profiles stored as a JSON or YAML list in a file, re-read on every load.
#[derive(Debug, Clone)]
pub struct FileProfileSource {
    path: PathBuf,
}

impl FileProfileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every profile in the file, active or not.
    pub fn read_all(&self) -> Result<Vec<Profile>, DefinitionError> {
        let contents = std::fs::read_to_string(&self.path)?;
        match self.path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(serde_json::from_str(&contents)?),
            _ => Ok(serde_yaml::from_str(&contents)?),
        }
    }
}

impl ProfileSource for FileProfileSource {
    fn load_active_profiles(&self) -> Result<Vec<Profile>, SyncError> {
        let profiles = self
            .read_all()
            .map_err(|e| SyncError::Source(format!("{}: {e}", self.path.display())))?;
        Ok(profiles.into_iter().filter(|p| p.active).collect())
    }
}
