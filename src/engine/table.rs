//! The engine's working set of compiled profiles.
//!
//! Readers on the matching path never block on writers: entries are
//! `Arc`-shared and swapped whole, and an in-flight evaluation keeps the
//! version it looked up.
//!
//! A write touches the entry map and several index structures one after the
//! other, so an index lookup that overlaps a write can see a mix of both
//! versions' postings. Writes are bracketed by a generation counter (odd
//! while a write is in progress) and a lookup that raced one is retried.
//! After a few failed attempts the lookup falls back to a full scan, which
//! cannot miss a profile.

use dashmap::DashMap;
use std::collections::{BTreeMap, HashSet};
use std::hint;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use crate::compiler::CompiledProfile;
use crate::error::SyncError;
use crate::event::KillmailEvent;
use crate::profile::ProfileId;

use super::index::ProfileIndex;

const CANDIDATE_ATTEMPTS: usize = 8;

pub struct ProfileTable {
    profiles: DashMap<ProfileId, Arc<CompiledProfile>>,
    index: ProfileIndex,
    max_profiles: usize,
    generation: AtomicU64,
    writer: Mutex<()>,
}

/// Holds the generation odd for the lifetime of one write.
struct WriteGuard<'a> {
    generation: &'a AtomicU64,
    _writer: MutexGuard<'a, ()>,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.generation.fetch_add(1, Ordering::Release);
    }
}

impl ProfileTable {
    pub fn new(max_profiles: usize) -> Self {
        Self {
            profiles: DashMap::new(),
            index: ProfileIndex::new(),
            max_profiles,
            generation: AtomicU64::new(0),
            writer: Mutex::new(()),
        }
    }

    fn begin_write(&self) -> WriteGuard<'_> {
        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.generation.fetch_add(1, Ordering::AcqRel);
        fence(Ordering::Release);
        WriteGuard {
            generation: &self.generation,
            _writer: writer,
        }
    }

    /// Insert or replace a profile.
    ///
    /// New postings go in before the entry is swapped and stale ones come
    /// out after. An update older than the stored version is ignored.
    pub fn upsert(
        &self,
        profile: Arc<CompiledProfile>,
    ) -> Result<Option<Arc<CompiledProfile>>, SyncError> {
        let id = profile.profile_id;
        let _write = self.begin_write();
        let existing = self.get(id);

        match &existing {
            Some(current) if current.version > profile.version => {
                debug!(profile_id = %id, "ignoring stale profile version");
                return Ok(None);
            }
            None if self.profiles.len() >= self.max_profiles => {
                return Err(SyncError::CapacityExceeded(self.max_profiles));
            }
            _ => {}
        }

        self.index.insert(id, profile.index_keys.as_ref());
        let previous = self.profiles.insert(id, Arc::clone(&profile));
        if let Some(previous) = &previous {
            self.index.retain_only(
                id,
                previous.index_keys.as_ref(),
                profile.index_keys.as_ref(),
            );
        }
        Ok(previous)
    }

    pub fn remove(&self, id: ProfileId) -> Option<Arc<CompiledProfile>> {
        let _write = self.begin_write();
        let (_, removed) = self.profiles.remove(&id)?;
        self.index.remove(id, removed.index_keys.as_ref());
        Some(removed)
    }

    pub fn get(&self, id: ProfileId) -> Option<Arc<CompiledProfile>> {
        self.profiles.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Profiles the index cannot rule out for `event`, in id order.
    pub fn candidates(&self, event: &KillmailEvent) -> Vec<Arc<CompiledProfile>> {
        for _ in 0..CANDIDATE_ATTEMPTS {
            if let Some(ids) = self.consistent_candidates(event) {
                return self.resolve(ids);
            }
            hint::spin_loop();
        }
        debug!("index busy with writes, scanning all profiles");
        self.all()
    }

    /// Index lookup that no write overlapped, or `None`.
    fn consistent_candidates(&self, event: &KillmailEvent) -> Option<HashSet<ProfileId>> {
        let before = self.generation.load(Ordering::Acquire);
        if before % 2 == 1 {
            return None;
        }
        let ids = self.index.candidates(event);
        fence(Ordering::Acquire);
        (self.generation.load(Ordering::Relaxed) == before).then_some(ids)
    }

    fn resolve(&self, ids: HashSet<ProfileId>) -> Vec<Arc<CompiledProfile>> {
        let mut ids: Vec<ProfileId> = ids.into_iter().collect();
        ids.sort_unstable();
        // A profile removed after the lookup simply drops out.
        ids.into_iter().filter_map(|id| self.get(id)).collect()
    }

    /// Every profile, in id order.
    pub fn all(&self) -> Vec<Arc<CompiledProfile>> {
        let mut profiles: Vec<Arc<CompiledProfile>> = self
            .profiles
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        profiles.sort_unstable_by_key(|p| p.profile_id);
        profiles
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn index_sizes(&self) -> BTreeMap<String, usize> {
        self.index.sizes()
    }

    pub fn unindexed_len(&self) -> usize {
        self.index.unindexed_len()
    }

    pub fn clear(&self) {
        let _write = self.begin_write();
        self.profiles.clear();
        self.index.clear();
    }
}
