//! Inverted index from identifier values to the profiles that require them.
//!
//! A profile whose predicate can only be true when some participant carries
//! one of a known set of ids is posted under each of those (field, id) keys.
//! Everything else lives in the unindexed set and is a candidate for every
//! event. Lookup therefore never misses a profile that could match.

use dashmap::{DashMap, DashSet};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::compiler::{Field, FIELD_TABLE};
use crate::event::KillmailEvent;
use crate::matcher::IndexKey;
use crate::profile::ProfileId;

pub struct ProfileIndex {
    postings: HashMap<Field, DashMap<u64, HashSet<ProfileId>>>,
    unindexed: DashSet<ProfileId>,
}

impl Default for ProfileIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl ProfileIndex {
    pub fn new() -> Self {
        let postings = FIELD_TABLE
            .iter()
            .map(|spec| spec.field)
            .filter(Field::is_indexable)
            .map(|field| (field, DashMap::new()))
            .collect();
        Self {
            postings,
            unindexed: DashSet::new(),
        }
    }

    /// Add postings for a profile. `None` places it on the scan path.
    pub fn insert(&self, id: ProfileId, keys: Option<&BTreeSet<IndexKey>>) {
        match keys {
            Some(keys) => {
                for key in keys {
                    if let Some(postings) = self.postings.get(&key.field) {
                        postings.entry(key.value).or_default().insert(id);
                    }
                }
            }
            None => {
                self.unindexed.insert(id);
            }
        }
    }

    /// Drop postings present in `old` but absent from `new`.
    ///
    /// Called after the new postings are in place. Lookups running during a
    /// replacement may still see a partial state; `ProfileTable` detects
    /// those and retries.
    pub fn retain_only(
        &self,
        id: ProfileId,
        old: Option<&BTreeSet<IndexKey>>,
        new: Option<&BTreeSet<IndexKey>>,
    ) {
        match (old, new) {
            (None, None) => {}
            (None, Some(_)) => {
                self.unindexed.remove(&id);
            }
            (Some(old), None) => self.remove_keys(id, old.iter()),
            (Some(old), Some(new)) => self.remove_keys(id, old.difference(new)),
        }
    }

    pub fn remove(&self, id: ProfileId, keys: Option<&BTreeSet<IndexKey>>) {
        match keys {
            Some(keys) => self.remove_keys(id, keys.iter()),
            None => {
                self.unindexed.remove(&id);
            }
        }
    }

    fn remove_keys<'a>(&self, id: ProfileId, keys: impl Iterator<Item = &'a IndexKey>) {
        for key in keys {
            let Some(postings) = self.postings.get(&key.field) else {
                continue;
            };
            if let Some(mut ids) = postings.get_mut(&key.value) {
                ids.remove(&id);
            }
            postings.remove_if(&key.value, |_, ids| ids.is_empty());
        }
    }

    /// Every profile that could match `event`.
    pub fn candidates(&self, event: &KillmailEvent) -> HashSet<ProfileId> {
        let mut candidates: HashSet<ProfileId> =
            self.unindexed.iter().map(|id| *id).collect();
        for (field, postings) in &self.postings {
            if postings.is_empty() {
                continue;
            }
            for value in field.ids(event) {
                if let Some(ids) = postings.get(&value) {
                    candidates.extend(ids.iter().copied());
                }
            }
        }
        candidates
    }

    /// Distinct posted values per field.
    pub fn sizes(&self) -> BTreeMap<String, usize> {
        self.postings
            .iter()
            .map(|(field, postings)| (field.name().to_string(), postings.len()))
            .collect()
    }

    pub fn unindexed_len(&self) -> usize {
        self.unindexed.len()
    }

    pub fn clear(&self) {
        for postings in self.postings.values() {
            postings.clear();
        }
        self.unindexed.clear();
    }
}
