//! Surveillance profiles and their propagation into the engine.
//!
//! A [`Profile`] is the owner-facing definition: a named, activatable filter
//! tree. The authoritative set lives in an external store reachable through
//! [`ProfileSource`]; [`ProfileSync`] keeps the engine's compiled working set
//! consistent with it.

pub mod source;
pub mod sync;

pub use source::{FileProfileSource, InMemoryProfileSource, ProfileSource};
pub use sync::{ProfileSync, ProfileTarget, SyncHealth, SyncReport};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::compiler::Criterion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileId(pub Uuid);

impl ProfileId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProfileId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub String);

impl From<&str> for OwnerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A user-owned watch definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub id: ProfileId,
    pub owner: OwnerId,
    pub name: String,
    #[serde(default = "default_active")]
    pub active: bool,
    pub criteria: Criterion,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

impl Profile {
    /// A new active profile with a fresh id.
    pub fn new(owner: OwnerId, name: &str, criteria: Criterion) -> Self {
        let now = Utc::now();
        Self {
            id: ProfileId::new(),
            owner,
            name: name.to_string(),
            active: true,
            criteria,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: ProfileId) -> Self {
        self.id = id;
        self
    }

    pub fn deactivated(mut self) -> Self {
        self.active = false;
        self.updated_at = Utc::now();
        self
    }

    /// Replace the filter tree, bumping `updated_at`.
    pub fn with_criteria(mut self, criteria: Criterion) -> Self {
        self.criteria = criteria;
        self.updated_at = Utc::now();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_json_defaults() {
        let profile: Profile = serde_json::from_str(
            r#"{"owner": "fc-42", "name": "caps in lowsec",
                "criteria": {"field": "ship_type_id", "operator": "in", "value": [19720, 19722]}}"#,
        )
        .unwrap();
        assert!(profile.active);
        assert_eq!(profile.owner, OwnerId::from("fc-42"));
        assert_eq!(profile.criteria.depth(), 1);
    }

    #[test]
    fn test_deactivated_bumps_timestamp() {
        let profile = Profile::new(
            OwnerId::from("a"),
            "p",
            Criterion::leaf("character_id", "eq", 1),
        );
        let before = profile.updated_at;
        let inactive = profile.clone().deactivated();
        assert!(!inactive.active);
        assert!(inactive.updated_at >= before);
        assert_eq!(inactive.id, profile.id);
    }
}
