//! Normalized killmail events as produced by the ingestion pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DefinitionError;

/// Unique killmail identifier assigned upstream.
pub type KillmailId = u64;

/// One ship involved in a killmail, either the victim or an attacker.
///
/// NPC attackers and structures routinely lack character, corporation or
/// alliance ids, so every id is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    #[serde(default)]
    pub character_id: Option<u64>,
    #[serde(default)]
    pub corporation_id: Option<u64>,
    #[serde(default)]
    pub alliance_id: Option<u64>,
    #[serde(default)]
    pub ship_type_id: Option<u64>,
}

impl Participant {
    pub fn new(character_id: u64, corporation_id: u64, ship_type_id: u64) -> Self {
        Self {
            character_id: Some(character_id),
            corporation_id: Some(corporation_id),
            alliance_id: None,
            ship_type_id: Some(ship_type_id),
        }
    }

    pub fn with_alliance(mut self, alliance_id: u64) -> Self {
        self.alliance_id = Some(alliance_id);
        self
    }
}

/// An immutable destruction event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillmailEvent {
    pub killmail_id: KillmailId,
    pub killmail_time: DateTime<Utc>,
    pub solar_system_id: u64,
    pub total_value: f64,
    pub victim: Participant,
    #[serde(default)]
    pub attackers: Vec<Participant>,
}

impl KillmailEvent {
    pub fn new(killmail_id: KillmailId, solar_system_id: u64, total_value: f64, victim: Participant) -> Self {
        Self {
            killmail_id,
            killmail_time: Utc::now(),
            solar_system_id,
            total_value,
            victim,
            attackers: Vec::new(),
        }
    }

    pub fn with_attacker(mut self, attacker: Participant) -> Self {
        self.attackers.push(attacker);
        self
    }

    pub fn with_time(mut self, killmail_time: DateTime<Utc>) -> Self {
        self.killmail_time = killmail_time;
        self
    }

    /// Victim plus every attacker.
    pub fn participant_count(&self) -> usize {
        1 + self.attackers.len()
    }

    /// Victim first, then attackers in killmail order.
    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        std::iter::once(&self.victim).chain(self.attackers.iter())
    }

    /// Parse a single event from JSON. Unknown keys such as a precomputed
    /// `participant_count` are ignored; the count is always derived.
    pub fn from_json(input: &str) -> Result<Self, DefinitionError> {
        Ok(serde_json::from_str(input)?)
    }
}
