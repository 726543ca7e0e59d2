//! Match records and the downstream notification boundary.
//!
//! The engine hands each deduplicated match to a [`NotificationSink`]. How a
//! sink delivers it (channels, webhooks, persistence) is outside the engine;
//! a failing sink is logged and counted but never retried here.

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::Mutex;

use crate::compiler::CompiledProfile;
use crate::error::DispatchError;
use crate::event::{KillmailEvent, KillmailId};
use crate::profile::{OwnerId, ProfileId};

/// Event details carried with a match so sinks need not look the killmail up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchContext {
    pub profile_name: String,
    pub owner: OwnerId,
    pub solar_system_id: u64,
    pub total_value: f64,
    pub killmail_time: DateTime<Utc>,
    pub participant_count: usize,
    /// Fields the profile's filter inspects.
    pub fields: Vec<String>,
}

/// One (profile, killmail) hit, emitted at most once per retention window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub profile_id: ProfileId,
    pub killmail_id: KillmailId,
    pub matched_at: DateTime<Utc>,
    pub context: MatchContext,
}

impl Match {
    pub fn new(profile: &CompiledProfile, event: &KillmailEvent, matched_at: DateTime<Utc>) -> Self {
        Self {
            profile_id: profile.profile_id,
            killmail_id: event.killmail_id,
            matched_at,
            context: MatchContext {
                profile_name: profile.name.clone(),
                owner: profile.owner.clone(),
                solar_system_id: event.solar_system_id,
                total_value: event.total_value,
                killmail_time: event.killmail_time,
                participant_count: event.participant_count(),
                fields: profile
                    .referenced_fields
                    .iter()
                    .map(|f| f.name().to_string())
                    .collect(),
            },
        }
    }
}

/// Downstream consumer of matches.
pub trait NotificationSink: Send + Sync {
    fn dispatch(&self, notification: &Match) -> Result<(), DispatchError>;
}

/// Forwards matches into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<Match>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<Match>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn dispatch(&self, notification: &Match) -> Result<(), DispatchError> {
        self.tx
            .send(notification.clone())
            .map_err(|_| DispatchError("match receiver dropped".into()))
    }
}

/// Keeps every match in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    matches: Mutex<Vec<Match>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn matches(&self) -> Vec<Match> {
        match self.matches.lock() {
            Ok(matches) => matches.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.matches.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NotificationSink for CollectingSink {
    fn dispatch(&self, notification: &Match) -> Result<(), DispatchError> {
        self.matches
            .lock()
            .map_err(|_| DispatchError("collector lock poisoned".into()))?
            .push(notification.clone());
        Ok(())
    }
}

/// Writes each match as one JSON line.
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl<W: Write + Send> NotificationSink for JsonLinesSink<W> {
    fn dispatch(&self, notification: &Match) -> Result<(), DispatchError> {
        let line =
            serde_json::to_string(notification).map_err(|e| DispatchError(e.to_string()))?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| DispatchError("writer lock poisoned".into()))?;
        writeln!(writer, "{line}").map_err(|e| DispatchError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{Compiler, Criterion};
    use crate::event::Participant;
    use crate::profile::Profile;

    fn sample() -> Match {
        let profile = Profile::new(
            OwnerId::from("fc"),
            "jita",
            Criterion::and(vec![
                Criterion::leaf("solar_system_id", "eq", 30000142),
                Criterion::leaf("total_value", "gt", 1000),
            ]),
        );
        let compiled = Compiler::new().compile_profile(&profile).unwrap();
        let event = KillmailEvent::new(77, 30000142, 5000.0, Participant::new(1, 2, 3))
            .with_attacker(Participant::new(4, 5, 6));
        Match::new(&compiled, &event, Utc::now())
    }

    #[test]
    fn test_match_context() {
        let m = sample();
        assert_eq!(m.killmail_id, 77);
        assert_eq!(m.context.profile_name, "jita");
        assert_eq!(m.context.participant_count, 2);
        assert_eq!(m.context.fields, vec!["solar_system_id", "total_value"]);
    }

    #[test]
    fn test_channel_sink() {
        let (sink, rx) = ChannelSink::new();
        let m = sample();
        sink.dispatch(&m).unwrap();
        assert_eq!(rx.try_recv().unwrap(), m);

        drop(rx);
        assert!(sink.dispatch(&m).is_err());
    }

    #[test]
    fn test_json_lines_sink() {
        let sink = JsonLinesSink::new(Vec::new());
        sink.dispatch(&sample()).unwrap();
        sink.dispatch(&sample()).unwrap();
        let bytes = sink.writer.into_inner().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: Match = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.killmail_id, 77);
    }
}
