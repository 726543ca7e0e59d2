//! Field and operator vocabulary for filter trees.
//!
//! Every field a profile may reference is declared once in [`FIELD_TABLE`]
//! together with its value kind. The kind decides which operators are legal
//! and what shape the leaf value must have, so validation happens at load
//! time instead of being scattered through evaluation.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::event::KillmailEvent;

/// A killmail attribute that filter leaves can test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    /// Any participant's character (victim or attacker).
    CharacterId,
    /// Any participant's corporation.
    CorporationId,
    /// Any participant's alliance.
    AllianceId,
    /// Any participant's ship type.
    ShipTypeId,
    SolarSystemId,
    TotalValue,
    ParticipantCount,
    VictimCharacterId,
    VictimCorporationId,
    VictimAllianceId,
    VictimShipTypeId,
}

/// The declared value kind of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// Floating point quantity compared with ordering operators.
    Numeric,
    /// A single entity id per event.
    Id,
    /// Zero or more entity ids per event, one per participant.
    IdSet,
}

/// Comparison operator of a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
}

/// One row of the field validation table.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub field: Field,
    pub name: &'static str,
    pub kind: ValueKind,
}

pub const FIELD_TABLE: &[FieldSpec] = &[
    FieldSpec { field: Field::CharacterId, name: "character_id", kind: ValueKind::IdSet },
    FieldSpec { field: Field::CorporationId, name: "corporation_id", kind: ValueKind::IdSet },
    FieldSpec { field: Field::AllianceId, name: "alliance_id", kind: ValueKind::IdSet },
    FieldSpec { field: Field::ShipTypeId, name: "ship_type_id", kind: ValueKind::IdSet },
    FieldSpec { field: Field::SolarSystemId, name: "solar_system_id", kind: ValueKind::Id },
    FieldSpec { field: Field::TotalValue, name: "total_value", kind: ValueKind::Numeric },
    FieldSpec { field: Field::ParticipantCount, name: "participant_count", kind: ValueKind::Numeric },
    FieldSpec { field: Field::VictimCharacterId, name: "victim_character_id", kind: ValueKind::Id },
    FieldSpec { field: Field::VictimCorporationId, name: "victim_corporation_id", kind: ValueKind::Id },
    FieldSpec { field: Field::VictimAllianceId, name: "victim_alliance_id", kind: ValueKind::Id },
    FieldSpec { field: Field::VictimShipTypeId, name: "victim_ship_type_id", kind: ValueKind::Id },
];

/// Accepted alternate spellings.
const FIELD_ALIASES: &[(&str, Field)] = &[("system_id", Field::SolarSystemId)];

const NUMERIC_OPERATORS: &[Operator] = &[
    Operator::Eq,
    Operator::Neq,
    Operator::Gt,
    Operator::Gte,
    Operator::Lt,
    Operator::Lte,
];

const ID_OPERATORS: &[Operator] = &[Operator::Eq, Operator::Neq, Operator::In, Operator::NotIn];

impl Field {
    pub const ALL: [Field; 11] = [
        Field::CharacterId,
        Field::CorporationId,
        Field::AllianceId,
        Field::ShipTypeId,
        Field::SolarSystemId,
        Field::TotalValue,
        Field::ParticipantCount,
        Field::VictimCharacterId,
        Field::VictimCorporationId,
        Field::VictimAllianceId,
        Field::VictimShipTypeId,
    ];

    /// Resolve a declarative field name, including aliases.
    pub fn parse(name: &str) -> Option<Field> {
        FIELD_TABLE
            .iter()
            .find(|spec| spec.name == name)
            .map(|spec| spec.field)
            .or_else(|| {
                FIELD_ALIASES
                    .iter()
                    .find(|(alias, _)| *alias == name)
                    .map(|(_, field)| *field)
            })
    }

    fn spec(&self) -> &'static FieldSpec {
        // FIELD_TABLE is declared in enum order.
        &FIELD_TABLE[*self as usize]
    }

    pub fn name(&self) -> &'static str {
        self.spec().name
    }

    pub fn kind(&self) -> ValueKind {
        self.spec().kind
    }

    /// Id-valued fields can back an inverted index.
    pub fn is_indexable(&self) -> bool {
        !matches!(self.kind(), ValueKind::Numeric)
    }

    /// Returns true if `pred` holds for any id this field carries on `event`.
    /// Absent ids are skipped.
    pub(crate) fn any_id<F>(&self, event: &KillmailEvent, mut pred: F) -> bool
    where
        F: FnMut(u64) -> bool,
    {
        match self {
            Field::CharacterId => event.participants().filter_map(|p| p.character_id).any(&mut pred),
            Field::CorporationId => event.participants().filter_map(|p| p.corporation_id).any(&mut pred),
            Field::AllianceId => event.participants().filter_map(|p| p.alliance_id).any(&mut pred),
            Field::ShipTypeId => event.participants().filter_map(|p| p.ship_type_id).any(&mut pred),
            Field::SolarSystemId => pred(event.solar_system_id),
            Field::VictimCharacterId => event.victim.character_id.map_or(false, pred),
            Field::VictimCorporationId => event.victim.corporation_id.map_or(false, pred),
            Field::VictimAllianceId => event.victim.alliance_id.map_or(false, pred),
            Field::VictimShipTypeId => event.victim.ship_type_id.map_or(false, pred),
            Field::TotalValue | Field::ParticipantCount => false,
        }
    }

    /// Distinct ids this field carries on `event`.
    pub(crate) fn ids(&self, event: &KillmailEvent) -> Vec<u64> {
        let mut ids = Vec::new();
        self.any_id(event, |id| {
            if !ids.contains(&id) {
                ids.push(id);
            }
            false
        });
        ids
    }

    pub(crate) fn numeric(&self, event: &KillmailEvent) -> Option<f64> {
        match self {
            Field::TotalValue => Some(event.total_value),
            Field::ParticipantCount => Some(event.participant_count() as f64),
            _ => None,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl ValueKind {
    pub fn allowed_operators(&self) -> &'static [Operator] {
        match self {
            ValueKind::Numeric => NUMERIC_OPERATORS,
            ValueKind::Id | ValueKind::IdSet => ID_OPERATORS,
        }
    }

    pub fn allows(&self, operator: Operator) -> bool {
        self.allowed_operators().contains(&operator)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Numeric => "numeric",
            ValueKind::Id => "id",
            ValueKind::IdSet => "id-set",
        }
    }
}

impl Operator {
    pub fn parse(name: &str) -> Option<Operator> {
        let op = match name {
            "eq" => Operator::Eq,
            "neq" => Operator::Neq,
            "gt" => Operator::Gt,
            "gte" => Operator::Gte,
            "lt" => Operator::Lt,
            "lte" => Operator::Lte,
            "in" => Operator::In,
            "not_in" => Operator::NotIn,
            _ => return None,
        };
        Some(op)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Neq => "neq",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::In => "in",
            Operator::NotIn => "not_in",
        }
    }

    /// `in` and `not_in` take a list value.
    pub fn takes_list(&self) -> bool {
        matches!(self, Operator::In | Operator::NotIn)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{KillmailEvent, Participant};

    #[test]
    fn test_table_matches_enum_order() {
        for (index, field) in Field::ALL.iter().enumerate() {
            assert_eq!(FIELD_TABLE[index].field, *field);
            assert_eq!(Field::parse(field.name()), Some(*field));
        }
    }

    #[test]
    fn test_parse_alias_and_unknown() {
        assert_eq!(Field::parse("system_id"), Some(Field::SolarSystemId));
        assert_eq!(Field::parse("shield_type"), None);
        assert_eq!(Operator::parse("not_in"), Some(Operator::NotIn));
        assert_eq!(Operator::parse("contains"), None);
    }

    #[test]
    fn test_operator_table() {
        assert!(ValueKind::Numeric.allows(Operator::Gt));
        assert!(!ValueKind::Numeric.allows(Operator::In));
        assert!(ValueKind::IdSet.allows(Operator::In));
        assert!(!ValueKind::Id.allows(Operator::Lte));
    }

    #[test]
    fn test_ids_cover_all_participants() {
        let event = KillmailEvent::new(1, 30000142, 10.0, Participant::new(1, 100, 587))
            .with_attacker(Participant::new(2, 100, 670))
            .with_attacker(Participant::default());

        assert_eq!(Field::CorporationId.ids(&event), vec![100]);
        assert_eq!(Field::ShipTypeId.ids(&event), vec![587, 670]);
        assert_eq!(Field::VictimShipTypeId.ids(&event), vec![587]);
        assert_eq!(Field::SolarSystemId.ids(&event), vec![30000142]);
        assert!(Field::AllianceId.ids(&event).is_empty());
        assert_eq!(Field::ParticipantCount.numeric(&event), Some(3.0));
    }
}
