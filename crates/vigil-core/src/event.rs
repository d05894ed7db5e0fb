//! Detection events and their normalized row form.

use crate::gallery::MatchResult;
use crate::types::{Detection, OwnerId, PatternKind, PersonId};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// What an event records. Only persons carry a person id.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Person { person_id: Option<PersonId> },
    Fire,
    Gun,
    Object { class: String },
}

impl EventKind {
    pub fn category(&self) -> &str {
        match self {
            EventKind::Person { .. } => "person",
            EventKind::Fire => "fire",
            EventKind::Gun => "gun",
            EventKind::Object { class } => class,
        }
    }
}

/// One detection event, buffered until the next flush.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub owner: OwnerId,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub confidence: Option<f32>,
}

impl EventRecord {
    /// Event for a detected face after gallery matching.
    pub fn person(owner: &OwnerId, timestamp: DateTime<Utc>, result: &MatchResult) -> Self {
        Self {
            owner: owner.clone(),
            timestamp,
            kind: EventKind::Person {
                person_id: result.person_id,
            },
            confidence: result.confidence(),
        }
    }

    /// Event for an object or pattern hit.
    ///
    /// `None` for detections the object path never logs: faces and
    /// `person` objects (both belong to the face path) and objects with a
    /// blank class label.
    pub fn from_detection(
        owner: &OwnerId,
        timestamp: DateTime<Utc>,
        detection: &Detection,
    ) -> Option<Self> {
        if detection.is_person() {
            return None;
        }
        let (kind, confidence) = match detection {
            Detection::Face { .. } => return None,
            Detection::Object { class, score, .. } => {
                let class = class.trim();
                if class.is_empty() {
                    return None;
                }
                (EventKind::Object { class: class.to_string() }, *score)
            }
            Detection::Pattern { kind, score, .. } => {
                let kind = match kind {
                    PatternKind::Fire => EventKind::Fire,
                    PatternKind::Gun => EventKind::Gun,
                };
                (kind, *score)
            }
        };

        Some(Self {
            owner: owner.clone(),
            timestamp,
            kind,
            confidence: Some(confidence),
        })
    }

    pub fn category(&self) -> &str {
        self.kind.category()
    }
}

/// Normalized events-table row.
///
/// `member_id` is a contract with the events schema: person rows always carry
/// the key (null when unmatched), every other category omits it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRow {
    pub team_id: String,
    /// RFC 3339 timestamp with millisecond precision.
    pub date_time: String,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "present_or_absent")]
    pub member_id: Option<Option<PersonId>>,
    pub object_confidence: Option<f32>,
}

impl From<&EventRecord> for EventRow {
    fn from(record: &EventRecord) -> Self {
        let member_id = match &record.kind {
            EventKind::Person { person_id } => Some(*person_id),
            _ => None,
        };

        Self {
            team_id: record.owner.0.clone(),
            date_time: record.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            category: record.category().to_string(),
            member_id,
            object_confidence: record.confidence,
        }
    }
}

impl EventRow {
    pub fn is_person(&self) -> bool {
        self.category == "person"
    }
}

/// Normalize a drained batch into rows, preserving order.
pub fn normalize_batch(records: &[EventRecord]) -> Vec<EventRow> {
    records.iter().map(EventRow::from).collect()
}

/// Keeps `Some(None)` (explicit null) distinct from `None` (absent key) on
/// the way back in.
mod present_or_absent {
    use crate::types::PersonId;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(value: &Option<Option<PersonId>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Option<PersonId>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<PersonId>::deserialize(deserializer).map(Some)
    }
}
