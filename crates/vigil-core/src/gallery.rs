//! Known-person gallery and nearest-neighbour face matching.

use crate::sink::{PersistenceSink, SinkError};
use crate::types::{Embedding, OwnerId, PersonId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Distance at or above which a face is reported as unknown.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Label given to faces that match no gallery entry.
pub const UNKNOWN_LABEL: &str = "unknown";

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("failed to load gallery for owner {owner}: {source}")]
    Load {
        owner: OwnerId,
        #[source]
        source: SinkError,
    },
}

/// A person record as stored by the persistence backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonRecord {
    pub person_id: PersonId,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub embedding: Option<Embedding>,
}

/// One known face in the session gallery.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub label: String,
    pub person_id: PersonId,
    pub embedding: Embedding,
}

/// Result of matching a query embedding against the gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Matched label, or [`UNKNOWN_LABEL`].
    pub label: String,
    pub person_id: Option<PersonId>,
    /// Distance to the nearest entry; `+inf` when nothing was comparable.
    pub distance: f32,
}

impl MatchResult {
    pub fn unknown(distance: f32) -> Self {
        Self {
            label: UNKNOWN_LABEL.to_string(),
            person_id: None,
            distance,
        }
    }

    pub fn is_known(&self) -> bool {
        self.person_id.is_some()
    }

    /// Confidence recorded for the event: `1 - distance`, clamped to [0, 1]
    /// and rounded to two decimals. `None` when the distance is not finite.
    pub fn confidence(&self) -> Option<f32> {
        if !self.distance.is_finite() {
            return None;
        }
        let raw = (1.0 - self.distance).clamp(0.0, 1.0);
        Some((raw * 100.0).round() / 100.0)
    }
}

/// Strategy for comparing a query embedding against the gallery.
pub trait Matcher: Send + Sync {
    /// Index of the nearest entry and its distance, or `None` for an empty
    /// (or dimensionally incompatible) gallery.
    fn nearest(&self, query: &Embedding, entries: &[GalleryEntry]) -> Option<(usize, f32)>;
}

/// Linear-scan Euclidean matcher. Exact ties keep the earliest entry.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn nearest(&self, query: &Embedding, entries: &[GalleryEntry]) -> Option<(usize, f32)> {
        let mut best: Option<(usize, f32)> = None;

        for (i, entry) in entries.iter().enumerate() {
            if entry.embedding.dim() != query.dim() {
                continue;
            }
            let distance = query.euclidean_distance(&entry.embedding);
            // Strict comparison: first entry wins on ties.
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((i, distance));
            }
        }

        best
    }
}

/// Build the gallery label for a person record.
///
/// `"first last"` lowercased when both names are present, otherwise
/// `"id:<person id>"`.
pub fn normalize_label(record: &PersonRecord) -> String {
    match (record.first_name.as_deref(), record.last_name.as_deref()) {
        (Some(first), Some(last)) if !first.is_empty() && !last.is_empty() => {
            format!("{} {}", first.trim(), last.trim()).to_lowercase()
        }
        _ => format!("id:{}", record.person_id),
    }
}

/// The session's known faces. Immutable once built.
pub struct FaceGallery {
    entries: Vec<GalleryEntry>,
    label_to_person: HashMap<String, PersonId>,
    threshold: f32,
    matcher: Box<dyn Matcher>,
}

impl FaceGallery {
    pub fn empty(threshold: f32) -> Self {
        Self {
            entries: Vec::new(),
            label_to_person: HashMap::new(),
            threshold,
            matcher: Box::new(EuclideanMatcher),
        }
    }

    /// Build a gallery from backend records, in record order.
    ///
    /// Records without an embedding are skipped. A label seen twice keeps
    /// both entries but maps to the last person id.
    pub fn from_records(records: Vec<PersonRecord>, threshold: f32) -> Self {
        let mut gallery = Self::empty(threshold);

        for record in records {
            let label = normalize_label(&record);
            let Some(embedding) = record.embedding else {
                tracing::warn!(person = %record.person_id, label, "person has no embedding; skipped");
                continue;
            };

            if let Some(previous) = gallery.label_to_person.insert(label.clone(), record.person_id) {
                if previous != record.person_id {
                    tracing::warn!(
                        label,
                        previous = %previous,
                        current = %record.person_id,
                        "duplicate gallery label; last person id wins"
                    );
                }
            }

            tracing::debug!(label, person = %record.person_id, dim = embedding.dim(), "gallery entry added");
            gallery.entries.push(GalleryEntry {
                label,
                person_id: record.person_id,
                embedding,
            });
        }

        gallery
    }

    /// Fetch the owner's person records from the sink and build the gallery.
    pub async fn load(
        sink: &dyn PersistenceSink,
        owner: &OwnerId,
        threshold: f32,
    ) -> Result<Self, GalleryError> {
        let records = sink
            .load_gallery(owner)
            .await
            .map_err(|source| GalleryError::Load {
                owner: owner.clone(),
                source,
            })?;

        let gallery = Self::from_records(records, threshold);
        tracing::info!(owner = %owner, entries = gallery.len(), "face gallery loaded");
        Ok(gallery)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    /// Person id a label resolves to (last write wins on duplicates).
    pub fn person_for_label(&self, label: &str) -> Option<PersonId> {
        self.label_to_person.get(label).copied()
    }

    /// Match a query embedding against every entry.
    pub fn best_match(&self, query: &Embedding) -> MatchResult {
        match self.matcher.nearest(query, &self.entries) {
            Some((idx, distance)) if distance < self.threshold => {
                let label = self.entries[idx].label.clone();
                let person_id = self.person_for_label(&label);
                MatchResult {
                    label,
                    person_id,
                    distance,
                }
            }
            Some((_, distance)) => MatchResult::unknown(distance),
            None => MatchResult::unknown(f32::INFINITY),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::event::EventRow;

    fn record(id: i64, first: Option<&str>, last: Option<&str>, values: Vec<f32>) -> PersonRecord {
        PersonRecord {
            person_id: PersonId(id),
            first_name: first.map(str::to_string),
            last_name: last.map(str::to_string),
            embedding: Some(Embedding::new(values)),
        }
    }

    #[test]
    fn test_label_from_names_is_trimmed_and_lowercased() {
        let r = record(1, Some("  Jane "), Some("DOE "), vec![]);
        assert_eq!(normalize_label(&r), "jane doe");
    }

    #[test]
    fn test_label_falls_back_to_id() {
        assert_eq!(normalize_label(&record(7, None, Some("Doe"), vec![])), "id:7");
        assert_eq!(normalize_label(&record(8, Some(""), Some("Doe"), vec![])), "id:8");
    }

    #[test]
    fn test_exact_embedding_matches_its_entry() {
        let gallery = FaceGallery::from_records(
            vec![
                record(1, Some("Ann"), Some("Lee"), vec![1.0, 0.0, 0.0]),
                record(2, Some("Bob"), Some("Ray"), vec![0.0, 1.0, 0.0]),
                record(3, Some("Cy"), Some("Oh"), vec![0.0, 0.0, 1.0]),
            ],
            DEFAULT_MATCH_THRESHOLD,
        );

        for (query, label, id) in [
            (vec![1.0, 0.0, 0.0], "ann lee", 1),
            (vec![0.0, 1.0, 0.0], "bob ray", 2),
            (vec![0.0, 0.0, 1.0], "cy oh", 3),
        ] {
            let result = gallery.best_match(&Embedding::new(query));
            assert_eq!(result.label, label);
            assert_eq!(result.person_id, Some(PersonId(id)));
            assert_eq!(result.distance, 0.0);
        }
    }

    #[test]
    fn test_far_embedding_is_unknown() {
        let gallery = FaceGallery::from_records(
            vec![record(1, Some("Ann"), Some("Lee"), vec![0.0, 0.0])],
            DEFAULT_MATCH_THRESHOLD,
        );
        let result = gallery.best_match(&Embedding::new(vec![0.8, 0.0]));
        assert_eq!(result.label, UNKNOWN_LABEL);
        assert_eq!(result.person_id, None);
        assert!((result.distance - 0.8).abs() < 1e-6);
        assert_eq!(result.confidence(), Some(0.2));
    }

    #[test]
    fn test_distance_at_threshold_is_unknown() {
        // 3-4-5 triangle: distance is exactly 5.0.
        let gallery = FaceGallery::from_records(
            vec![record(1, Some("Ann"), Some("Lee"), vec![0.0, 0.0])],
            5.0,
        );
        let result = gallery.best_match(&Embedding::new(vec![3.0, 4.0]));
        assert_eq!(result.distance, 5.0);
        assert!(!result.is_known());
    }

    #[test]
    fn test_empty_gallery_is_unknown() {
        let gallery = FaceGallery::empty(DEFAULT_MATCH_THRESHOLD);
        let result = gallery.best_match(&Embedding::new(vec![0.1, 0.2]));
        assert_eq!(result.label, UNKNOWN_LABEL);
        assert!(!result.is_known());
        assert_eq!(result.confidence(), None);
    }

    #[test]
    fn test_tie_goes_to_first_entry() {
        let gallery = FaceGallery::from_records(
            vec![
                record(1, Some("Left"), Some("One"), vec![-0.1, 0.0]),
                record(2, Some("Right"), Some("Two"), vec![0.1, 0.0]),
            ],
            DEFAULT_MATCH_THRESHOLD,
        );
        let result = gallery.best_match(&Embedding::new(vec![0.0, 0.0]));
        assert_eq!(result.label, "left one");
        assert_eq!(result.person_id, Some(PersonId(1)));
    }

    #[test]
    fn test_duplicate_label_maps_to_last_person() {
        let gallery = FaceGallery::from_records(
            vec![
                record(1, Some("Jane"), Some("Doe"), vec![1.0, 0.0]),
                record(2, Some("jane "), Some(" doe"), vec![0.0, 1.0]),
            ],
            DEFAULT_MATCH_THRESHOLD,
        );
        assert_eq!(gallery.len(), 2);
        let result = gallery.best_match(&Embedding::new(vec![1.0, 0.0]));
        assert_eq!(result.label, "jane doe");
        assert_eq!(result.person_id, Some(PersonId(2)));
    }

    #[test]
    fn test_records_without_embedding_are_skipped() {
        let mut missing = record(5, Some("No"), Some("Face"), vec![]);
        missing.embedding = None;
        let gallery = FaceGallery::from_records(vec![missing], DEFAULT_MATCH_THRESHOLD);
        assert!(gallery.is_empty());
    }

    #[test]
    fn test_mismatched_dimension_is_not_compared() {
        let gallery = FaceGallery::from_records(
            vec![record(1, Some("Ann"), Some("Lee"), vec![0.0, 0.0, 0.0])],
            DEFAULT_MATCH_THRESHOLD,
        );
        let result = gallery.best_match(&Embedding::new(vec![0.0, 0.0]));
        assert!(!result.is_known());
        assert!(result.distance.is_infinite());
    }

    #[test]
    fn test_jane_doe_confidence() {
        // Probe sits 0.3 away from Jane's embedding.
        let gallery = FaceGallery::from_records(
            vec![record(42, Some("Jane"), Some("Doe"), vec![0.0, 0.0])],
            DEFAULT_MATCH_THRESHOLD,
        );
        let result = gallery.best_match(&Embedding::new(vec![0.3, 0.0]));
        assert_eq!(result.label, "jane doe");
        assert_eq!(result.person_id, Some(PersonId(42)));
        assert!((result.distance - 0.3).abs() < 1e-6);
        assert_eq!(result.confidence(), Some(0.7));
    }

    struct FailingSink;

    #[async_trait]
    impl PersistenceSink for FailingSink {
        async fn load_gallery(&self, _owner: &OwnerId) -> Result<Vec<PersonRecord>, SinkError> {
            Err(SinkError::Unavailable("backend down".into()))
        }

        async fn insert_events(&self, _batch: &[EventRow]) -> Result<(), SinkError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_load_failure_is_gallery_error() {
        let owner = OwnerId::new("team-1");
        let err = FaceGallery::load(&FailingSink, &owner, DEFAULT_MATCH_THRESHOLD)
            .await
            .err()
            .expect("load should fail");
        assert!(matches!(err, GalleryError::Load { .. }));
        assert!(err.to_string().contains("team-1"));
    }
}
