use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Axis-aligned bounding box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }
}

/// Face embedding vector (typically 128-dimensional).
///
/// Serialized as a bare array of floats, the same shape the members table
/// stores in its `descriptor` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Lower = more similar. Callers must compare embeddings of equal dimension;
    /// extra trailing values of the longer vector are ignored.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self { values }
    }
}

/// External identifier of a known person (the members table primary key).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersonId(pub i64);

impl fmt::Display for PersonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the account that owns a monitoring session (`team_id` on rows).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A captured RGB8 video frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Packed RGB pixel data (width * height * 3 bytes).
    pub data: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
    pub timestamp: Instant,
}

impl Frame {
    pub fn new(data: impl Into<Arc<[u8]>>, width: u32, height: u32, sequence: u32) -> Self {
        Self {
            data: data.into(),
            width,
            height,
            sequence,
            timestamp: Instant::now(),
        }
    }

    /// A frame is ready for inference once it has non-zero dimensions and a
    /// full pixel buffer. Sources that are still buffering report zero sizes.
    pub fn is_ready(&self) -> bool {
        self.width > 0 && self.height > 0 && self.data.len() >= self.pixel_count() * 3
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Convert to an 8-bit luma plane using integer BT.601 weights.
    pub fn to_grayscale(&self) -> GrayFrame {
        let data = self
            .data
            .chunks_exact(3)
            .take(self.pixel_count())
            .map(|px| {
                let (r, g, b) = (px[0] as u32, px[1] as u32, px[2] as u32);
                ((77 * r + 150 * g + 29 * b) >> 8) as u8
            })
            .collect();

        GrayFrame {
            data,
            width: self.width,
            height: self.height,
            sequence: self.sequence,
        }
    }
}

/// Single-channel frame handed to the pattern classifier.
#[derive(Debug, Clone)]
pub struct GrayFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
}

/// One generic object returned by the object detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub bbox: BoundingBox,
    #[serde(rename = "class")]
    pub class_label: String,
    /// Detector confidence in [0, 1].
    pub score: f32,
}

/// One face returned by the face detector, with its recognition embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    #[serde(default = "full_score")]
    pub score: f32,
    pub embedding: Embedding,
}

fn full_score() -> f32 {
    1.0
}

/// Trained patterns the cascade classifier looks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    Fire,
    Gun,
}

impl PatternKind {
    /// Class name shown next to the bounding box.
    pub fn display_name(self) -> &'static str {
        match self {
            PatternKind::Fire => "Fire",
            PatternKind::Gun => "Gun",
        }
    }
}

/// Multi-scale cascade tuning. Higher `min_neighbors` trades recall for fewer
/// false positives.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CascadeParams {
    pub scale_factor: f32,
    pub min_neighbors: u32,
}

/// A merged detection from any of the three inference adapters.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Detection {
    Face {
        bbox: BoundingBox,
        label: String,
        person_id: Option<PersonId>,
        distance: f32,
    },
    Object {
        bbox: BoundingBox,
        class: String,
        score: f32,
    },
    Pattern {
        bbox: BoundingBox,
        kind: PatternKind,
        score: f32,
    },
}

impl Detection {
    pub fn bbox(&self) -> &BoundingBox {
        match self {
            Detection::Face { bbox, .. }
            | Detection::Object { bbox, .. }
            | Detection::Pattern { bbox, .. } => bbox,
        }
    }

    pub fn class_name(&self) -> &str {
        match self {
            Detection::Face { label, .. } => label,
            Detection::Object { class, .. } => class,
            Detection::Pattern { kind, .. } => kind.display_name(),
        }
    }

    /// True for faces and for object-detector hits of class `person`.
    pub fn is_person(&self) -> bool {
        match self {
            Detection::Face { .. } => true,
            Detection::Object { class, .. } => class == "person",
            Detection::Pattern { .. } => false,
        }
    }
}

impl From<RawDetection> for Detection {
    fn from(raw: RawDetection) -> Self {
        Detection::Object {
            bbox: raw.bbox,
            class: raw.class_label,
            score: raw.score,
        }
    }
}
