use serde::{Deserialize, Serialize};
use std::fmt;

/// Bounding box for a located face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Box area in pixels; degenerate boxes have zero area.
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// L2 norm of the vector.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Scale to unit length. Zero vectors are returned unchanged.
    pub fn normalized(mut self) -> Self {
        let norm = self.norm();
        if norm > 0.0 {
            for v in &mut self.values {
                *v /= norm;
            }
        }
        self
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }

    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// An embedding computed from one reference photo of an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceEmbedding {
    /// Gallery key of the source photo (its file name for directory galleries).
    pub source: String,
    /// SHA-256 of the source photo bytes, hex encoded.
    pub fingerprint: String,
    pub embedding: Embedding,
}

/// An enrolled identity together with all of its reference embeddings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub identity: String,
    pub references: Vec<ReferenceEmbedding>,
}

impl GalleryEntry {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            references: Vec::new(),
        }
    }

    pub fn has_fingerprint(&self, fingerprint: &str) -> bool {
        self.references.iter().any(|r| r.fingerprint == fingerprint)
    }
}

/// A positive identification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Match {
    pub identity: String,
    /// Best-photo distance between the probe and this identity.
    pub distance: f32,
    /// Distance mapped into [0, 1], 1 being an exact match.
    pub confidence: f32,
}

/// Why a frame did not produce an identity.
///
/// The snake_case codes are stable and safe to surface to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoMatchReason {
    NoFaceDetected,
    DistanceAboveThreshold,
    AmbiguousMargin,
    LowQualityEmbedding,
    Timeout,
    Unavailable,
}

impl NoMatchReason {
    pub const ALL: [NoMatchReason; 6] = [
        NoMatchReason::NoFaceDetected,
        NoMatchReason::DistanceAboveThreshold,
        NoMatchReason::AmbiguousMargin,
        NoMatchReason::LowQualityEmbedding,
        NoMatchReason::Timeout,
        NoMatchReason::Unavailable,
    ];

    pub fn code(self) -> &'static str {
        match self {
            NoMatchReason::NoFaceDetected => "no_face_detected",
            NoMatchReason::DistanceAboveThreshold => "distance_above_threshold",
            NoMatchReason::AmbiguousMargin => "ambiguous_margin",
            NoMatchReason::LowQualityEmbedding => "low_quality_embedding",
            NoMatchReason::Timeout => "timeout",
            NoMatchReason::Unavailable => "unavailable",
        }
    }

    /// Human-readable explanation for end users.
    pub fn message(self) -> &'static str {
        match self {
            NoMatchReason::NoFaceDetected => "no face detected in the image",
            NoMatchReason::DistanceAboveThreshold => "face does not match any enrolled student",
            NoMatchReason::AmbiguousMargin => {
                "face resembles more than one enrolled student, please try again"
            }
            NoMatchReason::LowQualityEmbedding => "face image quality too low, please try again",
            NoMatchReason::Timeout => "recognition timed out, please try again",
            NoMatchReason::Unavailable => "recognition service unavailable",
        }
    }
}

impl fmt::Display for NoMatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Outcome of matching one frame against the gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchDecision {
    Matched(Match),
    NoMatch { reason: NoMatchReason },
}

impl MatchDecision {
    pub fn no_match(reason: NoMatchReason) -> Self {
        MatchDecision::NoMatch { reason }
    }

    /// Identity of a positive decision.
    pub fn identity(&self) -> Option<&str> {
        match self {
            MatchDecision::Matched(m) => Some(&m.identity),
            MatchDecision::NoMatch { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<NoMatchReason> {
        match self {
            MatchDecision::Matched(_) => None,
            MatchDecision::NoMatch { reason } => Some(*reason),
        }
    }
}
