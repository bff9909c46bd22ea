//! Identity matching against the enrolled gallery.
//!
//! Every (identity, reference photo) pair is compared against the probe.
//! This brute-force scan is linear in the number of enrolled photos, which is
//! fine for classroom-sized galleries (tens to a few hundred identities). An
//! approximate index only pays off well beyond that.

use crate::types::{Embedding, GalleryEntry, Match, MatchDecision, NoMatchReason};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Distance between two embeddings. Lower = more similar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// `1 - cosine_similarity`, in [0, 2].
    #[default]
    Cosine,
    /// L2 distance between the raw vectors.
    Euclidean,
}

impl DistanceMetric {
    pub fn distance(self, a: &Embedding, b: &Embedding) -> f32 {
        match self {
            DistanceMetric::Cosine => 1.0 - a.similarity(b),
            DistanceMetric::Euclidean => a.euclidean_distance(b),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::Euclidean => "euclidean",
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown distance metric {0:?} (expected \"cosine\" or \"euclidean\")")]
pub struct ParseMetricError(pub String);

impl FromStr for DistanceMetric {
    type Err = ParseMetricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(DistanceMetric::Cosine),
            "euclidean" | "l2" => Ok(DistanceMetric::Euclidean),
            _ => Err(ParseMetricError(s.to_string())),
        }
    }
}

/// Strategy for deciding which enrolled identity a probe embedding belongs to.
pub trait Matcher {
    /// `gallery` is in enrollment order; implementations must be deterministic
    /// for a fixed gallery and probe.
    fn decide(&self, probe: &Embedding, gallery: &[GalleryEntry]) -> MatchDecision;
}

/// Threshold + margin matcher.
///
/// Each identity scores the minimum distance over its reference photos. The
/// best identity is accepted only if its distance is within `threshold` and
/// the runner-up identity is at least `margin` further away. Exactly equal
/// scores resolve to the identity enrolled first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarginMatcher {
    pub metric: DistanceMetric,
    pub threshold: f32,
    pub margin: f32,
}

impl MarginMatcher {
    pub fn new(metric: DistanceMetric, threshold: f32, margin: f32) -> Self {
        Self {
            metric,
            threshold,
            margin,
        }
    }

    /// Map an accepted distance into [0, 1]: `1 - distance / threshold`.
    pub fn confidence(&self, distance: f32) -> f32 {
        if self.threshold <= 0.0 {
            return 0.0;
        }
        (1.0 - distance / self.threshold).clamp(0.0, 1.0)
    }

    /// Best distance across an identity's photos, ignoring photos whose
    /// dimension differs from the probe or whose distance is not finite.
    fn identity_distance(&self, probe: &Embedding, entry: &GalleryEntry) -> Option<f32> {
        entry
            .references
            .iter()
            .filter(|r| r.embedding.dimension() == probe.dimension())
            .map(|r| self.metric.distance(probe, &r.embedding))
            .filter(|d| d.is_finite())
            .fold(None, |best: Option<f32>, d| match best {
                Some(b) if b <= d => Some(b),
                _ => Some(d),
            })
    }
}

impl Matcher for MarginMatcher {
    fn decide(&self, probe: &Embedding, gallery: &[GalleryEntry]) -> MatchDecision {
        let has_references = gallery.iter().any(|e| !e.references.is_empty());
        if !has_references {
            return MatchDecision::no_match(NoMatchReason::DistanceAboveThreshold);
        }

        let mut best: Option<(usize, f32)> = None;
        let mut runner_up: Option<f32> = None;

        for (idx, entry) in gallery.iter().enumerate() {
            let Some(distance) = self.identity_distance(probe, entry) else {
                continue;
            };
            match best {
                // Strictly smaller only: on a tie the earlier identity keeps first place.
                Some((_, best_distance)) if distance < best_distance => {
                    runner_up = Some(best_distance);
                    best = Some((idx, distance));
                }
                Some(_) => {
                    runner_up = Some(runner_up.map_or(distance, |r| r.min(distance)));
                }
                None => best = Some((idx, distance)),
            }
        }

        let Some((best_idx, d1)) = best else {
            tracing::warn!(
                probe_dim = probe.dimension(),
                "probe not comparable with any gallery embedding"
            );
            return MatchDecision::no_match(NoMatchReason::LowQualityEmbedding);
        };

        let identity = &gallery[best_idx].identity;
        tracing::debug!(
            identity = %identity,
            d1,
            d2 = ?runner_up,
            threshold = self.threshold,
            margin = self.margin,
            "match candidates ranked"
        );

        if d1 > self.threshold {
            return MatchDecision::no_match(NoMatchReason::DistanceAboveThreshold);
        }
        if let Some(d2) = runner_up {
            if d2 - d1 < self.margin {
                return MatchDecision::no_match(NoMatchReason::AmbiguousMargin);
            }
        }

        MatchDecision::Matched(Match {
            identity: identity.clone(),
            distance: d1,
            confidence: self.confidence(d1),
        })
    }
}
