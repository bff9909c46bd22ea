//! rollcall-core: face location, embedding and identity matching.
//!
//! Locates faces with SCRFD and embeds them with ArcFace, both through
//! ONNX Runtime, then matches the probe embedding against a gallery of
//! enrolled identities with a threshold + margin decision policy.

pub mod alignment;
pub mod config;
pub mod detector;
pub mod frame;
pub mod matcher;
pub mod pipeline;
pub mod recognizer;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{default_data_dir, default_model_dir, ConfigError, ConfigSource, RecognitionConfig};
pub use detector::ScrfdDetector;
pub use frame::{Frame, FrameError};
pub use matcher::{DistanceMetric, MarginMatcher, Matcher};
pub use pipeline::{CapabilityError, Embedder, FaceLocator, FacePipeline, Probe, ProbeError};
pub use recognizer::ArcFaceEmbedder;
pub use types::{
    BoundingBox, Embedding, GalleryEntry, Match, MatchDecision, NoMatchReason, ReferenceEmbedding,
};
