//! Face location and embedding capabilities, and the pipeline that turns an
//! uploaded image into a probe embedding.
//!
//! Both capabilities are trait objects so the pretrained models can be
//! swapped without touching gallery or matching code.

use crate::config::RecognitionConfig;
use crate::detector::{DetectorError, ScrfdDetector};
use crate::frame::{Frame, FrameError};
use crate::recognizer::{ArcFaceEmbedder, RecognizerError};
use crate::types::{BoundingBox, Embedding, NoMatchReason};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CapabilityError {
    #[error("no usable face: {0}")]
    NoFaceOrLowQuality(String),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("{0}")]
    Other(String),
}

/// Finds faces in a frame.
pub trait FaceLocator: Send {
    /// Face boxes ordered largest-area first. An empty vector means no face.
    fn locate_faces(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, CapabilityError>;
}

/// Maps a located face to a fixed-length embedding.
pub trait Embedder: Send {
    /// Length of every embedding this embedder produces.
    fn dimension(&self) -> usize;

    fn embed(&mut self, frame: &Frame, face: &BoundingBox) -> Result<Embedding, CapabilityError>;
}

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("undecodable image: {0}")]
    Undecodable(#[from] FrameError),
    #[error("no face detected")]
    NoFace,
    #[error("face unusable for recognition: {0}")]
    LowQuality(String),
    #[error("embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("face locator failed: {0}")]
    Locator(CapabilityError),
}

impl ProbeError {
    /// Reason code reported when this failure ends a matching request.
    pub fn reason(&self) -> NoMatchReason {
        match self {
            ProbeError::Undecodable(_) | ProbeError::NoFace => NoMatchReason::NoFaceDetected,
            ProbeError::LowQuality(_)
            | ProbeError::DimensionMismatch { .. }
            | ProbeError::Locator(_) => NoMatchReason::LowQualityEmbedding,
        }
    }
}

/// The embedding of the primary face in one image.
#[derive(Debug, Clone)]
pub struct Probe {
    pub face: BoundingBox,
    pub embedding: Embedding,
    /// Number of faces the locator reported; only the largest is embedded.
    pub faces_found: usize,
}

/// Decode → (optional) lighting normalisation → locate → embed.
pub struct FacePipeline {
    locator: Box<dyn FaceLocator>,
    embedder: Box<dyn Embedder>,
    enhance: bool,
}

impl FacePipeline {
    pub fn new(locator: Box<dyn FaceLocator>, embedder: Box<dyn Embedder>) -> Self {
        Self {
            locator,
            embedder,
            enhance: true,
        }
    }

    /// Load the SCRFD locator and ArcFace embedder from the configured
    /// model directory.
    pub fn from_config(config: &RecognitionConfig) -> Result<Self, CapabilityError> {
        let locator = ScrfdDetector::load(&config.scrfd_model_path())?;
        let embedder = ArcFaceEmbedder::load(&config.arcface_model_path())?;
        Ok(Self::new(Box::new(locator), Box::new(embedder)).with_enhancement(config.enhance))
    }

    /// Enable or disable CLAHE before location (enabled by default).
    pub fn with_enhancement(mut self, enhance: bool) -> Self {
        self.enhance = enhance;
        self
    }

    pub fn dimension(&self) -> usize {
        self.embedder.dimension()
    }

    /// Embed the largest face of an encoded image.
    pub fn probe(&mut self, image: &[u8]) -> Result<Probe, ProbeError> {
        let frame = Frame::decode(image)?;
        self.probe_frame(frame)
    }

    /// Embed the largest face of an already-decoded frame.
    ///
    /// The embedder is never invoked when no face is found.
    pub fn probe_frame(&mut self, mut frame: Frame) -> Result<Probe, ProbeError> {
        if frame.is_dark() {
            tracing::debug!(
                brightness = frame.avg_brightness(),
                "dark frame, skipping face location"
            );
            return Err(ProbeError::NoFace);
        }
        if self.enhance {
            frame.enhance();
        }

        let faces = self
            .locator
            .locate_faces(&frame)
            .map_err(ProbeError::Locator)?;
        let faces_found = faces.len();
        let Some(face) = faces.into_iter().next() else {
            return Err(ProbeError::NoFace);
        };
        if faces_found > 1 {
            tracing::debug!(faces_found, "multiple faces, using the largest");
        }

        let embedding = match self.embedder.embed(&frame, &face) {
            Ok(e) => e,
            Err(CapabilityError::NoFaceOrLowQuality(why)) => return Err(ProbeError::LowQuality(why)),
            Err(e) => {
                tracing::error!(error = %e, "embedder failed");
                return Err(ProbeError::LowQuality(e.to_string()));
            }
        };

        let expected = self.embedder.dimension();
        if embedding.dimension() != expected {
            return Err(ProbeError::DimensionMismatch {
                expected,
                actual: embedding.dimension(),
            });
        }

        Ok(Probe {
            face,
            embedding,
            faces_found,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{gray_png, TableEmbedder, UniformLocator, FACELESS};
    use std::sync::atomic::Ordering;

    fn pipeline(extra_faces: usize) -> (FacePipeline, TableEmbedder) {
        let embedder = TableEmbedder::new(2)
            .with(120, vec![1.0, 0.0])
            .with(200, vec![1.0, 0.0, 0.0]);
        let p = FacePipeline::new(
            Box::new(UniformLocator::new().with_extra_faces(extra_faces)),
            Box::new(embedder.clone()),
        )
        .with_enhancement(false);
        (p, embedder)
    }

    #[test]
    fn test_probe_embeds_face() {
        let (mut p, embedder) = pipeline(0);
        let probe = p.probe(&gray_png(120)).unwrap();
        assert_eq!(probe.embedding.values, vec![1.0, 0.0]);
        assert_eq!(probe.faces_found, 1);
        assert_eq!(embedder.calls().load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_face_skips_embedder() {
        let (mut p, embedder) = pipeline(0);
        let err = p.probe(&gray_png(0)).unwrap_err();
        assert!(matches!(err, ProbeError::NoFace));
        assert_eq!(err.reason(), NoMatchReason::NoFaceDetected);
        assert_eq!(embedder.calls().load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_empty_locator_result_skips_embedder() {
        let (mut p, embedder) = pipeline(0);
        let frame = Frame::decode(&gray_png(FACELESS)).unwrap();
        assert!(!frame.is_dark());

        let err = p.probe_frame(frame).unwrap_err();
        assert!(matches!(err, ProbeError::NoFace));
        assert_eq!(err.reason(), NoMatchReason::NoFaceDetected);
        assert_eq!(embedder.calls().load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_corrupt_bytes_report_no_face() {
        let (mut p, _) = pipeline(0);
        let err = p.probe(b"\x89PNG but not really").unwrap_err();
        assert!(matches!(err, ProbeError::Undecodable(_)));
        assert_eq!(err.reason(), NoMatchReason::NoFaceDetected);
    }

    #[test]
    fn test_multiple_faces_uses_first() {
        let (mut p, embedder) = pipeline(3);
        let probe = p.probe(&gray_png(120)).unwrap();
        assert_eq!(probe.faces_found, 4);
        assert_eq!(probe.face.width, 8.0);
        assert_eq!(embedder.calls().load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_low_quality_embedding() {
        let (mut p, _) = pipeline(0);
        let err = p.probe(&gray_png(90)).unwrap_err();
        assert!(matches!(err, ProbeError::LowQuality(_)));
        assert_eq!(err.reason(), NoMatchReason::LowQualityEmbedding);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let (mut p, _) = pipeline(0);
        let err = p.probe(&gray_png(200)).unwrap_err();
        assert!(matches!(
            err,
            ProbeError::DimensionMismatch { expected: 2, actual: 3 }
        ));
    }

    #[test]
    fn test_enhancement_keeps_dark_check() {
        let (p, _) = pipeline(0);
        let mut p = p.with_enhancement(true);
        assert!(matches!(p.probe(&gray_png(5)), Err(ProbeError::NoFace)));
    }

    #[test]
    fn test_from_config_missing_models() {
        let config = RecognitionConfig {
            model_dir: "/nonexistent/models".into(),
            ..RecognitionConfig::default()
        };
        let err = FacePipeline::from_config(&config).err().unwrap();
        assert!(matches!(
            err,
            CapabilityError::Detector(DetectorError::ModelNotFound(_))
        ));
    }
}
