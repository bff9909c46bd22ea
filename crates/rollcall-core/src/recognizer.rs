//! ArcFace face embedder via ONNX Runtime.
//!
//! Extracts 512-dimensional face embeddings from aligned face crops,
//! using the w600k_r50 ArcFace model.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::frame::Frame;
use crate::pipeline::{CapabilityError, Embedder};
use crate::types::{BoundingBox, Embedding};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// Differs from SCRFD: ArcFace uses symmetric normalization.
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
pub const ARCFACE_EMBEDDING_DIM: usize = 512;
pub const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

/// Raw outputs with a smaller L2 norm carry no usable identity signal.
const MIN_EMBEDDING_NORM: f32 = 1e-6;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} (download w600k_r50.onnx from insightface into the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face has no landmarks; the locator must supply them for alignment")]
    NoLandmarks,
    #[error("degenerate embedding (norm {0})")]
    Degenerate(f32),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace-based embedder.
pub struct ArcFaceEmbedder {
    session: Session,
}

impl ArcFaceEmbedder {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Align the face to the canonical 112x112 crop and extract its
    /// unit-length embedding.
    pub fn extract(&mut self, frame: &Frame, face: &BoundingBox) -> Result<Embedding, RecognizerError> {
        let landmarks = face.landmarks.as_ref().ok_or(RecognizerError::NoLandmarks)?;
        let aligned = alignment::align_face(frame, landmarks);
        let input = preprocess(&aligned);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        finish_embedding(raw.to_vec())
    }
}

impl Embedder for ArcFaceEmbedder {
    fn dimension(&self) -> usize {
        ARCFACE_EMBEDDING_DIM
    }

    fn embed(&mut self, frame: &Frame, face: &BoundingBox) -> Result<Embedding, CapabilityError> {
        match self.extract(frame, face) {
            Ok(embedding) => Ok(embedding),
            Err(e @ (RecognizerError::NoLandmarks | RecognizerError::Degenerate(_))) => {
                Err(CapabilityError::NoFaceOrLowQuality(e.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Check the raw model output and L2-normalize it.
fn finish_embedding(raw: Vec<f32>) -> Result<Embedding, RecognizerError> {
    if raw.len() != ARCFACE_EMBEDDING_DIM {
        return Err(RecognizerError::InferenceFailed(format!(
            "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
            raw.len()
        )));
    }

    let embedding = Embedding {
        values: raw,
        model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
    };
    let norm = embedding.norm();
    if !norm.is_finite() || norm < MIN_EMBEDDING_NORM {
        return Err(RecognizerError::Degenerate(norm));
    }
    Ok(embedding.normalized())
}

/// Aligned grayscale crop → NCHW float tensor, channels replicated.
fn preprocess(aligned: &Frame) -> Array4<f32> {
    let size = ALIGNED_SIZE as usize;
    Array4::from_shape_fn((1, 3, size, size), |(_, _, y, x)| {
        let pixel = aligned.data.get(y * size + x).copied().unwrap_or(0) as f32;
        (pixel - ARCFACE_MEAN) / ARCFACE_STD
    })
}
