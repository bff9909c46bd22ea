//! Deterministic stand-ins for the ONNX capabilities.
//!
//! Images are uniform gray squares; the gray level selects the embedding.
//! An all-black image is rejected as dark before location, and a
//! [`FACELESS`] image is bright but the locator finds nothing in it.

use crate::frame::Frame;
use crate::pipeline::{CapabilityError, Embedder, FaceLocator, FacePipeline};
use crate::types::{BoundingBox, Embedding};
use image::{GrayImage, ImageFormat, Luma};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// PNG bytes of an 8×8 image filled with `level`.
pub fn gray_png(level: u8) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    GrayImage::from_pixel(8, 8, Luma([level]))
        .write_to(&mut buf, ImageFormat::Png)
        .expect("encoding an in-memory PNG cannot fail");
    buf.into_inner()
}

/// Gray level of a well-lit frame that contains no face.
pub const FACELESS: u8 = 77;

/// Reports one full-frame face for any frame that is neither entirely black
/// nor entirely [`FACELESS`], followed by `extra` 1×1 faces.
#[derive(Debug, Clone, Default)]
pub struct UniformLocator {
    extra: usize,
}

impl UniformLocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extra_faces(mut self, extra: usize) -> Self {
        self.extra = extra;
        self
    }
}

impl FaceLocator for UniformLocator {
    fn locate_faces(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, CapabilityError> {
        if frame.data.iter().all(|&p| p == 0) || frame.data.iter().all(|&p| p == FACELESS) {
            return Ok(Vec::new());
        }
        let full = BoundingBox {
            x: 0.0,
            y: 0.0,
            width: frame.width as f32,
            height: frame.height as f32,
            confidence: 0.9,
            landmarks: None,
        };
        let small = (0..self.extra).map(|i| BoundingBox {
            x: i as f32,
            width: 1.0,
            height: 1.0,
            ..full.clone()
        });
        Ok(std::iter::once(full.clone()).chain(small).collect())
    }
}

/// Maps the frame's first pixel value to a preset vector. Unknown levels fail
/// with `NoFaceOrLowQuality`. Clones share the call counter.
#[derive(Debug, Clone)]
pub struct TableEmbedder {
    table: HashMap<u8, Vec<f32>>,
    dimension: usize,
    calls: Arc<AtomicUsize>,
}

impl TableEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            table: HashMap::new(),
            dimension,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with(mut self, level: u8, values: Vec<f32>) -> Self {
        self.table.insert(level, values);
        self
    }

    /// Number of `embed` calls made through this embedder or its clones.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl Embedder for TableEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&mut self, frame: &Frame, _face: &BoundingBox) -> Result<Embedding, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let level = frame.data.first().copied().unwrap_or(0);
        self.table
            .get(&level)
            .map(|v| Embedding::new(v.clone()))
            .ok_or_else(|| CapabilityError::NoFaceOrLowQuality(format!("no embedding for level {level}")))
    }
}

/// Pipeline over the fakes with lighting normalisation off, so gray levels
/// reach the embedder unchanged.
pub fn fake_pipeline(embedder: TableEmbedder) -> FacePipeline {
    FacePipeline::new(Box::new(UniformLocator::new()), Box::new(embedder)).with_enhancement(false)
}
