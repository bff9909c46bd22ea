//! SCRFD face locator via ONNX Runtime.
//!
//! Letterboxes the frame to the 640×640 model input, decodes the three
//! anchor-free stride heads (scores, box offsets, five-point landmarks),
//! suppresses overlaps and returns faces largest-area first.

use crate::frame::Frame;
use crate::pipeline::{CapabilityError, FaceLocator};
use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::cmp::Ordering;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} (download det_10g.onnx from insightface into the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Maps letterboxed model coordinates back to the source frame.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let target = SCRFD_INPUT_SIZE as f32;
        let scale = (target / width as f32).min(target / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((target - new_w) / 2.0).floor(),
            pad_y: ((target - new_h) / 2.0).floor(),
        }
    }

    fn unmap(&self, (x, y): (f32, f32)) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor positions for one stride head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideOutputs {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// SCRFD-based face locator.
pub struct ScrfdDetector {
    session: Session,
    /// Per-stride output positions for strides [8, 16, 32].
    outputs: [StrideOutputs; 3],
    confidence_threshold: f32,
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let outputs = discover_outputs(&output_names);
        tracing::debug!(?outputs, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            outputs,
            confidence_threshold: SCRFD_CONFIDENCE_THRESHOLD,
        })
    }

    pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    /// Detect faces, largest area first.
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = letterbox_tensor(frame);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let StrideOutputs { score, bbox, kps } = self.outputs[slot];

            let (_, scores) = outputs[score]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, boxes) = outputs[bbox]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("boxes stride {stride}: {e}")))?;
            let (_, points) = outputs[kps]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("kps stride {stride}: {e}")))?;

            candidates.extend(decode_stride(
                scores,
                boxes,
                points,
                stride,
                &letterbox,
                self.confidence_threshold,
            ));
        }

        let mut faces = nms(candidates, SCRFD_NMS_THRESHOLD);
        sort_largest_first(&mut faces);
        Ok(faces)
    }
}

impl FaceLocator for ScrfdDetector {
    fn locate_faces(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, CapabilityError> {
        Ok(self.detect(frame)?)
    }
}

/// Resize into the model square (aspect preserved, centred) and normalise to
/// a 1×3×640×640 tensor. Padding uses the mean so it normalises to zero.
fn letterbox_tensor(frame: &Frame) -> (Array4<f32>, Letterbox) {
    let letterbox = Letterbox::fit(frame.width, frame.height);
    let new_w = ((frame.width as f32 * letterbox.scale).round() as u32).max(1);
    let new_h = ((frame.height as f32 * letterbox.scale).round() as u32).max(1);
    let resized = imageops::resize(&frame.to_image(), new_w, new_h, FilterType::Triangle);

    let (pad_x, pad_y) = (letterbox.pad_x as u32, letterbox.pad_y as u32);
    let size = SCRFD_INPUT_SIZE;
    let tensor = Array4::from_shape_fn((1, 3, size, size), |(_, _, y, x)| {
        let (x, y) = (x as u32, y as u32);
        let pixel = if x >= pad_x && x < pad_x + new_w && y >= pad_y && y < pad_y + new_h {
            resized.get_pixel(x - pad_x, y - pad_y).0[0] as f32
        } else {
            SCRFD_MEAN
        };
        // Grayscale is replicated into all three channels.
        (pixel - SCRFD_MEAN) / SCRFD_STD
    });

    (tensor, letterbox)
}

/// Locate each stride's score/bbox/kps outputs.
///
/// Exports either name them ("score_8", "bbox_16", "kps_32", ...) or use
/// opaque numeric names, in which case the standard positional layout applies:
/// [0-2] scores, [3-5] boxes, [6-8] keypoints, each ordered by stride.
fn discover_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| {
            Some(StrideOutputs {
                score: find("score", stride)?,
                bbox: find("bbox", stride)?,
                kps: find("kps", stride)?,
            })
        })
        .collect();

    match named {
        Some(found) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [found[0], found[1], found[2]]
        }
        None => {
            tracing::info!(?names, "SCRFD: output names not recognized, using positional mapping");
            std::array::from_fn(|i| StrideOutputs {
                score: i,
                bbox: i + 3,
                kps: i + 6,
            })
        }
    }
}

/// Decode the detections of one stride head above `threshold`.
fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    points: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid_w = SCRFD_INPUT_SIZE / stride;
    let grid_h = SCRFD_INPUT_SIZE / stride;
    let anchors = grid_w * grid_h * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    scores
        .iter()
        .take(anchors)
        .enumerate()
        .filter(|(_, &score)| score > threshold)
        .filter_map(|(idx, &score)| {
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid_w) as f32 * step;
            let cy = (cell / grid_w) as f32 * step;

            let offsets = boxes.get(idx * 4..idx * 4 + 4)?;
            let (x1, y1) = letterbox.unmap((cx - offsets[0] * step, cy - offsets[1] * step));
            let (x2, y2) = letterbox.unmap((cx + offsets[2] * step, cy + offsets[3] * step));

            let landmarks = points.get(idx * 10..idx * 10 + 10).map(|kp| {
                std::array::from_fn(|i| letterbox.unmap((cx + kp[i * 2] * step, cy + kp[i * 2 + 1] * step)))
            });

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
                landmarks,
            })
        })
        .collect()
}

fn by_confidence_desc(a: &BoundingBox, b: &BoundingBox) -> Ordering {
    b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal)
}

/// Largest area first; equal areas keep the more confident box first.
fn sort_largest_first(faces: &mut [BoundingBox]) {
    faces.sort_by(|a, b| {
        b.area()
            .partial_cmp(&a.area())
            .unwrap_or(Ordering::Equal)
            .then_with(|| by_confidence_desc(a, b))
    });
}

/// Non-maximum suppression: greedily keep the most confident box and drop
/// any later box overlapping a kept one by more than `iou_threshold`.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(by_confidence_desc);

    let mut keep: Vec<BoundingBox> = Vec::new();
    for candidate in detections {
        if keep.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Intersection-over-Union of two boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
