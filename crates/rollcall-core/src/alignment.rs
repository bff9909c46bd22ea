//! Face alignment to the canonical ArcFace crop.
//!
//! Fits a 4-DOF similarity transform (scale, rotation, translation) from the
//! five detected landmarks to the InsightFace reference positions, then
//! resamples the face into a 112×112 grayscale frame.

use crate::frame::Frame;

/// ArcFace reference landmarks for a 112×112 output.
pub const REFERENCE_LANDMARKS: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// Similarity transform `dst = [a -b; b a] * src + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    /// Uniform scale factor of the transform.
    pub fn scale(&self) -> f32 {
        (self.a * self.a + self.b * self.b).sqrt()
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    /// Map a destination point back into source coordinates.
    /// `None` for a degenerate (zero-scale) transform.
    pub fn invert(&self, (x, y): (f32, f32)) -> Option<(f32, f32)> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (dx, dy) = (x - self.tx, y - self.ty);
        Some((
            (self.a * dx + self.b * dy) / det,
            (-self.b * dx + self.a * dy) / det,
        ))
    }
}

fn centroid(points: &[(f32, f32); 5]) -> (f32, f32) {
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
    (sx / 5.0, sy / 5.0)
}

/// Least-squares similarity transform mapping `src` onto `dst`.
///
/// Closed form on centred coordinates; falls back to a pure translation when
/// all source points coincide.
pub fn estimate_similarity(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Similarity {
    let (scx, scy) = centroid(src);
    let (dcx, dcy) = centroid(dst);

    let mut dot = 0.0f32;
    let mut cross = 0.0f32;
    let mut energy = 0.0f32;
    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
        let (sx, sy) = (sx - scx, sy - scy);
        let (dx, dy) = (dx - dcx, dy - dcy);
        dot += sx * dx + sy * dy;
        cross += sx * dy - sy * dx;
        energy += sx * sx + sy * sy;
    }

    let (a, b) = if energy > 1e-12 {
        (dot / energy, cross / energy)
    } else {
        (1.0, 0.0)
    };

    Similarity {
        a,
        b,
        tx: dcx - (a * scx - b * scy),
        ty: dcy - (b * scx + a * scy),
    }
}

/// Resample `frame` through the inverse of `transform` into a square output.
/// Pixels that map outside the source are black.
pub fn warp(frame: &Frame, transform: &Similarity, out_size: u32) -> Frame {
    let size = out_size as usize;
    let (w, h) = (frame.width as i64, frame.height as i64);
    let sample = |x: i64, y: i64| -> f32 {
        if (0..w).contains(&x) && (0..h).contains(&y) {
            frame.data[(y * w + x) as usize] as f32
        } else {
            0.0
        }
    };

    let mut data = vec![0u8; size * size];
    for (idx, out) in data.iter_mut().enumerate() {
        let (ox, oy) = ((idx % size) as f32, (idx / size) as f32);
        let Some((sx, sy)) = transform.invert((ox, oy)) else {
            continue;
        };
        let (x0, y0) = (sx.floor() as i64, sy.floor() as i64);
        let (fx, fy) = (sx - sx.floor(), sy - sy.floor());
        let val = sample(x0, y0) * (1.0 - fx) * (1.0 - fy)
            + sample(x0 + 1, y0) * fx * (1.0 - fy)
            + sample(x0, y0 + 1) * (1.0 - fx) * fy
            + sample(x0 + 1, y0 + 1) * fx * fy;
        *out = val.round().clamp(0.0, 255.0) as u8;
    }

    Frame {
        data,
        width: out_size,
        height: out_size,
    }
}

/// Align a located face into the canonical 112×112 ArcFace crop.
pub fn align_face(frame: &Frame, landmarks: &[(f32, f32); 5]) -> Frame {
    let transform = estimate_similarity(landmarks, &REFERENCE_LANDMARKS);
    warp(frame, &transform, ALIGNED_SIZE)
}
