//! Heuristic single-frame liveness gate.
//!
//! A printed photograph or a screen replay tends to lose high-frequency
//! detail: the face crop looks flatter, with less edge energy and less
//! micro-texture variation than a live face under the same camera. This
//! module scores that texture signal and, when eye landmarks are available,
//! adds a bonus for a detected blink (Eye Aspect Ratio below threshold).
//!
//! This is a gate, not a classifier. It must run before an embedding is
//! extracted, and a failing verdict rejects the attempt outright.
//!
//! # Threat Coverage
//!
//! - **Blocks:** low-resolution prints, blurry screen replays.
//! - **Does not block:** high-quality prints, sharp video replays, masks.
//!   The scaling constants are empirical and uncalibrated; tune them through
//!   [`LivenessConfig`] rather than treating them as invariants.

use image::{DynamicImage, GrayImage};

use crate::error::BiometricError;
use crate::stats;
use crate::types::{BoundingBox, FaceLandmarks, LivenessVerdict};

/// Number of contour points expected per eye (dlib 68-point convention).
const EYE_POINTS: usize = 6;

/// Tunable constants of the liveness heuristic.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Laplacian variance that maps to a full focus signal.
    pub focus_scale: f64,
    /// LBP code variance that maps to a full micro-texture signal.
    pub microtexture_scale: f64,
    /// Average EAR below which the eyes are considered closed.
    pub ear_threshold: f64,
    /// Score added when a blink is observed; also widens the normalizer.
    pub blink_bonus: f64,
    /// `is_live` requires `liveness_score` strictly above this value.
    pub live_threshold: f64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            focus_scale: 100.0,
            microtexture_scale: 50.0,
            ear_threshold: 0.25,
            blink_bonus: 0.3,
            live_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LivenessAnalyzer {
    config: LivenessConfig,
}

impl LivenessAnalyzer {
    pub fn new(config: LivenessConfig) -> Self {
        Self { config }
    }

    /// Full liveness assessment of one detected face.
    ///
    /// Without landmarks the score is the texture score alone. With
    /// landmarks the blink-weighted formula always applies; eyes with too
    /// few contour points count as no blink.
    pub fn analyze(
        &self,
        image: &DynamicImage,
        face: &BoundingBox,
        landmarks: Option<&FaceLandmarks>,
    ) -> Result<LivenessVerdict, BiometricError> {
        let texture_score = self.texture_score(image, face)?;
        let blink_detected = landmarks.map(|lm| self.detect_blink(lm).unwrap_or(false));

        let liveness_score = match blink_detected {
            None => texture_score,
            Some(blink) => {
                let bonus = if blink { self.config.blink_bonus } else { 0.0 };
                (texture_score + bonus) / (1.0 + self.config.blink_bonus)
            }
        };

        let verdict = LivenessVerdict {
            texture_score,
            blink_detected,
            liveness_score,
            is_live: liveness_score > self.config.live_threshold,
        };
        tracing::debug!(
            texture_score,
            blink = ?blink_detected,
            liveness_score,
            is_live = verdict.is_live,
            "liveness analysed"
        );
        Ok(verdict)
    }

    /// Map a verdict onto the gate: `LivenessFailed` unless live.
    pub fn require_live(&self, verdict: &LivenessVerdict) -> Result<(), BiometricError> {
        if verdict.is_live {
            Ok(())
        } else {
            Err(BiometricError::LivenessFailed)
        }
    }

    /// Texture score in `[0, 1]` for the face crop.
    ///
    /// Scans the whole crop; there is no early exit.
    pub fn texture_score(
        &self,
        image: &DynamicImage,
        face: &BoundingBox,
    ) -> Result<f64, BiometricError> {
        let gray = crop_gray(image, face)?;
        let focus = focus_measure(&gray);
        let micro = lbp_variance(&gray);
        Ok(((focus / self.config.focus_scale + micro / self.config.microtexture_scale) / 2.0)
            .min(1.0))
    }

    /// `Some(blink)` when both eyes carry at least six contour points.
    pub fn detect_blink(&self, landmarks: &FaceLandmarks) -> Option<bool> {
        let left = landmarks.left_eye();
        let right = landmarks.right_eye();
        if left.len() < EYE_POINTS || right.len() < EYE_POINTS {
            return None;
        }
        let avg = (eye_aspect_ratio(left) + eye_aspect_ratio(right)) / 2.0;
        Some(avg < self.config.ear_threshold)
    }
}

/// Eye Aspect Ratio over the six canonical contour points `p1..p6`:
/// `(|p2 - p6| + |p3 - p5|) / (2 |p1 - p4|)`.
///
/// Degenerate input (fewer than six points, zero eye width) reads as open.
pub fn eye_aspect_ratio(eye: &[(f64, f64)]) -> f64 {
    if eye.len() < EYE_POINTS {
        return 1.0;
    }
    let dist = |a: (f64, f64), b: (f64, f64)| ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt();

    let v1 = dist(eye[1], eye[5]);
    let v2 = dist(eye[2], eye[4]);
    let h = dist(eye[0], eye[3]);
    if h <= f64::EPSILON {
        return 1.0;
    }
    (v1 + v2) / (2.0 * h)
}

/// Crop the face box (clamped to the image) and convert it to grayscale.
fn crop_gray(image: &DynamicImage, face: &BoundingBox) -> Result<GrayImage, BiometricError> {
    let left = face.left.min(image.width());
    let right = face.right.min(image.width());
    let top = face.top.min(image.height());
    let bottom = face.bottom.min(image.height());

    if right <= left || bottom <= top {
        return Err(BiometricError::EmptyRegion);
    }
    Ok(image
        .crop_imm(left, top, right - left, bottom - top)
        .to_luma8())
}

/// Variance of the 4-neighbour Laplacian response (reflect-101 border).
pub fn focus_measure(gray: &GrayImage) -> f64 {
    let (w, h) = gray.dimensions();
    let px = |x: i64, y: i64| -> f64 {
        f64::from(gray.get_pixel(reflect101(x, w), reflect101(y, h)).0[0])
    };

    let mut responses = Vec::with_capacity((w * h) as usize);
    for y in 0..i64::from(h) {
        for x in 0..i64::from(w) {
            let lap = px(x - 1, y) + px(x + 1, y) + px(x, y - 1) + px(x, y + 1) - 4.0 * px(x, y);
            responses.push(lap);
        }
    }
    stats::mean_std_var(&responses)[2]
}

/// Variance of 8-bit Local Binary Pattern codes over the interior pixels.
///
/// Each bit records whether a neighbour is strictly brighter than the
/// centre, clockwise from the top-left neighbour (bit 7) to the left
/// neighbour (bit 0). Crops smaller than 3×3 have no interior and score 0.
pub fn lbp_variance(gray: &GrayImage) -> f64 {
    const NEIGHBOURS: [(i32, i32); 8] = [
        (-1, -1),
        (0, -1),
        (1, -1),
        (1, 0),
        (1, 1),
        (0, 1),
        (-1, 1),
        (-1, 0),
    ];

    let (w, h) = gray.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }

    let mut codes = Vec::with_capacity(((w - 2) * (h - 2)) as usize);
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let centre = gray.get_pixel(x, y).0[0];
            let mut code = 0u8;
            for (bit, (dx, dy)) in NEIGHBOURS.iter().enumerate() {
                let nx = (x as i32 + dx) as u32;
                let ny = (y as i32 + dy) as u32;
                if gray.get_pixel(nx, ny).0[0] > centre {
                    code |= 1 << (7 - bit);
                }
            }
            codes.push(f64::from(code));
        }
    }
    stats::mean_std_var(&codes)[2]
}

fn reflect101(i: i64, n: u32) -> u32 {
    let n = i64::from(n);
    if n == 1 {
        return 0;
    }
    let r = if i < 0 {
        -i
    } else if i >= n {
        2 * n - 2 - i
    } else {
        i
    };
    r as u32
}
