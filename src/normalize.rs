//! Converts engine output in frame pixels into the normalized wire shapes.

use crate::geometry;
use crate::inference::{Mask, RawClassification, RawDetection};
use crate::protocol::{Classification, Detection};

/// Contour simplification tolerance as a fraction of the contour perimeter.
pub const POLYGON_TOLERANCE: f64 = 0.02;

const COORDINATE_DECIMALS: i32 = 4;
const CONFIDENCE_DECIMALS: i32 = 3;

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[derive(Debug, Clone, Copy)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    fn normalize(&self, x: f64, y: f64) -> [f64; 2] {
        let nx = (x / self.width.max(1) as f64).clamp(0., 1.);
        let ny = (y / self.height.max(1) as f64).clamp(0., 1.);
        [
            round_to(nx, COORDINATE_DECIMALS),
            round_to(ny, COORDINATE_DECIMALS),
        ]
    }
}

pub fn normalize_bbox(bbox: [f32; 4], frame: FrameSize) -> [f64; 4] {
    let [x1, y1] = frame.normalize(bbox[0] as f64, bbox[1] as f64);
    let [x2, y2] = frame.normalize(bbox[2] as f64, bbox[3] as f64);
    [x1, y1, x2, y2]
}

/// Simplified outline of the mask in normalized frame coordinates. Masks come at the
/// model's prototype resolution and are scaled up to the frame first.
/// A contour failure drops the polygon and keeps the detection.
pub fn mask_to_polygon(mask: &Mask, frame: FrameSize) -> Option<Vec<[f64; 2]>> {
    let polygon = match geometry::mask_polygon(mask, POLYGON_TOLERANCE) {
        Ok(polygon) => polygon?,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to outline mask");
            return None;
        }
    };
    let scale_x = frame.width as f64 / mask.width().max(1) as f64;
    let scale_y = frame.height as f64 / mask.height().max(1) as f64;

    Some(
        polygon
            .iter()
            .map(|point| frame.normalize(point.x as f64 * scale_x, point.y as f64 * scale_y))
            .collect(),
    )
}

pub fn normalize_detection(detection: &RawDetection, frame: FrameSize) -> Detection {
    Detection {
        class_name: detection.class_name.clone(),
        confidence: round_to(detection.confidence as f64, CONFIDENCE_DECIMALS),
        bbox: normalize_bbox(detection.bbox, frame),
        polygon: detection
            .mask
            .as_ref()
            .and_then(|mask| mask_to_polygon(mask, frame)),
    }
}

/// Keeps the entries at or above `threshold`, in engine order.
pub fn filter_classifications(
    classifications: &[RawClassification],
    threshold: f32,
) -> Vec<Classification> {
    classifications
        .iter()
        .filter(|c| c.confidence >= threshold)
        .map(|c| Classification {
            class_name: c.class_name.clone(),
            confidence: round_to(c.confidence as f64, CONFIDENCE_DECIMALS),
        })
        .collect()
}
