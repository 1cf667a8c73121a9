pub mod codec;
pub mod labels;
pub mod ort_engine;
pub mod registry;

use image::DynamicImage;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Inference behaviour requested by a frame. Unknown or missing modes fall back to `Detect`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Detect,
    Segment,
    Classify,
}

impl Mode {
    pub const ALL: [Mode; 3] = [Mode::Detect, Mode::Segment, Mode::Classify];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Detect => "detect",
            Mode::Segment => "segment",
            Mode::Classify => "classify",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Mode::Detect => 0,
            Mode::Segment => 1,
            Mode::Classify => 2,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for Mode {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "detect" => Ok(Self::Detect),
            "segment" => Ok(Self::Segment),
            "classify" => Ok(Self::Classify),
            other => Err(format!(
                "{} is not a supported mode. Use `detect`, `segment` or `classify`.",
                other
            )),
        }
    }
}

/// Binary instance mask, row-major, at the resolution the model produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    width: u32,
    height: u32,
    data: Vec<bool>,
}

impl Mask {
    #[cfg(test)]
    pub fn new(width: u32, height: u32, data: Vec<bool>) -> Option<Self> {
        if data.len() != (width as usize) * (height as usize) {
            return None;
        }
        Some(Self {
            width,
            height,
            data,
        })
    }

    pub fn from_fn(width: u32, height: u32, f: impl Fn(u32, u32) -> bool) -> Self {
        let data = (0..height)
            .flat_map(|y| (0..width).map(move |x| (x, y)))
            .map(|(x, y)| f(x, y))
            .collect();
        Self {
            width,
            height,
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row-major 8-bit image of the mask, 255 for foreground.
    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        self.data.iter().map(|&set| if set { 255 } else { 0 }).collect()
    }

    /// Out-of-bounds coordinates read as background.
    #[cfg(test)]
    pub fn get(&self, x: i64, y: i64) -> bool {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return false;
        }
        self.data[y as usize * self.width as usize + x as usize]
    }

    #[cfg(test)]
    pub fn area(&self) -> usize {
        self.data.iter().filter(|&&set| set).count()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        !self.data.iter().any(|&set| set)
    }
}

/// A detection in frame pixel coordinates, as returned by an engine.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub class_name: String,
    pub confidence: f32,
    /// `[x1, y1, x2, y2]` in frame pixels.
    pub bbox: [f32; 4],
    pub mask: Option<Mask>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawClassification {
    pub class_name: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InferenceOutput {
    Detections(Vec<RawDetection>),
    Classifications(Vec<RawClassification>),
}

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Failed to load {mode} model: {reason}")]
    ModelLoad { mode: Mode, reason: String },
    #[error("ONNX Runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[error("Unexpected model output: {0}")]
    OutputShape(String),
    #[error("Failed to read labels: {0}")]
    Labels(#[from] std::io::Error),
}

/// Pluggable inference capability shared by every connection.
///
/// Implementations are called from blocking worker threads. Detection modes must
/// already filter by `threshold`; classification returns the top-5 entries and the
/// pipeline applies the threshold afterwards.
pub trait InferenceEngine: Send + Sync + 'static {
    fn infer(
        &self,
        frame: &DynamicImage,
        mode: Mode,
        threshold: f32,
    ) -> Result<InferenceOutput, InferenceError>;
}
