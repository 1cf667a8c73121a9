use super::{
    labels::load_labels, registry::ModelRegistry, InferenceEngine, InferenceError,
    InferenceOutput, Mask, Mode, RawClassification, RawDetection,
};
use crate::config::{ModelConfig, ModelsConfig};
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::{s, Array, ArrayD, ArrayView1, ArrayView2, Axis, Ix3, Ix4};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::{DynValue, TensorRef},
};
use parking_lot::Mutex;
use std::{path::Path, sync::Arc};

const MASK_COEFFICIENTS: usize = 32;
const TOP_K: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    anchor: usize,
    class_id: usize,
    confidence: f32,
    bbox: [f32; 4],
}

#[derive(Debug, Clone, Copy)]
struct FrameGeometry {
    width: u32,
    height: u32,
    input_size: u32,
}

fn intersection(box1: &[f32; 4], box2: &[f32; 4]) -> f32 {
    let width = (box1[2].min(box2[2]) - box1[0].max(box2[0])).max(0.);
    let height = (box1[3].min(box2[3]) - box1[1].max(box2[1])).max(0.);
    width * height
}

fn union(box1: &[f32; 4], box2: &[f32; 4]) -> f32 {
    ((box1[2] - box1[0]) * (box1[3] - box1[1])) + ((box2[2] - box2[0]) * (box2[3] - box2[1]))
        - intersection(box1, box2)
}

fn iou(box1: &[f32; 4], box2: &[f32; 4]) -> f32 {
    let union = union(box1, box2);
    if union <= 0. {
        return 0.;
    }
    intersection(box1, box2) / union
}

fn shape_error(err: ndarray::ShapeError) -> InferenceError {
    InferenceError::OutputShape(err.to_string())
}

fn class_label(labels: &[String], class_id: usize) -> String {
    labels
        .get(class_id)
        .cloned()
        .unwrap_or_else(|| format!("Unknown class {}", class_id))
}

fn transform_frame(frame: &DynamicImage, input_size: u32) -> Array<f32, Ix4> {
    let img = frame.resize_exact(input_size, input_size, FilterType::CatmullRom);
    let size = input_size as usize;

    let mut input = Array::zeros((1, 3, size, size));
    for pixel in img.pixels() {
        let x = pixel.0 as usize;
        let y = pixel.1 as usize;
        let [r, g, b, _] = pixel.2 .0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    input
}

/// `[1, features, anchors]` viewed as one row per anchor.
fn anchor_rows(output: &ArrayD<f32>) -> Result<ArrayView2<'_, f32>, InferenceError> {
    let output = output
        .view()
        .into_dimensionality::<Ix3>()
        .map_err(shape_error)?;
    if output.len_of(Axis(0)) == 0 {
        return Err(InferenceError::OutputShape("empty batch".into()));
    }
    Ok(output.index_axis_move(Axis(0), 0).reversed_axes())
}

fn decode_candidates(
    rows: ArrayView2<'_, f32>,
    num_classes: usize,
    threshold: f32,
    scale: (f32, f32),
) -> Vec<Candidate> {
    let (scale_x, scale_y) = scale;
    let mut candidates = Vec::new();

    for (anchor, row) in rows.axis_iter(Axis(0)).enumerate() {
        let best = row
            .iter()
            .skip(4)
            .take(num_classes)
            .copied()
            .enumerate()
            .reduce(|accum, item| if item.1 > accum.1 { item } else { accum });
        let Some((class_id, confidence)) = best else {
            continue;
        };

        if confidence < threshold {
            continue;
        }

        let xc = row[0] * scale_x;
        let yc = row[1] * scale_y;
        let w = row[2] * scale_x;
        let h = row[3] * scale_y;

        candidates.push(Candidate {
            anchor,
            class_id,
            confidence,
            bbox: [xc - w / 2., yc - h / 2., xc + w / 2., yc + h / 2.],
        });
    }

    candidates
}

/// Greedy per-class suppression, highest confidence first.
fn non_max_suppression(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|box1, box2| box2.confidence.total_cmp(&box1.confidence));

    let mut kept = Vec::new();
    while !candidates.is_empty() {
        let best = candidates[0];
        kept.push(best);
        candidates = candidates
            .into_iter()
            .skip(1)
            .filter(|other| {
                other.class_id != best.class_id || iou(&best.bbox, &other.bbox) < iou_threshold
            })
            .collect();
    }

    kept
}

struct Prototypes<'a> {
    matrix: ArrayView2<'a, f32>,
    width: u32,
    height: u32,
}

impl<'a> Prototypes<'a> {
    fn from_output(protos: &'a ArrayD<f32>) -> Result<Self, InferenceError> {
        let protos = protos
            .view()
            .into_dimensionality::<Ix4>()
            .map_err(shape_error)?;
        let (batch, channels, height, width) = protos.dim();
        if batch == 0 || channels != MASK_COEFFICIENTS {
            return Err(InferenceError::OutputShape(format!(
                "expected [1, {}, h, w] mask prototypes, got {:?}",
                MASK_COEFFICIENTS,
                protos.shape()
            )));
        }

        let matrix = protos
            .index_axis_move(Axis(0), 0)
            .into_shape_with_order((channels, height * width))
            .map_err(shape_error)?;

        Ok(Self {
            matrix,
            width: width as u32,
            height: height as u32,
        })
    }

    fn instance_mask(
        &self,
        coefficients: ArrayView1<'_, f32>,
        bbox: [f32; 4],
        geometry: FrameGeometry,
    ) -> Mask {
        let logits = coefficients.dot(&self.matrix);

        let scale_x = self.width as f32 / geometry.width as f32;
        let scale_y = self.height as f32 / geometry.height as f32;
        let (x1, y1) = (bbox[0] * scale_x, bbox[1] * scale_y);
        let (x2, y2) = (bbox[2] * scale_x, bbox[3] * scale_y);
        let width = self.width;

        // sigmoid(logit) > 0.5 exactly when logit > 0
        Mask::from_fn(self.width, self.height, |x, y| {
            let (fx, fy) = (x as f32, y as f32);
            fx >= x1
                && fx < x2
                && fy >= y1
                && fy < y2
                && logits[(y * width + x) as usize] > 0.
        })
    }
}

fn decode_detections(
    output: &ArrayD<f32>,
    protos: Option<&ArrayD<f32>>,
    labels: &[String],
    geometry: FrameGeometry,
    threshold: f32,
    iou_threshold: f32,
) -> Result<Vec<RawDetection>, InferenceError> {
    let rows = anchor_rows(output)?;
    let mask_features = if protos.is_some() {
        MASK_COEFFICIENTS
    } else {
        0
    };

    let features = rows.ncols();
    if features <= 4 + mask_features {
        return Err(InferenceError::OutputShape(format!(
            "{} features per anchor leaves no class scores",
            features
        )));
    }
    let num_classes = features - 4 - mask_features;

    let scale = (
        geometry.width as f32 / geometry.input_size as f32,
        geometry.height as f32 / geometry.input_size as f32,
    );
    let candidates = decode_candidates(rows, num_classes, threshold, scale);
    let kept = non_max_suppression(candidates, iou_threshold);

    let prototypes = protos.map(Prototypes::from_output).transpose()?;

    let detections = kept
        .into_iter()
        .map(|candidate| {
            let mask = prototypes.as_ref().map(|prototypes| {
                let coefficients = rows
                    .row(candidate.anchor)
                    .slice_move(s![4 + num_classes..]);
                prototypes.instance_mask(coefficients, candidate.bbox, geometry)
            });

            RawDetection {
                class_name: class_label(labels, candidate.class_id),
                confidence: candidate.confidence,
                bbox: candidate.bbox,
                mask,
            }
        })
        .collect();

    Ok(detections)
}

fn decode_classifications(output: &ArrayD<f32>, labels: &[String]) -> Vec<RawClassification> {
    let mut scores: Vec<(usize, f32)> = output.iter().copied().enumerate().collect();
    scores.sort_by(|a, b| b.1.total_cmp(&a.1));
    scores.truncate(TOP_K);

    scores
        .into_iter()
        .map(|(class_id, confidence)| RawClassification {
            class_name: class_label(labels, class_id),
            confidence,
        })
        .collect()
}

/// Copies a named model output into an owned array. Exports that name their outputs
/// differently surface as a shape error instead of a panic.
fn extract_output(value: Option<&DynValue>, name: &str) -> Result<ArrayD<f32>, InferenceError> {
    let value = value
        .ok_or_else(|| InferenceError::OutputShape(format!("model has no output named {}", name)))?;
    let (shape, data) = value.try_extract_tensor::<f32>()?;
    ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec())
        .map_err(|e| InferenceError::OutputShape(format!("invalid tensor shape: {}", e)))
}

fn create_session(model_path: &Path) -> Result<Session, ort::Error> {
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .commit_from_file(model_path)?;
    Ok(session)
}

struct OrtModel {
    session: Mutex<Session>,
    labels: Vec<String>,
    input_size: u32,
}

impl OrtModel {
    fn load(mode: Mode, model_config: &ModelConfig, model_dir: &Path) -> Result<Self, InferenceError> {
        let model_path = model_config.get_model_path(model_dir);
        if !model_path.exists() {
            return Err(InferenceError::ModelLoad {
                mode,
                reason: format!("model file not found: {:?}", model_path),
            });
        }

        let session = create_session(&model_path)?;
        let labels = load_labels(&model_config.get_labels_path(model_dir))?;

        tracing::info!(
            mode = %mode,
            model = ?model_path,
            classes = labels.len(),
            "Created ONNX session"
        );

        Ok(Self {
            session: Mutex::new(session),
            labels,
            input_size: model_config.input_size,
        })
    }

    fn run(
        &self,
        input: &Array<f32, Ix4>,
        output_names: &[&str],
    ) -> Result<Vec<ArrayD<f32>>, InferenceError> {
        let mut session = self.session.lock();

        let tensor_ref = TensorRef::from_array_view(input.view())?;
        let outputs = session.run(ort::inputs![tensor_ref])?;

        output_names
            .iter()
            .map(|&name| extract_output(outputs.get(name), name))
            .collect()
    }
}

/// ONNX Runtime engine for YOLOv8-style detection, segmentation and classification exports.
///
/// Each mode's session is created the first time a frame asks for it.
pub struct OrtEngine {
    config: ModelsConfig,
    registry: ModelRegistry<OrtModel>,
}

impl OrtEngine {
    pub fn new(config: ModelsConfig) -> Self {
        Self {
            config,
            registry: ModelRegistry::new(),
        }
    }

    fn model(&self, mode: Mode) -> Result<Arc<OrtModel>, InferenceError> {
        self.registry.get_or_load(mode, |mode| {
            OrtModel::load(mode, self.config.model(mode), &self.config.model_dir)
        })
    }
}

impl InferenceEngine for OrtEngine {
    fn infer(
        &self,
        frame: &DynamicImage,
        mode: Mode,
        threshold: f32,
    ) -> Result<InferenceOutput, InferenceError> {
        let model = self.model(mode)?;
        let (width, height) = frame.dimensions();
        let geometry = FrameGeometry {
            width,
            height,
            input_size: model.input_size,
        };
        let input = transform_frame(frame, model.input_size);

        match mode {
            Mode::Detect => {
                let outputs = model.run(&input, &["output0"])?;
                let detections = decode_detections(
                    &outputs[0],
                    None,
                    &model.labels,
                    geometry,
                    threshold,
                    self.config.iou_threshold,
                )?;
                Ok(InferenceOutput::Detections(detections))
            }
            Mode::Segment => {
                let outputs = model.run(&input, &["output0", "output1"])?;
                let detections = decode_detections(
                    &outputs[0],
                    Some(&outputs[1]),
                    &model.labels,
                    geometry,
                    threshold,
                    self.config.iou_threshold,
                )?;
                Ok(InferenceOutput::Detections(detections))
            }
            Mode::Classify => {
                let outputs = model.run(&input, &["output0"])?;
                Ok(InferenceOutput::Classifications(decode_classifications(
                    &outputs[0],
                    &model.labels,
                )))
            }
        }
    }
}
