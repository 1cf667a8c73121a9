use crate::config::PipelineConfig;
use crate::inference::{
    codec::{decode_base64_payload, DecodeError, FrameDecoder},
    InferenceEngine, InferenceError, InferenceOutput, Mode,
};
use crate::normalize::{filter_classifications, normalize_detection, FrameSize};
use crate::protocol::{FrameMessage, ResultPayload, VisionResult};
use image::GenericImageView;
use std::{sync::Arc, time::Instant};
use thiserror::Error;
use tokio::sync::{AcquireError, Semaphore};
use tokio::task::JoinError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Frame decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("Inference failed: {0}")]
    Inference(#[from] InferenceError),
    #[error("Inference worker failed: {0}")]
    Worker(#[from] JoinError),
    #[error("Inference worker pool closed: {0}")]
    PoolClosed(#[from] AcquireError),
}

impl PipelineError {
    /// Short label used for logs and the failure counter.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Decode(
                DecodeError::EmptyPayload
                | DecodeError::PayloadTooLarge { .. }
                | DecodeError::Base64(_),
            ) => "payload",
            PipelineError::Decode(_) => "decode",
            PipelineError::Inference(_) => "inference",
            PipelineError::Worker(_) | PipelineError::PoolClosed(_) => "worker",
        }
    }
}

/// Decode, inference and normalization for one admitted frame.
///
/// Work runs on the blocking pool. The semaphore is shared by every connection and
/// bounds how many frames are decoded or inferred at once across the process.
#[derive(Clone)]
pub struct InferencePipeline {
    engine: Arc<dyn InferenceEngine>,
    decoder: Arc<dyn FrameDecoder>,
    workers: Arc<Semaphore>,
    max_frame_bytes: usize,
}

impl InferencePipeline {
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        decoder: Arc<dyn FrameDecoder>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            engine,
            decoder,
            workers: Arc::new(Semaphore::new(config.max_concurrent_inferences.max(1))),
            max_frame_bytes: config.max_frame_bytes,
        }
    }

    pub async fn process(&self, frame: FrameMessage) -> Result<VisionResult, PipelineError> {
        let worker = Arc::clone(&self.workers).acquire_owned().await?;
        let engine = Arc::clone(&self.engine);
        let decoder = Arc::clone(&self.decoder);
        let max_frame_bytes = self.max_frame_bytes;

        tokio::task::spawn_blocking(move || {
            let _worker = worker;
            run_frame(engine.as_ref(), decoder.as_ref(), frame, max_frame_bytes)
        })
        .await?
    }
}

fn run_frame(
    engine: &dyn InferenceEngine,
    decoder: &dyn FrameDecoder,
    frame: FrameMessage,
    max_frame_bytes: usize,
) -> Result<VisionResult, PipelineError> {
    let started = Instant::now();

    let bytes = decode_base64_payload(&frame.data, max_frame_bytes)?;
    let image = decoder.decode(&bytes)?;
    let (width, height) = image.dimensions();
    let output = engine.infer(&image, frame.mode, frame.confidence)?;

    let inference_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    let size = FrameSize::new(width, height);

    let payload = match output {
        InferenceOutput::Detections(mut detections) => {
            if frame.mode != Mode::Segment {
                detections.iter_mut().for_each(|d| d.mask = None);
            }
            ResultPayload::Detections {
                detections: detections
                    .iter()
                    .map(|d| normalize_detection(d, size))
                    .collect(),
            }
        }
        InferenceOutput::Classifications(classifications) => ResultPayload::Classifications {
            classifications: filter_classifications(&classifications, frame.confidence),
        },
    };

    tracing::debug!(
        mode = %frame.mode,
        width,
        height,
        inference_ms,
        "Frame processed"
    );

    Ok(VisionResult {
        payload,
        mode: frame.mode,
        inference_ms,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::inference::{codec::ImageCodec, Mask, RawClassification, RawDetection};
    use base64::{engine::general_purpose::STANDARD, Engine};
    use image::{DynamicImage, ImageBuffer, Rgb};
    use parking_lot::Mutex;
    use std::io::Cursor;

    pub(crate) fn jpeg_base64(width: u32, height: u32) -> String {
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(width, height, Rgb([40, 120, 200]));
        let mut bytes: Vec<u8> = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Jpeg)
            .unwrap();
        STANDARD.encode(bytes)
    }

    pub(crate) fn frame(data: String, mode: Mode, confidence: f32) -> FrameMessage {
        FrameMessage {
            data,
            mode,
            confidence,
        }
    }

    pub(crate) fn pipeline_with(engine: impl InferenceEngine) -> InferencePipeline {
        InferencePipeline::new(
            Arc::new(engine),
            Arc::new(ImageCodec),
            &PipelineConfig {
                max_concurrent_inferences: 2,
                max_frame_bytes: 1024 * 1024,
            },
        )
    }

    /// Returns a fixed box and a square mask in every mode, recording each call.
    #[derive(Default)]
    pub(crate) struct MockEngine {
        pub calls: Mutex<Vec<(Mode, f32)>>,
    }

    impl InferenceEngine for MockEngine {
        fn infer(
            &self,
            frame: &DynamicImage,
            mode: Mode,
            threshold: f32,
        ) -> Result<InferenceOutput, InferenceError> {
            self.calls.lock().push((mode, threshold));
            let (width, height) = frame.dimensions();

            if mode == Mode::Classify {
                return Ok(InferenceOutput::Classifications(vec![
                    RawClassification {
                        class_name: "tabby".into(),
                        confidence: 0.7,
                    },
                    RawClassification {
                        class_name: "lynx".into(),
                        confidence: 0.2,
                    },
                ]));
            }

            Ok(InferenceOutput::Detections(vec![RawDetection {
                class_name: "person".into(),
                confidence: 0.8765,
                bbox: [
                    width as f32 * 0.1,
                    height as f32 * 0.2,
                    width as f32 * 0.5,
                    height as f32 * 0.9,
                ],
                mask: Some(Mask::from_fn(32, 32, |x, y| {
                    (4..16).contains(&x) && (8..24).contains(&y)
                })),
            }]))
        }
    }

    #[tokio::test]
    async fn test_detect_result_is_normalized() {
        let engine = Arc::new(MockEngine::default());
        let pipeline = InferencePipeline::new(
            engine.clone(),
            Arc::new(ImageCodec),
            &PipelineConfig::default(),
        );

        let result = pipeline
            .process(frame(jpeg_base64(100, 100), Mode::Detect, 0.4))
            .await
            .unwrap();

        assert_eq!(result.mode, Mode::Detect);
        let ResultPayload::Detections { detections } = result.payload else {
            panic!("expected detections");
        };
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].class_name, "person");
        assert_eq!(detections[0].confidence, 0.877);
        assert_eq!(detections[0].bbox, [0.1, 0.2, 0.5, 0.9]);
        assert!(detections[0].polygon.is_none());
        assert_eq!(*engine.calls.lock(), vec![(Mode::Detect, 0.4)]);
    }

    #[tokio::test]
    async fn test_segment_result_carries_polygon() {
        let pipeline = pipeline_with(MockEngine::default());

        let result = pipeline
            .process(frame(jpeg_base64(64, 64), Mode::Segment, 0.25))
            .await
            .unwrap();

        let ResultPayload::Detections { detections } = result.payload else {
            panic!("expected detections");
        };
        let polygon = detections[0].polygon.as_ref().unwrap();
        assert!(polygon.len() >= 3);
        assert!(polygon
            .iter()
            .all(|p| (0. ..=1.).contains(&p[0]) && (0. ..=1.).contains(&p[1])));
    }

    #[tokio::test]
    async fn test_classify_filters_below_threshold() {
        let pipeline = pipeline_with(MockEngine::default());

        let result = pipeline
            .process(frame(jpeg_base64(32, 32), Mode::Classify, 0.5))
            .await
            .unwrap();

        assert_eq!(result.mode, Mode::Classify);
        let ResultPayload::Classifications { classifications } = result.payload else {
            panic!("expected classifications");
        };
        assert_eq!(classifications.len(), 1);
        assert_eq!(classifications[0].class_name, "tabby");
    }

    #[tokio::test]
    async fn test_bad_payloads_are_rejected() {
        let pipeline = pipeline_with(MockEngine::default());

        let err = pipeline
            .process(frame("@@@".into(), Mode::Detect, 0.25))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "payload");

        let not_an_image = STANDARD.encode(b"hello world");
        let err = pipeline
            .process(frame(not_an_image, Mode::Detect, 0.25))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "decode");
    }

    #[tokio::test]
    async fn test_oversized_payload_is_rejected_before_decode() {
        let pipeline = InferencePipeline::new(
            Arc::new(MockEngine::default()),
            Arc::new(ImageCodec),
            &PipelineConfig {
                max_concurrent_inferences: 1,
                max_frame_bytes: 16,
            },
        );

        let err = pipeline
            .process(frame(jpeg_base64(10, 10), Mode::Detect, 0.25))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Decode(DecodeError::PayloadTooLarge { max: 16, .. })
        ));
    }

    struct FailingEngine;

    impl InferenceEngine for FailingEngine {
        fn infer(
            &self,
            _frame: &DynamicImage,
            mode: Mode,
            _threshold: f32,
        ) -> Result<InferenceOutput, InferenceError> {
            Err(InferenceError::ModelLoad {
                mode,
                reason: "missing weights".into(),
            })
        }
    }

    struct PanickingEngine;

    impl InferenceEngine for PanickingEngine {
        fn infer(
            &self,
            _frame: &DynamicImage,
            _mode: Mode,
            _threshold: f32,
        ) -> Result<InferenceOutput, InferenceError> {
            panic!("engine exploded");
        }
    }

    #[tokio::test]
    async fn test_engine_failures_are_reported() {
        let err = pipeline_with(FailingEngine)
            .process(frame(jpeg_base64(8, 8), Mode::Segment, 0.25))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "inference");

        let err = pipeline_with(PanickingEngine)
            .process(frame(jpeg_base64(8, 8), Mode::Detect, 0.25))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Worker(_)));
    }
}
