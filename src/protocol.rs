//! JSON messages exchanged on the vision websocket.

use crate::inference::Mode;
use serde::{Deserialize, Deserializer, Serialize};

pub const DEFAULT_CONFIDENCE: f32 = 0.25;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Auth { token: String },
    Frame(FrameMessage),
    /// Any other `type`. Ignored so newer clients can send control messages.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FrameMessage {
    #[serde(default)]
    pub data: String,
    #[serde(default, deserialize_with = "deserialize_mode")]
    pub mode: Mode,
    #[serde(default = "default_confidence", deserialize_with = "deserialize_confidence")]
    pub confidence: f32,
}

fn default_confidence() -> f32 {
    DEFAULT_CONFIDENCE
}

fn deserialize_mode<'de, D>(deserializer: D) -> Result<Mode, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(value
        .as_str()
        .and_then(|s| Mode::try_from(s).ok())
        .unwrap_or_default())
}

fn deserialize_confidence<'de, D>(deserializer: D) -> Result<f32, D::Error>
where
    D: Deserializer<'de>,
{
    let confidence = Option::<f64>::deserialize(deserializer)?;
    Ok(confidence
        .filter(|c| c.is_finite())
        .map(|c| c.clamp(0.0, 1.0) as f32)
        .unwrap_or(DEFAULT_CONFIDENCE))
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "vision.connected")]
    Connected,
    #[serde(rename = "vision.result")]
    Result(VisionResult),
    #[serde(rename = "error")]
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VisionResult {
    #[serde(flatten)]
    pub payload: ResultPayload,
    pub mode: Mode,
    pub inference_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResultPayload {
    Detections { detections: Vec<Detection> },
    Classifications { classifications: Vec<Classification> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    #[serde(rename = "class")]
    pub class_name: String,
    pub confidence: f64,
    pub bbox: [f64; 4],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub polygon: Option<Vec<[f64; 2]>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    #[serde(rename = "class")]
    pub class_name: String,
    pub confidence: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> ClientMessage {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_frame_defaults() {
        let message = parse(json!({"type": "frame", "data": "abc"}));

        let ClientMessage::Frame(frame) = message else {
            panic!("expected a frame message");
        };
        assert_eq!(frame.data, "abc");
        assert_eq!(frame.mode, Mode::Detect);
        assert!((frame.confidence - DEFAULT_CONFIDENCE).abs() < f32::EPSILON);
    }

    #[test]
    fn test_frame_mode_fallbacks() {
        for mode in [
            json!("pose"),
            json!("CLASSIFY"),
            json!("Segment"),
            json!(null),
            json!(3),
        ] {
            let ClientMessage::Frame(frame) = parse(json!({"type": "frame", "mode": mode}))
            else {
                panic!("expected a frame message");
            };
            assert_eq!(frame.mode, Mode::Detect);
        }

        let ClientMessage::Frame(frame) =
            parse(json!({"type": "frame", "mode": "segment", "confidence": 1.7}))
        else {
            panic!("expected a frame message");
        };
        assert_eq!(frame.mode, Mode::Segment);
        assert!((frame.confidence - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_auth_and_unknown_types() {
        assert!(matches!(
            parse(json!({"type": "auth", "token": "T"})),
            ClientMessage::Auth { token } if token == "T"
        ));
        assert!(matches!(
            parse(json!({"type": "ping", "anything": [1, 2]})),
            ClientMessage::Unknown
        ));
        assert!(serde_json::from_value::<ClientMessage>(json!({"token": "T"})).is_err());
    }

    #[test]
    fn test_serialize_server_messages() {
        let connected = serde_json::to_value(ServerMessage::Connected).unwrap();
        assert_eq!(connected, json!({"type": "vision.connected"}));

        let error = serde_json::to_value(ServerMessage::Error {
            message: "Authentication required.".into(),
        })
        .unwrap();
        assert_eq!(
            error,
            json!({"type": "error", "message": "Authentication required."})
        );
    }

    #[test]
    fn test_serialize_detection_result() {
        let result = ServerMessage::Result(VisionResult {
            payload: ResultPayload::Detections {
                detections: vec![
                    Detection {
                        class_name: "person".into(),
                        confidence: 0.912,
                        bbox: [0.1, 0.2, 0.3, 0.4],
                        polygon: None,
                    },
                    Detection {
                        class_name: "dog".into(),
                        confidence: 0.5,
                        bbox: [0.0, 0.0, 1.0, 1.0],
                        polygon: Some(vec![[0.0, 0.0], [1.0, 0.5]]),
                    },
                ],
            },
            mode: Mode::Segment,
            inference_ms: 42,
        });

        assert_eq!(
            serde_json::to_value(result).unwrap(),
            json!({
                "type": "vision.result",
                "detections": [
                    {"class": "person", "confidence": 0.912, "bbox": [0.1, 0.2, 0.3, 0.4]},
                    {
                        "class": "dog",
                        "confidence": 0.5,
                        "bbox": [0.0, 0.0, 1.0, 1.0],
                        "polygon": [[0.0, 0.0], [1.0, 0.5]]
                    }
                ],
                "mode": "segment",
                "inference_ms": 42
            })
        );
    }

    #[test]
    fn test_serialize_classification_result() {
        let result = ServerMessage::Result(VisionResult {
            payload: ResultPayload::Classifications {
                classifications: vec![Classification {
                    class_name: "tabby".into(),
                    confidence: 0.77,
                }],
            },
            mode: Mode::Classify,
            inference_ms: 7,
        });

        assert_eq!(
            serde_json::to_value(result).unwrap(),
            json!({
                "type": "vision.result",
                "classifications": [{"class": "tabby", "confidence": 0.77}],
                "mode": "classify",
                "inference_ms": 7
            })
        );
    }
}
