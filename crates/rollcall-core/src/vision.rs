//! Model seams used by the recorder, and the ONNX-backed implementation.

use crate::detector::{DetectorError, FaceDetector};
use crate::emotion::{EmotionError, EmotionNet};
use crate::frame::Frame;
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, Embedding, EmotionScore};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";
pub const EMOTION_MODEL_FILE: &str = "emotion-ferplus-8.onnx";

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("{0} model not loaded")]
    Unavailable(&'static str),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("emotion: {0}")]
    Emotion(#[from] EmotionError),
}

/// Scores the dominant emotion of the face in a frame.
///
/// `Ok(None)` means no face was found.
pub trait EmotionClassifier {
    fn classify(&mut self, frame: &Frame) -> Result<Option<EmotionScore>, VisionError>;
}

/// Produces an identity embedding for the face in a frame.
///
/// `Ok(None)` means no face was found.
pub trait FaceEncoder {
    fn encode(&mut self, frame: &Frame) -> Result<Option<Embedding>, VisionError>;
}

/// No models at all: every call reports the capability as unavailable.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoVision;

impl EmotionClassifier for NoVision {
    fn classify(&mut self, _frame: &Frame) -> Result<Option<EmotionScore>, VisionError> {
        Err(VisionError::Unavailable("emotion"))
    }
}

impl FaceEncoder for NoVision {
    fn encode(&mut self, _frame: &Frame) -> Result<Option<Embedding>, VisionError> {
        Err(VisionError::Unavailable("recognizer"))
    }
}

/// Paths to the three ONNX models inside a model directory.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub detector: PathBuf,
    pub recognizer: PathBuf,
    pub emotion: PathBuf,
}

impl ModelPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            detector: dir.join(DETECTOR_MODEL_FILE),
            recognizer: dir.join(RECOGNIZER_MODEL_FILE),
            emotion: dir.join(EMOTION_MODEL_FILE),
        }
    }
}

/// SCRFD + ArcFace + FER+ behind the recorder's model seams.
///
/// Any model may be absent; calls needing it fail with
/// [`VisionError::Unavailable`].
pub struct OnnxVision {
    detector: Option<FaceDetector>,
    recognizer: Option<FaceRecognizer>,
    emotion: Option<EmotionNet>,
}

impl OnnxVision {
    /// Load every model that can be loaded, logging the ones that cannot.
    pub fn load_available(paths: &ModelPaths) -> Self {
        let detector = FaceDetector::load(&paths.detector)
            .map_err(|e| tracing::warn!(error = %e, "face detector unavailable"))
            .ok();
        let recognizer = FaceRecognizer::load(&paths.recognizer)
            .map_err(|e| tracing::warn!(error = %e, "face recognizer unavailable"))
            .ok();
        let emotion = EmotionNet::load(&paths.emotion)
            .map_err(|e| tracing::warn!(error = %e, "emotion model unavailable"))
            .ok();

        Self {
            detector,
            recognizer,
            emotion,
        }
    }

    /// Load all three models, failing on the first that cannot be loaded.
    pub fn load(paths: &ModelPaths) -> Result<Self, VisionError> {
        Ok(Self {
            detector: Some(FaceDetector::load(&paths.detector)?),
            recognizer: Some(FaceRecognizer::load(&paths.recognizer)?),
            emotion: Some(EmotionNet::load(&paths.emotion)?),
        })
    }

    pub fn has_detector(&self) -> bool {
        self.detector.is_some()
    }

    pub fn has_recognizer(&self) -> bool {
        self.recognizer.is_some()
    }

    pub fn has_emotion(&self) -> bool {
        self.emotion.is_some()
    }

    fn best_face(&mut self, frame: &Frame) -> Result<Option<BoundingBox>, VisionError> {
        let detector = self.detector.as_mut().ok_or(VisionError::Unavailable("detector"))?;
        if frame.is_dark() {
            tracing::warn!(brightness = frame.avg_brightness(), "frame too dark for detection");
            return Ok(None);
        }
        let face = detector.detect_best(frame)?;
        if let Some(face) = &face {
            tracing::debug!(confidence = face.confidence, "best face selected");
        }
        Ok(face)
    }
}

impl EmotionClassifier for OnnxVision {
    fn classify(&mut self, frame: &Frame) -> Result<Option<EmotionScore>, VisionError> {
        if self.emotion.is_none() {
            return Err(VisionError::Unavailable("emotion"));
        }
        let Some(face) = self.best_face(frame)? else {
            return Ok(None);
        };
        let net = self.emotion.as_mut().ok_or(VisionError::Unavailable("emotion"))?;
        Ok(Some(net.classify(frame, &face)?))
    }
}

impl FaceEncoder for OnnxVision {
    fn encode(&mut self, frame: &Frame) -> Result<Option<Embedding>, VisionError> {
        if self.recognizer.is_none() {
            return Err(VisionError::Unavailable("recognizer"));
        }
        let Some(face) = self.best_face(frame)? else {
            return Ok(None);
        };
        let recognizer = self
            .recognizer
            .as_mut()
            .ok_or(VisionError::Unavailable("recognizer"))?;
        Ok(Some(recognizer.extract(frame, &face)?))
    }
}
