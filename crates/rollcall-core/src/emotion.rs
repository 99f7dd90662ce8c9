//! FER+ facial emotion classifier via ONNX Runtime.
//!
//! Takes a 64×64 grayscale face crop and scores eight classes; the class set
//! is folded into the recorder's seven-label vocabulary.

use crate::frame::Frame;
use crate::types::{BoundingBox, Emotion, EmotionScore};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const FERPLUS_INPUT_SIZE: u32 = 64;
/// Fraction of the face box added on each side before cropping.
const FACE_MARGIN: f32 = 0.1;

/// FER+ output order.
const FERPLUS_CLASSES: [Emotion; 8] = [
    Emotion::Neutral,
    Emotion::Happy,    // happiness
    Emotion::Surprise,
    Emotion::Sad,      // sadness
    Emotion::Angry,    // anger
    Emotion::Disgust,
    Emotion::Fear,
    Emotion::Disgust,  // contempt
];

#[derive(Error, Debug)]
pub enum EmotionError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face box lies outside the frame")]
    EmptyCrop,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct EmotionNet {
    session: Session,
}

impl EmotionNet {
    pub fn load(model_path: &Path) -> Result<Self, EmotionError> {
        if !model_path.exists() {
            return Err(EmotionError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path)?;

        tracing::info!(path = %model_path.display(), "loaded FER+ model");
        Ok(Self { session })
    }

    /// Classify the dominant emotion of `face` in `frame`.
    pub fn classify(
        &mut self,
        frame: &Frame,
        face: &BoundingBox,
    ) -> Result<EmotionScore, EmotionError> {
        let crop = frame.crop(&expand(face, FACE_MARGIN)).ok_or(EmotionError::EmptyCrop)?;
        let input = preprocess(&crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, logits) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmotionError::InferenceFailed(format!("emotion output: {e}")))?;

        let score = dominant(logits).ok_or_else(|| {
            EmotionError::InferenceFailed(format!(
                "expected {} scores, got {}",
                FERPLUS_CLASSES.len(),
                logits.len()
            ))
        })?;
        tracing::debug!(
            emotion = %score.emotion,
            confidence = score.confidence,
            "emotion classified"
        );
        Ok(score)
    }
}

fn expand(face: &BoundingBox, margin: f32) -> BoundingBox {
    let (dx, dy) = (face.width * margin, face.height * margin);
    BoundingBox {
        x: face.x - dx,
        y: face.y - dy,
        width: face.width + 2.0 * dx,
        height: face.height + 2.0 * dy,
        confidence: face.confidence,
        landmarks: face.landmarks,
    }
}

/// FER+ takes raw 0–255 intensities, no normalization.
fn preprocess(crop: &Frame) -> Array4<f32> {
    let size = FERPLUS_INPUT_SIZE as usize;
    let resized = crop.resized(FERPLUS_INPUT_SIZE, FERPLUS_INPUT_SIZE);
    Array4::from_shape_fn((1, 1, size, size), |(_, _, y, x)| resized.data[y * size + x] as f32)
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Winning class and its probability; `None` unless there are exactly eight logits.
fn dominant(logits: &[f32]) -> Option<EmotionScore> {
    if logits.len() != FERPLUS_CLASSES.len() {
        return None;
    }
    let probs = softmax(logits);
    let (idx, &confidence) = probs
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))?;
    Some(EmotionScore {
        emotion: FERPLUS_CLASSES[idx],
        confidence,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_softmax_sums_to_one() {
        let p = softmax(&[1.0, 2.0, 3.0]);
        assert!((p.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(p[2] > p[1] && p[1] > p[0]);
    }

    #[test]
    fn test_dominant_maps_classes() {
        let mut logits = [0.0f32; 8];
        logits[1] = 5.0;
        let score = dominant(&logits).unwrap();
        assert_eq!(score.emotion, Emotion::Happy);
        assert!(score.confidence > 0.9);
    }

    #[test]
    fn test_contempt_folds_into_disgust() {
        let mut logits = [0.0f32; 8];
        logits[7] = 4.0;
        assert_eq!(dominant(&logits).unwrap().emotion, Emotion::Disgust);
    }

    #[test]
    fn test_dominant_rejects_wrong_arity() {
        assert!(dominant(&[1.0, 2.0]).is_none());
    }

    #[test]
    fn test_preprocess_shape_keeps_raw_intensity() {
        let crop = Frame::new(vec![200u8; 30 * 40], 30, 40).unwrap();
        let tensor = preprocess(&crop);
        assert_eq!(tensor.shape(), &[1, 1, 64, 64]);
        assert_eq!(tensor[[0, 0, 10, 50]], 200.0);
    }

    #[test]
    fn test_expand_grows_box() {
        let face = BoundingBox {
            x: 10.0,
            y: 20.0,
            width: 100.0,
            height: 50.0,
            confidence: 0.9,
            landmarks: None,
        };
        let grown = expand(&face, 0.1);
        assert_eq!((grown.x, grown.y, grown.width, grown.height), (0.0, 15.0, 120.0, 60.0));
    }
}
