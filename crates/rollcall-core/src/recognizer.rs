//! ArcFace face recognizer via ONNX Runtime.
//!
//! Produces L2-normalised 512-dimensional embeddings from aligned face crops
//! using the w600k_r50 model.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::frame::Frame;
use crate::types::{BoundingBox, Embedding};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric, unlike SCRFD
const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face has no landmarks; the detector must provide them for alignment")]
    NoLandmarks,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace-based face recognizer.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = %model_path.display(), "loaded ArcFace model");
        Ok(Self { session })
    }

    /// Align the detected face and extract its embedding.
    pub fn extract(
        &mut self,
        frame: &Frame,
        face: &BoundingBox,
    ) -> Result<Embedding, RecognizerError> {
        let landmarks = face.landmarks.as_ref().ok_or(RecognizerError::NoLandmarks)?;
        let aligned = alignment::align_face(frame, landmarks);
        let input = preprocess(&aligned);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding output: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding {
            values: l2_normalize(raw),
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        })
    }
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}

/// 112×112 aligned gray crop → normalized NCHW tensor with the channel replicated.
fn preprocess(aligned: &[u8]) -> Array4<f32> {
    Array4::from_shape_fn((1, 3, ALIGNED_SIZE, ALIGNED_SIZE), |(_, _, y, x)| {
        let pixel = aligned.get(y * ALIGNED_SIZE + x).copied().unwrap_or(0) as f32;
        (pixel - ARCFACE_MEAN) / ARCFACE_STD
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_shape_and_normalization() {
        let tensor = preprocess(&vec![128u8; ALIGNED_SIZE * ALIGNED_SIZE]);
        assert_eq!(tensor.shape(), &[1, 3, ALIGNED_SIZE, ALIGNED_SIZE]);
        let expected = (128.0 - ARCFACE_MEAN) / ARCFACE_STD;
        assert!((tensor[[0, 2, 5, 7]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_channels_identical() {
        let aligned: Vec<u8> = (0..ALIGNED_SIZE * ALIGNED_SIZE).map(|i| (i % 251) as u8).collect();
        let tensor = preprocess(&aligned);
        for (y, x) in [(0, 0), (30, 90), (111, 111)] {
            assert_eq!(tensor[[0, 0, y, x]], tensor[[0, 1, y, x]]);
            assert_eq!(tensor[[0, 1, y, x]], tensor[[0, 2, y, x]]);
        }
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6 && (v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }
}
