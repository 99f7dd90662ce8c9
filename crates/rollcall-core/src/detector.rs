//! SCRFD face detector via ONNX Runtime.
//!
//! The frame is letterboxed into a 640×640 square, each of the three stride
//! heads is decoded into anchor-relative boxes and landmarks, and overlapping
//! boxes are collapsed with non-maximum suppression.

use crate::frame::{resize_bilinear, Frame};
use crate::types::BoundingBox;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Scale and padding applied when fitting a frame into the square model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    scaled_w: usize,
    scaled_h: usize,
}

impl Letterbox {
    fn fit(width: usize, height: usize, target: usize) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let scaled_w = ((width as f32 * scale).round() as usize).clamp(1, target);
        let scaled_h = ((height as f32 * scale).round() as usize).clamp(1, target);
        Self {
            scale,
            pad_x: (target - scaled_w) as f32 / 2.0,
            pad_y: (target - scaled_h) as f32 / 2.0,
            scaled_w,
            scaled_h,
        }
    }

    /// Map a point in model-input space back to frame space.
    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor positions for one stride head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeadOutputs {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    heads: [HeadOutputs; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs 9 outputs (score/bbox/kps per stride), model has {}",
                names.len()
            )));
        }

        let heads = map_head_outputs(&names);
        tracing::info!(
            path = %model_path.display(),
            outputs = ?names,
            ?heads,
            "loaded SCRFD model"
        );

        Ok(Self { session, heads })
    }

    /// Detect faces, highest confidence first.
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError> {
        let letterbox =
            Letterbox::fit(frame.width as usize, frame.height as usize, SCRFD_INPUT_SIZE);
        let input = preprocess(frame, &letterbox);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (head, &stride) in self.heads.iter().zip(SCRFD_STRIDES.iter()) {
            let tensor = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| {
                        DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}"))
                    })
            };
            let scores = tensor(head.score, "scores")?;
            let boxes = tensor(head.bbox, "boxes")?;
            let kps = tensor(head.kps, "landmarks")?;

            candidates.extend(decode_head(scores, boxes, kps, stride, &letterbox));
        }

        let faces = non_max_suppression(candidates, SCRFD_NMS_THRESHOLD);
        tracing::debug!(faces = faces.len(), "SCRFD detection done");
        Ok(faces)
    }

    /// The most confident face, if any.
    pub fn detect_best(&mut self, frame: &Frame) -> Result<Option<BoundingBox>, DetectorError> {
        Ok(self.detect(frame)?.into_iter().next())
    }
}

/// Locate score/bbox/kps tensors by their `<kind>_<stride>` names, or fall back
/// to the standard export order (all scores, then all boxes, then all landmarks).
fn map_head_outputs(names: &[String]) -> [HeadOutputs; 3] {
    let position = |kind: &str, stride: usize| {
        let wanted = format!("{kind}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let named: Option<Vec<HeadOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| {
            Some(HeadOutputs {
                score: position("score", stride)?,
                bbox: position("bbox", stride)?,
                kps: position("kps", stride)?,
            })
        })
        .collect();

    match named {
        Some(heads) => [heads[0], heads[1], heads[2]],
        None => std::array::from_fn(|i| HeadOutputs {
            score: i,
            bbox: i + 3,
            kps: i + 6,
        }),
    }
}

/// Letterbox the frame and normalize into a replicated-gray NCHW tensor.
fn preprocess(frame: &Frame, letterbox: &Letterbox) -> Array4<f32> {
    let scaled = resize_bilinear(
        &frame.data,
        frame.width as usize,
        frame.height as usize,
        letterbox.scaled_w,
        letterbox.scaled_h,
    );
    let (left, top) = (letterbox.pad_x.floor() as usize, letterbox.pad_y.floor() as usize);

    // Padding stays at zero, which is SCRFD_MEAN after normalization.
    let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
    for y in 0..letterbox.scaled_h {
        for x in 0..letterbox.scaled_w {
            let value = (scaled[y * letterbox.scaled_w + x] as f32 - SCRFD_MEAN) / SCRFD_STD;
            for c in 0..3 {
                tensor[[0, c, top + y, left + x]] = value;
            }
        }
    }
    tensor
}

/// Decode one stride head into frame-space detections above the confidence threshold.
fn decode_head(
    scores: &[f32],
    boxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &Letterbox,
) -> Vec<BoundingBox> {
    let cells_per_row = SCRFD_INPUT_SIZE / stride;
    let anchors = cells_per_row * cells_per_row * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    (0..anchors.min(scores.len()))
        .filter(|&i| scores[i] > SCRFD_CONFIDENCE_THRESHOLD)
        .filter_map(|i| {
            let cell = i / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % cells_per_row) as f32 * step;
            let cy = (cell / cells_per_row) as f32 * step;

            let d = boxes.get(i * 4..i * 4 + 4)?;
            let (x1, y1) = letterbox.to_frame(cx - d[0] * step, cy - d[1] * step);
            let (x2, y2) = letterbox.to_frame(cx + d[2] * step, cy + d[3] * step);

            let landmarks = kps.get(i * 10..i * 10 + 10).map(|k| {
                std::array::from_fn(|p| {
                    letterbox.to_frame(cx + k[p * 2] * step, cy + k[p * 2 + 1] * step)
                })
            });

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: scores[i],
                landmarks,
            })
        })
        .collect()
}

/// Greedy NMS: keep the most confident box, drop anything overlapping it.
fn non_max_suppression(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, size: f32, confidence: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: size,
            height: size,
            confidence,
            landmarks: None,
        }
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let kept = non_max_suppression(
            vec![
                bbox(5.0, 5.0, 100.0, 0.8),
                bbox(0.0, 0.0, 100.0, 0.9),
                bbox(200.0, 200.0, 50.0, 0.7),
            ],
            0.4,
        );
        let confidences: Vec<f32> = kept.iter().map(|b| b.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.7]);
    }

    #[test]
    fn test_nms_empty() {
        assert!(non_max_suppression(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_maps_back_to_frame() {
        let lb = Letterbox::fit(320, 240, SCRFD_INPUT_SIZE);
        assert_eq!(lb.scaled_w, 640);
        assert_eq!(lb.scaled_h, 480);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 80.0);

        let (x, y) = lb.to_frame(100.0 * lb.scale + lb.pad_x, 50.0 * lb.scale + lb.pad_y);
        assert!((x - 100.0).abs() < 1e-3 && (y - 50.0).abs() < 1e-3);
    }

    #[test]
    fn test_map_head_outputs_by_name() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32",
            "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let heads = map_head_outputs(&names);
        assert_eq!(heads[0], HeadOutputs { score: 2, bbox: 0, kps: 1 });
        assert_eq!(heads[2], HeadOutputs { score: 8, bbox: 6, kps: 7 });
    }

    #[test]
    fn test_map_head_outputs_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i| (440 + i).to_string()).collect();
        let heads = map_head_outputs(&names);
        assert_eq!(heads[1], HeadOutputs { score: 1, bbox: 4, kps: 7 });
    }

    #[test]
    fn test_decode_head_single_anchor() {
        let stride = 32;
        let cells = SCRFD_INPUT_SIZE / stride;
        let anchors = cells * cells * SCRFD_ANCHORS_PER_CELL;
        let lb = Letterbox::fit(640, 640, SCRFD_INPUT_SIZE);

        let mut scores = vec![0.0f32; anchors];
        let mut boxes = vec![0.0f32; anchors * 4];
        let kps = vec![0.0f32; anchors * 10];

        // Anchor in cell (col 2, row 1): centre at (64, 32).
        let idx = (cells + 2) * SCRFD_ANCHORS_PER_CELL;
        scores[idx] = 0.9;
        boxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let dets = decode_head(&scores, &boxes, &kps, stride, &lb);
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert!((d.x - 32.0).abs() < 1e-4 && (d.y - 0.0).abs() < 1e-4);
        assert!((d.width - 64.0).abs() < 1e-4 && (d.height - 64.0).abs() < 1e-4);
        assert_eq!(d.landmarks.unwrap()[0], (64.0, 32.0));
    }

    #[test]
    fn test_preprocess_pads_with_zero() {
        let frame = Frame::new(vec![255u8; 64 * 32], 64, 32).unwrap();
        let lb = Letterbox::fit(64, 32, SCRFD_INPUT_SIZE);
        let tensor = preprocess(&frame, &lb);

        assert_eq!(tensor.shape(), &[1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE]);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        let expected = (255.0 - SCRFD_MEAN) / SCRFD_STD;
        assert!((tensor[[0, 1, 320, 320]] - expected).abs() < 1e-6);
    }
}
