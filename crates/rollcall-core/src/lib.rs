//! rollcall-core — emotion-tagged classroom attendance.
//!
//! Students are registered from a reference photo, identified later by
//! nearest ArcFace embedding, and each attendance mark is tagged with the
//! dominant facial emotion before being appended to `attendance.csv`.

pub mod alignment;
pub mod detector;
pub mod emotion;
pub mod frame;
pub mod recognizer;
pub mod recorder;
pub mod store;
pub mod types;
pub mod vision;

pub use detector::FaceDetector;
pub use emotion::EmotionNet;
pub use frame::Frame;
pub use recognizer::FaceRecognizer;
pub use recorder::{AttendanceRecorder, Identification, MarkOutcome, RecorderError};
pub use store::{emotion_counts, AttendanceLog, StoreError, StudentRoster, Workspace};
pub use types::{
    AttendanceRecord, BoundingBox, CosineMatcher, Embedding, Emotion, EmotionScore, MatchResult,
    Matcher, Reference, Student,
};
pub use vision::{EmotionClassifier, FaceEncoder, ModelPaths, NoVision, OnnxVision, VisionError};

use std::path::PathBuf;

/// `$XDG_DATA_HOME/rollcall/models`, falling back to `~/.local/share/rollcall/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
        .join("models")
}
