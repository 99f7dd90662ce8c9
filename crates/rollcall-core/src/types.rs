use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-union with another box, 0.0 when either is degenerate.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);

        let inter = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Cosine similarity in [-1, 1]. Zero-norm inputs compare as 0.0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
        for (a, b) in self.values.iter().zip(&other.values) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }

    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(&other.values)
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// A registered student, one row of `students.csv`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    #[serde(rename = "student_id")]
    pub id: String,
    pub name: String,
    pub photo_path: String,
}

/// A student's stored reference embedding.
#[derive(Debug, Clone)]
pub struct Reference {
    pub student: Student,
    pub embedding: Embedding,
}

/// Result of matching a query embedding against the gallery.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub matched: bool,
    /// Cosine similarity of the best candidate [-1, 1].
    pub similarity: f32,
    /// Index into the gallery of the matched reference.
    pub index: Option<usize>,
}

/// Strategy for comparing a query embedding against enrolled references.
pub trait Matcher {
    fn compare(&self, query: &Embedding, gallery: &[Reference], threshold: f32) -> MatchResult;
}

/// Nearest-reference matcher by cosine similarity.
#[derive(Debug, Default, Clone, Copy)]
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(&self, query: &Embedding, gallery: &[Reference], threshold: f32) -> MatchResult {
        let best = gallery
            .iter()
            .enumerate()
            .map(|(i, reference)| (i, query.similarity(&reference.embedding)))
            .fold(None, |best: Option<(usize, f32)>, (i, sim)| match best {
                Some((_, best_sim)) if best_sim >= sim => best,
                _ => Some((i, sim)),
            });

        match best {
            Some((index, similarity)) if similarity >= threshold => MatchResult {
                matched: true,
                similarity,
                index: Some(index),
            },
            Some((_, similarity)) => MatchResult {
                matched: false,
                similarity,
                index: None,
            },
            None => MatchResult {
                matched: false,
                similarity: 0.0,
                index: None,
            },
        }
    }
}

/// Dominant facial emotion. `Unknown` marks a failed or skipped detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Emotion {
    Angry,
    Disgust,
    Fear,
    Happy,
    Sad,
    Surprise,
    Neutral,
    Unknown,
}

impl Emotion {
    pub const DETECTABLE: [Emotion; 7] = [
        Emotion::Angry,
        Emotion::Disgust,
        Emotion::Fear,
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Surprise,
        Emotion::Neutral,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Emotion::Angry => "angry",
            Emotion::Disgust => "disgust",
            Emotion::Fear => "fear",
            Emotion::Happy => "happy",
            Emotion::Sad => "sad",
            Emotion::Surprise => "surprise",
            Emotion::Neutral => "neutral",
            Emotion::Unknown => "Unknown",
        }
    }

    /// Parse a label; anything outside the closed set is `Unknown`.
    pub fn from_label(label: &str) -> Self {
        let label = label.trim();
        Self::DETECTABLE
            .into_iter()
            .find(|e| e.as_str().eq_ignore_ascii_case(label))
            .unwrap_or(Emotion::Unknown)
    }

    pub fn is_known(&self) -> bool {
        *self != Emotion::Unknown
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Emotion {
    fn from(label: String) -> Self {
        Emotion::from_label(&label)
    }
}

impl From<Emotion> for String {
    fn from(emotion: Emotion) -> Self {
        emotion.as_str().to_string()
    }
}

/// Classifier output: the winning emotion and its softmax probability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmotionScore {
    pub emotion: Emotion,
    pub confidence: f32,
}

/// One row of `attendance.csv`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    #[serde(with = "date_column")]
    pub date: NaiveDate,
    pub student_id: String,
    pub name: String,
    pub emotion: Emotion,
    #[serde(with = "time_column")]
    pub time: NaiveTime,
}

impl AttendanceRecord {
    /// Stamp a record for `student` at `now`, truncated to whole seconds.
    pub fn new(student: &Student, emotion: Emotion, now: NaiveDateTime) -> Self {
        let time = now.time();
        Self {
            date: now.date(),
            student_id: student.id.clone(),
            name: student.name.clone(),
            emotion,
            time: time.with_nanosecond(0).unwrap_or(time),
        }
    }
}

pub(crate) const DATE_FORMAT: &str = "%Y-%m-%d";
pub(crate) const TIME_FORMAT: &str = "%H:%M:%S";

mod date_column {
    use super::DATE_FORMAT;
    use chrono::NaiveDate;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(date: &NaiveDate, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&date.format(DATE_FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDate, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT).map_err(serde::de::Error::custom)
    }
}

mod time_column {
    use super::TIME_FORMAT;
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&time.format(TIME_FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveTime::parse_from_str(raw.trim(), TIME_FORMAT).map_err(serde::de::Error::custom)
    }
}
