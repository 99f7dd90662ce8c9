//! The attendance recorder: registration, identification, emotion tagging and logging.

use crate::frame::{Frame, FrameError};
use crate::store::{StoreError, StudentRoster, Workspace};
use crate::types::{AttendanceRecord, CosineMatcher, Emotion, Matcher, Student};
use crate::vision::{EmotionClassifier, FaceEncoder};
use chrono::{Local, NaiveDateTime};
use image::DynamicImage;
use thiserror::Error;

/// Default cosine similarity for a positive identification.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.40;

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("student id must not be empty")]
    EmptyId,
    #[error("student id {0:?} cannot be used as a file name")]
    InvalidId(String),
    #[error("student name must not be empty")]
    EmptyName,
    #[error("student id {0} already exists")]
    DuplicateStudent(String),
    #[error("no student registered with id {0}")]
    UnknownStudent(String),
    #[error("cannot save photo {path}: {source}")]
    Photo {
        path: String,
        #[source]
        source: image::ImageError,
    },
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A face matched to a registered student.
#[derive(Debug, Clone)]
pub struct Identification {
    pub student: Student,
    pub similarity: f32,
}

/// What `mark` did.
#[derive(Debug, Clone, PartialEq)]
pub enum MarkOutcome {
    /// A row was appended to the log.
    Recorded(AttendanceRecord),
    /// Nobody could be identified; nothing was written.
    Unidentified { emotion: Emotion },
}

impl MarkOutcome {
    pub fn emotion(&self) -> Emotion {
        match self {
            MarkOutcome::Recorded(record) => record.emotion,
            MarkOutcome::Unidentified { emotion } => *emotion,
        }
    }

    pub fn record(&self) -> Option<&AttendanceRecord> {
        match self {
            MarkOutcome::Recorded(record) => Some(record),
            MarkOutcome::Unidentified { .. } => None,
        }
    }
}

/// Turns photos into roster entries and attendance rows.
///
/// `V` supplies both model seams; swapping it swaps the emotion and
/// identification models without touching the recording logic.
pub struct AttendanceRecorder<V> {
    workspace: Workspace,
    vision: V,
    matcher: CosineMatcher,
    threshold: f32,
    enhance: bool,
}

impl<V: EmotionClassifier + FaceEncoder> AttendanceRecorder<V> {
    pub fn new(workspace: Workspace, vision: V) -> Self {
        Self {
            workspace,
            vision,
            matcher: CosineMatcher,
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
            enhance: false,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Apply CLAHE to every frame built by [`frame_from`](Self::frame_from).
    pub fn with_enhancement(mut self, enhance: bool) -> Self {
        self.enhance = enhance;
        self
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn vision_mut(&mut self) -> &mut V {
        &mut self.vision
    }

    /// Convert a decoded photo into the grayscale frame the models consume.
    pub fn frame_from(&self, image: &DynamicImage) -> Result<Frame, RecorderError> {
        let mut frame = Frame::from_image(image)?;
        if self.enhance {
            frame.enhance();
        }
        Ok(frame)
    }

    /// Register a new student with a reference photo.
    ///
    /// The photo is saved as `photos/<id>.jpg`. When a face encoder is
    /// available and finds a face, its embedding becomes the student's
    /// reference; otherwise the student is registered without one and any
    /// reference left over from an earlier use of the id is removed.
    ///
    /// The roster row is written last; if any step fails, the files written
    /// for this registration are removed again.
    pub fn register(
        &mut self,
        id: &str,
        name: &str,
        photo: &DynamicImage,
    ) -> Result<Student, RecorderError> {
        let (id, name) = (id.trim(), name.trim());
        validate_id(id)?;
        if name.is_empty() {
            return Err(RecorderError::EmptyName);
        }
        if self.workspace.roster().contains(id)? {
            return Err(RecorderError::DuplicateStudent(id.to_string()));
        }

        let frame = self.frame_from(photo)?;
        let embedding = match self.vision.encode(&frame) {
            Ok(Some(embedding)) => Some(embedding),
            Ok(None) => {
                tracing::warn!(
                    student_id = id,
                    "no face in registration photo; face matching disabled for this student"
                );
                None
            }
            Err(e) => {
                tracing::warn!(student_id = id, error = %e, "cannot compute reference embedding");
                None
            }
        };

        let roster = self.workspace.roster();
        let photo_path = roster.photo_path(id);
        let student = Student {
            id: id.to_string(),
            name: name.to_string(),
            photo_path: photo_path.display().to_string(),
        };

        let written = photo
            .to_rgb8()
            .save(&photo_path)
            .map_err(|source| RecorderError::Photo {
                path: student.photo_path.clone(),
                source,
            })
            .and_then(|()| {
                match &embedding {
                    Some(embedding) => roster.save_embedding(id, embedding)?,
                    None => roster.remove_embedding(id)?,
                }
                roster.append(&student)?;
                Ok(())
            });

        if let Err(e) = written {
            discard_registration_files(roster, id);
            return Err(e);
        }
        Ok(student)
    }

    /// Match the face in `frame` against every stored reference.
    ///
    /// No face, no encoder, or no reference above the threshold all yield `None`.
    pub fn identify(&mut self, frame: &Frame) -> Result<Option<Identification>, RecorderError> {
        let query = match self.vision.encode(frame) {
            Ok(Some(embedding)) => embedding,
            Ok(None) => {
                tracing::warn!("no face found for identification");
                return Ok(None);
            }
            Err(e) => {
                tracing::warn!(error = %e, "identification unavailable");
                return Ok(None);
            }
        };

        let gallery = self.workspace.roster().gallery()?;
        let result = self.matcher.compare(&query, &gallery, self.threshold);
        tracing::debug!(
            matched = result.matched,
            similarity = result.similarity,
            gallery = gallery.len(),
            "identification compared"
        );

        Ok(result.index.map(|i| Identification {
            student: gallery[i].student.clone(),
            similarity: result.similarity,
        }))
    }

    /// Dominant emotion in `frame`; any failure degrades to `Unknown`.
    pub fn detect_emotion(&mut self, frame: &Frame) -> Emotion {
        match self.vision.classify(frame) {
            Ok(Some(score)) => score.emotion,
            Ok(None) => {
                tracing::warn!("no face found; emotion unknown");
                Emotion::Unknown
            }
            Err(e) => {
                tracing::warn!(error = %e, "emotion detection failed");
                Emotion::Unknown
            }
        }
    }

    /// Take attendance now. See [`mark_at`](Self::mark_at).
    pub fn mark(
        &mut self,
        frame: &Frame,
        student_id: Option<&str>,
    ) -> Result<MarkOutcome, RecorderError> {
        self.mark_at(frame, student_id, Local::now().naive_local())
    }

    /// Take attendance at `now` for `student_id`, or for whoever the face matches.
    ///
    /// An explicit id must be registered. Without one, an unidentified face
    /// writes nothing.
    pub fn mark_at(
        &mut self,
        frame: &Frame,
        student_id: Option<&str>,
        now: NaiveDateTime,
    ) -> Result<MarkOutcome, RecorderError> {
        let student = match student_id {
            Some(id) => Some(
                self.workspace
                    .roster()
                    .find(id)?
                    .ok_or_else(|| RecorderError::UnknownStudent(id.trim().to_string()))?,
            ),
            None => self.identify(frame)?.map(|found| found.student),
        };

        let emotion = self.detect_emotion(frame);
        let Some(student) = student else {
            return Ok(MarkOutcome::Unidentified { emotion });
        };

        let record = AttendanceRecord::new(&student, emotion, now);
        self.workspace.log().append(&record)?;
        Ok(MarkOutcome::Recorded(record))
    }
}

/// Ids name files under `photos/`, so they must stay a single path component.
fn validate_id(id: &str) -> Result<(), RecorderError> {
    if id.is_empty() {
        return Err(RecorderError::EmptyId);
    }
    if id == "." || id == ".." || id.contains(['/', '\\', '\0']) {
        return Err(RecorderError::InvalidId(id.to_string()));
    }
    Ok(())
}

/// Undo the file writes of a failed registration.
fn discard_registration_files(roster: &StudentRoster, id: &str) {
    for removed in [roster.remove_photo(id), roster.remove_embedding(id)] {
        if let Err(e) = removed {
            tracing::warn!(
                student_id = id,
                error = %e,
                "cannot clean up after failed registration"
            );
        }
    }
}
