//! Flat-file persistence: `students.csv`, `attendance.csv` and the `photos/` directory.
//!
//! Both CSV files are append-only. Rows are written through the `csv` crate
//! with serde; the header row is written once, when a file is first created.

use crate::types::{AttendanceRecord, Embedding, Emotion, Reference, Student};
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const STUDENTS_FILE: &str = "students.csv";
pub const ATTENDANCE_FILE: &str = "attendance.csv";
pub const PHOTOS_DIR: &str = "photos";

const STUDENT_COLUMNS: [&str; 3] = ["student_id", "name", "photo_path"];
const ATTENDANCE_COLUMNS: [&str; 5] = ["date", "student_id", "name", "emotion", "time"];

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn csv(path: &Path, source: csv::Error) -> Self {
        StoreError::Csv {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A data directory holding the roster, the attendance log and reference photos.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    roster: StudentRoster,
    log: AttendanceLog,
}

impl Workspace {
    /// Open `root`, creating the photo directory and header-only CSV files if missing.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let photos = root.join(PHOTOS_DIR);
        fs::create_dir_all(&photos).map_err(|e| StoreError::io(&photos, e))?;

        let roster = StudentRoster {
            path: root.join(STUDENTS_FILE),
            photos,
        };
        let log = AttendanceLog {
            path: root.join(ATTENDANCE_FILE),
        };
        write_header_if_missing(&roster.path, &STUDENT_COLUMNS)?;
        write_header_if_missing(&log.path, &ATTENDANCE_COLUMNS)?;

        tracing::debug!(root = %root.display(), "workspace opened");
        Ok(Self { root, roster, log })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn roster(&self) -> &StudentRoster {
        &self.roster
    }

    pub fn log(&self) -> &AttendanceLog {
        &self.log
    }
}

/// `students.csv` plus per-student reference files under `photos/`.
#[derive(Debug, Clone)]
pub struct StudentRoster {
    path: PathBuf,
    photos: PathBuf,
}

impl StudentRoster {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Vec<Student>, StoreError> {
        read_rows(&self.path)
    }

    pub fn find(&self, id: &str) -> Result<Option<Student>, StoreError> {
        let id = id.trim();
        Ok(self.load()?.into_iter().find(|s| s.id.trim() == id))
    }

    pub fn contains(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.find(id)?.is_some())
    }

    pub fn append(&self, student: &Student) -> Result<(), StoreError> {
        append_row(&self.path, student)?;
        tracing::info!(student_id = %student.id, name = %student.name, "student registered");
        Ok(())
    }

    /// Where a student's reference photo lives.
    pub fn photo_path(&self, id: &str) -> PathBuf {
        self.photos.join(format!("{id}.jpg"))
    }

    /// Where a student's reference embedding lives.
    pub fn embedding_path(&self, id: &str) -> PathBuf {
        self.photos.join(format!("{id}.embedding.json"))
    }

    pub fn save_embedding(&self, id: &str, embedding: &Embedding) -> Result<(), StoreError> {
        let path = self.embedding_path(id);
        let json = serde_json::to_vec(embedding).map_err(|source| StoreError::Json {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, json).map_err(|e| StoreError::io(&path, e))
    }

    pub fn load_embedding(&self, id: &str) -> Result<Option<Embedding>, StoreError> {
        let path = self.embedding_path(id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Json { path, source })
    }

    /// Delete a stored reference embedding. A missing file is not an error.
    pub fn remove_embedding(&self, id: &str) -> Result<(), StoreError> {
        remove_if_present(&self.embedding_path(id))
    }

    /// Delete a stored reference photo. A missing file is not an error.
    pub fn remove_photo(&self, id: &str) -> Result<(), StoreError> {
        remove_if_present(&self.photo_path(id))
    }

    /// Every student with a stored reference embedding.
    pub fn gallery(&self) -> Result<Vec<Reference>, StoreError> {
        let mut gallery = Vec::new();
        for student in self.load()? {
            match self.load_embedding(&student.id)? {
                Some(embedding) => gallery.push(Reference { student, embedding }),
                None => tracing::debug!(student_id = %student.id, "no reference embedding"),
            }
        }
        Ok(gallery)
    }
}

/// `attendance.csv`, append-only.
#[derive(Debug, Clone)]
pub struct AttendanceLog {
    path: PathBuf,
}

impl AttendanceLog {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &AttendanceRecord) -> Result<(), StoreError> {
        append_row(&self.path, record)?;
        tracing::info!(
            student_id = %record.student_id,
            emotion = %record.emotion,
            date = %record.date,
            time = %record.time,
            "attendance recorded"
        );
        Ok(())
    }

    pub fn records(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        read_rows(&self.path)
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.records()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    pub fn records_on(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, StoreError> {
        Ok(self
            .records()?
            .into_iter()
            .filter(|r| r.date == date)
            .collect())
    }
}

/// Count emotions among the records of one day.
pub fn emotion_counts(records: &[AttendanceRecord], date: NaiveDate) -> BTreeMap<Emotion, usize> {
    let mut counts = BTreeMap::new();
    for record in records.iter().filter(|r| r.date == date) {
        *counts.entry(record.emotion).or_insert(0) += 1;
    }
    counts
}

fn write_header_if_missing(path: &Path, columns: &[&str]) -> Result<(), StoreError> {
    if path.exists() {
        return Ok(());
    }
    let mut writer = csv::Writer::from_path(path).map_err(|e| StoreError::csv(path, e))?;
    writer.write_record(columns).map_err(|e| StoreError::csv(path, e))?;
    writer.flush().map_err(|e| StoreError::io(path, e))
}

fn append_row<T: Serialize>(path: &Path, row: &T) -> Result<(), StoreError> {
    let needs_header = fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StoreError::io(path, e))?;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(needs_header)
        .from_writer(file);
    writer.serialize(row).map_err(|e| StoreError::csv(path, e))?;
    writer.flush().map_err(|e| StoreError::io(path, e))
}

fn remove_if_present(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(StoreError::io(path, e)),
        _ => Ok(()),
    }
}

/// Missing and header-only files read as empty.
fn read_rows<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| StoreError::csv(path, e))?;
    reader
        .deserialize()
        .collect::<Result<Vec<T>, _>>()
        .map_err(|e| StoreError::csv(path, e))
}
