use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use rollcall_core::{emotion_counts, AttendanceRecorder, MarkOutcome, OnnxVision, Workspace};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "rollcall", version, about = "Emotion-tagged classroom attendance")]
struct Cli {
    /// Directory holding students.csv, attendance.csv and photos/
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new student from a reference photo
    Register {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        photo: PathBuf,
    },
    /// Take attendance from a photo
    Mark {
        #[arg(long)]
        photo: PathBuf,
        /// Student to mark; identified by face when omitted
        #[arg(long)]
        id: Option<String>,
    },
    /// Identify the student in a photo without recording anything
    Identify {
        #[arg(long)]
        photo: PathBuf,
    },
    /// List registered students
    Students,
    /// List attendance records
    Log,
    /// Emotion counts for one day
    Dashboard {
        /// Day to summarise (YYYY-MM-DD); defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.data_dir.clone())?;
    tracing::debug!(?config, "configuration loaded");

    let workspace = Workspace::open(&config.data_dir)
        .with_context(|| format!("opening data directory {}", config.data_dir.display()))?;

    match cli.command {
        Commands::Register { id, name, photo } => {
            let mut recorder = recorder(&config, workspace);
            let image = open_photo(&photo)?;
            let student = recorder.register(&id, &name, &image)?;
            let has_reference = recorder
                .workspace()
                .roster()
                .embedding_path(&student.id)
                .exists();

            if cli.json {
                println!("{}", json!({ "student": student, "face_reference": has_reference }));
            } else {
                println!("{} registered successfully!", student.name);
                if !has_reference {
                    println!("warning: no face reference stored; mark this student with --id");
                }
            }
        }
        Commands::Mark { photo, id } => {
            let mut recorder = recorder(&config, workspace);
            let frame = recorder.frame_from(&open_photo(&photo)?)?;
            let outcome = recorder.mark(&frame, id.as_deref())?;

            match (&outcome, cli.json) {
                (MarkOutcome::Recorded(record), true) => {
                    println!("{}", json!({ "recorded": true, "record": record }));
                }
                (MarkOutcome::Recorded(record), false) => {
                    if !record.emotion.is_known() {
                        println!("warning: emotion could not be detected");
                    }
                    println!(
                        "Attendance marked for {} ({}) at {}",
                        record.name,
                        record.emotion,
                        record.time.format("%H:%M:%S")
                    );
                }
                (MarkOutcome::Unidentified { emotion }, true) => {
                    println!("{}", json!({ "recorded": false, "emotion": emotion }));
                }
                (MarkOutcome::Unidentified { .. }, false) => {
                    println!("warning: could not identify the student; nothing recorded");
                }
            }
        }
        Commands::Identify { photo } => {
            let mut recorder = recorder(&config, workspace);
            let frame = recorder.frame_from(&open_photo(&photo)?)?;
            let found = recorder.identify(&frame)?;

            match (found, cli.json) {
                (Some(found), true) => println!(
                    "{}",
                    json!({ "student": found.student, "similarity": found.similarity })
                ),
                (None, true) => println!("{}", json!({ "student": null })),
                (Some(found), false) => println!(
                    "{} {} (similarity {:.2})",
                    found.student.id, found.student.name, found.similarity
                ),
                (None, false) => println!("no match"),
            }
        }
        Commands::Students => {
            let students = workspace.roster().load()?;
            if cli.json {
                println!("{}", serde_json::to_string(&students)?);
            } else if students.is_empty() {
                println!("No students registered yet.");
            } else {
                for s in &students {
                    println!("{}\t{}\t{}", s.id, s.name, s.photo_path);
                }
            }
        }
        Commands::Log => {
            let records = workspace.log().records()?;
            if cli.json {
                println!("{}", serde_json::to_string(&records)?);
            } else if records.is_empty() {
                println!("No attendance records yet.");
            } else {
                for r in &records {
                    println!(
                        "{}\t{}\t{}\t{}\t{}",
                        r.date,
                        r.student_id,
                        r.name,
                        r.emotion,
                        r.time.format("%H:%M:%S")
                    );
                }
            }
        }
        Commands::Dashboard { date } => {
            let date = date.unwrap_or_else(|| Local::now().date_naive());
            let records = workspace.log().records()?;
            let counts = emotion_counts(&records, date);

            if cli.json {
                let counts: serde_json::Map<String, serde_json::Value> = counts
                    .iter()
                    .map(|(emotion, n)| (emotion.to_string(), json!(n)))
                    .collect();
                println!(
                    "{}",
                    json!({ "date": date.to_string(), "total": records.len(), "counts": counts })
                );
            } else if records.is_empty() {
                println!("No attendance records yet.");
            } else if counts.is_empty() {
                println!("{} records in total, none on {date}.", records.len());
            } else {
                println!("{} records in total; emotions on {date}:", records.len());
                for (emotion, n) in &counts {
                    println!("  {emotion:<10} {n}");
                }
            }
        }
    }

    Ok(())
}

fn recorder(config: &Config, workspace: Workspace) -> AttendanceRecorder<OnnxVision> {
    let vision = OnnxVision::load_available(&config.model_paths());
    if !vision.has_detector() {
        tracing::warn!(
            model_dir = %config.model_dir.display(),
            "face detector missing; emotions will be Unknown and faces cannot be matched"
        );
    }

    AttendanceRecorder::new(workspace, vision)
        .with_threshold(config.similarity_threshold)
        .with_enhancement(config.clahe)
}

fn open_photo(path: &Path) -> Result<image::DynamicImage> {
    image::open(path).with_context(|| format!("reading photo {}", path.display()))
}
