//! Manual quality-control review state.
//!
//! Verdicts live in a flat append-only TSV log, one
//! `subject<TAB>Y|N<TAB>comment` line per reviewed subject. The set of
//! first fields is the only state read back: a subject present in the log
//! is never offered for review again.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::command::ExternalCommand;
use crate::config::BatchConfig;

/// Default log file name, relative to the working directory.
pub const DEFAULT_LOG_NAME: &str = "manual_QC.txt";

/// Filesystem entries that are never review subjects.
const IGNORED_ENTRIES: [&str; 5] = [
    ".gitignore",
    "fsaverage",
    ".DS_Store",
    "thumbs.db",
    "desktop.ini",
];

#[derive(Debug, Error)]
pub enum QcError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("subject directory missing: {path}")]
    MissingSubjectDir { path: String },
}

/// One review verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QcRecord {
    pub subject: String,
    pub passed: bool,
    pub comment: String,
}

impl QcRecord {
    /// The log line for this record. The comment is flattened so one
    /// record always stays one line.
    fn to_line(&self) -> String {
        let verdict = if self.passed { "Y" } else { "N" };
        let comment = self.comment.replace(['\t', '\n'], " ");
        format!("{}\t{}\t{}\n", self.subject, verdict, comment)
    }
}

/// Candidate subjects under the subjects directory, sorted, with known
/// non-subject entries filtered out.
pub fn discover_subjects(subjects_dir: &Path) -> Result<Vec<String>, QcError> {
    let entries = fs::read_dir(subjects_dir).map_err(|source| QcError::Io {
        path: subjects_dir.display().to_string(),
        source,
    })?;

    let mut subjects = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| QcError::Io {
            path: subjects_dir.display().to_string(),
            source,
        })?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if IGNORED_ENTRIES.contains(&name.as_str()) {
            continue;
        }
        subjects.push(name);
    }
    subjects.sort();
    Ok(subjects)
}

/// Subjects already recorded in the log (first field of each line).
/// A missing log means nothing was reviewed yet.
pub fn reviewed_subjects(log: &Path) -> Result<HashSet<String>, QcError> {
    let text = match fs::read_to_string(log) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(source) => {
            return Err(QcError::Io {
                path: log.display().to_string(),
                source,
            })
        }
    };

    Ok(text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.split('\t').next().unwrap_or(line).to_string())
        .collect())
}

/// Discovered subjects not yet present in the log, in sorted order.
pub fn pending_subjects(subjects_dir: &Path, log: &Path) -> Result<Vec<String>, QcError> {
    let reviewed = reviewed_subjects(log)?;
    let pending = discover_subjects(subjects_dir)?
        .into_iter()
        .filter(|s| !reviewed.contains(s))
        .collect();
    Ok(pending)
}

/// Verify the subject's output directory exists before launching the
/// viewer. A missing directory aborts the review loop.
pub fn ensure_subject_dir(config: &BatchConfig, subject: &str) -> Result<PathBuf, QcError> {
    let dir = config.unit_dir(subject);
    if dir.is_dir() {
        Ok(dir)
    } else {
        Err(QcError::MissingSubjectDir {
            path: dir.display().to_string(),
        })
    }
}

/// Append one record to the log, creating it on first use.
pub fn append_record(log: &Path, record: &QcRecord) -> Result<(), QcError> {
    let io_err = |source| QcError::Io {
        path: log.display().to_string(),
        source,
    };

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log)
        .map_err(io_err)?;
    file.write_all(record.to_line().as_bytes()).map_err(io_err)?;
    file.flush().map_err(io_err)
}

/// The viewer invocation for one subject: volumes with the segmentation
/// overlaid, then the white and pial surfaces of both hemispheres.
pub fn viewer_command(config: &BatchConfig, subject: &str) -> ExternalCommand {
    let mri = |file: &str| config.mri_path(subject, file).to_string_lossy().into_owned();
    let surf = |file: &str| config.surf_path(subject, file).to_string_lossy().into_owned();

    ExternalCommand::new(config.viewer.clone())
        .arg("-v")
        .arg(mri("T1.mgz"))
        .arg(mri("wm.mgz"))
        .arg(mri("brainmask.mgz"))
        .arg(format!("{}:colormap=lut:opacity=0.2", mri("aseg.mgz")))
        .arg("-f")
        .arg(format!("{}:edgecolor=blue", surf("lh.white")))
        .arg(format!("{}:edgecolor=red", surf("lh.pial")))
        .arg(format!("{}:edgecolor=blue", surf("rh.white")))
        .arg(format!("{}:edgecolor=red", surf("rh.pial")))
}
