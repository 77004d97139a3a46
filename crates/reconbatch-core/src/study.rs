//! Study-tree scanning and base/long command synthesis.
//!
//! Imaging studies follow a three-level convention under one root:
//! `root/<subject>/<timepoint>/<session>/<image files>`, where each
//! timepoint directory name embeds its acquisition timestamp (for example
//! `2006-03-14_09_21_33.0`). The scan orders each subject's timepoints
//! chronologically, assigns 1-based visit indices in that order, and
//! synthesizes the unit id `{subject}_{session}`.
//!
//! Dot-entries are skipped at every level. A timepoint must contain
//! exactly one session subdirectory and that session at least one regular
//! file, the first of which (sorted by name) becomes the row's `dcm_path`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use thiserror::Error;
use tracing::debug;

use crate::manifest::{Manifest, ManifestRow};

/// Columns of a built manifest, in emit order. `date` carries the raw
/// timepoint directory name.
pub const MANIFEST_COLUMNS: [&str; 6] = ["id", "subject", "session", "date", "visit", "dcm_path"];

/// Timestamp format embedded in timepoint directory names.
const TIMEPOINT_FORMAT: &str = "%Y-%m-%d_%H_%M_%S%.f";

#[derive(Debug, Error)]
pub enum StudyError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: timepoint name does not embed a timestamp: '{name}'")]
    Timestamp { path: String, name: String },
    #[error("{path}: expected exactly one session directory, found {found}")]
    SessionCount { path: String, found: usize },
    #[error("{path}: session contains no image files")]
    EmptySession { path: String },
    #[error("row {row}: missing required column '{column}'")]
    Column { row: usize, column: String },
    #[error("row {row}: visit is not a number: '{value}'")]
    Visit { row: usize, value: String },
}

/// One (subject, timepoint) pair discovered by the scan.
#[derive(Debug, Clone, PartialEq)]
pub struct StudyVisit {
    /// Synthesized unit id: `{subject}_{session}`.
    pub id: String,
    pub subject: String,
    /// Raw timepoint directory name.
    pub timepoint: String,
    pub session: String,
    /// Timestamp parsed from the timepoint name; sort key only.
    pub acquired: NaiveDateTime,
    /// 1-based chronological index within the subject.
    pub visit: u32,
    /// First image file in the session directory.
    pub dcm_path: PathBuf,
}

/// Walk the study tree. Subjects come back in name order, each subject's
/// visits in chronological order.
pub fn scan_study_tree(root: &Path) -> Result<Vec<StudyVisit>, StudyError> {
    let mut visits = Vec::new();

    for subject_dir in subdirectories(root)? {
        let subject = dir_name(&subject_dir);
        let mut timepoints = Vec::new();

        for tp_dir in subdirectories(&subject_dir)? {
            let timepoint = dir_name(&tp_dir);
            let acquired = NaiveDateTime::parse_from_str(&timepoint, TIMEPOINT_FORMAT)
                .map_err(|_| StudyError::Timestamp {
                    path: display(&tp_dir),
                    name: timepoint.clone(),
                })?;

            let sessions = subdirectories(&tp_dir)?;
            if sessions.len() != 1 {
                return Err(StudyError::SessionCount {
                    path: display(&tp_dir),
                    found: sessions.len(),
                });
            }
            let session_dir = &sessions[0];
            let dcm_path = first_image(session_dir)?;

            timepoints.push((acquired, timepoint, dir_name(session_dir), dcm_path));
        }

        timepoints.sort_by(|a, b| a.0.cmp(&b.0));
        debug!(subject = %subject, timepoints = timepoints.len(), "scanned subject");

        for (i, (acquired, timepoint, session, dcm_path)) in timepoints.into_iter().enumerate() {
            visits.push(StudyVisit {
                id: format!("{subject}_{session}"),
                subject: subject.clone(),
                timepoint,
                session,
                acquired,
                visit: (i + 1) as u32,
                dcm_path,
            });
        }
    }

    Ok(visits)
}

/// Render visits as a header-aware TSV manifest.
pub fn visits_to_manifest(visits: &[StudyVisit]) -> String {
    let mut out = MANIFEST_COLUMNS.join("\t");
    out.push('\n');
    for v in visits {
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\t{}\t{}\n",
            v.id,
            v.subject,
            v.session,
            v.timepoint,
            v.visit,
            v.dcm_path.display()
        ));
    }
    out
}

/// Synthesis mode for multi-timepoint commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthMode {
    /// One within-subject template command per subject.
    Base,
    /// One longitudinal command per timepoint.
    Long,
}

/// Synthesize base or long command lines from a built manifest.
///
/// Rows are grouped by `subject` (first-seen order) and ordered by their
/// `visit` index within each group.
pub fn synthesize_commands(
    manifest: &Manifest,
    mode: SynthMode,
) -> Result<Vec<String>, StudyError> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<(u32, String)>> = HashMap::new();

    for row in manifest.rows() {
        let subject = required(&row, "subject")?;
        let id = required(&row, "id")?;
        let visit_text = required(&row, "visit")?;
        let visit: u32 = visit_text.trim().parse().map_err(|_| StudyError::Visit {
            row: row.index,
            value: visit_text.to_string(),
        })?;

        if !groups.contains_key(subject) {
            order.push(subject.to_string());
        }
        groups
            .entry(subject.to_string())
            .or_default()
            .push((visit, id.to_string()));
    }

    for group in groups.values_mut() {
        group.sort_by_key(|(visit, _)| *visit);
    }

    let mut lines = Vec::new();
    for subject in &order {
        let Some(timepoints) = groups.get(subject) else {
            continue;
        };
        match mode {
            SynthMode::Base => {
                let mut line = format!("recon-all -base {subject}");
                for (_, id) in timepoints {
                    line.push_str(&format!(" -tp {id}"));
                }
                line.push_str(" -all");
                lines.push(line);
            }
            SynthMode::Long => {
                for (_, id) in timepoints {
                    lines.push(format!("recon-all -long {id} {subject} -all"));
                }
            }
        }
    }

    Ok(lines)
}

fn required<'a>(row: &ManifestRow<'a>, column: &str) -> Result<&'a str, StudyError> {
    row.get(column)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| StudyError::Column {
            row: row.index,
            column: column.to_string(),
        })
}

/// Non-hidden subdirectories of `dir`, sorted by name.
fn subdirectories(dir: &Path) -> Result<Vec<PathBuf>, StudyError> {
    let mut dirs = Vec::new();
    for entry in read_dir(dir)? {
        let entry = entry.map_err(|source| StudyError::Io {
            path: display(dir),
            source,
        })?;
        if hidden(&entry) {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// First regular file in the session directory, sorted by name.
fn first_image(session_dir: &Path) -> Result<PathBuf, StudyError> {
    let mut files = Vec::new();
    for entry in read_dir(session_dir)? {
        let entry = entry.map_err(|source| StudyError::Io {
            path: display(session_dir),
            source,
        })?;
        if hidden(&entry) {
            continue;
        }
        let path = entry.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    files.into_iter().next().ok_or_else(|| StudyError::EmptySession {
        path: display(session_dir),
    })
}

fn read_dir(dir: &Path) -> Result<fs::ReadDir, StudyError> {
    fs::read_dir(dir).map_err(|source| StudyError::Io {
        path: display(dir),
        source,
    })
}

fn hidden(entry: &fs::DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with('.')
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs::File;

    fn touch(path: &Path) {
        File::create(path).unwrap();
    }

    /// root/<subject>/<timepoint>/<session>/<files...>
    fn add_visit(root: &Path, subject: &str, timepoint: &str, session: &str, files: &[&str]) {
        let session_dir = root.join(subject).join(timepoint).join(session);
        fs::create_dir_all(&session_dir).unwrap();
        for file in files {
            touch(&session_dir.join(file));
        }
    }

    #[test]
    fn assigns_visit_indices_chronologically() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        // second acquisition listed first on disk, order must come from dates
        add_visit(root, "subA", "2007-01-02_08_00_00.0", "S200", &["img_1_a.dcm"]);
        add_visit(root, "subA", "2006-03-14_09_21_33.0", "S100", &["img_1_a.dcm"]);
        add_visit(root, "subB", "2006-05-01_10_30_00.0", "S300", &["img_1_b.dcm"]);

        let visits = scan_study_tree(root).unwrap();
        assert_eq!(visits.len(), 3);

        assert_eq!(visits[0].id, "subA_S100");
        assert_eq!(visits[0].visit, 1);
        assert_eq!(visits[1].id, "subA_S200");
        assert_eq!(visits[1].visit, 2);
        assert_eq!(visits[2].id, "subB_S300");
        assert_eq!(visits[2].visit, 1);
    }

    #[test]
    fn picks_first_image_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        add_visit(
            root,
            "subA",
            "2006-03-14_09_21_33.0",
            "S100",
            &["b_2.dcm", "a_1.dcm"],
        );

        let visits = scan_study_tree(root).unwrap();
        assert!(visits[0].dcm_path.ends_with("a_1.dcm"));
    }

    #[test]
    fn rejects_multiple_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        add_visit(root, "subA", "2006-03-14_09_21_33.0", "S100", &["img.dcm"]);
        add_visit(root, "subA", "2006-03-14_09_21_33.0", "S101", &["img.dcm"]);

        let err = scan_study_tree(root).unwrap_err();
        assert!(matches!(err, StudyError::SessionCount { found: 2, .. }));
    }

    #[test]
    fn rejects_unparseable_timepoint_name() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        add_visit(root, "subA", "baseline", "S100", &["img.dcm"]);

        let err = scan_study_tree(root).unwrap_err();
        match err {
            StudyError::Timestamp { name, .. } => assert_eq!(name, "baseline"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_empty_session() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        add_visit(root, "subA", "2006-03-14_09_21_33.0", "S100", &[]);

        assert!(matches!(
            scan_study_tree(root).unwrap_err(),
            StudyError::EmptySession { .. }
        ));
    }

    #[test]
    fn manifest_round_trips_through_parser() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        add_visit(root, "subA", "2006-03-14_09_21_33.0", "S100", &["img_1.dcm"]);

        let visits = scan_study_tree(root).unwrap();
        let text = visits_to_manifest(&visits);

        let file = dir.path().join("recon_input.txt");
        fs::write(&file, text).unwrap();
        let manifest = Manifest::read(&file).unwrap();

        assert_eq!(manifest.columns(), &MANIFEST_COLUMNS);
        let row = manifest.rows().next().unwrap();
        assert_eq!(row.get("id"), Some("subA_S100"));
        assert_eq!(row.get("date"), Some("2006-03-14_09_21_33.0"));
        assert_eq!(row.get("visit"), Some("1"));
    }

    fn built_manifest() -> Manifest {
        Manifest::from_parts(
            MANIFEST_COLUMNS.iter().map(|c| c.to_string()).collect(),
            vec![
                row("subA_S200", "subA", "S200", "2"),
                row("subA_S100", "subA", "S100", "1"),
                row("subB_S300", "subB", "S300", "1"),
            ],
        )
    }

    fn row(id: &str, subject: &str, session: &str, visit: &str) -> Vec<String> {
        vec![
            id.to_string(),
            subject.to_string(),
            session.to_string(),
            "2006-03-14_09_21_33.0".to_string(),
            visit.to_string(),
            format!("/raw/{id}.dcm"),
        ]
    }

    #[test]
    fn base_mode_emits_one_command_per_subject_in_visit_order() {
        let lines = synthesize_commands(&built_manifest(), SynthMode::Base).unwrap();
        assert_eq!(
            lines,
            vec![
                "recon-all -base subA -tp subA_S100 -tp subA_S200 -all",
                "recon-all -base subB -tp subB_S300 -all",
            ]
        );
    }

    #[test]
    fn long_mode_emits_one_command_per_timepoint() {
        let lines = synthesize_commands(&built_manifest(), SynthMode::Long).unwrap();
        assert_eq!(
            lines,
            vec![
                "recon-all -long subA_S100 subA -all",
                "recon-all -long subA_S200 subA -all",
                "recon-all -long subB_S300 subB -all",
            ]
        );
    }

    #[test]
    fn synthesizer_rejects_bad_visit() {
        let manifest = Manifest::from_parts(
            vec!["id".into(), "subject".into(), "visit".into()],
            vec![vec!["a_S1".into(), "a".into(), "one".into()]],
        );
        let err = synthesize_commands(&manifest, SynthMode::Base).unwrap_err();
        assert!(matches!(err, StudyError::Visit { row: 1, .. }));
    }

    #[test]
    fn synthesizer_requires_subject_column() {
        let manifest = Manifest::from_parts(
            vec!["id".into(), "visit".into()],
            vec![vec!["a_S1".into(), "1".into()]],
        );
        let err = synthesize_commands(&manifest, SynthMode::Base).unwrap_err();
        assert!(matches!(err, StudyError::Column { row: 1, .. }));
    }
}
