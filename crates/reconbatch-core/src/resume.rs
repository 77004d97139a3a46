//! Resume support: rewrite a batch input without its completed units.
//!
//! A unit counts as completed when any `*.done` marker exists under
//! `{subjects_dir}/{unit}/scripts/`. Longitudinal output lives under a
//! `{timepoint}.long.{base}` directory, found by prefix. The remainder is
//! written to a dated sibling of the input file; with `clean` set, output
//! directories of units that started but never finished are removed so
//! those units rerun from scratch.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::BatchConfig;
use crate::manifest::{Manifest, ManifestError};

/// Input shapes the updater understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeKind {
    /// Header-aware manifest, filtered by its `id` column.
    Manifest,
    /// Base command file, filtered by the subject token (position 2).
    Base,
    /// Long command file, filtered by the timepoint token (position 2).
    Long,
}

#[derive(Debug, Error)]
pub enum ResumeError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("row {row}: missing required column 'id'")]
    MissingId { row: usize },
    #[error("line {line}: command has no token at position {position}")]
    Token { line: usize, position: usize },
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of one resume pass.
#[derive(Debug)]
pub struct ResumeOutcome {
    /// Dated file the remainder was written to.
    pub output: PathBuf,
    /// Units still needing processing.
    pub remaining: usize,
    /// Units dropped because their completion marker exists.
    pub completed: usize,
    /// Unfinished output directories removed (with `clean`).
    pub cleaned: Vec<PathBuf>,
}

/// Filter completed units out of `input` and write the remainder to a
/// dated sibling file.
pub fn filter_input(
    input: &Path,
    kind: ResumeKind,
    config: &BatchConfig,
    clean: bool,
) -> Result<ResumeOutcome, ResumeError> {
    match kind {
        ResumeKind::Manifest => filter_manifest(input, config, clean),
        ResumeKind::Base => filter_commands(input, config, clean, false),
        ResumeKind::Long => filter_commands(input, config, clean, true),
    }
}

/// True when the unit's output directory holds any `*.done` marker.
pub fn has_completion_marker(config: &BatchConfig, unit: &str) -> bool {
    dir_has_done_marker(&config.unit_dir(unit))
}

/// `{YYYY-MM-DD}_{file name}` beside the input file.
pub fn dated_output_path(input: &Path) -> PathBuf {
    let date = Local::now().format("%Y-%m-%d");
    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input".to_string());
    let dated = format!("{date}_{name}");
    match input.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(dated),
        _ => PathBuf::from(dated),
    }
}

fn filter_manifest(
    input: &Path,
    config: &BatchConfig,
    clean: bool,
) -> Result<ResumeOutcome, ResumeError> {
    let manifest = Manifest::read(input)?;

    let mut kept: Vec<String> = Vec::new();
    let mut completed = 0;
    let mut cleaned = Vec::new();

    for row in manifest.rows() {
        let id = row
            .get("id")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ResumeError::MissingId { row: row.index })?;

        if has_completion_marker(config, id) {
            completed += 1;
            info!(unit = id, "completed, dropping from manifest");
        } else {
            if clean {
                remove_unfinished(config.unit_dir(id), &mut cleaned);
            }
            kept.push(row.fields().join("\t"));
        }
    }

    let mut text = manifest.columns().join("\t");
    text.push('\n');
    for line in &kept {
        text.push_str(line);
        text.push('\n');
    }

    let output = dated_output_path(input);
    write_output(&output, &text)?;
    Ok(ResumeOutcome {
        output,
        remaining: kept.len(),
        completed,
        cleaned,
    })
}

fn filter_commands(
    input: &Path,
    config: &BatchConfig,
    clean: bool,
    long: bool,
) -> Result<ResumeOutcome, ResumeError> {
    let raw = fs::read_to_string(input).map_err(|source| ResumeError::Read {
        path: input.display().to_string(),
        source,
    })?;

    let mut kept: Vec<&str> = Vec::new();
    let mut completed = 0;
    let mut cleaned = Vec::new();

    for (i, line) in raw.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let unit = line
            .split_whitespace()
            .nth(2)
            .ok_or(ResumeError::Token {
                line: i + 1,
                position: 2,
            })?;

        let unit_dir = if long {
            long_unit_dir(config, unit)
        } else {
            Some(config.unit_dir(unit))
        };
        let done = unit_dir.as_deref().is_some_and(dir_has_done_marker);

        if done {
            completed += 1;
            info!(unit, "completed, dropping command");
        } else {
            if clean {
                if let Some(dir) = unit_dir {
                    remove_unfinished(dir, &mut cleaned);
                }
            }
            kept.push(line);
        }
    }

    let mut text = kept.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }

    let output = dated_output_path(input);
    write_output(&output, &text)?;
    Ok(ResumeOutcome {
        output,
        remaining: kept.len(),
        completed,
        cleaned,
    })
}

fn write_output(output: &Path, text: &str) -> Result<(), ResumeError> {
    fs::write(output, text).map_err(|source| ResumeError::Write {
        path: output.display().to_string(),
        source,
    })
}

fn dir_has_done_marker(unit_dir: &Path) -> bool {
    let scripts = unit_dir.join("scripts");
    let Ok(entries) = fs::read_dir(scripts) else {
        return false;
    };
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().ends_with(".done") && entry.path().is_file() {
            return true;
        }
    }
    false
}

/// The longitudinal output directory `{timepoint}.long.*`, if present.
fn long_unit_dir(config: &BatchConfig, timepoint: &str) -> Option<PathBuf> {
    let prefix = format!("{timepoint}.long.");
    let entries = fs::read_dir(&config.subjects_dir).ok()?;
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().starts_with(&prefix) && entry.path().is_dir() {
            return Some(entry.path());
        }
    }
    None
}

/// Remove a partial output directory so the unit reruns from scratch.
fn remove_unfinished(dir: PathBuf, cleaned: &mut Vec<PathBuf>) {
    if !dir.is_dir() {
        return;
    }
    match fs::remove_dir_all(&dir) {
        Ok(()) => {
            info!(path = %dir.display(), "removed unfinished output directory");
            cleaned.push(dir);
        }
        Err(e) => {
            warn!(path = %dir.display(), error = %e, "could not remove output directory");
        }
    }
}
