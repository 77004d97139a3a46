//! Interactive QC review loop.
//!
//! Walks every pending subject in order, opens the viewer on its volumes
//! and surfaces, then prompts for a pass/fail verdict and a free-text
//! comment. Each verdict is appended to the QC log immediately, so an
//! interrupted session loses nothing and never re-asks on the next run.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::Editor;

use reconbatch_core::qc::{self, QcRecord};
use reconbatch_core::BatchConfig;

/// Run the review loop over all pending subjects.
pub fn run(config: &BatchConfig, log: &Path) -> Result<()> {
    let pending = qc::pending_subjects(&config.subjects_dir, log)
        .with_context(|| format!("list subjects under {}", config.subjects_dir.display()))?;
    if pending.is_empty() {
        println!("No subjects left to review.");
        return Ok(());
    }
    println!("{} subject(s) to review; log: {}", pending.len(), log.display());

    let mut rl: Editor<(), DefaultHistory> = Editor::new().context("Failed to create editor")?;

    // Load history if it exists
    let history_path = directories::BaseDirs::new()
        .map(|b| b.data_dir().join("reconbatch").join("history.txt"));
    if let Some(ref path) = history_path {
        if let Err(e) = rl.load_history(path) {
            // Only log if it's not a "file not found" error (expected on first run)
            let is_not_found = matches!(&e, ReadlineError::Io(io_err) if io_err.kind() == std::io::ErrorKind::NotFound);
            if !is_not_found {
                tracing::warn!("Failed to load history: {}", e);
            }
        }
    }

    for subject in pending {
        qc::ensure_subject_dir(config, &subject)
            .context("check the subjects directory setting")?;

        println!("SUBJECT: {subject}");
        launch_viewer(config, &subject)?;

        let Some(passed) = prompt_verdict(&mut rl)? else {
            println!("Review interrupted; verdicts so far are saved.");
            save_history(&mut rl, &history_path);
            return Ok(());
        };
        let Some(comment) = prompt_comment(&mut rl)? else {
            println!("Review interrupted; verdicts so far are saved.");
            save_history(&mut rl, &history_path);
            return Ok(());
        };

        qc::append_record(
            log,
            &QcRecord {
                subject,
                passed,
                comment,
            },
        )
        .with_context(|| format!("append to {}", log.display()))?;
    }

    save_history(&mut rl, &history_path);
    println!("Review complete.");
    Ok(())
}

/// Open the viewer and wait for the operator to close it.
fn launch_viewer(config: &BatchConfig, subject: &str) -> Result<()> {
    let viewer = qc::viewer_command(config, subject);
    let status = Command::new(&viewer.program)
        .args(&viewer.args)
        .status()
        .with_context(|| format!("launch {} for {subject}", viewer.program))?;
    if !status.success() {
        tracing::warn!(
            subject,
            code = status.code().unwrap_or(-1),
            "viewer exited abnormally"
        );
    }
    Ok(())
}

/// Ask until the answer is Y or N. `None` means the operator quit.
fn prompt_verdict(rl: &mut Editor<(), DefaultHistory>) -> Result<Option<bool>> {
    loop {
        let Some(line) = prompt(rl, "Passed quality control? [Y/N]: ")? else {
            return Ok(None);
        };
        match line.trim().to_uppercase().as_str() {
            "Y" => return Ok(Some(true)),
            "N" => return Ok(Some(false)),
            _ => println!("Please answer with Y or N"),
        }
    }
}

fn prompt_comment(rl: &mut Editor<(), DefaultHistory>) -> Result<Option<String>> {
    let Some(comment) = prompt(rl, "Type any observations: ")? else {
        return Ok(None);
    };
    if !comment.trim().is_empty() {
        if let Err(e) = rl.add_history_entry(comment.as_str()) {
            tracing::warn!("Failed to add history entry: {}", e);
        }
    }
    Ok(Some(comment))
}

/// One line of input; `None` on ^C or ^D.
fn prompt(rl: &mut Editor<(), DefaultHistory>, text: &str) -> Result<Option<String>> {
    match rl.readline(text) {
        Ok(line) => Ok(Some(line)),
        Err(ReadlineError::Interrupted) => {
            println!("^C");
            Ok(None)
        }
        Err(ReadlineError::Eof) => {
            println!("^D");
            Ok(None)
        }
        Err(e) => Err(e).context("read input"),
    }
}

/// Save review history to disk.
fn save_history(rl: &mut Editor<(), DefaultHistory>, history_path: &Option<PathBuf>) {
    if let Some(path) = history_path {
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!("Failed to create history directory: {}", e);
            }
        }
        if let Err(e) = rl.save_history(path) {
            tracing::warn!("Failed to save history: {}", e);
        }
    }
}
