//! Completion and error scans over the output tree.
//!
//! Every reconstruction leaves an exact `scripts/recon-all.done` or
//! `scripts/recon-all.error` marker in its unit directory. This scan is
//! stricter than the resume filter, which accepts any `*.done` file.

use std::fs;
use std::io;
use std::path::Path;

/// Marker the scan looks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogState {
    Done,
    Error,
}

impl LogState {
    pub fn file_name(&self) -> &'static str {
        match self {
            LogState::Done => "recon-all.done",
            LogState::Error => "recon-all.error",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogState::Done => "done",
            LogState::Error => "error",
        }
    }
}

/// Unit ids under `subjects_dir` whose `scripts/` holds the given marker,
/// sorted by name.
pub fn scan_log_state(subjects_dir: &Path, state: LogState) -> io::Result<Vec<String>> {
    let mut units = Vec::new();
    for entry in fs::read_dir(subjects_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || !entry.path().is_dir() {
            continue;
        }
        if entry.path().join("scripts").join(state.file_name()).is_file() {
            units.push(name);
        }
    }
    units.sort();
    Ok(units)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_marker(root: &Path, unit: &str, marker: &str) {
        let scripts = root.join(unit).join("scripts");
        fs::create_dir_all(&scripts).unwrap();
        fs::write(scripts.join(marker), "").unwrap();
    }

    #[test]
    fn finds_done_and_error_units_separately() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        with_marker(root, "sub02_S2", "recon-all.done");
        with_marker(root, "sub01_S1", "recon-all.done");
        with_marker(root, "sub03_S3", "recon-all.error");
        fs::create_dir_all(root.join("sub04_S4")).unwrap();

        let done = scan_log_state(root, LogState::Done).unwrap();
        assert_eq!(done, ["sub01_S1", "sub02_S2"]);

        let errors = scan_log_state(root, LogState::Error).unwrap();
        assert_eq!(errors, ["sub03_S3"]);
    }

    #[test]
    fn ignores_loose_files_and_other_markers() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("notes.txt"), "").unwrap();
        with_marker(root, "sub01_S1", "autorecon3.done");

        let done = scan_log_state(root, LogState::Done).unwrap();
        assert!(done.is_empty());
    }
}
