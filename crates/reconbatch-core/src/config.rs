//! Batch configuration shared by the formatter, the maintenance tools, and
//! the QC review loop.
//!
//! The subjects directory is resolved once at the edge (the CLI reads the
//! flag or `$SUBJECTS_DIR`) and threaded through explicitly. Nothing in
//! this crate consults the process environment, so every component can be
//! pointed at a temporary directory under test.

use std::path::PathBuf;

/// Environment variable consulted when `--subjects-dir` is not given.
pub const SUBJECTS_DIR_ENV: &str = "SUBJECTS_DIR";

/// Viewer executable launched by the QC review loop.
pub const DEFAULT_VIEWER: &str = "freeview";

/// Configuration for one invocation: where processed output lives and
/// which viewer QC review opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    /// Root directory holding one output subdirectory per processed unit.
    pub subjects_dir: PathBuf,
    /// Viewer executable for QC review.
    pub viewer: String,
}

impl BatchConfig {
    pub fn new(subjects_dir: impl Into<PathBuf>) -> Self {
        Self {
            subjects_dir: subjects_dir.into(),
            viewer: DEFAULT_VIEWER.to_string(),
        }
    }

    /// Override the viewer executable.
    pub fn with_viewer(mut self, viewer: impl Into<String>) -> Self {
        self.viewer = viewer.into();
        self
    }

    /// One unit's output directory.
    pub fn unit_dir(&self, unit: &str) -> PathBuf {
        self.subjects_dir.join(unit)
    }

    /// A file under one unit's `mri/` directory.
    pub fn mri_path(&self, unit: &str, file: &str) -> PathBuf {
        self.subjects_dir.join(unit).join("mri").join(file)
    }

    /// A file under one unit's `surf/` directory.
    pub fn surf_path(&self, unit: &str, file: &str) -> PathBuf {
        self.subjects_dir.join(unit).join("surf").join(file)
    }
}
