//! reconbatch-core: the engine behind the `reconbatch` CLI.
//!
//! This crate provides:
//!
//! - **Manifest**: Tab-separated input tables, header-aware or positional
//! - **Command**: Structured external commands and the per-stage formatter
//! - **Runner**: Bounded parallel execution of per-row command chains
//! - **Study**: Study-tree scanning and base/long command synthesis
//! - **Resume**: Dropping completed rows from an interrupted batch input
//! - **Status**: Completion and error marker scans over the output tree
//! - **QC**: The append-only manual quality-control log

pub mod command;
pub mod config;
pub mod manifest;
pub mod qc;
pub mod resume;
pub mod runner;
pub mod status;
pub mod study;

pub use command::{format_batch, CommandChain, CommandKind, ExternalCommand, FormatError};
pub use config::BatchConfig;
pub use manifest::{Manifest, ManifestError, ManifestRow};
pub use runner::{BatchReport, BatchRunner, JobResult, StepResult};

// Maintenance-tool surface (the CLI composes these directly)
pub use resume::{ResumeKind, ResumeOutcome};
pub use status::LogState;
pub use study::{scan_study_tree, synthesize_commands, StudyVisit, SynthMode};
