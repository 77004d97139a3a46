//! Structured external commands and the per-stage formatter.
//!
//! Every stage turns manifest rows into [`CommandChain`]s: a label naming
//! the unit of work plus the commands that must run in order for it.
//! Commands are program + argv and never pass through a shell, so a field
//! value cannot smuggle in extra arguments.
//!
//! Formatting is pure. The same rows, stage, and config always produce the
//! same chains; nothing is touched on disk until the runner executes them.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;

use regex::Regex;
use thiserror::Error;

use crate::config::BatchConfig;
use crate::manifest::{Manifest, ManifestRow};

/// Pipeline stages the formatter knows how to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Initial cross-sectional reconstruction, one row per image.
    Reconstruct,
    /// Pre-synthesized within-subject template commands (pass-through).
    ReconstructBase,
    /// Pre-synthesized longitudinal commands (pass-through).
    ReconstructLong,
    /// Subcortical segmentation, one row per reconstructed unit.
    Segment,
    /// Longitudinal segmentation aggregated over unique subjects.
    SegmentLong,
    /// Two-step graph-cut mask chain per row.
    MaskEdit,
    /// Commit an edited mask and re-run the later reconstruction stages.
    CommitEdit,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Reconstruct => "reconstruct",
            CommandKind::ReconstructBase => "reconstruct-base",
            CommandKind::ReconstructLong => "reconstruct-long",
            CommandKind::Segment => "segment",
            CommandKind::SegmentLong => "segment-long",
            CommandKind::MaskEdit => "mask-edit",
            CommandKind::CommitEdit => "commit-edit",
        }
    }

    /// Pass-through kinds read headerless command files instead of
    /// header-aware manifests.
    pub fn is_pass_through(&self) -> bool {
        matches!(self, CommandKind::ReconstructBase | CommandKind::ReconstructLong)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single external program invocation: program plus explicit argv.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ExternalCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Render as one display line for reports and logs.
    pub fn rendered(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

impl fmt::Display for ExternalCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered())
    }
}

/// One unit's ordered command sequence. A failing step skips the rest of
/// the chain; independent chains are unaffected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandChain {
    /// Unit of work this chain belongs to (row id or subject).
    pub label: String,
    pub steps: Vec<ExternalCommand>,
}

impl CommandChain {
    pub fn new(label: impl Into<String>, steps: Vec<ExternalCommand>) -> Self {
        Self {
            label: label.into(),
            steps,
        }
    }

    pub fn single(label: impl Into<String>, step: ExternalCommand) -> Self {
        Self::new(label, vec![step])
    }
}

/// Errors raised while formatting commands from manifest rows.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("row {row}: missing required column '{column}'")]
    MissingField { row: usize, column: String },
    #[error("row {row}: column '{column}' is empty")]
    EmptyField { row: usize, column: String },
    #[error("row {row}: duplicate id '{id}' (first seen in row {first})")]
    DuplicateId { row: usize, id: String, first: usize },
    #[error("line {line}: expected a recon-all {flag} command: {text}")]
    BadCommandLine {
        line: usize,
        flag: &'static str,
        text: String,
    },
    #[error("invalid command pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Format every row of `manifest` for the given stage.
pub fn format_batch(
    kind: CommandKind,
    manifest: &Manifest,
    config: &BatchConfig,
) -> Result<Vec<CommandChain>, FormatError> {
    match kind {
        CommandKind::Reconstruct => reconstruct_chains(manifest),
        CommandKind::ReconstructBase => pass_through_chains(manifest, PassThrough::Base),
        CommandKind::ReconstructLong => pass_through_chains(manifest, PassThrough::Long),
        CommandKind::Segment => segment_chains(manifest),
        CommandKind::SegmentLong => segment_long_chains(manifest),
        CommandKind::MaskEdit => mask_edit_chains(manifest, config),
        CommandKind::CommitEdit => commit_edit_chains(manifest, config),
    }
}

/// `recon-all -all -s {id} -i {dcm_path}` per row.
fn reconstruct_chains(manifest: &Manifest) -> Result<Vec<CommandChain>, FormatError> {
    let mut seen = SeenIds::default();
    let mut chains = Vec::with_capacity(manifest.len());
    for row in manifest.rows() {
        let id = require(&row, "id")?;
        seen.check(id, row.index)?;
        let dcm_path = require(&row, "dcm_path")?;
        let step = ExternalCommand::new("recon-all")
            .arg("-all")
            .arg("-s")
            .arg(id)
            .arg("-i")
            .arg(dcm_path);
        chains.push(CommandChain::single(id, step));
    }
    Ok(chains)
}

/// `segmentHA_T1.sh {id}` per row.
fn segment_chains(manifest: &Manifest) -> Result<Vec<CommandChain>, FormatError> {
    let mut seen = SeenIds::default();
    let mut chains = Vec::with_capacity(manifest.len());
    for row in manifest.rows() {
        let id = require(&row, "id")?;
        seen.check(id, row.index)?;
        chains.push(CommandChain::single(
            id,
            ExternalCommand::new("segmentHA_T1.sh").arg(id),
        ));
    }
    Ok(chains)
}

/// One aggregated `segmentHA_T1_long.sh {subject...}` over unique subjects,
/// in first-seen order. An empty manifest yields no chains.
fn segment_long_chains(manifest: &Manifest) -> Result<Vec<CommandChain>, FormatError> {
    let mut subjects: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for row in manifest.rows() {
        let subject = require(&row, "subject")?;
        if seen.insert(subject.to_string()) {
            subjects.push(subject.to_string());
        }
    }
    if subjects.is_empty() {
        return Ok(Vec::new());
    }
    let step = ExternalCommand::new("segmentHA_T1_long.sh").args(subjects);
    Ok(vec![CommandChain::single("segment-long", step)])
}

/// Per row: graph-cut the brain mask at the row's intensity ratio, then
/// binarize the cut mask in place.
fn mask_edit_chains(
    manifest: &Manifest,
    config: &BatchConfig,
) -> Result<Vec<CommandChain>, FormatError> {
    let mut seen = SeenIds::default();
    let mut chains = Vec::with_capacity(manifest.len());
    for row in manifest.rows() {
        let id = require(&row, "id")?;
        seen.check(id, row.index)?;
        let ratio = require(&row, "ratio")?;

        let auto = arg_path(config.mri_path(id, "brainmask.auto.mgz"));
        let t1 = arg_path(config.mri_path(id, "T1.mgz"));
        let tmp = arg_path(config.mri_path(id, &format!("brainmask.tmp{ratio}.mgz")));
        let gcuts = arg_path(config.mri_path(id, &format!("brainmask.gcutsT{ratio}.mgz")));

        let gcut = ExternalCommand::new("mri_gcut")
            .arg("-110")
            .arg("-T")
            .arg(ratio)
            .arg("-mult")
            .arg(&auto)
            .arg(&t1)
            .arg(&tmp)
            .arg(&gcuts);
        let binarize = ExternalCommand::new("mri_binarize")
            .arg("--i")
            .arg(&gcuts)
            .arg("--o")
            .arg(&gcuts)
            .arg("--binval")
            .arg("999")
            .arg("--min")
            .arg("1");
        chains.push(CommandChain::new(id, vec![gcut, binarize]));
    }
    Ok(chains)
}

/// Per row: install the edited mask over both mask paths, then re-run the
/// later reconstruction stages.
fn commit_edit_chains(
    manifest: &Manifest,
    config: &BatchConfig,
) -> Result<Vec<CommandChain>, FormatError> {
    let mut seen = SeenIds::default();
    let mut chains = Vec::with_capacity(manifest.len());
    for row in manifest.rows() {
        let id = require(&row, "id")?;
        seen.check(id, row.index)?;
        let ratio = require(&row, "ratio")?;

        let tmp = arg_path(config.mri_path(id, &format!("brainmask.tmp{ratio}.mgz")));
        let auto = arg_path(config.mri_path(id, "brainmask.auto.mgz"));
        let mask = arg_path(config.mri_path(id, "brainmask.mgz"));

        let install_auto = ExternalCommand::new("cp").arg(&tmp).arg(&auto);
        let install_mask = ExternalCommand::new("cp").arg(&tmp).arg(&mask);
        let rerun = ExternalCommand::new("recon-all")
            .arg("-autorecon2-wm")
            .arg("-autorecon3")
            .arg("-s")
            .arg(id);
        chains.push(CommandChain::new(id, vec![install_auto, install_mask, rerun]));
    }
    Ok(chains)
}

#[derive(Debug, Clone, Copy)]
enum PassThrough {
    Base,
    Long,
}

impl PassThrough {
    fn flag(&self) -> &'static str {
        match self {
            PassThrough::Base => "-base",
            PassThrough::Long => "-long",
        }
    }

    /// Anchored shape check. Group 1 captures the unit label: the subject
    /// for base commands, the timepoint id for long commands.
    fn pattern(&self) -> &'static str {
        match self {
            PassThrough::Base => r"^recon-all\s+-base\s+(\S+)(?:\s+-tp\s+\S+)+\s+-all\s*$",
            PassThrough::Long => r"^recon-all\s+-long\s+(\S+)\s+\S+\s+-all\s*$",
        }
    }
}

/// Validate pre-synthesized command lines and split them into argv.
fn pass_through_chains(
    manifest: &Manifest,
    which: PassThrough,
) -> Result<Vec<CommandChain>, FormatError> {
    let shape = Regex::new(which.pattern())?;
    let mut chains = Vec::with_capacity(manifest.len());
    for row in manifest.rows() {
        let text = row.position(0).unwrap_or("").trim();
        let bad_line = || FormatError::BadCommandLine {
            line: row.index,
            flag: which.flag(),
            text: text.to_string(),
        };

        let caps = shape.captures(text).ok_or_else(|| bad_line())?;
        let label = caps
            .get(1)
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| bad_line())?;

        let mut tokens = text.split_whitespace().map(str::to_string);
        let program = tokens.next().ok_or_else(|| bad_line())?;
        let args: Vec<String> = tokens.collect();
        chains.push(CommandChain::single(label, ExternalCommand { program, args }));
    }
    Ok(chains)
}

/// Duplicate-id guard for the per-row stages.
#[derive(Default)]
struct SeenIds {
    first_rows: HashMap<String, usize>,
}

impl SeenIds {
    fn check(&mut self, id: &str, row: usize) -> Result<(), FormatError> {
        match self.first_rows.get(id) {
            Some(&first) => Err(FormatError::DuplicateId {
                row,
                id: id.to_string(),
                first,
            }),
            None => {
                self.first_rows.insert(id.to_string(), row);
                Ok(())
            }
        }
    }
}

fn require<'a>(row: &ManifestRow<'a>, column: &str) -> Result<&'a str, FormatError> {
    match row.get(column) {
        Some(value) if !value.trim().is_empty() => Ok(value),
        Some(_) => Err(FormatError::EmptyField {
            row: row.index,
            column: column.to_string(),
        }),
        None => Err(FormatError::MissingField {
            row: row.index,
            column: column.to_string(),
        }),
    }
}

fn arg_path(path: PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn manifest(columns: &[&str], rows: &[&[&str]]) -> Manifest {
        Manifest::from_parts(
            columns.iter().map(|c| c.to_string()).collect(),
            rows.iter()
                .map(|r| r.iter().map(|f| f.to_string()).collect())
                .collect(),
        )
    }

    fn headerless(lines: &[&str]) -> Manifest {
        Manifest::from_parts(
            Vec::new(),
            lines.iter().map(|l| vec![l.to_string()]).collect(),
        )
    }

    fn config() -> BatchConfig {
        BatchConfig::new("/out")
    }

    #[test]
    fn reconstruct_renders_per_row() {
        let m = manifest(
            &["id", "dcm_path"],
            &[&["a_S1", "/raw/a.dcm"], &["b_S2", "/raw/b.dcm"]],
        );
        let chains = format_batch(CommandKind::Reconstruct, &m, &config()).unwrap();
        assert_eq!(chains.len(), 2);
        assert_eq!(chains[0].label, "a_S1");
        assert_eq!(
            chains[0].steps[0].rendered(),
            "recon-all -all -s a_S1 -i /raw/a.dcm"
        );
        assert_eq!(
            chains[1].steps[0].rendered(),
            "recon-all -all -s b_S2 -i /raw/b.dcm"
        );
    }

    #[test]
    fn formatting_is_pure() {
        let m = manifest(&["id", "dcm_path"], &[&["a_S1", "/raw/a.dcm"]]);
        let first = format_batch(CommandKind::Reconstruct, &m, &config()).unwrap();
        let second = format_batch(CommandKind::Reconstruct, &m, &config()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn missing_column_names_row_and_field() {
        let m = manifest(&["id"], &[&["a_S1"]]);
        let err = format_batch(CommandKind::Reconstruct, &m, &config()).unwrap_err();
        match err {
            FormatError::MissingField { row, column } => {
                assert_eq!(row, 1);
                assert_eq!(column, "dcm_path");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_field_is_rejected() {
        let m = manifest(&["id", "dcm_path"], &[&["a_S1", "  "]]);
        assert!(matches!(
            format_batch(CommandKind::Reconstruct, &m, &config()).unwrap_err(),
            FormatError::EmptyField { row: 1, .. }
        ));
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let m = manifest(
            &["id", "dcm_path"],
            &[&["a_S1", "/raw/a.dcm"], &["a_S1", "/raw/a2.dcm"]],
        );
        let err = format_batch(CommandKind::Reconstruct, &m, &config()).unwrap_err();
        match err {
            FormatError::DuplicateId { row, id, first } => {
                assert_eq!((row, first), (2, 1));
                assert_eq!(id, "a_S1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn segment_long_aggregates_unique_subjects_in_first_seen_order() {
        let m = manifest(&["subject"], &[&["A"], &["B"], &["A"]]);
        let chains = format_batch(CommandKind::SegmentLong, &m, &config()).unwrap();
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].steps[0].rendered(), "segmentHA_T1_long.sh A B");
    }

    #[test]
    fn segment_long_empty_manifest_yields_no_chains() {
        let m = manifest(&["subject"], &[]);
        let chains = format_batch(CommandKind::SegmentLong, &m, &config()).unwrap();
        assert!(chains.is_empty());
    }

    #[test]
    fn mask_edit_binarize_consumes_gcut_output() {
        let m = manifest(&["id", "ratio"], &[&["sub01", "50"]]);
        let chains = format_batch(CommandKind::MaskEdit, &m, &config()).unwrap();
        assert_eq!(chains.len(), 1);
        let steps = &chains[0].steps;
        assert_eq!(steps.len(), 2);
        assert_eq!(
            steps[0].rendered(),
            "mri_gcut -110 -T 50 -mult /out/sub01/mri/brainmask.auto.mgz \
             /out/sub01/mri/T1.mgz /out/sub01/mri/brainmask.tmp50.mgz \
             /out/sub01/mri/brainmask.gcutsT50.mgz"
        );
        // the binarize input must be the gcut output, byte for byte
        let gcut_output = steps[0].args.last().unwrap();
        assert_eq!(steps[1].args[1], *gcut_output);
        assert_eq!(
            steps[1].rendered(),
            "mri_binarize --i /out/sub01/mri/brainmask.gcutsT50.mgz \
             --o /out/sub01/mri/brainmask.gcutsT50.mgz --binval 999 --min 1"
        );
    }

    #[test]
    fn commit_edit_installs_then_reruns() {
        let m = manifest(&["id", "ratio"], &[&["sub01", "50"]]);
        let chains = format_batch(CommandKind::CommitEdit, &m, &config()).unwrap();
        let steps = &chains[0].steps;
        assert_eq!(steps.len(), 3);
        assert_eq!(
            steps[0].rendered(),
            "cp /out/sub01/mri/brainmask.tmp50.mgz /out/sub01/mri/brainmask.auto.mgz"
        );
        assert_eq!(
            steps[1].rendered(),
            "cp /out/sub01/mri/brainmask.tmp50.mgz /out/sub01/mri/brainmask.mgz"
        );
        assert_eq!(steps[2].rendered(), "recon-all -autorecon2-wm -autorecon3 -s sub01");
    }

    #[rstest]
    #[case::base(
        CommandKind::ReconstructBase,
        "recon-all -base SUBJ -tp SUBJ_S1 -tp SUBJ_S2 -all",
        "SUBJ"
    )]
    #[case::long(
        CommandKind::ReconstructLong,
        "recon-all -long SUBJ_S1 SUBJ -all",
        "SUBJ_S1"
    )]
    fn pass_through_splits_and_labels(
        #[case] kind: CommandKind,
        #[case] line: &str,
        #[case] label: &str,
    ) {
        let m = headerless(&[line]);
        let chains = format_batch(kind, &m, &config()).unwrap();
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].label, label);
        assert_eq!(chains[0].steps[0].program, "recon-all");
        assert_eq!(chains[0].steps[0].rendered(), line);
    }

    #[rstest]
    #[case::wrong_flag("recon-all -long SUBJ_S1 SUBJ -all")]
    #[case::missing_tp("recon-all -base SUBJ -all")]
    #[case::no_trailing_all("recon-all -base SUBJ -tp SUBJ_S1")]
    #[case::not_recon_all("ls -la /out")]
    fn base_pass_through_rejects_malformed_lines(#[case] line: &str) {
        let m = headerless(&[line]);
        let err = format_batch(CommandKind::ReconstructBase, &m, &config()).unwrap_err();
        assert!(matches!(err, FormatError::BadCommandLine { line: 1, .. }));
    }

    #[test]
    fn long_pass_through_reports_offending_line_number() {
        let m = headerless(&[
            "recon-all -long a_S1 a -all",
            "recon-all -base a -tp a_S1 -all",
        ]);
        let err = format_batch(CommandKind::ReconstructLong, &m, &config()).unwrap_err();
        match err {
            FormatError::BadCommandLine { line, flag, .. } => {
                assert_eq!(line, 2);
                assert_eq!(flag, "-long");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
