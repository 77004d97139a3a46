//! reconbatch CLI entry point.
//!
//! Usage:
//!   reconbatch reconstruct -i recon_input.txt -p 4
//!   reconbatch segment -i recon_input.txt
//!   reconbatch mask-edit -i edit_input.txt --subjects-dir /data/outputs
//!   reconbatch build-manifest --root /data/study -o recon_input.txt
//!   reconbatch resume -i recon_input.txt --clean
//!   reconbatch review
//!
//! Every pipeline stage is parse, format, run: rows from the input file
//! become command chains, and the runner executes them with a bounded
//! worker pool. Maintenance subcommands build and rewrite the inputs.

mod review;

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use reconbatch_core::config::SUBJECTS_DIR_ENV;
use reconbatch_core::{
    format_batch, qc, resume, status, study, BatchConfig, BatchReport, BatchRunner, CommandKind,
    LogState, Manifest, ResumeKind, SynthMode,
};

#[derive(Parser)]
#[command(
    name = "reconbatch",
    version,
    about = "Parallel batch processing for FreeSurfer reconstruction pipelines"
)]
struct Cli {
    /// Root output directory (defaults to $SUBJECTS_DIR)
    #[arg(long, global = true, value_name = "DIR")]
    subjects_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run cross-sectional reconstruction for every manifest row
    Reconstruct(RunArgs),
    /// Run pre-synthesized within-subject template commands
    ReconstructBase(RunArgs),
    /// Run pre-synthesized longitudinal commands
    ReconstructLong(RunArgs),
    /// Run subcortical segmentation for every manifest row
    Segment(RunArgs),
    /// Run one aggregated longitudinal segmentation over unique subjects
    SegmentLong(RunArgs),
    /// Run the graph-cut mask chain for every manifest row
    MaskEdit(RunArgs),
    /// Install edited masks and re-run the later reconstruction stages
    CommitEdit(RunArgs),
    /// Build a manifest by scanning a study directory tree
    BuildManifest {
        /// Study root laid out as <subject>/<timepoint>/<session>/<images>
        #[arg(long, value_name = "DIR")]
        root: PathBuf,
        /// Manifest file to write
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
    },
    /// Synthesize base or long command files from a built manifest
    SynthCommands {
        /// Built manifest with subject and visit columns
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,
        /// base: one template command per subject; long: one per timepoint
        #[arg(long, value_enum)]
        mode: SynthModeArg,
        /// Command file to write
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
    },
    /// Write a dated copy of an input with completed units removed
    Resume {
        /// Input manifest or command file to filter
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,
        /// Input shape to filter
        #[arg(long, value_enum, default_value = "manifest")]
        kind: ResumeKindArg,
        /// Remove unfinished output directories so those units rerun
        #[arg(long)]
        clean: bool,
    },
    /// List units whose reconstruction finished or failed
    Status {
        /// Marker to look for
        #[arg(long, value_enum, default_value = "done")]
        state: LogStateArg,
    },
    /// Review each pending subject in the viewer and log verdicts
    Review {
        /// QC log file
        #[arg(long, value_name = "FILE")]
        log: Option<PathBuf>,
        /// Viewer program to launch
        #[arg(long, value_name = "PROGRAM")]
        viewer: Option<String>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Input manifest (or synthesized command file)
    #[arg(short, long, value_name = "FILE")]
    input: PathBuf,

    /// Concurrent jobs (default: number of CPUs)
    #[arg(short, long, value_name = "N")]
    parallel: Option<usize>,

    /// Print the batch report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SynthModeArg {
    Base,
    Long,
}

impl From<SynthModeArg> for SynthMode {
    fn from(arg: SynthModeArg) -> Self {
        match arg {
            SynthModeArg::Base => SynthMode::Base,
            SynthModeArg::Long => SynthMode::Long,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ResumeKindArg {
    Manifest,
    Base,
    Long,
}

impl From<ResumeKindArg> for ResumeKind {
    fn from(arg: ResumeKindArg) -> Self {
        match arg {
            ResumeKindArg::Manifest => ResumeKind::Manifest,
            ResumeKindArg::Base => ResumeKind::Base,
            ResumeKindArg::Long => ResumeKind::Long,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogStateArg {
    Done,
    Error,
}

impl From<LogStateArg> for LogState {
    fn from(arg: LogStateArg) -> Self {
        match arg {
            LogStateArg::Done => LogState::Done,
            LogStateArg::Error => LogState::Error,
        }
    }
}

fn main() -> ExitCode {
    // Initialize tracing (respects RUST_LOG env var)
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    let subjects = cli.subjects_dir.as_ref();

    match &cli.command {
        Command::Reconstruct(args) => run_batch(CommandKind::Reconstruct, args, subjects),
        Command::ReconstructBase(args) => run_batch(CommandKind::ReconstructBase, args, subjects),
        Command::ReconstructLong(args) => run_batch(CommandKind::ReconstructLong, args, subjects),
        Command::Segment(args) => run_batch(CommandKind::Segment, args, subjects),
        Command::SegmentLong(args) => run_batch(CommandKind::SegmentLong, args, subjects),
        Command::MaskEdit(args) => run_batch(CommandKind::MaskEdit, args, subjects),
        Command::CommitEdit(args) => run_batch(CommandKind::CommitEdit, args, subjects),

        Command::BuildManifest { root, output } => build_manifest(root, output),
        Command::SynthCommands { input, mode, output } => {
            synth_commands(input, (*mode).into(), output)
        }
        Command::Resume { input, kind, clean } => {
            let config = required_config(subjects)?;
            let outcome = resume::filter_input(input, (*kind).into(), &config, *clean)
                .with_context(|| format!("filter {}", input.display()))?;
            println!(
                "{} completed unit(s) dropped, {} remaining -> {}",
                outcome.completed,
                outcome.remaining,
                outcome.output.display()
            );
            if !outcome.cleaned.is_empty() {
                println!(
                    "removed {} unfinished output directorie(s)",
                    outcome.cleaned.len()
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Status { state } => {
            let config = required_config(subjects)?;
            let units = status::scan_log_state(&config.subjects_dir, (*state).into())
                .with_context(|| format!("scan {}", config.subjects_dir.display()))?;
            for unit in &units {
                println!("{unit}");
            }
            tracing::info!(count = units.len(), state = state_name(*state), "scan complete");
            Ok(ExitCode::SUCCESS)
        }
        Command::Review { log, viewer } => {
            let mut config = required_config(subjects)?;
            if let Some(viewer) = viewer {
                config = config.with_viewer(viewer.clone());
            }
            let log = log
                .clone()
                .unwrap_or_else(|| PathBuf::from(qc::DEFAULT_LOG_NAME));
            review::run(&config, &log)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Parse the stage input, format its chains, and run them.
fn run_batch(kind: CommandKind, args: &RunArgs, subjects: Option<&PathBuf>) -> Result<ExitCode> {
    let config = stage_config(kind, subjects)?;

    let manifest = if kind.is_pass_through() {
        Manifest::read_headerless(&args.input)
    } else {
        Manifest::read(&args.input)
    }
    .with_context(|| format!("read input {}", args.input.display()))?;

    let chains = format_batch(kind, &manifest, &config)
        .with_context(|| format!("format {kind} commands"))?;
    if chains.is_empty() {
        println!("nothing to run");
        return Ok(ExitCode::SUCCESS);
    }

    let parallel = args.parallel.unwrap_or_else(num_cpus::get);
    let runner = BatchRunner::new(parallel);

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(runner.run(chains));

    print_report(&report, args.json);
    Ok(ExitCode::SUCCESS)
}

/// Only the mask stages template per-subject paths; the other stages
/// leave output placement to the external tools.
fn stage_config(kind: CommandKind, subjects: Option<&PathBuf>) -> Result<BatchConfig> {
    match kind {
        CommandKind::MaskEdit | CommandKind::CommitEdit => required_config(subjects),
        _ => Ok(lenient_config(subjects)),
    }
}

fn required_config(subjects: Option<&PathBuf>) -> Result<BatchConfig> {
    let dir = match subjects {
        Some(dir) => dir.clone(),
        None => env::var(SUBJECTS_DIR_ENV).map(PathBuf::from).with_context(|| {
            format!("subjects directory not set: pass --subjects-dir or set ${SUBJECTS_DIR_ENV}")
        })?,
    };
    Ok(BatchConfig::new(dir))
}

fn lenient_config(subjects: Option<&PathBuf>) -> BatchConfig {
    match subjects {
        Some(dir) => BatchConfig::new(dir.clone()),
        None => match env::var(SUBJECTS_DIR_ENV) {
            Ok(dir) => BatchConfig::new(dir),
            Err(_) => BatchConfig::new("."),
        },
    }
}

fn build_manifest(root: &Path, output: &Path) -> Result<ExitCode> {
    let visits = study::scan_study_tree(root)
        .with_context(|| format!("scan study tree {}", root.display()))?;
    let subjects: HashSet<&str> = visits.iter().map(|v| v.subject.as_str()).collect();

    fs::write(output, study::visits_to_manifest(&visits))
        .with_context(|| format!("write {}", output.display()))?;
    println!(
        "{} visit(s) across {} subject(s) -> {}",
        visits.len(),
        subjects.len(),
        output.display()
    );
    Ok(ExitCode::SUCCESS)
}

fn synth_commands(input: &Path, mode: SynthMode, output: &Path) -> Result<ExitCode> {
    let manifest =
        Manifest::read(input).with_context(|| format!("read input {}", input.display()))?;
    let lines = study::synthesize_commands(&manifest, mode)
        .with_context(|| format!("synthesize commands from {}", input.display()))?;

    let mut text = lines.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    fs::write(output, text).with_context(|| format!("write {}", output.display()))?;
    println!("{} command(s) -> {}", lines.len(), output.display());
    Ok(ExitCode::SUCCESS)
}

fn print_report(report: &BatchReport, json: bool) {
    if json {
        println!("{}", report.to_json());
        return;
    }

    for job in &report.results {
        if job.ok() {
            println!("✓ {}", job.label);
        } else if let Some(step) = job.failed_step() {
            println!("✗ {} (exit {}): {}", job.label, step.code, step.command);
            if let Some(line) = step.err.lines().last() {
                println!("    {line}");
            }
        }
    }

    let failed = report.failures().count();
    if failed == 0 {
        println!("{} job(s) completed", report.len());
    } else {
        println!("{} job(s), {} failed", report.len(), failed);
    }
}

fn state_name(state: LogStateArg) -> &'static str {
    LogState::from(state).as_str()
}
