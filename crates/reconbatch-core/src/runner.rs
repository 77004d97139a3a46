//! Bounded parallel execution of command chains.
//!
//! The runner fans chains out across at most `parallel` workers (a
//! semaphore holds the bound) and runs each chain's steps strictly in
//! order, stopping that chain at its first failing step. Chains never
//! affect each other; the batch blocks until every chain is terminal.
//! There is no cancellation path and no timeout: once launched, a batch
//! runs to completion.

use std::process::Stdio;
use std::sync::Arc;

use serde::Serialize;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::command::{CommandChain, ExternalCommand};

/// Exit code reported when a process cannot be started (shell convention).
pub const LAUNCH_FAILURE_CODE: i64 = 127;

/// Outcome of one executed step.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    /// Rendered command line, for reporting.
    pub command: String,
    /// Exit code. `-1` when killed by a signal, 127 when never started.
    pub code: i64,
    /// Captured stdout.
    pub out: String,
    /// Captured stderr, or the spawn error when `launched` is false.
    pub err: String,
    /// False when the process could not be started at all.
    pub launched: bool,
}

impl StepResult {
    pub fn ok(&self) -> bool {
        self.launched && self.code == 0
    }
}

/// Outcome of one chain.
#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    /// Chain label (row id or subject).
    pub label: String,
    /// Step results in execution order, ending at the first failure.
    pub steps: Vec<StepResult>,
    /// Steps never run because an earlier one failed.
    pub skipped: usize,
}

impl JobResult {
    pub fn ok(&self) -> bool {
        self.skipped == 0 && self.steps.iter().all(StepResult::ok)
    }

    /// The step that stopped this chain, if any.
    pub fn failed_step(&self) -> Option<&StepResult> {
        self.steps.iter().find(|s| !s.ok())
    }
}

/// Results for a whole batch, in submission order.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub results: Vec<JobResult>,
}

impl BatchReport {
    pub fn ok(&self) -> bool {
        self.results.iter().all(JobResult::ok)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn failures(&self) -> impl Iterator<Item = &JobResult> {
        self.results.iter().filter(|r| !r.ok())
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(&self.results).unwrap_or_default()
    }
}

/// Runs command chains with a bounded worker pool.
#[derive(Debug, Clone)]
pub struct BatchRunner {
    parallel: usize,
}

impl BatchRunner {
    /// Create a runner; the bound is clamped to at least 1.
    pub fn new(parallel: usize) -> Self {
        Self {
            parallel: parallel.max(1),
        }
    }

    pub fn parallel(&self) -> usize {
        self.parallel
    }

    /// Execute every chain with at most `parallel` in flight. Results come
    /// back in submission order once all chains are terminal.
    pub async fn run(&self, chains: Vec<CommandChain>) -> BatchReport {
        info!(jobs = chains.len(), parallel = self.parallel, "batch started");

        let semaphore = Arc::new(Semaphore::new(self.parallel));
        let mut handles = Vec::with_capacity(chains.len());

        for chain in chains {
            let permit = semaphore.clone().acquire_owned().await;
            let label = chain.label.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit; // Hold permit until done
                run_chain(chain).await
            });

            handles.push((label, handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (label, handle) in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => results.push(JobResult {
                    label,
                    steps: vec![StepResult {
                        command: String::new(),
                        code: -1,
                        out: String::new(),
                        err: format!("task panicked: {}", e),
                        launched: false,
                    }],
                    skipped: 0,
                }),
            }
        }

        let report = BatchReport { results };
        info!(
            jobs = report.len(),
            failed = report.failures().count(),
            "batch finished"
        );
        report
    }
}

/// Run one chain's steps in order, stopping at the first failure.
async fn run_chain(chain: CommandChain) -> JobResult {
    let total = chain.steps.len();
    debug!(label = %chain.label, steps = total, "chain started");

    let mut steps = Vec::with_capacity(total);
    for (i, step) in chain.steps.iter().enumerate() {
        let result = run_step(step).await;
        let failed = !result.ok();
        steps.push(result);
        if failed {
            let skipped = total - i - 1;
            warn!(label = %chain.label, step = i + 1, skipped, "chain stopped at failed step");
            return JobResult {
                label: chain.label,
                steps,
                skipped,
            };
        }
    }

    debug!(label = %chain.label, "chain finished");
    JobResult {
        label: chain.label,
        steps,
        skipped: 0,
    }
}

/// Spawn one external command and collect its output.
async fn run_step(spec: &ExternalCommand) -> StepResult {
    let rendered = spec.rendered();
    debug!(command = %rendered, "spawning");

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    match cmd.output().await {
        Ok(output) => StepResult {
            command: rendered,
            code: output.status.code().unwrap_or(-1) as i64,
            out: String::from_utf8_lossy(&output.stdout).into_owned(),
            err: String::from_utf8_lossy(&output.stderr).into_owned(),
            launched: true,
        },
        Err(e) => StepResult {
            command: rendered,
            code: LAUNCH_FAILURE_CODE,
            out: String::new(),
            err: format!("{}: failed to spawn: {}", spec.program, e),
            launched: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo(label: &str, text: &str) -> CommandChain {
        CommandChain::single(label, ExternalCommand::new("echo").arg(text))
    }

    fn failing(label: &str) -> CommandChain {
        CommandChain::single(label, ExternalCommand::new("false"))
    }

    #[tokio::test]
    async fn one_result_per_chain() {
        let chains = vec![echo("a", "1"), echo("b", "2"), echo("c", "3")];
        let report = BatchRunner::new(2).run(chains).await;
        assert_eq!(report.len(), 3);
        assert!(report.ok());
        let labels: Vec<_> = report.results.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let report = BatchRunner::new(1).run(vec![echo("a", "hello")]).await;
        let step = &report.results[0].steps[0];
        assert!(step.launched);
        assert_eq!(step.code, 0);
        assert_eq!(step.out.trim(), "hello");
    }

    #[tokio::test]
    async fn failed_chain_is_reported_not_fatal() {
        let report = BatchRunner::new(2)
            .run(vec![echo("good", "x"), failing("bad")])
            .await;
        assert!(!report.ok());
        assert_eq!(report.failures().count(), 1);
        let bad = &report.results[1];
        assert_eq!(bad.label, "bad");
        assert_eq!(bad.failed_step().map(|s| s.code), Some(1));
    }

    #[tokio::test]
    async fn chain_stops_at_first_failure() {
        let chain = CommandChain::new(
            "mixed",
            vec![
                ExternalCommand::new("echo").arg("ran"),
                ExternalCommand::new("false"),
                ExternalCommand::new("echo").arg("never"),
            ],
        );
        let report = BatchRunner::new(1).run(vec![chain]).await;
        let job = &report.results[0];
        assert_eq!(job.steps.len(), 2);
        assert_eq!(job.skipped, 1);
        assert!(!job.ok());
    }

    #[tokio::test]
    async fn later_steps_see_earlier_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let chain = CommandChain::new(
            "sequenced",
            vec![
                ExternalCommand::new("touch").arg(marker.to_string_lossy()),
                ExternalCommand::new("cat").arg(marker.to_string_lossy()),
            ],
        );
        let report = BatchRunner::new(4).run(vec![chain]).await;
        assert!(report.ok());
        assert_eq!(report.results[0].steps.len(), 2);
    }

    #[tokio::test]
    async fn unlaunchable_program_reports_127() {
        let chain = CommandChain::single(
            "ghost",
            ExternalCommand::new("/nonexistent/program").arg("x"),
        );
        let report = BatchRunner::new(1).run(vec![chain]).await;
        let step = &report.results[0].steps[0];
        assert!(!step.launched);
        assert_eq!(step.code, LAUNCH_FAILURE_CODE);
        assert!(step.err.contains("failed to spawn"));
    }

    #[tokio::test]
    async fn outcome_independent_of_parallel_width() {
        let chains = || vec![echo("a", "1"), failing("b"), echo("c", "3")];
        let narrow = BatchRunner::new(1).run(chains()).await;
        let wide = BatchRunner::new(4).run(chains()).await;

        let outcomes = |r: &BatchReport| {
            r.results
                .iter()
                .map(|j| (j.label.clone(), j.ok()))
                .collect::<Vec<_>>()
        };
        assert_eq!(outcomes(&narrow), outcomes(&wide));
    }

    #[tokio::test]
    async fn zero_parallel_is_clamped() {
        let runner = BatchRunner::new(0);
        assert_eq!(runner.parallel(), 1);
        let report = runner.run(vec![echo("a", "x")]).await;
        assert!(report.ok());
    }

    #[tokio::test]
    async fn empty_batch_is_ok() {
        let report = BatchRunner::new(4).run(Vec::new()).await;
        assert!(report.is_empty());
        assert!(report.ok());
    }

    #[test]
    fn report_serializes_to_json() {
        let report = BatchReport {
            results: vec![JobResult {
                label: "a".to_string(),
                steps: vec![StepResult {
                    command: "echo x".to_string(),
                    code: 0,
                    out: "x\n".to_string(),
                    err: String::new(),
                    launched: true,
                }],
                skipped: 0,
            }],
        };
        let json = report.to_json();
        assert!(json.contains("\"label\": \"a\""));
        assert!(json.contains("\"code\": 0"));
    }
}
