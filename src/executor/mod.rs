// Privileged plan execution.
//
// Single mutation point of the whole crate: every privileged command runs
// through `PrivilegedExecutor::execute`, wrapped by one configured
// escalation front-end. Steps run strictly in order; the first failure
// aborts the remainder unless the step opted into continue-on-error.
// Cancellation is honored between steps only; a running privileged
// subprocess is never killed mid-flight, except by its own timeout.


use crate::config::Settings;
use crate::inventory::claims;
use crate::planner::{Plan, PlanState, Step};
use crate::reporter::{OutputStream, Reporter};
use crate::{is_interrupted, Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Proof that the caller explicitly confirmed one specific plan.
///
/// Tokens are minted against a plan instance and never transfer: a token
/// for yesterday's plan will not authorize today's, even for an identical
/// intent.
#[derive(Debug, Clone)]
pub struct ConfirmationToken {
    plan_id: Uuid,
    issued_at: DateTime<Utc>,
}

impl ConfirmationToken {
    /// Record the caller's confirmation, moving the plan to `Confirmed`.
    pub fn approve(plan: &mut Plan) -> Result<Self> {
        if !plan.is_destructive() {
            return Err(Error::Validation(
                "plan has no destructive steps; no confirmation needed".to_string(),
            ));
        }
        match plan.state() {
            PlanState::Validated | PlanState::ConfirmationPending => {
                plan.mark_confirmed();
                Ok(Self {
                    plan_id: plan.id,
                    issued_at: Utc::now(),
                })
            }
            other => Err(Error::Validation(format!(
                "plan in state {:?} cannot be confirmed",
                other
            ))),
        }
    }

    pub fn plan_id(&self) -> Uuid {
        self.plan_id
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }
}

/// Outcome of one executed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub index: usize,
    pub description: String,
    /// Full command line as actually invoked, escalation included
    pub command: String,
    /// None when the process was killed by a signal or never spawned
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
}

impl StepResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanOutcome {
    Completed,
    /// Zero-based index of the failing step; later steps never ran
    FailedAtStep(usize),
    /// Canceled before the given step started
    Aborted(usize),
}

/// Aggregated result of a plan run. Fully describes how far execution
/// got: `steps` holds exactly the steps that started, in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub plan_id: Uuid,
    pub description: String,
    pub outcome: PlanOutcome,
    pub steps: Vec<StepResult>,
    pub total_steps: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.outcome == PlanOutcome::Completed
    }

    /// Convert a failed run into the matching taxonomy error.
    pub fn as_error(&self) -> Option<Error> {
        match &self.outcome {
            PlanOutcome::Completed => None,
            PlanOutcome::FailedAtStep(n) => {
                let step = &self.steps[*n];
                let detail = if step.timed_out {
                    format!("timed out after {:?}", step.duration)
                } else if let Some(code) = step.exit_code {
                    format!("exit code {}", code)
                } else if !step.stderr.trim().is_empty() {
                    step.stderr.trim().to_string()
                } else {
                    "killed by signal".to_string()
                };
                Some(Error::Execution {
                    index: *n,
                    command: step.command.clone(),
                    source: std::io::Error::other(detail),
                })
            }
            PlanOutcome::Aborted(_) => Some(Error::Interrupted),
        }
    }
}

/// Runs validated plans with elevated privileges.
pub struct PrivilegedExecutor<R: Reporter> {
    settings: Settings,
    reporter: R,
}

impl<R: Reporter> PrivilegedExecutor<R> {
    pub fn new(settings: Settings, reporter: R) -> Self {
        Self { settings, reporter }
    }

    pub fn reporter(&self) -> &R {
        &self.reporter
    }

    pub fn into_reporter(self) -> R {
        self.reporter
    }

    /// Execute a plan, streaming output to the reporter step by step.
    ///
    /// A plan with destructive steps requires a token minted for exactly
    /// this plan; without one, no command is spawned at all.
    pub async fn execute(
        &mut self,
        mut plan: Plan,
        token: Option<&ConfirmationToken>,
    ) -> Result<ExecutionResult> {
        if plan.is_destructive() {
            let confirmed = matches!(token, Some(t) if t.plan_id == plan.id)
                && plan.state() == PlanState::Confirmed;
            if !confirmed {
                warn!(plan = %plan.id, "refusing destructive plan without confirmation");
                return Err(Error::ConfirmationMissing(plan.id));
            }
        } else if plan.state() != PlanState::Validated {
            return Err(Error::Validation(format!(
                "plan in state {:?} cannot be executed",
                plan.state()
            )));
        }

        if is_interrupted() {
            return Err(Error::Interrupted);
        }

        // Hold the targets for the whole run so concurrent inventory scans
        // never report them as free.
        let _claim = claims::claim(&plan.targets).ok_or_else(|| {
            Error::Validation(
                "a target device is already held by another running plan".to_string(),
            )
        })?;

        plan.mark_executing();
        self.reporter.plan_started(&plan);
        info!(plan = %plan.id, steps = plan.steps.len(), "executing plan");

        let started_at = Utc::now();
        let steps = plan.steps.clone();
        let total = steps.len();
        let mut results: Vec<StepResult> = Vec::new();
        let mut outcome = PlanOutcome::Completed;

        for (index, step) in steps.iter().enumerate() {
            if is_interrupted() {
                warn!(plan = %plan.id, step = index, "canceled between steps");
                outcome = PlanOutcome::Aborted(index);
                break;
            }

            self.reporter.step_started(index, total, step);
            let result = self.run_step(index, step).await;
            let failed = !result.succeeded();
            self.reporter.step_finished(&result);
            results.push(result);

            if failed && !step.continue_on_error {
                outcome = PlanOutcome::FailedAtStep(index);
                break;
            }
        }

        let result = ExecutionResult {
            plan_id: plan.id,
            description: plan.description.clone(),
            outcome: outcome.clone(),
            steps: results,
            total_steps: total,
            started_at,
            finished_at: Utc::now(),
        };

        plan.mark_terminal(match &outcome {
            PlanOutcome::Completed => PlanState::Completed,
            PlanOutcome::FailedAtStep(n) => PlanState::FailedAtStep(*n),
            PlanOutcome::Aborted(_) => PlanState::Aborted,
        });
        self.reporter.plan_finished(&result);

        Ok(result)
    }

    /// Run a single step, forwarding output lines as they are produced.
    ///
    /// Spawn failures and timeouts are folded into the StepResult so the
    /// aggregate always describes exactly how far the plan got.
    async fn run_step(&mut self, index: usize, step: &Step) -> StepResult {
        let (program, args) = self.settings.escalation.wrap(&step.program, &step.args);
        let command_line = {
            let mut parts = vec![program.clone()];
            parts.extend(args.iter().cloned());
            parts.join(" ")
        };
        let timeout = step.timeout.unwrap_or_else(|| self.settings.step_timeout());
        let started = Instant::now();

        let mut result = StepResult {
            index,
            description: step.description.clone(),
            command: command_line,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::ZERO,
            timed_out: false,
        };

        let mut child = match Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                error!(step = index, program = %program, "failed to spawn: {}", e);
                result.stderr = format!("failed to spawn {}: {}", program, e);
                result.duration = started.elapsed();
                return result;
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<(OutputStream, String)>();
        let mut readers = Vec::new();

        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            readers.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send((OutputStream::Stdout, line)).is_err() {
                        break;
                    }
                }
            }));
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = tx.clone();
            readers.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send((OutputStream::Stderr, line)).is_err() {
                        break;
                    }
                }
            }));
        }
        drop(tx);

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        // Drain output until both pipes close, then collect the exit
        // status; the deadline fires at most once.
        let status = loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some((stream, line)) => {
                        self.reporter.step_output(index, stream, &line);
                        let buf = match stream {
                            OutputStream::Stdout => &mut result.stdout,
                            OutputStream::Stderr => &mut result.stderr,
                        };
                        buf.push_str(&line);
                        buf.push('\n');
                    }
                    None => {
                        let remaining = timeout.saturating_sub(started.elapsed());
                        match tokio::time::timeout(remaining, child.wait()).await {
                            Ok(waited) => break waited.ok(),
                            Err(_) => {
                                result.timed_out = true;
                                let _ = child.kill().await;
                                break child.wait().await.ok();
                            }
                        }
                    }
                },
                _ = &mut deadline => {
                    result.timed_out = true;
                    let _ = child.kill().await;
                    break child.wait().await.ok();
                }
            }
        };

        for reader in readers {
            let _ = reader.await;
        }

        result.duration = started.elapsed();
        result.exit_code = status.and_then(|s| s.code());

        // A timed-out step is a failure even if the kill raced a zero exit
        if result.timed_out {
            result.exit_code = None;
        }

        result
    }
}
