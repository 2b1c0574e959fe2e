// Result reporting.
//
// Reporters are pure sinks: they receive ordered step events while the
// executor runs and never mutate system state. The console reporter backs
// the CLI; the recording reporter preserves the full event stream for
// tests and audit assertions.

use crate::executor::{ExecutionResult, PlanOutcome, StepResult};
use crate::planner::{Plan, Step};
use colored::Colorize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Sink for execution progress. Events arrive strictly in step order.
pub trait Reporter: Send {
    fn plan_started(&mut self, _plan: &Plan) {}
    fn step_started(&mut self, _index: usize, _total: usize, _step: &Step) {}
    fn step_output(&mut self, _index: usize, _stream: OutputStream, _line: &str) {}
    fn step_finished(&mut self, _result: &StepResult) {}
    fn plan_finished(&mut self, _result: &ExecutionResult) {}
}

/// Line-oriented console reporter used by the CLI.
#[derive(Debug, Default)]
pub struct ConsoleReporter;

impl ConsoleReporter {
    pub fn new() -> Self {
        Self
    }
}

impl Reporter for ConsoleReporter {
    fn plan_started(&mut self, plan: &Plan) {
        println!("\n=== {} ===", plan.description);
    }

    fn step_started(&mut self, index: usize, total: usize, step: &Step) {
        println!(
            "\n[{}/{}] {}",
            index + 1,
            total,
            step.description.bold()
        );
        println!("    $ {}", step.command_line().dimmed());
    }

    fn step_output(&mut self, _index: usize, stream: OutputStream, line: &str) {
        match stream {
            OutputStream::Stdout => println!("    | {}", line),
            OutputStream::Stderr => eprintln!("    | {}", line.red()),
        }
    }

    fn step_finished(&mut self, result: &StepResult) {
        let elapsed = humantime::format_duration(std::time::Duration::from_secs(
            result.duration.as_secs(),
        ));
        if result.succeeded() {
            println!("    {} finished in {}", "✓".green(), elapsed);
        } else if result.timed_out {
            println!(
                "    {} timed out after {}",
                "✗".red(),
                humantime::format_duration(result.duration)
            );
        } else {
            match result.exit_code {
                Some(code) => println!("    {} exited with code {}", "✗".red(), code),
                None => println!("    {} {}", "✗".red(), result.stderr.trim()),
            }
        }
    }

    fn plan_finished(&mut self, result: &ExecutionResult) {
        match &result.outcome {
            PlanOutcome::Completed => {
                println!("\n{} all {} steps completed", "✓".green().bold(), result.steps.len());
            }
            PlanOutcome::FailedAtStep(n) => {
                println!(
                    "\n{} failed at step {} of {}; remaining steps were not run",
                    "✗".red().bold(),
                    n + 1,
                    result.total_steps
                );
            }
            PlanOutcome::Aborted(n) => {
                println!(
                    "\n{} aborted before step {} of {}",
                    "⚠".yellow().bold(),
                    n + 1,
                    result.total_steps
                );
            }
        }
    }
}

/// Everything a reporter can observe, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportEvent {
    PlanStarted(Uuid),
    StepStarted {
        index: usize,
    },
    OutputLine {
        index: usize,
        stream: OutputStream,
        line: String,
    },
    StepFinished {
        index: usize,
        exit_code: Option<i32>,
    },
    PlanFinished(PlanOutcome),
}

/// Records the ordered event stream; used by tests and by callers that
/// need a machine-readable audit trail.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    pub events: Vec<ReportEvent>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finished_steps(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, ReportEvent::StepFinished { .. }))
            .count()
    }
}

impl Reporter for RecordingReporter {
    fn plan_started(&mut self, plan: &Plan) {
        self.events.push(ReportEvent::PlanStarted(plan.id));
    }

    fn step_started(&mut self, index: usize, _total: usize, _step: &Step) {
        self.events.push(ReportEvent::StepStarted { index });
    }

    fn step_output(&mut self, index: usize, stream: OutputStream, line: &str) {
        self.events.push(ReportEvent::OutputLine {
            index,
            stream,
            line: line.to_string(),
        });
    }

    fn step_finished(&mut self, result: &StepResult) {
        self.events.push(ReportEvent::StepFinished {
            index: result.index,
            exit_code: result.exit_code,
        });
    }

    fn plan_finished(&mut self, result: &ExecutionResult) {
        self.events.push(ReportEvent::PlanFinished(result.outcome.clone()));
    }
}
