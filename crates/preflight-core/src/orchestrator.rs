//! Preflight run orchestration.
//!
//! A run walks `INIT -> ENV_CHECKED -> PROCESS_LAUNCHED | PROCESS_SKIPPED ->
//! POLLED_READY -> CONTRACT_TESTED -> DONE`. Environment, launch and
//! readiness failures jump straight to `DONE`; contract failures are
//! collected per case. A service handle, once obtained, is always passed to
//! cleanup exactly once.

use crate::config::HarnessConfig;
use crate::contract::{ContractTester, TestOutcome};
use crate::environment::{CheckItem, EnvironmentValidator, Requirement};
use crate::error::{FailureKind, Result};
use crate::gate::{ContractGate, GateVerdict};
use crate::probe::HttpProbe;
use crate::readiness::{ReadinessPoller, ReadinessResult};
use crate::supervisor::{CapturedOutput, CleanupOutcome, ProcessSupervisor, ServiceHandle};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// States of a preflight run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Init,
    EnvChecked,
    ProcessLaunched,
    ProcessSkipped,
    PolledReady,
    ContractTested,
    Done,
}

/// A failed stage or contract case.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// A one-shot command run during the preflight (remediation, diagnostic).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command: Vec<String>,
    pub passed: bool,
    pub output: Option<CapturedOutput>,
    pub error: Option<String>,
}

impl CommandRecord {
    async fn run(command: &[String], dir: Option<&Path>, timeout: Duration) -> Self {
        match ProcessSupervisor::run_and_capture_in(command, dir, timeout).await {
            Ok(output) => Self {
                command: command.to_vec(),
                passed: output.passed(),
                output: Some(output),
                error: None,
            },
            Err(e) => Self {
                command: command.to_vec(),
                passed: false,
                output: None,
                error: Some(e.to_string()),
            },
        }
    }

    /// Short description of why the command failed.
    pub fn failure_detail(&self) -> String {
        match (&self.error, &self.output) {
            (Some(error), _) => error.clone(),
            (None, Some(output)) => {
                let stderr = output.stderr.trim();
                if stderr.is_empty() {
                    format!("exit code {}", output.exit_code)
                } else {
                    format!("exit code {}: {}", output.exit_code, stderr)
                }
            }
            (None, None) => "no output".to_string(),
        }
    }
}

/// Everything a preflight run observed.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub base_url: String,

    /// States visited, in order.
    pub trace: Vec<RunState>,

    /// First environment check.
    pub environment: Vec<CheckItem>,

    pub remediation: Option<CommandRecord>,

    /// Environment check repeated after remediation.
    pub environment_rechecked: Option<Vec<CheckItem>>,

    pub diagnostic: Option<CommandRecord>,

    /// First line printed by the engine's version command.
    pub engine_version: Option<String>,

    pub readiness: Option<ReadinessResult>,
    pub outcomes: Vec<TestOutcome>,
    pub verdict: Option<GateVerdict>,
    pub failures: Vec<StageFailure>,
    pub cleanup: Option<CleanupOutcome>,
    pub cleanup_error: Option<String>,

    /// Total duration in milliseconds.
    pub duration_ms: u64,
}

impl RunReport {
    fn new(base_url: &str) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            base_url: base_url.to_string(),
            trace: vec![RunState::Init],
            environment: Vec::new(),
            remediation: None,
            environment_rechecked: None,
            diagnostic: None,
            engine_version: None,
            readiness: None,
            outcomes: Vec::new(),
            verdict: None,
            failures: Vec::new(),
            cleanup: None,
            cleanup_error: None,
            duration_ms: 0,
        }
    }

    fn advance(&mut self, state: RunState) {
        info!(run_id = %self.run_id, state = ?state, "Preflight state reached");
        self.trace.push(state);
    }

    fn fail(&mut self, kind: FailureKind, message: String) {
        warn!(run_id = %self.run_id, kind = %kind, "{}", message);
        self.failures.push(StageFailure { kind, message });
    }

    /// Current (last reached) state.
    pub fn state(&self) -> RunState {
        self.trace.last().copied().unwrap_or(RunState::Init)
    }

    /// Whether a failure has ended the run before its later stages.
    pub fn aborted(&self) -> bool {
        self.failures.iter().any(|failure| failure.kind.aborts_run())
    }

    pub fn reached(&self, state: RunState) -> bool {
        self.trace.contains(&state)
    }

    /// Environment as finally judged: the recheck if remediation ran.
    pub fn final_environment(&self) -> &[CheckItem] {
        self.environment_rechecked
            .as_deref()
            .unwrap_or(&self.environment)
    }

    /// Whether the whole run passed.
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
            && self.reached(RunState::ContractTested)
            && self.verdict.as_ref().map(|v| v.passed).unwrap_or(false)
    }

    /// Process exit code: 0 on full success, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.succeeded() {
            0
        } else {
            1
        }
    }

    pub fn passed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.passed()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.passed()).count()
    }
}

/// Sequences the preflight stages for one configuration.
pub struct Orchestrator {
    config: HarnessConfig,
}

impl Orchestrator {
    /// Create an orchestrator for a validated configuration.
    pub fn new(config: HarnessConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Execute the run. Never fails: every problem ends up in the report.
    pub async fn run(&self) -> RunReport {
        let start = Instant::now();
        let mut report = RunReport::new(&self.config.base_url);
        info!(
            run_id = %report.run_id,
            base_url = %self.config.base_url,
            "Starting preflight run"
        );

        self.check_environment(&mut report).await;
        if !report.aborted() {
            self.run_diagnostic(&mut report).await;
        }
        if !report.aborted() {
            if let Some(mut handle) = self.start_service(&mut report).await {
                self.poll(&mut report, &mut handle).await;
                if !report.aborted() {
                    self.test_contract(&mut report).await;
                }
                self.cleanup(&mut report, handle).await;
            }
        }

        report.advance(RunState::Done);
        report.duration_ms = start.elapsed().as_millis() as u64;

        if report.succeeded() {
            info!(run_id = %report.run_id, "Preflight passed");
        } else {
            info!(
                run_id = %report.run_id,
                failures = report.failures.len(),
                "Preflight failed"
            );
        }
        report
    }

    async fn check_environment(&self, report: &mut RunReport) {
        let dir = self.config.install_dir();
        let requirements: Vec<Requirement> = self
            .config
            .requirements
            .iter()
            .map(|requirement| requirement.resolved_in(dir))
            .collect();
        report.environment = EnvironmentValidator::check(&requirements).await;

        let missing = missing_names(&report.environment);
        if missing.is_empty() {
            report.advance(RunState::EnvChecked);
            return;
        }

        let remediation = match &self.config.remediation {
            Some(remediation) => remediation,
            None => {
                report.fail(
                    FailureKind::Environment,
                    format!("missing required artifacts: {}", missing.join(", ")),
                );
                return;
            }
        };

        warn!(missing = %missing.join(", "), "Attempting remediation");
        let record = CommandRecord::run(
            &remediation.command,
            dir,
            Duration::from_secs(remediation.timeout_secs),
        )
        .await;
        if !record.passed {
            warn!(detail = %record.failure_detail(), "Remediation command failed");
        }
        report.remediation = Some(record);

        let rechecked = EnvironmentValidator::check(&requirements).await;
        let still_missing = missing_names(&rechecked);
        report.environment_rechecked = Some(rechecked);

        if still_missing.is_empty() {
            report.advance(RunState::EnvChecked);
        } else {
            report.fail(
                FailureKind::Environment,
                format!(
                    "still missing after remediation: {}",
                    still_missing.join(", ")
                ),
            );
        }
    }

    async fn run_diagnostic(&self, report: &mut RunReport) {
        let diagnostic = match &self.config.diagnostic {
            Some(diagnostic) => diagnostic,
            None => return,
        };

        let record = CommandRecord::run(
            &diagnostic.command,
            self.config.install_dir(),
            Duration::from_secs(diagnostic.timeout_secs),
        )
        .await;

        if record.passed {
            report.engine_version = record.output.as_ref().and_then(|o| o.first_stdout_line());
            info!(version = ?report.engine_version, "Engine binary runs");
        } else {
            report.fail(
                FailureKind::Environment,
                format!(
                    "engine binary cannot run on this host ({}): {}",
                    diagnostic.command.join(" "),
                    record.failure_detail()
                ),
            );
        }
        report.diagnostic = Some(record);
    }

    async fn start_service(&self, report: &mut RunReport) -> Option<ServiceHandle> {
        let spec = match &self.config.launch {
            Some(spec) => spec,
            None => {
                report.advance(RunState::ProcessSkipped);
                return Some(ServiceHandle::unowned());
            }
        };

        match ProcessSupervisor::launch(spec).await {
            Ok(mut handle) => {
                if spec.forward_output {
                    handle.forward_output();
                }
                info!(pid = ?handle.process_id(), "Server process owned by this run");
                report.advance(RunState::ProcessLaunched);
                Some(handle)
            }
            Err(e) => {
                report.fail(FailureKind::Launch, e.to_string());
                None
            }
        }
    }

    async fn poll(&self, report: &mut RunReport, handle: &mut ServiceHandle) {
        let base_url = &self.config.base_url;

        let probe = match HttpProbe::new(base_url, self.config.poll.probe_timeout()) {
            Ok(probe) => probe,
            Err(e) => {
                report.fail(
                    FailureKind::Environment,
                    format!("cannot build HTTP client: {}", e),
                );
                return;
            }
        };

        let readiness = ReadinessPoller::from_config(&self.config.poll)
            .wait(&probe)
            .await;
        report.readiness = Some(readiness.clone());

        if !readiness.ready {
            let mut message = format!(
                "server at {} not reachable after {:.1}s ({} attempts)",
                base_url, readiness.elapsed_seconds, readiness.attempts
            );
            if let Ok(Some(status)) = handle.try_exit_status() {
                message.push_str(&format!("; server process exited with {}", status));
            }
            report.fail(FailureKind::ReadinessTimeout, message);
            return;
        }
        report.advance(RunState::PolledReady);
    }

    async fn test_contract(&self, report: &mut RunReport) {
        let base_url = &self.config.base_url;
        let tester = match ContractTester::new(base_url, self.config.contract.request_timeout()) {
            Ok(tester) => tester,
            Err(e) => {
                report.fail(
                    FailureKind::Environment,
                    format!("cannot build HTTP client: {}", e),
                );
                return;
            }
        };

        let outcomes = tester.run(&self.config.contract.cases).await;
        for outcome in &outcomes {
            if let Some(kind) = outcome.status.failure_kind() {
                report.fail(kind, format!("{}: {}", outcome.case.name, outcome.message));
            }
        }
        report.verdict = Some(ContractGate::evaluate(&outcomes));
        report.outcomes = outcomes;
        report.advance(RunState::ContractTested);
    }

    async fn cleanup(&self, report: &mut RunReport, handle: ServiceHandle) {
        if !handle.is_owned() {
            debug!(run_id = %report.run_id, "Server not owned by this run; leaving it running");
        }
        match handle.terminate_and_wait().await {
            Ok(outcome) => report.cleanup = Some(outcome),
            Err(e) => {
                warn!(run_id = %report.run_id, "Cleanup failed: {}", e);
                report.cleanup_error = Some(e.to_string());
            }
        }
    }
}

fn missing_names(items: &[CheckItem]) -> Vec<String> {
    EnvironmentValidator::missing(items)
        .into_iter()
        .map(str::to_string)
        .collect()
}
