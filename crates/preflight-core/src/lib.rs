//! KataGo Preflight - smoke tests for a local KataGo HTTP server
//!
//! Provides a run orchestrator that:
//! - Checks the local environment for the engine binary, model and server deps
//! - Launches the HTTP server as a supervised child process
//! - Polls the server until it answers or a deadline passes
//! - Exercises the `select-move` and `score` endpoints and checks the response shape

pub mod config;
pub mod contract;
pub mod environment;
pub mod error;
pub mod gate;
pub mod orchestrator;
pub mod probe;
pub mod readiness;
pub mod supervisor;
pub mod telemetry;

// Re-export key types
pub use config::{
    ContractConfig, DiagnosticSpec, HarnessConfig, LaunchSpec, PollConfig, RemediationSpec,
    Variant,
};
pub use contract::{ContractTester, OutcomeStatus, RequiredField, TestCase, TestOutcome};
pub use environment::{CheckItem, EnvironmentValidator, Requirement};
pub use error::{FailureKind, PreflightError, Result};
pub use gate::{ContractGate, GateVerdict};
pub use orchestrator::{CommandRecord, Orchestrator, RunReport, RunState, StageFailure};
pub use probe::{HttpProbe, Probe, ProbeOutcome};
pub use readiness::{ReadinessPoller, ReadinessResult};
pub use supervisor::{CapturedOutput, CleanupOutcome, ProcessSupervisor, ServiceHandle};
pub use telemetry::init_tracing;
