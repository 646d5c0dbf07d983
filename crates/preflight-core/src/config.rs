//! Harness configuration and the two built-in variants.
//!
//! A run is fully described by a [`HarnessConfig`]. The `attached` variant
//! targets a server that is already running; the `managed` variant checks
//! the local installation, launches the server itself and tears it down
//! afterwards. TOML files are layered over the selected variant, so a file
//! only needs the keys it changes.

use crate::contract::TestCase;
use crate::environment::Requirement;
use crate::error::{PreflightError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default base URL of an already-running server.
pub const ATTACHED_BASE_URL: &str = "http://localhost:2718";

/// Default base URL of the CPU (Eigen) server launched by the harness.
pub const MANAGED_BASE_URL: &str = "http://localhost:2818";

/// Engine identifier used in endpoint paths.
pub const DEFAULT_ENGINE_ID: &str = "katago_gtp_bot";

/// Engine binary expected in the working directory.
pub const KATAGO_BINARY: &str = "katago_eigen";

/// Network weights expected in the working directory.
pub const MODEL_FILE: &str = "g170e-b10c128-s1141046784-d204142634.bin.gz";

/// Server script started by the managed variant.
pub const SERVER_SCRIPT: &str = "katago_server_eigen.py";

/// Python interpreter used for module checks, remediation and launch.
pub fn default_interpreter() -> &'static str {
    if cfg!(windows) {
        "python"
    } else {
        "python3"
    }
}

/// Built-in configuration presets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// Test a server that is already running on port 2718
    #[default]
    Attached,

    /// Check the installation, launch the Eigen server on port 2818, test it
    Managed,
}

impl Variant {
    /// Get the variant name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            Variant::Attached => "attached",
            Variant::Managed => "managed",
        }
    }
}

/// Readiness polling settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollConfig {
    /// Fixed delay between probes, in milliseconds.
    pub interval_ms: u64,

    /// Maximum time to wait for the server, in seconds.
    pub max_wait_secs: u64,

    /// Log a progress line every N attempts.
    pub progress_every: u32,

    /// Timeout of a single liveness probe, in seconds.
    pub probe_timeout_secs: u64,
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            max_wait_secs: 60,
            progress_every: 10,
            probe_timeout_secs: 5,
        }
    }
}

/// How to start the server process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Command to execute (first element is executable).
    pub command: Vec<String>,

    /// Working directory for the child (defaults to the current one).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    /// Delay before checking that the child did not exit immediately.
    pub startup_grace_ms: u64,

    /// Forward the child's stdout/stderr to debug logs.
    pub forward_output: bool,
}

impl LaunchSpec {
    /// Create a launch spec with default grace period and output forwarding.
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            working_dir: None,
            startup_grace_ms: 500,
            forward_output: true,
        }
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }
}

/// Single automatic fix attempted when required artifacts are missing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemediationSpec {
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

/// One-shot command proving the engine binary runs on this host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiagnosticSpec {
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

/// Contract test settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContractConfig {
    /// Per-request timeout, in seconds. Inference can be slow.
    pub request_timeout_secs: u64,

    /// Cases to run, in order.
    pub cases: Vec<TestCase>,
}

impl ContractConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ContractConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            cases: TestCase::defaults(DEFAULT_ENGINE_ID),
        }
    }
}

/// Complete description of a preflight run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessConfig {
    /// Server base URL, e.g. `http://localhost:2718`.
    pub base_url: String,

    /// Artifacts that must exist before anything is launched.
    pub requirements: Vec<Requirement>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<RemediationSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<DiagnosticSpec>,

    /// `None` means the server is expected to be running already.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch: Option<LaunchSpec>,

    pub poll: PollConfig,

    pub contract: ContractConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::for_variant(Variant::default())
    }
}

impl HarnessConfig {
    /// Build the preset for a variant.
    pub fn for_variant(variant: Variant) -> Self {
        match variant {
            Variant::Attached => Self::attached(),
            Variant::Managed => Self::managed(),
        }
    }

    /// Preset for a server that is already running.
    pub fn attached() -> Self {
        Self {
            base_url: ATTACHED_BASE_URL.to_string(),
            requirements: Vec::new(),
            remediation: None,
            diagnostic: None,
            launch: None,
            poll: PollConfig::default(),
            contract: ContractConfig::default(),
        }
    }

    /// Preset that checks the installation and launches the Eigen server.
    pub fn managed() -> Self {
        let python = default_interpreter().to_string();
        Self {
            base_url: MANAGED_BASE_URL.to_string(),
            requirements: vec![
                Requirement::module("flask", &python),
                Requirement::file(KATAGO_BINARY),
                Requirement::file(MODEL_FILE),
            ],
            remediation: Some(RemediationSpec {
                command: vec![
                    python.clone(),
                    "-m".to_string(),
                    "pip".to_string(),
                    "install".to_string(),
                    "-r".to_string(),
                    "requirements.txt".to_string(),
                ],
                timeout_secs: 300,
            }),
            diagnostic: Some(DiagnosticSpec {
                command: vec![format!("./{}", KATAGO_BINARY), "version".to_string()],
                timeout_secs: 10,
            }),
            launch: Some(LaunchSpec::new(vec![python, SERVER_SCRIPT.to_string()])),
            poll: PollConfig {
                max_wait_secs: 30,
                progress_every: 5,
                ..PollConfig::default()
            },
            contract: ContractConfig::default(),
        }
    }

    /// Parse a TOML document layered over the variant's preset.
    pub fn from_toml_str(variant: Variant, raw: &str) -> Result<Self> {
        let overlay: toml::Value = toml::from_str(raw)?;
        let mut merged = toml::Value::try_from(Self::for_variant(variant))
            .map_err(|e| PreflightError::Config(format!("cannot encode preset: {}", e)))?;
        merge_toml(&mut merged, overlay);

        let config = merged.try_into::<Self>()?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file layered over the variant's preset.
    pub fn from_file(variant: Variant, path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(variant, &raw)
    }

    /// Directory the installation lives in: the launch working directory.
    ///
    /// Relative file requirements, the remediation and the diagnostic are
    /// resolved here too; `None` means the current directory.
    pub fn install_dir(&self) -> Option<&Path> {
        self.launch
            .as_ref()
            .and_then(|launch| launch.working_dir.as_deref())
    }

    /// Replace the base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Skip launching; the server must already be running.
    pub fn without_launch(mut self) -> Self {
        self.launch = None;
        self
    }

    /// Check internal consistency before a run.
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.base_url).map_err(|e| {
            PreflightError::Config(format!("invalid base_url '{}': {}", self.base_url, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(PreflightError::Config(format!(
                "base_url must use http or https, got '{}'",
                url.scheme()
            )));
        }

        if self.poll.interval_ms == 0 {
            return Err(PreflightError::Config("poll.interval_ms must be > 0".into()));
        }
        if self.poll.max_wait_secs == 0 {
            return Err(PreflightError::Config("poll.max_wait_secs must be > 0".into()));
        }
        if self.poll.progress_every == 0 {
            return Err(PreflightError::Config("poll.progress_every must be > 0".into()));
        }
        if self.poll.probe_timeout_secs == 0 {
            return Err(PreflightError::Config(
                "poll.probe_timeout_secs must be > 0".into(),
            ));
        }
        if self.contract.request_timeout_secs == 0 {
            return Err(PreflightError::Config(
                "contract.request_timeout_secs must be > 0".into(),
            ));
        }

        if let Some(launch) = &self.launch {
            if launch.command.is_empty() {
                return Err(PreflightError::EmptyCommand("launch".into()));
            }
        }
        if let Some(remediation) = &self.remediation {
            if remediation.command.is_empty() {
                return Err(PreflightError::EmptyCommand("remediation".into()));
            }
        }
        if let Some(diagnostic) = &self.diagnostic {
            if diagnostic.command.is_empty() {
                return Err(PreflightError::EmptyCommand("diagnostic".into()));
            }
        }

        if self.contract.cases.is_empty() {
            return Err(PreflightError::Config(
                "contract.cases must contain at least one case".into(),
            ));
        }
        for case in &self.contract.cases {
            if !case.endpoint.starts_with('/') {
                return Err(PreflightError::Config(format!(
                    "endpoint of case '{}' must start with '/'",
                    case.name
                )));
            }
        }

        Ok(())
    }
}

/// Overlay `overlay` onto `base`. Tables merge key by key, anything else is replaced.
fn merge_toml(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_toml(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
