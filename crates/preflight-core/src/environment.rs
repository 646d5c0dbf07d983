//! Local environment checks run before anything is launched.

use crate::error::PreflightError;
use crate::supervisor::ProcessSupervisor;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Time allowed for one interpreter import probe.
const MODULE_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// A required local artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Requirement {
    /// A file or directory that must exist.
    File { path: PathBuf },

    /// A library the interpreter must be able to import.
    Module { name: String, interpreter: String },
}

impl Requirement {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Requirement::File { path: path.into() }
    }

    pub fn module(name: &str, interpreter: &str) -> Self {
        Requirement::Module {
            name: name.to_string(),
            interpreter: interpreter.to_string(),
        }
    }

    /// Anchor a relative file path at `dir`. Modules are unaffected.
    pub fn resolved_in(&self, dir: Option<&Path>) -> Requirement {
        match (self, dir) {
            (Requirement::File { path }, Some(dir)) if path.is_relative() => Requirement::File {
                path: dir.join(path),
            },
            _ => self.clone(),
        }
    }

    /// Display name used in check items.
    pub fn name(&self) -> String {
        match self {
            Requirement::File { path } => path.display().to_string(),
            Requirement::Module { name, .. } => format!("module {}", name),
        }
    }
}

/// Result of checking one requirement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckItem {
    pub name: String,
    pub present: bool,
    pub detail: String,
}

impl CheckItem {
    fn present(name: String, detail: impl Into<String>) -> Self {
        Self {
            name,
            present: true,
            detail: detail.into(),
        }
    }

    fn missing(name: String, detail: impl Into<String>) -> Self {
        Self {
            name,
            present: false,
            detail: detail.into(),
        }
    }
}

/// Checks required artifacts.
pub struct EnvironmentValidator;

impl EnvironmentValidator {
    /// Check every requirement, in order, without stopping at the first miss.
    pub async fn check(requirements: &[Requirement]) -> Vec<CheckItem> {
        let mut items = Vec::with_capacity(requirements.len());
        for requirement in requirements {
            let item = Self::check_one(requirement).await;
            info!(
                requirement = %item.name,
                present = item.present,
                "Checked requirement"
            );
            items.push(item);
        }
        items
    }

    /// Names of the items that are missing.
    pub fn missing(items: &[CheckItem]) -> Vec<&str> {
        items
            .iter()
            .filter(|item| !item.present)
            .map(|item| item.name.as_str())
            .collect()
    }

    async fn check_one(requirement: &Requirement) -> CheckItem {
        let name = requirement.name();
        match requirement {
            Requirement::File { path } => {
                if path.exists() {
                    CheckItem::present(name, format!("found {}", path.display()))
                } else {
                    CheckItem::missing(name, format!("{} not found", path.display()))
                }
            }
            Requirement::Module {
                name: module,
                interpreter,
            } => Self::check_module(name, module, interpreter).await,
        }
    }

    async fn check_module(name: String, module: &str, interpreter: &str) -> CheckItem {
        if module.is_empty()
            || !module
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        {
            return CheckItem::missing(name, format!("invalid module name '{}'", module));
        }

        let top_level = module.split('.').next().unwrap_or(module);
        let script = format!(
            "import {module}; print(getattr({top}, '__version__', ''))",
            module = module,
            top = top_level
        );
        let command = vec![interpreter.to_string(), "-c".to_string(), script];

        match ProcessSupervisor::run_and_capture(&command, MODULE_CHECK_TIMEOUT).await {
            Ok(output) if output.passed() => {
                let version = output.first_stdout_line().unwrap_or_default();
                if version.is_empty() {
                    CheckItem::present(name, format!("importable by {}", interpreter))
                } else {
                    CheckItem::present(name, format!("version {}", version))
                }
            }
            Ok(output) => {
                debug!(module, stderr = %output.stderr.trim(), "Import probe failed");
                CheckItem::missing(
                    name,
                    format!("not importable by {} (exit code {})", interpreter, output.exit_code),
                )
            }
            Err(PreflightError::Spawn { .. }) => {
                CheckItem::missing(name, format!("interpreter {} not found", interpreter))
            }
            Err(e) => CheckItem::missing(name, e.to_string()),
        }
    }
}
