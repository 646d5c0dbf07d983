//! Contract tests against the server's inference endpoints.
//!
//! Each [`TestCase`] posts a fixed position and checks that the answer is a
//! JSON object carrying the required fields. Values are never interpreted:
//! a `win_prob` of 7.3 passes as long as it is there.

use crate::error::{FailureKind, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{info, warn};

/// A field that must be present in a response.
///
/// `AnyOf` is satisfied by any one of its names, e.g. `move` or `best_moves`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum RequiredField {
    Name(String),
    AnyOf(Vec<String>),
}

impl RequiredField {
    pub fn name(name: &str) -> Self {
        RequiredField::Name(name.to_string())
    }

    pub fn any_of(names: &[&str]) -> Self {
        RequiredField::AnyOf(names.iter().map(|n| n.to_string()).collect())
    }

    /// Names that can satisfy this field.
    pub fn names(&self) -> Vec<&str> {
        match self {
            RequiredField::Name(name) => vec![name.as_str()],
            RequiredField::AnyOf(names) => names.iter().map(String::as_str).collect(),
        }
    }

    /// Label used in missing-field sets, `move|best_moves` for alternatives.
    pub fn label(&self) -> String {
        self.names().join("|")
    }

    fn is_satisfied_by(&self, object: &Map<String, Value>) -> bool {
        self.names().into_iter().any(|name| is_present(object, name))
    }
}

fn is_present(object: &Map<String, Value>, name: &str) -> bool {
    object.get(name).map(|v| !v.is_null()).unwrap_or(false)
}

/// One endpoint check with a literal request body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestCase {
    /// Human-readable case name.
    pub name: String,

    /// Path below the base URL, starting with `/`.
    pub endpoint: String,

    /// JSON body posted to the endpoint.
    pub request_body: Value,

    /// Fields that must be present, in report order.
    pub required_fields: Vec<RequiredField>,

    /// Fields shown when present; their absence never fails the case.
    #[serde(default)]
    pub optional_fields: BTreeSet<String>,
}

impl TestCase {
    /// Opening position used by every default case: two star-point moves on 19x19.
    pub fn standard_position() -> Value {
        json!({
            "board_size": 19,
            "moves": ["R4", "D16"]
        })
    }

    /// `POST /select-move/{engine_id}`
    pub fn select_move(engine_id: &str) -> Self {
        Self {
            name: "select-move".to_string(),
            endpoint: format!("/select-move/{}", engine_id),
            request_body: Self::standard_position(),
            required_fields: vec![
                RequiredField::any_of(&["move", "best_moves"]),
                RequiredField::name("win_prob"),
                RequiredField::name("score"),
            ],
            optional_fields: ["best_moves".to_string()].into_iter().collect(),
        }
    }

    /// `POST /score/{engine_id}`
    pub fn score(engine_id: &str) -> Self {
        Self {
            name: "score".to_string(),
            endpoint: format!("/score/{}", engine_id),
            request_body: Self::standard_position(),
            required_fields: vec![RequiredField::name("win_prob"), RequiredField::name("score")],
            optional_fields: ["ownership".to_string()].into_iter().collect(),
        }
    }

    pub fn defaults(engine_id: &str) -> Vec<Self> {
        vec![Self::select_move(engine_id), Self::score(engine_id)]
    }

    /// Labels of required fields absent from `body`.
    ///
    /// Anything but a JSON object is missing every required field.
    pub fn missing_fields(&self, body: &Value) -> BTreeSet<String> {
        match body.as_object() {
            Some(object) => self
                .required_fields
                .iter()
                .filter(|field| !field.is_satisfied_by(object))
                .map(RequiredField::label)
                .collect(),
            None => self.required_fields.iter().map(RequiredField::label).collect(),
        }
    }

    /// Optional fields present in `body`.
    pub fn present_optional_fields(&self, body: &Value) -> Vec<String> {
        match body.as_object() {
            Some(object) => self
                .optional_fields
                .iter()
                .filter(|name| is_present(object, name))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }
}

/// Classification of a contract test.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeStatus {
    Pass,
    FailHttp,
    FailSchema,
    FailTimeout,
    FailConnection,
}

impl OutcomeStatus {
    pub fn is_pass(&self) -> bool {
        matches!(self, OutcomeStatus::Pass)
    }

    /// Failure category, `None` for a pass.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            OutcomeStatus::Pass => None,
            OutcomeStatus::FailHttp => Some(FailureKind::ContractHttp),
            OutcomeStatus::FailSchema => Some(FailureKind::ContractSchema),
            OutcomeStatus::FailTimeout | OutcomeStatus::FailConnection => {
                Some(FailureKind::ContractTransport)
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            OutcomeStatus::Pass => "PASS",
            OutcomeStatus::FailHttp => "FAIL_HTTP",
            OutcomeStatus::FailSchema => "FAIL_SCHEMA",
            OutcomeStatus::FailTimeout => "FAIL_TIMEOUT",
            OutcomeStatus::FailConnection => "FAIL_CONNECTION",
        }
    }
}

/// Result of one contract test.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestOutcome {
    pub case: TestCase,
    pub status: OutcomeStatus,
    pub status_code: Option<u16>,
    pub missing_fields: BTreeSet<String>,
    pub message: String,

    /// Parsed response body, kept for display.
    pub response: Option<Value>,
}

impl TestOutcome {
    pub fn passed(&self) -> bool {
        self.status.is_pass()
    }

    /// Value of a response field, if the response was a JSON object.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.response.as_ref().and_then(|body| body.get(name))
    }

    fn transport(case: &TestCase, status: OutcomeStatus, message: String) -> Self {
        Self {
            case: case.clone(),
            status,
            status_code: None,
            missing_fields: BTreeSet::new(),
            message,
            response: None,
        }
    }

    /// Classify a completed HTTP exchange.
    pub fn from_response(case: &TestCase, status_code: u16, body: &str) -> Self {
        if !(200..300).contains(&status_code) {
            return Self {
                case: case.clone(),
                status: OutcomeStatus::FailHttp,
                status_code: Some(status_code),
                missing_fields: BTreeSet::new(),
                message: format!("HTTP {}: {}", status_code, body),
                response: None,
            };
        }

        let parsed: Option<Value> = serde_json::from_str(body).ok();
        let (missing_fields, message) = match &parsed {
            Some(value) => {
                let missing = case.missing_fields(value);
                let message = if missing.is_empty() {
                    "all required fields present".to_string()
                } else if !value.is_object() {
                    "response is not a JSON object".to_string()
                } else {
                    format!(
                        "missing required fields: {}",
                        missing.iter().cloned().collect::<Vec<_>>().join(", ")
                    )
                };
                (missing, message)
            }
            None => (
                case.missing_fields(&Value::Null),
                "response is not valid JSON".to_string(),
            ),
        };

        let status = if missing_fields.is_empty() {
            OutcomeStatus::Pass
        } else {
            OutcomeStatus::FailSchema
        };

        Self {
            case: case.clone(),
            status,
            status_code: Some(status_code),
            missing_fields,
            message,
            response: parsed,
        }
    }
}

/// Posts each test case to the server and classifies the answers.
pub struct ContractTester {
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl ContractTester {
    /// Create a tester with the given per-request timeout.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("katago-preflight/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .no_proxy()
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            client,
        })
    }

    /// Run every case in order. A failing case never stops the next one.
    pub async fn run(&self, cases: &[TestCase]) -> Vec<TestOutcome> {
        let mut outcomes = Vec::with_capacity(cases.len());
        for case in cases {
            outcomes.push(self.run_case(case).await);
        }
        outcomes
    }

    pub async fn run_case(&self, case: &TestCase) -> TestOutcome {
        let url = format!("{}{}", self.base_url, case.endpoint);
        info!(case = %case.name, url = %url, "Running contract test");

        let outcome = match self.client.post(&url).json(&case.request_body).send().await {
            Ok(response) => {
                let status_code = response.status().as_u16();
                match response.text().await {
                    Ok(body) => TestOutcome::from_response(case, status_code, &body),
                    Err(e) => self.transport_failure(case, &e),
                }
            }
            Err(e) => self.transport_failure(case, &e),
        };

        if outcome.passed() {
            info!(case = %case.name, "Contract test passed");
        } else {
            warn!(
                case = %case.name,
                status = outcome.status.label(),
                message = %outcome.message,
                "Contract test failed"
            );
        }
        outcome
    }

    fn transport_failure(&self, case: &TestCase, err: &reqwest::Error) -> TestOutcome {
        if err.is_timeout() {
            TestOutcome::transport(
                case,
                OutcomeStatus::FailTimeout,
                format!("request timed out after {} seconds", self.timeout.as_secs()),
            )
        } else {
            TestOutcome::transport(
                case,
                OutcomeStatus::FailConnection,
                format!("could not reach server: {}", err),
            )
        }
    }
}
