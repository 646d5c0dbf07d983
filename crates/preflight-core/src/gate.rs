//! Contract gate evaluation for pass/fail criteria.

use crate::contract::TestOutcome;
use serde::{Deserialize, Serialize};

/// Gate evaluation verdict.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateVerdict {
    /// Whether the gate passed.
    pub passed: bool,

    /// Violations that caused failure (empty if passed).
    pub violations: Vec<String>,

    /// Summary message.
    pub message: String,
}

/// Contract gate rules.
pub struct ContractGate;

impl ContractGate {
    /// Evaluate whether every contract case passed.
    ///
    /// Gate rule:
    /// - Each outcome that is not `PASS` adds one violation naming the case,
    ///   its status and its message
    /// - An empty outcome list fails: the contract was never exercised
    pub fn evaluate(outcomes: &[TestOutcome]) -> GateVerdict {
        if outcomes.is_empty() {
            return GateVerdict {
                passed: false,
                violations: vec!["No contract cases were run".to_string()],
                message: "Gate failed: contract not exercised".to_string(),
            };
        }

        let violations: Vec<String> = outcomes
            .iter()
            .filter(|outcome| !outcome.passed())
            .map(|outcome| {
                format!(
                    "Case '{}' {}: {}",
                    outcome.case.name,
                    outcome.status.label(),
                    outcome.message
                )
            })
            .collect();

        let passed = violations.is_empty();
        let message = if passed {
            format!("All {} contract cases passed", outcomes.len())
        } else {
            format!(
                "Gate failed with {} violation(s) out of {} case(s)",
                violations.len(),
                outcomes.len()
            )
        };

        GateVerdict {
            passed,
            violations,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::TestCase;

    fn select_move(body: &str, status: u16) -> TestOutcome {
        TestOutcome::from_response(&TestCase::select_move("katago_gtp_bot"), status, body)
    }

    fn score(body: &str, status: u16) -> TestOutcome {
        TestOutcome::from_response(&TestCase::score("katago_gtp_bot"), status, body)
    }

    #[test]
    fn test_empty_outcomes_fail() {
        let verdict = ContractGate::evaluate(&[]);
        assert!(!verdict.passed);
        assert_eq!(verdict.violations.len(), 1);
    }

    #[test]
    fn test_all_cases_pass() {
        let outcomes = vec![
            select_move(r#"{"move":"Q16","win_prob":0.52,"score":0.4}"#, 200),
            score(r#"{"win_prob":0.52,"score":0.4,"ownership":[]}"#, 200),
        ];

        let verdict = ContractGate::evaluate(&outcomes);
        assert!(verdict.passed);
        assert!(verdict.violations.is_empty());
        assert_eq!(verdict.message, "All 2 contract cases passed");
    }

    #[test]
    fn test_one_failing_case() {
        let outcomes = vec![
            select_move(r#"{"move":"Q16","win_prob":0.52,"score":0.4}"#, 200),
            score("engine busy", 503),
        ];

        let verdict = ContractGate::evaluate(&outcomes);
        assert!(!verdict.passed);
        assert_eq!(verdict.violations.len(), 1);
        assert!(verdict.violations[0].contains("'score'"));
        assert!(verdict.violations[0].contains("FAIL_HTTP"));
        assert!(verdict.violations[0].contains("engine busy"));
    }

    #[test]
    fn test_every_failure_is_reported() {
        let outcomes = vec![
            select_move(r#"{"move":"Q16"}"#, 200),
            score("{}", 200),
        ];

        let verdict = ContractGate::evaluate(&outcomes);
        assert!(!verdict.passed);
        assert_eq!(verdict.violations.len(), 2);
        assert!(verdict.violations[0].contains("FAIL_SCHEMA"));
    }
}
