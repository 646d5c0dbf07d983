//! Human-readable rendering of a preflight run.

use preflight_core::{CheckItem, CleanupOutcome, CommandRecord, RunReport, TestOutcome};
use serde_json::Value;

/// Number of `best_moves` entries shown for a passing case.
const BEST_MOVES_SHOWN: usize = 3;

pub fn render_report(report: &RunReport) -> String {
    let mut lines = Vec::new();

    lines.push(format!("KataGo preflight: {}", report.base_url));
    lines.push(format!(
        "Run {} started {}",
        report.run_id,
        report.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    lines.push("=".repeat(50));

    if !report.environment.is_empty() {
        lines.push(String::new());
        lines.push("Environment".to_string());
        lines.extend(render_checks(&report.environment));
    }

    if let Some(remediation) = &report.remediation {
        lines.push(String::new());
        lines.push(render_command("Remediation", remediation));
        if let Some(rechecked) = &report.environment_rechecked {
            lines.push("Environment after remediation".to_string());
            lines.extend(render_checks(rechecked));
        }
    }

    if let Some(diagnostic) = &report.diagnostic {
        lines.push(String::new());
        lines.push(render_command("Engine binary", diagnostic));
        if let Some(version) = &report.engine_version {
            lines.push(format!("  version: {}", version));
        }
    }

    if let Some(readiness) = &report.readiness {
        lines.push(String::new());
        if readiness.ready {
            lines.push(format!(
                "Server ready after {:.1}s ({} attempt(s))",
                readiness.elapsed_seconds, readiness.attempts
            ));
        } else {
            lines.push(format!(
                "Server not ready after {:.1}s ({} attempt(s))",
                readiness.elapsed_seconds, readiness.attempts
            ));
        }
    }

    if !report.outcomes.is_empty() {
        lines.push(String::new());
        lines.push("Contract".to_string());
        for outcome in &report.outcomes {
            lines.extend(render_outcome(outcome));
        }
    }

    match (&report.cleanup, &report.cleanup_error) {
        (Some(CleanupOutcome::Terminated { pid, status }), _) => {
            lines.push(String::new());
            match pid {
                Some(pid) => lines.push(format!("Stopped server (pid {}): {}", pid, status)),
                None => lines.push(format!("Stopped server: {}", status)),
            }
        }
        (_, Some(error)) => {
            lines.push(String::new());
            lines.push(format!("Failed to stop server: {}", error));
        }
        _ => {}
    }

    lines.push(String::new());
    lines.push("=".repeat(50));
    if report.succeeded() {
        lines.push(format!(
            "PASSED: {} of {} contract case(s) in {} ms",
            report.passed_count(),
            report.outcomes.len(),
            report.duration_ms
        ));
    } else {
        lines.push(format!(
            "FAILED: {} failure(s) in {} ms",
            report.failures.len(),
            report.duration_ms
        ));
        for failure in &report.failures {
            lines.push(format!("  [{}] {}", failure.kind, failure.message));
        }
    }

    lines.join("\n")
}

fn render_checks(items: &[CheckItem]) -> Vec<String> {
    items
        .iter()
        .map(|item| {
            let mark = if item.present { "ok" } else { "MISSING" };
            format!("  [{}] {}: {}", mark, item.name, item.detail)
        })
        .collect()
}

fn render_command(label: &str, record: &CommandRecord) -> String {
    if record.passed {
        format!("{}: ok ({})", label, record.command.join(" "))
    } else {
        format!(
            "{}: failed ({}): {}",
            label,
            record.command.join(" "),
            record.failure_detail()
        )
    }
}

/// Lines for one contract case: status line, then response fields when it passed.
pub fn render_outcome(outcome: &TestOutcome) -> Vec<String> {
    let mut lines = vec![format!(
        "  [{}] {} ({})",
        outcome.status.label(),
        outcome.case.name,
        outcome.case.endpoint
    )];

    if !outcome.passed() {
        lines.push(format!("      {}", outcome.message));
        return lines;
    }

    let mut shown: Vec<&str> = Vec::new();
    for field in &outcome.case.required_fields {
        if let Some((name, value)) = field
            .names()
            .into_iter()
            .find_map(|name| outcome.field(name).map(|value| (name, value)))
        {
            lines.push(format!("      {}: {}", name, display_value(name, value)));
            shown.push(name);
        }
    }

    if let Some(response) = &outcome.response {
        for name in outcome.case.present_optional_fields(response) {
            if shown.contains(&name.as_str()) {
                continue;
            }
            match outcome.field(&name) {
                Some(value) if name == "best_moves" => {
                    lines.push(format!("      {}: {}", name, display_value(&name, value)));
                }
                Some(_) => lines.push(format!("      {}: present", name)),
                None => {}
            }
        }
    }

    lines
}

fn display_value(name: &str, value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(entries) if name == "best_moves" => {
            let top: Vec<String> = entries
                .iter()
                .take(BEST_MOVES_SHOWN)
                .map(|entry| match entry.get("move") {
                    Some(Value::String(mv)) => mv.clone(),
                    _ => match entry {
                        Value::String(mv) => mv.clone(),
                        other => other.to_string(),
                    },
                })
                .collect();
            format!("{} (top {} of {})", top.join(", "), top.len(), entries.len())
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use preflight_core::{HarnessConfig, Orchestrator, Requirement, TestCase};

    const ENGINE_ID: &str = "katago_gtp_bot";

    #[test]
    fn test_select_move_shows_values_and_top_moves() {
        let outcome = TestOutcome::from_response(
            &TestCase::select_move(ENGINE_ID),
            200,
            r#"{"move":"Q16","win_prob":0.52,"score":0.4,
                "best_moves":[{"move":"Q16"},{"move":"D4"},{"move":"Q4"},{"move":"C3"}]}"#,
        );

        let lines = render_outcome(&outcome);
        assert!(lines[0].contains("[PASS] select-move"));
        assert!(lines.contains(&"      move: Q16".to_string()));
        assert!(lines.contains(&"      win_prob: 0.52".to_string()));
        assert!(lines.contains(&"      score: 0.4".to_string()));
        assert!(lines.contains(&"      best_moves: Q16, D4, Q4 (top 3 of 4)".to_string()));
    }

    #[test]
    fn test_score_reports_ownership_presence() {
        let outcome = TestOutcome::from_response(
            &TestCase::score(ENGINE_ID),
            200,
            r#"{"win_prob":0.52,"score":0.4,"ownership":[0.1,-0.3]}"#,
        );

        let lines = render_outcome(&outcome);
        assert!(lines.contains(&"      ownership: present".to_string()));
    }

    #[test]
    fn test_failed_case_shows_message() {
        let outcome = TestOutcome::from_response(&TestCase::score(ENGINE_ID), 500, "boom");

        let lines = render_outcome(&outcome);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("[FAIL_HTTP]"));
        assert!(lines[1].contains("HTTP 500: boom"));
    }

    #[tokio::test]
    async fn test_environment_failure_report() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = HarnessConfig::attached().with_base_url("http://127.0.0.1:9");
        config.requirements = vec![Requirement::file(dir.path().join("katago_eigen"))];

        let report = Orchestrator::new(config).unwrap().run().await;
        let text = render_report(&report);

        assert!(text.contains("[MISSING]"));
        assert!(text.contains("FAILED: 1 failure(s)"));
        assert!(text.contains("[ENVIRONMENT]"));
        assert!(!text.contains("Contract"));
    }
}
