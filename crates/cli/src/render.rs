//! Human and JSON rendering for change-sets and run reports.

use anyhow::Result;
use konverge_core::{Action, ChangeSet, Outcome, ReconciliationRun, RunStatus};

pub fn changeset(cs: &ChangeSet, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(cs)?);
        return Ok(());
    }
    for c in &cs.changes {
        match &c.action {
            Action::NoOp => {}
            Action::Update { delta } | Action::Replace { delta } => {
                println!("{} {} {}", c.action.symbol(), c.id, render_delta(delta));
            }
            _ => println!("{} {}", c.action.symbol(), c.id),
        }
    }
    let n = cs.counts();
    println!(
        "Plan: {} to create, {} to update, {} to replace, {} to delete, {} unchanged",
        n.create, n.update, n.replace, n.delete, n.noop
    );
    Ok(())
}

fn render_delta(delta: &serde_json::Value) -> String {
    let Some(map) = delta.as_object() else { return String::new() };
    let fields: Vec<String> = map
        .iter()
        .map(|(path, fr)| format!("{}: {} -> {}", path, fr["from"], fr["to"]))
        .collect();
    format!("({})", fields.join(", "))
}

pub fn run(run: &ReconciliationRun, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(run)?);
        return Ok(());
    }
    println!("RESOURCE                                      STATUS     ATTEMPTS");
    for o in &run.outcomes {
        let status = match o.outcome {
            Outcome::Success => "converged",
            Outcome::Retrying => "retrying",
            Outcome::Failed => "failed",
            Outcome::Skipped => "skipped",
        };
        let mut line = format!("{:<45} {:<10} {}", o.id.key(), status, o.attempts);
        if let Some(msg) = &o.message {
            line.push_str(&format!("  ({msg})"));
        }
        println!("{line}");
    }
    let started = chrono::DateTime::from_timestamp(run.started_ts, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| run.started_ts.to_string());
    let verdict = match run.status {
        RunStatus::Converged => "Converged",
        RunStatus::Failed => "Failed",
    };
    println!(
        "{} after {} pass(es); started {} took {}s",
        verdict,
        run.passes,
        started,
        (run.finished_ts - run.started_ts).max(0)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn delta_renders_path_transitions() {
        let delta = json!({"spec.replicas": {"from": 5, "to": 2}});
        assert_eq!(render_delta(&delta), "(spec.replicas: 5 -> 2)");
    }
}
