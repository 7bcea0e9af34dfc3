// Activity Summary
// Digests a worker's activity feed into compact text for the judge

use crate::orchestrator::types::{ActivityKind, WorkerRecord};

const TAIL_ENTRIES: usize = 12;
const MAX_ERRORS: usize = 5;
const MAX_SUMMARY_CHARS: usize = 160;

/// Compact, bounded digest of everything a worker did, suitable for
/// inclusion in a judge prompt.
pub fn summarize_activity(worker: &WorkerRecord) -> String {
    if worker.activity.is_empty() {
        return "No recorded activity".to_string();
    }

    let mut counts = [0usize; 7];
    for entry in &worker.activity {
        counts[kind_index(entry.kind)] += 1;
    }

    let mut lines = Vec::new();
    let breakdown: Vec<String> = [
        (ActivityKind::ToolCall, "tool calls"),
        (ActivityKind::FileEdit, "file edits"),
        (ActivityKind::FileCreate, "files created"),
        (ActivityKind::Bash, "shell commands"),
        (ActivityKind::Text, "messages"),
        (ActivityKind::Thinking, "thinking steps"),
        (ActivityKind::Error, "errors"),
    ]
    .iter()
    .filter(|(kind, _)| counts[kind_index(*kind)] > 0)
    .map(|(kind, label)| format!("{} {}", counts[kind_index(*kind)], label))
    .collect();

    lines.push(format!(
        "{} activity entries ({})",
        worker.activity.len(),
        breakdown.join(", ")
    ));

    lines.push("Recent:".to_string());
    let skip = worker.activity.len().saturating_sub(TAIL_ENTRIES);
    for entry in worker.activity.iter().skip(skip) {
        lines.push(format!(
            "- [{}] {}",
            kind_label(entry.kind),
            clip(&entry.summary)
        ));
    }

    let errors: Vec<&str> = worker
        .activity
        .iter()
        .filter(|e| e.kind == ActivityKind::Error)
        .map(|e| e.summary.as_str())
        .collect();
    if !errors.is_empty() {
        lines.push("Errors:".to_string());
        let skip = errors.len().saturating_sub(MAX_ERRORS);
        for error in errors.iter().skip(skip) {
            lines.push(format!("- {}", clip(error)));
        }
    }

    lines.join("\n")
}

fn kind_index(kind: ActivityKind) -> usize {
    match kind {
        ActivityKind::ToolCall => 0,
        ActivityKind::FileEdit => 1,
        ActivityKind::FileCreate => 2,
        ActivityKind::Bash => 3,
        ActivityKind::Text => 4,
        ActivityKind::Thinking => 5,
        ActivityKind::Error => 6,
    }
}

fn kind_label(kind: ActivityKind) -> &'static str {
    match kind {
        ActivityKind::ToolCall => "tool",
        ActivityKind::FileEdit => "edit",
        ActivityKind::FileCreate => "create",
        ActivityKind::Bash => "bash",
        ActivityKind::Text => "text",
        ActivityKind::Thinking => "thinking",
        ActivityKind::Error => "error",
    }
}

fn clip(text: &str) -> String {
    if text.chars().count() <= MAX_SUMMARY_CHARS {
        return text.to_string();
    }
    let clipped: String = text.chars().take(MAX_SUMMARY_CHARS).collect();
    format!("{}…", clipped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_activity() {
        let worker = WorkerRecord::started("w1", "t1");
        assert_eq!(summarize_activity(&worker), "No recorded activity");
    }

    #[test]
    fn test_counts_and_tail() {
        let mut worker = WorkerRecord::started("w1", "t1");
        for i in 0..20 {
            worker.record(ActivityKind::ToolCall, format!("call {}", i));
        }
        worker.record(ActivityKind::Error, "boom");

        let digest = summarize_activity(&worker);
        assert!(digest.starts_with("21 activity entries (20 tool calls, 1 errors)"));
        // only the tail of the feed is included
        assert!(!digest.contains("call 0"));
        assert!(digest.contains("call 19"));
        assert!(digest.contains("Errors:\n- boom"));
    }

    #[test]
    fn test_long_summaries_are_clipped() {
        let mut worker = WorkerRecord::started("w1", "t1");
        worker.record(ActivityKind::Text, "x".repeat(500));

        let digest = summarize_activity(&worker);
        let line = digest.lines().find(|l| l.starts_with("- [text]")).unwrap();
        assert!(line.chars().count() < 200);
        assert!(line.ends_with('…'));
    }
}
