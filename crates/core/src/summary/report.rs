//! Human-readable stage reports (markdown).

use super::stage_summary::StageSummary;
use crate::memory::StageMemory;
use crate::roadmap::Stage;
use std::fmt::Write;

/// Render a stage report from its execution record and narrative memory
pub fn render_stage_report(
    stage: &Stage,
    summary: &StageSummary,
    memory: Option<&StageMemory>,
) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "# Stage Report: {} ({})\n", stage.name, stage.id);
    let _ = writeln!(out, "**Status:** {}", stage.status);
    if let Some(outcome) = summary.final_status {
        let _ = writeln!(out, "**Outcome:** {}", outcome);
    }
    let _ = writeln!(out, "**Audits:** {}", stage.audit_count);
    let _ = writeln!(out, "**Cost:** ${:.4}", summary.cost_usd);
    if let Some(source) = &stage.regression_source_id {
        let _ = writeln!(out, "**Reopened for regression from:** {}", source);
    }
    if summary.regression_detected {
        let _ = writeln!(
            out,
            "**Regression traced to:** {}",
            summary.regression_target.as_deref().unwrap_or("unknown")
        );
    }
    if !summary.superseded_by.is_empty() {
        let _ = writeln!(out, "**Superseded by:** {}", summary.superseded_by.join(", "));
    }

    if !summary.cycles.is_empty() {
        let _ = writeln!(out, "\n## Fix Cycles\n");
        let _ = writeln!(out, "| # | Builder | Status | Findings | Files | Note |");
        let _ = writeln!(out, "|---|---------|--------|----------|-------|------|");
        for cycle in &summary.cycles {
            let _ = writeln!(
                out,
                "| {} | {} | {}{} | {} | {} | {} |",
                cycle.cycle_number,
                cycle.builder,
                cycle.status,
                if cycle.degraded { " (degraded)" } else { "" },
                cycle.finding_count,
                cycle.files_changed.len(),
                cycle.note.as_deref().unwrap_or("")
            );
        }
    }

    let files = summary.current_files();
    if !files.is_empty() {
        let _ = writeln!(out, "\n## Files\n");
        for file in files {
            let _ = writeln!(out, "- `{}`", file);
        }
    }

    if !summary.issues.is_empty() {
        let _ = writeln!(out, "\n## Issues\n");
        for issue in &summary.issues {
            let state = match issue.resolved_in_cycle {
                Some(cycle) if issue.resolved => format!("resolved in cycle {}", cycle),
                _ => "open".to_string(),
            };
            let _ = writeln!(
                out,
                "- **{}** [{}] {}: {} ({})",
                issue.id, issue.severity, issue.category, issue.description, state
            );
        }
    }

    if let Some(memory) = memory {
        if !memory.summary.is_empty() {
            let _ = writeln!(out, "\n## Summary\n\n{}", memory.summary);
        }

        if !memory.decisions.is_empty() {
            let _ = writeln!(out, "\n## Decisions\n");
            for decision in &memory.decisions {
                let _ = writeln!(
                    out,
                    "- ({:?}, {}) {}",
                    decision.kind, decision.agent, decision.description
                );
            }
        }

        let unresolved = memory.unresolved_findings();
        if !unresolved.is_empty() {
            let _ = writeln!(out, "\n## Unresolved Findings\n");
            for finding in unresolved {
                let location = match (&finding.file, finding.line) {
                    (Some(file), Some(line)) => format!(" `{}:{}`", file, line),
                    (Some(file), None) => format!(" `{}`", file),
                    _ => String::new(),
                };
                let _ = writeln!(
                    out,
                    "- [{}] {}{}: {}",
                    finding.severity, finding.category, location, finding.description
                );
            }
        }

        let open_questions = memory.unanswered_clarifications();
        if !open_questions.is_empty() {
            let _ = writeln!(out, "\n## Open Questions\n");
            for c in open_questions {
                let _ = writeln!(out, "- {} → {}: {}", c.from, c.to, c.question);
            }
        }
    }

    out
}
