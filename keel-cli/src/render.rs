//! Terminal rendering of plans, apply reports and state

use std::fmt::Write;

use colored::{ColoredString, Colorize};
use similar::{ChangeTag, TextDiff};

use keel_core::executor::ApplyReport;
use keel_core::plan::{Action, AttributeDiff, Change, OutputChange, Plan};
use keel_core::refresh::RefreshResult;
use keel_core::resource::Value;
use keel_core::snapshot::StateSnapshot;

const ATTR_INDENT: &str = "      ";

fn symbol(change: &Change) -> ColoredString {
    match change.action {
        Action::Create => "+".green().bold(),
        Action::Update => "~".yellow().bold(),
        Action::Delete => "-".red().bold(),
        Action::Replace if change.create_before_destroy => "+/-".magenta().bold(),
        Action::Replace => "-/+".magenta().bold(),
        Action::NoOp => "-".red().bold(),
    }
}

fn format_value(value: &Value) -> String {
    match value {
        Value::Unknown => "(known after apply)".to_string(),
        Value::Ref(r) => format!("${{{}}} (known after apply)", r),
        other => other.to_string(),
    }
}

/// Render an attribute change, using a line diff for multi-line strings
fn render_diff(out: &mut String, diff: &AttributeDiff) {
    let marker = if diff.forces_replacement {
        format!(" {}", "# forces replacement".red())
    } else {
        String::new()
    };

    if let (Some(Value::String(old)), Some(Value::String(new))) = (&diff.before, &diff.after) {
        if old.contains('\n') || new.contains('\n') {
            let _ = writeln!(out, "{}{}:{}", ATTR_INDENT, diff.name, marker);
            let text_diff = TextDiff::from_lines(old.as_str(), new.as_str());
            for line in text_diff.iter_all_changes() {
                let text = line.to_string_lossy();
                let text = text.trim_end_matches('\n');
                let rendered = match line.tag() {
                    ChangeTag::Delete => format!("- {}", text).red(),
                    ChangeTag::Insert => format!("+ {}", text).green(),
                    ChangeTag::Equal => format!("  {}", text).normal(),
                };
                let _ = writeln!(out, "{}  {}", ATTR_INDENT, rendered);
            }
            return;
        }
    }

    let old = diff
        .before
        .as_ref()
        .map(format_value)
        .unwrap_or_else(|| "(none)".to_string());
    let new = diff
        .after
        .as_ref()
        .map(format_value)
        .unwrap_or_else(|| "(none)".to_string());
    let _ = writeln!(
        out,
        "{}{}: {} → {}{}",
        ATTR_INDENT,
        diff.name,
        old.red(),
        new.green(),
        marker
    );
}

fn render_change(out: &mut String, change: &Change) {
    let reasons = if change.reasons.is_empty() {
        String::new()
    } else {
        let reasons: Vec<String> = change.reasons.iter().map(|r| r.to_string()).collect();
        format!(" ({})", reasons.join(", ")).dimmed().to_string()
    };
    let _ = writeln!(
        out,
        "  {} {}{}",
        symbol(change),
        change.address.to_string().cyan().bold(),
        reasons
    );

    match change.action {
        Action::Create => {
            if let Some(after) = &change.after {
                for (name, value) in after {
                    let _ = writeln!(out, "{}{}: {}", ATTR_INDENT, name, format_value(value).green());
                }
            }
        }
        Action::Update | Action::Replace => {
            for diff in &change.diffs {
                render_diff(out, diff);
            }
        }
        Action::Delete => {
            if let Some(id) = change.before.as_ref().and_then(|b| b.get("id")) {
                let _ = writeln!(out, "{}id: {}", ATTR_INDENT, format_value(id).red());
            }
        }
        Action::NoOp => {}
    }

    if !change.deposed.is_empty() {
        let _ = writeln!(
            out,
            "{}{}",
            ATTR_INDENT,
            format!("{} deposed object(s) will be deleted", change.deposed.len()).red()
        );
    }
}

fn render_output_change(out: &mut String, change: &OutputChange) {
    let render = |value: &Option<Value>| {
        value
            .as_ref()
            .map(format_value)
            .unwrap_or_else(|| "(none)".to_string())
    };
    let _ = writeln!(
        out,
        "  {}: {} → {}",
        change.name,
        render(&change.before).red(),
        render(&change.after).green()
    );
}

/// Render a plan for the terminal
pub fn render_plan(plan: &Plan) -> String {
    let mut out = String::new();
    if plan.is_empty() {
        let _ = writeln!(out, "{}", "No changes. Infrastructure is up-to-date.".green());
        return out;
    }

    let _ = writeln!(out, "{}", "Execution Plan:".cyan().bold());
    let _ = writeln!(out);
    for change in plan.changes() {
        render_change(&mut out, change);
    }
    for address in plan.forgotten() {
        let _ = writeln!(
            out,
            "  {} {} {}",
            "-".dimmed(),
            address.to_string().cyan().bold(),
            "(deleted outside of Keel, removed from state)".dimmed()
        );
    }

    if !plan.output_changes().is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "{}", "Changes to Outputs:".cyan().bold());
        for change in plan.output_changes() {
            render_output_change(&mut out, change);
        }
    }

    let summary = plan.summary();
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "Plan: {} to create, {} to update, {} to replace, {} to delete.",
        summary.create.to_string().green(),
        summary.update.to_string().yellow(),
        summary.replace.to_string().magenta(),
        summary.delete.to_string().red()
    );
    out
}

/// Render the outcome of an apply
pub fn render_report(report: &ApplyReport) -> String {
    let mut out = String::new();
    for step in &report.applied {
        let _ = writeln!(out, "  {} {}", "✓".green(), step);
    }
    for failure in &report.errored {
        let _ = writeln!(
            out,
            "  {} {}: {}",
            "✗".red(),
            failure.step,
            failure.error.to_string().red()
        );
    }
    for step in &report.skipped {
        let _ = writeln!(out, "  {} {} {}", "-".yellow(), step, "(skipped)".dimmed());
    }
    for step in &report.not_started {
        let _ = writeln!(out, "  {} {} {}", "-".yellow(), step, "(not started)".dimmed());
    }

    let _ = writeln!(out);
    if report.is_success() {
        let _ = writeln!(
            out,
            "{}",
            format!("Apply complete! {} steps applied.", report.applied.len())
                .green()
                .bold()
        );
    } else {
        let _ = writeln!(
            out,
            "{}",
            format!("Apply incomplete: {}", report.summary().lines().next().unwrap_or(""))
                .yellow()
                .bold()
        );
    }

    if report.is_success() && !report.snapshot.outputs.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "{}", "Outputs:".cyan().bold());
        for (name, value) in &report.snapshot.outputs {
            let _ = writeln!(out, "  {} = {}", name, value);
        }
    }
    out
}

/// Render the drift found by a refresh
pub fn render_refresh(result: &RefreshResult) -> String {
    let mut out = String::new();
    if !result.has_drift() {
        let _ = writeln!(out, "{}", "No drift detected.".green());
        return out;
    }
    for address in &result.updated {
        let _ = writeln!(out, "  {} {} {}", "~".yellow().bold(), address, "(changed outside of Keel)".dimmed());
    }
    for address in &result.disappeared {
        let _ = writeln!(out, "  {} {} {}", "-".red().bold(), address, "(deleted outside of Keel)".dimmed());
    }
    out
}

/// Render a stored snapshot
pub fn render_state(snapshot: &StateSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} lineage {} serial {}",
        "State".cyan().bold(),
        snapshot.lineage,
        snapshot.serial
    );
    for instance in snapshot.resources.values() {
        let mut flags = Vec::new();
        if instance.tainted {
            flags.push("tainted");
        }
        if instance.is_errored() {
            flags.push("errored");
        }
        if instance.prevent_destroy {
            flags.push("prevent_destroy");
        }
        let flags = if flags.is_empty() {
            String::new()
        } else {
            format!(" ({})", flags.join(", ")).yellow().to_string()
        };
        let _ = writeln!(out, "  {}{}", instance.address.to_string().bold(), flags);
        for (name, value) in &instance.attributes {
            let _ = writeln!(out, "{}{}: {}", ATTR_INDENT, name, value);
        }
        if !instance.deposed.is_empty() {
            let _ = writeln!(out, "{}{} deposed object(s)", ATTR_INDENT, instance.deposed.len());
        }
    }
    if !snapshot.outputs.is_empty() {
        let _ = writeln!(out, "{}", "Outputs:".cyan().bold());
        for (name, value) in &snapshot.outputs {
            let _ = writeln!(out, "  {} = {}", name, value);
        }
    }
    out
}
