//! Human-readable output

use colored::Colorize;
use serde_json::Value;
use similar::{ChangeTag, TextDiff};

use strata_core::drift::{AttributeDiff, ChangeKind, render_value};
use strata_core::migrate::MigrationOutcome;
use strata_core::ops::{BackupCreated, DriftOutcome};
use strata_core::workspace::{WorkspaceDeleted, WorkspaceStatus, WorkspaceSummary};
use strata_state::{BackupInfo, LockInfo, MigrationMarker, PruneOutcome, StateDocument};

fn symbol(kind: ChangeKind) -> colored::ColoredString {
    match kind {
        ChangeKind::Added => "+".green().bold(),
        ChangeKind::Removed => "-".red().bold(),
        ChangeKind::Modified => "~".yellow().bold(),
        ChangeKind::Unchanged => " ".normal(),
    }
}

pub fn drift(outcome: &DriftOutcome) {
    let report = &outcome.report;
    if !report.has_drift() {
        println!("{}", "No drift. Live infrastructure matches the recorded state.".green());
    } else {
        println!(
            "{} {}",
            "Drift detected in workspace".yellow().bold(),
            outcome.workspace.cyan().bold()
        );
    }
    println!();

    for change in &report.changes {
        println!("  {} {}", symbol(change.kind), change.address.to_string().cyan().bold());
        for diff in &change.attribute_diffs {
            attribute(diff);
        }
    }

    if !report.output_changes.is_empty() {
        println!();
        println!("{}", "Outputs:".cyan().bold());
        for output in &report.output_changes {
            let label = if output.sensitive {
                format!("{} {}", output.name, "(sensitive)".dimmed())
            } else {
                output.name.clone()
            };
            println!("  {} {}", symbol(output.kind), label);
            if output.kind == ChangeKind::Modified && !output.sensitive {
                println!(
                    "      {} → {}",
                    render_value(output.before.as_ref()).red(),
                    render_value(output.after.as_ref()).green()
                );
            }
        }
    }

    let summary = &report.summary;
    println!();
    println!(
        "Summary: {} added, {} removed, {} modified, {} unchanged",
        summary.added.to_string().green(),
        summary.removed.to_string().red(),
        summary.modified.to_string().yellow(),
        summary.unchanged
    );
    if let Some(path) = &outcome.saved_to {
        println!("Report saved to {}", path.display());
    }
}

/// Print one attribute difference; structured or multi-line values as a line diff
fn attribute(diff: &AttributeDiff) {
    let attr_prefix = "      ";
    match (&diff.before, &diff.after) {
        (Some(before), Some(after)) if is_block(before) || is_block(after) => {
            println!("{}{}:", attr_prefix, diff.path);
            let (before, after) = (block_text(before), block_text(after));
            let text_diff = TextDiff::from_lines(&before, &after);
            for change in text_diff.iter_all_changes() {
                let line = change.to_string_lossy();
                let line = line.trim_end_matches('\n');
                match change.tag() {
                    ChangeTag::Delete => println!("{}  {}", attr_prefix, format!("- {}", line).red()),
                    ChangeTag::Insert => println!("{}  {}", attr_prefix, format!("+ {}", line).green()),
                    ChangeTag::Equal => println!("{}    {}", attr_prefix, line),
                }
            }
        }
        _ => println!(
            "{}{}: {} → {}",
            attr_prefix,
            diff.path,
            render_value(diff.before.as_ref()).red(),
            render_value(diff.after.as_ref()).green()
        ),
    }
}

fn is_block(value: &Value) -> bool {
    match value {
        Value::String(s) => s.contains('\n'),
        Value::Array(items) => !items.is_empty(),
        _ => false,
    }
}

fn block_text(value: &Value) -> String {
    let mut text = match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    };
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text
}

pub fn workspaces(workspaces: &[WorkspaceSummary]) {
    if workspaces.is_empty() {
        println!("No workspaces. Run `strata configure-backend` to get started.");
        return;
    }
    for workspace in workspaces {
        match workspace.status {
            WorkspaceStatus::Current => println!(
                "* {}  {}",
                workspace.name.green().bold(),
                workspace.backend.dimmed()
            ),
            WorkspaceStatus::Active => {
                println!("  {}  {}", workspace.name, workspace.backend.dimmed())
            }
        }
    }
}

pub fn workspace_deleted(deleted: &WorkspaceDeleted) {
    println!("{} {}", "Deleted workspace".red().bold(), deleted.name.cyan().bold());
    if deleted.resources > 0 {
        println!(
            "{} it still managed {} resource(s); its state was kept as a backup",
            "Note:".yellow().bold(),
            deleted.resources
        );
    }
    if let Some(current) = &deleted.switched_to {
        println!("Switched to workspace {}", current.cyan().bold());
    }
}

pub fn migration(outcome: &MigrationOutcome) {
    println!(
        "{} {} from {} to {}",
        "Migrated".green().bold(),
        outcome.workspace.cyan().bold(),
        outcome.source,
        outcome.target
    );
    println!(
        "  lineage {}, {} resource(s), target version {}, {} backup(s) copied",
        outcome.lineage, outcome.resources, outcome.target_version, outcome.backups_copied
    );
    if outcome.overwritten {
        println!("  {} replaced state of another lineage on the target", "Note:".yellow().bold());
    }
    println!("  The source state was left in place and marked as migrated.");
}

pub fn pruned(outcomes: &[PruneOutcome]) {
    for outcome in outcomes {
        let verb = if outcome.dry_run { "Would remove" } else { "Removed" };
        println!(
            "{}: {} {} of {} backup(s), kept {}",
            outcome.workspace.cyan().bold(),
            verb,
            outcome.removed_count(),
            outcome.scanned,
            outcome.kept
        );
        for id in &outcome.removed {
            println!("  {} {}", "-".red().bold(), id);
        }
    }
}

pub fn backups(backups: &[BackupInfo]) {
    if backups.is_empty() {
        println!("No backups.");
        return;
    }
    for backup in backups {
        println!(
            "{}  {}  version {}",
            backup.id,
            backup.created.format("%Y-%m-%d %H:%M:%S UTC").to_string().dimmed(),
            backup.version
        );
    }
}

pub fn backup_created(created: &BackupCreated) {
    println!(
        "{} {} as {} (version {}, serial {}, {} resource(s))",
        "Backed up".green().bold(),
        created.workspace.cyan().bold(),
        created.backup.id,
        created.backup.version,
        created.serial,
        created.resources
    );
    if let Some(path) = &created.exported_to {
        println!("State written to {}", path.display());
    }
}

pub fn state(
    workspace: &str,
    state: &StateDocument,
    lock: Option<&LockInfo>,
    migrated: Option<&MigrationMarker>,
) {
    println!("{} {}", "Workspace".cyan().bold(), workspace.bold());
    println!("  lineage {}", state.lineage);
    println!("  version {}, serial {}", state.version, state.serial);
    if let Some(source) = &state.metadata.source {
        println!("  source  {}", source);
    }
    if let Some(lock) = lock {
        println!(
            "  {} by {} ({}, id {}, expires {})",
            "locked".yellow().bold(),
            lock.who,
            lock.operation,
            lock.id,
            lock.expires.format("%H:%M:%S UTC")
        );
    }
    if let Some(marker) = migrated {
        println!(
            "  {} to {} on {}; writes here need --force",
            "migrated".red().bold(),
            marker.target,
            marker.migrated_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    println!();

    if state.is_empty() {
        println!("No resources.");
    }
    for address in state.dependency_order() {
        let Some(record) = state.resource(address) else {
            continue;
        };
        let marker = if record.tainted {
            " (tainted)".red().to_string()
        } else {
            String::new()
        };
        println!("  {}{}", address.to_string().cyan(), marker);
        for (key, value) in &record.attributes {
            println!("      {}: {}", key, render_value(Some(value)));
        }
    }

    if !state.outputs.is_empty() {
        println!();
        println!("{}", "Outputs:".cyan().bold());
        for (name, output) in &state.outputs {
            let value = if output.sensitive {
                "(sensitive)".dimmed().to_string()
            } else {
                render_value(Some(&output.value))
            };
            println!("  {} = {}", name, value);
        }
    }
}
