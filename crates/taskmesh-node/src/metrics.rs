//! Prometheus metrics collection and formatting.
//!
//! This module provides per-node metrics in Prometheus text exposition format.

use std::fmt::Write;

use taskmesh_core::TaskFilter;

use crate::registry::TaskRegistry;

/// Collect all metrics from a node's registry and format as Prometheus text.
pub fn collect_metrics(registry: &TaskRegistry) -> String {
    let mut output = String::new();

    collect_task_metrics(registry, &mut output);
    collect_ban_metrics(registry, &mut output);

    output
}

/// Collect live task metrics by state.
fn collect_task_metrics(registry: &TaskRegistry, output: &mut String) {
    let mut running = 0u64;
    let mut cancelled = 0u64;
    let mut cancellable = 0u64;

    for task in registry.list(&TaskFilter::all()) {
        if task.is_cancelled() {
            cancelled += 1;
        } else {
            running += 1;
        }
        if task.is_cancellable() {
            cancellable += 1;
        }
    }

    writeln!(
        output,
        "# HELP taskmesh_tasks Number of live tasks on this node by state"
    )
    .ok();
    writeln!(output, "# TYPE taskmesh_tasks gauge").ok();
    writeln!(output, "taskmesh_tasks{{state=\"running\"}} {running}").ok();
    writeln!(output, "taskmesh_tasks{{state=\"cancelled\"}} {cancelled}").ok();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP taskmesh_tasks_cancellable Number of live tasks that can be cancelled"
    )
    .ok();
    writeln!(output, "# TYPE taskmesh_tasks_cancellable gauge").ok();
    writeln!(output, "taskmesh_tasks_cancellable {cancellable}").ok();
}

/// Collect ban metrics.
fn collect_ban_metrics(registry: &TaskRegistry, output: &mut String) {
    writeln!(output).ok();
    writeln!(
        output,
        "# HELP taskmesh_bans_active Number of parent tasks banned on this node"
    )
    .ok();
    writeln!(output, "# TYPE taskmesh_bans_active gauge").ok();
    writeln!(output, "taskmesh_bans_active {}", registry.ban_count()).ok();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP taskmesh_ban_pending_children Children a ban still waits for, by parent"
    )
    .ok();
    writeln!(output, "# TYPE taskmesh_ban_pending_children gauge").ok();
    for parent in registry.banned_parents() {
        // Lifted since the listing.
        let Some(pending) = registry.ban_pending_children(&parent) else {
            continue;
        };
        writeln!(
            output,
            "taskmesh_ban_pending_children{{parent=\"{parent}\"}} {pending}"
        )
        .ok();
    }
}
