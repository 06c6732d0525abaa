//! Snapshot/restore coordinator (§4.G): a specialized traversal that moves
//! per-component state between machines during an upgrade.
//!
//! Grounded on `restore/main.c` for the exact stage sequence and defaults:
//! snapshot the source (unless it's already current), copy the snapshot off
//! the source, copy it onto the destination, then restore on the
//! destination — stopping after the copy when `--transfer-only` is set.

use crate::agent::AgentInterface;
use crate::config::Config;
use crate::engine::IterationEngine;
use crate::errors::Error;
use crate::plan::SnapshotTransfer;
use crate::registry::TargetRegistry;
use std::collections::HashMap;

fn agent_for(interfaces: &HashMap<String, String>, target: &str) -> AgentInterface {
    let executable = interfaces.get(target).map(String::as_str).unwrap_or("disnix-ssh-client");
    AgentInterface::new(executable, target)
}

/// Runs every stage of a component migration across all transfers. Each
/// stage is one full iteration pass, so per-target concurrency still
/// applies within a stage.
pub fn transfer(
    registry: &mut TargetRegistry,
    global_cap: usize,
    interfaces: &HashMap<String, String>,
    transfers: &[SnapshotTransfer],
    config: &Config,
    cancel: impl Fn() -> bool + Copy,
) -> Result<(), Error> {
    if transfers.is_empty() {
        return Ok(());
    }

    run_pass(registry, global_cap, transfers, cancel, |t| {
        agent_for(interfaces, &t.from_target).snapshot(&t.container, "state", &[], &t.component)
    }, |t| t.from_target.clone(), false)?;

    run_pass(registry, global_cap, transfers, cancel, |t| {
        agent_for(interfaces, &t.from_target).copy_snapshots_from(&t.container, &t.component, config.all_generations)
    }, |t| t.from_target.clone(), true)?;

    run_pass(registry, global_cap, transfers, cancel, |t| {
        agent_for(interfaces, &t.to_target).copy_snapshots_to(&t.container, &t.component, config.all_generations)
    }, |t| t.to_target.clone(), true)?;

    if config.transfer_only {
        return Ok(());
    }

    run_pass(registry, global_cap, transfers, cancel, |t| {
        agent_for(interfaces, &t.to_target).restore(&t.container, "state", &[], &t.component)
    }, |t| t.to_target.clone(), false)?;

    Ok(())
}

/// Runs one stage across every transfer. `is_copy` marks the two stages that
/// move bytes between machines (`copy-snapshots-to/from`), whose failures are
/// reported as *TransferFailure* (§7) rather than the generic *AgentFailure*
/// that `snapshot`/`restore` failures fall back to.
fn run_pass(
    registry: &mut TargetRegistry,
    global_cap: usize,
    transfers: &[SnapshotTransfer],
    cancel: impl Fn() -> bool,
    map_fn: impl Fn(&SnapshotTransfer) -> crate::engine::Operation,
    target_of: impl Fn(&SnapshotTransfer) -> String,
    is_copy: bool,
) -> Result<(), Error> {
    registry.reset_reservations();
    let mut engine = IterationEngine::new(registry, global_cap);
    let report = engine.run(transfers.to_vec(), target_of, map_fn, cancel);
    if report.success {
        return Ok(());
    }
    if is_copy {
        if let Some((transfer, _)) = report.results.iter().find(|(_, result)| result.is_err()) {
            return Err(Error::TransferFailure {
                paths: vec![format!("{}/{}", transfer.container, transfer.component)],
                target: transfer.to_target.clone(),
            });
        }
    }
    Err(report.into_first_error().expect("a failed report always has at least one error"))
}
