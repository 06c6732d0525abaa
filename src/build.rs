//! Build graph execution: realises every `DerivationItem` on its target
//! through the bounded iteration engine (§4.D) and writes back the store
//! paths the agent reports on success (§3, `DerivationItem.result`).
//!
//! Grounded on `libdistderivation/derivationmapping.c`'s future-iterator
//! usage of `realise`, generalized to this crate's single generic
//! [`IterationEngine`] driver.

use crate::agent::AgentInterface;
use crate::engine::{IterationEngine, OperationOutcome};
use crate::errors::Error;
use crate::model::DerivationItem;
use crate::registry::TargetRegistry;
use std::collections::HashMap;

/// Runs `realise` for every derivation item, under the same global/per-target
/// caps as any other pass (§4.D), and returns the items with `result`
/// populated from each agent's stdout. Fails the whole build if any item
/// fails; `result` is left empty on items that never got to run.
pub fn build(
    registry: &mut TargetRegistry,
    global_cap: usize,
    interfaces: &HashMap<String, String>,
    items: Vec<DerivationItem>,
    cancel: impl Fn() -> bool + Copy,
) -> Result<Vec<DerivationItem>, Error> {
    registry.reset_reservations();
    let mut engine = IterationEngine::new(registry, global_cap);
    let report = engine.run(
        items,
        |item| item.target.clone(),
        |item| {
            let agent = AgentInterface::new(
                interfaces.get(&item.target).cloned().unwrap_or_default(),
                item.target.clone(),
            );
            agent.realise(&item.derivation)
        },
        cancel,
    );

    if !report.success {
        return Err(report
            .results
            .into_iter()
            .find_map(|(_, result)| result.err())
            .expect("a failed report always has at least one error"));
    }

    Ok(report
        .results
        .into_iter()
        .map(|(mut item, outcome)| {
            if let Ok(OperationOutcome::Future(paths)) = outcome {
                item.result = paths;
            }
            item
        })
        .collect())
}
