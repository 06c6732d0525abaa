//! Distribution planner (§4.E): turns manifests into the ordered work lists
//! the activation coordinator drives through the iteration engine.
//!
//! The dependency-ordered activation/deactivation walk is grounded on
//! `deployment_action::deploy_environment::EnvironmentDeployment`, which
//! walks fixed service categories in a specific order for create vs.
//! pause/delete; here that fixed category order is generalized into a
//! `dependsOn`-driven topological wave order so it works for an arbitrary
//! service graph instead of five hardcoded categories.

use crate::errors::Error;
use crate::model::{Manifest, ManifestService, ProfileMapping, ServiceKey};
use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosureTransfer {
    pub target: String,
    pub store_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotTransfer {
    pub from_target: String,
    pub to_target: String,
    pub container: String,
    pub component: String,
}

#[derive(Debug, Clone, Default)]
pub struct DistributionPlan {
    pub profiles: Vec<ProfileMapping>,
    pub closure_transfers: Vec<ClosureTransfer>,
    pub lock_targets: Vec<String>,
    pub to_deactivate: Vec<ServiceKey>,
    pub to_activate: Vec<ServiceKey>,
    /// `to_activate`, grouped into dependency waves: every key in wave `i`
    /// depends only on keys in waves `0..i`. The coordinator runs one wave
    /// at a time through the iteration engine so a cross-target dependency
    /// (which the engine's per-target reservation cannot serialize on its
    /// own) still activates before its dependents (§5, "emitting items in
    /// waves").
    pub activate_waves: Vec<Vec<ServiceKey>>,
    pub unchanged: Vec<ServiceKey>,
    /// `to_deactivate`, grouped the same way but over the reverse edges: a
    /// service shares a wave only with others whose dependents have all
    /// already deactivated in an earlier wave.
    pub deactivate_waves: Vec<Vec<ServiceKey>>,
    pub snapshot_transfers: Vec<SnapshotTransfer>,
}

fn diff_key(service: &ManifestService) -> (ServiceKey, String) {
    (service.key.clone(), service.service_path.clone())
}

/// Builds the full distribution plan for a deployment transaction.
///
/// `is_resident` decides whether a target already has a given store path, to
/// skip redundant closure transfers; a caller with no such oracle can pass
/// `|_, _| false` to always transfer.
pub fn plan(
    new_manifest: &Manifest,
    old_manifest: Option<&Manifest>,
    no_upgrade: bool,
    is_resident: impl Fn(&str, &str) -> bool,
) -> Result<DistributionPlan, Error> {
    let lock_targets: BTreeSet<String> = new_manifest.services.iter().map(|s| s.target().to_string()).collect();

    let closure_transfers = new_manifest
        .profiles
        .iter()
        .filter(|profile| !is_resident(&profile.target, &profile.profile_path))
        .map(|profile| ClosureTransfer {
            target: profile.target.clone(),
            store_path: profile.profile_path.clone(),
        })
        .collect();

    let empty_manifest = Manifest::default();
    let old = old_manifest.unwrap_or(&empty_manifest);

    let new_by_diff_key: HashMap<(ServiceKey, String), &ManifestService> =
        new_manifest.services.iter().map(|s| (diff_key(s), s)).collect();
    let old_by_diff_key: HashMap<(ServiceKey, String), &ManifestService> =
        old.services.iter().map(|s| (diff_key(s), s)).collect();

    let (to_deactivate_keys, to_activate_keys, unchanged_keys) = if no_upgrade {
        (
            old.services.iter().map(|s| s.key.clone()).collect::<HashSet<_>>(),
            new_manifest.services.iter().map(|s| s.key.clone()).collect::<HashSet<_>>(),
            HashSet::new(),
        )
    } else {
        let to_deactivate = old_by_diff_key
            .iter()
            .filter(|(k, _)| !new_by_diff_key.contains_key(*k))
            .map(|(k, _)| k.0.clone())
            .collect::<HashSet<_>>();
        let to_activate = new_by_diff_key
            .iter()
            .filter(|(k, _)| !old_by_diff_key.contains_key(*k))
            .map(|(k, _)| k.0.clone())
            .collect::<HashSet<_>>();
        let unchanged = new_by_diff_key
            .iter()
            .filter(|(k, _)| old_by_diff_key.contains_key(*k))
            .map(|(k, _)| k.0.clone())
            .collect::<HashSet<_>>();
        (to_deactivate, to_activate, unchanged)
    };

    let activate_waves = topological_waves(&new_manifest.services, &to_activate_keys)?;
    let deactivate_waves = topological_waves_reverse(&old.services, &to_deactivate_keys)?;
    let to_activate: Vec<ServiceKey> = activate_waves.iter().flatten().cloned().collect();
    let to_deactivate: Vec<ServiceKey> = deactivate_waves.iter().flatten().cloned().collect();
    let unchanged: Vec<ServiceKey> = {
        let mut v: Vec<ServiceKey> = unchanged_keys.into_iter().collect();
        v.sort();
        v
    };

    let mut snapshot_transfers = Vec::new();
    if !no_upgrade {
        let old_location: HashMap<(String, String), String> = old
            .services
            .iter()
            .map(|s| ((s.key.container.clone(), s.key.name.clone()), s.key.target.clone()))
            .collect();

        for key in unchanged.iter().chain(to_activate.iter()) {
            if let Some(old_target) = old_location.get(&(key.container.clone(), key.name.clone())) {
                if old_target != &key.target {
                    snapshot_transfers.push(SnapshotTransfer {
                        from_target: old_target.clone(),
                        to_target: key.target.clone(),
                        container: key.container.clone(),
                        component: key.name.clone(),
                    });
                }
            }
        }
    }

    Ok(DistributionPlan {
        profiles: new_manifest.profiles.clone(),
        closure_transfers,
        lock_targets: lock_targets.into_iter().collect(),
        to_deactivate,
        to_activate,
        activate_waves,
        unchanged,
        deactivate_waves,
        snapshot_transfers,
    })
}

/// Builds the transfer list for the standalone snapshot/restore verb's
/// `--no-upgrade` full restore (S4): every component in `manifest`, restored
/// in place rather than only the ones that moved target during an upgrade.
/// `plan`'s own `snapshot_transfers` only covers components whose target
/// changed between two manifests, which is the wrong list for a verb that
/// restores the entire system regardless of what was previously deployed —
/// so `from_target`/`to_target` are both the component's current target, and
/// `snapshot::transfer` runs its usual snapshot/copy/restore passes against
/// that identity transfer for every service.
pub fn full_restore_transfers(manifest: &Manifest) -> Vec<SnapshotTransfer> {
    manifest
        .services
        .iter()
        .map(|service| SnapshotTransfer {
            from_target: service.key.target.clone(),
            to_target: service.key.target.clone(),
            container: service.key.container.clone(),
            component: service.key.name.clone(),
        })
        .collect()
}

/// Kahn's algorithm restricted to `keys`, grouped into waves: wave 0 holds
/// every key with no dependency inside `keys`; wave `i` holds every key whose
/// dependencies were all emitted in waves `0..i`. A single flat order loses
/// this information once two keys on different targets have no edge between
/// them — the iteration engine's per-target cap cannot serialize them, so the
/// coordinator needs the wave boundary to hold the second one back (§5).
/// Each wave is sorted by `ServiceKey`'s lexicographic ordering for
/// determinism.
fn topological_waves(services: &[ManifestService], keys: &HashSet<ServiceKey>) -> Result<Vec<Vec<ServiceKey>>, Error> {
    let by_key: HashMap<&ServiceKey, &ManifestService> = services.iter().map(|s| (&s.key, s)).collect();

    let mut remaining_deps: HashMap<ServiceKey, usize> = HashMap::new();
    let mut dependents: HashMap<ServiceKey, Vec<ServiceKey>> = HashMap::new();

    for key in keys {
        let deps_in_set = by_key
            .get(key)
            .map(|s| s.depends_on.iter().filter(|d| keys.contains(d)).count())
            .unwrap_or(0);
        remaining_deps.insert(key.clone(), deps_in_set);

        if let Some(service) = by_key.get(key) {
            for dep in service.depends_on.iter().filter(|d| keys.contains(d)) {
                dependents.entry(dep.clone()).or_default().push(key.clone());
            }
        }
    }

    waves_from(remaining_deps, dependents, keys.len(), "activation")
}

/// Same as [`topological_waves`] but over the reversed dependency edges, so a
/// wave's keys are emitted only after everything that depends on them.
fn topological_waves_reverse(services: &[ManifestService], keys: &HashSet<ServiceKey>) -> Result<Vec<Vec<ServiceKey>>, Error> {
    let by_key: HashMap<&ServiceKey, &ManifestService> = services.iter().map(|s| (&s.key, s)).collect();

    let mut remaining_dependents: HashMap<ServiceKey, usize> = HashMap::new();
    let mut reverse_dependents: HashMap<ServiceKey, Vec<ServiceKey>> = HashMap::new();

    for key in keys {
        remaining_dependents.insert(key.clone(), 0);
    }
    for key in keys {
        if let Some(service) = by_key.get(key) {
            for dep in service.depends_on.iter().filter(|d| keys.contains(d)) {
                *remaining_dependents.entry(dep.clone()).or_insert(0) += 1;
                reverse_dependents.entry(key.clone()).or_default().push(dep.clone());
            }
        }
    }

    waves_from(remaining_dependents, reverse_dependents, keys.len(), "deactivation")
}

/// Shared Kahn's-algorithm-by-levels core: `remaining` is each key's current
/// in-degree, `edges` maps a key to the keys whose in-degree it contributes
/// to once it is emitted.
fn waves_from(
    mut remaining: HashMap<ServiceKey, usize>,
    edges: HashMap<ServiceKey, Vec<ServiceKey>>,
    total: usize,
    purpose: &str,
) -> Result<Vec<Vec<ServiceKey>>, Error> {
    let mut current_wave: Vec<ServiceKey> = remaining
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(k, _)| k.clone())
        .collect();
    current_wave.sort();

    let mut waves = Vec::new();
    let mut emitted = 0usize;
    while !current_wave.is_empty() {
        emitted += current_wave.len();
        let mut next_wave: BTreeSet<ServiceKey> = BTreeSet::new();
        for key in &current_wave {
            if let Some(affected) = edges.get(key) {
                for dependent in affected {
                    if let Some(count) = remaining.get_mut(dependent) {
                        *count -= 1;
                        if *count == 0 {
                            next_wave.insert(dependent.clone());
                        }
                    }
                }
            }
        }
        waves.push(std::mem::take(&mut current_wave));
        current_wave = next_wave.into_iter().collect();
    }

    if emitted != total {
        return Err(Error::malformed_model(format!(
            "dependency cycle detected among services scheduled for {purpose}"
        )));
    }

    Ok(waves)
}
