//! Activation coordinator (§4.F): drives a full deployment transaction
//! through its nine stages, rolling back on the first stage that fails.
//!
//! Grounded on `deployment_action::mod::DeploymentAction` and
//! `deployment_action::deploy_environment::EnvironmentDeployment`: the same
//! "run each item's action, then its check" dispatch and ordered-undo intent
//! generalized from a fixed 3-action/5-category shape into the
//! DISTRIBUTE..DONE machine and a `dependsOn`-ordered service graph.

use crate::agent::AgentInterface;
use crate::config::Config;
use crate::engine::IterationEngine;
use crate::errors::Error;
use crate::model::{Manifest, ManifestService, ServiceKey};
use crate::plan;
use crate::registry::TargetRegistry;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Distribute,
    Lock,
    TransferSnapshots,
    Deactivate,
    Activate,
    SetProfiles,
    Unlock,
    Commit,
}

impl Stage {
    fn name(self) -> &'static str {
        match self {
            Stage::Distribute => "DISTRIBUTE",
            Stage::Lock => "LOCK",
            Stage::TransferSnapshots => "TRANSFER_SNAPSHOTS",
            Stage::Deactivate => "DEACTIVATE",
            Stage::Activate => "ACTIVATE",
            Stage::SetProfiles => "SET_PROFILES",
            Stage::Unlock => "UNLOCK",
            Stage::Commit => "COMMIT",
        }
    }
}

pub struct Coordinator {
    registry: TargetRegistry,
    global_cap: usize,
}

impl Coordinator {
    pub fn new(registry: TargetRegistry, global_cap: usize) -> Coordinator {
        Coordinator { registry, global_cap }
    }

    /// Runs a full deployment transaction: DISTRIBUTE through COMMIT, with
    /// stage-specific rollback on the first failure (§4.F).
    pub fn deploy(
        &mut self,
        new_manifest: &Manifest,
        old_manifest: Option<&Manifest>,
        config: &Config,
        cancel: impl Fn() -> bool + Copy,
    ) -> Result<(), Error> {
        let dist_plan = plan::plan(new_manifest, old_manifest, config.no_upgrade, |_, _| false)?;
        let interfaces = self.registry.interfaces();

        info!("stage={}", Stage::Distribute.name());
        let distribute_report = self.run_pass_report(
            dist_plan.closure_transfers.clone(),
            |item| item.target.clone(),
            |item| {
                let agent = AgentInterface::new(
                    interfaces.get(&item.target).cloned().unwrap_or_default(),
                    item.target.clone(),
                );
                agent.copy_closure_to(&[item.store_path.clone()])
            },
            cancel,
        );
        if !distribute_report.success {
            let err = distribute_report
                .results
                .iter()
                .find_map(|(item, result)| {
                    result
                        .as_ref()
                        .err()
                        .map(|_| Error::TransferFailure { paths: vec![item.store_path.clone()], target: item.target.clone() })
                })
                .unwrap_or_else(|| Error::malformed_model("DISTRIBUTE failed: a closure transfer was rejected"));
            return Err(self.fail(Stage::Distribute, err));
        }

        info!("stage={}", Stage::Lock.name());
        let lock_report = self.run_pass_report(
            dist_plan.lock_targets.clone(),
            |target| target.clone(),
            |target| {
                let agent = AgentInterface::new(interfaces.get(target).cloned().unwrap_or_default(), target.clone());
                agent.lock(&config.profile)
            },
            cancel,
        );
        if !lock_report.success {
            let locked: Vec<String> = lock_report
                .results
                .iter()
                .filter_map(|(target, result)| result.is_ok().then(|| target.clone()))
                .collect();
            let err = lock_report
                .results
                .into_iter()
                .find_map(|(target, result)| result.err().map(|err| as_lock_conflict(target, err)));
            let rollback_errors = self.unlock_best_effort(&locked, &interfaces, config);
            return Err(self.fail_or_rollback(Stage::Lock, err.unwrap_or_else(|| lock_report_error(Stage::Lock)), rollback_errors));
        }
        let locked_targets = lock_report.into_successes();

        if !config.no_upgrade && !dist_plan.snapshot_transfers.is_empty() {
            info!("stage={}", Stage::TransferSnapshots.name());
            if let Err(err) = crate::snapshot::transfer(
                &mut self.registry,
                self.global_cap,
                &interfaces,
                &dist_plan.snapshot_transfers,
                config,
                cancel,
            ) {
                let rollback_errors = self.unlock_best_effort(&locked_targets, &interfaces, config);
                return Err(self.fail_or_rollback(Stage::TransferSnapshots, err, rollback_errors));
            }
        }

        info!("stage={}", Stage::Deactivate.name());
        let (deactivated, deactivate_err) = self.run_waves(dist_plan.deactivate_waves.clone(), cancel, |key| {
            deactivate_operation(&interfaces, old_manifest, key)
        });
        if let Some(err) = deactivate_err {
            let mut rollback_errors = self.reactivate(&deactivated, &interfaces, new_manifest, old_manifest);
            rollback_errors.extend(self.unlock_best_effort(&locked_targets, &interfaces, config));
            return Err(self.fail_or_rollback(Stage::Deactivate, err, rollback_errors));
        }

        info!("stage={}", Stage::Activate.name());
        let (activated, activate_err) = self.run_waves(dist_plan.activate_waves.clone(), cancel, |key| {
            activate_operation(&interfaces, new_manifest, key)
        });
        if let Some(err) = activate_err {
            let mut rollback_errors = self.undo_activations(&activated, &interfaces, new_manifest);
            rollback_errors.extend(self.reactivate(&deactivated, &interfaces, new_manifest, old_manifest));
            rollback_errors.extend(self.unlock_best_effort(&locked_targets, &interfaces, config));
            return Err(self.fail_or_rollback(Stage::Activate, err, rollback_errors));
        }

        info!("stage={}", Stage::SetProfiles.name());
        self.run_pass(
            dist_plan.profiles.clone(),
            |profile| profile.target.clone(),
            |profile| {
                let agent =
                    AgentInterface::new(interfaces.get(&profile.target).cloned().unwrap_or_default(), profile.target.clone());
                agent.set(&profile.profile, &profile.profile_path)
            },
            cancel,
        )
        .map_err(|err| self.fail(Stage::SetProfiles, err))?;

        info!("stage={}", Stage::Unlock.name());
        self.run_pass(
            locked_targets.clone(),
            |target| target.clone(),
            |target| {
                let agent = AgentInterface::new(interfaces.get(target).cloned().unwrap_or_default(), target.clone());
                agent.unlock(&config.profile)
            },
            cancel,
        )
        .map_err(|err| self.fail(Stage::Unlock, err))?;

        info!("stage={}", Stage::Commit.name());
        // Committing is persisting the new manifest as the coordinator
        // profile; that persistence mechanism is external to this crate
        // (see SPEC_FULL.md §6, "Persisted state") — by the time control
        // reaches here every target-visible side effect has already
        // succeeded, so COMMIT cannot itself roll anything back.

        Ok(())
    }

    fn run_pass<T>(
        &mut self,
        items: Vec<T>,
        target_of: impl Fn(&T) -> String,
        map_fn: impl Fn(&T) -> crate::engine::Operation,
        cancel: impl Fn() -> bool,
    ) -> Result<(), Error> {
        let report = self.run_pass_report(items, target_of, map_fn, cancel);
        if report.success {
            Ok(())
        } else {
            Err(report.into_first_error().expect("a failed report always has at least one error"))
        }
    }

    fn run_pass_report<T>(
        &mut self,
        items: Vec<T>,
        target_of: impl Fn(&T) -> String,
        map_fn: impl Fn(&T) -> crate::engine::Operation,
        cancel: impl Fn() -> bool,
    ) -> crate::engine::IterationReport<T> {
        self.registry.reset_reservations();
        let mut engine = IterationEngine::new(&mut self.registry, self.global_cap);
        engine.run(items, target_of, map_fn, cancel)
    }

    /// Runs dependency-ordered waves through the engine one at a time: a
    /// wave is a barrier, so nothing in wave `i+1` is even considered for
    /// dispatch until every key in wave `i` has completed (§5's "emitting
    /// items in waves"). This is what makes cross-target dependencies
    /// correct — the engine's per-target reservation alone only serializes
    /// same-target items. Stops at the first wave that isn't a full success,
    /// without starting the next one; returns every key that did succeed
    /// (for rollback bookkeeping) and, on failure, the first real error the
    /// failing wave reported (so the caller maps the failure to the owning
    /// item instead of a synthetic placeholder, per §7/§4.C).
    fn run_waves(
        &mut self,
        waves: Vec<Vec<ServiceKey>>,
        cancel: impl Fn() -> bool + Copy,
        op: impl Fn(&ServiceKey) -> crate::engine::Operation,
    ) -> (Vec<ServiceKey>, Option<Error>) {
        let mut completed = Vec::new();
        for wave in waves {
            let report = self.run_pass_report(wave, |key| key.target.clone(), &op, cancel);
            if report.success {
                completed.extend(report.into_successes());
                continue;
            }
            let mut first_error = None;
            for (key, result) in report.results {
                match result {
                    Ok(_) => completed.push(key),
                    Err(err) if first_error.is_none() => first_error = Some(err),
                    Err(_) => {}
                }
            }
            return (completed, Some(first_error.unwrap_or_else(|| Error::agent_failure("activate", "*", -1))));
        }
        (completed, None)
    }

    fn fail(&mut self, stage: Stage, err: Error) -> Error {
        error!("deployment failed at stage {}: {err}", stage.name());
        err
    }

    /// Wraps the stage's own failure in `PartialRollbackFailure` when the
    /// best-effort undo itself reported failures (§7); otherwise just the
    /// stage's own error, so the common case keeps a precise error kind.
    fn fail_or_rollback(&mut self, stage: Stage, err: Error, rollback_errors: Vec<String>) -> Error {
        if rollback_errors.is_empty() {
            self.fail(stage, err)
        } else {
            let mut causes = vec![err.to_string()];
            causes.extend(rollback_errors);
            self.fail(
                stage,
                Error::PartialRollbackFailure {
                    stage: stage.name().to_string(),
                    causes,
                },
            )
        }
    }

    /// Returns a human-readable failure description per item that did not
    /// unlock, for folding into `PartialRollbackFailure::causes`.
    fn unlock_best_effort(&mut self, locked: &[String], interfaces: &HashMap<String, String>, config: &Config) -> Vec<String> {
        if locked.is_empty() {
            return Vec::new();
        }
        let report = self.run_pass_report(
            locked.to_vec(),
            |target| target.clone(),
            |target| {
                let agent = AgentInterface::new(interfaces.get(target).cloned().unwrap_or_default(), target.clone());
                agent.unlock(&config.profile)
            },
            || false,
        );
        report
            .results
            .into_iter()
            .filter_map(|(target, result)| result.err().map(|err| format!("unlock {target}: {err}")))
            .collect()
    }

    fn reactivate(
        &mut self,
        deactivated: &[ServiceKey],
        interfaces: &HashMap<String, String>,
        new_manifest: &Manifest,
        old_manifest: Option<&Manifest>,
    ) -> Vec<String> {
        let mut keys = deactivated.to_vec();
        keys.reverse();
        let report = self.run_pass_report(
            keys,
            |key| key.target.clone(),
            |key| {
                // The service definition lives wherever it was last known:
                // prefer the old manifest (it is being restored), falling
                // back to the new one.
                old_manifest
                    .and_then(|m| m.find(key))
                    .or_else(|| new_manifest.find(key))
                    .map(|service| activate_for(interfaces, service))
                    .unwrap_or_else(|| no_op_operation())
            },
            || false,
        );
        report
            .results
            .into_iter()
            .filter_map(|(key, result)| result.err().map(|err| format!("reactivate {}: {err}", key.name)))
            .collect()
    }

    fn undo_activations(&mut self, activated: &[ServiceKey], interfaces: &HashMap<String, String>, new_manifest: &Manifest) -> Vec<String> {
        let mut keys = activated.to_vec();
        keys.reverse();
        let report = self.run_pass_report(
            keys,
            |key| key.target.clone(),
            |key| {
                new_manifest
                    .find(key)
                    .map(|service| deactivate_for(interfaces, service))
                    .unwrap_or_else(|| no_op_operation())
            },
            || false,
        );
        report
            .results
            .into_iter()
            .filter_map(|(key, result)| result.err().map(|err| format!("undo-activate {}: {err}", key.name)))
            .collect()
    }
}

fn lock_report_error(stage: Stage) -> Error {
    Error::malformed_model(format!("{} failed: a target refused to lock", stage.name()))
}

/// A failed `lock` agent invocation is reported as *LockConflict* (§7)
/// rather than the generic *AgentFailure* every other verb maps to;
/// anything else (a command-layer failure) passes through unchanged.
fn as_lock_conflict(target: String, err: Error) -> Error {
    match err {
        Error::AgentFailure { verb, .. } if verb == "lock" => Error::LockConflict { target },
        other => other,
    }
}

fn activate_operation(interfaces: &HashMap<String, String>, manifest: &Manifest, key: &ServiceKey) -> crate::engine::Operation {
    match manifest.find(key) {
        Some(service) => activate_for(interfaces, service),
        None => no_op_operation(),
    }
}

fn deactivate_operation(interfaces: &HashMap<String, String>, manifest: Option<&Manifest>, key: &ServiceKey) -> crate::engine::Operation {
    match manifest.and_then(|m| m.find(key)) {
        Some(service) => deactivate_for(interfaces, service),
        None => no_op_operation(),
    }
}

fn activate_for(interfaces: &HashMap<String, String>, service: &ManifestService) -> crate::engine::Operation {
    let agent = AgentInterface::new(
        interfaces.get(service.target()).cloned().unwrap_or_default(),
        service.target().to_string(),
    );
    agent.activate(
        &service.key.container,
        &service.service_type,
        &service.arguments,
        &service.service_path,
    )
}

fn deactivate_for(interfaces: &HashMap<String, String>, service: &ManifestService) -> crate::engine::Operation {
    let agent = AgentInterface::new(
        interfaces.get(service.target()).cloned().unwrap_or_default(),
        service.target().to_string(),
    );
    agent.deactivate(
        &service.key.container,
        &service.service_type,
        &service.arguments,
        &service.service_path,
    )
}

fn no_op_operation() -> crate::engine::Operation {
    crate::engine::Operation::Detached(Box::new(|| Ok(())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigOverrides;
    use crate::model::{Infrastructure, ProfileMapping};

    fn registry_with_one_target() -> TargetRegistry {
        let xml = r#"<infrastructure>
            <target name="web1"><system>x86_64-linux</system><clientInterface>true</clientInterface><numOfCores>2</numOfCores>
                <properties><hostname>web1</hostname></properties></target>
        </infrastructure>"#;
        TargetRegistry::new(Infrastructure::from_xml(xml, "hostname").unwrap(), "hostname")
    }

    fn service(name: &str, path: &str) -> ManifestService {
        ManifestService {
            key: ServiceKey {
                target: "web1".to_string(),
                container: "process-manager".to_string(),
                name: name.to_string(),
            },
            service_path: path.to_string(),
            service_type: "process".to_string(),
            depends_on: Vec::new(),
            arguments: Vec::new(),
        }
    }

    #[test]
    fn happy_path_deploys_a_fresh_manifest() {
        let registry = registry_with_one_target();
        let mut coordinator = Coordinator::new(registry, 2);

        let new_manifest = Manifest {
            services: vec![service("webapp", "/nix/store/webapp")],
            profiles: vec![ProfileMapping {
                target: "web1".to_string(),
                profile: "default".to_string(),
                profile_path: "/nix/store/profile-web1".to_string(),
            }],
        };

        let config = Config::resolve(ConfigOverrides::default());
        let result = coordinator.deploy(&new_manifest, None, &config, || false);
        assert!(result.is_ok());
    }

    /// A tiny shell agent that exits non-zero only when invoked with the
    /// given verb as argv[1], and succeeds for every other verb — lets a
    /// single target fail at one specific stage without failing DISTRIBUTE.
    fn failing_verb_script(dir: &std::path::Path, verb_to_fail: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let script_path = dir.join(format!("fails-{verb_to_fail}.sh"));
        std::fs::write(
            &script_path,
            format!("#!/bin/sh\nif [ \"$1\" = \"{verb_to_fail}\" ]; then exit 1; else exit 0; fi\n"),
        )
        .unwrap();
        let mut perms = std::fs::metadata(&script_path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script_path, perms).unwrap();
        script_path
    }

    #[test]
    fn s5_partial_lock_failure_unlocks_the_locked_target_and_reports_lock_conflict() {
        // S5: LOCK of t2 fails after t1 locked; t1 must be unlocked, no
        // DEACTIVATE/ACTIVATE occurs, and the error names the refusing target.
        let tmp = tempfile::tempdir().unwrap();
        let failing_agent = failing_verb_script(tmp.path(), "lock");

        let xml = format!(
            r#"<infrastructure>
            <target name="t1"><system>x86_64-linux</system><clientInterface>true</clientInterface><numOfCores>1</numOfCores>
                <properties><hostname>t1</hostname></properties></target>
            <target name="t2"><system>x86_64-linux</system><clientInterface>{}</clientInterface><numOfCores>1</numOfCores>
                <properties><hostname>t2</hostname></properties></target>
        </infrastructure>"#,
            failing_agent.display()
        );
        let registry = TargetRegistry::new(Infrastructure::from_xml(&xml, "hostname").unwrap(), "hostname");
        let mut coordinator = Coordinator::new(registry, 2);

        let mut webapp = service("webapp", "/nix/store/webapp");
        webapp.key.target = "t1".to_string();
        let mut database = service("database", "/nix/store/database");
        database.key.target = "t2".to_string();

        let new_manifest = Manifest {
            services: vec![webapp, database],
            profiles: vec![
                ProfileMapping { target: "t1".to_string(), profile: "default".to_string(), profile_path: "/nix/store/profile-t1".to_string() },
                ProfileMapping { target: "t2".to_string(), profile: "default".to_string(), profile_path: "/nix/store/profile-t2".to_string() },
            ],
        };

        let config = Config::resolve(ConfigOverrides::default());
        let err = coordinator.deploy(&new_manifest, None, &config, || false).unwrap_err();
        assert!(matches!(err, Error::LockConflict { target } if target == "t2"));
    }

    /// A shell agent that appends every invocation's verb and last argv
    /// (the service path) to a shared log file, and fails only when both
    /// match `fail_verb`/`fail_service`. Lets a rollback test assert not
    /// just the final error but the exact sequence of agent calls.
    fn logging_agent_script(dir: &std::path::Path, log_path: &std::path::Path, fail_verb: &str, fail_service: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let script_path = dir.join("logging-agent.sh");
        std::fs::write(
            &script_path,
            format!(
                "#!/bin/sh\nverb=$1\nfor last; do :; done\necho \"$verb $last\" >> {log}\nif [ \"$verb\" = \"{fail_verb}\" ] && [ \"$last\" = \"{fail_service}\" ]; then exit 1; fi\nexit 0\n",
                log = log_path.display(),
            ),
        )
        .unwrap();
        let mut perms = std::fs::metadata(&script_path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script_path, perms).unwrap();
        script_path
    }

    #[test]
    fn s2_activate_failure_rolls_back_in_reverse_dependency_order() {
        // S2: A <- B, both on t1. Activating B fails: A (already activated
        // in this transaction) must be deactivated again; C-equivalent (B
        // itself) must never reach a successful activation.
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("calls.log");
        let agent = logging_agent_script(tmp.path(), &log_path, "activate", "/nix/store/b");

        let xml = format!(
            r#"<infrastructure>
            <target name="t1"><system>x86_64-linux</system><clientInterface>{}</clientInterface><numOfCores>1</numOfCores>
                <properties><hostname>t1</hostname></properties></target>
        </infrastructure>"#,
            agent.display()
        );
        let registry = TargetRegistry::new(Infrastructure::from_xml(&xml, "hostname").unwrap(), "hostname");
        let mut coordinator = Coordinator::new(registry, 2);

        let mut a = service("A", "/nix/store/a");
        let mut b = service("B", "/nix/store/b");
        b.depends_on.push(a.key.clone());
        a.key.target = "t1".to_string();
        b.key.target = "t1".to_string();

        let new_manifest = Manifest {
            services: vec![a, b],
            profiles: vec![ProfileMapping {
                target: "t1".to_string(),
                profile: "default".to_string(),
                profile_path: "/nix/store/profile-t1".to_string(),
            }],
        };

        let config = Config::resolve(ConfigOverrides::default());
        let err = coordinator.deploy(&new_manifest, None, &config, || false).unwrap_err();
        assert!(matches!(err, Error::AgentFailure { ref verb, .. } if verb == "activate"));

        let log = std::fs::read_to_string(&log_path).unwrap();
        let calls: Vec<&str> = log.lines().collect();
        assert!(calls.contains(&"activate /nix/store/a"), "A must have activated: {calls:?}");
        assert!(calls.contains(&"activate /nix/store/b"), "B's failed attempt must have run: {calls:?}");
        assert!(calls.contains(&"deactivate /nix/store/a"), "A must be rolled back: {calls:?}");

        let activate_a_at = calls.iter().position(|l| *l == "activate /nix/store/a").unwrap();
        let activate_b_at = calls.iter().position(|l| *l == "activate /nix/store/b").unwrap();
        let deactivate_a_at = calls.iter().position(|l| *l == "deactivate /nix/store/a").unwrap();
        assert!(activate_a_at < activate_b_at, "A activates before B per dependency order");
        assert!(deactivate_a_at > activate_b_at, "rollback happens only after the failed activation");
    }
}
