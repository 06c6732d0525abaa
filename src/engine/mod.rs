//! Bounded iteration engine (§4.D): runs a mapping `item -> operation` over a
//! sequence of items under a global concurrency cap and per-target core
//! reservations, collecting a per-item outcome.
//!
//! Grounded on `libdistderivation/derivationmapping.c`'s PID/future iterator
//! pair, collapsed into one generic driver (per the explicit design note in
//! this crate's specification: the two iterator flavours differ only in
//! whether the child process yields a bare exit code or a parsed string
//! result, which [`Operation`] expresses as two variants instead of two
//! near-duplicate iterator implementations).
//!
//! The original runs one coordinator thread that multiplexes child
//! completion through a single OS-level wait call. The standard library has
//! no portable equivalent of "wait for whichever of these already-spawned
//! children finishes first", so this engine reaches the same externally
//! observable behaviour — bounded fan-out, arbitrary completion order, one
//! place where concurrency state is mutated — with one short-lived thread
//! per in-flight operation reporting back over a channel to a single
//! dispatch loop. That loop is the only place `TargetRegistry` reservations
//! are acquired or released, so it plays the role of the coordinator thread.

use crate::errors::Error;
use crate::registry::TargetRegistry;
use std::sync::mpsc;
use std::thread;

mod report;

/// One capability invocation: either exit-code-only (`Detached`) or one that
/// yields a parsed string/list result (`Future`). The closures are produced
/// by `agent::ops` and run to completion on a worker thread.
pub enum Operation {
    Detached(Box<dyn FnOnce() -> Result<(), Error> + Send>),
    Future(Box<dyn FnOnce() -> Result<Vec<String>, Error> + Send>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    Detached,
    Future(Vec<String>),
}

fn run_operation(operation: Operation) -> Result<OperationOutcome, Error> {
    match operation {
        Operation::Detached(run) => run().map(|()| OperationOutcome::Detached),
        Operation::Future(run) => run().map(OperationOutcome::Future),
    }
}

pub struct IterationReport<T> {
    pub success: bool,
    pub results: Vec<(T, Result<OperationOutcome, Error>)>,
}

pub struct IterationEngine<'a> {
    registry: &'a mut TargetRegistry,
    global_cap: usize,
}

impl<'a> IterationEngine<'a> {
    pub fn new(registry: &'a mut TargetRegistry, global_cap: usize) -> IterationEngine<'a> {
        IterationEngine { registry, global_cap: global_cap.max(1) }
    }

    /// Runs `map_fn(item)` for every item, honoring the global cap and each
    /// item's target's per-target reservation, and cooperatively stopping
    /// new dispatch (while draining in-flight work) once `cancel_requested`
    /// returns true.
    pub fn run<T>(
        &mut self,
        items: Vec<T>,
        target_of: impl Fn(&T) -> String,
        map_fn: impl Fn(&T) -> Operation,
        cancel_requested: impl Fn() -> bool,
    ) -> IterationReport<T> {
        let (tx, rx) = mpsc::channel::<(usize, String, Result<OperationOutcome, Error>)>();
        let mut in_flight = 0usize;
        let mut cursor = 0usize;
        let mut outcomes: Vec<(usize, Result<OperationOutcome, Error>)> = Vec::with_capacity(items.len());

        while cursor < items.len() || in_flight > 0 {
            if cursor < items.len() && in_flight < self.global_cap && !cancel_requested() {
                let item = &items[cursor];
                let target_key = target_of(item);
                match self.registry.try_acquire(&target_key) {
                    Ok(true) => {
                        let operation = map_fn(item);
                        let tx = tx.clone();
                        let idx = cursor;
                        thread::spawn(move || {
                            let outcome = run_operation(operation);
                            let _ = tx.send((idx, target_key, outcome));
                        });
                        in_flight += 1;
                        cursor += 1;
                        continue;
                    }
                    Ok(false) => {
                        // Target fully booked; fall through and wait for any completion.
                    }
                    Err(err) => {
                        outcomes.push((cursor, Err(err)));
                        cursor += 1;
                        continue;
                    }
                }
            }

            if in_flight == 0 {
                // Dispatch is blocked (cap reached or cancellation) with nothing
                // in flight to wait on; stop rather than spin. Cancellation is
                // the only case that can reach here with items left at
                // `cursor..items.len()` (the cap alone never blocks forever,
                // since in-flight work keeps completing and freeing capacity) —
                // those items never ran, so they count as failures rather than
                // silently vanishing from the report.
                while cursor < items.len() {
                    let target = target_of(&items[cursor]);
                    outcomes.push((cursor, Err(Error::agent_failure("cancelled", target, -1))));
                    cursor += 1;
                }
                break;
            }

            let (idx, target_key, outcome) = rx
                .recv()
                .expect("a worker thread always sends before its sender is dropped");
            self.registry.release(&target_key);
            in_flight -= 1;
            outcomes.push((idx, outcome));
        }

        outcomes.sort_by_key(|(idx, _)| *idx);
        let success = outcomes.len() == items.len() && outcomes.iter().all(|(_, result)| result.is_ok());
        let results = items
            .into_iter()
            .zip(outcomes.into_iter().map(|(_, result)| result))
            .collect();

        IterationReport { success, results }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Infrastructure;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn registry_with_targets(specs: &[(&str, u32)]) -> TargetRegistry {
        let targets: String = specs
            .iter()
            .map(|(name, cores)| {
                format!(
                    r#"<target name="{name}">
                        <system>x86_64-linux</system>
                        <clientInterface>ssh-client</clientInterface>
                        <numOfCores>{cores}</numOfCores>
                        <properties><hostname>{name}</hostname></properties>
                    </target>"#
                )
            })
            .collect();
        let xml = format!("<infrastructure>{targets}</infrastructure>");
        let infra = Infrastructure::from_xml(&xml, "hostname").unwrap();
        TargetRegistry::new(infra, "hostname")
    }

    #[test]
    fn respects_per_target_and_global_caps() {
        // S1: 4 items across 2 targets with numOfCores=1 each, global cap 3.
        let mut registry = registry_with_targets(&[("t1", 1), ("t2", 1)]);
        let mut engine = IterationEngine::new(&mut registry, 3);

        let max_concurrent = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        let items = vec![
            ("t1".to_string(), "a".to_string()),
            ("t1".to_string(), "b".to_string()),
            ("t2".to_string(), "c".to_string()),
            ("t2".to_string(), "d".to_string()),
        ];

        let report = engine.run(
            items,
            |(target, _)| target.clone(),
            |(_, label)| {
                let max_concurrent = max_concurrent.clone();
                let current = current.clone();
                let label = label.clone();
                Operation::Future(Box::new(move || {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    max_concurrent.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(20));
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(vec![label])
                }))
            },
            || false,
        );

        assert!(report.success);
        assert_eq!(report.results.len(), 4);
        assert!(max_concurrent.load(Ordering::SeqCst) <= 2);
        for (_, outcome) in &report.results {
            assert!(outcome.is_ok());
        }
    }

    #[test]
    fn reports_failure_without_leaking_reservations() {
        let mut registry = registry_with_targets(&[("t1", 2)]);
        let mut engine = IterationEngine::new(&mut registry, 2);

        let items = vec!["ok".to_string(), "boom".to_string()];
        let report = engine.run(
            items,
            |_| "t1".to_string(),
            |item| {
                let item = item.clone();
                Operation::Detached(Box::new(move || {
                    if item == "boom" {
                        Err(Error::agent_failure("activate", "t1", 1))
                    } else {
                        Ok(())
                    }
                }))
            },
            || false,
        );

        assert!(!report.success);
        assert_eq!(registry.find("t1").unwrap().available_cores, 2);
    }

    #[test]
    fn cancellation_fails_undispatched_items_instead_of_dropping_them() {
        // numOfCores=1 forces "b" and "c" to wait behind "a"; cancel fires
        // while "a" is still in flight, so "b" and "c" never dispatch.
        let mut registry = registry_with_targets(&[("t1", 1)]);
        let mut engine = IterationEngine::new(&mut registry, 3);

        let cancelled = Arc::new(AtomicUsize::new(0));
        let items = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let cancelled_for_closure = cancelled.clone();
        let report = engine.run(
            items,
            |_| "t1".to_string(),
            move |item| {
                let item = item.clone();
                let cancelled = cancelled_for_closure.clone();
                Operation::Detached(Box::new(move || {
                    if item == "a" {
                        std::thread::sleep(std::time::Duration::from_millis(30));
                    }
                    cancelled.store(1, Ordering::SeqCst);
                    Ok(())
                }))
            },
            move || cancelled.load(Ordering::SeqCst) == 0,
        );

        assert!(!report.success);
        assert_eq!(report.results.len(), 3);
        let failures: Vec<&str> = report
            .results
            .iter()
            .filter(|(_, result)| result.is_err())
            .map(|(item, _)| item.as_str())
            .collect();
        assert!(failures.contains(&"b") || failures.contains(&"c"), "un-dispatched items must be reported as failures: {failures:?}");
    }
}
