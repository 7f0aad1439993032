//! The scan driver: seeding, recursion, termination, output shaping.
//!
//! One engine, many scans: the compiled rule sets, the action tables and the
//! module table are built once and shared read-only. Each `scan` call owns
//! its entire object tree, so no locking is involved anywhere below here.

use crate::config::{QueueOrder, ScanConfig};
use crate::dispatch::{DispatchTable, Dispatcher};
use crate::disposition::Dispositioner;
use crate::error::Result;
use crate::object::{ExternalVars, ScanObject};
use crate::registry::ModuleRegistry;
use crate::result::{ScanResult, Verbosity};
use crate::rules::RuleSet;
use crate::runtime::{execute_module, ScanState};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};

/// The assembled scanning engine.
///
/// Construction is where configuration faults surface: rule compilation,
/// action-table parsing and cross-reference validation all happen before the
/// first scan. After that the engine is immutable and scans are pure
/// functions of their input.
pub struct ScanEngine {
    dispatcher: Dispatcher,
    dispositioner: Dispositioner,
    registry: ModuleRegistry,
    config: ScanConfig,
}

impl ScanEngine {
    /// Build an engine from pre-compiled parts, validating every
    /// cross-reference. Fails rather than starting with a bad table.
    pub fn new(
        config: ScanConfig,
        registry: ModuleRegistry,
        dispatch_rules: RuleSet,
        dispatch_table: DispatchTable,
        dispositioner: Dispositioner,
    ) -> Result<Self> {
        config.validate()?;
        let dispatcher = Dispatcher::new(dispatch_rules, dispatch_table);
        dispatcher.validate(&registry)?;
        dispositioner.validate()?;
        info!(modules = registry.len(), "Scan engine ready");
        Ok(Self { dispatcher, dispositioner, registry, config })
    }

    /// An engine with no dispatch rules: everything takes the `default`
    /// action and every verdict is the configured default.
    pub fn with_defaults(config: ScanConfig, registry: ModuleRegistry) -> Result<Self> {
        Self::new(
            config,
            registry,
            RuleSet::empty(),
            DispatchTable::builtin_default(),
            Dispositioner::accept_all(),
        )
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// Scan a buffer to completion and return the result tree.
    ///
    /// Module faults are data on the result, never errors here; only a
    /// framework-internal fault surfaces as `Err`.
    pub fn scan(
        &self,
        buffer: Vec<u8>,
        external: &ExternalVars,
        verbosity: Verbosity,
    ) -> Result<ScanResult> {
        let mut external = external.clone();
        if external.rescan.is_empty() {
            external.rescan = self.config.rescan_modules.clone();
        }
        let external = Arc::new(external);

        let start_time = Utc::now().timestamp_millis() as f64 / 1000.0;
        let root = ScanObject::root(buffer, &external, self.config.object_hash_method);
        debug!(uuid = %root.uuid, size = root.object_size, "Seeding scan");

        let mut state = ScanState::new(&self.config.limits, root.object_size);
        let mut result = ScanResult::new(external.source.clone(), verbosity, start_time, root);

        let mut queue: VecDeque<usize> = VecDeque::new();
        queue.push_back(0);

        'drain: while let Some(idx) = queue.pop_front() {
            if state.out_of_time() {
                state.aborted = true;
                break 'drain;
            }

            let planned = {
                let object = result.object_at_mut(idx);
                self.dispatcher
                    .dispatch(object, &external, &self.registry, &self.config)?
            };

            // Ancestors are final by the time a child is processed; modules
            // read upstream findings through these snapshots.
            let ancestors = Arc::new(ancestor_chain(&result, idx));

            let mut pending_children: Vec<ScanObject> = Vec::new();
            for module in &planned {
                if state.out_of_time() {
                    state.aborted = true;
                    break 'drain;
                }
                // Dispatch validated the name; a table built without
                // validation already got its flag there.
                let Some(entry) = self.registry.get(&module.name) else {
                    continue;
                };
                let children = execute_module(
                    result.object_at_mut(idx),
                    module,
                    entry,
                    &ancestors,
                    &external,
                    &self.config.limits,
                    &mut state,
                    self.config.object_hash_method,
                );
                pending_children.extend(children);
            }

            self.flush_root_flags(&mut result, &mut state);

            // Children dispatch only after every module on the parent ran.
            match self.config.queue_order {
                QueueOrder::Bfs => {
                    for child in pending_children {
                        let child_idx = result.push(child);
                        queue.push_back(child_idx);
                    }
                }
                QueueOrder::Dfs => {
                    for child in pending_children.into_iter().rev() {
                        let child_idx = result.push(child);
                        queue.push_front(child_idx);
                    }
                }
            }

            if state.aborted {
                break 'drain;
            }
        }

        if state.aborted {
            queue.clear();
            result.root_mut().add_flag("SCAN:ABORTED");
        }
        self.flush_root_flags(&mut result, &mut state);

        self.dispositioner.dispose(&mut result, &external, &self.config);

        info!(
            objects = result.len(),
            disposition = %result.disposition,
            "Scan complete"
        );
        Ok(result)
    }

    fn flush_root_flags(&self, result: &mut ScanResult, state: &mut ScanState) {
        for flag in state.root_flags.drain(..) {
            result.root_mut().add_flag(flag);
        }
    }
}

/// Snapshots of the object's ancestors, root first.
fn ancestor_chain(result: &ScanResult, idx: usize) -> Vec<ScanObject> {
    let mut chain = Vec::new();
    let mut current = result.object_at(idx).parent_uuid;
    while let Some(uuid) = current {
        match result.get(&uuid) {
            Some(parent) => {
                current = parent.parent_uuid;
                chain.push(parent.clone());
            }
            None => break,
        }
    }
    chain.reverse();
    chain
}
