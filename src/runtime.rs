//! Module execution: budgets, preemption, commit.
//!
//! Each (object, module) invocation runs on its own worker thread while the
//! runtime waits with a deadline. A module that refuses to yield is abandoned
//! there — its reply lands in a dropped channel — so partial output from a
//! timed-out or failed module never reaches the tree. Whatever the outcome,
//! the wider engine stays consistent: commits happen only from a completed
//! reply, in this thread.

use crate::config::ResourceLimits;
use crate::dispatch::PlannedModule;
use crate::metadata::MetaValue;
use crate::object::{ExternalVars, HashMethod, ScanObject, SCAN_FAILURES};
use crate::registry::{ModuleEntry, ModuleError, ModuleReply, ModuleRequest, ScanModule};
use rustc_hash::FxHashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Per-scan accounting, owned by the driver and lent to the runtime.
#[derive(Debug)]
pub(crate) struct ScanState {
    pub deadline: Instant,
    /// Objects accepted into the scan so far, root included.
    pub objects_total: usize,
    /// Stored buffer bytes accepted so far.
    pub bytes_total: u64,
    pub aborted: bool,
    /// Tree-level cap flags, flushed onto the root by the driver.
    pub root_flags: Vec<String>,
}

impl ScanState {
    pub fn new(limits: &ResourceLimits, root_size: u64) -> Self {
        Self {
            deadline: Instant::now() + limits.scan_time,
            objects_total: 1,
            bytes_total: root_size,
            aborted: false,
            root_flags: Vec::new(),
        }
    }

    pub fn out_of_time(&self) -> bool {
        Instant::now() >= self.deadline
    }

    fn add_root_flag(&mut self, flag: &str) {
        if !self.root_flags.iter().any(|f| f == flag) {
            self.root_flags.push(flag.to_string());
        }
    }
}

enum ModuleOutcome {
    Completed(ModuleReply),
    TimedOut,
    Failed(ModuleError),
    /// The worker died without replying; in practice the module panicked.
    Died,
}

/// Run one module against one object and commit what it produced.
///
/// Returns the accepted children, ready for the driver to enqueue. Module
/// faults are folded into flags and failure metadata; nothing here aborts
/// the scan.
pub(crate) fn execute_module(
    object: &mut ScanObject,
    planned: &PlannedModule,
    entry: &ModuleEntry,
    ancestors: &Arc<Vec<ScanObject>>,
    external: &Arc<ExternalVars>,
    limits: &ResourceLimits,
    state: &mut ScanState,
    hash_method: HashMethod,
) -> Vec<ScanObject> {
    let name = entry.module.name();
    let budget = planned.timeout.unwrap_or(limits.module_time);
    debug!(module = name, depth = object.depth, "Running module");

    let request = ModuleRequest {
        object: object.clone(),
        ancestors: Arc::clone(ancestors),
        external: Arc::clone(external),
        depth: object.depth,
        options: planned.options.clone(),
    };

    match invoke(Arc::clone(&entry.module), request, budget) {
        ModuleOutcome::Completed(reply) => {
            let children = commit_reply(object, name, reply, limits, state, hash_method);
            object.record_module_run(name);
            children
        }
        ModuleOutcome::TimedOut => {
            warn!(module = name, "Module exceeded its time budget, output discarded");
            object.add_flag(format!("MODULE:TIMEOUT:{}", name));
            object.record_module_run(name);
            Vec::new()
        }
        ModuleOutcome::Failed(ModuleError::BadOptions(message)) => {
            warn!(module = name, %message, "Module rejected dispatch options");
            object.add_flag(format!("DISPATCH:BAD_OPTIONS:{}", name));
            Vec::new()
        }
        ModuleOutcome::Failed(ModuleError::Failed(message)) => {
            record_failure(object, name, &message);
            Vec::new()
        }
        ModuleOutcome::Died => {
            record_failure(object, name, "module panicked");
            Vec::new()
        }
    }
}

/// Run the module on a worker thread and wait out the budget.
fn invoke(
    module: Arc<dyn ScanModule>,
    request: ModuleRequest,
    budget: Duration,
) -> ModuleOutcome {
    let (tx, rx) = mpsc::channel();
    let spawned = std::thread::Builder::new()
        .name(format!("module-{}", module.name()))
        .spawn(move || {
            let _ = tx.send(module.run(&request));
        });
    if let Err(e) = spawned {
        return ModuleOutcome::Failed(ModuleError::failed(format!(
            "failed to spawn module worker: {}",
            e
        )));
    }

    match rx.recv_timeout(budget) {
        Ok(Ok(reply)) => ModuleOutcome::Completed(reply),
        Ok(Err(error)) => ModuleOutcome::Failed(error),
        Err(mpsc::RecvTimeoutError::Timeout) => ModuleOutcome::TimedOut,
        Err(mpsc::RecvTimeoutError::Disconnected) => ModuleOutcome::Died,
    }
}

fn record_failure(object: &mut ScanObject, module: &str, message: &str) {
    warn!(module, %message, "Module failed");
    object.add_flag(format!("MODULE:ERROR:{}", module));

    let mut entry = FxHashMap::default();
    entry.insert("module".to_string(), MetaValue::String(module.to_string()));
    entry.insert("error".to_string(), MetaValue::String(message.to_string()));
    entry.insert(
        "traceback".to_string(),
        MetaValue::String(format!("module {} aborted: {}", module, message)),
    );
    let entry = MetaValue::Map(entry);

    // Failure records always read as a list, even with a single entry.
    if object.get_metadata(SCAN_FAILURES, "failures").is_none() {
        object.add_metadata(SCAN_FAILURES, "failures", MetaValue::List(vec![entry]));
    } else {
        object.add_metadata(SCAN_FAILURES, "failures", entry);
    }
    object.record_module_run(module);
}

/// Commit a completed reply: flags, metadata, then children under the caps.
fn commit_reply(
    object: &mut ScanObject,
    module: &str,
    reply: ModuleReply,
    limits: &ResourceLimits,
    state: &mut ScanState,
    hash_method: HashMethod,
) -> Vec<ScanObject> {
    for flag in reply.flags {
        object.add_flag(flag);
    }
    for (field, value) in reply.metadata {
        object.add_metadata(module, field, value);
    }

    let mut accepted = Vec::new();
    for (index, child) in reply.children.into_iter().enumerate() {
        if state.out_of_time() {
            state.aborted = true;
            break;
        }
        if index >= limits.max_module_children {
            object.add_flag(format!("MODULE:CHILD_LIMIT:{}", module));
            break;
        }
        let size = child.buffer.len() as u64;
        if size > limits.max_child_size {
            state.add_root_flag("SCAN:MAX_CHILD_SIZE");
            continue;
        }
        if object.depth + 1 > limits.max_depth {
            state.add_root_flag("SCAN:MAX_DEPTH");
            continue;
        }
        if state.objects_total + 1 > limits.max_objects {
            state.add_root_flag("SCAN:MAX_OBJECTS");
            continue;
        }
        if state.bytes_total + size > limits.max_bytes {
            state.add_root_flag("SCAN:MAX_BYTES");
            continue;
        }

        let mut child_object = ScanObject::child(object, child.buffer, module, hash_method);
        child_object.filename = child.filename.or_else(|| object.filename.clone());
        if let Some(content_type) = child.content_type {
            child_object.content_type.push(content_type);
        }
        state.objects_total += 1;
        state.bytes_total += size;
        accepted.push(child_object);
    }
    accepted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ModuleObject, ModuleRegistry};

    struct Sleepy(Duration);

    impl ScanModule for Sleepy {
        fn name(&self) -> &'static str {
            "SLEEPY"
        }

        fn run(&self, _request: &ModuleRequest) -> Result<ModuleReply, ModuleError> {
            std::thread::sleep(self.0);
            let mut reply = ModuleReply::new();
            reply.add_flag("sleepy:woke");
            Ok(reply)
        }
    }

    struct Faulty;

    impl ScanModule for Faulty {
        fn name(&self) -> &'static str {
            "FAULTY"
        }

        fn run(&self, _request: &ModuleRequest) -> Result<ModuleReply, ModuleError> {
            Err(ModuleError::failed("boom at offset 0"))
        }
    }

    struct Panicky;

    impl ScanModule for Panicky {
        fn name(&self) -> &'static str {
            "PANICKY"
        }

        fn run(&self, _request: &ModuleRequest) -> Result<ModuleReply, ModuleError> {
            panic!("unreachable state");
        }
    }

    struct Spawner(usize);

    impl ScanModule for Spawner {
        fn name(&self) -> &'static str {
            "SPAWNER"
        }

        fn run(&self, _request: &ModuleRequest) -> Result<ModuleReply, ModuleError> {
            let mut reply = ModuleReply::new();
            for i in 0..self.0 {
                reply.add_child(ModuleObject::new(vec![b'c'; 4]).with_filename(format!("part{}", i)));
            }
            Ok(reply)
        }
    }

    fn harness<M: ScanModule + 'static>(
        module: M,
        limits: ResourceLimits,
    ) -> (ScanObject, PlannedModule, ModuleEntry, Arc<ExternalVars>, ScanState, ResourceLimits)
    {
        let external = Arc::new(ExternalVars::default());
        let object = ScanObject::root(b"payload".to_vec(), &external, HashMethod::Md5);
        let state = ScanState::new(&limits, object.object_size);
        let mut registry = ModuleRegistry::new();
        registry.register(module);
        let name = registry.names()[0].clone();
        let entry = registry.get(&name).unwrap().clone();
        let planned = PlannedModule {
            name,
            options: FxHashMap::default(),
            priority: 9,
            timeout: None,
        };
        (object, planned, entry, external, state, limits)
    }

    #[test]
    fn test_timeout_discards_output() {
        let limits = ResourceLimits {
            module_time: Duration::from_millis(50),
            ..Default::default()
        };
        let (mut object, planned, entry, external, mut state, limits) =
            harness(Sleepy(Duration::from_secs(5)), limits);
        let children =
            execute_module(&mut object, &planned, &entry, &Arc::new(Vec::new()), &external, &limits, &mut state, HashMethod::Md5);
        assert!(children.is_empty());
        assert!(object.has_flag("MODULE:TIMEOUT:SLEEPY"));
        assert!(!object.has_flag("sleepy:woke"));
        assert_eq!(object.scan_modules, vec!["SLEEPY"]);
    }

    #[test]
    fn test_error_records_failure_metadata() {
        let (mut object, planned, entry, external, mut state, limits) =
            harness(Faulty, ResourceLimits::default());
        execute_module(&mut object, &planned, &entry, &Arc::new(Vec::new()), &external, &limits, &mut state, HashMethod::Md5);
        assert!(object.has_flag("MODULE:ERROR:FAULTY"));
        match object.get_metadata(SCAN_FAILURES, "failures").unwrap() {
            MetaValue::List(entries) => {
                assert_eq!(entries.len(), 1);
                match &entries[0] {
                    MetaValue::Map(map) => {
                        assert_eq!(map["module"], MetaValue::String("FAULTY".into()));
                        assert_eq!(map["error"], MetaValue::String("boom at offset 0".into()));
                        assert!(map.contains_key("traceback"));
                    }
                    other => panic!("expected map entry, got {:?}", other),
                }
            }
            other => panic!("expected failure list, got {:?}", other),
        }
    }

    #[test]
    fn test_panic_is_contained() {
        let (mut object, planned, entry, external, mut state, limits) =
            harness(Panicky, ResourceLimits::default());
        let children =
            execute_module(&mut object, &planned, &entry, &Arc::new(Vec::new()), &external, &limits, &mut state, HashMethod::Md5);
        assert!(children.is_empty());
        assert!(object.has_flag("MODULE:ERROR:PANICKY"));
    }

    #[test]
    fn test_child_limit_flags_and_truncates() {
        let limits = ResourceLimits { max_module_children: 3, ..Default::default() };
        let (mut object, planned, entry, external, mut state, limits) =
            harness(Spawner(10), limits);
        let children =
            execute_module(&mut object, &planned, &entry, &Arc::new(Vec::new()), &external, &limits, &mut state, HashMethod::Md5);
        assert_eq!(children.len(), 3);
        assert!(object.has_flag("MODULE:CHILD_LIMIT:SPAWNER"));
    }

    #[test]
    fn test_oversized_child_dropped() {
        let limits = ResourceLimits { max_child_size: 2, ..Default::default() };
        let (mut object, planned, entry, external, mut state, limits) =
            harness(Spawner(1), limits);
        let children =
            execute_module(&mut object, &planned, &entry, &Arc::new(Vec::new()), &external, &limits, &mut state, HashMethod::Md5);
        assert!(children.is_empty());
        assert!(state.root_flags.contains(&"SCAN:MAX_CHILD_SIZE".to_string()));
    }

    #[test]
    fn test_object_cap_stops_acceptance() {
        let limits = ResourceLimits { max_objects: 2, ..Default::default() };
        let (mut object, planned, entry, external, mut state, limits) =
            harness(Spawner(5), limits);
        let children =
            execute_module(&mut object, &planned, &entry, &Arc::new(Vec::new()), &external, &limits, &mut state, HashMethod::Md5);
        assert_eq!(children.len(), 1);
        assert!(state.root_flags.contains(&"SCAN:MAX_OBJECTS".to_string()));
        assert_eq!(state.objects_total, 2);
    }

    #[test]
    fn test_children_inherit_parent_filename_when_unnamed() {
        struct Anon;
        impl ScanModule for Anon {
            fn name(&self) -> &'static str {
                "ANON"
            }
            fn run(&self, _request: &ModuleRequest) -> Result<ModuleReply, ModuleError> {
                let mut reply = ModuleReply::new();
                reply.add_child(ModuleObject::new(b"inner".to_vec()));
                Ok(reply)
            }
        }
        let (mut object, planned, entry, external, mut state, limits) =
            harness(Anon, ResourceLimits::default());
        object.filename = Some("outer.bin".to_string());
        let children =
            execute_module(&mut object, &planned, &entry, &Arc::new(Vec::new()), &external, &limits, &mut state, HashMethod::Md5);
        assert_eq!(children[0].filename.as_deref(), Some("outer.bin"));
        assert_eq!(children[0].source_module.as_deref(), Some("ANON"));
        assert_eq!(children[0].depth, 1);
    }
}
