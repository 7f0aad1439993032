//! The module contract and the module table.
//!
//! An analysis module is a named implementation of [`ScanModule`] registered
//! at build time; dispatch references modules by name and looks them up here.
//! This replaces runtime code loading with a registry while keeping modules
//! hot-pluggable at the configuration level.

use crate::metadata::MetaValue;
use crate::object::{ExternalVars, ScanObject};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Why a module invocation failed. These never abort a scan; the runtime
/// folds them into flags and failure metadata on the object.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("{0}")]
    Failed(String),

    #[error("invalid options: {0}")]
    BadOptions(String),
}

impl ModuleError {
    pub fn failed<S: Into<String>>(message: S) -> Self {
        Self::Failed(message.into())
    }

    pub fn bad_options<S: Into<String>>(message: S) -> Self {
        Self::BadOptions(message.into())
    }
}

/// Everything a module gets to see for one invocation: a snapshot of the
/// object under scan, the submission envelope, and the merged option map.
#[derive(Debug, Clone)]
pub struct ModuleRequest {
    pub object: ScanObject,
    /// Read-only snapshots of the ancestor chain, root first. Findings
    /// recorded upstream are observable here without touching the live tree.
    pub ancestors: Arc<Vec<ScanObject>>,
    pub external: Arc<ExternalVars>,
    pub depth: usize,
    pub options: FxHashMap<String, String>,
}

impl ModuleRequest {
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn root(&self) -> &ScanObject {
        self.ancestors.first().unwrap_or(&self.object)
    }

    pub fn parent(&self) -> Option<&ScanObject> {
        self.ancestors.last()
    }
}

/// A child artifact emitted by a module, before the runtime turns it into a
/// full scan object.
#[derive(Debug, Clone)]
pub struct ModuleObject {
    pub buffer: Vec<u8>,
    pub filename: Option<String>,
    pub content_type: Option<String>,
}

impl ModuleObject {
    #[must_use]
    pub fn new(buffer: Vec<u8>) -> Self {
        Self { buffer, filename: None, content_type: None }
    }

    #[must_use]
    pub fn with_filename<S: Into<String>>(mut self, filename: S) -> Self {
        self.filename = Some(filename.into());
        self
    }

    #[must_use]
    pub fn with_content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// What a module hands back. Nothing in here touches the tree until the
/// runtime commits it, so a timed-out or failed module leaves no trace.
#[derive(Debug, Clone, Default)]
pub struct ModuleReply {
    pub children: Vec<ModuleObject>,
    pub flags: Vec<String>,
    pub metadata: Vec<(String, MetaValue)>,
}

impl ModuleReply {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_child(&mut self, child: ModuleObject) {
        self.children.push(child);
    }

    pub fn add_flag<S: Into<String>>(&mut self, flag: S) {
        self.flags.push(flag.into());
    }

    pub fn add_metadata<S: Into<String>, V: Into<MetaValue>>(&mut self, field: S, value: V) {
        self.metadata.push((field.into(), value.into()));
    }
}

/// One analysis routine. Implementations must be pure with respect to the
/// wider tree: they observe the request, they return a reply, and they never
/// start background work that outlives the call.
pub trait ScanModule: Send + Sync {
    /// Registry name, referenced by dispatch actions (e.g. `META_HASH`).
    fn name(&self) -> &'static str;

    fn run(&self, request: &ModuleRequest) -> Result<ModuleReply, ModuleError>;
}

/// Static per-module configuration held alongside the implementation.
#[derive(Clone)]
pub struct ModuleEntry {
    pub module: Arc<dyn ScanModule>,
    /// Dispatch ordering weight; lower runs earlier. Default 9.
    pub priority: i32,
    pub enabled: bool,
    pub default_options: FxHashMap<String, String>,
    /// Per-module override of the engine-wide module_time budget.
    pub timeout: Option<Duration>,
}

impl std::fmt::Debug for ModuleEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleEntry")
            .field("name", &self.module.name())
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .finish()
    }
}

pub const DEFAULT_MODULE_PRIORITY: i32 = 9;

/// The module table: name → implementation plus static defaults.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    entries: FxHashMap<String, ModuleEntry>,
}

impl ModuleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module under its own name with default settings.
    pub fn register<M: ScanModule + 'static>(&mut self, module: M) {
        self.register_entry(ModuleEntry {
            module: Arc::new(module),
            priority: DEFAULT_MODULE_PRIORITY,
            enabled: true,
            default_options: FxHashMap::default(),
            timeout: None,
        });
    }

    /// Register a module with explicit static settings.
    pub fn register_entry(&mut self, entry: ModuleEntry) {
        self.entries.insert(entry.module.name().to_string(), entry);
    }

    pub fn get(&self, name: &str) -> Option<&ModuleEntry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::HashMethod;

    struct Echo;

    impl ScanModule for Echo {
        fn name(&self) -> &'static str {
            "ECHO"
        }

        fn run(&self, request: &ModuleRequest) -> Result<ModuleReply, ModuleError> {
            let mut reply = ModuleReply::new();
            reply.add_flag("echo:ran");
            reply.add_metadata("size", request.object.object_size);
            Ok(reply)
        }
    }

    fn request_for(data: &[u8]) -> ModuleRequest {
        let external = Arc::new(ExternalVars::default());
        ModuleRequest {
            object: ScanObject::root(data.to_vec(), &external, HashMethod::Md5),
            ancestors: Arc::new(Vec::new()),
            external,
            depth: 0,
            options: FxHashMap::default(),
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ModuleRegistry::new();
        registry.register(Echo);
        assert!(registry.contains("ECHO"));
        assert!(!registry.contains("MISSING"));
        let entry = registry.get("ECHO").unwrap();
        assert_eq!(entry.priority, DEFAULT_MODULE_PRIORITY);
        assert!(entry.enabled);
    }

    #[test]
    fn test_module_runs_against_request() {
        let mut registry = ModuleRegistry::new();
        registry.register(Echo);
        let reply = registry
            .get("ECHO")
            .unwrap()
            .module
            .run(&request_for(b"four"))
            .unwrap();
        assert_eq!(reply.flags, vec!["echo:ran"]);
        assert_eq!(reply.metadata[0], ("size".to_string(), MetaValue::Int(4)));
    }

    #[test]
    fn test_registry_names_sorted() {
        let mut registry = ModuleRegistry::new();
        registry.register(Echo);
        assert_eq!(registry.names(), vec!["ECHO"]);
    }
}
