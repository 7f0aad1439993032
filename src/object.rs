//! The scan object model.
//!
//! Every artifact seen during a scan — the submitted buffer and every nested
//! artifact a module digs out of it — is a [`ScanObject`]: an immutable byte
//! buffer plus the findings accumulated against it. Objects reference their
//! parent by uuid, never by owning pointer; the driver keeps the tree as an
//! arena inside [`crate::result::ScanResult`].

use crate::metadata::MetaValue;
use chrono::{DateTime, Utc};
use md5::Md5;
use rustc_hash::{FxHashMap, FxHashSet};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::sync::Arc;
use uuid::Uuid;

/// Metadata namespace the runtime appends module failure records to.
pub const SCAN_FAILURES: &str = "SCAN_FAILURES";

/// Hash algorithm used for `object_hash`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashMethod {
    /// The original engine's default; kept for result compatibility.
    #[default]
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl HashMethod {
    pub fn digest(&self, data: &[u8]) -> String {
        fn hex<D: Digest>(data: &[u8]) -> String {
            let mut hasher = D::new();
            hasher.update(data);
            hasher
                .finalize()
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect()
        }
        match self {
            HashMethod::Md5 => hex::<Md5>(data),
            HashMethod::Sha1 => hex::<Sha1>(data),
            HashMethod::Sha256 => hex::<Sha256>(data),
            HashMethod::Sha512 => hex::<Sha512>(data),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "md5" => Some(HashMethod::Md5),
            "sha1" => Some(HashMethod::Sha1),
            "sha256" => Some(HashMethod::Sha256),
            "sha512" => Some(HashMethod::Sha512),
            _ => None,
        }
    }
}

/// The immutable submission envelope.
///
/// Attached to a submission once and propagated unchanged to every child
/// object within the scan.
#[derive(Debug, Clone)]
pub struct ExternalVars {
    /// Free-form origin tag ("email-gateway", "s3-drop", ...).
    pub source: String,
    /// Correlation id across a conversation of submissions.
    pub eph_id: String,
    /// Unique id for this call.
    pub submit_id: String,
    pub ext_source_tags: Vec<String>,
    pub ext_metadata: FxHashMap<String, String>,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Module names that may run again on descendants of an object that
    /// already ran them.
    pub rescan: Vec<String>,
}

impl Default for ExternalVars {
    fn default() -> Self {
        Self {
            source: String::new(),
            eph_id: String::new(),
            submit_id: String::new(),
            ext_source_tags: Vec::new(),
            ext_metadata: FxHashMap::default(),
            filename: None,
            content_type: None,
            timestamp: Utc::now(),
            rescan: Vec::new(),
        }
    }
}

impl ExternalVars {
    #[must_use]
    pub fn new<S: Into<String>>(source: S) -> Self {
        Self { source: source.into(), ..Self::default() }
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

    #[must_use]
    pub fn with_submit_id<S: Into<String>>(mut self, submit_id: S) -> Self {
        self.submit_id = submit_id.into();
        self
    }

    #[must_use]
    pub fn with_rescan(mut self, modules: Vec<String>) -> Self {
        self.rescan = modules;
        self
    }

    /// True if `module` is allowed to re-run on descendants.
    pub fn allows_rescan(&self, module: &str) -> bool {
        self.rescan.iter().any(|m| m == module)
    }
}

/// One node of the scan tree: a buffer plus its accumulated findings.
#[derive(Debug, Clone)]
pub struct ScanObject {
    /// Raw content. Read-only after construction; shared with module worker
    /// threads, hence the `Arc`.
    pub buffer: Arc<[u8]>,
    pub uuid: Uuid,
    pub parent_uuid: Option<Uuid>,
    pub root_uuid: Uuid,
    pub depth: usize,
    pub filename: Option<String>,
    pub object_hash: String,
    pub object_size: u64,
    /// Names of the dispatch rules that matched this object.
    pub object_type: Vec<String>,
    /// Ordered set; appends are idempotent, nothing ever removes a flag.
    pub flags: Vec<String>,
    pub metadata: FxHashMap<String, FxHashMap<String, MetaValue>>,
    /// Modules actually executed against this object, in run order.
    pub scan_modules: Vec<String>,
    pub content_type: Vec<String>,
    /// Module that produced this object; None for the root.
    pub source_module: Option<String>,
    /// Modules that ran on any ancestor, used by dispatch to honor the
    /// rescan list. Not serialized.
    pub(crate) ancestor_modules: FxHashSet<String>,
}

impl ScanObject {
    /// Construct the root object of a scan.
    #[must_use]
    pub fn root(buffer: Vec<u8>, external: &ExternalVars, hash_method: HashMethod) -> Self {
        let uuid = Uuid::new_v4();
        let object_hash = hash_method.digest(&buffer);
        let object_size = buffer.len() as u64;
        Self {
            buffer: Arc::from(buffer.into_boxed_slice()),
            uuid,
            parent_uuid: None,
            root_uuid: uuid,
            depth: 0,
            filename: external.filename.clone(),
            object_hash,
            object_size,
            object_type: Vec::new(),
            flags: Vec::new(),
            metadata: FxHashMap::default(),
            scan_modules: Vec::new(),
            content_type: external.content_type.iter().cloned().collect(),
            source_module: None,
            ancestor_modules: FxHashSet::default(),
        }
    }

    /// Construct a child of `parent`: inherits the root uuid, sits one level
    /// deeper, and remembers the module that produced it.
    #[must_use]
    pub fn child(
        parent: &ScanObject,
        buffer: Vec<u8>,
        source_module: &str,
        hash_method: HashMethod,
    ) -> Self {
        let object_hash = hash_method.digest(&buffer);
        let object_size = buffer.len() as u64;
        let mut ancestor_modules = parent.ancestor_modules.clone();
        ancestor_modules.extend(parent.scan_modules.iter().cloned());
        Self {
            buffer: Arc::from(buffer.into_boxed_slice()),
            uuid: Uuid::new_v4(),
            parent_uuid: Some(parent.uuid),
            root_uuid: parent.root_uuid,
            depth: parent.depth + 1,
            filename: None,
            object_hash,
            object_size,
            object_type: Vec::new(),
            flags: Vec::new(),
            metadata: FxHashMap::default(),
            scan_modules: Vec::new(),
            content_type: Vec::new(),
            source_module: Some(source_module.to_string()),
            ancestor_modules,
        }
    }

    /// Add a flag. Idempotent: adding an existing flag is a no-op.
    pub fn add_flag<S: Into<String>>(&mut self, flag: S) {
        let flag = flag.into();
        if !self.flags.contains(&flag) {
            self.flags.push(flag);
        }
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    /// Record a metadata value under `module`'s namespace. A second write to
    /// the same field promotes the value to a list and appends.
    pub fn add_metadata<S: Into<String>, V: Into<MetaValue>>(
        &mut self,
        module: &str,
        field: S,
        value: V,
    ) {
        let namespace = self.metadata.entry(module.to_string()).or_default();
        match namespace.entry(field.into()) {
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                slot.get_mut().append(value.into());
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(value.into());
            }
        }
    }

    /// Like [`add_metadata`](Self::add_metadata) but skips values that are
    /// already present under the field.
    pub fn add_metadata_unique<S: Into<String>, V: Into<MetaValue>>(
        &mut self,
        module: &str,
        field: S,
        value: V,
    ) {
        let field = field.into();
        let value = value.into();
        if let Some(existing) = self.metadata.get(module).and_then(|ns| ns.get(&field)) {
            if existing.contains(&value) {
                return;
            }
        }
        self.add_metadata(module, field, value);
    }

    pub fn get_metadata(&self, module: &str, field: &str) -> Option<&MetaValue> {
        self.metadata.get(module).and_then(|ns| ns.get(field))
    }

    /// Record that `module` executed against this object.
    pub fn record_module_run(&mut self, module: &str) {
        self.scan_modules.push(module.to_string());
    }

    /// True if `module` already ran on this object or any ancestor.
    pub fn module_already_ran(&self, module: &str) -> bool {
        self.scan_modules.iter().any(|m| m == module) || self.ancestor_modules.contains(module)
    }
}
