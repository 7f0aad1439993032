//! Scan results and their wire representation.
//!
//! A [`ScanResult`] owns the finished object tree as an arena keyed by uuid
//! (objects reference their parent by id, never by pointer). Serialization
//! projects the arena at a requested [`Verbosity`]; the projection types
//! round-trip through JSON losslessly, which the result tests rely on.

use crate::disposition::DISPOSITIONER;
use crate::error::{DredgeError, Result};
use crate::object::ScanObject;
use base64::Engine as _;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// How much of the tree the serialized result carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Root object only: its flags and the dispositioner's verdict.
    Minimal,
    /// Every object's flags and metadata, no buffers.
    #[default]
    Full,
    /// Alias of `Full` kept for callers that ask for it by name.
    NoBuffer,
    /// `Full` plus the raw buffers, base64-encoded.
    Everything,
}

impl Verbosity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verbosity::Minimal => "minimal",
            Verbosity::Full => "full",
            Verbosity::NoBuffer => "nobuffer",
            Verbosity::Everything => "everything",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "minimal" => Some(Verbosity::Minimal),
            "full" => Some(Verbosity::Full),
            "nobuffer" | "no_buffer" => Some(Verbosity::NoBuffer),
            "everything" => Some(Verbosity::Everything),
            _ => None,
        }
    }

    fn include_buffers(&self) -> bool {
        matches!(self, Verbosity::Everything)
    }
}

/// The artifact a scan returns: the object tree plus submission context.
///
/// Created by the driver at scan start, mutated only during the scan, and
/// handed to the caller immutable. Nothing here persists across scans.
#[derive(Debug)]
pub struct ScanResult {
    pub source: String,
    pub level: Verbosity,
    /// Epoch seconds at scan start.
    pub start_time: f64,
    pub root_uid: Uuid,
    /// Final verdict as chosen by the dispositioner.
    pub disposition: String,
    objects: Vec<ScanObject>,
    index: FxHashMap<Uuid, usize>,
}

impl ScanResult {
    #[must_use]
    pub fn new(source: String, level: Verbosity, start_time: f64, root: ScanObject) -> Self {
        let root_uid = root.uuid;
        let mut result = Self {
            source,
            level,
            start_time,
            root_uid,
            disposition: String::new(),
            objects: Vec::new(),
            index: FxHashMap::default(),
        };
        result.push(root);
        result
    }

    /// Append an object to the arena, returning its index.
    pub fn push(&mut self, object: ScanObject) -> usize {
        let idx = self.objects.len();
        self.index.insert(object.uuid, idx);
        self.objects.push(object);
        idx
    }

    pub fn get(&self, uuid: &Uuid) -> Option<&ScanObject> {
        self.index.get(uuid).map(|&idx| &self.objects[idx])
    }

    pub fn get_mut(&mut self, uuid: &Uuid) -> Option<&mut ScanObject> {
        let idx = *self.index.get(uuid)?;
        Some(&mut self.objects[idx])
    }

    pub fn object_at(&self, idx: usize) -> &ScanObject {
        &self.objects[idx]
    }

    pub fn object_at_mut(&mut self, idx: usize) -> &mut ScanObject {
        &mut self.objects[idx]
    }

    pub fn root(&self) -> &ScanObject {
        &self.objects[0]
    }

    pub fn root_mut(&mut self) -> &mut ScanObject {
        &mut self.objects[0]
    }

    pub fn objects(&self) -> &[ScanObject] {
        &self.objects
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Every distinct flag anywhere in the tree, in tree order.
    pub fn all_flags(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for object in &self.objects {
            for flag in &object.flags {
                if !seen.contains(flag) {
                    seen.push(flag.clone());
                }
            }
        }
        seen
    }

    /// Project the tree at this result's verbosity level.
    ///
    /// Metadata values without a JSON representation are coerced to strings
    /// here, and the owning object picks up `METADATA:COERCED:<module>`.
    pub fn serialize(&mut self) -> SerializedResult {
        let level = self.level;
        let mut files = BTreeMap::new();

        let count = if level == Verbosity::Minimal { 1 } else { self.objects.len() };
        for idx in 0..count {
            let mut coerced_modules = Vec::new();
            {
                let object = &self.objects[idx];
                for (module, namespace) in &object.metadata {
                    for value in namespace.values() {
                        let (_, coerced) = value.to_json();
                        if coerced {
                            coerced_modules.push(module.clone());
                            break;
                        }
                    }
                }
            }
            for module in coerced_modules {
                self.objects[idx].add_flag(format!("METADATA:COERCED:{}", module));
            }

            let object = &self.objects[idx];
            files.insert(object.uuid.to_string(), project_object(object, level));
        }

        SerializedResult {
            root_uid: self.root_uid.to_string(),
            source: self.source.clone(),
            level: level.as_str().to_string(),
            start_time: self.start_time,
            files,
        }
    }

    /// Serialize straight to a JSON string.
    pub fn to_json(&mut self, pretty: bool) -> Result<String> {
        let serialized = self.serialize();
        let rendered = if pretty {
            serde_json::to_string_pretty(&serialized)
        } else {
            serde_json::to_string(&serialized)
        };
        rendered.map_err(|e| DredgeError::framework(format!("result serialization failed: {}", e)))
    }
}

fn project_object(object: &ScanObject, level: Verbosity) -> SerializedObject {
    let mut metadata = serde_json::Map::new();
    for (module, namespace) in &object.metadata {
        if level == Verbosity::Minimal && module != DISPOSITIONER {
            continue;
        }
        let mut fields = serde_json::Map::new();
        for (field, value) in namespace {
            let (json, _) = value.to_json();
            fields.insert(field.clone(), json);
        }
        metadata.insert(module.clone(), serde_json::Value::Object(fields));
    }

    let buffer = if level.include_buffers() {
        Some(base64::engine::general_purpose::STANDARD.encode(&object.buffer))
    } else {
        None
    };

    SerializedObject {
        uuid: object.uuid.to_string(),
        parent: object.parent_uuid.map(|u| u.to_string()),
        depth: object.depth as u64,
        filename: object.filename.clone(),
        hash: object.object_hash.clone(),
        size: object.object_size,
        object_type: object.object_type.clone(),
        content_type: object.content_type.clone(),
        flags: object.flags.clone(),
        scan_modules: object.scan_modules.clone(),
        metadata,
        buffer,
    }
}

/// Wire form of a scan result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedResult {
    #[serde(rename = "rootUID")]
    pub root_uid: String,
    pub source: String,
    pub level: String,
    #[serde(rename = "startTime")]
    pub start_time: f64,
    pub files: BTreeMap<String, SerializedObject>,
}

impl SerializedResult {
    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data)
            .map_err(|e| DredgeError::framework(format!("result deserialization failed: {}", e)))
    }
}

/// Wire form of one scan object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedObject {
    pub uuid: String,
    pub parent: Option<String>,
    pub depth: u64,
    pub filename: Option<String>,
    pub hash: String,
    pub size: u64,
    #[serde(rename = "objectType")]
    pub object_type: Vec<String>,
    #[serde(rename = "contentType")]
    pub content_type: Vec<String>,
    pub flags: Vec<String>,
    #[serde(rename = "scanModules")]
    pub scan_modules: Vec<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub buffer: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetaValue;
    use crate::object::{ExternalVars, HashMethod};

    fn result_with_level(level: Verbosity) -> ScanResult {
        let external = ExternalVars::new("unit");
        let root = ScanObject::root(b"root data".to_vec(), &external, HashMethod::Md5);
        let mut result = ScanResult::new("unit".to_string(), level, 1_700_000_000.5, root);
        let child = ScanObject::child(result.root(), b"child".to_vec(), "EXPLODE_X", HashMethod::Md5);
        result.push(child);
        result
    }

    #[test]
    fn test_arena_lookup() {
        let result = result_with_level(Verbosity::Full);
        let root_uuid = result.root_uid;
        assert_eq!(result.get(&root_uuid).unwrap().depth, 0);
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_all_flags_tree_order_dedup() {
        let mut result = result_with_level(Verbosity::Full);
        result.root_mut().add_flag("a");
        result.root_mut().add_flag("b");
        result.object_at_mut(1).add_flag("b");
        result.object_at_mut(1).add_flag("c");
        assert_eq!(result.all_flags(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_minimal_projects_root_only() {
        let mut result = result_with_level(Verbosity::Minimal);
        result.root_mut().add_metadata("META_HASH", "md5", "abc");
        result
            .root_mut()
            .add_metadata(DISPOSITIONER, "Disposition", "Accept");
        let serialized = result.serialize();
        assert_eq!(serialized.files.len(), 1);
        let root = serialized.files.values().next().unwrap();
        assert!(root.metadata.contains_key(DISPOSITIONER));
        assert!(!root.metadata.contains_key("META_HASH"));
        assert!(root.buffer.is_none());
    }

    #[test]
    fn test_everything_includes_base64_buffer() {
        let mut result = result_with_level(Verbosity::Everything);
        let serialized = result.serialize();
        let root = &serialized.files[&result.root_uid.to_string()];
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(root.buffer.as_deref().unwrap())
            .unwrap();
        assert_eq!(decoded, b"root data");
    }

    #[test]
    fn test_coercion_flags_owning_module() {
        let mut result = result_with_level(Verbosity::Full);
        result
            .root_mut()
            .add_metadata("META_RAW", "blob", MetaValue::Bytes(vec![1, 2, 3]));
        let serialized = result.serialize();
        let root = &serialized.files[&result.root_uid.to_string()];
        assert!(root.flags.contains(&"METADATA:COERCED:META_RAW".to_string()));
        // numeric fields stay numbers
        assert!(serde_json::to_value(root).unwrap()["size"].is_number());
    }

    #[test]
    fn test_serialize_is_idempotent() {
        let mut result = result_with_level(Verbosity::Full);
        result
            .root_mut()
            .add_metadata("META_RAW", "blob", MetaValue::Bytes(vec![1]));
        let first = result.serialize();
        let second = result.serialize();
        assert_eq!(first, second);
    }
}
