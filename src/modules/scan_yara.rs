//! Signature matching over the object buffer.

use crate::error::Result;
use crate::registry::{ModuleError, ModuleReply, ModuleRequest, ScanModule};
use crate::rules::{RuleInputs, RuleSet};
use std::path::Path;

/// Matches a signature rule set against the buffer and turns hits into flags.
///
/// A matching rule contributes the flags named in its `meta.flags` entry
/// (comma-separated); a rule without one contributes `yara:<rule_name>`. The
/// names of all matching rules land in this module's metadata namespace.
///
/// The rule set here is the detection library, separate from the dispatch
/// rules that route objects to modules.
pub struct ScanYara {
    rules: RuleSet,
}

impl ScanYara {
    #[must_use]
    pub fn new(rules: RuleSet) -> Self {
        Self { rules }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(RuleSet::compile_file(path)?))
    }
}

impl ScanModule for ScanYara {
    fn name(&self) -> &'static str {
        "SCAN_YARA"
    }

    fn run(&self, request: &ModuleRequest) -> Result<ModuleReply, ModuleError> {
        let inputs = RuleInputs::for_object(&request.object, &request.external);
        let matches = self
            .rules
            .match_bytes(&request.object.buffer, &inputs)
            .map_err(|e| ModuleError::failed(e.to_string()))?;

        let mut reply = ModuleReply::new();
        for hit in &matches {
            match hit.meta_get("flags") {
                Some(flags) => {
                    for flag in flags.split(',').map(str::trim).filter(|f| !f.is_empty()) {
                        reply.add_flag(flag);
                    }
                }
                None => reply.add_flag(format!("yara:{}", hit.rule)),
            }
            reply.add_metadata("rules", hit.rule.clone());
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ExternalVars, HashMethod, ScanObject};
    use rustc_hash::FxHashMap;
    use std::sync::Arc;

    const SIGNATURES: &str = r#"
rule eicar_test_file {
    meta:
        flags = "MALICIOUS,av:eicar"
    strings:
        $a = "EICAR-STANDARD-ANTIVIRUS-TEST-FILE"
    condition:
        $a
}

rule plain_marker {
    strings:
        $m = "MARKER"
    condition:
        $m
}
"#;

    fn request(data: &[u8]) -> ModuleRequest {
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
    fn test_meta_flags_emitted() {
        let module = ScanYara::new(RuleSet::compile(SIGNATURES).unwrap());
        let reply = module
            .run(&request(b"x EICAR-STANDARD-ANTIVIRUS-TEST-FILE x"))
            .unwrap();
        assert!(reply.flags.contains(&"MALICIOUS".to_string()));
        assert!(reply.flags.contains(&"av:eicar".to_string()));
        assert_eq!(reply.metadata[0].0, "rules");
    }

    #[test]
    fn test_default_flag_uses_rule_name() {
        let module = ScanYara::new(RuleSet::compile(SIGNATURES).unwrap());
        let reply = module.run(&request(b"has MARKER inside")).unwrap();
        assert_eq!(reply.flags, vec!["yara:plain_marker"]);
    }

    #[test]
    fn test_no_match_is_quiet() {
        let module = ScanYara::new(RuleSet::compile(SIGNATURES).unwrap());
        let reply = module.run(&request(b"clean")).unwrap();
        assert!(reply.flags.is_empty());
        assert!(reply.metadata.is_empty());
    }
}
