//! YARA rule engine integration.
//!
//! Thin wrapper around yara-x: compiles a rule source once, then matches
//! buffers against it any number of times. Compiled rule sets are read-only
//! and safe to share across scans.
//!
//! Rules can condition on the submission envelope through external variables
//! declared under the names `filename`, `contentType`, `source`,
//! `extSourceTags` (comma-joined), `ephID` and `submitID`, plus the integer
//! `priority` bound by the dispositioner.

use crate::error::{DredgeError, Result};
use crate::object::{ExternalVars, ScanObject};
use rustc_hash::FxHashMap;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Longest matched-string preview carried into results.
const MAX_MATCH_PREVIEW: usize = 100;

/// Per-object values bound to the matcher's external variables.
#[derive(Debug, Clone, Default)]
pub struct RuleInputs {
    pub filename: String,
    pub content_type: String,
    pub source: String,
    pub ext_source_tags: String,
    pub eph_id: String,
    pub submit_id: String,
    pub priority: i64,
}

impl RuleInputs {
    /// Inputs for matching against `object`. The object's own filename and
    /// content types win over the submission envelope's.
    #[must_use]
    pub fn for_object(object: &ScanObject, external: &ExternalVars) -> Self {
        let filename = object
            .filename
            .clone()
            .or_else(|| external.filename.clone())
            .unwrap_or_default();
        let content_type = if object.content_type.is_empty() {
            external.content_type.clone().unwrap_or_default()
        } else {
            object.content_type.join(",")
        };
        Self {
            filename,
            content_type,
            source: external.source.clone(),
            ext_source_tags: external.ext_source_tags.join(","),
            eph_id: external.eph_id.clone(),
            submit_id: external.submit_id.clone(),
            priority: 0,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

/// One matched string within a rule match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedString {
    /// Pattern identifier (e.g. `$magic`).
    pub identifier: String,
    pub offset: u64,
    /// Matched bytes, capped at [`MAX_MATCH_PREVIEW`].
    pub data: Vec<u8>,
}

/// A single rule that matched a buffer.
#[derive(Debug, Clone)]
pub struct RuleMatch {
    pub rule: String,
    pub namespace: String,
    pub meta: FxHashMap<String, String>,
    pub strings: Vec<MatchedString>,
}

impl RuleMatch {
    pub fn meta_get(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }
}

/// A compiled, reusable YARA rule set.
pub struct RuleSet {
    rules: yara_x::Rules,
    rule_names: Vec<String>,
}

impl std::fmt::Debug for RuleSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleSet")
            .field("rule_names", &self.rule_names)
            .finish()
    }
}

impl RuleSet {
    /// Compile rules from source. Fails with `RuleSyntax` on any compile
    /// error; the whole source is rejected, never a partial set.
    pub fn compile(source: &str) -> Result<Self> {
        let mut compiler = yara_x::Compiler::new();
        declare_globals(&mut compiler)?;
        if let Err(e) = compiler.add_source(source.as_bytes()) {
            return Err(DredgeError::rule_syntax(format!("{:?}", e)));
        }
        let rule_names = scan_rule_names(source);
        debug!("Compiled {} YARA rules", rule_names.len());
        Ok(Self { rules: compiler.build(), rule_names })
    }

    /// Compile rules from a file on disk.
    pub fn compile_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let source = fs::read_to_string(path)
            .map_err(|e| DredgeError::rule_io(path, e.to_string()))?;
        Self::compile(&source).map_err(|e| match e {
            DredgeError::RuleSyntax { message } => DredgeError::rule_io(path, message),
            other => other,
        })
    }

    /// An empty rule set: matches nothing, always succeeds.
    pub fn empty() -> Self {
        let mut compiler = yara_x::Compiler::new();
        // Globals on an empty set keep set_global on the scanner total.
        let _ = declare_globals(&mut compiler);
        Self { rules: compiler.build(), rule_names: Vec::new() }
    }

    /// Names of the rules in this set, in source order.
    pub fn rule_names(&self) -> &[String] {
        &self.rule_names
    }

    pub fn contains_rule(&self, name: &str) -> bool {
        self.rule_names.iter().any(|n| n == name)
    }

    /// Match `data` against the compiled rules. Deterministic for identical
    /// inputs; a 0-byte buffer is legal and simply matches whatever rules
    /// hold on empty input.
    pub fn match_bytes(&self, data: &[u8], inputs: &RuleInputs) -> Result<Vec<RuleMatch>> {
        let mut scanner = yara_x::Scanner::new(&self.rules);
        bind_globals(&mut scanner, inputs)?;

        let scan_results = scanner
            .scan(data)
            .map_err(|e| DredgeError::framework(format!("YARA scan failed: {:?}", e)))?;

        let mut matches = Vec::new();
        for matching_rule in scan_results.matching_rules() {
            let rule = matching_rule.identifier().to_string();
            let namespace = matching_rule.namespace().to_string();

            let mut meta = FxHashMap::default();
            for (key, value) in matching_rule.metadata() {
                meta.insert(key.to_string(), meta_value_to_string(&value));
            }

            let mut strings = Vec::new();
            for pattern in matching_rule.patterns() {
                for m in pattern.matches() {
                    let range = m.range();
                    let end = range.end.min(range.start + MAX_MATCH_PREVIEW);
                    strings.push(MatchedString {
                        identifier: pattern.identifier().to_string(),
                        offset: range.start as u64,
                        data: data[range.start..end].to_vec(),
                    });
                }
            }

            matches.push(RuleMatch { rule, namespace, meta, strings });
        }

        Ok(matches)
    }
}

fn declare_globals(compiler: &mut yara_x::Compiler) -> Result<()> {
    for name in ["filename", "contentType", "source", "extSourceTags", "ephID", "submitID"] {
        compiler
            .define_global(name, "")
            .map_err(|e| DredgeError::framework(format!("define_global {}: {:?}", name, e)))?;
    }
    compiler
        .define_global("priority", 0_i64)
        .map_err(|e| DredgeError::framework(format!("define_global priority: {:?}", e)))?;
    Ok(())
}

fn bind_globals(scanner: &mut yara_x::Scanner, inputs: &RuleInputs) -> Result<()> {
    let pairs = [
        ("filename", inputs.filename.as_str()),
        ("contentType", inputs.content_type.as_str()),
        ("source", inputs.source.as_str()),
        ("extSourceTags", inputs.ext_source_tags.as_str()),
        ("ephID", inputs.eph_id.as_str()),
        ("submitID", inputs.submit_id.as_str()),
    ];
    for (name, value) in pairs {
        scanner
            .set_global(name, value)
            .map_err(|e| DredgeError::framework(format!("set_global {}: {:?}", name, e)))?;
    }
    scanner
        .set_global("priority", inputs.priority)
        .map_err(|e| DredgeError::framework(format!("set_global priority: {:?}", e)))?;
    Ok(())
}

/// Extract a printable value from a yara-x metadata value. The debug form is
/// the one representation stable across value kinds, so unwrap it textually.
fn meta_value_to_string(value: &impl std::fmt::Debug) -> String {
    let debug_str = format!("{:?}", value);
    if let Some(open) = debug_str.find('(') {
        if debug_str.ends_with(')') {
            let inner = &debug_str[open + 1..debug_str.len() - 1];
            return inner.trim_matches('"').to_string();
        }
    }
    debug_str.trim_matches('"').to_string()
}

/// Pull rule identifiers out of YARA source text, in declaration order.
/// Companion to the action tables, which reference rules by name.
fn scan_rule_names(source: &str) -> Vec<String> {
    let mut names = Vec::new();
    for line in source.lines() {
        let mut rest = line.trim_start();
        loop {
            match rest.split_once(char::is_whitespace) {
                Some(("private" | "global", tail)) => rest = tail.trim_start(),
                _ => break,
            }
        }
        if let Some(tail) = rest.strip_prefix("rule") {
            if !tail.starts_with(char::is_whitespace) {
                continue;
            }
            let name: String = tail
                .trim_start()
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_')
                .collect();
            if !name.is_empty() {
                names.push(name);
            }
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE_RULES: &str = r#"
rule has_magic {
    meta:
        description = "PK archive magic"
        flags = "type:archive"
    strings:
        $magic = "PK"
    condition:
        $magic at 0
}

rule wants_eicar {
    strings:
        $a = "EICAR-STANDARD-ANTIVIRUS-TEST-FILE"
    condition:
        $a
}
"#;

    #[test]
    fn test_compile_and_match() {
        let rules = RuleSet::compile(SIMPLE_RULES).unwrap();
        let matches = rules
            .match_bytes(b"PK\x03\x04rest", &RuleInputs::default())
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].rule, "has_magic");
        assert_eq!(matches[0].meta_get("flags"), Some("type:archive"));
        assert_eq!(matches[0].strings[0].identifier, "$magic");
        assert_eq!(matches[0].strings[0].offset, 0);
        assert_eq!(matches[0].strings[0].data, b"PK");
    }

    #[test]
    fn test_compile_rejects_bad_source() {
        let err = RuleSet::compile("rule broken { cond").unwrap_err();
        assert!(matches!(err, DredgeError::RuleSyntax { .. }));
    }

    #[test]
    fn test_empty_buffer_matches_nothing() {
        let rules = RuleSet::compile(SIMPLE_RULES).unwrap();
        let matches = rules.match_bytes(b"", &RuleInputs::default()).unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn test_empty_set_matches_nothing() {
        let rules = RuleSet::empty();
        let matches = rules.match_bytes(b"anything", &RuleInputs::default()).unwrap();
        assert!(matches.is_empty());
        assert!(rules.rule_names().is_empty());
    }

    #[test]
    fn test_external_variable_condition() {
        let source = r#"
rule from_mail {
    condition:
        source == "email-gateway"
}
"#;
        let rules = RuleSet::compile(source).unwrap();

        let hit_inputs = RuleInputs { source: "email-gateway".into(), ..Default::default() };
        let hits = rules.match_bytes(b"x", &hit_inputs).unwrap();
        assert_eq!(hits.len(), 1);

        let miss = rules.match_bytes(b"x", &RuleInputs::default()).unwrap();
        assert!(miss.is_empty());
    }

    #[test]
    fn test_filename_variable_condition() {
        let source = r#"
rule looks_like_invoice {
    condition:
        filename contains "invoice"
}
"#;
        let rules = RuleSet::compile(source).unwrap();
        let inputs = RuleInputs { filename: "invoice.pdf.exe".into(), ..Default::default() };
        assert_eq!(rules.match_bytes(b"", &inputs).unwrap().len(), 1);
    }

    #[test]
    fn test_priority_variable_condition() {
        let source = r#"
rule hot {
    condition:
        priority > 75
}
"#;
        let rules = RuleSet::compile(source).unwrap();
        let inputs = RuleInputs::default().with_priority(80);
        assert_eq!(rules.match_bytes(b"", &inputs).unwrap().len(), 1);
        let cold = RuleInputs::default().with_priority(10);
        assert!(rules.match_bytes(b"", &cold).unwrap().is_empty());
    }

    #[test]
    fn test_determinism() {
        let rules = RuleSet::compile(SIMPLE_RULES).unwrap();
        let a = rules.match_bytes(b"PK\x03\x04", &RuleInputs::default()).unwrap();
        let b = rules.match_bytes(b"PK\x03\x04", &RuleInputs::default()).unwrap();
        assert_eq!(a.len(), b.len());
        assert_eq!(a[0].rule, b[0].rule);
    }

    #[test]
    fn test_scan_rule_names() {
        let names = scan_rule_names(SIMPLE_RULES);
        assert_eq!(names, vec!["has_magic", "wants_eicar"]);
        assert_eq!(
            scan_rule_names("private rule quiet_one { condition: true }"),
            vec!["quiet_one"]
        );
        assert!(scan_rule_names("// rule commented_out").is_empty());
    }

    #[test]
    fn test_compile_file_missing_path() {
        let err = RuleSet::compile_file("/nonexistent/rules.yar").unwrap_err();
        assert!(matches!(err, DredgeError::RuleIo { .. }));
    }
}
