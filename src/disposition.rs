//! The dispositioner: folding tree flags into a final verdict.
//!
//! Runs exactly once, on the root object, after the work queue drains — but
//! it sees the flags of the entire tree. The flags are laid out one per line
//! in a synthetic buffer and matched against the disposition rule set; the
//! verdict is the first action-table entry (config order) whose rule matched.
//! The integer external variable `priority` carries the highest configured
//! flag weight present in the tree, so rules can express "weight exceeds N"
//! alongside plain boolean combinations of flags.

use crate::config::ScanConfig;
use crate::error::{DredgeError, Result};
use crate::object::ExternalVars;
use crate::result::ScanResult;
use crate::rules::{RuleInputs, RuleSet};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Metadata namespace and audit name of the dispositioner.
pub const DISPOSITIONER: &str = "DISPOSITIONER";

/// One entry of the disposition action table:
/// `rule_name : disposition ; reason`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispositionAction {
    pub rule: String,
    pub disposition: String,
    pub reason: String,
}

#[derive(Debug)]
pub struct Dispositioner {
    rules: RuleSet,
    actions: Vec<DispositionAction>,
}

impl Dispositioner {
    #[must_use]
    pub fn new(rules: RuleSet, actions: Vec<DispositionAction>) -> Self {
        Self { rules, actions }
    }

    /// A dispositioner with no rules: every scan gets the default verdict.
    #[must_use]
    pub fn accept_all() -> Self {
        Self { rules: RuleSet::empty(), actions: Vec::new() }
    }

    pub fn from_files<P: AsRef<Path>, Q: AsRef<Path>>(rules_path: P, actions_path: Q) -> Result<Self> {
        let rules = RuleSet::compile_file(rules_path)?;
        let actions_path = actions_path.as_ref();
        let text = fs::read_to_string(actions_path)
            .map_err(|e| DredgeError::dispatch_config(format!("{}: {}", actions_path.display(), e)))?;
        let actions = parse_actions(&text)?;
        let dispositioner = Self::new(rules, actions);
        dispositioner.validate()?;
        Ok(dispositioner)
    }

    /// Startup validation: every action must reference a compiled rule.
    pub fn validate(&self) -> Result<()> {
        for action in &self.actions {
            if !self.rules.contains_rule(&action.rule) {
                return Err(DredgeError::dispatch_config(format!(
                    "disposition action references unknown rule '{}'",
                    action.rule
                )));
            }
        }
        Ok(())
    }

    /// Fold the tree's flags into a verdict and write it onto the root.
    ///
    /// Idempotent: a second run over the same final tree reproduces the same
    /// flags and metadata. Internal failures fall back to the configured
    /// default verdict and mark `DISPOSITIONER:ERROR`.
    pub fn dispose(&self, result: &mut ScanResult, external: &ExternalVars, config: &ScanConfig) {
        let (disposition, reason, rule) = match self.evaluate(result, external, config) {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!("Dispositioner failed, using default verdict: {}", e);
                result.root_mut().add_flag("DISPOSITIONER:ERROR");
                (
                    config.default_disposition.clone(),
                    "dispositioner error".to_string(),
                    DISPOSITIONER.to_string(),
                )
            }
        };

        debug!(%disposition, %reason, "Disposition chosen");
        let root = result.root_mut();
        let mut verdict = rustc_hash::FxHashMap::default();
        verdict.insert("Result".to_string(), disposition.clone().into());
        verdict.insert("Reason".to_string(), reason.into());
        verdict.insert("Rule".to_string(), rule.into());
        root.add_metadata_unique(
            DISPOSITIONER,
            "Disposition",
            crate::metadata::MetaValue::Map(verdict),
        );
        root.add_flag(format!("DISPOSITION:{}", disposition));
        if !root.scan_modules.iter().any(|m| m == DISPOSITIONER) {
            root.record_module_run(DISPOSITIONER);
        }
        result.disposition = disposition;
    }

    fn evaluate(
        &self,
        result: &ScanResult,
        external: &ExternalVars,
        config: &ScanConfig,
    ) -> Result<(String, String, String)> {
        // Verdict flags from a previous run stay out of the buffer so a
        // re-run sees the same inputs.
        let flags: Vec<String> = result
            .all_flags()
            .into_iter()
            .filter(|f| !f.starts_with("DISPOSITION"))
            .collect();
        let mut buffer = flags.join("\n");
        buffer.push('\n');

        let priority = flags
            .iter()
            .filter_map(|f| config.flag_weights.get(f).copied())
            .max()
            .unwrap_or(0);

        let inputs = RuleInputs::for_object(result.root(), external).with_priority(priority);
        let matches = self.rules.match_bytes(buffer.as_bytes(), &inputs)?;

        for action in &self.actions {
            if matches.iter().any(|m| m.rule == action.rule) {
                return Ok((
                    action.disposition.clone(),
                    action.reason.clone(),
                    action.rule.clone(),
                ));
            }
        }
        Ok((
            config.default_disposition.clone(),
            "no disposition rule matched".to_string(),
            "default".to_string(),
        ))
    }
}

/// Parse a disposition action table: `rule : disposition ; reason` per line,
/// `#` comments and blank lines ignored.
pub fn parse_actions(text: &str) -> Result<Vec<DispositionAction>> {
    let mut actions = Vec::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (rule, rest) = line.split_once(':').ok_or_else(|| {
            DredgeError::dispatch_config(format!("line {}: missing ':' separator", lineno + 1))
        })?;
        let rule = rule.trim();
        let (disposition, reason) = match rest.split_once(';') {
            Some((d, r)) => (d.trim(), r.trim()),
            None => (rest.trim(), ""),
        };
        if rule.is_empty() || disposition.is_empty() {
            return Err(DredgeError::dispatch_config(format!(
                "line {}: rule and disposition are required",
                lineno + 1
            )));
        }
        actions.push(DispositionAction {
            rule: rule.to_string(),
            disposition: disposition.to_string(),
            reason: reason.to_string(),
        });
    }
    Ok(actions)
}
