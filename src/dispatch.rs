//! Dispatch: deciding which modules run against an object.
//!
//! Dispatch is driven by two pieces of configuration: a YARA rule set whose
//! rule names identify object kinds, and an ordered action table mapping rule
//! names to module lists. The canonical action entry form is
//!
//! ```text
//! rule_name : module,module(opt=val,...),module ; flag1,flag2 ; ctype1 ; priority
//! ```
//!
//! with the flag, content-type and priority sections optional, `#` comments
//! and blank lines ignored. The literal rule name `default` applies when no
//! dispatch rule matches the buffer.

use crate::config::ScanConfig;
use crate::error::{DredgeError, Result};
use crate::object::{ExternalVars, ScanObject};
use crate::registry::ModuleRegistry;
use crate::rules::{RuleInputs, RuleSet};
use rustc_hash::FxHashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Rule name that applies when nothing matched.
pub const DEFAULT_RULE: &str = "default";

/// A module reference inside a dispatch action, with per-action options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRef {
    pub name: String,
    pub options: FxHashMap<String, String>,
}

/// One entry of the action table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchAction {
    pub rule: String,
    pub modules: Vec<ModuleRef>,
    pub flags: Vec<String>,
    pub content_types: Vec<String>,
    pub priority: Option<i32>,
}

/// The ordered action table. Order is config-declared order and drives both
/// action application and `object_type` assembly.
#[derive(Debug, Clone, Default)]
pub struct DispatchTable {
    actions: Vec<DispatchAction>,
}

impl DispatchTable {
    /// Parse an action table from text. Malformed lines are configuration
    /// errors; an engine never starts on a bad table.
    pub fn parse(text: &str) -> Result<Self> {
        let mut actions = Vec::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            actions.push(parse_action_line(line).map_err(|msg| {
                DredgeError::dispatch_config(format!("line {}: {}", lineno + 1, msg))
            })?);
        }
        Ok(Self { actions })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| DredgeError::dispatch_config(format!("{}: {}", path.display(), e)))?;
        Self::parse(&text)
    }

    /// The table used when a deployment supplies none: hash everything.
    #[must_use]
    pub fn builtin_default() -> Self {
        Self {
            actions: vec![DispatchAction {
                rule: DEFAULT_RULE.to_string(),
                modules: vec![ModuleRef {
                    name: "META_HASH".to_string(),
                    options: FxHashMap::default(),
                }],
                flags: Vec::new(),
                content_types: Vec::new(),
                priority: None,
            }],
        }
    }

    pub fn actions(&self) -> &[DispatchAction] {
        &self.actions
    }

    /// Startup validation: every referenced rule must exist in the compiled
    /// dispatch rules, every referenced module in the module table.
    pub fn validate(&self, rules: &RuleSet, registry: &ModuleRegistry) -> Result<()> {
        for action in &self.actions {
            if action.rule != DEFAULT_RULE && !rules.contains_rule(&action.rule) {
                return Err(DredgeError::dispatch_config(format!(
                    "action references unknown rule '{}'",
                    action.rule
                )));
            }
            for module_ref in &action.modules {
                if !registry.contains(&module_ref.name) {
                    return Err(DredgeError::dispatch_config(format!(
                        "rule '{}' references unknown module '{}'",
                        action.rule, module_ref.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A module selected for execution, with its merged options resolved.
#[derive(Debug, Clone)]
pub struct PlannedModule {
    pub name: String,
    pub options: FxHashMap<String, String>,
    pub priority: i32,
    /// Per-invocation override of the engine-wide module_time budget.
    pub timeout: Option<Duration>,
}

/// The dispatcher: compiled dispatch rules plus the action table.
#[derive(Debug)]
pub struct Dispatcher {
    rules: RuleSet,
    table: DispatchTable,
}

impl Dispatcher {
    #[must_use]
    pub fn new(rules: RuleSet, table: DispatchTable) -> Self {
        Self { rules, table }
    }

    pub fn validate(&self, registry: &ModuleRegistry) -> Result<()> {
        self.table.validate(&self.rules, registry)
    }

    /// Decide the ordered module list for `object`, recording the object's
    /// type, dispatch flags and content types on it as a side effect.
    pub fn dispatch(
        &self,
        object: &mut ScanObject,
        external: &ExternalVars,
        registry: &ModuleRegistry,
        config: &ScanConfig,
    ) -> Result<Vec<PlannedModule>> {
        let inputs = RuleInputs::for_object(object, external);
        let matches = self.rules.match_bytes(&object.buffer, &inputs)?;

        let mut matched: Vec<String> = matches.iter().map(|m| m.rule.clone()).collect();
        if matched.is_empty() {
            matched.push(DEFAULT_RULE.to_string());
        }

        // Apply actions in config-declared order, not match order.
        let mut selected: Vec<ModuleRef> = Vec::new();
        for action in &self.table.actions {
            if !matched.iter().any(|m| m == &action.rule) {
                continue;
            }
            for module_ref in &action.modules {
                match selected.iter().find(|m| m.name == module_ref.name) {
                    None => selected.push(module_ref.clone()),
                    Some(first) => {
                        // First occurrence wins; only conflicting options are
                        // worth a warning.
                        if first.options != module_ref.options {
                            object.add_flag("DISPATCH:DUPLICATE_MODULE");
                        }
                    }
                }
            }
            for flag in &action.flags {
                object.add_flag(flag.clone());
            }
            for content_type in &action.content_types {
                if !object.content_type.contains(content_type) {
                    object.content_type.push(content_type.clone());
                }
            }
        }

        // Record the object's type: matched rules in config-declared order,
        // then matched rules with no action entry in match order.
        let mut object_type: Vec<String> = Vec::new();
        for action in &self.table.actions {
            if matched.iter().any(|m| m == &action.rule) && !object_type.contains(&action.rule) {
                object_type.push(action.rule.clone());
            }
        }
        for name in &matched {
            if !object_type.contains(name) {
                object_type.push(name.clone());
            }
        }
        object.object_type = object_type;

        let mut planned = Vec::new();
        for module_ref in selected {
            if object.module_already_ran(&module_ref.name)
                && !external.allows_rescan(&module_ref.name)
            {
                debug!("Skipping {}: already ran on this lineage", module_ref.name);
                continue;
            }

            let entry = match registry.get(&module_ref.name) {
                Some(entry) => entry,
                None => {
                    warn!("Dispatch references unregistered module {}", module_ref.name);
                    object.add_flag(format!("DISPATCH:MISSING_MODULE:{}", module_ref.name));
                    continue;
                }
            };
            if !entry.enabled {
                continue;
            }

            // Merge order: module defaults < action overrides < per-scan.
            let mut options = entry.default_options.clone();
            for (key, value) in &module_ref.options {
                options.insert(key.clone(), value.clone());
            }
            if let Some(overrides) = config.module_options.get(&module_ref.name) {
                for (key, value) in overrides {
                    options.insert(key.clone(), value.clone());
                }
            }

            let timeout = match options.get("timeout") {
                Some(raw) => match raw.parse::<u64>() {
                    Ok(secs) => Some(Duration::from_secs(secs)),
                    Err(_) => {
                        object.add_flag(format!("DISPATCH:BAD_OPTIONS:{}", module_ref.name));
                        continue;
                    }
                },
                None => entry.timeout,
            };

            let priority = find_action_priority(&self.table, &matched, &module_ref.name)
                .unwrap_or(entry.priority);

            planned.push(PlannedModule { name: module_ref.name, options, priority, timeout });
        }

        // Stable sort keeps action order among equal priorities.
        planned.sort_by_key(|m| m.priority);
        Ok(planned)
    }
}

/// Priority for a module: the first matched action that both names the module
/// and declares a priority.
fn find_action_priority(table: &DispatchTable, matched: &[String], module: &str) -> Option<i32> {
    for action in &table.actions {
        if !matched.iter().any(|m| m == &action.rule) {
            continue;
        }
        if action.modules.iter().any(|m| m.name == module) {
            if let Some(priority) = action.priority {
                return Some(priority);
            }
        }
    }
    None
}

fn parse_action_line(line: &str) -> std::result::Result<DispatchAction, String> {
    let (rule, rest) = line
        .split_once(':')
        .ok_or_else(|| "missing ':' separator".to_string())?;
    let rule = rule.trim();
    if rule.is_empty() {
        return Err("empty rule name".to_string());
    }

    let sections: Vec<&str> = rest.split(';').collect();
    if sections.len() > 4 {
        return Err(format!("too many sections ({})", sections.len()));
    }

    let modules = parse_module_list(sections[0])?;
    let flags = parse_name_list(sections.get(1).copied().unwrap_or(""));
    let content_types = parse_name_list(sections.get(2).copied().unwrap_or(""));
    let priority = match sections.get(3).map(|s| s.trim()) {
        None | Some("") => None,
        Some(raw) => Some(
            raw.parse::<i32>()
                .map_err(|_| format!("invalid priority '{}'", raw))?,
        ),
    };

    Ok(DispatchAction { rule: rule.to_string(), modules, flags, content_types, priority })
}

fn parse_name_list(section: &str) -> Vec<String> {
    section
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Split the module section on top-level commas; commas inside `(...)`
/// belong to option lists.
fn parse_module_list(section: &str) -> std::result::Result<Vec<ModuleRef>, String> {
    let mut modules = Vec::new();
    let mut token = String::new();
    let mut depth = 0usize;
    for c in section.chars() {
        match c {
            '(' => {
                depth += 1;
                token.push(c);
            }
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| "unbalanced ')'".to_string())?;
                token.push(c);
            }
            ',' if depth == 0 => {
                push_module_token(&mut modules, &token)?;
                token.clear();
            }
            _ => token.push(c),
        }
    }
    if depth != 0 {
        return Err("unbalanced '('".to_string());
    }
    push_module_token(&mut modules, &token)?;
    Ok(modules)
}

fn push_module_token(
    modules: &mut Vec<ModuleRef>,
    token: &str,
) -> std::result::Result<(), String> {
    let token = token.trim();
    if token.is_empty() {
        return Ok(());
    }

    let (name, options) = match token.split_once('(') {
        None => (token, FxHashMap::default()),
        Some((name, rest)) => {
            let inner = rest
                .strip_suffix(')')
                .ok_or_else(|| format!("module '{}': missing ')'", name.trim()))?;
            let mut options = FxHashMap::default();
            for pair in inner.split(',') {
                let pair = pair.trim();
                if pair.is_empty() {
                    continue;
                }
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| format!("option '{}' is not key=value", pair))?;
                options.insert(key.trim().to_string(), value.trim().to_string());
            }
            (name.trim(), options)
        }
    };

    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return Err(format!("invalid module name '{}'", name));
    }
    modules.push(ModuleRef { name: name.to_string(), options });
    Ok(())
}
