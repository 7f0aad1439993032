//! Engine configuration: resource caps, hashing, queue discipline.
//!
//! Configuration is plain data handed to the engine at construction; reloads
//! happen between scans, never during one.

use crate::error::{DredgeError, Result};
use crate::object::HashMethod;
use rustc_hash::FxHashMap;
use std::time::Duration;

pub const DEFAULT_MAX_DEPTH: usize = 10;
pub const DEFAULT_MAX_OBJECTS: usize = 1_000;
pub const DEFAULT_MAX_BYTES: u64 = 512 * 1024 * 1024; // 512MB
pub const DEFAULT_SCAN_TIME: Duration = Duration::from_secs(120);
pub const DEFAULT_MODULE_TIME: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_CHILD_SIZE: u64 = 100 * 1024 * 1024; // 100MB
pub const DEFAULT_MAX_MODULE_CHILDREN: usize = 1_000;
pub const DEFAULT_DISPOSITION: &str = "Accept";

/// Hard caps on what a single scan may consume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Children computed deeper than this are discarded before enqueue.
    pub max_depth: usize,
    /// Total objects per scan, root included.
    pub max_objects: usize,
    /// Total stored buffer bytes across all objects in the scan.
    pub max_bytes: u64,
    /// Wall-clock budget for the whole scan.
    pub scan_time: Duration,
    /// Default wall-clock budget per module invocation.
    pub module_time: Duration,
    /// Largest child buffer a single module call may emit.
    pub max_child_size: u64,
    /// Most children a single module call may emit.
    pub max_module_children: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            max_objects: DEFAULT_MAX_OBJECTS,
            max_bytes: DEFAULT_MAX_BYTES,
            scan_time: DEFAULT_SCAN_TIME,
            module_time: DEFAULT_MODULE_TIME,
            max_child_size: DEFAULT_MAX_CHILD_SIZE,
            max_module_children: DEFAULT_MAX_MODULE_CHILDREN,
        }
    }
}

impl ResourceLimits {
    pub fn validate(&self) -> Result<()> {
        if self.max_depth == 0 {
            return Err(DredgeError::configuration("max_depth must be greater than 0"));
        }
        if self.max_objects == 0 {
            return Err(DredgeError::configuration("max_objects must be greater than 0"));
        }
        if self.max_bytes == 0 {
            return Err(DredgeError::configuration("max_bytes must be greater than 0"));
        }
        if self.scan_time.is_zero() {
            return Err(DredgeError::configuration("scan_time must be greater than 0"));
        }
        if self.module_time.is_zero() {
            return Err(DredgeError::configuration("module_time must be greater than 0"));
        }
        if self.max_child_size == 0 {
            return Err(DredgeError::configuration("max_child_size must be greater than 0"));
        }
        if self.max_module_children == 0 {
            return Err(DredgeError::configuration(
                "max_module_children must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Queue discipline for the scan driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueOrder {
    #[default]
    Bfs,
    Dfs,
}

impl QueueOrder {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "bfs" => Some(QueueOrder::Bfs),
            "dfs" => Some(QueueOrder::Dfs),
            _ => None,
        }
    }
}

/// Full engine configuration.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub limits: ResourceLimits,
    pub object_hash_method: HashMethod,
    /// Verdict used when no disposition rule matches (or the dispositioner
    /// itself fails).
    pub default_disposition: String,
    pub queue_order: QueueOrder,
    /// Modules allowed to re-run on descendants of objects that already ran
    /// them; copied onto `ExternalVars` at scan start when the submission did
    /// not set its own list.
    pub rescan_modules: Vec<String>,
    /// Numeric weights per flag, feeding the dispositioner's `priority`
    /// external variable.
    pub flag_weights: FxHashMap<String, i64>,
    /// Per-scan option overrides: module name → option map. Highest
    /// precedence in the merge.
    pub module_options: FxHashMap<String, FxHashMap<String, String>>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            object_hash_method: HashMethod::default(),
            default_disposition: DEFAULT_DISPOSITION.to_string(),
            queue_order: QueueOrder::default(),
            rescan_modules: Vec::new(),
            flag_weights: FxHashMap::default(),
            module_options: FxHashMap::default(),
        }
    }
}

impl ScanConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A locked-down preset for hostile-input deployments: shallow trees,
    /// small outputs, short budgets.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            limits: ResourceLimits {
                max_depth: 3,
                max_objects: 100,
                max_bytes: 64 * 1024 * 1024,
                scan_time: Duration::from_secs(30),
                module_time: Duration::from_secs(5),
                max_child_size: 16 * 1024 * 1024,
                max_module_children: 100,
            },
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.limits.validate()?;
        if self.default_disposition.is_empty() {
            return Err(DredgeError::configuration("default_disposition must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        assert!(ScanConfig::default().validate().is_ok());
        assert!(ScanConfig::strict().validate().is_ok());
    }

    #[test]
    fn test_zero_limits_rejected() {
        let mut config = ScanConfig::default();
        config.limits.max_depth = 0;
        assert!(config.validate().is_err());

        let mut config = ScanConfig::default();
        config.limits.scan_time = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_disposition_rejected() {
        let config = ScanConfig { default_disposition: String::new(), ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_queue_order_parse() {
        assert_eq!(QueueOrder::parse("BFS"), Some(QueueOrder::Bfs));
        assert_eq!(QueueOrder::parse("dfs"), Some(QueueOrder::Dfs));
        assert_eq!(QueueOrder::parse("lifo"), None);
    }
}
