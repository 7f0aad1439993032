//! DREDGE - Recursive object scanning engine for file-centric intrusion
//! detection.
//!
//! Given an arbitrary byte buffer (an email, an archive, a document), dredge
//! produces a tree of scan objects — the input and every nested artifact
//! discovered inside it — annotated with flags, structured metadata, and a
//! final disposition. YARA rules decide which analysis modules run against
//! each object; a second rule set folds the accumulated flags into the
//! verdict.
//!
//! # Example
//!
//! ```no_run
//! use dredge::{scan, ExternalVars, ScanConfig, Verbosity};
//!
//! let external = ExternalVars::new("mail-gateway").with_filename("attachment.bin");
//! let result = scan(
//!     std::fs::read("attachment.bin").unwrap(),
//!     &external,
//!     &ScanConfig::default(),
//!     Verbosity::Full,
//! )
//! .unwrap();
//!
//! println!("{} -> {}", result.root().object_hash, result.disposition);
//! ```
//!
//! One scan is one logical execution context; run scans from as many threads
//! as you like, sharing a single [`ScanEngine`] between them.

mod driver;
mod runtime;

// Public modules
pub mod config;
pub mod dispatch;
pub mod disposition;
pub mod error;
pub mod metadata;
pub mod modules;
pub mod object;
pub mod registry;
pub mod result;
pub mod rules;

// Re-export commonly used types at crate root
pub use config::{QueueOrder, ResourceLimits, ScanConfig};
pub use dispatch::{DispatchAction, DispatchTable, Dispatcher, ModuleRef, PlannedModule};
pub use disposition::{DispositionAction, Dispositioner, DISPOSITIONER};
pub use driver::ScanEngine;
pub use error::{DredgeError, Result};
pub use metadata::MetaValue;
pub use object::{ExternalVars, HashMethod, ScanObject, SCAN_FAILURES};
pub use registry::{
    ModuleEntry, ModuleError, ModuleObject, ModuleRegistry, ModuleReply, ModuleRequest, ScanModule,
};
pub use result::{ScanResult, SerializedObject, SerializedResult, Verbosity};
pub use rules::{MatchedString, RuleInputs, RuleMatch, RuleSet};

/// Scan a buffer with a throwaway engine built from `config` and the
/// built-in module registry.
///
/// This is the one-call entry point. For batch work, construct a
/// [`ScanEngine`] once and call [`ScanEngine::scan`] per job — rule sets and
/// the module table are compiled at engine construction and shared read-only
/// across scans.
pub fn scan(
    buffer: Vec<u8>,
    external: &ExternalVars,
    config: &ScanConfig,
    verbosity: Verbosity,
) -> Result<ScanResult> {
    let engine = ScanEngine::with_defaults(config.clone(), modules::builtin_registry())?;
    engine.scan(buffer, external, verbosity)
}
