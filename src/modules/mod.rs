//! Built-in analysis modules.
//!
//! The format-module library (ZIP, PDF, PE, EMAIL, ...) is a deployment
//! concern and lives outside this crate; what ships here are the two generic
//! modules every deployment carries:
//!
//! - `META_HASH`: digests of the object buffer
//! - `SCAN_YARA`: signature matching with a caller-supplied rule set
//!
//! Each module implements the [`ScanModule`](crate::registry::ScanModule)
//! contract and is wired into dispatch purely by name.

pub mod meta_hash;
pub mod scan_yara;

pub use meta_hash::MetaHash;
pub use scan_yara::ScanYara;

use crate::registry::ModuleRegistry;

/// The registry a deployment starts from: the built-ins that need no
/// configuration of their own. `SCAN_YARA` is added by the caller once a
/// signature rule set exists to construct it with.
#[must_use]
pub fn builtin_registry() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry.register(MetaHash);
    registry
}
