//! Buffer digests as metadata.

use crate::object::HashMethod;
use crate::registry::{ModuleError, ModuleReply, ModuleRequest, ScanModule};

/// Adds cryptographic digests of the buffer to the object's metadata.
///
/// Option `algorithms=md5,sha256` restricts the set; the default computes
/// all four supported digests.
pub struct MetaHash;

const DEFAULT_ALGORITHMS: &[&str] = &["md5", "sha1", "sha256", "sha512"];

impl ScanModule for MetaHash {
    fn name(&self) -> &'static str {
        "META_HASH"
    }

    fn run(&self, request: &ModuleRequest) -> Result<ModuleReply, ModuleError> {
        let selected: Vec<String> = match request.option("algorithms") {
            Some(raw) => raw
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
            None => DEFAULT_ALGORITHMS.iter().map(|s| s.to_string()).collect(),
        };

        let mut reply = ModuleReply::new();
        for name in selected {
            let method = HashMethod::parse(&name)
                .ok_or_else(|| ModuleError::bad_options(format!("unknown algorithm '{}'", name)))?;
            reply.add_metadata(name, method.digest(&request.object.buffer));
        }
        Ok(reply)
    }
}
