use std::path::PathBuf;
use thiserror::Error;

/// Dredge's custom error types for better error handling and user experience.
///
/// Module-level faults are data, not control flow: they are recorded on the
/// scan object as flags and never surface through this enum. Everything here
/// is either a startup/configuration problem or a framework-internal fault.
#[derive(Debug, Error)]
pub enum DredgeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YARA rule compilation failed: {message}")]
    RuleSyntax { message: String },

    #[error("Failed to load YARA rules from {path}: {message}")]
    RuleIo { path: PathBuf, message: String },

    #[error("Dispatch configuration error: {message}")]
    DispatchConfig { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Framework error: {message}")]
    Framework { message: String },
}

pub type Result<T, E = DredgeError> = std::result::Result<T, E>;

impl DredgeError {
    pub fn rule_syntax<S: Into<String>>(message: S) -> Self {
        Self::RuleSyntax { message: message.into() }
    }

    pub fn rule_io<P: Into<PathBuf>, S: Into<String>>(path: P, message: S) -> Self {
        Self::RuleIo { path: path.into(), message: message.into() }
    }

    pub fn dispatch_config<S: Into<String>>(message: S) -> Self {
        Self::DispatchConfig { message: message.into() }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    pub fn framework<S: Into<String>>(message: S) -> Self {
        Self::Framework { message: message.into() }
    }

    /// Returns true if the error should refuse engine startup rather than be
    /// recorded on a scan result.
    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            Self::RuleSyntax { .. }
                | Self::RuleIo { .. }
                | Self::DispatchConfig { .. }
                | Self::Configuration { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_classification() {
        assert!(DredgeError::rule_syntax("bad rule").is_startup());
        assert!(DredgeError::dispatch_config("missing module").is_startup());
        assert!(DredgeError::configuration("max_depth must be greater than 0").is_startup());
        assert!(!DredgeError::framework("queue corrupted").is_startup());
    }

    #[test]
    fn test_display_includes_path() {
        let err = DredgeError::rule_io("/etc/dredge/dispatch.yar", "no such file");
        assert!(err.to_string().contains("/etc/dredge/dispatch.yar"));
    }
}
