use crate::core::objects::SetKeyType;
use thiserror::Error;

/// Core error types for nftsync
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// nftables command execution failed
    #[error("nftables error: {message}")]
    Nftables {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// Input validation failed
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// Set key type that can't be interval-managed
    #[error("Unsupported set key type: {0}")]
    UnsupportedKeyType(SetKeyType),

    /// Set data of one address family offered to a set of the other
    #[error("Family mismatch: {data} can't be stored in a {key_type} set")]
    FamilyMismatch { data: String, key_type: SetKeyType },

    /// Rule assembly failed
    #[error("Rule build error: {0}")]
    Build(#[from] BuildError),

    /// Kernel object not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(String),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn nftables(message: impl Into<String>) -> Self {
        Error::Nftables {
            message: message.into(),
            stderr: None,
            exit_code: None,
        }
    }
}

impl From<crate::elevation::ElevationError> for Error {
    fn from(err: crate::elevation::ElevationError) -> Self {
        Error::Elevation(err.to_string())
    }
}

/// Rule builder errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("family already set")]
    FamilyAlreadySet,

    #[error("transport protocol already set")]
    TransportAlreadySet,

    #[error("match family {matched} conflicts with rule family {rule}")]
    FamilyConflict { rule: String, matched: String },

    #[error("invalid match: {0}")]
    InvalidMatch(String),
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Known nftables failure texts and their operator-facing translations
pub struct NftablesErrorPattern;

impl NftablesErrorPattern {
    /// Matches an error message against known patterns.
    ///
    /// Returns `None` when nothing matches; callers log the raw message alone.
    pub fn match_error(msg: &str) -> Option<ErrorTranslation> {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return Some(
                ErrorTranslation::new("Insufficient permissions to modify nftables")
                    .with_suggestion("Run as root or grant CAP_NET_ADMIN")
                    .with_suggestion("Or set NFTSYNC_ELEVATION_METHOD=sudo|run0|pkexec"),
            );
        }

        if lower.contains("cache initialization failed") {
            return Some(
                ErrorTranslation::new("Failed to initialize nftables cache")
                    .with_suggestion("This usually means elevated privileges are required"),
            );
        }

        if (lower.contains("table") || lower.contains("chain") || lower.contains("set"))
            && (lower.contains("does not exist") || lower.contains("not found"))
        {
            return Some(
                ErrorTranslation::new("Table, chain or set not found")
                    .with_suggestion("Create the table, chain and sets before managing them"),
            );
        }

        if lower.contains("command not found")
            || (lower.contains("no such file") && lower.contains("exec"))
        {
            return Some(
                ErrorTranslation::new("nftables is not installed or not found in PATH")
                    .with_suggestion("Install the nftables package")
                    .with_suggestion("Or point NFTSYNC_NFT_COMMAND at the nft binary"),
            );
        }

        if lower.contains("protocol not supported") || lower.contains("netlink") {
            return Some(
                ErrorTranslation::new("Kernel nf_tables support is unavailable")
                    .with_suggestion("Load the module: modprobe nf_tables"),
            );
        }

        if lower.contains("resource busy") {
            return Some(
                ErrorTranslation::new("nftables resource is busy")
                    .with_suggestion("Another process may be modifying the same table"),
            );
        }

        if lower.contains("interval overlaps") || lower.contains("conflicting intervals") {
            return Some(
                ErrorTranslation::new("Set elements overlap")
                    .with_suggestion("Desired set data must not contain overlapping entries"),
            );
        }

        if lower.contains("file exists") || lower.contains("already exists") {
            return Some(
                ErrorTranslation::new("Object already exists")
                    .with_suggestion("Another manager may own this set or rule"),
            );
        }

        None
    }

    /// One-line hint for log output, if the message is recognised
    pub fn hint(msg: &str) -> Option<String> {
        Self::match_error(msg).map(|t| match t.suggestions.first() {
            Some(first) => format!("{} ({first})", t.user_message),
            None => t.user_message,
        })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nftables_missing_command() {
        let translation = NftablesErrorPattern::match_error("command not found: nft").unwrap();
        assert!(translation.user_message.contains("not installed"));
        assert!(
            translation
                .suggestions
                .iter()
                .any(|s| s.contains("NFTSYNC_NFT_COMMAND"))
        );
    }

    #[test]
    fn test_missing_element_is_not_a_missing_binary() {
        let msg = "Error: Could not process rule: No such file or directory; element not in set inet/nftsync/blocked";
        assert!(
            NftablesErrorPattern::hint(msg).is_none_or(|hint| !hint.contains("not installed"))
        );

        let hint = NftablesErrorPattern::hint("sudo: unable to execute nft: No such file or directory");
        assert!(hint.unwrap().contains("not installed"));
    }

    #[test]
    fn test_permission_hint() {
        let hint = NftablesErrorPattern::hint("Error: Operation not permitted").unwrap();
        assert!(hint.contains("permissions"));
        assert!(hint.contains("CAP_NET_ADMIN"));
    }

    #[test]
    fn test_missing_set_hint() {
        let hint = NftablesErrorPattern::hint("Error: No such set: set does not exist");
        assert!(hint.is_some());
    }

    #[test]
    fn test_unknown_message_has_no_hint() {
        assert!(NftablesErrorPattern::hint("something unexpected").is_none());
    }

    #[test]
    fn test_build_error_converts() {
        let err: Error = BuildError::FamilyAlreadySet.into();
        assert_eq!(err.to_string(), "Rule build error: family already set");
    }
}
