//! Error categories for Tandem
//!
//! Each crate defines its own `thiserror` enum; all of them map onto one of
//! these categories so the dispatch layer can decide how to react without
//! matching on every variant.

use std::fmt::{Display, Formatter};

/// Broad classification of a failed replica call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The call was addressed to a different master incarnation
    Fencing,
    /// The caller referenced an unknown resource or broke call ordering
    Protocol,
    /// Lock contention (deadlock, illegal resource)
    Contention,
    /// Storage, I/O or collaborator failure
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Fencing => "fencing",
            ErrorCategory::Protocol => "protocol",
            ErrorCategory::Contention => "contention",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }

    /// Whether the replica has to handshake again before retrying
    pub fn requires_reconnect(&self) -> bool {
        matches!(self, ErrorCategory::Fencing)
    }

    /// Whether the owning channel's transaction should be rolled back
    pub fn triggers_rollback(&self) -> bool {
        matches!(self, ErrorCategory::Infrastructure)
    }
}

impl Display for ErrorCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_fencing_requires_reconnect() {
        assert!(ErrorCategory::Fencing.requires_reconnect());
        assert!(!ErrorCategory::Protocol.requires_reconnect());
        assert!(!ErrorCategory::Contention.requires_reconnect());
        assert!(!ErrorCategory::Infrastructure.requires_reconnect());
    }

    #[test]
    fn test_only_infrastructure_triggers_rollback() {
        assert!(ErrorCategory::Infrastructure.triggers_rollback());
        assert!(!ErrorCategory::Fencing.triggers_rollback());
        assert!(!ErrorCategory::Contention.triggers_rollback());
    }

    #[test]
    fn test_display() {
        assert_eq!(ErrorCategory::Fencing.to_string(), "fencing");
        assert_eq!(ErrorCategory::Infrastructure.as_str(), "infrastructure");
    }
}
