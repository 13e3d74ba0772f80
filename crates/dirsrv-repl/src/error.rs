//! Error types for the replication subsystem.

use crate::ldap::LdapResultCode;
use thiserror::Error;

/// Errors that can occur in the replication subsystem.
#[derive(Debug, Error)]
pub enum ReplError {
    /// A caller passed an unusable argument.
    #[error("invalid argument: {msg}")]
    InvalidArgument {
        /// What was wrong.
        msg: String,
    },

    /// A DN could not be parsed.
    #[error("invalid DN {dn:?}: {msg}")]
    InvalidDn {
        /// The offending DN text.
        dn: String,
        /// Parse failure detail.
        msg: String,
    },

    /// A CSN string could not be parsed.
    #[error("invalid CSN {csn:?}")]
    InvalidCsn {
        /// The offending CSN text.
        csn: String,
    },

    /// Replica id outside the allowed range for the replica type.
    #[error("invalid replica id {rid}: {msg}")]
    InvalidReplicaId {
        /// The replica id.
        rid: u16,
        /// Why it was rejected.
        msg: String,
    },

    /// A replica with this name is already registered.
    #[error("replica {name} already exists")]
    ReplicaExists {
        /// Replica name.
        name: String,
    },

    /// Another thread is constructing a replica for the same root.
    #[error("replica root {root} is already being configured")]
    ReplicaBeingConfigured {
        /// Root DN.
        root: String,
    },

    /// No replica is registered under this name or root.
    #[error("unknown replica: {name}")]
    ReplicaUnknown {
        /// Replica name or root.
        name: String,
    },

    /// Exclusive access to a replica could not be obtained.
    #[error("replica {root} is busy (held by {holder})")]
    ReplicaBusy {
        /// Root DN.
        root: String,
        /// Description of the current holder.
        holder: String,
    },

    /// An agreement with this configuration DN is already registered.
    #[error("agreement {dn} already exists")]
    AgreementExists {
        /// Configuration DN.
        dn: String,
    },

    /// No agreement under this configuration DN.
    #[error("unknown agreement: {dn}")]
    AgreementUnknown {
        /// Configuration DN.
        dn: String,
    },

    /// A configuration change was refused.
    #[error("configuration rejected for {attr} ({code}): {msg}")]
    ConfigRejected {
        /// Attribute being changed.
        attr: String,
        /// Result code reported to the administrator.
        code: LdapResultCode,
        /// Explanation.
        msg: String,
    },

    /// Remote clock is further ahead than the generator tolerates.
    #[error("clock skew of {skew_secs}s exceeds the {max_secs}s limit")]
    ClockSkew {
        /// Observed skew in seconds.
        skew_secs: u64,
        /// Allowed skew in seconds.
        max_secs: u64,
    },

    /// State that only an administrator can repair: duplicate replica ids,
    /// failed glue synthesis.
    #[error("replication divergence: {msg}")]
    Divergence {
        /// What diverged.
        msg: String,
    },

    /// The operation was refused with a specific result code.
    #[error("operation refused ({code}): {msg}")]
    Refused {
        /// Result code.
        code: LdapResultCode,
        /// Explanation.
        msg: String,
    },

    /// Entry store failure.
    #[error("store error: {msg}")]
    Store {
        /// Error message describing the issue.
        msg: String,
    },

    /// Changelog failure.
    #[error("changelog error: {msg}")]
    Changelog {
        /// Error message describing the issue.
        msg: String,
    },

    /// Too many CleanAllRUV tasks already running.
    #[error("too many cleanallruv tasks running (limit {limit})")]
    TooManyTasks {
        /// Concurrency limit.
        limit: usize,
    },

    /// A CleanAllRUV task for this replica id is already running.
    #[error("cleanallruv task for rid {rid} already running")]
    TaskExists {
        /// Replica id.
        rid: u16,
    },

    /// A lock was poisoned or an internal invariant failed.
    #[error("internal error: {msg}")]
    Internal {
        /// Detail.
        msg: String,
    },

    /// Serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// Replication engine was shut down.
    #[error("replication engine shut down")]
    Shutdown,
}

impl ReplError {
    /// LDAP result code an operator or peer sees for this error.
    pub fn result_code(&self) -> LdapResultCode {
        match self {
            Self::InvalidArgument { .. } => LdapResultCode::UnwillingToPerform,
            Self::InvalidDn { .. } => LdapResultCode::InvalidDnSyntax,
            Self::InvalidCsn { .. } => LdapResultCode::InvalidSyntax,
            Self::InvalidReplicaId { .. } => LdapResultCode::UnwillingToPerform,
            Self::ReplicaExists { .. } | Self::AgreementExists { .. } => {
                LdapResultCode::AlreadyExists
            }
            Self::ReplicaBeingConfigured { .. } | Self::ReplicaBusy { .. } => LdapResultCode::Busy,
            Self::ReplicaUnknown { .. } | Self::AgreementUnknown { .. } => {
                LdapResultCode::NoSuchObject
            }
            Self::ConfigRejected { code, .. } | Self::Refused { code, .. } => *code,
            Self::ClockSkew { .. } => LdapResultCode::UnwillingToPerform,
            Self::TooManyTasks { .. } | Self::TaskExists { .. } => LdapResultCode::UnwillingToPerform,
            Self::Divergence { .. }
            | Self::Store { .. }
            | Self::Changelog { .. }
            | Self::Internal { .. }
            | Self::Serialization(_)
            | Self::Io(_) => LdapResultCode::OperationsError,
            Self::Shutdown => LdapResultCode::Unavailable,
        }
    }

    pub(crate) fn poisoned(what: &str) -> Self {
        Self::Internal {
            msg: format!("{what} lock poisoned"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_divergence_maps_to_operations_error() {
        let err = ReplError::Divergence {
            msg: "duplicate replica id".to_string(),
        };
        assert_eq!(err.result_code(), LdapResultCode::OperationsError);
        assert!(err.to_string().contains("duplicate replica id"));
    }

    #[test]
    fn test_config_rejected_keeps_code() {
        let err = ReplError::ConfigRejected {
            attr: "nsds5ReplicatedAttributeList".to_string(),
            code: LdapResultCode::UnwillingToPerform,
            msg: "cn may not be excluded".to_string(),
        };
        assert_eq!(err.result_code(), LdapResultCode::UnwillingToPerform);
    }

    #[test]
    fn test_busy_errors() {
        let err = ReplError::ReplicaBeingConfigured {
            root: "dc=example".to_string(),
        };
        assert_eq!(err.result_code(), LdapResultCode::Busy);
    }
}
