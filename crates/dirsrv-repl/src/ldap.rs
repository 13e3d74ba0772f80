//! LDAP result codes, replication OIDs and the request/response shapes exchanged
//! with a peer. Encoding these onto the wire is the transport's job.

use crate::csn::{Csn, ReplicaId};
use crate::entry::Entry;
use crate::op::Mod;
use crate::ruv::Ruv;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Update-info control carried on every replicated add/delete/modify/rename.
pub const UPDATE_INFO_CONTROL_OID: &str = "2.16.840.1.113730.3.4.13";
/// DS5.0 incremental update protocol.
pub const NSDS50_INCREMENTAL_PROTOCOL_OID: &str = "2.16.840.1.113730.3.6.1";
/// DS5.0 total update protocol.
pub const NSDS50_TOTAL_PROTOCOL_OID: &str = "2.16.840.1.113730.3.6.2";
/// DS7.1 total update protocol.
pub const NSDS71_TOTAL_PROTOCOL_OID: &str = "2.16.840.1.113730.3.6.3";
/// DS7.1 incremental update protocol.
pub const NSDS71_INCREMENTAL_PROTOCOL_OID: &str = "2.16.840.1.113730.3.6.4";
/// Start replication request (DS5.0 framing).
pub const START_NSDS50_REPLICATION_REQUEST_OID: &str = "2.16.840.1.113730.3.5.3";
/// Replication response (DS5.0 framing).
pub const NSDS50_REPLICATION_RESPONSE_OID: &str = "2.16.840.1.113730.3.5.4";
/// End replication request.
pub const END_NSDS50_REPLICATION_REQUEST_OID: &str = "2.16.840.1.113730.3.5.5";
/// Total update entry (DS5.0).
pub const NSDS50_REPLICATION_ENTRY_REQUEST_OID: &str = "2.16.840.1.113730.3.5.6";
/// Total update entry (DS7.1, pipelined).
pub const NSDS71_REPLICATION_ENTRY_REQUEST_OID: &str = "2.16.840.1.113730.3.5.9";
/// Start replication request (DS9.0 framing).
pub const START_NSDS90_REPLICATION_REQUEST_OID: &str = "2.16.840.1.113730.3.5.12";
/// Replication response (DS9.0 framing).
pub const NSDS90_REPLICATION_RESPONSE_OID: &str = "2.16.840.1.113730.3.5.13";
/// CleanAllRUV: purge a replica id.
pub const CLEANRUV_OID: &str = "2.16.840.1.113730.3.6.5";
/// CleanAllRUV: abort a running clean.
pub const CLEANRUV_ABORT_OID: &str = "2.16.840.1.113730.3.6.6";
/// CleanAllRUV: report the local max CSN of a replica id.
pub const CLEANRUV_GET_MAXCSN_OID: &str = "2.16.840.1.113730.3.6.7";
/// CleanAllRUV: report whether a replica id is cleaned.
pub const CLEANRUV_CHECK_STATUS_OID: &str = "2.16.840.1.113730.3.6.8";

/// Password-expired response control.
pub const PWEXPIRED_CONTROL_OID: &str = "2.16.840.1.113730.3.4.4";
/// Password-expiring response control.
pub const PWEXPIRING_CONTROL_OID: &str = "2.16.840.1.113730.3.4.5";

/// LDAP result codes used by the replication layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LdapResultCode {
    /// 0
    Success,
    /// 1
    OperationsError,
    /// 2
    ProtocolError,
    /// 3
    TimeLimitExceeded,
    /// 7
    AuthMethodNotSupported,
    /// 8
    StrongAuthRequired,
    /// 10
    Referral,
    /// 12
    UnavailableCriticalExtension,
    /// 16
    NoSuchAttribute,
    /// 19
    ConstraintViolation,
    /// 20
    TypeOrValueExists,
    /// 21
    InvalidSyntax,
    /// 32
    NoSuchObject,
    /// 34
    InvalidDnSyntax,
    /// 48
    InappropriateAuth,
    /// 49
    InvalidCredentials,
    /// 50
    InsufficientAccess,
    /// 51
    Busy,
    /// 52
    Unavailable,
    /// 53
    UnwillingToPerform,
    /// 64
    NamingViolation,
    /// 65
    ObjectClassViolation,
    /// 66
    NotAllowedOnNonLeaf,
    /// 67
    NotAllowedOnRdn,
    /// 68
    AlreadyExists,
    /// 80
    Other,
    /// 0x51, client side: server went away.
    ServerDown,
    /// 0x52, client side: local library failure.
    LocalError,
    /// 0x55, client side: operation timed out.
    Timeout,
    /// 0x5b, client side: could not connect.
    ConnectError,
}

impl LdapResultCode {
    /// Numeric value as it appears on the wire or in status attributes.
    pub fn code(self) -> u32 {
        match self {
            Self::Success => 0,
            Self::OperationsError => 1,
            Self::ProtocolError => 2,
            Self::TimeLimitExceeded => 3,
            Self::AuthMethodNotSupported => 7,
            Self::StrongAuthRequired => 8,
            Self::Referral => 10,
            Self::UnavailableCriticalExtension => 12,
            Self::NoSuchAttribute => 16,
            Self::ConstraintViolation => 19,
            Self::TypeOrValueExists => 20,
            Self::InvalidSyntax => 21,
            Self::NoSuchObject => 32,
            Self::InvalidDnSyntax => 34,
            Self::InappropriateAuth => 48,
            Self::InvalidCredentials => 49,
            Self::InsufficientAccess => 50,
            Self::Busy => 51,
            Self::Unavailable => 52,
            Self::UnwillingToPerform => 53,
            Self::NamingViolation => 64,
            Self::ObjectClassViolation => 65,
            Self::NotAllowedOnNonLeaf => 66,
            Self::NotAllowedOnRdn => 67,
            Self::AlreadyExists => 68,
            Self::Other => 80,
            Self::ServerDown => 0x51,
            Self::LocalError => 0x52,
            Self::Timeout => 0x55,
            Self::ConnectError => 0x5b,
        }
    }

    /// Errors after which the session handle is unusable and must be torn down.
    pub fn is_disconnect_class(self) -> bool {
        matches!(
            self,
            Self::ServerDown
                | Self::ConnectError
                | Self::InvalidCredentials
                | Self::InappropriateAuth
                | Self::LocalError
        )
    }

    /// Results a supplier treats as "the consumer already has this" and keeps
    /// going past during an incremental update.
    pub fn is_ignorable_for_replay(self) -> bool {
        matches!(
            self,
            Self::Success
                | Self::AlreadyExists
                | Self::NoSuchObject
                | Self::NoSuchAttribute
                | Self::TypeOrValueExists
                | Self::UnwillingToPerform
                | Self::NotAllowedOnNonLeaf
                | Self::ObjectClassViolation
                | Self::InvalidSyntax
                | Self::ConstraintViolation
                | Self::NamingViolation
        )
    }
}

impl fmt::Display for LdapResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

/// A failed LDAP operation as reported by the transport or the peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct LdapError {
    /// Result code.
    pub code: LdapResultCode,
    /// Diagnostic text.
    pub message: String,
}

impl LdapError {
    /// Build an error from a code and message.
    pub fn new(code: LdapResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// In-band replication status returned by a consumer in start/end responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaResponse {
    /// Consumer accepted the session.
    Ready,
    /// Consumer is being updated by someone else.
    Busy,
    /// Supplier clock is too far ahead.
    ExcessiveClockSkew,
    /// Supplier identity may not update this replica.
    PermissionDenied,
    /// Consumer could not decode the request.
    DecodingError,
    /// Consumer does not speak the requested protocol.
    UnknownUpdateProtocol,
    /// Consumer has no replica for the requested root.
    NoSuchReplica,
    /// Consumer's state predates the supplier's retained history.
    BelowPurgePoint,
    /// Consumer-side failure.
    InternalError,
    /// End request succeeded.
    ReleaseSucceeded,
    /// Consumer is a legacy (pre-MMR) consumer.
    LegacyConsumer,
    /// Supplier and consumer share a replica id.
    ReplicaIdError,
    /// Consumer replica is disabled.
    Disabled,
    /// Consumer already has every change the supplier has.
    UpToDate,
    /// Consumer asks the supplier to back off.
    Backoff,
    /// No response was received; produced locally.
    NoResponse,
}

/// What a supplier does with a [`ReplicaResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseDisposition {
    /// Proceed / done.
    Success,
    /// Back off and try again later.
    Retry,
    /// Needs an administrator.
    Fatal,
}

impl ReplicaResponse {
    /// Numeric value.
    pub fn code(self) -> u8 {
        match self {
            Self::Ready => 0x00,
            Self::Busy => 0x01,
            Self::ExcessiveClockSkew => 0x02,
            Self::PermissionDenied => 0x03,
            Self::DecodingError => 0x04,
            Self::UnknownUpdateProtocol => 0x05,
            Self::NoSuchReplica => 0x06,
            Self::BelowPurgePoint => 0x07,
            Self::InternalError => 0x08,
            Self::ReleaseSucceeded => 0x09,
            Self::LegacyConsumer => 0x0A,
            Self::ReplicaIdError => 0x0B,
            Self::Disabled => 0x0C,
            Self::UpToDate => 0x0D,
            Self::Backoff => 0x0E,
            Self::NoResponse => 0xFF,
        }
    }

    /// Decode a numeric response; unknown values map to `None`.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x00 => Self::Ready,
            0x01 => Self::Busy,
            0x02 => Self::ExcessiveClockSkew,
            0x03 => Self::PermissionDenied,
            0x04 => Self::DecodingError,
            0x05 => Self::UnknownUpdateProtocol,
            0x06 => Self::NoSuchReplica,
            0x07 => Self::BelowPurgePoint,
            0x08 => Self::InternalError,
            0x09 => Self::ReleaseSucceeded,
            0x0A => Self::LegacyConsumer,
            0x0B => Self::ReplicaIdError,
            0x0C => Self::Disabled,
            0x0D => Self::UpToDate,
            0x0E => Self::Backoff,
            0xFF => Self::NoResponse,
            _ => return None,
        })
    }

    /// How a supplier reacts to this response.
    pub fn disposition(self) -> ResponseDisposition {
        match self {
            Self::Ready | Self::ReleaseSucceeded | Self::UpToDate => ResponseDisposition::Success,
            Self::Busy
            | Self::Backoff
            | Self::ExcessiveClockSkew
            | Self::InternalError
            | Self::Disabled
            | Self::NoResponse => ResponseDisposition::Retry,
            Self::PermissionDenied
            | Self::DecodingError
            | Self::UnknownUpdateProtocol
            | Self::NoSuchReplica
            | Self::BelowPurgePoint
            | Self::LegacyConsumer
            | Self::ReplicaIdError => ResponseDisposition::Fatal,
        }
    }
}

impl fmt::Display for ReplicaResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({:#04x})", self, self.code())
    }
}

/// Replication metadata attached to a replicated update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateInfoControl {
    /// Unique id of the target entry.
    pub uniqueid: String,
    /// New superior unique id (rename) or parent unique id (add).
    pub superior_uniqueid: Option<String>,
    /// CSN of the operation.
    pub csn: Csn,
    /// Side-effect modifications (rename metadata).
    pub modrdn_mods: Vec<Mod>,
}

/// Replication extended requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExtendedRequest {
    /// Begin a total or incremental session.
    StartReplication {
        /// Update protocol OID (total / incremental, DS5.0 / DS7.1).
        protocol_oid: String,
        /// Root of the replicated subtree.
        repl_root: String,
        /// Supplier's RUV.
        supplier_ruv: Ruv,
        /// A fresh supplier CSN, used for clock-skew checks.
        csn: Csn,
    },
    /// End the current session.
    EndReplication {
        /// Root of the replicated subtree.
        repl_root: String,
    },
    /// One entry of a total update.
    ReplicationEntry {
        /// The entry, including replication state.
        entry: Entry,
    },
    /// Purge a replica id from the RUV and changelog.
    CleanRuv {
        /// Root of the replicated subtree.
        repl_root: String,
        /// Replica id being retired.
        rid: ReplicaId,
        /// Topology-wide max CSN for the rid.
        max_csn: Option<Csn>,
        /// Skip peers that cannot be reached.
        force: bool,
    },
    /// Abort a clean of a replica id.
    AbortCleanRuv {
        /// Root of the replicated subtree.
        repl_root: String,
        /// Replica id.
        rid: ReplicaId,
    },
    /// Ask for the local max CSN of a replica id.
    CleanRuvGetMaxCsn {
        /// Root of the replicated subtree.
        repl_root: String,
        /// Replica id.
        rid: ReplicaId,
    },
    /// Ask whether a replica id is cleaned.
    CleanRuvCheckStatus {
        /// Root of the replicated subtree.
        repl_root: String,
        /// Replica id.
        rid: ReplicaId,
    },
}

/// Body of an extended response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtendedResponse {
    /// Response OID.
    pub oid: Option<String>,
    /// In-band replication status.
    pub response: Option<ReplicaResponse>,
    /// Consumer RUV returned on a successful start.
    pub ruv: Option<Ruv>,
    /// Free-form value (max CSN, clean status).
    pub value: Option<String>,
}

/// A request sent on a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LdapRequest {
    /// Add.
    Add {
        /// Target DN.
        dn: String,
        /// Attributes.
        attrs: Vec<(String, Vec<String>)>,
        /// Replication metadata.
        control: Option<UpdateInfoControl>,
    },
    /// Delete.
    Delete {
        /// Target DN.
        dn: String,
        /// Replication metadata.
        control: Option<UpdateInfoControl>,
    },
    /// Modify.
    Modify {
        /// Target DN.
        dn: String,
        /// Modifications.
        mods: Vec<Mod>,
        /// Replication metadata.
        control: Option<UpdateInfoControl>,
    },
    /// Rename.
    Rename {
        /// Target DN.
        dn: String,
        /// New RDN.
        new_rdn: String,
        /// New superior DN.
        new_superior: Option<String>,
        /// Remove the old RDN values.
        delete_old_rdn: bool,
        /// Replication metadata.
        control: Option<UpdateInfoControl>,
    },
    /// Extended operation.
    Extended {
        /// Request OID.
        oid: String,
        /// Decoded payload.
        request: ExtendedRequest,
    },
}

impl LdapRequest {
    /// Short label used for connection status and logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Add { .. } => "add",
            Self::Delete { .. } => "delete",
            Self::Modify { .. } => "modify",
            Self::Rename { .. } => "rename",
            Self::Extended { .. } => "extended",
        }
    }
}

/// Message id assigned by the transport.
pub type MessageId = u32;

/// Advisory controls a server may return on bind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseControl {
    /// The bind password has expired.
    PasswordExpired,
    /// The bind password expires in this many seconds.
    PasswordExpiring {
        /// Seconds until expiry.
        seconds: u64,
    },
}

/// A result read back from a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LdapResponse {
    /// Message id of the request this answers.
    pub msgid: MessageId,
    /// Result code.
    pub code: LdapResultCode,
    /// Diagnostic text.
    pub message: String,
    /// Extended response body, for extended operations.
    pub extended: Option<ExtendedResponse>,
}

impl LdapResponse {
    /// A plain result.
    pub fn new(msgid: MessageId, code: LdapResultCode) -> Self {
        Self {
            msgid,
            code,
            message: String::new(),
            extended: None,
        }
    }
}

/// Search scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchScope {
    /// Base object only.
    Base,
    /// Direct children.
    OneLevel,
    /// Whole subtree.
    Subtree,
}

/// A search request, used for capability queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Search base.
    pub base: String,
    /// Scope.
    pub scope: SearchScope,
    /// Filter in string form.
    pub filter: String,
    /// Attributes to return.
    pub attrs: Vec<String>,
}

/// One search result entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchEntry {
    /// Entry DN.
    pub dn: String,
    /// Returned attributes, lowercase names.
    pub attrs: Vec<(String, Vec<String>)>,
}

impl SearchEntry {
    /// Values of an attribute, matched case-insensitively.
    pub fn values<'a>(&'a self, attr: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.attrs
            .iter()
            .filter(move |(name, _)| name.eq_ignore_ascii_case(attr))
            .flat_map(|(_, values)| values.iter().map(String::as_str))
    }
}
