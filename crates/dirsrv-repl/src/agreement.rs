//! Replication agreements: the configured link from this server to one peer.
//!
//! An [`Agreement`] carries validated settings, the status records an
//! operator reads, a cache of the consumer's RUV and the flags its
//! [`Connection`](crate::connection::Connection) polls to notice
//! configuration changes. Every mutable attribute has its own validating
//! setter; [`AgreementSettings::apply`] dispatches by attribute name so a
//! multi-attribute change can be validated against a copy and committed as a
//! whole.

use crate::dn::Dn;
use crate::error::ReplError;
use crate::fractional::{
    FractionalConfig, FractionalList, ATTR_FRACTIONAL_LIST, ATTR_FRACTIONAL_LIST_TOTAL, ATTR_STRIP_ATTRS,
};
use crate::ldap::{LdapResultCode, ReplicaResponse};
use crate::ruv::Ruv;
use crate::schedule::{Schedule, ATTR_UPDATE_SCHEDULE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

/// Peer host name.
pub const ATTR_HOST: &str = "nsds5replicahost";
/// Peer port.
pub const ATTR_PORT: &str = "nsds5replicaport";
/// `LDAP`, `SSL`/`LDAPS` or `TLS`/`StartTLS`.
pub const ATTR_TRANSPORT: &str = "nsds5replicatransportinfo";
/// `SIMPLE`, `SSLCLIENTAUTH`, `SASL/GSSAPI` or `SASL/DIGEST-MD5`.
pub const ATTR_BIND_METHOD: &str = "nsds5replicabindmethod";
/// Bind DN used on the peer.
pub const ATTR_BIND_DN: &str = "nsds5replicabinddn";
/// Stored (encoded) bind credentials.
pub const ATTR_CREDENTIALS: &str = "nsds5replicacredentials";
/// Per-operation timeout in seconds.
pub const ATTR_TIMEOUT: &str = "nsds5replicatimeout";
/// `on` / `off`.
pub const ATTR_ENABLED: &str = "nsds5replicaenabled";
/// Seconds a supplier waits after a busy consumer before retrying.
pub const ATTR_BUSY_WAIT: &str = "nsds5replicabusywaittime";
/// Seconds to pause between sessions.
pub const ATTR_SESSION_PAUSE: &str = "nsds5replicasessionpausetime";
/// Minimum backoff in seconds.
pub const ATTR_BACKOFF_MIN: &str = "nsds5replicabackoffmin";
/// Maximum backoff in seconds.
pub const ATTR_BACKOFF_MAX: &str = "nsds5replicabackoffmax";
/// Pipelined operations allowed in flight.
pub const ATTR_FLOW_WINDOW: &str = "nsds5replicaflowcontrolwindow";
/// Changes sent per session before the session ends and reschedules.
pub const ATTR_SESSION_LIMIT: &str = "nsds5replicasessionchangelimit";
/// Attributes whose changes replicate outside the schedule windows.
pub const ATTR_PRIORITY_ATTRS: &str = "nsds5replicaschedulepriorityattrs";
/// Total-update command channel: `start`, `stop`, `cancel`.
pub const ATTR_INITIALIZE: &str = "nsds5replicainitialize";
/// Free-form description.
pub const ATTR_DESCRIPTION: &str = "description";

/// Default per-operation timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
/// Default minimum backoff.
pub const DEFAULT_BACKOFF_MIN: Duration = Duration::from_secs(3);
/// Default maximum backoff.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(300);
/// Default wait after a busy consumer.
pub const DEFAULT_BUSY_WAIT: Duration = Duration::from_secs(3);
/// Default pipelining window.
pub const DEFAULT_FLOW_WINDOW: usize = 1000;
/// Default per-session change limit.
pub const DEFAULT_SESSION_LIMIT: usize = 10_000;

fn reject(attr: &str, msg: impl Into<String>) -> ReplError {
    ReplError::ConfigRejected {
        attr: attr.to_string(),
        code: LdapResultCode::UnwillingToPerform,
        msg: msg.into(),
    }
}

/// Transport security used to reach the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Plain LDAP.
    #[default]
    Ldap,
    /// LDAP over SSL.
    Ldaps,
    /// LDAP upgraded with StartTLS.
    StartTls,
}

impl Transport {
    /// Parse the attribute value.
    pub fn parse(value: &str) -> Result<Self, ReplError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ldap" => Ok(Self::Ldap),
            "ssl" | "ldaps" => Ok(Self::Ldaps),
            "tls" | "starttls" => Ok(Self::StartTls),
            other => Err(reject(ATTR_TRANSPORT, format!("unknown transport {other:?}"))),
        }
    }

    /// True if the security subsystem must be up to use this transport.
    pub fn requires_security(self) -> bool {
        !matches!(self, Self::Ldap)
    }
}

/// How the supplier authenticates to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BindMethod {
    /// Simple bind with DN and password.
    #[default]
    Simple,
    /// TLS client certificate, bound with SASL EXTERNAL.
    SslClientAuth,
    /// SASL GSSAPI.
    SaslGssapi,
    /// SASL DIGEST-MD5.
    SaslDigestMd5,
}

impl BindMethod {
    /// Parse the attribute value.
    pub fn parse(value: &str) -> Result<Self, ReplError> {
        match value.trim().to_ascii_uppercase().as_str() {
            "" | "SIMPLE" => Ok(Self::Simple),
            "SSLCLIENTAUTH" => Ok(Self::SslClientAuth),
            "SASL/GSSAPI" => Ok(Self::SaslGssapi),
            "SASL/DIGEST-MD5" => Ok(Self::SaslDigestMd5),
            other => Err(reject(ATTR_BIND_METHOD, format!("unknown bind method {other:?}"))),
        }
    }

    /// SASL mechanism, or `None` for a simple bind.
    pub fn sasl_mechanism(self) -> Option<&'static str> {
        match self {
            Self::Simple => None,
            Self::SslClientAuth => Some("EXTERNAL"),
            Self::SaslGssapi => Some("GSSAPI"),
            Self::SaslDigestMd5 => Some("DIGEST-MD5"),
        }
    }
}

/// Where and how to connect, as a connection sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTarget {
    /// Host name.
    pub host: String,
    /// Port.
    pub port: u16,
    /// Transport security.
    pub transport: Transport,
    /// Bind method.
    pub bind_method: BindMethod,
    /// Bind DN.
    pub bind_dn: String,
    /// Per-operation timeout.
    pub timeout: Duration,
}

impl fmt::Display for PeerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// What a settings change affects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingEffect {
    /// Connection parameters; the next connect re-reads them.
    Connection,
    /// Credentials; the cached plaintext must be dropped.
    Credentials,
    /// Schedule windows; window timers must be recomputed.
    Schedule,
    /// Enabled flag changed to the given value.
    Enabled(bool),
    /// Fractional lists.
    Fractional,
    /// Session tuning or description.
    Other,
}

/// Validated agreement settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgreementSettings {
    /// Peer host.
    pub host: String,
    /// Peer port.
    pub port: u16,
    /// Transport security.
    pub transport: Transport,
    /// Bind method.
    pub bind_method: BindMethod,
    /// Bind DN.
    pub bind_dn: String,
    /// Encoded credentials.
    pub credentials: String,
    /// Per-operation timeout.
    pub timeout: Duration,
    /// Update schedule.
    pub schedule: Schedule,
    /// Fractional lists.
    pub fractional: FractionalConfig,
    /// Whether the agreement runs.
    pub enabled: bool,
    /// Wait after a busy consumer.
    pub busy_wait: Duration,
    /// Pause between sessions.
    pub session_pause: Duration,
    /// Minimum backoff.
    pub backoff_min: Duration,
    /// Maximum backoff.
    pub backoff_max: Duration,
    /// Pipelined operations in flight.
    pub flow_window: usize,
    /// Changes per session.
    pub session_limit: usize,
    /// Description.
    pub description: Option<String>,
}

impl Default for AgreementSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 389,
            transport: Transport::Ldap,
            bind_method: BindMethod::Simple,
            bind_dn: String::new(),
            credentials: String::new(),
            timeout: DEFAULT_TIMEOUT,
            schedule: Schedule::always(),
            fractional: FractionalConfig::default(),
            enabled: true,
            busy_wait: DEFAULT_BUSY_WAIT,
            session_pause: Duration::ZERO,
            backoff_min: DEFAULT_BACKOFF_MIN,
            backoff_max: DEFAULT_BACKOFF_MAX,
            flow_window: DEFAULT_FLOW_WINDOW,
            session_limit: DEFAULT_SESSION_LIMIT,
            description: None,
        }
    }
}

fn single<'a>(attr: &str, values: &'a [String]) -> Result<Option<&'a str>, ReplError> {
    match values {
        [] => Ok(None),
        [value] => Ok(Some(value.trim())),
        _ => Err(reject(attr, "single-valued attribute")),
    }
}

fn parse_number<T: std::str::FromStr>(attr: &str, value: &str) -> Result<T, ReplError> {
    value
        .parse()
        .map_err(|_| reject(attr, format!("{value:?} is not a valid number")))
}

fn parse_secs(attr: &str, value: &str) -> Result<Duration, ReplError> {
    Ok(Duration::from_secs(parse_number::<u64>(attr, value)?))
}

impl AgreementSettings {
    /// Validate and set the peer host.
    pub fn set_host(&mut self, host: &str) -> Result<SettingEffect, ReplError> {
        let host = host.trim();
        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(reject(ATTR_HOST, format!("invalid host {host:?}")));
        }
        self.host = host.to_string();
        Ok(SettingEffect::Connection)
    }

    /// Validate and set the peer port.
    pub fn set_port(&mut self, port: u16) -> Result<SettingEffect, ReplError> {
        if port == 0 {
            return Err(reject(ATTR_PORT, "port must be between 1 and 65535"));
        }
        self.port = port;
        Ok(SettingEffect::Connection)
    }

    /// Set the transport.
    pub fn set_transport(&mut self, transport: Transport) -> Result<SettingEffect, ReplError> {
        self.transport = transport;
        Ok(SettingEffect::Connection)
    }

    /// Set the bind method.
    pub fn set_bind_method(&mut self, method: BindMethod) -> Result<SettingEffect, ReplError> {
        self.bind_method = method;
        Ok(SettingEffect::Connection)
    }

    /// Validate and set the bind DN.
    pub fn set_bind_dn(&mut self, bind_dn: &str) -> Result<SettingEffect, ReplError> {
        if !bind_dn.is_empty() {
            Dn::parse(bind_dn).map_err(|e| reject(ATTR_BIND_DN, e.to_string()))?;
        }
        self.bind_dn = bind_dn.to_string();
        Ok(SettingEffect::Connection)
    }

    /// Set the encoded credentials.
    pub fn set_credentials(&mut self, credentials: &str) -> Result<SettingEffect, ReplError> {
        self.credentials = credentials.to_string();
        Ok(SettingEffect::Credentials)
    }

    /// Validate and set the per-operation timeout.
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<SettingEffect, ReplError> {
        if timeout.is_zero() {
            return Err(reject(ATTR_TIMEOUT, "timeout must be positive"));
        }
        self.timeout = timeout;
        Ok(SettingEffect::Connection)
    }

    /// Parse and set the schedule windows, keeping priority attributes.
    pub fn set_schedule<S: AsRef<str>>(&mut self, windows: &[S]) -> Result<SettingEffect, ReplError> {
        let priority = self.schedule.priority_attrs().to_vec();
        self.schedule = Schedule::parse(windows)?.with_priority_attrs(priority);
        Ok(SettingEffect::Schedule)
    }

    /// Set the attributes whose changes bypass the schedule.
    pub fn set_priority_attrs(&mut self, attrs: Vec<String>) -> Result<SettingEffect, ReplError> {
        self.schedule = self.schedule.clone().with_priority_attrs(attrs);
        Ok(SettingEffect::Schedule)
    }

    /// Parse and set the incremental fractional list; `None` clears it.
    pub fn set_fractional(&mut self, value: Option<&str>) -> Result<SettingEffect, ReplError> {
        self.fractional.incremental = match value {
            Some(v) => FractionalList::parse(ATTR_FRACTIONAL_LIST, v)?,
            None => FractionalList::default(),
        };
        Ok(SettingEffect::Fractional)
    }

    /// Parse and set the total fractional list; `None` falls back to the
    /// incremental list.
    pub fn set_fractional_total(&mut self, value: Option<&str>) -> Result<SettingEffect, ReplError> {
        self.fractional.total = value
            .map(|v| FractionalList::parse(ATTR_FRACTIONAL_LIST_TOTAL, v))
            .transpose()?;
        Ok(SettingEffect::Fractional)
    }

    /// Set the strip attributes.
    pub fn set_strip_attrs(&mut self, value: Option<&str>) -> Result<SettingEffect, ReplError> {
        self.fractional.strip = value.map(FractionalConfig::parse_strip).unwrap_or_default();
        Ok(SettingEffect::Fractional)
    }

    /// Enable or disable.
    pub fn set_enabled(&mut self, enabled: bool) -> Result<SettingEffect, ReplError> {
        self.enabled = enabled;
        Ok(SettingEffect::Enabled(enabled))
    }

    /// Validate and set the backoff bounds.
    pub fn set_backoff(&mut self, min: Duration, max: Duration) -> Result<SettingEffect, ReplError> {
        if min.is_zero() {
            return Err(reject(ATTR_BACKOFF_MIN, "minimum backoff must be positive"));
        }
        if max < min {
            return Err(reject(ATTR_BACKOFF_MAX, "maximum backoff is below the minimum"));
        }
        self.backoff_min = min;
        self.backoff_max = max;
        Ok(SettingEffect::Other)
    }

    /// Validate and set the pipelining window.
    pub fn set_flow_window(&mut self, window: usize) -> Result<SettingEffect, ReplError> {
        if window == 0 {
            return Err(reject(ATTR_FLOW_WINDOW, "window must be positive"));
        }
        self.flow_window = window;
        Ok(SettingEffect::Other)
    }

    /// Validate and set the per-session change limit.
    pub fn set_session_limit(&mut self, limit: usize) -> Result<SettingEffect, ReplError> {
        if limit == 0 {
            return Err(reject(ATTR_SESSION_LIMIT, "limit must be positive"));
        }
        self.session_limit = limit;
        Ok(SettingEffect::Other)
    }

    /// Apply one attribute change; empty `values` deletes the attribute.
    pub fn apply(&mut self, attr: &str, values: &[String]) -> Result<SettingEffect, ReplError> {
        let name = attr.to_ascii_lowercase();
        let value = single(&name, values);
        match name.as_str() {
            ATTR_HOST => match value? {
                Some(v) => self.set_host(v),
                None => Err(reject(ATTR_HOST, "host may not be removed")),
            },
            ATTR_PORT => match value? {
                Some(v) => self.set_port(parse_number(ATTR_PORT, v)?),
                None => Err(reject(ATTR_PORT, "port may not be removed")),
            },
            ATTR_TRANSPORT => self.set_transport(value?.map(Transport::parse).transpose()?.unwrap_or_default()),
            ATTR_BIND_METHOD => {
                self.set_bind_method(value?.map(BindMethod::parse).transpose()?.unwrap_or_default())
            }
            ATTR_BIND_DN => self.set_bind_dn(value?.unwrap_or("")),
            ATTR_CREDENTIALS => self.set_credentials(value?.unwrap_or("")),
            ATTR_TIMEOUT => {
                let timeout = match value? {
                    Some(v) => parse_secs(ATTR_TIMEOUT, v)?,
                    None => DEFAULT_TIMEOUT,
                };
                self.set_timeout(timeout)
            }
            ATTR_UPDATE_SCHEDULE => self.set_schedule(values),
            ATTR_PRIORITY_ATTRS => self.set_priority_attrs(
                values
                    .iter()
                    .flat_map(|v| v.split_whitespace().map(str::to_string))
                    .collect(),
            ),
            ATTR_FRACTIONAL_LIST => self.set_fractional(value?),
            ATTR_FRACTIONAL_LIST_TOTAL => self.set_fractional_total(value?),
            ATTR_STRIP_ATTRS => self.set_strip_attrs(value?),
            ATTR_ENABLED => match value?.map(str::to_ascii_lowercase).as_deref() {
                None | Some("on") => self.set_enabled(true),
                Some("off") => self.set_enabled(false),
                Some(other) => Err(reject(ATTR_ENABLED, format!("expected on or off, got {other:?}"))),
            },
            ATTR_BUSY_WAIT => {
                self.busy_wait = match value? {
                    Some(v) => parse_secs(ATTR_BUSY_WAIT, v)?,
                    None => DEFAULT_BUSY_WAIT,
                };
                Ok(SettingEffect::Other)
            }
            ATTR_SESSION_PAUSE => {
                self.session_pause = match value? {
                    Some(v) => parse_secs(ATTR_SESSION_PAUSE, v)?,
                    None => Duration::ZERO,
                };
                Ok(SettingEffect::Other)
            }
            ATTR_BACKOFF_MIN => {
                let min = match value? {
                    Some(v) => parse_secs(ATTR_BACKOFF_MIN, v)?,
                    None => DEFAULT_BACKOFF_MIN,
                };
                self.set_backoff(min, self.backoff_max)
            }
            ATTR_BACKOFF_MAX => {
                let max = match value? {
                    Some(v) => parse_secs(ATTR_BACKOFF_MAX, v)?,
                    None => DEFAULT_BACKOFF_MAX,
                };
                self.set_backoff(self.backoff_min, max)
            }
            ATTR_FLOW_WINDOW => self.set_flow_window(match value? {
                Some(v) => parse_number(ATTR_FLOW_WINDOW, v)?,
                None => DEFAULT_FLOW_WINDOW,
            }),
            ATTR_SESSION_LIMIT => self.set_session_limit(match value? {
                Some(v) => parse_number(ATTR_SESSION_LIMIT, v)?,
                None => DEFAULT_SESSION_LIMIT,
            }),
            ATTR_DESCRIPTION => {
                self.description = value?.map(str::to_string);
                Ok(SettingEffect::Other)
            }
            _ => Err(reject(attr, "attribute cannot be modified on an agreement")),
        }
    }
}

/// `nsds5ReplicaInitialize` commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitCommand {
    /// Begin a total update.
    Start,
    /// Abort a running total update.
    Stop,
    /// Mark a pending total update done without running it.
    Cancel,
}

impl InitCommand {
    /// Parse the attribute value.
    pub fn parse(value: &str) -> Result<Self, ReplError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "cancel" => Ok(Self::Cancel),
            other => Err(reject(ATTR_INITIALIZE, format!("unknown command {other:?}"))),
        }
    }
}

/// Operator-visible record of the last update or initialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStatus {
    /// LDAP result code of the last session.
    pub ldap_code: LdapResultCode,
    /// Replication response, when the consumer sent one.
    pub repl_code: Option<ReplicaResponse>,
    /// Free text.
    pub message: String,
    /// True while a session runs.
    pub in_progress: bool,
    /// Session start.
    pub started: Option<DateTime<Utc>>,
    /// Session end.
    pub ended: Option<DateTime<Utc>>,
    /// Changes or entries sent by the session.
    pub sent: u64,
}

impl Default for UpdateStatus {
    fn default() -> Self {
        Self {
            ldap_code: LdapResultCode::Success,
            repl_code: None,
            message: "no session has run".to_string(),
            in_progress: false,
            started: None,
            ended: None,
            sent: 0,
        }
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = if self.ldap_code == LdapResultCode::Success
            && self.repl_code.map_or(true, |r| r.disposition() == crate::ldap::ResponseDisposition::Success)
        {
            "Ok"
        } else {
            "Error"
        };
        write!(f, "{} ({}) ", label, self.ldap_code.code())?;
        if let Some(repl) = self.repl_code {
            write!(f, "[{}] ", repl)?;
        }
        f.write_str(&self.message)
    }
}

/// One configured replication agreement.
pub struct Agreement {
    dn: Dn,
    name: String,
    root: Dn,
    settings: RwLock<AgreementSettings>,
    changed: AtomicBool,
    credentials_changed: AtomicBool,
    consumer_ruv: RwLock<Option<Ruv>>,
    last_update: RwLock<UpdateStatus>,
    last_init: RwLock<UpdateStatus>,
    last_error: Mutex<Option<String>>,
    changes_sent: AtomicU64,
}

impl Agreement {
    /// Create an agreement. `dn` is its configuration entry; its RDN value is
    /// the agreement name.
    pub fn new(dn: Dn, root: Dn, settings: AgreementSettings) -> Result<Self, ReplError> {
        let name = dn
            .rdn_avas()
            .into_iter()
            .next()
            .map(|(_, value)| value)
            .ok_or_else(|| ReplError::InvalidDn {
                dn: dn.to_string(),
                msg: "agreement DN has no RDN".to_string(),
            })?;
        if settings.host.is_empty() {
            return Err(reject(ATTR_HOST, "agreement has no peer host"));
        }
        Ok(Self {
            dn,
            name,
            root,
            settings: RwLock::new(settings),
            changed: AtomicBool::new(false),
            credentials_changed: AtomicBool::new(false),
            consumer_ruv: RwLock::new(None),
            last_update: RwLock::new(UpdateStatus::default()),
            last_init: RwLock::new(UpdateStatus::default()),
            last_error: Mutex::new(None),
            changes_sent: AtomicU64::new(0),
        })
    }

    /// Configuration DN.
    pub fn dn(&self) -> &Dn {
        &self.dn
    }

    /// Agreement name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Root of the replicated subtree.
    pub fn root(&self) -> &Dn {
        &self.root
    }

    /// Snapshot of the settings.
    pub fn settings(&self) -> AgreementSettings {
        self.settings.read().map(|s| s.clone()).unwrap_or_default()
    }

    /// Validate every change against a copy, then commit them together.
    /// Nothing changes if any single change is refused.
    pub fn apply_changes(&self, changes: &[(String, Vec<String>)]) -> Result<Vec<SettingEffect>, ReplError> {
        let mut settings = self.settings.write().map_err(|_| ReplError::poisoned("agreement"))?;
        let mut candidate = settings.clone();
        let effects = changes
            .iter()
            .map(|(attr, values)| candidate.apply(attr, values))
            .collect::<Result<Vec<_>, _>>()?;
        *settings = candidate;
        drop(settings);
        self.note_effects(&effects);
        Ok(effects)
    }

    /// Apply a change through one of the typed setters.
    pub fn update<F>(&self, f: F) -> Result<SettingEffect, ReplError>
    where
        F: FnOnce(&mut AgreementSettings) -> Result<SettingEffect, ReplError>,
    {
        let mut settings = self.settings.write().map_err(|_| ReplError::poisoned("agreement"))?;
        let mut candidate = settings.clone();
        let effect = f(&mut candidate)?;
        *settings = candidate;
        drop(settings);
        self.note_effects(&[effect]);
        Ok(effect)
    }

    fn note_effects(&self, effects: &[SettingEffect]) {
        for effect in effects {
            match effect {
                SettingEffect::Connection => self.changed.store(true, Ordering::Release),
                SettingEffect::Credentials => {
                    self.changed.store(true, Ordering::Release);
                    self.credentials_changed.store(true, Ordering::Release);
                }
                _ => {}
            }
        }
    }

    /// Consume the connection-settings-changed flag.
    pub fn take_changed(&self) -> bool {
        self.changed.swap(false, Ordering::AcqRel)
    }

    /// Consume the credentials-changed flag.
    pub fn take_credentials_changed(&self) -> bool {
        self.credentials_changed.swap(false, Ordering::AcqRel)
    }

    /// Connection parameters.
    pub fn peer_target(&self) -> PeerTarget {
        let s = self.settings();
        PeerTarget {
            host: s.host,
            port: s.port,
            transport: s.transport,
            bind_method: s.bind_method,
            bind_dn: s.bind_dn,
            timeout: s.timeout,
        }
    }

    /// Encoded credentials.
    pub fn credentials(&self) -> String {
        self.settings().credentials
    }

    /// True if the agreement should run.
    pub fn is_enabled(&self) -> bool {
        self.settings.read().map(|s| s.enabled).unwrap_or(false)
    }

    /// Last known consumer RUV.
    pub fn consumer_ruv(&self) -> Option<Ruv> {
        self.consumer_ruv.read().ok().and_then(|r| r.clone())
    }

    /// Remember the consumer RUV.
    pub fn set_consumer_ruv(&self, ruv: Option<Ruv>) {
        if let Ok(mut slot) = self.consumer_ruv.write() {
            *slot = ruv;
        }
    }

    /// Mark an incremental session as started.
    pub fn begin_update(&self) {
        Self::begin(&self.last_update);
    }

    /// Record how an incremental session ended.
    pub fn end_update(&self, ldap_code: LdapResultCode, repl_code: Option<ReplicaResponse>, message: &str, sent: u64) {
        self.changes_sent.fetch_add(sent, Ordering::Relaxed);
        Self::end(&self.last_update, ldap_code, repl_code, message, sent);
    }

    /// Mark a total update as started.
    pub fn begin_init(&self) {
        Self::begin(&self.last_init);
    }

    /// Record how a total update ended.
    pub fn end_init(&self, ldap_code: LdapResultCode, repl_code: Option<ReplicaResponse>, message: &str, sent: u64) {
        Self::end(&self.last_init, ldap_code, repl_code, message, sent);
    }

    fn begin(slot: &RwLock<UpdateStatus>) {
        if let Ok(mut status) = slot.write() {
            status.in_progress = true;
            status.started = Some(Utc::now());
            status.ended = None;
            status.sent = 0;
        }
    }

    fn end(
        slot: &RwLock<UpdateStatus>,
        ldap_code: LdapResultCode,
        repl_code: Option<ReplicaResponse>,
        message: &str,
        sent: u64,
    ) {
        if let Ok(mut status) = slot.write() {
            status.ldap_code = ldap_code;
            status.repl_code = repl_code;
            status.message = message.to_string();
            status.in_progress = false;
            status.ended = Some(Utc::now());
            status.sent = sent;
        }
    }

    /// Last incremental update status.
    pub fn update_status(&self) -> UpdateStatus {
        self.last_update.read().map(|s| s.clone()).unwrap_or_default()
    }

    /// Last total update status.
    pub fn init_status(&self) -> UpdateStatus {
        self.last_init.read().map(|s| s.clone()).unwrap_or_default()
    }

    /// Changes sent over the agreement's lifetime.
    pub fn changes_sent(&self) -> u64 {
        self.changes_sent.load(Ordering::Relaxed)
    }

    /// Log a session error: `warn` the first time, `debug` while it repeats.
    /// Returns true if it was logged at `warn`.
    pub fn log_session_error(&self, error: &str) -> bool {
        let Ok(mut last) = self.last_error.lock() else {
            return false;
        };
        if last.as_deref() == Some(error) {
            debug!(agreement = %self.name, error, "replication session error repeated");
            false
        } else {
            warn!(agreement = %self.name, error, "replication session failed");
            *last = Some(error.to_string());
            true
        }
    }

    /// Forget the last error after a successful session.
    pub fn clear_session_error(&self) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = None;
        }
    }
}

impl fmt::Debug for Agreement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agreement")
            .field("dn", &self.dn)
            .field("root", &self.root)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agreement() -> Agreement {
        let settings = AgreementSettings {
            host: "peer.example".to_string(),
            ..Default::default()
        };
        Agreement::new(
            Dn::parse("cn=to-peer,cn=replica,cn=config").unwrap(),
            Dn::parse("dc=example").unwrap(),
            settings,
        )
        .unwrap()
    }

    fn change(attr: &str, values: &[&str]) -> (String, Vec<String>) {
        (attr.to_string(), values.iter().map(|v| v.to_string()).collect())
    }

    mod setters {
        use super::*;

        #[test]
        fn test_name_from_dn() {
            assert_eq!(agreement().name(), "to-peer");
        }

        #[test]
        fn test_requires_host() {
            let err = Agreement::new(
                Dn::parse("cn=x,cn=config").unwrap(),
                Dn::parse("dc=example").unwrap(),
                AgreementSettings::default(),
            )
            .unwrap_err();
            assert_eq!(err.result_code(), LdapResultCode::UnwillingToPerform);
        }

        #[test]
        fn test_apply_parses_values() {
            let a = agreement();
            a.apply_changes(&[
                change(ATTR_PORT, &["636"]),
                change(ATTR_TRANSPORT, &["SSL"]),
                change(ATTR_BIND_METHOD, &["SASL/GSSAPI"]),
                change(ATTR_TIMEOUT, &["30"]),
            ])
            .unwrap();
            let target = a.peer_target();
            assert_eq!(target.port, 636);
            assert_eq!(target.transport, Transport::Ldaps);
            assert_eq!(target.bind_method.sasl_mechanism(), Some("GSSAPI"));
            assert_eq!(target.timeout, Duration::from_secs(30));
            assert!(a.take_changed());
            assert!(!a.take_changed());
        }

        #[test]
        fn test_batch_is_atomic() {
            let a = agreement();
            let err = a
                .apply_changes(&[
                    change(ATTR_PORT, &["1389"]),
                    change(ATTR_FRACTIONAL_LIST, &["(objectclass=*) $ EXCLUDE objectclass"]),
                ])
                .unwrap_err();
            assert_eq!(err.result_code(), LdapResultCode::UnwillingToPerform);
            assert_eq!(a.settings().port, 389);
            assert!(!a.take_changed());
        }

        #[test]
        fn test_credentials_flag() {
            let a = agreement();
            a.update(|s| s.set_credentials("{CLEAR}secret")).unwrap();
            assert!(a.take_credentials_changed());
            assert_eq!(a.credentials(), "{CLEAR}secret");
        }

        #[test]
        fn test_enabled_and_schedule() {
            let a = agreement();
            let effects = a
                .apply_changes(&[change(ATTR_ENABLED, &["off"]), change(ATTR_UPDATE_SCHEDULE, &["0800-1700 12345"])])
                .unwrap();
            assert_eq!(effects, vec![SettingEffect::Enabled(false), SettingEffect::Schedule]);
            assert!(!a.is_enabled());
            assert!(!a.settings().schedule.is_always());
            assert!(a.apply_changes(&[change(ATTR_UPDATE_SCHEDULE, &["25:00"])]).is_err());
        }

        #[test]
        fn test_backoff_bounds() {
            let a = agreement();
            assert!(a.apply_changes(&[change(ATTR_BACKOFF_MAX, &["1"])]).is_err());
            a.apply_changes(&[change(ATTR_BACKOFF_MIN, &["1"]), change(ATTR_BACKOFF_MAX, &["10"])])
                .unwrap();
            assert_eq!(a.settings().backoff_max, Duration::from_secs(10));
        }

        #[test]
        fn test_unknown_attribute_refused() {
            let a = agreement();
            assert!(a.apply_changes(&[change("nsds5replicaroot", &["dc=other"])]).is_err());
            assert!(a.apply_changes(&[change(ATTR_HOST, &[])]).is_err());
        }
    }

    mod status {
        use super::*;

        #[test]
        fn test_update_status_roundtrip() {
            let a = agreement();
            a.begin_update();
            assert!(a.update_status().in_progress);
            a.end_update(LdapResultCode::Success, Some(ReplicaResponse::Ready), "incremental update succeeded", 3);
            let status = a.update_status();
            assert!(!status.in_progress);
            assert_eq!(status.sent, 3);
            assert!(status.to_string().starts_with("Ok (0)"));
            assert_eq!(a.changes_sent(), 3);
        }

        #[test]
        fn test_error_status_display() {
            let a = agreement();
            a.end_init(LdapResultCode::ServerDown, None, "peer unreachable", 0);
            assert!(a.init_status().to_string().starts_with("Error (81)"));
        }

        #[test]
        fn test_error_dedup() {
            let a = agreement();
            assert!(a.log_session_error("server down"));
            assert!(!a.log_session_error("server down"));
            assert!(a.log_session_error("busy"));
            a.clear_session_error();
            assert!(a.log_session_error("busy"));
        }

        #[test]
        fn test_init_command() {
            assert_eq!(InitCommand::parse("START").unwrap(), InitCommand::Start);
            assert!(InitCommand::parse("restart").is_err());
        }
    }
}
