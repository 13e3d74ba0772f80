//! Connection state machine for one agreement's link to its peer.
//!
//! The transport itself is pluggable through [`LdapConnector`] and
//! [`LdapSession`]. [`Connection`] adds the replication contract on top:
//! settings re-read after an agreement change, credentials decoded once and
//! cached, a writability wait before every send, teardown on
//! disconnect-class errors, a bounded result wait that gives way to
//! shutdown, per-connection capability caching and linger-before-close.

use crate::agreement::{Agreement, BindMethod, PeerTarget};
use crate::csn::{ReplicaId, READ_ONLY_REPLICA_ID};
use crate::event_queue::{CancelOutcome, EventHandle, EventQueue, EventSink};
use crate::ldap::{
    ExtendedRequest, ExtendedResponse, LdapError, LdapRequest, LdapResponse, LdapResultCode, MessageId,
    ResponseControl, SearchEntry, SearchRequest, SearchScope, UpdateInfoControl, END_NSDS50_REPLICATION_REQUEST_OID,
    NSDS50_REPLICATION_ENTRY_REQUEST_OID, NSDS50_REPLICATION_RESPONSE_OID, NSDS71_REPLICATION_ENTRY_REQUEST_OID,
    NSDS90_REPLICATION_RESPONSE_OID, START_NSDS50_REPLICATION_REQUEST_OID, START_NSDS90_REPLICATION_REQUEST_OID,
};
use crate::dn::Dn;
use crate::op::Mod;
use crate::protocol::SessionEvent;
use crate::replica::{replica_config_dn, ATTR_REPLICA_ID};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Default linger before an idle connection is closed.
pub const DEFAULT_LINGER: Duration = Duration::from_secs(60);

/// Prefix of credentials stored in clear text.
pub const CLEAR_PREFIX: &str = "{CLEAR}";

/// Opens sessions to peers.
#[async_trait]
pub trait LdapConnector: Send + Sync {
    /// True once the TLS subsystem is usable.
    fn security_initialized(&self) -> bool;

    /// Turn stored credentials into the bind secret.
    fn decode_credentials(&self, encoded: &str) -> Result<Zeroizing<String>, LdapError> {
        match encoded.strip_prefix(CLEAR_PREFIX) {
            Some(clear) => Ok(Zeroizing::new(clear.to_string())),
            None if !encoded.starts_with('{') => Ok(Zeroizing::new(encoded.to_string())),
            None => Err(LdapError::new(
                LdapResultCode::LocalError,
                "credentials use an unsupported encoding",
            )),
        }
    }

    /// Open a transport session to `target`.
    async fn open(&self, target: &PeerTarget) -> Result<Arc<dyn LdapSession>, LdapError>;
}

/// One open transport session.
#[async_trait]
pub trait LdapSession: Send + Sync {
    /// Authenticate. Returns advisory response controls.
    async fn bind(&self, method: BindMethod, dn: &str, password: &str) -> Result<Vec<ResponseControl>, LdapError>;

    /// Resolves once a write would not block; `false` if it never will.
    async fn writable(&self) -> bool;

    /// Queue a request.
    async fn send(&self, request: LdapRequest) -> Result<MessageId, LdapError>;

    /// Next result, in the order the peer answered.
    async fn next_result(&self) -> Result<LdapResponse, LdapError>;

    /// Synchronous search.
    async fn search(&self, request: SearchRequest) -> Result<Vec<SearchEntry>, LdapError>;

    /// Close the session.
    async fn unbind(&self);
}

/// Errors from connection operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnError {
    /// No session; reconnect and retry.
    #[error("not connected")]
    NotConnected,
    /// The peer or connection is busy; retry later.
    #[error("connection busy")]
    Busy,
    /// The operation did not complete in time.
    #[error("operation timed out")]
    Timeout,
    /// The operation failed; the LDAP error says why.
    #[error("operation failed: {0}")]
    OperationFailed(LdapError),
    /// The transport needs TLS and the security subsystem is down.
    #[error("secure transport requested but security is not initialized")]
    SslNotEnabled,
    /// The server is shutting down.
    #[error("connection shutting down")]
    ShuttingDown,
}

impl ConnError {
    /// Back off and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Busy | Self::Timeout)
    }

    /// Nothing will change until an operator fixes the configuration.
    pub fn is_config_fatal(&self) -> bool {
        matches!(self, Self::SslNotEnabled)
    }

    /// LDAP code recorded in status for this error.
    pub fn result_code(&self) -> LdapResultCode {
        match self {
            Self::NotConnected => LdapResultCode::ServerDown,
            Self::Busy => LdapResultCode::Busy,
            Self::Timeout => LdapResultCode::Timeout,
            Self::OperationFailed(e) => e.code,
            Self::SslNotEnabled => LdapResultCode::LocalError,
            Self::ShuttingDown => LdapResultCode::Unavailable,
        }
    }
}

/// Top-level connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// No session.
    Disconnected,
    /// Bound session.
    Connected,
}

/// Finer-grained status for operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// Connected, nothing in flight.
    Idle,
    /// Opening and binding.
    Binding,
    /// An operation of the given kind is in flight.
    Processing(&'static str),
    /// Waiting to close.
    Lingering,
    /// Closing for shutdown.
    ShuttingDown,
    /// No session.
    Disconnected,
}

impl fmt::Display for ConnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("connected"),
            Self::Binding => f.write_str("binding"),
            Self::Processing(kind) => write!(f, "processing {kind} operation"),
            Self::Lingering => f.write_str("lingering"),
            Self::ShuttingDown => f.write_str("shutting down"),
            Self::Disconnected => f.write_str("disconnected"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Capability {
    Unknown,
    Yes,
    No,
}

impl Capability {
    fn from_bool(b: bool) -> Self {
        if b {
            Self::Yes
        } else {
            Self::No
        }
    }

    fn known(self) -> Option<bool> {
        match self {
            Self::Unknown => None,
            Self::Yes => Some(true),
            Self::No => Some(false),
        }
    }
}

struct ConnInner {
    state: ConnState,
    status: ConnStatus,
    session: Option<Arc<dyn LdapSession>>,
    target: Option<PeerTarget>,
    plaintext: Option<Zeroizing<String>>,
    last_error: Option<LdapError>,
    ds50: Capability,
    ds71: Capability,
    ds90: Capability,
    peer_rid: Option<Option<ReplicaId>>,
    linger: Option<EventHandle>,
    delete_after_linger: bool,
    deleted: bool,
}

impl ConnInner {
    fn reset_capabilities(&mut self) {
        self.ds50 = Capability::Unknown;
        self.ds71 = Capability::Unknown;
        self.ds90 = Capability::Unknown;
        self.peer_rid = None;
    }

    fn close(&mut self) -> Option<Arc<dyn LdapSession>> {
        if let Some(linger) = self.linger.take() {
            linger.cancel();
        }
        self.state = ConnState::Disconnected;
        self.status = ConnStatus::Disconnected;
        self.reset_capabilities();
        self.session.take()
    }

    fn fail(&mut self, err: LdapError) -> ConnError {
        self.last_error = Some(err.clone());
        self.close();
        ConnError::OperationFailed(err)
    }
}

struct Linger {
    queue: EventQueue<SessionEvent>,
    tx: mpsc::UnboundedSender<SessionEvent>,
    after: Duration,
}

/// One agreement's connection to its peer.
pub struct Connection {
    agreement: Arc<Agreement>,
    connector: Arc<dyn LdapConnector>,
    shutdown: CancellationToken,
    linger: Option<Linger>,
    inner: Mutex<ConnInner>,
}

impl Connection {
    /// New disconnected connection. Without [`Self::with_linger`] the
    /// connection closes as soon as a session ends.
    pub fn new(agreement: Arc<Agreement>, connector: Arc<dyn LdapConnector>, shutdown: CancellationToken) -> Self {
        Self {
            agreement,
            connector,
            shutdown,
            linger: None,
            inner: Mutex::new(ConnInner {
                state: ConnState::Disconnected,
                status: ConnStatus::Disconnected,
                session: None,
                target: None,
                plaintext: None,
                last_error: None,
                ds50: Capability::Unknown,
                ds71: Capability::Unknown,
                ds90: Capability::Unknown,
                peer_rid: None,
                linger: None,
                delete_after_linger: false,
                deleted: false,
            }),
        }
    }

    /// Linger `after` before closing; the close is delivered as
    /// [`SessionEvent::LingerExpired`] on `tx`.
    pub fn with_linger(
        mut self,
        queue: EventQueue<SessionEvent>,
        tx: mpsc::UnboundedSender<SessionEvent>,
        after: Duration,
    ) -> Self {
        self.linger = Some(Linger { queue, tx, after });
        self
    }

    /// Open and bind, unless already connected.
    pub async fn connect(&self) -> Result<(), ConnError> {
        let mut inner = self.inner.lock().await;
        if inner.deleted || self.shutdown.is_cancelled() {
            return Err(ConnError::ShuttingDown);
        }
        if inner.state == ConnState::Connected {
            return Ok(());
        }
        if inner.target.is_none() || self.agreement.take_changed() {
            inner.target = Some(self.agreement.peer_target());
        }
        if inner.plaintext.is_some() && self.agreement.take_credentials_changed() {
            inner.plaintext = None;
        }
        let Some(target) = inner.target.clone() else {
            return Err(ConnError::NotConnected);
        };
        if target.transport.requires_security() && !self.connector.security_initialized() {
            inner.last_error = Some(LdapError::new(
                LdapResultCode::LocalError,
                "security subsystem is not initialized",
            ));
            return Err(ConnError::SslNotEnabled);
        }
        if inner.plaintext.is_none() {
            match self.connector.decode_credentials(&self.agreement.credentials()) {
                Ok(plain) => inner.plaintext = Some(plain),
                Err(e) => return Err(inner.fail(e)),
            }
        }
        inner.status = ConnStatus::Binding;
        let session = match self.connector.open(&target).await {
            Ok(session) => session,
            Err(e) => return Err(inner.fail(e)),
        };
        let password = inner.plaintext.clone().unwrap_or_default();
        let controls = match session.bind(target.bind_method, &target.bind_dn, &password).await {
            Ok(controls) => controls,
            Err(e) => {
                session.unbind().await;
                return Err(inner.fail(e));
            }
        };
        for control in controls {
            match control {
                ResponseControl::PasswordExpired => {
                    warn!(agreement = %self.agreement.name(), bind_dn = %target.bind_dn, "bind password has expired")
                }
                ResponseControl::PasswordExpiring { seconds } => {
                    info!(agreement = %self.agreement.name(), seconds, "bind password expires soon")
                }
            }
        }
        inner.session = Some(session);
        inner.state = ConnState::Connected;
        inner.status = ConnStatus::Idle;
        inner.last_error = None;
        inner.reset_capabilities();
        debug!(agreement = %self.agreement.name(), peer = %target, "connected");
        Ok(())
    }

    async fn begin_op(&self, label: &'static str) -> Result<(Arc<dyn LdapSession>, Duration), ConnError> {
        let mut inner = self.inner.lock().await;
        if self.shutdown.is_cancelled() {
            inner.status = ConnStatus::ShuttingDown;
            return Err(ConnError::ShuttingDown);
        }
        Self::cancel_linger_locked(&mut inner);
        let (Some(session), Some(target)) = (inner.session.clone(), inner.target.as_ref()) else {
            return Err(ConnError::NotConnected);
        };
        let timeout = target.timeout;
        inner.status = ConnStatus::Processing(label);
        Ok((session, timeout))
    }

    async fn finish_op(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == ConnState::Connected {
            inner.status = ConnStatus::Idle;
        }
    }

    async fn op_failed(&self, err: LdapError) -> ConnError {
        let mut inner = self.inner.lock().await;
        inner.last_error = Some(err.clone());
        if err.code.is_disconnect_class() {
            warn!(agreement = %self.agreement.name(), error = %err, "connection lost");
            let session = inner.close();
            drop(inner);
            if let Some(session) = session {
                session.unbind().await;
            }
            ConnError::NotConnected
        } else {
            inner.status = ConnStatus::Idle;
            ConnError::OperationFailed(err)
        }
    }

    /// Send a request after the transport becomes writable.
    pub async fn send(&self, request: LdapRequest) -> Result<MessageId, ConnError> {
        let (session, timeout) = self.begin_op(request.label()).await?;
        let writable = tokio::select! {
            w = tokio::time::timeout(timeout, session.writable()) => matches!(w, Ok(true)),
            _ = self.shutdown.cancelled() => return Err(ConnError::ShuttingDown),
        };
        if !writable {
            self.finish_op().await;
            debug!(agreement = %self.agreement.name(), "transport not writable within timeout");
            return Err(ConnError::Timeout);
        }
        match session.send(request).await {
            Ok(msgid) => Ok(msgid),
            Err(e) => Err(self.op_failed(e).await),
        }
    }

    /// Send an add.
    pub async fn send_add(
        &self,
        dn: &Dn,
        attrs: Vec<(String, Vec<String>)>,
        control: Option<UpdateInfoControl>,
    ) -> Result<MessageId, ConnError> {
        self.send(LdapRequest::Add {
            dn: dn.to_string(),
            attrs,
            control,
        })
        .await
    }

    /// Send a delete.
    pub async fn send_delete(&self, dn: &Dn, control: Option<UpdateInfoControl>) -> Result<MessageId, ConnError> {
        self.send(LdapRequest::Delete {
            dn: dn.to_string(),
            control,
        })
        .await
    }

    /// Send a modify.
    pub async fn send_modify(
        &self,
        dn: &Dn,
        mods: Vec<Mod>,
        control: Option<UpdateInfoControl>,
    ) -> Result<MessageId, ConnError> {
        self.send(LdapRequest::Modify {
            dn: dn.to_string(),
            mods,
            control,
        })
        .await
    }

    /// Send a rename.
    pub async fn send_rename(
        &self,
        dn: &Dn,
        new_rdn: &str,
        new_superior: Option<&Dn>,
        delete_old_rdn: bool,
        control: Option<UpdateInfoControl>,
    ) -> Result<MessageId, ConnError> {
        self.send(LdapRequest::Rename {
            dn: dn.to_string(),
            new_rdn: new_rdn.to_string(),
            new_superior: new_superior.map(ToString::to_string),
            delete_old_rdn,
            control,
        })
        .await
    }

    /// Send an extended operation.
    pub async fn send_extended(&self, oid: &str, request: ExtendedRequest) -> Result<MessageId, ConnError> {
        self.send(LdapRequest::Extended {
            oid: oid.to_string(),
            request,
        })
        .await
    }

    /// Wait for the next result, up to the operation timeout. Returns early
    /// with [`ConnError::ShuttingDown`] when shutdown is signalled.
    pub async fn read_result(&self) -> Result<LdapResponse, ConnError> {
        let (session, timeout) = {
            let inner = self.inner.lock().await;
            match (inner.session.clone(), inner.target.as_ref()) {
                (Some(session), Some(target)) => (session, target.timeout),
                _ => return Err(ConnError::NotConnected),
            }
        };
        let result = tokio::select! {
            r = tokio::time::timeout(timeout, session.next_result()) => r,
            _ = self.shutdown.cancelled() => {
                self.inner.lock().await.status = ConnStatus::ShuttingDown;
                return Err(ConnError::ShuttingDown);
            }
        };
        match result {
            Err(_) => {
                self.finish_op().await;
                Err(ConnError::Timeout)
            }
            Ok(Err(e)) => Err(self.op_failed(e).await),
            Ok(Ok(response)) if response.code.is_disconnect_class() => Err(self
                .op_failed(LdapError::new(response.code, response.message))
                .await),
            Ok(Ok(response)) => {
                self.finish_op().await;
                Ok(response)
            }
        }
    }

    /// Send an extended operation and wait for its result.
    pub async fn extended_operation(&self, oid: &str, request: ExtendedRequest) -> Result<ExtendedResponse, ConnError> {
        let msgid = self.send_extended(oid, request).await?;
        loop {
            let response = self.read_result().await?;
            if response.msgid != msgid {
                debug!(expected = msgid, got = response.msgid, "skipping unrelated result");
                continue;
            }
            if response.code != LdapResultCode::Success {
                let err = LdapError::new(response.code, response.message);
                self.inner.lock().await.last_error = Some(err.clone());
                return Err(ConnError::OperationFailed(err));
            }
            return Ok(response.extended.unwrap_or_default());
        }
    }

    async fn search(&self, request: SearchRequest) -> Result<Vec<SearchEntry>, ConnError> {
        let (session, timeout) = self.begin_op("search").await?;
        let result = tokio::select! {
            r = tokio::time::timeout(timeout, session.search(request)) => r,
            _ = self.shutdown.cancelled() => return Err(ConnError::ShuttingDown),
        };
        match result {
            Err(_) => {
                self.finish_op().await;
                Err(ConnError::Timeout)
            }
            Ok(Err(e)) => Err(self.op_failed(e).await),
            Ok(Ok(entries)) => {
                self.finish_op().await;
                Ok(entries)
            }
        }
    }

    async fn read_root_dse(&self) -> Result<(), ConnError> {
        if self.inner.lock().await.ds50 != Capability::Unknown {
            return Ok(());
        }
        let entries = self
            .search(SearchRequest {
                base: String::new(),
                scope: SearchScope::Base,
                filter: "(objectclass=*)".to_string(),
                attrs: vec!["supportedextension".to_string(), "supportedcontrol".to_string()],
            })
            .await?;
        let has = |oid: &str| {
            entries
                .iter()
                .any(|e| e.values("supportedextension").any(|v| v == oid))
        };
        let ds50 = has(START_NSDS50_REPLICATION_REQUEST_OID)
            && has(END_NSDS50_REPLICATION_REQUEST_OID)
            && has(NSDS50_REPLICATION_ENTRY_REQUEST_OID)
            && has(NSDS50_REPLICATION_RESPONSE_OID);
        let ds71 = ds50 && has(NSDS71_REPLICATION_ENTRY_REQUEST_OID);
        let ds90 = ds71 && has(START_NSDS90_REPLICATION_REQUEST_OID) && has(NSDS90_REPLICATION_RESPONSE_OID);
        let mut inner = self.inner.lock().await;
        inner.ds50 = Capability::from_bool(ds50);
        inner.ds71 = Capability::from_bool(ds71);
        inner.ds90 = Capability::from_bool(ds90);
        debug!(agreement = %self.agreement.name(), ds50, ds71, ds90, "read peer capabilities");
        Ok(())
    }

    async fn capability(&self, pick: fn(&ConnInner) -> Capability) -> Result<bool, ConnError> {
        if let Some(known) = pick(&*self.inner.lock().await).known() {
            return Ok(known);
        }
        self.read_root_dse().await?;
        Ok(pick(&*self.inner.lock().await).known().unwrap_or(false))
    }

    /// True if the peer speaks the DS5.0 replication protocol.
    pub async fn supports_ds50_repl(&self) -> Result<bool, ConnError> {
        self.capability(|i| i.ds50).await
    }

    /// True if the peer accepts pipelined (DS7.1) sessions.
    pub async fn supports_ds71_repl(&self) -> Result<bool, ConnError> {
        self.capability(|i| i.ds71).await
    }

    /// True if the peer speaks the DS9.0 start/response framing.
    pub async fn supports_ds90_repl(&self) -> Result<bool, ConnError> {
        self.capability(|i| i.ds90).await
    }

    /// Replica id the peer reports for the agreement's root.
    pub async fn peer_replica_id(&self) -> Result<Option<ReplicaId>, ConnError> {
        if let Some(known) = self.inner.lock().await.peer_rid {
            return Ok(known);
        }
        let entries = self
            .search(SearchRequest {
                base: replica_config_dn(self.agreement.root()),
                scope: SearchScope::Base,
                filter: "(objectclass=*)".to_string(),
                attrs: vec![ATTR_REPLICA_ID.to_string()],
            })
            .await?;
        let rid = entries
            .iter()
            .flat_map(|e| e.values(ATTR_REPLICA_ID))
            .find_map(|v| v.parse::<ReplicaId>().ok());
        self.inner.lock().await.peer_rid = Some(rid);
        Ok(rid)
    }

    /// True if the peer is a read-only consumer.
    pub async fn is_read_only(&self) -> Result<bool, ConnError> {
        Ok(self.peer_replica_id().await? == Some(READ_ONLY_REPLICA_ID))
    }

    /// Keep the session open for the linger interval, then close it.
    pub async fn start_linger(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != ConnState::Connected || inner.linger.is_some() {
            return;
        }
        let scheduled = self.linger.as_ref().map(|l| {
            l.queue
                .schedule_in(l.after, EventSink::new(l.tx.clone(), SessionEvent::LingerExpired))
        });
        match scheduled {
            Some(Ok(handle)) => {
                inner.linger = Some(handle);
                inner.status = ConnStatus::Lingering;
            }
            _ => {
                let session = inner.close();
                drop(inner);
                if let Some(session) = session {
                    session.unbind().await;
                }
            }
        }
    }

    fn cancel_linger_locked(inner: &mut ConnInner) -> Option<CancelOutcome> {
        let handle = inner.linger.take()?;
        let outcome = handle.cancel();
        if inner.state == ConnState::Connected {
            inner.status = ConnStatus::Idle;
        }
        Some(outcome)
    }

    /// Cancel a pending linger. A linger that already fired is abandoned;
    /// its event is ignored when it arrives.
    pub async fn cancel_linger(&self) -> Option<CancelOutcome> {
        let mut inner = self.inner.lock().await;
        Self::cancel_linger_locked(&mut inner)
    }

    /// Handle a delivered [`SessionEvent::LingerExpired`]. Stale deliveries
    /// are ignored.
    pub async fn linger_expired(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.linger.as_ref().map_or(false, EventHandle::has_fired) {
            return;
        }
        inner.linger = None;
        let session = inner.close();
        if inner.delete_after_linger {
            inner.deleted = true;
        }
        drop(inner);
        debug!(agreement = %self.agreement.name(), "linger expired, closing connection");
        if let Some(session) = session {
            session.unbind().await;
        }
    }

    /// Close the session.
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        let session = inner.close();
        drop(inner);
        if let Some(session) = session {
            session.unbind().await;
        }
    }

    /// Close for good. If a linger close is mid-fire the close is left to it;
    /// returns false in that case.
    pub async fn delete(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.linger.as_ref().map_or(false, EventHandle::has_fired) {
            inner.delete_after_linger = true;
            return false;
        }
        let session = inner.close();
        inner.deleted = true;
        drop(inner);
        if let Some(session) = session {
            session.unbind().await;
        }
        true
    }

    /// Last LDAP error seen.
    pub async fn get_error(&self) -> Option<LdapError> {
        self.inner.lock().await.last_error.clone()
    }

    /// Connected or not.
    pub async fn state(&self) -> ConnState {
        self.inner.lock().await.state
    }

    /// Detailed status.
    pub async fn status(&self) -> ConnStatus {
        self.inner.lock().await.status
    }

    /// True once [`Self::delete`] took effect.
    pub async fn is_deleted(&self) -> bool {
        self.inner.lock().await.deleted
    }
}
