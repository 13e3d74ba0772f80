//! Protocol session: the per-agreement loop that pushes changes to a peer.
//!
//! One tokio task per agreement owns the agreement's [`Connection`] and runs
//! at most one session at a time. Wake-ups arrive as [`SessionEvent`]s;
//! everything that queues up while a session runs is folded into a single
//! follow-up run. Failures are recorded in the agreement's status and drive
//! the backoff timers; nothing propagates out of the loop.

use crate::agreement::Agreement;
use crate::backoff::{BackoffKind, BackoffTimer};
use crate::connection::{ConnError, Connection, LdapConnector};
use crate::csn::{ReplicaId, READ_ONLY_REPLICA_ID};
use crate::error::ReplError;
use crate::event_queue::{EventHandle, EventQueue, EventSink};
use crate::ldap::{
    ExtendedRequest, LdapResultCode, ReplicaResponse, ResponseDisposition, END_NSDS50_REPLICATION_REQUEST_OID,
    NSDS50_INCREMENTAL_PROTOCOL_OID, NSDS50_REPLICATION_ENTRY_REQUEST_OID, NSDS50_TOTAL_PROTOCOL_OID,
    NSDS71_INCREMENTAL_PROTOCOL_OID, NSDS71_REPLICATION_ENTRY_REQUEST_OID, NSDS71_TOTAL_PROTOCOL_OID,
    START_NSDS50_REPLICATION_REQUEST_OID, START_NSDS90_REPLICATION_REQUEST_OID,
};
use crate::replica::{Replica, ReplicaType};
use crate::ruv::Ruv;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Something that may make an agreement run a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A local write touched `attrs` in the agreement's subtree.
    UpdateAvailable {
        /// Attributes the write touched; used for schedule priority.
        attrs: Vec<String>,
    },
    /// Run now, ignoring the schedule and any backoff.
    ReplicateNow,
    /// A schedule window opened.
    WindowOpened,
    /// A schedule window closed.
    WindowClosed,
    /// A backoff interval ended.
    BackoffExpired,
    /// The idle connection's linger ran out.
    LingerExpired,
    /// Reinitialize the peer with a total update.
    InitializeTotal,
    /// Abandon a running total update.
    CancelTotal,
    /// The schedule was edited.
    ScheduleChanged,
    /// Stop the loop; with `flush`, push pending changes first.
    Stop {
        /// Run one last incremental session before stopping.
        flush: bool,
    },
}

/// Where an agreement's session loop is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolState {
    /// Not started.
    Unknown,
    /// Idle, waiting for a wake-up.
    AwaitingChanges,
    /// Asking the peer for exclusive access.
    AcquiringReplica,
    /// Incremental session running.
    SendingUpdates,
    /// Total update running.
    SendingData,
    /// Ending the session.
    ReleasingReplica,
    /// Waiting out a backoff interval.
    BackingOff,
    /// The peer fell behind the changelog; only a total update helps.
    NeedsTotalUpdate,
    /// Stopped on an error only an administrator can fix.
    FatalError,
    /// Loop finished.
    Stopped,
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::AwaitingChanges => "awaiting changes",
            Self::AcquiringReplica => "acquiring replica",
            Self::SendingUpdates => "sending updates",
            Self::SendingData => "sending data",
            Self::ReleasingReplica => "releasing replica",
            Self::BackingOff => "backing off",
            Self::NeedsTotalUpdate => "needs total update",
            Self::FatalError => "fatal error",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Replication protocol generation spoken with a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolGeneration {
    /// One operation in flight at a time.
    Ds50,
    /// Pipelined sends.
    Ds71,
    /// Pipelined, with the DS9.0 start/response framing.
    Ds90,
}

impl ProtocolGeneration {
    /// Best generation the peer advertises, if any.
    pub async fn negotiate(conn: &Connection) -> Result<Option<Self>, ConnError> {
        if conn.supports_ds90_repl().await? {
            Ok(Some(Self::Ds90))
        } else if conn.supports_ds71_repl().await? {
            Ok(Some(Self::Ds71))
        } else if conn.supports_ds50_repl().await? {
            Ok(Some(Self::Ds50))
        } else {
            Ok(None)
        }
    }

    /// OID of the start request.
    pub fn start_oid(self) -> &'static str {
        match self {
            Self::Ds90 => START_NSDS90_REPLICATION_REQUEST_OID,
            Self::Ds50 | Self::Ds71 => START_NSDS50_REPLICATION_REQUEST_OID,
        }
    }

    /// Update protocol OID carried in the start request.
    pub fn protocol_oid(self, total: bool) -> &'static str {
        match (self, total) {
            (Self::Ds50, false) => NSDS50_INCREMENTAL_PROTOCOL_OID,
            (Self::Ds50, true) => NSDS50_TOTAL_PROTOCOL_OID,
            (_, false) => NSDS71_INCREMENTAL_PROTOCOL_OID,
            (_, true) => NSDS71_TOTAL_PROTOCOL_OID,
        }
    }

    /// OID of the total-update entry request.
    pub fn entry_oid(self) -> &'static str {
        match self {
            Self::Ds50 => NSDS50_REPLICATION_ENTRY_REQUEST_OID,
            Self::Ds71 | Self::Ds90 => NSDS71_REPLICATION_ENTRY_REQUEST_OID,
        }
    }

    /// True if several operations may be in flight.
    pub fn pipelined(self) -> bool {
        self != Self::Ds50
    }
}

/// Why a session did not complete.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SessionFailure {
    /// Back off and try again.
    Retry {
        code: LdapResultCode,
        response: Option<ReplicaResponse>,
        message: String,
        busy: bool,
    },
    /// The peer needs a total update.
    NeedsTotal(String),
    /// Nothing will work until an administrator steps in.
    Fatal {
        code: LdapResultCode,
        response: Option<ReplicaResponse>,
        message: String,
    },
    /// Shutdown, stop or cancel.
    Stopped,
}

impl SessionFailure {
    fn code(&self) -> LdapResultCode {
        match self {
            Self::Retry { code, .. } | Self::Fatal { code, .. } => *code,
            Self::NeedsTotal(_) => LdapResultCode::UnwillingToPerform,
            Self::Stopped => LdapResultCode::Unavailable,
        }
    }

    fn response(&self) -> Option<ReplicaResponse> {
        match self {
            Self::Retry { response, .. } | Self::Fatal { response, .. } => *response,
            Self::NeedsTotal(_) => Some(ReplicaResponse::BelowPurgePoint),
            Self::Stopped => None,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Retry { message, .. } | Self::Fatal { message, .. } | Self::NeedsTotal(message) => message.clone(),
            Self::Stopped => "session stopped".to_string(),
        }
    }
}

impl From<ConnError> for SessionFailure {
    fn from(e: ConnError) -> Self {
        match e {
            ConnError::ShuttingDown => Self::Stopped,
            ConnError::SslNotEnabled => Self::Fatal {
                code: e.result_code(),
                response: None,
                message: e.to_string(),
            },
            other => Self::Retry {
                code: other.result_code(),
                response: None,
                busy: other == ConnError::Busy,
                message: other.to_string(),
            },
        }
    }
}

impl From<ReplError> for SessionFailure {
    fn from(e: ReplError) -> Self {
        Self::Retry {
            code: e.result_code(),
            response: None,
            busy: matches!(e, ReplError::ReplicaBusy { .. }),
            message: e.to_string(),
        }
    }
}

/// What a successful start handed back.
#[derive(Debug, Clone)]
pub(crate) struct Acquired {
    pub generation: ProtocolGeneration,
    pub response: ReplicaResponse,
    pub consumer_ruv: Ruv,
    pub supplier_ruv: Ruv,
}

/// One session's view of the world, threaded through acquire, send and
/// release.
pub(crate) struct Session<'a> {
    pub replica: &'a Replica,
    pub agreement: &'a Agreement,
    pub conn: &'a Connection,
    pub stop: &'a CancellationToken,
}

impl Session<'_> {
    /// Claim the local exclusion and ask the peer to accept a session.
    pub async fn acquire_replica(&self, total: bool) -> Result<Acquired, SessionFailure> {
        if self.stop.is_cancelled() {
            return Err(SessionFailure::Stopped);
        }
        if total {
            self.replica.begin_total_send()?;
        } else if !self.replica.can_send_incremental() {
            return Err(SessionFailure::Retry {
                code: LdapResultCode::Busy,
                response: None,
                busy: true,
                message: "local replica is being initialized".to_string(),
            });
        }
        let acquired = self.try_acquire(total).await;
        if acquired.is_err() && total {
            self.replica.end_total_send();
        }
        acquired
    }

    async fn try_acquire(&self, total: bool) -> Result<Acquired, SessionFailure> {
        self.conn.connect().await?;
        let generation = ProtocolGeneration::negotiate(self.conn)
            .await?
            .ok_or_else(|| SessionFailure::Fatal {
                code: LdapResultCode::UnavailableCriticalExtension,
                response: Some(ReplicaResponse::LegacyConsumer),
                message: "peer does not support multi-master replication".to_string(),
            })?;
        self.check_peer_rid().await?;
        let supplier_ruv = self.replica.ruv()?;
        let request = ExtendedRequest::StartReplication {
            protocol_oid: generation.protocol_oid(total).to_string(),
            repl_root: self.replica.root().to_string(),
            supplier_ruv: supplier_ruv.clone(),
            csn: self.replica.new_csn()?,
        };
        let reply = self.conn.extended_operation(generation.start_oid(), request).await?;
        let response = reply.response.unwrap_or(ReplicaResponse::NoResponse);
        let message = format!("consumer replied {response}");
        match response.disposition() {
            ResponseDisposition::Success => {
                debug!(agreement = %self.agreement.name(), ?generation, total, "replica acquired");
                Ok(Acquired {
                    generation,
                    response,
                    consumer_ruv: reply.ruv.unwrap_or_default(),
                    supplier_ruv,
                })
            }
            ResponseDisposition::Retry => Err(SessionFailure::Retry {
                code: LdapResultCode::Busy,
                response: Some(response),
                busy: matches!(response, ReplicaResponse::Busy | ReplicaResponse::Backoff),
                message,
            }),
            ResponseDisposition::Fatal if response == ReplicaResponse::BelowPurgePoint => {
                Err(SessionFailure::NeedsTotal(message))
            }
            ResponseDisposition::Fatal => Err(SessionFailure::Fatal {
                code: LdapResultCode::UnwillingToPerform,
                response: Some(response),
                message,
            }),
        }
    }

    async fn check_peer_rid(&self) -> Result<(), SessionFailure> {
        let peer: Option<ReplicaId> = match self.conn.peer_replica_id().await {
            Ok(rid) => rid,
            // No config entry to read; the start reply speaks for the peer.
            Err(ConnError::OperationFailed(_)) => None,
            Err(e) => return Err(e.into()),
        };
        match peer {
            Some(rid) if rid != READ_ONLY_REPLICA_ID && rid == self.replica.rid() => {
                error!(
                    agreement = %self.agreement.name(),
                    rid,
                    "peer uses this server's replica id; topology needs administrative repair"
                );
                Err(SessionFailure::Fatal {
                    code: LdapResultCode::UnwillingToPerform,
                    response: Some(ReplicaResponse::ReplicaIdError),
                    message: format!("peer has the same replica id {rid}"),
                })
            }
            Some(READ_ONLY_REPLICA_ID) if self.replica.replica_type() == ReplicaType::Consumer => {
                Err(SessionFailure::Fatal {
                    code: LdapResultCode::UnwillingToPerform,
                    response: Some(ReplicaResponse::ReplicaIdError),
                    message: "a read-only replica cannot supply another read-only replica".to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    /// End the session on the peer and drop the local exclusion.
    pub async fn release_replica(&self, total: bool) {
        let request = ExtendedRequest::EndReplication {
            repl_root: self.replica.root().to_string(),
        };
        match self.conn.extended_operation(END_NSDS50_REPLICATION_REQUEST_OID, request).await {
            Ok(reply) => {
                if let Some(response) = reply.response.filter(|r| *r != ReplicaResponse::ReleaseSucceeded) {
                    debug!(agreement = %self.agreement.name(), %response, "unexpected release reply");
                }
            }
            Err(e) => debug!(agreement = %self.agreement.name(), error = %e, "release failed"),
        }
        if total {
            self.replica.end_total_send();
        }
    }

    /// Read results until at most `keep` requests remain outstanding.
    /// `accept` decides which result codes let the session continue.
    pub async fn drain_results(
        &self,
        outstanding: &mut usize,
        keep: usize,
        accept: fn(LdapResultCode) -> bool,
    ) -> Result<(), SessionFailure> {
        while *outstanding > keep {
            if self.stop.is_cancelled() {
                return Err(SessionFailure::Stopped);
            }
            let response = self.conn.read_result().await?;
            *outstanding -= 1;
            if !accept(response.code) {
                return Err(SessionFailure::Retry {
                    code: response.code,
                    response: None,
                    busy: response.code == LdapResultCode::Busy,
                    message: format!("consumer rejected an update: {}", response.message),
                });
            }
        }
        Ok(())
    }
}

/// Everything an agreement's loop needs.
pub struct ProtocolContext {
    /// Supplying replica.
    pub replica: Arc<Replica>,
    /// The agreement.
    pub agreement: Arc<Agreement>,
    /// Transport.
    pub connector: Arc<dyn LdapConnector>,
    /// Scheduler for backoff, linger and window timers.
    pub queue: EventQueue<SessionEvent>,
    /// Server shutdown.
    pub shutdown: CancellationToken,
    /// Idle connection linger.
    pub linger: Duration,
}

/// Control side of a running agreement loop.
pub struct ProtocolHandle {
    name: String,
    tx: mpsc::UnboundedSender<SessionEvent>,
    state: watch::Receiver<ProtocolState>,
    stop: CancellationToken,
    total_cancel: Arc<Mutex<Option<CancellationToken>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProtocolHandle {
    /// Spawn the loop.
    pub fn start(ctx: ProtocolContext) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ProtocolState::Unknown);
        let stop = ctx.shutdown.child_token();
        let total_cancel = Arc::new(Mutex::new(None));
        let conn = Connection::new(ctx.agreement.clone(), ctx.connector.clone(), ctx.shutdown.clone()).with_linger(
            ctx.queue.clone(),
            tx.clone(),
            ctx.linger,
        );
        let name = ctx.agreement.name().to_string();
        let protocol = Protocol {
            conn,
            tx: tx.clone(),
            rx,
            state: state_tx,
            stop: stop.clone(),
            total_cancel: total_cancel.clone(),
            backoff: None,
            window: None,
            wake: Wake::default(),
            ctx,
        };
        let task = tokio::spawn(protocol.run());
        Self {
            name,
            tx,
            state: state_rx,
            stop,
            total_cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Agreement name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deliver an event. Returns false if the loop is gone.
    pub fn send(&self, event: SessionEvent) -> bool {
        if event == SessionEvent::CancelTotal {
            if let Ok(slot) = self.total_cancel.lock() {
                if let Some(token) = slot.as_ref() {
                    token.cancel();
                }
            }
        }
        self.tx.send(event).is_ok()
    }

    /// Tell the loop about a local write.
    pub fn notify_update(&self, attrs: Vec<String>) -> bool {
        self.send(SessionEvent::UpdateAvailable { attrs })
    }

    /// Current state.
    pub fn state(&self) -> ProtocolState {
        *self.state.borrow()
    }

    /// Wait until the state satisfies `pred`.
    pub async fn wait_for_state<F: FnMut(&ProtocolState) -> bool>(&self, pred: F) -> Option<ProtocolState> {
        let mut rx = self.state.clone();
        rx.wait_for(pred).await.ok().map(|s| *s)
    }

    /// True while the loop runs.
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Stop the loop and wait for it. With `flush`, pending changes are
    /// pushed first.
    pub async fn stop(&self, flush: bool) {
        if !flush {
            self.stop.cancel();
        }
        let _ = self.tx.send(SessionEvent::Stop { flush });
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(agreement = %self.name, error = %e, "protocol task panicked");
            }
        }
    }
}

#[derive(Debug, Default)]
struct Wake {
    run: bool,
    forced: bool,
    deferred: bool,
    retry: bool,
    total: bool,
}

struct Protocol {
    ctx: ProtocolContext,
    conn: Connection,
    tx: mpsc::UnboundedSender<SessionEvent>,
    rx: mpsc::UnboundedReceiver<SessionEvent>,
    state: watch::Sender<ProtocolState>,
    stop: CancellationToken,
    total_cancel: Arc<Mutex<Option<CancellationToken>>>,
    backoff: Option<(bool, BackoffTimer<SessionEvent>)>,
    window: Option<EventHandle>,
    wake: Wake,
}

enum Flow {
    Continue,
    Stop { flush: bool },
}

impl Protocol {
    fn name(&self) -> &str {
        self.ctx.agreement.name()
    }

    fn state(&self) -> ProtocolState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ProtocolState) {
        if self.state() != state {
            debug!(agreement = %self.name(), %state, "protocol state");
        }
        self.state.send_replace(state);
    }

    fn in_window(&self) -> bool {
        self.ctx
            .agreement
            .settings()
            .schedule
            .in_window_at(chrono::Local::now().naive_local())
    }

    fn sink(&self, event: SessionEvent) -> EventSink<SessionEvent> {
        EventSink::new(self.tx.clone(), event)
    }

    fn arm_window_timer(&mut self) {
        if let Some(handle) = self.window.take() {
            handle.cancel();
        }
        let now = chrono::Local::now().naive_local();
        let Some(next) = self.ctx.agreement.settings().schedule.next_change_at(now) else {
            return;
        };
        let delay = (next - now).to_std().unwrap_or_default();
        let event = if self.in_window() {
            SessionEvent::WindowClosed
        } else {
            SessionEvent::WindowOpened
        };
        match self.ctx.queue.schedule_in(delay, self.sink(event)) {
            Ok(handle) => self.window = Some(handle),
            Err(e) => debug!(agreement = %self.name(), error = %e, "could not arm window timer"),
        }
    }

    async fn run(mut self) {
        info!(agreement = %self.name(), root = %self.ctx.replica.root(), "protocol started");
        self.set_state(ProtocolState::AwaitingChanges);
        self.arm_window_timer();
        if self.ctx.agreement.is_enabled() && self.in_window() {
            self.wake.run = true;
        }
        loop {
            self.dispatch().await;
            let event = tokio::select! {
                e = self.rx.recv() => e,
                _ = self.stop.cancelled() => None,
            };
            let Some(event) = event else {
                break;
            };
            let mut flow = self.handle(event).await;
            while matches!(flow, Flow::Continue) {
                match self.rx.try_recv() {
                    Ok(next) => flow = self.handle(next).await,
                    Err(_) => break,
                }
            }
            if let Flow::Stop { flush } = flow {
                if flush && self.ctx.agreement.is_enabled() {
                    self.wake.run = true;
                    self.wake.forced = true;
                    self.dispatch().await;
                }
                break;
            }
        }
        if let Some(handle) = self.window.take() {
            handle.cancel();
        }
        if let Some((_, timer)) = self.backoff.take() {
            timer.stop();
        }
        if !self.conn.delete().await {
            // The linger fired but nothing is left to deliver its event.
            self.conn.linger_expired().await;
        }
        self.set_state(ProtocolState::Stopped);
        info!(agreement = %self.name(), "protocol stopped");
    }

    async fn handle(&mut self, event: SessionEvent) -> Flow {
        match event {
            SessionEvent::UpdateAvailable { attrs } => {
                let bypass = self.ctx.agreement.settings().schedule.bypasses_window(&attrs);
                if self.in_window() || bypass {
                    self.wake.run = true;
                } else {
                    self.wake.deferred = true;
                }
            }
            SessionEvent::ReplicateNow => {
                self.wake.run = true;
                self.wake.forced = true;
            }
            SessionEvent::WindowOpened | SessionEvent::WindowClosed | SessionEvent::ScheduleChanged => {
                self.arm_window_timer();
                if self.wake.deferred && self.in_window() {
                    self.wake.deferred = false;
                    self.wake.run = true;
                }
            }
            SessionEvent::BackoffExpired => {
                if self.state() == ProtocolState::BackingOff {
                    self.wake.run = true;
                    self.wake.retry = true;
                }
            }
            SessionEvent::LingerExpired => self.conn.linger_expired().await,
            SessionEvent::InitializeTotal => self.wake.total = true,
            SessionEvent::CancelTotal => self.wake.total = false,
            SessionEvent::Stop { flush } => return Flow::Stop { flush },
        }
        Flow::Continue
    }

    async fn dispatch(&mut self) {
        if !self.ctx.agreement.is_enabled() {
            self.wake = Wake {
                deferred: self.wake.deferred || self.wake.run,
                ..Wake::default()
            };
            return;
        }
        if self.wake.total {
            self.wake.total = false;
            self.run_total().await;
            return;
        }
        if !self.wake.run {
            return;
        }
        let blocked = match self.state() {
            ProtocolState::BackingOff => !self.wake.forced && !self.wake.retry,
            ProtocolState::NeedsTotalUpdate | ProtocolState::FatalError => !self.wake.forced,
            _ => false,
        };
        if blocked {
            return;
        }
        self.wake.run = false;
        self.wake.forced = false;
        self.wake.retry = false;
        self.run_incremental().await;
    }

    fn session(&self) -> Session<'_> {
        Session {
            replica: &self.ctx.replica,
            agreement: &self.ctx.agreement,
            conn: &self.conn,
            stop: &self.stop,
        }
    }

    async fn run_incremental(&mut self) {
        let agreement = self.ctx.agreement.clone();
        agreement.begin_update();
        self.set_state(ProtocolState::AcquiringReplica);
        let result = match self.session().acquire_replica(false).await {
            Ok(acquired) => {
                let sent = if acquired.response == ReplicaResponse::UpToDate {
                    Ok(crate::incremental::IncrementalOutcome {
                        sent: 0,
                        more: false,
                        consumer_ruv: acquired.consumer_ruv,
                    })
                } else {
                    self.set_state(ProtocolState::SendingUpdates);
                    self.session()
                        .send_updates(acquired.generation, acquired.consumer_ruv, &acquired.supplier_ruv)
                        .await
                };
                self.set_state(ProtocolState::ReleasingReplica);
                self.session().release_replica(false).await;
                sent
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(outcome) => {
                agreement.set_consumer_ruv(Some(outcome.consumer_ruv));
                agreement.end_update(
                    LdapResultCode::Success,
                    Some(ReplicaResponse::Ready),
                    "Incremental update succeeded",
                    outcome.sent,
                );
                self.session_succeeded().await;
                if outcome.more {
                    let pause = agreement.settings().session_pause;
                    if let Err(e) = self
                        .ctx
                        .queue
                        .schedule_in(pause, self.sink(SessionEvent::UpdateAvailable { attrs: Vec::new() }))
                    {
                        debug!(agreement = %self.name(), error = %e, "could not schedule follow-up session");
                    }
                }
            }
            Err(failure) => {
                agreement.end_update(failure.code(), failure.response(), &failure.message(), 0);
                self.session_failed(failure).await;
            }
        }
    }

    async fn run_total(&mut self) {
        let agreement = self.ctx.agreement.clone();
        let cancel = self.stop.child_token();
        if let Ok(mut slot) = self.total_cancel.lock() {
            *slot = Some(cancel.clone());
        }
        agreement.begin_init();
        info!(agreement = %self.name(), "total update starting");
        self.set_state(ProtocolState::AcquiringReplica);
        let result = match self.session().acquire_replica(true).await {
            Ok(acquired) => {
                self.set_state(ProtocolState::SendingData);
                let sent = self.session().send_total(acquired.generation, &cancel).await;
                self.set_state(ProtocolState::ReleasingReplica);
                self.session().release_replica(true).await;
                sent.map(|n| (n, acquired.supplier_ruv))
            }
            Err(e) => Err(e),
        };
        if let Ok(mut slot) = self.total_cancel.lock() {
            *slot = None;
        }
        match result {
            Ok((sent, supplier_ruv)) => {
                info!(agreement = %self.name(), entries = sent, "total update finished");
                agreement.set_consumer_ruv(Some(supplier_ruv));
                agreement.end_init(LdapResultCode::Success, Some(ReplicaResponse::Ready), "Total update succeeded", sent);
                self.session_succeeded().await;
                // Catch up on changes made while the total update ran.
                self.wake.run = true;
            }
            Err(SessionFailure::Stopped) if cancel.is_cancelled() && !self.stop.is_cancelled() => {
                info!(agreement = %self.name(), "total update cancelled");
                agreement.end_init(LdapResultCode::Unavailable, None, "Total update cancelled", 0);
                self.set_state(ProtocolState::AwaitingChanges);
            }
            Err(failure) => {
                agreement.end_init(failure.code(), failure.response(), &failure.message(), 0);
                self.session_failed(failure).await;
            }
        }
    }

    async fn session_succeeded(&mut self) {
        if let Some((_, timer)) = self.backoff.take() {
            timer.stop();
        }
        self.ctx.agreement.clear_session_error();
        self.set_state(ProtocolState::AwaitingChanges);
        self.conn.start_linger().await;
    }

    fn backoff_step(&mut self, busy: bool) {
        let settings = self.ctx.agreement.settings();
        let restart = !matches!(&self.backoff, Some((kind, timer)) if *kind == busy && timer.is_running());
        let result = if restart {
            if let Some((_, old)) = self.backoff.take() {
                old.stop();
            }
            let timer = if busy {
                BackoffTimer::new(
                    self.ctx.queue.clone(),
                    BackoffKind::Random,
                    settings.busy_wait,
                    settings.backoff_max,
                )
            } else {
                BackoffTimer::new(
                    self.ctx.queue.clone(),
                    BackoffKind::Exponential,
                    settings.backoff_min,
                    settings.backoff_max,
                )
            };
            let fired = timer.reset(self.sink(SessionEvent::BackoffExpired)).map(Some);
            self.backoff = Some((busy, timer));
            fired
        } else {
            match &self.backoff {
                Some((_, timer)) => timer.step(),
                None => Ok(None),
            }
        };
        if let Err(e) = result {
            debug!(agreement = %self.name(), error = %e, "could not schedule backoff");
        }
    }

    async fn session_failed(&mut self, failure: SessionFailure) {
        match &failure {
            SessionFailure::Retry { busy, message, .. } => {
                self.ctx.agreement.log_session_error(message);
                self.backoff_step(*busy);
                self.set_state(ProtocolState::BackingOff);
            }
            SessionFailure::NeedsTotal(message) => {
                if self.ctx.agreement.log_session_error(message) {
                    warn!(agreement = %self.name(), "peer needs to be reinitialized with a total update");
                }
                if let Some((_, timer)) = self.backoff.take() {
                    timer.stop();
                }
                self.set_state(ProtocolState::NeedsTotalUpdate);
            }
            SessionFailure::Fatal { message, .. } => {
                if self.ctx.agreement.log_session_error(message) {
                    error!(agreement = %self.name(), error = %message, "replication stopped until the configuration is fixed");
                }
                if let Some((_, timer)) = self.backoff.take() {
                    timer.stop();
                }
                self.set_state(ProtocolState::FatalError);
            }
            SessionFailure::Stopped => {}
        }
        if failure != SessionFailure::Stopped {
            self.conn.disconnect().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_oids() {
        assert_eq!(ProtocolGeneration::Ds50.start_oid(), START_NSDS50_REPLICATION_REQUEST_OID);
        assert_eq!(ProtocolGeneration::Ds71.start_oid(), START_NSDS50_REPLICATION_REQUEST_OID);
        assert_eq!(ProtocolGeneration::Ds90.start_oid(), START_NSDS90_REPLICATION_REQUEST_OID);
        assert_eq!(ProtocolGeneration::Ds50.protocol_oid(true), NSDS50_TOTAL_PROTOCOL_OID);
        assert_eq!(ProtocolGeneration::Ds71.protocol_oid(false), NSDS71_INCREMENTAL_PROTOCOL_OID);
        assert_eq!(ProtocolGeneration::Ds50.entry_oid(), NSDS50_REPLICATION_ENTRY_REQUEST_OID);
        assert_eq!(ProtocolGeneration::Ds90.entry_oid(), NSDS71_REPLICATION_ENTRY_REQUEST_OID);
        assert!(!ProtocolGeneration::Ds50.pipelined());
        assert!(ProtocolGeneration::Ds71.pipelined());
    }

    #[test]
    fn test_failure_classification() {
        assert_eq!(SessionFailure::from(ConnError::ShuttingDown), SessionFailure::Stopped);
        assert!(matches!(
            SessionFailure::from(ConnError::SslNotEnabled),
            SessionFailure::Fatal { .. }
        ));
        match SessionFailure::from(ConnError::Busy) {
            SessionFailure::Retry { busy, code, .. } => {
                assert!(busy);
                assert_eq!(code, LdapResultCode::Busy);
            }
            other => panic!("unexpected {other:?}"),
        }
        let busy = SessionFailure::from(ReplError::ReplicaBusy {
            root: "dc=example".to_string(),
            holder: "x".to_string(),
        });
        assert!(matches!(busy, SessionFailure::Retry { busy: true, .. }));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ProtocolState::NeedsTotalUpdate.to_string(), "needs total update");
        assert_eq!(ProtocolState::AwaitingChanges.to_string(), "awaiting changes");
    }
}
