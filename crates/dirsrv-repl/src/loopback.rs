//! In-process transport: agreements reach peer engines in the same process
//! by `host:port`, with switches to inject transport faults.

use crate::agreement::{BindMethod, PeerTarget};
use crate::connection::{LdapConnector, LdapSession};
use crate::consumer::InboundSession;
use crate::engine::ReplicationEngine;
use crate::ldap::{
    LdapError, LdapRequest, LdapResponse, LdapResultCode, MessageId, ResponseControl, SearchEntry, SearchRequest,
};
use crate::protocol::ProtocolGeneration;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::debug;

struct PeerState {
    engine: Weak<ReplicationEngine>,
    down: AtomicBool,
    fail_sends: AtomicBool,
    unwritable: AtomicBool,
    generation: Mutex<ProtocolGeneration>,
    password: Mutex<Option<String>>,
    opened: AtomicU32,
}

impl PeerState {
    fn generation(&self) -> ProtocolGeneration {
        self.generation.lock().map(|g| *g).unwrap_or(ProtocolGeneration::Ds90)
    }
}

fn server_down(what: &str) -> LdapError {
    LdapError::new(LdapResultCode::ServerDown, format!("{what}: server is down"))
}

/// Routes `host:port` to engines registered in this process.
#[derive(Default)]
pub struct LoopbackNetwork {
    peers: DashMap<String, Arc<PeerState>>,
}

impl LoopbackNetwork {
    /// Empty network.
    pub fn new() -> Self {
        Self::default()
    }

    fn key(host: &str, port: u16) -> String {
        format!("{}:{port}", host.to_ascii_lowercase())
    }

    fn peer(&self, address: &str) -> Option<Arc<PeerState>> {
        self.peers.get(address).map(|p| p.value().clone())
    }

    /// Make `engine` reachable at `host:port`. The network holds a weak
    /// reference so engines can share it as their connector.
    pub fn register(&self, host: &str, port: u16, engine: &Arc<ReplicationEngine>) {
        self.peers.insert(
            Self::key(host, port),
            Arc::new(PeerState {
                engine: Arc::downgrade(engine),
                down: AtomicBool::new(false),
                fail_sends: AtomicBool::new(false),
                unwritable: AtomicBool::new(false),
                generation: Mutex::new(ProtocolGeneration::Ds90),
                password: Mutex::new(None),
                opened: AtomicU32::new(0),
            }),
        );
    }

    /// Remove a peer; later connections are refused.
    pub fn unregister(&self, host: &str, port: u16) -> bool {
        self.peers.remove(&Self::key(host, port)).is_some()
    }

    fn with_peer(&self, host: &str, port: u16, f: impl FnOnce(&PeerState)) {
        if let Some(peer) = self.peer(&Self::key(host, port)) {
            f(&peer);
        }
    }

    /// Take a peer down or bring it back. While down, open and every
    /// operation fail with `ServerDown`.
    pub fn set_down(&self, host: &str, port: u16, down: bool) {
        self.with_peer(host, port, |p| p.down.store(down, Ordering::SeqCst));
    }

    /// Make sends to a peer fail while the session stays open.
    pub fn set_fail_sends(&self, host: &str, port: u16, fail: bool) {
        self.with_peer(host, port, |p| p.fail_sends.store(fail, Ordering::SeqCst));
    }

    /// Report the transport as never writable.
    pub fn set_unwritable(&self, host: &str, port: u16, unwritable: bool) {
        self.with_peer(host, port, |p| p.unwritable.store(unwritable, Ordering::SeqCst));
    }

    /// Protocol generation the peer advertises.
    pub fn set_generation(&self, host: &str, port: u16, generation: ProtocolGeneration) {
        self.with_peer(host, port, |p| {
            if let Ok(mut g) = p.generation.lock() {
                *g = generation;
            }
        });
    }

    /// Require this password on bind.
    pub fn set_password(&self, host: &str, port: u16, password: Option<&str>) {
        self.with_peer(host, port, |p| {
            if let Ok(mut pw) = p.password.lock() {
                *pw = password.map(str::to_string);
            }
        });
    }

    /// Sessions opened to a peer so far.
    pub fn opened(&self, host: &str, port: u16) -> u32 {
        self.peer(&Self::key(host, port))
            .map_or(0, |p| p.opened.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl LdapConnector for LoopbackNetwork {
    fn security_initialized(&self) -> bool {
        true
    }

    async fn open(&self, target: &PeerTarget) -> Result<Arc<dyn LdapSession>, LdapError> {
        let address = Self::key(&target.host, target.port);
        let peer = self
            .peer(&address)
            .ok_or_else(|| LdapError::new(LdapResultCode::ConnectError, format!("{address}: no such host")))?;
        if peer.down.load(Ordering::SeqCst) || peer.engine.strong_count() == 0 {
            return Err(LdapError::new(LdapResultCode::ConnectError, format!("{address}: connection refused")));
        }
        peer.opened.fetch_add(1, Ordering::SeqCst);
        debug!(peer = %address, "loopback session opened");
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Ok(Arc::new(LoopbackSession {
            address,
            peer,
            inbound: Mutex::new(None),
            next_id: AtomicU32::new(1),
            results_tx,
            results: tokio::sync::Mutex::new(results_rx),
        }))
    }
}

/// One session to a loopback peer. Requests are handled synchronously by the
/// peer's inbound session and their results queued in order.
pub struct LoopbackSession {
    address: String,
    peer: Arc<PeerState>,
    inbound: Mutex<Option<InboundSession>>,
    next_id: AtomicU32,
    results_tx: mpsc::UnboundedSender<LdapResponse>,
    results: tokio::sync::Mutex<mpsc::UnboundedReceiver<LdapResponse>>,
}

impl LoopbackSession {
    fn check_up(&self) -> Result<(), LdapError> {
        if self.peer.down.load(Ordering::SeqCst) {
            return Err(server_down(&self.address));
        }
        Ok(())
    }

    fn with_inbound<T>(&self, f: impl FnOnce(&mut InboundSession) -> T) -> Result<T, LdapError> {
        let mut inbound = self
            .inbound
            .lock()
            .map_err(|_| LdapError::new(LdapResultCode::LocalError, "session lock poisoned"))?;
        let session = inbound
            .as_mut()
            .ok_or_else(|| LdapError::new(LdapResultCode::OperationsError, "session is not bound"))?;
        Ok(f(session))
    }
}

#[async_trait]
impl LdapSession for LoopbackSession {
    async fn bind(&self, _method: BindMethod, dn: &str, password: &str) -> Result<Vec<ResponseControl>, LdapError> {
        self.check_up()?;
        let required = self.peer.password.lock().ok().and_then(|p| p.clone());
        if required.is_some_and(|required| required != password) {
            return Err(LdapError::new(LdapResultCode::InvalidCredentials, "invalid credentials"));
        }
        let engine = self.peer.engine.upgrade().ok_or_else(|| server_down(&self.address))?;
        let mut session = engine.inbound_session(self.peer.generation());
        session.bind(dn);
        let mut inbound = self
            .inbound
            .lock()
            .map_err(|_| LdapError::new(LdapResultCode::LocalError, "session lock poisoned"))?;
        *inbound = Some(session);
        Ok(Vec::new())
    }

    async fn writable(&self) -> bool {
        !self.peer.unwritable.load(Ordering::SeqCst)
    }

    async fn send(&self, request: LdapRequest) -> Result<MessageId, LdapError> {
        self.check_up()?;
        if self.peer.fail_sends.load(Ordering::SeqCst) {
            return Err(server_down(&self.address));
        }
        let msgid = self.next_id.fetch_add(1, Ordering::SeqCst);
        let response = self.with_inbound(|session| session.handle(msgid, request))?;
        self.results_tx.send(response).map_err(|_| server_down(&self.address))?;
        Ok(msgid)
    }

    async fn next_result(&self) -> Result<LdapResponse, LdapError> {
        self.check_up()?;
        self.results
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| server_down(&self.address))
    }

    async fn search(&self, request: SearchRequest) -> Result<Vec<SearchEntry>, LdapError> {
        self.check_up()?;
        self.with_inbound(|session| session.search(&request))?
            .map_err(|code| LdapError::new(code, format!("search of {:?} failed", request.base)))
    }

    async fn unbind(&self) {
        if let Ok(mut inbound) = self.inbound.lock() {
            inbound.take();
        }
    }
}
