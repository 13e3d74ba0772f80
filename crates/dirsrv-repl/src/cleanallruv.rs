//! CleanAllRUV: retiring a replica id across the topology.
//!
//! A task gathers the highest CSN any peer holds for the retired id, waits
//! until this replica has caught up to it, marks the id cleaned so stray
//! changes from it are no longer logged, tells every peer to do the same and
//! finally drops the id from the local RUV and changelog. Tasks check their
//! abort token between peers.

use crate::agreement::Agreement;
use crate::connection::{ConnError, Connection, LdapConnector};
use crate::csn::{Csn, ReplicaId, MAX_WRITABLE_REPLICA_ID, READ_ONLY_REPLICA_ID};
use crate::error::ReplError;
use crate::ldap::{
    ExtendedRequest, ExtendedResponse, LdapResultCode, CLEANRUV_ABORT_OID, CLEANRUV_CHECK_STATUS_OID,
    CLEANRUV_GET_MAXCSN_OID, CLEANRUV_OID,
};
use crate::replica::Replica;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Most tasks that may run at once.
pub const MAX_CLEANALLRUV_TASKS: usize = 4;

/// Get-max-CSN answer when the peer has nothing for the id.
pub const NO_MAXCSN: &str = "no maxcsn";
/// Check-status answer once the id is gone.
pub const STATUS_CLEANED: &str = "CLEANED";
/// Check-status answer while the id is still present.
pub const STATUS_CLEANING: &str = "CLEANING";

/// Replica ids retired by CleanAllRUV. Shared by a replica and its changelog.
#[derive(Debug, Default)]
pub struct CleanedRids {
    rids: RwLock<BTreeSet<ReplicaId>>,
}

impl CleanedRids {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set restored from persisted state.
    pub fn from_rids<I: IntoIterator<Item = ReplicaId>>(rids: I) -> Self {
        Self {
            rids: RwLock::new(rids.into_iter().collect()),
        }
    }

    /// True if changes from `rid` are dropped.
    pub fn is_cleaned_rid(&self, rid: ReplicaId) -> bool {
        self.rids.read().map(|r| r.contains(&rid)).unwrap_or(false)
    }

    /// Mark `rid` cleaned. Returns false if it already was.
    pub fn mark_cleaned(&self, rid: ReplicaId) -> bool {
        self.rids.write().map(|mut r| r.insert(rid)).unwrap_or(false)
    }

    /// Undo [`Self::mark_cleaned`].
    pub fn unmark(&self, rid: ReplicaId) -> bool {
        self.rids.write().map(|mut r| r.remove(&rid)).unwrap_or(false)
    }

    /// Cleaned ids in ascending order.
    pub fn list(&self) -> Vec<ReplicaId> {
        self.rids.read().map(|r| r.iter().copied().collect()).unwrap_or_default()
    }
}

/// CleanAllRUV tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanAllRuvConfig {
    /// Attempts per peer and step before the task gives up.
    pub max_attempts: u32,
    /// Base delay between attempts; up to half of it is added as jitter.
    pub retry_delay_ms: u64,
}

impl Default for CleanAllRuvConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay_ms: 1000,
        }
    }
}

/// Where a task is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskPhase {
    /// Asking peers for their max CSN.
    GatheringMaxCsn,
    /// Waiting for the local replica to reach the topology max.
    WaitingForLocal,
    /// Telling peers to clean.
    CleaningPeers,
    /// Finished.
    Done,
    /// Aborted by an administrator.
    Aborted,
    /// Gave up.
    Failed(String),
}

impl TaskPhase {
    /// True once the task stopped.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Done | Self::Aborted | Self::Failed(_))
    }
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GatheringMaxCsn => f.write_str("gathering max csn"),
            Self::WaitingForLocal => f.write_str("waiting for local replica"),
            Self::CleaningPeers => f.write_str("cleaning peers"),
            Self::Done => f.write_str("done"),
            Self::Aborted => f.write_str("aborted"),
            Self::Failed(msg) => write!(f, "failed: {msg}"),
        }
    }
}

/// Progress of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    /// Replica id being retired.
    pub rid: ReplicaId,
    /// Replica root.
    pub root: String,
    /// Current phase.
    pub phase: TaskPhase,
    /// Topology max CSN once known.
    pub max_csn: Option<Csn>,
    /// Peers that confirmed the clean.
    pub peers_cleaned: usize,
    /// Peers in the topology.
    pub peers_total: usize,
}

/// One peer's answer to a status check.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerCleanStatus {
    /// Agreement name.
    pub agreement: String,
    /// Peer answer, or the error that prevented one.
    pub status: Result<String, ConnError>,
}

struct TaskEntry {
    replica: Arc<Replica>,
    peers: Vec<Arc<Agreement>>,
    abort: CancellationToken,
    status: Arc<Mutex<TaskStatus>>,
    handle: Option<JoinHandle<()>>,
}

/// Runs CleanAllRUV tasks and answers peers' CleanAllRUV requests.
pub struct CleanAllRuvManager {
    config: CleanAllRuvConfig,
    connector: Arc<dyn LdapConnector>,
    shutdown: CancellationToken,
    tasks: Mutex<HashMap<ReplicaId, TaskEntry>>,
}

fn set_phase(status: &Mutex<TaskStatus>, phase: TaskPhase) {
    if let Ok(mut s) = status.lock() {
        s.phase = phase;
    }
}

impl CleanAllRuvManager {
    /// New manager; tasks stop when `shutdown` fires.
    pub fn new(config: CleanAllRuvConfig, connector: Arc<dyn LdapConnector>, shutdown: CancellationToken) -> Self {
        Self {
            config,
            connector,
            shutdown,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_tasks(&self) -> Result<std::sync::MutexGuard<'_, HashMap<ReplicaId, TaskEntry>>, ReplError> {
        self.tasks.lock().map_err(|_| ReplError::poisoned("cleanallruv tasks"))
    }

    /// Start retiring `rid` from `replica` and every peer in `peers`. With
    /// `force`, unreachable peers are skipped instead of failing the task.
    pub fn start(
        &self,
        replica: Arc<Replica>,
        peers: Vec<Arc<Agreement>>,
        rid: ReplicaId,
        force: bool,
    ) -> Result<(), ReplError> {
        if rid == READ_ONLY_REPLICA_ID || rid > MAX_WRITABLE_REPLICA_ID {
            return Err(ReplError::InvalidReplicaId {
                rid,
                msg: "not a writable replica id".to_string(),
            });
        }
        if rid == replica.rid() {
            return Err(ReplError::InvalidReplicaId {
                rid,
                msg: "a replica cannot clean its own id".to_string(),
            });
        }
        let mut tasks = self.lock_tasks()?;
        let running = |entry: &TaskEntry| entry.status.lock().map(|s| !s.phase.is_finished()).unwrap_or(false);
        if tasks.get(&rid).map_or(false, running) {
            return Err(ReplError::TaskExists { rid });
        }
        if tasks.values().filter(|e| running(e)).count() >= MAX_CLEANALLRUV_TASKS {
            return Err(ReplError::TooManyTasks {
                limit: MAX_CLEANALLRUV_TASKS,
            });
        }
        let status = Arc::new(Mutex::new(TaskStatus {
            rid,
            root: replica.root().to_string(),
            phase: TaskPhase::GatheringMaxCsn,
            max_csn: None,
            peers_cleaned: 0,
            peers_total: peers.len(),
        }));
        let abort = self.shutdown.child_token();
        let task = CleanTask {
            replica: replica.clone(),
            peers: peers.clone(),
            rid,
            force,
            config: self.config.clone(),
            connector: self.connector.clone(),
            abort: abort.clone(),
            status: status.clone(),
        };
        info!(root = %replica.root(), rid, force, peers = peers.len(), "starting cleanallruv task");
        let handle = tokio::spawn(task.run());
        tasks.insert(
            rid,
            TaskEntry {
                replica,
                peers,
                abort,
                status,
                handle: Some(handle),
            },
        );
        Ok(())
    }

    /// Status of the task for `rid`.
    pub fn status(&self, rid: ReplicaId) -> Option<TaskStatus> {
        let tasks = self.tasks.lock().ok()?;
        let entry = tasks.get(&rid)?;
        let status = entry.status.lock().ok()?.clone();
        Some(status)
    }

    /// Status of every known task.
    pub fn list(&self) -> Vec<TaskStatus> {
        let Ok(tasks) = self.tasks.lock() else {
            return Vec::new();
        };
        let mut all: Vec<TaskStatus> = tasks
            .values()
            .filter_map(|e| e.status.lock().ok().map(|s| s.clone()))
            .collect();
        all.sort_by_key(|s| s.rid);
        all
    }

    /// Wait for the task for `rid` to stop and return its final status.
    pub async fn wait(&self, rid: ReplicaId) -> Option<TaskStatus> {
        let handle = self.tasks.lock().ok()?.get_mut(&rid)?.handle.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(rid, error = %e, "cleanallruv task panicked");
            }
        }
        self.status(rid)
    }

    /// Abort the task for `rid`: stop it, lift the cleaned marker and tell
    /// the peers to do the same.
    pub async fn abort(&self, rid: ReplicaId) -> Result<(), ReplError> {
        let (replica, peers, handle) = {
            let mut tasks = self.lock_tasks()?;
            let entry = tasks.get_mut(&rid).ok_or_else(|| ReplError::InvalidArgument {
                msg: format!("no cleanallruv task for rid {rid}"),
            })?;
            entry.abort.cancel();
            (entry.replica.clone(), entry.peers.clone(), entry.handle.take())
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(rid, error = %e, "cleanallruv task panicked before abort");
            }
        }
        replica.cleaned().unmark(rid);
        replica.flush()?;
        if let Some(entry) = self.lock_tasks()?.get(&rid) {
            set_phase(&entry.status, TaskPhase::Aborted);
        }
        info!(root = %replica.root(), rid, "cleanallruv task aborted");
        for peer in &peers {
            let request = ExtendedRequest::AbortCleanRuv {
                repl_root: replica.root().to_string(),
                rid,
            };
            if let Err(e) = peer_extop(&self.connector, &self.shutdown, peer, CLEANRUV_ABORT_OID, request).await {
                warn!(agreement = %peer.name(), rid, error = %e, "could not send cleanallruv abort");
            }
        }
        Ok(())
    }

    /// Ask every peer whether `rid` is gone.
    pub async fn check_topology(&self, replica: &Replica, peers: &[Arc<Agreement>], rid: ReplicaId) -> Vec<PeerCleanStatus> {
        let mut statuses = Vec::with_capacity(peers.len());
        for peer in peers {
            let request = ExtendedRequest::CleanRuvCheckStatus {
                repl_root: replica.root().to_string(),
                rid,
            };
            let status = peer_extop(&self.connector, &self.shutdown, peer, CLEANRUV_CHECK_STATUS_OID, request)
                .await
                .map(|r| r.value.unwrap_or_default());
            statuses.push(PeerCleanStatus {
                agreement: peer.name().to_string(),
                status,
            });
        }
        statuses
    }

    /// Answer a CleanAllRUV request sent by another server's task.
    pub fn handle_peer(&self, replica: &Replica, request: &ExtendedRequest) -> Result<ExtendedResponse, ReplError> {
        match request {
            ExtendedRequest::CleanRuvGetMaxCsn { rid, .. } => {
                let max = replica.ruv()?.max_csn(*rid);
                Ok(ExtendedResponse {
                    value: Some(max.map_or_else(|| NO_MAXCSN.to_string(), |c| c.to_string())),
                    ..Default::default()
                })
            }
            ExtendedRequest::CleanRuv { rid, max_csn, force, .. } => {
                let ruv = replica.ruv()?;
                if let Some(max) = max_csn {
                    if !force && !ruv.covers_csn(max) {
                        debug!(root = %replica.root(), rid, max = %max, "not caught up for cleanallruv yet");
                        return Err(ReplError::Refused {
                            code: LdapResultCode::Busy,
                            msg: format!("replica has not reached {max}"),
                        });
                    }
                }
                replica.cleaned().mark_cleaned(*rid);
                replica.purge_rid(*rid)?;
                replica.flush()?;
                info!(root = %replica.root(), rid, "replica id cleaned at the request of a peer");
                Ok(ExtendedResponse::default())
            }
            ExtendedRequest::AbortCleanRuv { rid, .. } => {
                if let Ok(tasks) = self.tasks.lock() {
                    if let Some(entry) = tasks.get(rid) {
                        entry.abort.cancel();
                        set_phase(&entry.status, TaskPhase::Aborted);
                    }
                }
                if replica.cleaned().unmark(*rid) {
                    replica.flush()?;
                    info!(root = %replica.root(), rid, "cleanallruv aborted at the request of a peer");
                }
                Ok(ExtendedResponse::default())
            }
            ExtendedRequest::CleanRuvCheckStatus { rid, .. } => {
                let gone = replica.cleaned().is_cleaned_rid(*rid) && replica.ruv()?.element(*rid).is_none();
                Ok(ExtendedResponse {
                    value: Some(if gone { STATUS_CLEANED } else { STATUS_CLEANING }.to_string()),
                    ..Default::default()
                })
            }
            other => Err(ReplError::InvalidArgument {
                msg: format!("not a cleanallruv request: {other:?}"),
            }),
        }
    }
}

async fn peer_extop(
    connector: &Arc<dyn LdapConnector>,
    shutdown: &CancellationToken,
    peer: &Arc<Agreement>,
    oid: &str,
    request: ExtendedRequest,
) -> Result<ExtendedResponse, ConnError> {
    let conn = Connection::new(peer.clone(), connector.clone(), shutdown.clone());
    conn.connect().await?;
    let result = conn.extended_operation(oid, request).await;
    conn.disconnect().await;
    result
}

struct CleanTask {
    replica: Arc<Replica>,
    peers: Vec<Arc<Agreement>>,
    rid: ReplicaId,
    force: bool,
    config: CleanAllRuvConfig,
    connector: Arc<dyn LdapConnector>,
    abort: CancellationToken,
    status: Arc<Mutex<TaskStatus>>,
}

enum Step<T> {
    Done(T),
    Aborted,
    GaveUp(String),
}

impl CleanTask {
    async fn run(self) {
        let phase = match self.execute().await {
            Ok(phase) => phase,
            Err(e) => TaskPhase::Failed(e.to_string()),
        };
        match &phase {
            TaskPhase::Done => info!(root = %self.replica.root(), rid = self.rid, "cleanallruv task finished"),
            TaskPhase::Aborted => debug!(root = %self.replica.root(), rid = self.rid, "cleanallruv task stopped"),
            other => warn!(root = %self.replica.root(), rid = self.rid, status = %other, "cleanallruv task failed"),
        }
        if let Ok(mut s) = self.status.lock() {
            // An abort may already have recorded the outcome.
            if !s.phase.is_finished() {
                s.phase = phase;
            }
        }
    }

    async fn pause(&self) -> bool {
        let base = self.config.retry_delay_ms;
        let jitter = rand::thread_rng().gen_range(0..=base / 2);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(base + jitter)) => true,
            _ = self.abort.cancelled() => false,
        }
    }

    async fn with_retries(&self, peer: &Arc<Agreement>, oid: &str, request: ExtendedRequest) -> Step<ExtendedResponse> {
        let mut last = String::new();
        for attempt in 1..=self.config.max_attempts.max(1) {
            if self.abort.is_cancelled() {
                return Step::Aborted;
            }
            match peer_extop(&self.connector, &self.abort, peer, oid, request.clone()).await {
                Ok(response) => return Step::Done(response),
                Err(ConnError::ShuttingDown) => return Step::Aborted,
                Err(e) => {
                    debug!(agreement = %peer.name(), rid = self.rid, attempt, error = %e, "cleanallruv peer request failed");
                    last = e.to_string();
                }
            }
            if attempt < self.config.max_attempts && !self.pause().await {
                return Step::Aborted;
            }
        }
        Step::GaveUp(format!("peer {} did not answer: {last}", peer.name()))
    }

    async fn execute(&self) -> Result<TaskPhase, ReplError> {
        let root = self.replica.root().to_string();
        let mut max_csn = self.replica.ruv()?.max_csn(self.rid);
        for peer in &self.peers {
            let request = ExtendedRequest::CleanRuvGetMaxCsn {
                repl_root: root.clone(),
                rid: self.rid,
            };
            match self.with_retries(peer, CLEANRUV_GET_MAXCSN_OID, request).await {
                Step::Done(response) => {
                    let peer_max = response
                        .value
                        .filter(|v| v != NO_MAXCSN)
                        .map(|v| v.parse::<Csn>())
                        .transpose()?;
                    max_csn = max_csn.max(peer_max);
                }
                Step::Aborted => return Ok(TaskPhase::Aborted),
                Step::GaveUp(msg) if self.force => {
                    warn!(agreement = %peer.name(), rid = self.rid, "skipping unreachable peer: {msg}");
                }
                Step::GaveUp(msg) => return Ok(TaskPhase::Failed(msg)),
            }
        }
        if let Ok(mut s) = self.status.lock() {
            s.max_csn = max_csn;
            s.phase = TaskPhase::WaitingForLocal;
        }

        if let Some(max) = max_csn {
            let mut attempts = 0;
            while !self.force && !self.replica.ruv()?.covers_csn(&max) {
                attempts += 1;
                if attempts >= self.config.max_attempts.max(1) {
                    return Ok(TaskPhase::Failed(format!("local replica never reached {max}")));
                }
                if !self.pause().await {
                    return Ok(TaskPhase::Aborted);
                }
            }
        }
        self.replica.cleaned().mark_cleaned(self.rid);
        self.replica.flush()?;
        set_phase(&self.status, TaskPhase::CleaningPeers);

        for peer in &self.peers {
            let request = ExtendedRequest::CleanRuv {
                repl_root: root.clone(),
                rid: self.rid,
                max_csn,
                force: self.force,
            };
            match self.with_retries(peer, CLEANRUV_OID, request).await {
                Step::Done(_) => {
                    if let Ok(mut s) = self.status.lock() {
                        s.peers_cleaned += 1;
                    }
                }
                Step::Aborted => return Ok(TaskPhase::Aborted),
                Step::GaveUp(msg) if self.force => {
                    warn!(agreement = %peer.name(), rid = self.rid, "skipping unreachable peer: {msg}");
                }
                Step::GaveUp(msg) => return Ok(TaskPhase::Failed(msg)),
            }
        }
        if self.abort.is_cancelled() {
            return Ok(TaskPhase::Aborted);
        }
        self.replica.purge_rid(self.rid)?;
        self.replica.flush()?;
        Ok(TaskPhase::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agreement::{AgreementSettings, PeerTarget};
    use crate::connection::LdapSession;
    use crate::dn::Dn;
    use crate::ldap::LdapError;
    use crate::op::{AddOp, Operation, ReplicatedOp};
    use crate::entry::UniqueId;
    use crate::replica::{ReplicaSettings, ReplicaType, DEFAULT_PURGE_DELAY};
    use crate::store::{MemoryEntryStore, MemoryStateStore};
    use crate::urp::UrpConfig;
    use async_trait::async_trait;

    struct Unreachable;

    #[async_trait]
    impl LdapConnector for Unreachable {
        fn security_initialized(&self) -> bool {
            false
        }

        async fn open(&self, _target: &PeerTarget) -> Result<Arc<dyn LdapSession>, LdapError> {
            Err(LdapError::new(LdapResultCode::ConnectError, "unreachable"))
        }
    }

    fn dn(s: &str) -> Dn {
        Dn::parse(s).unwrap()
    }

    fn replica(rid: ReplicaId) -> Arc<Replica> {
        let settings = ReplicaSettings {
            name: format!("r{rid}"),
            root: dn("dc=example"),
            rid,
            replica_type: ReplicaType::Supplier,
            update_dns: Vec::new(),
            purge_delay: DEFAULT_PURGE_DELAY,
            max_clock_skew: crate::csn::DEFAULT_MAX_CLOCK_SKEW_SECS,
        };
        Arc::new(
            Replica::new(
                settings,
                Arc::new(MemoryEntryStore::new()),
                Arc::new(MemoryStateStore::new()),
                UrpConfig::default(),
            )
            .unwrap(),
        )
    }

    fn manager() -> CleanAllRuvManager {
        let config = CleanAllRuvConfig {
            max_attempts: 2,
            retry_delay_ms: 10,
        };
        CleanAllRuvManager::new(config, Arc::new(Unreachable), CancellationToken::new())
    }

    fn agreement(name: &str) -> Arc<Agreement> {
        let settings = AgreementSettings {
            host: "peer".to_string(),
            ..Default::default()
        };
        Arc::new(Agreement::new(dn(&format!("cn={name},cn=config")), dn("dc=example"), settings).unwrap())
    }

    fn remote_op(rid: ReplicaId) -> ReplicatedOp {
        ReplicatedOp::new(
            Csn::new(crate::csn::now_secs(), 0, rid, 0),
            Operation::Add(AddOp {
                dn: dn("dc=example"),
                uniqueid: UniqueId::new("root"),
                parent_uniqueid: None,
                attrs: vec![("dc".to_string(), vec!["example".to_string()])],
            }),
        )
    }

    mod cleaned_rids {
        use super::*;

        #[test]
        fn test_mark_and_unmark() {
            let set = CleanedRids::from_rids([3]);
            assert!(set.is_cleaned_rid(3));
            assert!(set.mark_cleaned(5));
            assert!(!set.mark_cleaned(5));
            assert_eq!(set.list(), vec![3, 5]);
            assert!(set.unmark(3));
            assert!(!set.is_cleaned_rid(3));
        }
    }

    mod tasks {
        use super::*;

        #[tokio::test]
        async fn test_local_only_task_purges() {
            let m = manager();
            let r = replica(1);
            r.apply_replicated(&remote_op(5)).unwrap();
            assert!(r.ruv().unwrap().element(5).is_some());
            m.start(r.clone(), Vec::new(), 5, false).unwrap();
            let status = m.wait(5).await.unwrap();
            assert_eq!(status.phase, TaskPhase::Done);
            assert!(r.cleaned().is_cleaned_rid(5));
            assert!(r.ruv().unwrap().element(5).is_none());
            assert!(r.changelog().is_empty());
            r.apply_replicated(&ReplicatedOp::new(Csn::new(crate::csn::now_secs() + 1, 0, 5, 0), remote_op(5).op))
                .unwrap();
            assert!(r.changelog().is_empty());
        }

        #[tokio::test]
        async fn test_rejects_bad_ids() {
            let m = manager();
            let r = replica(1);
            assert!(m.start(r.clone(), Vec::new(), 1, false).is_err());
            assert!(m.start(r.clone(), Vec::new(), 0, false).is_err());
            assert!(m.start(r, Vec::new(), 65535, false).is_err());
        }

        #[tokio::test(start_paused = true)]
        async fn test_unreachable_peer_fails_unless_forced() {
            let m = manager();
            let r = replica(1);
            m.start(r.clone(), vec![agreement("a")], 5, false).unwrap();
            let status = m.wait(5).await.unwrap();
            assert!(matches!(status.phase, TaskPhase::Failed(_)));
            assert!(!r.cleaned().is_cleaned_rid(5));

            m.start(r.clone(), vec![agreement("a")], 5, true).unwrap();
            let status = m.wait(5).await.unwrap();
            assert_eq!(status.phase, TaskPhase::Done);
            assert_eq!(status.peers_cleaned, 0);
            assert!(r.cleaned().is_cleaned_rid(5));
        }

        #[tokio::test(start_paused = true)]
        async fn test_task_limit() {
            let m = manager();
            let r = replica(1);
            for rid in 2..6 {
                m.start(r.clone(), vec![agreement("a")], rid, false).unwrap();
            }
            assert!(matches!(
                m.start(r.clone(), Vec::new(), 9, false),
                Err(ReplError::TooManyTasks { limit: 4 })
            ));
            assert!(matches!(m.start(r, Vec::new(), 2, false), Err(ReplError::TaskExists { rid: 2 })));
            assert_eq!(m.list().len(), 4);
        }

        #[tokio::test(start_paused = true)]
        async fn test_abort_lifts_marker() {
            let m = manager();
            let r = replica(1);
            m.start(r.clone(), vec![agreement("a")], 7, false).unwrap();
            m.abort(7).await.unwrap();
            assert_eq!(m.status(7).unwrap().phase, TaskPhase::Aborted);
            assert!(!r.cleaned().is_cleaned_rid(7));
        }
    }

    mod peer_requests {
        use super::*;

        #[test]
        fn test_get_max_csn_and_status() {
            let m = manager();
            let r = replica(1);
            let get = ExtendedRequest::CleanRuvGetMaxCsn {
                repl_root: "dc=example".to_string(),
                rid: 5,
            };
            assert_eq!(m.handle_peer(&r, &get).unwrap().value.as_deref(), Some(NO_MAXCSN));
            let op = remote_op(5);
            r.apply_replicated(&op).unwrap();
            assert_eq!(m.handle_peer(&r, &get).unwrap().value, Some(op.csn.to_string()));
            let check = ExtendedRequest::CleanRuvCheckStatus {
                repl_root: "dc=example".to_string(),
                rid: 5,
            };
            assert_eq!(m.handle_peer(&r, &check).unwrap().value.as_deref(), Some(STATUS_CLEANING));
        }

        #[test]
        fn test_clean_waits_for_catch_up() {
            let m = manager();
            let r = replica(1);
            let op = remote_op(5);
            let clean = ExtendedRequest::CleanRuv {
                repl_root: "dc=example".to_string(),
                rid: 5,
                max_csn: Some(op.csn),
                force: false,
            };
            let err = m.handle_peer(&r, &clean).unwrap_err();
            assert_eq!(err.result_code(), LdapResultCode::Busy);
            r.apply_replicated(&op).unwrap();
            m.handle_peer(&r, &clean).unwrap();
            assert!(r.cleaned().is_cleaned_rid(5));
            let check = ExtendedRequest::CleanRuvCheckStatus {
                repl_root: "dc=example".to_string(),
                rid: 5,
            };
            assert_eq!(m.handle_peer(&r, &check).unwrap().value.as_deref(), Some(STATUS_CLEANED));
            let abort = ExtendedRequest::AbortCleanRuv {
                repl_root: "dc=example".to_string(),
                rid: 5,
            };
            m.handle_peer(&r, &abort).unwrap();
            assert!(!r.cleaned().is_cleaned_rid(5));
        }
    }
}
