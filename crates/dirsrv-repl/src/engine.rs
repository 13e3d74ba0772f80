//! The replication service: registries, scheduler and task manager wired
//! together behind one handle.

use crate::agreement::{Agreement, ATTR_INITIALIZE};
use crate::agreement_registry::{AgreementRegistry, ConfigEntry};
use crate::cleanallruv::{CleanAllRuvConfig, CleanAllRuvManager, PeerCleanStatus, TaskStatus};
use crate::connection::LdapConnector;
use crate::consumer::InboundSession;
use crate::csn::ReplicaId;
use crate::dn::Dn;
use crate::error::ReplError;
use crate::event_queue::EventQueue;
use crate::op::Mod;
use crate::protocol::{ProtocolGeneration, SessionEvent};
use crate::replica::{AppliedOp, Replica, ReplicaSettings};
use crate::replica_registry::ReplicaRegistry;
use crate::store::{EntryStore, MemoryEntryStore, MemoryStateStore, ReplicaStateStore};
use crate::urp::UrpConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Configuration for the replication engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long an idle supplier connection stays open.
    pub linger: Duration,
    /// URP tunables for every replica.
    pub urp: UrpConfig,
    /// CleanAllRUV tuning.
    pub cleanallruv: CleanAllRuvConfig,
    /// Newest protocol generation this server offers to suppliers.
    pub generation: ProtocolGeneration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            linger: crate::connection::DEFAULT_LINGER,
            urp: UrpConfig::default(),
            cleanallruv: CleanAllRuvConfig::default(),
            generation: ProtocolGeneration::Ds90,
        }
    }
}

/// The replication engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Engine is idle and not running.
    Idle,
    /// Engine is actively running.
    Running,
    /// Engine is pushing final changes and stopping agreements.
    Draining,
    /// Engine has stopped.
    Stopped,
}

/// The central replication engine.
pub struct ReplicationEngine {
    config: EngineConfig,
    state: Mutex<EngineState>,
    replicas: Arc<ReplicaRegistry>,
    agreements: AgreementRegistry,
    cleanallruv: Arc<CleanAllRuvManager>,
    queue: EventQueue<SessionEvent>,
    shutdown: CancellationToken,
    sessions: AtomicU64,
}

impl ReplicationEngine {
    /// Create an engine. Must be called inside a tokio runtime.
    pub fn new(config: EngineConfig, connector: Arc<dyn LdapConnector>) -> Self {
        let shutdown = CancellationToken::new();
        let queue = EventQueue::start(shutdown.clone());
        let replicas = Arc::new(ReplicaRegistry::new());
        let agreements = AgreementRegistry::new(
            replicas.clone(),
            connector.clone(),
            queue.clone(),
            shutdown.clone(),
            config.linger,
        );
        let cleanallruv = Arc::new(CleanAllRuvManager::new(
            config.cleanallruv.clone(),
            connector,
            shutdown.clone(),
        ));
        Self {
            config,
            state: Mutex::new(EngineState::Idle),
            replicas,
            agreements,
            cleanallruv,
            queue,
            shutdown,
            sessions: AtomicU64::new(0),
        }
    }

    /// Mark the engine running.
    pub async fn start(&self) {
        let mut state = self.state.lock().await;
        if *state == EngineState::Idle {
            *state = EngineState::Running;
            info!(replicas = self.replicas.len(), "replication engine running");
        }
    }

    /// Get the current engine state.
    pub async fn state(&self) -> EngineState {
        *self.state.lock().await
    }

    /// Replica registry.
    pub fn replicas(&self) -> &Arc<ReplicaRegistry> {
        &self.replicas
    }

    /// Agreement registry.
    pub fn agreements(&self) -> &AgreementRegistry {
        &self.agreements
    }

    /// CleanAllRUV task manager.
    pub fn cleanallruv(&self) -> &Arc<CleanAllRuvManager> {
        &self.cleanallruv
    }

    /// Configure a replica on the given stores.
    pub fn add_replica(
        &self,
        settings: ReplicaSettings,
        store: Arc<dyn EntryStore>,
        state_store: Arc<dyn ReplicaStateStore>,
    ) -> Result<Arc<Replica>, ReplError> {
        let _guard = self.replicas.begin_configure(&settings.root)?;
        if let Some(existing) = self.replicas.get_by_root(&settings.root) {
            return Err(ReplError::ReplicaExists {
                name: existing.name().to_string(),
            });
        }
        let replica = Arc::new(Replica::new(settings, store, state_store, self.config.urp.clone())?);
        self.replicas.add_by_name(replica.clone())?;
        Ok(replica)
    }

    /// Configure a replica on fresh in-memory stores.
    pub fn add_memory_replica(&self, settings: ReplicaSettings) -> Result<Arc<Replica>, ReplError> {
        self.add_replica(
            settings,
            Arc::new(MemoryEntryStore::new()),
            Arc::new(MemoryStateStore::new()),
        )
    }

    /// Remove a replica and every agreement replicating it.
    pub async fn remove_replica(&self, name: &str) -> Result<Arc<Replica>, ReplError> {
        let replica = self.replicas.get_by_name(name).ok_or_else(|| ReplError::ReplicaUnknown {
            name: name.to_string(),
        })?;
        for agreement in self.agreements.agreements_for(replica.root()) {
            self.agreements.delete(agreement.dn()).await?;
        }
        let replica = self.replicas.delete_by_name(name)?;
        replica.flush()?;
        Ok(replica)
    }

    /// Add agreements from configuration entries.
    pub fn populate_agreements(&self, entries: &[ConfigEntry]) -> usize {
        self.agreements.populate(entries)
    }

    /// Add one agreement.
    pub fn add_agreement(&self, entry: &ConfigEntry) -> Result<Arc<Agreement>, ReplError> {
        self.agreements.add(entry)
    }

    /// Start a total update of the agreement's consumer.
    pub async fn initialize(&self, agreement: &Dn) -> Result<(), ReplError> {
        self.agreements
            .modify(agreement, &[Mod::replace(ATTR_INITIALIZE, ["start"])], false)
            .await?;
        Ok(())
    }

    fn replica_for(&self, dn: &Dn) -> Result<Arc<Replica>, ReplError> {
        self.replicas.get_for_dn(dn).ok_or_else(|| ReplError::ReplicaUnknown {
            name: dn.to_string(),
        })
    }

    fn notify(&self, replica: &Replica, applied: AppliedOp) -> AppliedOp {
        self.agreements
            .notify_change(replica.root(), &applied.op.op.touched_attrs());
        applied
    }

    /// Add an entry.
    pub fn add(&self, dn: &Dn, attrs: Vec<(String, Vec<String>)>) -> Result<AppliedOp, ReplError> {
        let replica = self.replica_for(dn)?;
        let applied = replica.local_add(dn.clone(), attrs)?;
        Ok(self.notify(&replica, applied))
    }

    /// Delete an entry.
    pub fn delete(&self, dn: &Dn) -> Result<AppliedOp, ReplError> {
        let replica = self.replica_for(dn)?;
        let applied = replica.local_delete(dn.clone())?;
        Ok(self.notify(&replica, applied))
    }

    /// Modify an entry.
    pub fn modify(&self, dn: &Dn, mods: Vec<Mod>) -> Result<AppliedOp, ReplError> {
        let replica = self.replica_for(dn)?;
        let applied = replica.local_modify(dn.clone(), mods)?;
        Ok(self.notify(&replica, applied))
    }

    /// Rename an entry.
    pub fn rename(
        &self,
        dn: &Dn,
        new_rdn: &str,
        new_superior: Option<Dn>,
        delete_old_rdn: bool,
    ) -> Result<AppliedOp, ReplError> {
        let replica = self.replica_for(dn)?;
        let applied = replica.local_rename(dn.clone(), new_rdn, new_superior, delete_old_rdn)?;
        Ok(self.notify(&replica, applied))
    }

    /// Server side of a new supplier connection.
    pub fn inbound_session(&self, generation: ProtocolGeneration) -> InboundSession {
        let n = self.sessions.fetch_add(1, Ordering::Relaxed);
        InboundSession::new(
            format!("inbound-{n}"),
            self.replicas.clone(),
            self.cleanallruv.clone(),
            generation.min(self.config.generation),
        )
    }

    /// Retire `rid` from the replica at `root` and its peers.
    pub fn clean_all_ruv(&self, root: &Dn, rid: ReplicaId, force: bool) -> Result<(), ReplError> {
        let replica = self.replicas.get_by_root(root).ok_or_else(|| ReplError::ReplicaUnknown {
            name: root.to_string(),
        })?;
        let peers = self.agreements.agreements_for(root);
        self.cleanallruv.start(replica, peers, rid, force)
    }

    /// Abort the CleanAllRUV task for `rid`.
    pub async fn abort_clean_all_ruv(&self, rid: ReplicaId) -> Result<(), ReplError> {
        self.cleanallruv.abort(rid).await
    }

    /// Status of the CleanAllRUV task for `rid`.
    pub fn clean_all_ruv_status(&self, rid: ReplicaId) -> Option<TaskStatus> {
        self.cleanallruv.status(rid)
    }

    /// Wait for the CleanAllRUV task for `rid` to finish.
    pub async fn wait_clean_all_ruv(&self, rid: ReplicaId) -> Option<TaskStatus> {
        self.cleanallruv.wait(rid).await
    }

    /// Ask every peer of `root` whether `rid` is cleaned.
    pub async fn check_clean_topology(&self, root: &Dn, rid: ReplicaId) -> Result<Vec<PeerCleanStatus>, ReplError> {
        let replica = self.replicas.get_by_root(root).ok_or_else(|| ReplError::ReplicaUnknown {
            name: root.to_string(),
        })?;
        let peers = self.agreements.agreements_for(root);
        Ok(self.cleanallruv.check_topology(&replica, &peers, rid).await)
    }

    /// Trim changelogs and reap expired tombstones on every replica.
    pub fn trim(&self) -> (usize, usize) {
        let mut totals = (0, 0);
        for replica in self.replicas.enumerate() {
            match replica.trim() {
                Ok((trimmed, reaped)) => {
                    totals.0 += trimmed;
                    totals.1 += reaped;
                }
                Err(e) => warn!(replica = %replica.name(), error = %e, "trim failed"),
            }
        }
        totals
    }

    /// Stop gracefully: push pending changes, stop agreements and tasks,
    /// flush replicas.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.lock().await;
            if *state == EngineState::Stopped || *state == EngineState::Draining {
                return;
            }
            *state = EngineState::Draining;
        }
        info!("replication engine draining");
        self.agreements.shutdown().await;
        self.shutdown.cancel();
        self.queue.shutdown();
        self.replicas.shutdown();
        *self.state.lock().await = EngineState::Stopped;
        info!("replication engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agreement::PeerTarget;
    use crate::connection::LdapSession;
    use crate::ldap::{LdapError, LdapResultCode};
    use crate::replica::{ReplicaType, DEFAULT_PURGE_DELAY};
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

    fn settings(name: &str, root: &str) -> ReplicaSettings {
        ReplicaSettings {
            name: name.to_string(),
            root: dn(root),
            rid: 1,
            replica_type: ReplicaType::Supplier,
            update_dns: Vec::new(),
            purge_delay: DEFAULT_PURGE_DELAY,
            max_clock_skew: crate::csn::DEFAULT_MAX_CLOCK_SKEW_SECS,
        }
    }

    #[tokio::test]
    async fn test_engine_lifecycle() {
        let engine = ReplicationEngine::new(EngineConfig::default(), Arc::new(Unreachable));
        assert_eq!(engine.state().await, EngineState::Idle);
        engine.start().await;
        assert_eq!(engine.state().await, EngineState::Running);
        engine.shutdown().await;
        assert_eq!(engine.state().await, EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_writes_route_to_replica() {
        let engine = ReplicationEngine::new(EngineConfig::default(), Arc::new(Unreachable));
        let replica = engine.add_memory_replica(settings("userroot", "dc=example")).unwrap();
        assert!(engine.add_memory_replica(settings("again", "dc=example")).is_err());
        engine
            .add(&dn("dc=example"), vec![("objectclass".to_string(), vec!["domain".to_string()])])
            .unwrap();
        let applied = engine
            .add(&dn("cn=a,dc=example"), vec![("objectclass".to_string(), vec!["person".to_string()])])
            .unwrap();
        assert!(replica.ruv().unwrap().covers_csn(&applied.op.csn));
        assert_eq!(replica.changelog().len(), 2);
        let err = engine.add(&dn("cn=a,dc=other"), Vec::new()).unwrap_err();
        assert!(matches!(err, ReplError::ReplicaUnknown { .. }));
        engine.remove_replica("userroot").await.unwrap();
        assert!(engine.replicas().is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_inbound_sessions_cap_generation() {
        let config = EngineConfig {
            generation: ProtocolGeneration::Ds71,
            ..EngineConfig::default()
        };
        let engine = ReplicationEngine::new(config, Arc::new(Unreachable));
        let session = engine.inbound_session(ProtocolGeneration::Ds90);
        let root = session
            .search(&crate::ldap::SearchRequest {
                base: String::new(),
                scope: crate::ldap::SearchScope::Base,
                filter: "(objectclass=*)".to_string(),
                attrs: Vec::new(),
            })
            .unwrap();
        assert!(!root[0]
            .values("supportedextension")
            .any(|v| v == crate::ldap::START_NSDS90_REPLICATION_REQUEST_OID));
        engine.shutdown().await;
    }
}
