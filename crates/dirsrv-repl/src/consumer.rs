//! Inbound replication: the consumer side of a supplier's session.
//!
//! One [`InboundSession`] serves one supplier connection. It answers the
//! capability queries a supplier makes, decides whether to accept a start
//! request, runs replicated updates through URP, stages a total update until
//! its end request arrives and forwards CleanAllRUV requests to the task
//! manager.

use crate::cleanallruv::CleanAllRuvManager;
use crate::csn::Csn;
use crate::dn::Dn;
use crate::entry::Entry;
use crate::error::ReplError;
use crate::ldap::{
    ExtendedRequest, ExtendedResponse, LdapRequest, LdapResponse, LdapResultCode, MessageId, ReplicaResponse,
    SearchEntry, SearchRequest, END_NSDS50_REPLICATION_REQUEST_OID, NSDS50_INCREMENTAL_PROTOCOL_OID,
    NSDS50_REPLICATION_ENTRY_REQUEST_OID, NSDS50_REPLICATION_RESPONSE_OID, NSDS50_TOTAL_PROTOCOL_OID,
    NSDS71_INCREMENTAL_PROTOCOL_OID, NSDS71_REPLICATION_ENTRY_REQUEST_OID, NSDS71_TOTAL_PROTOCOL_OID,
    NSDS90_REPLICATION_RESPONSE_OID, START_NSDS50_REPLICATION_REQUEST_OID, START_NSDS90_REPLICATION_REQUEST_OID,
    CLEANRUV_ABORT_OID, CLEANRUV_CHECK_STATUS_OID, CLEANRUV_GET_MAXCSN_OID, CLEANRUV_OID,
};
use crate::op::ReplicatedOp;
use crate::protocol::ProtocolGeneration;
use crate::replica::{replica_config_dn, Replica, ReplicaType, ATTR_REPLICA_ID, ATTR_REPLICA_TYPE};
use crate::replica_registry::ReplicaRegistry;
use crate::ruv::Ruv;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Extensions advertised in the root DSE, per protocol generation.
pub fn supported_extensions(generation: ProtocolGeneration) -> Vec<String> {
    let mut oids = vec![
        START_NSDS50_REPLICATION_REQUEST_OID,
        END_NSDS50_REPLICATION_REQUEST_OID,
        NSDS50_REPLICATION_ENTRY_REQUEST_OID,
        NSDS50_REPLICATION_RESPONSE_OID,
        CLEANRUV_OID,
        CLEANRUV_ABORT_OID,
        CLEANRUV_GET_MAXCSN_OID,
        CLEANRUV_CHECK_STATUS_OID,
    ];
    if generation >= ProtocolGeneration::Ds71 {
        oids.push(NSDS71_REPLICATION_ENTRY_REQUEST_OID);
    }
    if generation >= ProtocolGeneration::Ds90 {
        oids.push(START_NSDS90_REPLICATION_REQUEST_OID);
        oids.push(NSDS90_REPLICATION_RESPONSE_OID);
    }
    oids.into_iter().map(str::to_string).collect()
}

struct Active {
    replica: Arc<Replica>,
    total: bool,
    supplier_ruv: Ruv,
    staged: Vec<Entry>,
}

/// Server side of one supplier connection.
pub struct InboundSession {
    id: String,
    replicas: Arc<ReplicaRegistry>,
    cleanallruv: Arc<CleanAllRuvManager>,
    generation: ProtocolGeneration,
    bound_dn: Option<String>,
    active: Option<Active>,
}

fn clean_root(request: &ExtendedRequest) -> Option<Dn> {
    match request {
        ExtendedRequest::CleanRuv { repl_root, .. }
        | ExtendedRequest::AbortCleanRuv { repl_root, .. }
        | ExtendedRequest::CleanRuvGetMaxCsn { repl_root, .. }
        | ExtendedRequest::CleanRuvCheckStatus { repl_root, .. } => Dn::parse(repl_root).ok(),
        _ => None,
    }
}

fn reply(msgid: MessageId, code: LdapResultCode, message: impl Into<String>) -> LdapResponse {
    LdapResponse {
        message: message.into(),
        ..LdapResponse::new(msgid, code)
    }
}

fn extended(msgid: MessageId, body: ExtendedResponse) -> LdapResponse {
    LdapResponse {
        extended: Some(body),
        ..LdapResponse::new(msgid, LdapResultCode::Success)
    }
}

impl InboundSession {
    /// New session. `id` names the session as an exclusive-access holder.
    pub fn new(
        id: impl Into<String>,
        replicas: Arc<ReplicaRegistry>,
        cleanallruv: Arc<CleanAllRuvManager>,
        generation: ProtocolGeneration,
    ) -> Self {
        Self {
            id: id.into(),
            replicas,
            cleanallruv,
            generation,
            bound_dn: None,
            active: None,
        }
    }

    /// Record the bound identity.
    pub fn bind(&mut self, dn: &str) {
        self.bound_dn = Some(dn.to_string());
    }

    /// Answer a base search: the root DSE, or a replica's configuration entry.
    pub fn search(&self, request: &SearchRequest) -> Result<Vec<SearchEntry>, LdapResultCode> {
        if request.base.is_empty() {
            return Ok(vec![SearchEntry {
                dn: String::new(),
                attrs: vec![(
                    "supportedextension".to_string(),
                    supported_extensions(self.generation),
                )],
            }]);
        }
        let base = Dn::parse(&request.base).map_err(|_| LdapResultCode::InvalidDnSyntax)?;
        let replica = self
            .replicas
            .enumerate()
            .into_iter()
            .find(|r| Dn::parse(&replica_config_dn(r.root())).map_or(false, |d| d == base))
            .ok_or(LdapResultCode::NoSuchObject)?;
        let kind = match replica.replica_type() {
            ReplicaType::Supplier => "supplier",
            ReplicaType::Consumer => "consumer",
        };
        Ok(vec![SearchEntry {
            dn: request.base.clone(),
            attrs: vec![
                (ATTR_REPLICA_ID.to_string(), vec![replica.rid().to_string()]),
                (ATTR_REPLICA_TYPE.to_string(), vec![kind.to_string()]),
            ],
        }])
    }

    /// Handle one request.
    pub fn handle(&mut self, msgid: MessageId, request: LdapRequest) -> LdapResponse {
        match request {
            LdapRequest::Extended { oid, request } => self.handle_extended(msgid, &oid, request),
            update => self.handle_update(msgid, &update),
        }
    }

    fn handle_extended(&mut self, msgid: MessageId, oid: &str, request: ExtendedRequest) -> LdapResponse {
        match request {
            ExtendedRequest::StartReplication {
                protocol_oid,
                repl_root,
                supplier_ruv,
                csn,
            } => {
                let response_oid = if oid == START_NSDS90_REPLICATION_REQUEST_OID {
                    NSDS90_REPLICATION_RESPONSE_OID
                } else {
                    NSDS50_REPLICATION_RESPONSE_OID
                };
                let (response, ruv) = self.start(&protocol_oid, &repl_root, supplier_ruv, csn);
                extended(
                    msgid,
                    ExtendedResponse {
                        oid: Some(response_oid.to_string()),
                        response: Some(response),
                        ruv,
                        value: None,
                    },
                )
            }
            ExtendedRequest::EndReplication { .. } => {
                let response = self.end();
                extended(
                    msgid,
                    ExtendedResponse {
                        oid: Some(NSDS50_REPLICATION_RESPONSE_OID.to_string()),
                        response: Some(response),
                        ruv: None,
                        value: None,
                    },
                )
            }
            ExtendedRequest::ReplicationEntry { entry } => match self.active.as_mut() {
                Some(active) if active.total => {
                    active.staged.push(entry);
                    LdapResponse::new(msgid, LdapResultCode::Success)
                }
                _ => reply(msgid, LdapResultCode::UnwillingToPerform, "no total update in progress"),
            },
            clean => {
                let Some(replica) = clean_root(&clean).and_then(|root| self.replicas.get_by_root(&root)) else {
                    return reply(msgid, LdapResultCode::NoSuchObject, "no replica for the requested root");
                };
                match self.cleanallruv.handle_peer(&replica, &clean) {
                    Ok(body) => extended(msgid, body),
                    Err(e) => reply(msgid, e.result_code(), e.to_string()),
                }
            }
        }
    }

    fn start(&mut self, protocol_oid: &str, repl_root: &str, supplier_ruv: Ruv, csn: Csn) -> (ReplicaResponse, Option<Ruv>) {
        if self.active.is_some() {
            debug!(session = %self.id, "start while a session is active");
            return (ReplicaResponse::Busy, None);
        }
        let Some(replica) = Dn::parse(repl_root).ok().and_then(|root| self.replicas.get_by_root(&root)) else {
            return (ReplicaResponse::NoSuchReplica, None);
        };
        let bound = self.bound_dn.as_deref().unwrap_or("");
        if !replica.is_updatedn(bound) {
            warn!(replica = %replica.name(), bind_dn = bound, "supplier is not an update DN");
            return (ReplicaResponse::PermissionDenied, None);
        }
        let total = match protocol_oid {
            NSDS50_INCREMENTAL_PROTOCOL_OID => false,
            NSDS50_TOTAL_PROTOCOL_OID => true,
            NSDS71_INCREMENTAL_PROTOCOL_OID if self.generation >= ProtocolGeneration::Ds71 => false,
            NSDS71_TOTAL_PROTOCOL_OID if self.generation >= ProtocolGeneration::Ds71 => true,
            _ => return (ReplicaResponse::UnknownUpdateProtocol, None),
        };
        if !replica.is_enabled() {
            return (ReplicaResponse::Disabled, None);
        }
        if replica.replica_type() == ReplicaType::Supplier && csn.rid() == replica.rid() {
            warn!(replica = %replica.name(), rid = csn.rid(), "supplier uses this replica's id");
            return (ReplicaResponse::ReplicaIdError, None);
        }
        if let Err(e) = replica.adjust_time(&csn) {
            warn!(replica = %replica.name(), csn = %csn, error = %e, "supplier clock is too far ahead");
            return (ReplicaResponse::ExcessiveClockSkew, None);
        }
        if let Err(e) = replica.get_exclusive_access(&self.id, total) {
            debug!(replica = %replica.name(), error = %e, "replica busy");
            return (ReplicaResponse::Busy, None);
        }
        if total {
            if let Err(e) = replica.begin_total_recv() {
                replica.relinquish_exclusive_access(&self.id);
                debug!(replica = %replica.name(), error = %e, "replica busy");
                return (ReplicaResponse::Busy, None);
            }
        }
        let ruv = match replica.ruv() {
            Ok(ruv) => ruv,
            Err(e) => {
                warn!(replica = %replica.name(), error = %e, "cannot read RUV");
                Self::release(&replica, &self.id, total);
                return (ReplicaResponse::InternalError, None);
            }
        };
        let up_to_date =
            !total && ruv.generation() == supplier_ruv.generation() && ruv.covers_ruv(&supplier_ruv);
        info!(replica = %replica.name(), session = %self.id, total, up_to_date, "replication session accepted");
        self.active = Some(Active {
            replica,
            total,
            supplier_ruv,
            staged: Vec::new(),
        });
        let response = if up_to_date {
            ReplicaResponse::UpToDate
        } else {
            ReplicaResponse::Ready
        };
        (response, Some(ruv))
    }

    fn release(replica: &Replica, holder: &str, total: bool) {
        replica.relinquish_exclusive_access(holder);
        if total {
            replica.end_total_recv();
        }
    }

    fn end(&mut self) -> ReplicaResponse {
        let Some(active) = self.active.take() else {
            return ReplicaResponse::ReleaseSucceeded;
        };
        let mut response = ReplicaResponse::ReleaseSucceeded;
        if active.total {
            match active.replica.import_total(active.staged, active.supplier_ruv) {
                Ok(count) => info!(replica = %active.replica.name(), entries = count, "total update received"),
                Err(e) => {
                    warn!(replica = %active.replica.name(), error = %e, "total update import failed");
                    response = ReplicaResponse::InternalError;
                }
            }
        }
        Self::release(&active.replica, &self.id, active.total);
        response
    }

    fn handle_update(&mut self, msgid: MessageId, request: &LdapRequest) -> LdapResponse {
        let Some(active) = self.active.as_ref().filter(|a| !a.total) else {
            return reply(msgid, LdapResultCode::UnwillingToPerform, "no incremental session in progress");
        };
        let op = match ReplicatedOp::from_request(request) {
            Ok(op) => op,
            Err(e) => return reply(msgid, LdapResultCode::ProtocolError, e.to_string()),
        };
        match active.replica.apply_replicated(&op) {
            Ok(decision) => {
                debug!(csn = %op.csn, resolution = ?decision.resolution, "replicated update applied");
                LdapResponse::new(msgid, decision.code)
            }
            Err(e) => {
                if matches!(e, ReplError::Divergence { .. }) {
                    tracing::error!(csn = %op.csn, error = %e, "replication divergence needs administrative repair");
                }
                reply(msgid, e.result_code(), e.to_string())
            }
        }
    }
}

impl Drop for InboundSession {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            debug!(session = %self.id, "connection closed mid-session, releasing replica");
            Self::release(&active.replica, &self.id, active.total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanallruv::CleanAllRuvConfig;
    use crate::agreement::PeerTarget;
    use crate::connection::{LdapConnector, LdapSession};
    use crate::csn::{now_secs, ReplicaId};
    use crate::entry::UniqueId;
    use crate::ldap::LdapError;
    use crate::op::{AddOp, Operation};
    use crate::replica::{ReplicaSettings, DEFAULT_PURGE_DELAY};
    use crate::store::{MemoryEntryStore, MemoryStateStore};
    use crate::urp::UrpConfig;
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    const SUPPLIER_DN: &str = "cn=replication manager,cn=config";

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

    fn setup(rid: ReplicaId) -> (Arc<Replica>, InboundSession) {
        let settings = ReplicaSettings {
            name: "userroot".to_string(),
            root: dn("dc=example"),
            rid,
            replica_type: ReplicaType::Supplier,
            update_dns: vec![dn(SUPPLIER_DN)],
            purge_delay: DEFAULT_PURGE_DELAY,
            max_clock_skew: crate::csn::DEFAULT_MAX_CLOCK_SKEW_SECS,
        };
        let replica = Arc::new(
            Replica::new(
                settings,
                Arc::new(MemoryEntryStore::new()),
                Arc::new(MemoryStateStore::new()),
                UrpConfig::default(),
            )
            .unwrap(),
        );
        let replicas = Arc::new(ReplicaRegistry::new());
        replicas.add_by_name(replica.clone()).unwrap();
        let manager = Arc::new(CleanAllRuvManager::new(
            CleanAllRuvConfig::default(),
            Arc::new(Unreachable),
            CancellationToken::new(),
        ));
        let mut session = InboundSession::new("inbound-1", replicas, manager, ProtocolGeneration::Ds90);
        session.bind(SUPPLIER_DN);
        (replica, session)
    }

    fn start(session: &mut InboundSession, protocol_oid: &str, ruv: Ruv, csn: Csn) -> ExtendedResponse {
        let response = session.handle(
            1,
            LdapRequest::Extended {
                oid: START_NSDS90_REPLICATION_REQUEST_OID.to_string(),
                request: ExtendedRequest::StartReplication {
                    protocol_oid: protocol_oid.to_string(),
                    repl_root: "dc=example".to_string(),
                    supplier_ruv: ruv,
                    csn,
                },
            },
        );
        assert_eq!(response.code, LdapResultCode::Success);
        response.extended.unwrap()
    }

    fn end(session: &mut InboundSession) -> ReplicaResponse {
        let response = session.handle(
            2,
            LdapRequest::Extended {
                oid: END_NSDS50_REPLICATION_REQUEST_OID.to_string(),
                request: ExtendedRequest::EndReplication {
                    repl_root: "dc=example".to_string(),
                },
            },
        );
        response.extended.and_then(|e| e.response).unwrap()
    }

    fn supplier_csn() -> Csn {
        Csn::new(now_secs(), 0, 2, 0)
    }

    mod start_checks {
        use super::*;

        #[test]
        fn test_root_dse_per_generation() {
            let ds50 = supported_extensions(ProtocolGeneration::Ds50);
            assert!(!ds50.contains(&NSDS71_REPLICATION_ENTRY_REQUEST_OID.to_string()));
            let ds90 = supported_extensions(ProtocolGeneration::Ds90);
            assert!(ds90.contains(&START_NSDS90_REPLICATION_REQUEST_OID.to_string()));
        }

        #[test]
        fn test_replica_config_search() {
            let (_, session) = setup(1);
            let entries = session
                .search(&SearchRequest {
                    base: replica_config_dn(&dn("dc=example")),
                    scope: crate::ldap::SearchScope::Base,
                    filter: "(objectclass=*)".to_string(),
                    attrs: vec![ATTR_REPLICA_ID.to_string()],
                })
                .unwrap();
            assert_eq!(entries[0].values(ATTR_REPLICA_ID).collect::<Vec<_>>(), ["1"]);
        }

        #[test]
        fn test_rejections() {
            let (replica, mut session) = setup(1);
            let ruv = replica.ruv().unwrap();
            let own = Csn::new(now_secs(), 0, 1, 0);
            assert_eq!(
                start(&mut session, NSDS71_INCREMENTAL_PROTOCOL_OID, ruv.clone(), own).response,
                Some(ReplicaResponse::ReplicaIdError)
            );
            assert_eq!(
                start(&mut session, "1.2.3", ruv.clone(), supplier_csn()).response,
                Some(ReplicaResponse::UnknownUpdateProtocol)
            );
            let far = Csn::new(now_secs() + 2 * crate::csn::DEFAULT_MAX_CLOCK_SKEW_SECS, 0, 2, 0);
            assert_eq!(
                start(&mut session, NSDS71_INCREMENTAL_PROTOCOL_OID, ruv.clone(), far).response,
                Some(ReplicaResponse::ExcessiveClockSkew)
            );
            replica.set_enabled(false);
            assert_eq!(
                start(&mut session, NSDS71_INCREMENTAL_PROTOCOL_OID, ruv.clone(), supplier_csn()).response,
                Some(ReplicaResponse::Disabled)
            );
            session.bind("cn=nobody");
            assert_eq!(
                start(&mut session, NSDS71_INCREMENTAL_PROTOCOL_OID, ruv, supplier_csn()).response,
                Some(ReplicaResponse::PermissionDenied)
            );
        }

        #[test]
        fn test_busy_and_up_to_date() {
            let (replica, mut session) = setup(1);
            let ruv = replica.ruv().unwrap();
            let reply = start(&mut session, NSDS71_INCREMENTAL_PROTOCOL_OID, ruv.clone(), supplier_csn());
            assert_eq!(reply.response, Some(ReplicaResponse::UpToDate));
            assert_eq!(reply.oid.as_deref(), Some(NSDS90_REPLICATION_RESPONSE_OID));
            assert!(replica.get_exclusive_access("other", false).is_err());
            assert_eq!(end(&mut session), ReplicaResponse::ReleaseSucceeded);
            assert!(replica.get_exclusive_access("other", false).is_ok());
            assert_eq!(
                start(&mut session, NSDS71_INCREMENTAL_PROTOCOL_OID, ruv, supplier_csn()).response,
                Some(ReplicaResponse::Busy)
            );
        }

        #[test]
        fn test_drop_releases_access() {
            let (replica, mut session) = setup(1);
            let ruv = replica.ruv().unwrap();
            start(&mut session, NSDS71_TOTAL_PROTOCOL_OID, ruv, supplier_csn());
            assert!(!replica.can_send_incremental());
            drop(session);
            assert!(replica.can_send_incremental());
            assert!(replica.get_exclusive_access("other", true).is_ok());
        }
    }

    mod updates {
        use super::*;

        fn add(csn: Csn, rdn: &str) -> LdapRequest {
            ReplicatedOp::new(
                csn,
                Operation::Add(AddOp {
                    dn: dn(&format!("{rdn},dc=example")),
                    uniqueid: UniqueId::new(rdn),
                    parent_uniqueid: None,
                    attrs: vec![("objectclass".to_string(), vec!["person".to_string()])],
                }),
            )
            .to_request()
        }

        #[test]
        fn test_update_requires_session() {
            let (_, mut session) = setup(1);
            let response = session.handle(3, add(supplier_csn(), "cn=a"));
            assert_eq!(response.code, LdapResultCode::UnwillingToPerform);
        }

        #[test]
        fn test_total_then_incremental() {
            let (replica, mut session) = setup(1);
            let mut supplier_ruv = Ruv::with_generation("feedface");
            supplier_ruv.add_replica(2, None);
            start(&mut session, NSDS71_TOTAL_PROTOCOL_OID, supplier_ruv.clone(), supplier_csn());
            let mut root = Entry::new(dn("dc=example"), UniqueId::new("root"));
            root.add_values("objectclass", vec!["domain".to_string()], None);
            let staged = session.handle(
                4,
                LdapRequest::Extended {
                    oid: NSDS71_REPLICATION_ENTRY_REQUEST_OID.to_string(),
                    request: ExtendedRequest::ReplicationEntry { entry: root },
                },
            );
            assert_eq!(staged.code, LdapResultCode::Success);
            assert_eq!(end(&mut session), ReplicaResponse::ReleaseSucceeded);
            let ruv = replica.ruv().unwrap();
            assert_eq!(ruv.generation(), Some("feedface"));
            assert!(replica.can_send_incremental());

            let csn = supplier_csn();
            let mut incoming = supplier_ruv;
            incoming.update(csn);
            let reply = start(&mut session, NSDS71_INCREMENTAL_PROTOCOL_OID, incoming, supplier_csn());
            assert_eq!(reply.response, Some(ReplicaResponse::Ready));
            assert_eq!(session.handle(5, add(csn, "cn=a")).code, LdapResultCode::Success);
            assert_eq!(session.handle(6, add(csn, "cn=a")).code, LdapResultCode::AlreadyExists);
            end(&mut session);
            assert!(replica.ruv().unwrap().covers_csn(&csn));
        }
    }
}
