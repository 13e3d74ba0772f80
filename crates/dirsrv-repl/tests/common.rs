//! Common test utilities and fixtures for integration tests.

#![allow(dead_code)]

use dirsrv_repl::{
    agreement_registry::{ConfigEntry, ATTR_REPLICA_ROOT, OC_AGREEMENT},
    dn::Dn,
    engine::{EngineConfig, ReplicationEngine},
    entry::{Entry, ATTR_OBJECTCLASS},
    loopback::LoopbackNetwork,
    replica::{Replica, ReplicaSettings, ReplicaType, DEFAULT_PURGE_DELAY},
    store::EntryStore,
};
use std::sync::Arc;
use std::time::Duration;

pub const ROOT: &str = "dc=example,dc=com";
pub const BIND_DN: &str = "cn=replication manager,cn=config";
pub const PORT: u16 = 389;

pub fn dn(s: &str) -> Dn {
    Dn::parse(s).unwrap()
}

pub fn oc(class: &str) -> Vec<(String, Vec<String>)> {
    vec![(ATTR_OBJECTCLASS.to_string(), vec![class.to_string()])]
}

/// One server on the loopback network with a single replica of `ROOT`.
pub struct Server {
    pub host: String,
    pub engine: Arc<ReplicationEngine>,
    pub replica: Arc<Replica>,
}

impl Server {
    pub fn new(network: &Arc<LoopbackNetwork>, host: &str, rid: u16) -> Self {
        let engine = Arc::new(ReplicationEngine::new(EngineConfig::default(), network.clone()));
        network.register(host, PORT, &engine);
        let replica = engine
            .add_memory_replica(ReplicaSettings {
                name: format!("{host}-userroot"),
                root: dn(ROOT),
                rid,
                replica_type: ReplicaType::Supplier,
                update_dns: vec![dn(BIND_DN)],
                purge_delay: DEFAULT_PURGE_DELAY,
                max_clock_skew: dirsrv_repl::csn::DEFAULT_MAX_CLOCK_SKEW_SECS,
            })
            .unwrap();
        Self {
            host: host.to_string(),
            engine,
            replica,
        }
    }

    /// Add an agreement from this server to `to`. Returns its DN.
    pub fn replicate_to(&self, to: &Server) -> Dn {
        let entry = ConfigEntry {
            dn: dn(&format!("cn={}-to-{},cn=replica,cn=config", self.host, to.host)),
            attrs: vec![
                (ATTR_OBJECTCLASS.to_string(), vec![OC_AGREEMENT.to_string()]),
                (ATTR_REPLICA_ROOT.to_string(), vec![ROOT.to_string()]),
                ("nsds5replicahost".to_string(), vec![to.host.clone()]),
                ("nsds5replicaport".to_string(), vec![PORT.to_string()]),
                ("nsds5replicabinddn".to_string(), vec![BIND_DN.to_string()]),
                ("nsds5replicacredentials".to_string(), vec!["{CLEAR}secret".to_string()]),
                ("nsds5replicabackoffmin".to_string(), vec!["1".to_string()]),
                ("nsds5replicabackoffmax".to_string(), vec!["2".to_string()]),
            ],
        };
        self.engine.add_agreement(&entry).unwrap().dn().clone()
    }

    pub fn add(&self, d: &str, class: &str) {
        self.engine.add(&dn(d), oc(class)).unwrap();
    }

    pub fn entry(&self, d: &str) -> Option<Entry> {
        let id = self.replica.store().lookup_dn(&dn(d)).unwrap()?;
        self.replica.store().get(&id).unwrap()
    }

    pub fn has(&self, d: &str) -> bool {
        self.entry(d).map_or(false, |e| e.is_live())
    }

    /// Live entries as (normalized DN, unique id), sorted.
    pub fn snapshot(&self) -> Vec<(String, String)> {
        let mut all: Vec<_> = self
            .replica
            .store()
            .scan(&dn(ROOT))
            .unwrap()
            .into_iter()
            .filter(|e| e.is_live())
            .map(|e| (e.dn().normalized(), e.uniqueid().as_str().to_string()))
            .collect();
        all.sort();
        all
    }
}

/// Poll `check` until it holds, failing the test after ten seconds.
pub async fn eventually<F: FnMut() -> bool>(what: &str, mut check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Two servers, `a` populated and `b` initialized from it.
pub async fn initialized_pair(network: &Arc<LoopbackNetwork>) -> (Server, Server, Dn) {
    let a = Server::new(network, "a.example.com", 1);
    let b = Server::new(network, "b.example.com", 2);
    a.add(ROOT, "domain");
    a.add(&format!("ou=people,{ROOT}"), "organizationalunit");
    a.add(&format!("cn=seed,ou=people,{ROOT}"), "person");
    let agreement = a.replicate_to(&b);
    a.engine.initialize(&agreement).await.unwrap();
    eventually("total update of b", || b.has(&format!("cn=seed,ou=people,{ROOT}"))).await;
    (a, b, agreement)
}
