//! Integration tests for multi-server replication over the loopback
//! transport.
//!
//! These tests drive whole engines: total initialization, incremental
//! updates in both directions, recovery after an outage, and replica-id
//! retirement.

mod common;

use common::{eventually, initialized_pair, Server, ROOT};
use dirsrv_repl::{
    cleanallruv::TaskPhase,
    csn::{now_secs, Csn},
    entry::{UniqueId, ATTR_OBJECTCLASS},
    loopback::LoopbackNetwork,
    op::{AddOp, Mod, Operation, ReplicatedOp},
    protocol::{ProtocolGeneration, ProtocolState},
};
use std::sync::Arc;

#[tokio::test]
async fn test_total_then_incremental() {
    let network = Arc::new(LoopbackNetwork::new());
    let (a, b, agreement) = initialized_pair(&network).await;

    assert_eq!(a.snapshot(), b.snapshot());
    assert_eq!(
        a.replica.ruv().unwrap().generation(),
        b.replica.ruv().unwrap().generation()
    );
    let recorded = a.engine.agreements().get(&agreement).unwrap();
    eventually("init status", || {
        let init = recorded.init_status();
        !init.in_progress && init.sent == 3
    })
    .await;

    a.add(&format!("cn=later,ou=people,{ROOT}"), "person");
    eventually("incremental update of b", || b.has(&format!("cn=later,ou=people,{ROOT}"))).await;
    eventually("b to cover a", || b.replica.ruv().unwrap().covers_ruv(&a.replica.ruv().unwrap())).await;

    a.engine
        .modify(&common::dn(&format!("cn=later,ou=people,{ROOT}")), vec![Mod::replace("sn", ["Later"])])
        .unwrap();
    eventually("modify to reach b", || {
        b.entry(&format!("cn=later,ou=people,{ROOT}"))
            .map_or(false, |e| e.values("sn") == ["Later".to_string()])
    })
    .await;

    a.engine.delete(&common::dn(&format!("cn=later,ou=people,{ROOT}"))).unwrap();
    eventually("delete to reach b", || !b.has(&format!("cn=later,ou=people,{ROOT}"))).await;

    a.engine.shutdown().await;
    b.engine.shutdown().await;
}

#[tokio::test]
async fn test_updates_flow_both_ways() {
    let network = Arc::new(LoopbackNetwork::new());
    let (a, b, _) = initialized_pair(&network).await;
    b.replicate_to(&a);

    b.add(&format!("cn=from-b,ou=people,{ROOT}"), "person");
    a.add(&format!("cn=from-a,ou=people,{ROOT}"), "person");
    eventually("b's write on a", || a.has(&format!("cn=from-b,ou=people,{ROOT}"))).await;
    eventually("a's write on b", || b.has(&format!("cn=from-a,ou=people,{ROOT}"))).await;
    eventually("both sides to match", || a.snapshot() == b.snapshot()).await;

    let ruv_a = a.replica.ruv().unwrap();
    let ruv_b = b.replica.ruv().unwrap();
    assert!(ruv_a.max_csn(2).is_some());
    assert!(ruv_b.max_csn(1).is_some());

    a.engine.shutdown().await;
    b.engine.shutdown().await;
}

#[tokio::test]
async fn test_legacy_peer_still_replicates() {
    let network = Arc::new(LoopbackNetwork::new());
    let a = Server::new(&network, "a.example.com", 1);
    let b = Server::new(&network, "b.example.com", 2);
    network.set_generation("b.example.com", common::PORT, ProtocolGeneration::Ds50);
    a.add(ROOT, "domain");
    let agreement = a.replicate_to(&b);
    a.engine.initialize(&agreement).await.unwrap();
    eventually("total update of b", || b.has(ROOT)).await;

    a.add(&format!("cn=one,{ROOT}"), "person");
    a.add(&format!("cn=two,{ROOT}"), "person");
    eventually("incremental update of b", || b.has(&format!("cn=two,{ROOT}"))).await;
    assert_eq!(a.snapshot(), b.snapshot());

    a.engine.shutdown().await;
    b.engine.shutdown().await;
}

#[tokio::test]
async fn test_outage_backs_off_and_recovers() {
    let network = Arc::new(LoopbackNetwork::new());
    let (a, b, agreement) = initialized_pair(&network).await;

    network.set_down(&b.host, common::PORT, true);
    a.add(&format!("cn=during,ou=people,{ROOT}"), "person");
    let state = a
        .engine
        .agreements()
        .wait_for_state(&agreement, |s| *s == ProtocolState::BackingOff)
        .await;
    assert_eq!(state, Some(ProtocolState::BackingOff));
    assert!(!b.has(&format!("cn=during,ou=people,{ROOT}")));

    network.set_down(&b.host, common::PORT, false);
    eventually("b after the outage", || b.has(&format!("cn=during,ou=people,{ROOT}"))).await;
    let state = a
        .engine
        .agreements()
        .wait_for_state(&agreement, |s| *s == ProtocolState::AwaitingChanges)
        .await;
    assert_eq!(state, Some(ProtocolState::AwaitingChanges));

    a.engine.shutdown().await;
    b.engine.shutdown().await;
}

#[tokio::test]
async fn test_cleanallruv_retires_replica_id() {
    let network = Arc::new(LoopbackNetwork::new());
    let (a, b, agreement) = initialized_pair(&network).await;

    // A change from a supplier that has since been decommissioned.
    let ghost = ReplicatedOp::new(
        Csn::new(now_secs(), 0, 3, 0),
        Operation::Add(AddOp {
            dn: common::dn(&format!("cn=ghost,{ROOT}")),
            uniqueid: UniqueId::new("ghost"),
            parent_uniqueid: None,
            attrs: vec![(ATTR_OBJECTCLASS.to_string(), vec!["person".to_string()])],
        }),
    );
    assert!(a.replica.apply_replicated(&ghost).unwrap().is_applied());
    a.engine.agreements().replicate_now(&agreement).unwrap();
    eventually("rid 3 on b", || b.replica.ruv().unwrap().max_csn(3).is_some()).await;

    a.engine.clean_all_ruv(&common::dn(ROOT), 3, false).unwrap();
    let status = a.engine.wait_clean_all_ruv(3).await.unwrap();
    assert_eq!(status.phase, TaskPhase::Done);
    assert_eq!(status.peers_cleaned, 1);

    for server in [&a, &b] {
        assert!(server.replica.ruv().unwrap().element(3).is_none());
        assert!(server.replica.cleaned().is_cleaned_rid(3));
        assert!(server.has(&format!("cn=ghost,{ROOT}")));
    }
    let checks = a.engine.check_clean_topology(&common::dn(ROOT), 3).await.unwrap();
    assert_eq!(checks.len(), 1);
    assert_eq!(checks[0].status.as_deref(), Ok("CLEANED"));

    a.engine.shutdown().await;
    b.engine.shutdown().await;
}
