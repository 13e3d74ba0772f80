//! The set of configured agreements and the protocol loops behind them.
//!
//! Agreements are indexed by their configuration DN. Each enabled agreement
//! owns one [`ProtocolHandle`]; enabling or disabling an agreement starts or
//! stops that loop immediately. Configuration changes go through
//! [`AgreementRegistry::modify`], which validates the whole change before
//! committing any of it.

use crate::agreement::{Agreement, AgreementSettings, InitCommand, SettingEffect, ATTR_INITIALIZE, ATTR_PRIORITY_ATTRS};
use crate::connection::LdapConnector;
use crate::dn::Dn;
use crate::entry::ATTR_OBJECTCLASS;
use crate::error::ReplError;
use crate::event_queue::EventQueue;
use crate::ldap::LdapResultCode;
use crate::op::{Mod, ModOp};
use crate::protocol::{ProtocolContext, ProtocolHandle, ProtocolState, SessionEvent};
use crate::replica_registry::ReplicaRegistry;
use crate::schedule::ATTR_UPDATE_SCHEDULE;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Objectclass of an agreement configuration entry.
pub const OC_AGREEMENT: &str = "nsds5replicationagreement";
/// Root of the subtree an agreement replicates.
pub const ATTR_REPLICA_ROOT: &str = "nsds5replicaroot";

/// Attributes of an agreement entry that are not settings.
const NAMING_ATTRS: [&str; 3] = [ATTR_OBJECTCLASS, ATTR_REPLICA_ROOT, "cn"];

/// A configuration entry as handed over by the configuration store.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigEntry {
    /// Entry DN.
    pub dn: Dn,
    /// Attributes.
    pub attrs: Vec<(String, Vec<String>)>,
}

impl ConfigEntry {
    /// Values of `attr`.
    pub fn values(&self, attr: &str) -> &[String] {
        self.attrs
            .iter()
            .find(|(a, _)| a.eq_ignore_ascii_case(attr))
            .map(|(_, v)| v.as_slice())
            .unwrap_or(&[])
    }

    /// True if the entry has objectclass `oc`.
    pub fn has_objectclass(&self, oc: &str) -> bool {
        self.values(ATTR_OBJECTCLASS).iter().any(|v| v.eq_ignore_ascii_case(oc))
    }
}

fn rejected(attr: &str, code: LdapResultCode, msg: impl Into<String>) -> ReplError {
    ReplError::ConfigRejected {
        attr: attr.to_string(),
        code,
        msg: msg.into(),
    }
}

struct Registered {
    agreement: Arc<Agreement>,
    protocol: Mutex<Option<Arc<ProtocolHandle>>>,
}

impl Registered {
    fn protocol(&self) -> Option<Arc<ProtocolHandle>> {
        self.protocol.lock().ok().and_then(|p| p.clone())
    }

    fn take_protocol(&self) -> Option<Arc<ProtocolHandle>> {
        self.protocol.lock().ok().and_then(|mut p| p.take())
    }
}

/// Agreements by configuration DN.
pub struct AgreementRegistry {
    agreements: RwLock<HashMap<String, Arc<Registered>>>,
    replicas: Arc<ReplicaRegistry>,
    connector: Arc<dyn LdapConnector>,
    queue: EventQueue<SessionEvent>,
    shutdown: CancellationToken,
    linger: Duration,
}

impl AgreementRegistry {
    /// Empty registry. Agreements resolve their replica through `replicas`.
    pub fn new(
        replicas: Arc<ReplicaRegistry>,
        connector: Arc<dyn LdapConnector>,
        queue: EventQueue<SessionEvent>,
        shutdown: CancellationToken,
        linger: Duration,
    ) -> Self {
        Self {
            agreements: RwLock::new(HashMap::new()),
            replicas,
            connector,
            queue,
            shutdown,
            linger,
        }
    }

    fn lookup(&self, dn: &Dn) -> Result<Arc<Registered>, ReplError> {
        self.agreements
            .read()
            .map_err(|_| ReplError::poisoned("agreement registry"))?
            .get(&dn.normalized())
            .cloned()
            .ok_or_else(|| ReplError::AgreementUnknown { dn: dn.to_string() })
    }

    /// Add every agreement-shaped entry. Bad entries are logged and skipped.
    /// Returns how many were added.
    pub fn populate(&self, entries: &[ConfigEntry]) -> usize {
        let mut added = 0;
        for entry in entries.iter().filter(|e| e.has_objectclass(OC_AGREEMENT)) {
            match self.add(entry) {
                Ok(_) => added += 1,
                Err(e) => warn!(dn = %entry.dn, error = %e, "skipping agreement"),
            }
        }
        info!(agreements = added, "agreements loaded");
        added
    }

    /// Build, register and start an agreement from its configuration entry.
    pub fn add(&self, entry: &ConfigEntry) -> Result<Arc<Agreement>, ReplError> {
        let root = match entry.values(ATTR_REPLICA_ROOT) {
            [root] => Dn::parse(root)?,
            _ => {
                return Err(rejected(
                    ATTR_REPLICA_ROOT,
                    LdapResultCode::UnwillingToPerform,
                    "agreement needs exactly one replica root",
                ))
            }
        };
        let replica = self.replicas.get_by_root(&root).ok_or_else(|| ReplError::ReplicaUnknown {
            name: root.to_string(),
        })?;
        let mut settings = AgreementSettings::default();
        let mut initialize = None;
        for (attr, values) in &entry.attrs {
            if NAMING_ATTRS.iter().any(|n| attr.eq_ignore_ascii_case(n)) {
                continue;
            }
            if attr.eq_ignore_ascii_case(ATTR_INITIALIZE) {
                if let [value] = values.as_slice() {
                    initialize = Some(InitCommand::parse(value)?);
                }
                continue;
            }
            settings.apply(attr, values)?;
        }
        let agreement = Arc::new(Agreement::new(entry.dn.clone(), root, settings)?);
        let registered = Arc::new(Registered {
            agreement: agreement.clone(),
            protocol: Mutex::new(None),
        });
        {
            let mut agreements = self
                .agreements
                .write()
                .map_err(|_| ReplError::poisoned("agreement registry"))?;
            let key = entry.dn.normalized();
            if agreements.contains_key(&key) {
                return Err(ReplError::AgreementExists {
                    dn: entry.dn.to_string(),
                });
            }
            agreements.insert(key, registered.clone());
        }
        info!(agreement = %agreement.name(), replica = %replica.name(), peer = %agreement.peer_target(), "agreement added");
        if agreement.is_enabled() {
            self.start_protocol(&registered);
        }
        if let Some(command) = initialize {
            if let Err(e) = self.run_init_command(&registered, command) {
                warn!(agreement = %agreement.name(), error = %e, "initialize command ignored");
            }
        }
        Ok(agreement)
    }

    fn start_protocol(&self, registered: &Registered) {
        let Ok(mut slot) = registered.protocol.lock() else {
            return;
        };
        if slot.as_ref().map_or(false, |p| p.is_running()) {
            return;
        }
        let Some(replica) = self.replicas.get_by_root(registered.agreement.root()) else {
            warn!(agreement = %registered.agreement.name(), "replica is gone, not starting protocol");
            return;
        };
        let handle = ProtocolHandle::start(ProtocolContext {
            replica,
            agreement: registered.agreement.clone(),
            connector: self.connector.clone(),
            queue: self.queue.clone(),
            shutdown: self.shutdown.clone(),
            linger: self.linger,
        });
        *slot = Some(Arc::new(handle));
    }

    fn run_init_command(&self, registered: &Registered, command: InitCommand) -> Result<(), ReplError> {
        let agreement = &registered.agreement;
        match command {
            InitCommand::Start => {
                let protocol = registered.protocol().ok_or_else(|| {
                    rejected(
                        ATTR_INITIALIZE,
                        LdapResultCode::UnwillingToPerform,
                        "agreement is disabled",
                    )
                })?;
                info!(agreement = %agreement.name(), "total update requested");
                protocol.send(SessionEvent::InitializeTotal);
            }
            InitCommand::Stop => {
                if let Some(protocol) = registered.protocol() {
                    info!(agreement = %agreement.name(), "total update abort requested");
                    protocol.send(SessionEvent::CancelTotal);
                }
            }
            InitCommand::Cancel => {
                if !agreement.init_status().in_progress {
                    agreement.end_init(LdapResultCode::Success, None, "Total update marked done", 0);
                }
            }
        }
        Ok(())
    }

    /// Apply a configuration change. Every modification is validated before
    /// any is committed. Removing the initialize command is refused unless
    /// `internal`.
    pub async fn modify(&self, dn: &Dn, mods: &[Mod], internal: bool) -> Result<Vec<SettingEffect>, ReplError> {
        let registered = self.lookup(dn)?;
        let agreement = registered.agreement.clone();
        let current = agreement.settings();
        let mut changes: Vec<(String, Vec<String>)> = Vec::new();
        let mut commands = Vec::new();
        for m in mods {
            let attr = m.attr.to_ascii_lowercase();
            if attr == ATTR_INITIALIZE {
                match (m.op, m.values.as_slice()) {
                    (ModOp::Delete, _) if internal => {}
                    (ModOp::Delete, _) => {
                        return Err(rejected(
                            ATTR_INITIALIZE,
                            LdapResultCode::UnwillingToPerform,
                            "the initialize command may not be removed",
                        ))
                    }
                    (_, [value]) => commands.push(InitCommand::parse(value)?),
                    _ => {
                        return Err(rejected(
                            ATTR_INITIALIZE,
                            LdapResultCode::UnwillingToPerform,
                            "expected a single command",
                        ))
                    }
                }
                continue;
            }
            if NAMING_ATTRS.contains(&attr.as_str()) {
                return Err(rejected(
                    &attr,
                    LdapResultCode::UnwillingToPerform,
                    "attribute cannot be modified on an agreement",
                ));
            }
            let existing: Vec<String> = match changes.iter().rev().find(|(a, _)| *a == attr) {
                Some((_, values)) => values.clone(),
                None => multi_valued(&current, &attr),
            };
            let values = match m.op {
                ModOp::Replace => m.values.clone(),
                ModOp::Add if is_multi_valued(&attr) => {
                    let mut merged = existing;
                    merged.extend(m.values.iter().cloned());
                    merged
                }
                ModOp::Add => m.values.clone(),
                ModOp::Delete if m.values.is_empty() || !is_multi_valued(&attr) => Vec::new(),
                ModOp::Delete => existing
                    .into_iter()
                    .filter(|v| !m.values.iter().any(|d| d.eq_ignore_ascii_case(v)))
                    .collect(),
            };
            changes.push((attr, values));
        }
        let effects = agreement.apply_changes(&changes)?;
        for effect in &effects {
            match effect {
                SettingEffect::Schedule => {
                    if let Some(protocol) = registered.protocol() {
                        protocol.send(SessionEvent::ScheduleChanged);
                    }
                }
                SettingEffect::Enabled(true) => {
                    info!(agreement = %agreement.name(), "agreement enabled");
                    self.start_protocol(&registered);
                }
                SettingEffect::Enabled(false) => {
                    info!(agreement = %agreement.name(), "agreement disabled");
                    if let Some(protocol) = registered.take_protocol() {
                        protocol.stop(false).await;
                    }
                }
                SettingEffect::Connection | SettingEffect::Credentials => {
                    debug!(agreement = %agreement.name(), "connection settings changed");
                }
                SettingEffect::Fractional | SettingEffect::Other => {}
            }
        }
        for command in commands {
            self.run_init_command(&registered, command)?;
        }
        Ok(effects)
    }

    /// Stop and remove an agreement.
    pub async fn delete(&self, dn: &Dn) -> Result<Arc<Agreement>, ReplError> {
        let registered = self
            .agreements
            .write()
            .map_err(|_| ReplError::poisoned("agreement registry"))?
            .remove(&dn.normalized())
            .ok_or_else(|| ReplError::AgreementUnknown { dn: dn.to_string() })?;
        if let Some(protocol) = registered.take_protocol() {
            protocol.stop(false).await;
        }
        info!(agreement = %registered.agreement.name(), "agreement deleted");
        Ok(registered.agreement.clone())
    }

    /// Agreement by configuration DN.
    pub fn get(&self, dn: &Dn) -> Option<Arc<Agreement>> {
        self.lookup(dn).ok().map(|r| r.agreement.clone())
    }

    /// Agreements replicating the subtree at `root`, ordered by name.
    pub fn agreements_for(&self, root: &Dn) -> Vec<Arc<Agreement>> {
        let Ok(agreements) = self.agreements.read() else {
            return Vec::new();
        };
        let mut found: Vec<Arc<Agreement>> = agreements
            .values()
            .filter(|r| r.agreement.root() == root)
            .map(|r| r.agreement.clone())
            .collect();
        found.sort_by(|a, b| a.name().cmp(b.name()));
        found
    }

    /// Every agreement, ordered by name.
    pub fn enumerate(&self) -> Vec<Arc<Agreement>> {
        let Ok(agreements) = self.agreements.read() else {
            return Vec::new();
        };
        let mut all: Vec<Arc<Agreement>> = agreements.values().map(|r| r.agreement.clone()).collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    fn protocols_for(&self, root: &Dn) -> Vec<Arc<ProtocolHandle>> {
        let Ok(agreements) = self.agreements.read() else {
            return Vec::new();
        };
        agreements
            .values()
            .filter(|r| r.agreement.root() == root)
            .filter_map(|r| r.protocol())
            .collect()
    }

    /// Tell every agreement of `root` that a local write touched `attrs`.
    pub fn notify_change(&self, root: &Dn, attrs: &[String]) {
        for protocol in self.protocols_for(root) {
            protocol.notify_update(attrs.to_vec());
        }
    }

    /// Run a session now, regardless of schedule and backoff.
    pub fn replicate_now(&self, dn: &Dn) -> Result<(), ReplError> {
        let protocol = self.lookup(dn)?.protocol().ok_or_else(|| {
            rejected(ATTR_INITIALIZE, LdapResultCode::UnwillingToPerform, "agreement is disabled")
        })?;
        protocol.send(SessionEvent::ReplicateNow);
        Ok(())
    }

    /// Protocol state of an agreement; `None` if it is unknown or disabled.
    pub fn protocol_state(&self, dn: &Dn) -> Option<ProtocolState> {
        self.lookup(dn).ok()?.protocol().map(|p| p.state())
    }

    /// Wait until an agreement's protocol reaches a state satisfying `pred`.
    pub async fn wait_for_state<F: FnMut(&ProtocolState) -> bool>(&self, dn: &Dn, pred: F) -> Option<ProtocolState> {
        let protocol = self.lookup(dn).ok()?.protocol()?;
        protocol.wait_for_state(pred).await
    }

    /// Stop every protocol, pushing pending changes one last time, and
    /// release the set.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<Registered>> = match self.agreements.write() {
            Ok(mut agreements) => agreements.drain().map(|(_, r)| r).collect(),
            Err(_) => return,
        };
        let mut stops = JoinSet::new();
        for registered in drained {
            if let Some(protocol) = registered.take_protocol() {
                stops.spawn(async move { protocol.stop(true).await });
            }
        }
        while let Some(joined) = stops.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "agreement stop failed");
            }
        }
        info!("agreements stopped");
    }
}

fn is_multi_valued(attr: &str) -> bool {
    attr == ATTR_UPDATE_SCHEDULE || attr == ATTR_PRIORITY_ATTRS
}

fn multi_valued(settings: &AgreementSettings, attr: &str) -> Vec<String> {
    match attr {
        ATTR_UPDATE_SCHEDULE => settings.schedule.to_values(),
        ATTR_PRIORITY_ATTRS => settings.schedule.priority_attrs().to_vec(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agreement::{PeerTarget, ATTR_ENABLED, ATTR_HOST, ATTR_PORT};
    use crate::connection::LdapSession;
    use crate::fractional::ATTR_FRACTIONAL_LIST;
    use crate::ldap::LdapError;
    use crate::replica::{Replica, ReplicaSettings, ReplicaType, DEFAULT_PURGE_DELAY};
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

    fn registry() -> AgreementRegistry {
        let replicas = Arc::new(ReplicaRegistry::new());
        let settings = ReplicaSettings {
            name: "userroot".to_string(),
            root: dn("dc=example"),
            rid: 1,
            replica_type: ReplicaType::Supplier,
            update_dns: Vec::new(),
            purge_delay: DEFAULT_PURGE_DELAY,
            max_clock_skew: crate::csn::DEFAULT_MAX_CLOCK_SKEW_SECS,
        };
        let replica = Replica::new(
            settings,
            Arc::new(MemoryEntryStore::new()),
            Arc::new(MemoryStateStore::new()),
            UrpConfig::default(),
        )
        .unwrap();
        replicas.add_by_name(Arc::new(replica)).unwrap();
        let shutdown = CancellationToken::new();
        AgreementRegistry::new(
            replicas,
            Arc::new(Unreachable),
            EventQueue::start(shutdown.clone()),
            shutdown,
            Duration::from_secs(60),
        )
    }

    fn entry(name: &str, extra: &[(&str, &str)]) -> ConfigEntry {
        let mut attrs = vec![
            (ATTR_OBJECTCLASS.to_string(), vec!["top".to_string(), OC_AGREEMENT.to_string()]),
            (ATTR_REPLICA_ROOT.to_string(), vec!["dc=example".to_string()]),
            (ATTR_HOST.to_string(), vec!["peer.example".to_string()]),
            (ATTR_PORT.to_string(), vec!["389".to_string()]),
        ];
        for (attr, value) in extra {
            attrs.push((attr.to_string(), vec![value.to_string()]));
        }
        ConfigEntry {
            dn: dn(&format!("cn={name},cn=replica,cn=config")),
            attrs,
        }
    }

    mod lifecycle {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_populate_skips_foreign_and_bad_entries() {
            let registry = registry();
            let foreign = ConfigEntry {
                dn: dn("cn=other,cn=config"),
                attrs: vec![(ATTR_OBJECTCLASS.to_string(), vec!["top".to_string()])],
            };
            let mut no_root = entry("broken", &[]);
            no_root.attrs.retain(|(a, _)| a != ATTR_REPLICA_ROOT);
            let added = registry.populate(&[entry("a", &[]), foreign, no_root, entry("b", &[])]);
            assert_eq!(added, 2);
            let names: Vec<String> = registry
                .agreements_for(&dn("dc=example"))
                .iter()
                .map(|a| a.name().to_string())
                .collect();
            assert_eq!(names, ["a", "b"]);
            registry.shutdown().await;
        }

        #[tokio::test(start_paused = true)]
        async fn test_duplicate_and_unknown_root() {
            let registry = registry();
            registry.add(&entry("a", &[])).unwrap();
            assert!(matches!(
                registry.add(&entry("a", &[])),
                Err(ReplError::AgreementExists { .. })
            ));
            let mut elsewhere = entry("c", &[]);
            elsewhere.attrs[1].1 = vec!["dc=nowhere".to_string()];
            assert!(matches!(registry.add(&elsewhere), Err(ReplError::ReplicaUnknown { .. })));
            registry.shutdown().await;
        }

        #[tokio::test(start_paused = true)]
        async fn test_disable_stops_protocol() {
            let registry = registry();
            let a = dn("cn=a,cn=replica,cn=config");
            registry.add(&entry("a", &[])).unwrap();
            assert!(registry.protocol_state(&a).is_some());
            registry
                .modify(&a, &[Mod::replace(ATTR_ENABLED, ["off"])], false)
                .await
                .unwrap();
            assert!(registry.protocol_state(&a).is_none());
            assert!(registry.replicate_now(&a).is_err());
            registry
                .modify(&a, &[Mod::replace(ATTR_ENABLED, ["on"])], false)
                .await
                .unwrap();
            assert!(registry.protocol_state(&a).is_some());
            registry.delete(&a).await.unwrap();
            assert!(registry.get(&a).is_none());
        }

        #[tokio::test(start_paused = true)]
        async fn test_disabled_at_add_has_no_protocol() {
            let registry = registry();
            let a = dn("cn=a,cn=replica,cn=config");
            registry.add(&entry("a", &[(ATTR_ENABLED, "off")])).unwrap();
            assert!(registry.protocol_state(&a).is_none());
            registry.shutdown().await;
        }
    }

    mod modify {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_denied_fractional_refuses_whole_change() {
            let registry = registry();
            let a = dn("cn=a,cn=replica,cn=config");
            registry.add(&entry("a", &[])).unwrap();
            let err = registry
                .modify(
                    &a,
                    &[
                        Mod::replace(ATTR_PORT, ["636"]),
                        Mod::replace(ATTR_FRACTIONAL_LIST, ["(objectclass=*) $ EXCLUDE cn"]),
                    ],
                    false,
                )
                .await
                .unwrap_err();
            assert_eq!(err.result_code(), LdapResultCode::UnwillingToPerform);
            assert_eq!(registry.get(&a).unwrap().settings().port, 389);
            registry.shutdown().await;
        }

        #[tokio::test(start_paused = true)]
        async fn test_initialize_attribute_is_a_command() {
            let registry = registry();
            let a = dn("cn=a,cn=replica,cn=config");
            registry.add(&entry("a", &[])).unwrap();
            let err = registry
                .modify(&a, &[Mod::delete(ATTR_INITIALIZE, Vec::<String>::new())], false)
                .await
                .unwrap_err();
            assert_eq!(err.result_code(), LdapResultCode::UnwillingToPerform);
            registry
                .modify(&a, &[Mod::delete(ATTR_INITIALIZE, Vec::<String>::new())], true)
                .await
                .unwrap();
            assert!(registry
                .modify(&a, &[Mod::replace(ATTR_INITIALIZE, ["bogus"])], false)
                .await
                .is_err());
            registry
                .modify(&a, &[Mod::replace(ATTR_INITIALIZE, ["cancel"])], false)
                .await
                .unwrap();
            let status = registry.get(&a).unwrap().init_status();
            assert_eq!(status.message, "Total update marked done");
            registry.shutdown().await;
        }

        #[tokio::test(start_paused = true)]
        async fn test_schedule_values_merge() {
            let registry = registry();
            let a = dn("cn=a,cn=replica,cn=config");
            registry.add(&entry("a", &[])).unwrap();
            let effects = registry
                .modify(
                    &a,
                    &[
                        Mod::add(ATTR_UPDATE_SCHEDULE, ["0800-1200 12345"]),
                        Mod::add(ATTR_UPDATE_SCHEDULE, ["1300-1700 12345"]),
                    ],
                    false,
                )
                .await
                .unwrap();
            assert!(effects.contains(&SettingEffect::Schedule));
            assert_eq!(registry.get(&a).unwrap().settings().schedule.to_values().len(), 2);
            registry
                .modify(&a, &[Mod::delete(ATTR_UPDATE_SCHEDULE, ["0800-1200 12345"])], false)
                .await
                .unwrap();
            assert_eq!(
                registry.get(&a).unwrap().settings().schedule.to_values(),
                ["1300-1700 12345"]
            );
            registry.shutdown().await;
        }

        #[tokio::test(start_paused = true)]
        async fn test_naming_attrs_refused() {
            let registry = registry();
            let a = dn("cn=a,cn=replica,cn=config");
            registry.add(&entry("a", &[])).unwrap();
            assert!(registry
                .modify(&a, &[Mod::replace(ATTR_REPLICA_ROOT, ["dc=other"])], false)
                .await
                .is_err());
            assert!(matches!(
                registry.modify(&dn("cn=zz,cn=config"), &[], false).await,
                Err(ReplError::AgreementUnknown { .. })
            ));
            registry.shutdown().await;
        }
    }
}
