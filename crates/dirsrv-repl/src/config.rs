//! Service configuration file.

use crate::agreement::{Agreement, AgreementSettings};
use crate::agreement_registry::{ConfigEntry, ATTR_REPLICA_ROOT, OC_AGREEMENT};
use crate::cleanallruv::CleanAllRuvConfig;
use crate::csn::{ReplicaId, DEFAULT_MAX_CLOCK_SKEW_SECS};
use crate::dn::Dn;
use crate::engine::EngineConfig;
use crate::entry::ATTR_OBJECTCLASS;
use crate::error::ReplError;
use crate::ldap::LdapResultCode;
use crate::protocol::ProtocolGeneration;
use crate::replica::{ReplicaSettings, ReplicaType, DEFAULT_PURGE_DELAY};
use crate::urp::UrpConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// One replicated subtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Registry name.
    pub name: String,
    /// Root DN of the subtree.
    pub root: String,
    /// Replica id; 0 for a read-only consumer.
    pub rid: ReplicaId,
    /// `supplier` or `consumer`.
    #[serde(default)]
    pub replica_type: ReplicaType,
    /// Identities allowed to send replicated updates.
    #[serde(default)]
    pub update_dns: Vec<String>,
    /// Tombstone and changelog retention.
    #[serde(default = "default_purge_delay_secs")]
    pub purge_delay_secs: u64,
    /// Tolerated supplier clock skew.
    #[serde(default = "default_max_clock_skew_secs")]
    pub max_clock_skew_secs: u32,
}

fn default_purge_delay_secs() -> u64 {
    DEFAULT_PURGE_DELAY.as_secs()
}

fn default_max_clock_skew_secs() -> u32 {
    DEFAULT_MAX_CLOCK_SKEW_SECS
}

/// One replication agreement, as its configuration entry's attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgreementConfig {
    /// DN of the agreement entry.
    pub dn: String,
    /// Root of the replica it replicates.
    pub root: String,
    /// Agreement attributes, e.g. `nsds5replicahost`.
    #[serde(default)]
    pub attrs: BTreeMap<String, Vec<String>>,
}

impl AgreementConfig {
    /// The configuration entry the agreement registry consumes.
    pub fn to_entry(&self) -> Result<ConfigEntry, ReplError> {
        let mut attrs = vec![
            (ATTR_OBJECTCLASS.to_string(), vec![OC_AGREEMENT.to_string()]),
            (ATTR_REPLICA_ROOT.to_string(), vec![self.root.clone()]),
        ];
        attrs.extend(self.attrs.iter().map(|(k, v)| (k.to_ascii_lowercase(), v.clone())));
        Ok(ConfigEntry {
            dn: Dn::parse(&self.dn)?,
            attrs,
        })
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplConfig {
    /// `tracing` filter directive, used when `RUST_LOG` is unset.
    pub log_filter: String,
    /// Host this server answers to on the loopback network.
    pub host: String,
    /// Port this server answers to on the loopback network.
    pub port: u16,
    /// Seconds an idle supplier connection stays open.
    pub linger_secs: u64,
    /// Newest protocol generation offered to suppliers.
    pub generation: ProtocolGeneration,
    /// URP tunables.
    pub urp: UrpConfig,
    /// CleanAllRUV tuning.
    pub cleanallruv: CleanAllRuvConfig,
    /// Replicas to configure.
    pub replicas: Vec<ReplicaConfig>,
    /// Agreements to configure.
    pub agreements: Vec<AgreementConfig>,
}

impl Default for ReplConfig {
    fn default() -> Self {
        Self {
            log_filter: "info".to_string(),
            host: "localhost".to_string(),
            port: 389,
            linger_secs: crate::connection::DEFAULT_LINGER.as_secs(),
            generation: ProtocolGeneration::Ds90,
            urp: UrpConfig::default(),
            cleanallruv: CleanAllRuvConfig::default(),
            replicas: Vec::new(),
            agreements: Vec::new(),
        }
    }
}

/// Configuration in the shapes the engine takes.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    /// Engine settings.
    pub engine: EngineConfig,
    /// Replica settings, in file order.
    pub replicas: Vec<ReplicaSettings>,
    /// Agreement entries, in file order.
    pub agreements: Vec<ConfigEntry>,
}

impl ReplConfig {
    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Check every section and convert it. Errors carry the code the same
    /// change made online would get.
    pub fn validate(&self) -> Result<ValidatedConfig, ReplError> {
        let mut names = HashSet::new();
        let mut roots = HashSet::new();
        let mut replicas = Vec::with_capacity(self.replicas.len());
        for r in &self.replicas {
            let settings = ReplicaSettings {
                name: r.name.clone(),
                root: Dn::parse(&r.root)?,
                rid: r.rid,
                replica_type: r.replica_type,
                update_dns: r.update_dns.iter().map(|d| Dn::parse(d)).collect::<Result<_, _>>()?,
                purge_delay: Duration::from_secs(r.purge_delay_secs),
                max_clock_skew: r.max_clock_skew_secs,
            };
            settings.validate()?;
            if !names.insert(settings.name.clone()) {
                return Err(ReplError::ReplicaExists { name: r.name.clone() });
            }
            if !roots.insert(settings.root.normalized()) {
                return Err(ReplError::ReplicaExists { name: r.root.clone() });
            }
            replicas.push(settings);
        }

        let mut agreements = Vec::with_capacity(self.agreements.len());
        let mut dns = HashSet::new();
        for a in &self.agreements {
            let entry = a.to_entry()?;
            let root = Dn::parse(&a.root)?;
            if !roots.contains(&root.normalized()) {
                return Err(ReplError::ConfigRejected {
                    attr: ATTR_REPLICA_ROOT.to_string(),
                    code: LdapResultCode::UnwillingToPerform,
                    msg: format!("agreement {} replicates unknown root {}", a.dn, a.root),
                });
            }
            let mut settings = AgreementSettings::default();
            for (attr, values) in &a.attrs {
                if attr.eq_ignore_ascii_case(crate::agreement::ATTR_INITIALIZE) {
                    continue;
                }
                settings.apply(attr, values)?;
            }
            Agreement::new(entry.dn.clone(), root, settings)?;
            if !dns.insert(entry.dn.normalized()) {
                return Err(ReplError::AgreementExists { dn: a.dn.clone() });
            }
            agreements.push(entry);
        }

        Ok(ValidatedConfig {
            engine: EngineConfig {
                linger: Duration::from_secs(self.linger_secs),
                urp: self.urp.clone(),
                cleanallruv: self.cleanallruv.clone(),
                generation: self.generation,
            },
            replicas,
            agreements,
        })
    }
}
