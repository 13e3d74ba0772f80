#![warn(missing_docs)]

//! Directory server replication subsystem: multi-master LDAP replication,
//! URP conflict resolution, CleanAllRUV replica-id retirement

pub mod agreement;
pub mod agreement_registry;
pub mod backoff;
pub mod changelog;
pub mod cleanallruv;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod csn;
pub mod dn;
pub mod engine;
pub mod entry;
pub mod error;
pub mod event_queue;
pub mod fractional;
pub mod incremental;
pub mod ldap;
pub mod loopback;
pub mod op;
pub mod protocol;
pub mod replica;
pub mod replica_registry;
pub mod ruv;
pub mod schedule;
pub mod store;
pub mod total;
pub mod urp;
pub mod urp_fixup;
