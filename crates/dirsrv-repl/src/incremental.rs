//! Incremental update: replay changelog records the consumer lacks.

use crate::changelog::Changelog;
use crate::error::ReplError;
use crate::ldap::LdapResultCode;
use crate::protocol::{ProtocolGeneration, Session, SessionFailure};
use crate::ruv::Ruv;
use tracing::{debug, info};

/// Result of one incremental session.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct IncrementalOutcome {
    /// Operations sent.
    pub sent: u64,
    /// The session limit cut the replay short.
    pub more: bool,
    /// Consumer RUV after the replay.
    pub consumer_ruv: Ruv,
}

/// Why the consumer can only be brought up to date by a total update, if it
/// can't be updated incrementally.
pub(crate) fn needs_total(changelog: &Changelog, supplier: &Ruv, consumer: &Ruv) -> Result<Option<String>, ReplError> {
    if let (Some(ours), theirs) = (supplier.generation(), consumer.generation()) {
        if theirs != Some(ours) {
            return Ok(Some(format!(
                "consumer database generation {} differs from {ours}",
                theirs.unwrap_or("(none)")
            )));
        }
    }
    if changelog.is_below_purge_point(consumer)? {
        return Ok(Some("consumer is missing changes already purged from the changelog".to_string()));
    }
    Ok(None)
}

fn accept(code: LdapResultCode) -> bool {
    code.is_ignorable_for_replay()
}

impl Session<'_> {
    /// Replay changes the consumer lacks, at most the agreement's session
    /// limit, pipelined up to its flow window when the generation allows.
    pub async fn send_updates(
        &self,
        generation: ProtocolGeneration,
        consumer_ruv: Ruv,
        supplier_ruv: &Ruv,
    ) -> Result<IncrementalOutcome, SessionFailure> {
        let changelog = self.replica.changelog();
        if let Some(reason) = needs_total(changelog, supplier_ruv, &consumer_ruv)? {
            return Err(SessionFailure::NeedsTotal(reason));
        }
        let settings = self.agreement.settings();
        let limit = settings.session_limit.max(1);
        let window = if generation.pipelined() {
            settings.flow_window.max(1)
        } else {
            1
        };
        let mut changes = changelog.changes_since(&consumer_ruv, limit + 1)?;
        let more = changes.len() > limit;
        changes.truncate(limit);

        let mut working = consumer_ruv;
        let mut outstanding = 0usize;
        let mut sent = 0u64;
        for change in &changes {
            if self.stop.is_cancelled() {
                return Err(SessionFailure::Stopped);
            }
            let Some(filtered) = settings.fractional.filter_op(change) else {
                debug!(agreement = %self.agreement.name(), csn = %change.csn, "change filtered out");
                continue;
            };
            self.conn.send(filtered.to_request()).await?;
            outstanding += 1;
            sent += 1;
            self.drain_results(&mut outstanding, window - 1, accept).await?;
            working.update(change.csn);
        }
        self.drain_results(&mut outstanding, 0, accept).await?;
        if sent > 0 {
            info!(agreement = %self.agreement.name(), sent, more, "incremental update sent");
        }
        Ok(IncrementalOutcome {
            sent,
            more,
            consumer_ruv: working,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanallruv::CleanedRids;
    use crate::csn::Csn;
    use crate::dn::Dn;
    use crate::entry::UniqueId;
    use crate::op::{DeleteOp, Operation, ReplicatedOp};
    use std::sync::Arc;

    fn delete(csn: Csn) -> ReplicatedOp {
        ReplicatedOp::new(
            csn,
            Operation::Delete(DeleteOp {
                dn: Dn::parse("cn=a,dc=example").unwrap(),
                uniqueid: UniqueId::new("a"),
            }),
        )
    }

    fn ruv(generation: &str, csns: &[Csn]) -> Ruv {
        let mut ruv = Ruv::with_generation(generation);
        for csn in csns {
            ruv.update(*csn);
        }
        ruv
    }

    #[test]
    fn test_generation_mismatch_needs_total() {
        let changelog = Changelog::new(Arc::new(CleanedRids::new()));
        let supplier = ruv("gen-a", &[]);
        assert!(needs_total(&changelog, &supplier, &ruv("gen-b", &[])).unwrap().is_some());
        assert!(needs_total(&changelog, &supplier, &Ruv::new()).unwrap().is_some());
        assert!(needs_total(&changelog, &supplier, &ruv("gen-a", &[])).unwrap().is_none());
    }

    #[test]
    fn test_purged_changes_need_total() {
        let changelog = Changelog::new(Arc::new(CleanedRids::new()));
        let old = Csn::new(100, 0, 1, 0);
        let new = Csn::new(200, 0, 1, 0);
        changelog.append(&delete(old)).unwrap();
        changelog.append(&delete(new)).unwrap();
        changelog.trim_before(&new).unwrap();
        let supplier = ruv("g", &[new]);
        assert!(needs_total(&changelog, &supplier, &ruv("g", &[])).unwrap().is_some());
        assert!(needs_total(&changelog, &supplier, &ruv("g", &[old])).unwrap().is_none());
    }
}
