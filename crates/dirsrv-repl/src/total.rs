//! Total update: stream every entry of the replica to the consumer.

use crate::entry::Entry;
use crate::fractional::FractionalList;
use crate::ldap::{ExtendedRequest, LdapResultCode};
use crate::protocol::{ProtocolGeneration, Session, SessionFailure};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Drop attributes the agreement never sends.
pub(crate) fn strip_excluded(mut entry: Entry, list: &FractionalList) -> Entry {
    for attr in list.excluded() {
        entry.remove_attr(attr);
    }
    entry
}

fn accept(code: LdapResultCode) -> bool {
    code == LdapResultCode::Success
}

impl Session<'_> {
    /// Send every entry, parents first. Returns the number sent.
    pub async fn send_total(
        &self,
        generation: ProtocolGeneration,
        cancel: &CancellationToken,
    ) -> Result<u64, SessionFailure> {
        let settings = self.agreement.settings();
        let list = settings.fractional.total_list();
        let window = if generation.pipelined() {
            settings.flow_window.max(1)
        } else {
            1
        };
        let entries = self.replica.total_entries()?;
        let total = entries.len();
        debug!(agreement = %self.agreement.name(), entries = total, "sending total update");
        let mut outstanding = 0usize;
        let mut sent = 0u64;
        for entry in entries {
            if cancel.is_cancelled() {
                return Err(SessionFailure::Stopped);
            }
            let request = ExtendedRequest::ReplicationEntry {
                entry: strip_excluded(entry, list),
            };
            self.conn.send_extended(generation.entry_oid(), request).await?;
            outstanding += 1;
            sent += 1;
            self.drain_results(&mut outstanding, window - 1, accept).await?;
            if sent % 1000 == 0 {
                info!(agreement = %self.agreement.name(), sent, total, "total update progress");
            }
        }
        self.drain_results(&mut outstanding, 0, accept).await?;
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dn::Dn;
    use crate::entry::UniqueId;

    #[test]
    fn test_strip_excluded() {
        let mut entry = Entry::new(Dn::parse("cn=a,dc=example").unwrap(), UniqueId::new("a"));
        entry.add_values("cn", vec!["a".to_string()], None);
        entry.add_values("userpassword", vec!["secret".to_string()], None);
        let list = FractionalList::parse("nsds5replicatedattributelist", "(objectclass=*) $ EXCLUDE userpassword").unwrap();
        let stripped = strip_excluded(entry, &list);
        assert!(stripped.has_attr("cn"));
        assert!(!stripped.has_attr("userpassword"));
    }
}
