//! Change Sequence Numbers and the per-replica CSN generator.
//!
//! A CSN orders every write in the topology: timestamp first, then sequence
//! number, then replica id, then sub-sequence. The ordering is the single
//! source of truth for which of two conflicting writes wins.

use crate::error::ReplError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Replica identifier carried in every CSN.
pub type ReplicaId = u16;

/// Replica id used by read-only (dedicated consumer) replicas.
pub const READ_ONLY_REPLICA_ID: ReplicaId = 0;
/// Reserved replica id, never assigned.
pub const RESERVED_REPLICA_ID: ReplicaId = 65535;
/// Highest replica id a writable replica may use.
pub const MAX_WRITABLE_REPLICA_ID: ReplicaId = 65534;
/// Default tolerated clock skew between replicas, in seconds.
pub const DEFAULT_MAX_CLOCK_SKEW_SECS: u32 = 24 * 60 * 60;

/// A Change Sequence Number.
///
/// Field order matters: the derived `Ord` compares timestamp, sequence
/// number, replica id and sub-sequence number in that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Csn {
    timestamp: u32,
    seqnum: u16,
    rid: ReplicaId,
    subseqnum: u16,
}

impl Csn {
    /// Build a CSN from its parts.
    pub const fn new(timestamp: u32, seqnum: u16, rid: ReplicaId, subseqnum: u16) -> Self {
        Self {
            timestamp,
            seqnum,
            rid,
            subseqnum,
        }
    }

    /// Seconds since the epoch.
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Tie-break within one second.
    pub fn seqnum(&self) -> u16 {
        self.seqnum
    }

    /// Originating replica.
    pub fn rid(&self) -> ReplicaId {
        self.rid
    }

    /// Tie-break for operations split into several changes.
    pub fn subseqnum(&self) -> u16 {
        self.subseqnum
    }

    /// Same CSN with a different sub-sequence number.
    pub fn with_subseqnum(&self, subseqnum: u16) -> Self {
        Self { subseqnum, ..*self }
    }
}

impl fmt::Display for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}{:04x}{:04x}{:04x}",
            self.timestamp, self.seqnum, self.rid, self.subseqnum
        )
    }
}

impl FromStr for Csn {
    type Err = ReplError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ReplError::InvalidCsn { csn: s.to_string() };
        if s.len() != 20 || !s.is_ascii() {
            return Err(invalid());
        }
        let timestamp = u32::from_str_radix(&s[0..8], 16).map_err(|_| invalid())?;
        let seqnum = u16::from_str_radix(&s[8..12], 16).map_err(|_| invalid())?;
        let rid = u16::from_str_radix(&s[12..16], 16).map_err(|_| invalid())?;
        let subseqnum = u16::from_str_radix(&s[16..20], 16).map_err(|_| invalid())?;
        Ok(Self::new(timestamp, seqnum, rid, subseqnum))
    }
}

#[derive(Debug, Default)]
struct GeneratorState {
    last: Option<(u32, u16)>,
    remote_offset: u32,
}

/// Generates monotonically increasing CSNs for one replica id.
#[derive(Debug)]
pub struct CsnGenerator {
    rid: ReplicaId,
    max_skew: u32,
    state: Mutex<GeneratorState>,
}

impl CsnGenerator {
    /// Create a generator bound to `rid`.
    pub fn new(rid: ReplicaId) -> Self {
        Self::with_max_skew(rid, DEFAULT_MAX_CLOCK_SKEW_SECS)
    }

    /// Create a generator with a custom skew limit.
    pub fn with_max_skew(rid: ReplicaId, max_skew: u32) -> Self {
        Self {
            rid,
            max_skew,
            state: Mutex::new(GeneratorState::default()),
        }
    }

    /// The replica id this generator stamps.
    pub fn rid(&self) -> ReplicaId {
        self.rid
    }

    /// Next CSN using the system clock.
    pub fn new_csn(&self) -> Result<Csn, ReplError> {
        self.new_csn_at(now_secs())
    }

    /// Next CSN as if the local clock read `now` seconds.
    pub fn new_csn_at(&self, now: u32) -> Result<Csn, ReplError> {
        let mut state = self.state.lock().map_err(|_| ReplError::poisoned("csn generator"))?;
        let adjusted = now.saturating_add(state.remote_offset);
        let (timestamp, seqnum) = match state.last {
            None => (adjusted, 0),
            Some((last_ts, _)) if adjusted > last_ts => (adjusted, 0),
            Some((last_ts, last_seq)) => match last_seq.checked_add(1) {
                Some(seq) => (last_ts, seq),
                None => (last_ts.saturating_add(1), 0),
            },
        };
        state.last = Some((timestamp, seqnum));
        Ok(Csn::new(timestamp, seqnum, self.rid, 0))
    }

    /// Move the generator forward so later CSNs order after `remote`.
    pub fn adjust_time(&self, remote: &Csn) -> Result<(), ReplError> {
        self.adjust_time_at(remote, now_secs())
    }

    /// [`Self::adjust_time`] against a given local clock reading.
    pub fn adjust_time_at(&self, remote: &Csn, now: u32) -> Result<(), ReplError> {
        let mut state = self.state.lock().map_err(|_| ReplError::poisoned("csn generator"))?;
        let local = now.saturating_add(state.remote_offset);
        if remote.timestamp() > local {
            let skew = remote.timestamp() - now;
            if skew > self.max_skew {
                return Err(ReplError::ClockSkew {
                    skew_secs: u64::from(skew),
                    max_secs: u64::from(self.max_skew),
                });
            }
            state.remote_offset = skew;
        }
        let remote_pos = (remote.timestamp(), remote.seqnum());
        if state.last.map_or(true, |last| last < remote_pos) {
            state.last = Some(remote_pos);
        }
        Ok(())
    }
}

/// Current wall clock in seconds since the epoch.
pub fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    mod ordering {
        use super::*;

        #[test]
        fn test_timestamp_dominates() {
            assert!(Csn::new(1, 9, 9, 9) < Csn::new(2, 0, 0, 0));
        }

        #[test]
        fn test_seqnum_before_rid() {
            assert!(Csn::new(5, 1, 9, 0) < Csn::new(5, 2, 1, 0));
        }

        #[test]
        fn test_lower_rid_wins_tie() {
            let a = Csn::new(100, 0, 1, 0);
            let b = Csn::new(100, 0, 2, 0);
            assert!(a < b);
        }

        #[test]
        fn test_subseqnum_last() {
            let a = Csn::new(100, 0, 1, 0);
            assert!(a < a.with_subseqnum(1));
        }
    }

    mod text_form {
        use super::*;

        #[test]
        fn test_display_format() {
            let csn = Csn::new(0x5f3e_1a2b, 1, 3, 0);
            assert_eq!(csn.to_string(), "5f3e1a2b000100030000");
        }

        #[test]
        fn test_parse_display() {
            let csn = Csn::new(1234567, 42, 7, 2);
            let parsed: Csn = csn.to_string().parse().unwrap();
            assert_eq!(parsed, csn);
        }

        #[test]
        fn test_parse_rejects_bad_input() {
            assert!("xyz".parse::<Csn>().is_err());
            assert!("zzzzzzzz000100030000".parse::<Csn>().is_err());
        }
    }

    mod generator {
        use super::*;

        #[test]
        fn test_same_second_increments_seq() {
            let gen = CsnGenerator::new(3);
            let a = gen.new_csn_at(100).unwrap();
            let b = gen.new_csn_at(100).unwrap();
            assert_eq!(a, Csn::new(100, 0, 3, 0));
            assert_eq!(b, Csn::new(100, 1, 3, 0));
        }

        #[test]
        fn test_clock_going_backwards_stays_monotonic() {
            let gen = CsnGenerator::new(1);
            let a = gen.new_csn_at(200).unwrap();
            let b = gen.new_csn_at(150).unwrap();
            assert!(b > a);
        }

        #[test]
        fn test_new_second_resets_seq() {
            let gen = CsnGenerator::new(1);
            gen.new_csn_at(10).unwrap();
            gen.new_csn_at(10).unwrap();
            assert_eq!(gen.new_csn_at(11).unwrap().seqnum(), 0);
        }

        #[test]
        fn test_adjust_time_orders_after_remote() {
            let gen = CsnGenerator::new(1);
            let remote = Csn::new(1_000, 5, 2, 0);
            gen.adjust_time_at(&remote, 900).unwrap();
            let next = gen.new_csn_at(900).unwrap();
            assert!(next > remote);
        }

        #[test]
        fn test_adjust_time_rejects_excessive_skew() {
            let gen = CsnGenerator::with_max_skew(1, 60);
            let remote = Csn::new(1_000, 0, 2, 0);
            let err = gen.adjust_time_at(&remote, 100).unwrap_err();
            assert!(matches!(err, ReplError::ClockSkew { skew_secs: 900, .. }));
        }

        #[test]
        fn test_remote_behind_changes_nothing() {
            let gen = CsnGenerator::new(1);
            gen.adjust_time_at(&Csn::new(10, 0, 2, 0), 500).unwrap();
            assert_eq!(gen.new_csn_at(500).unwrap(), Csn::new(500, 0, 1, 0));
        }
    }
}
