//! Send-time correlation records.
//!
//! The send worker records an entry per transmitted probe; the receive
//! worker claims it when the matching reply arrives, which both yields the
//! TTL and send instant for RTT and guarantees at most one observation per
//! probe. Entries for probes that never get a reply are dropped with the
//! table at session teardown; the table is bounded by outstanding probes.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Instant;

/// Correlation key: the ICMP identifier and sequence of a probe.
pub type ProbeKey = (u16, u16);

/// What was known about a probe at send time.
#[derive(Debug, Clone, Copy)]
pub struct SentProbe {
    pub ttl: u8,
    pub at: Instant,
}

/// Thread-safe map of in-flight probes keyed by (id, seq).
///
/// Private to one session's socket workers, so two concurrent sessions that
/// collide on identifiers cannot claim each other's probes: replies the
/// kernel fans out to every raw-socket listener only match entries this
/// table inserted.
#[derive(Debug, Default)]
pub struct SentTable {
    inner: RwLock<HashMap<ProbeKey, SentProbe>>,
}

impl SentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successfully transmitted probe.
    pub fn record(&self, id: u16, seq: u16, ttl: u8) {
        self.inner.write().insert(
            (id, seq),
            SentProbe {
                ttl,
                at: Instant::now(),
            },
        );
    }

    /// Claim the entry for a reply, removing it so a duplicate reply
    /// cannot match twice.
    pub fn claim(&self, id: u16, seq: u16) -> Option<SentProbe> {
        self.inner.write().remove(&(id, seq))
    }

    /// Number of probes still awaiting a reply.
    pub fn outstanding(&self) -> usize {
        self.inner.read().len()
    }
}
