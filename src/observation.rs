use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use crate::config::duration_serde;

/// What a single observation reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObservationKind {
    /// An outgoing probe, as handed to the send worker. Not delivered to handlers.
    Request,
    /// A correlated response (Echo Reply or Time Exceeded) with a measured RTT.
    Reply,
    /// No response arrived within the read deadline.
    Timeout,
}

/// The unit of result flowing from the engine to the caller's handler.
///
/// Replies carry the responder address and an RTT of at least 1ms; timeouts
/// carry no address and a zero RTT, so the legacy field-value convention
/// holds even though `kind` makes the case explicit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub kind: ObservationKind,
    /// Wire TTL of the probe (0 in ping mode, meaning the OS default).
    pub ttl: u8,
    /// ICMP identifier of the probe's TTL row.
    pub id: u16,
    /// Sequence within the TTL row, starting at 0.
    pub seq: u16,
    /// Responder address for replies, destination for requests, None on timeout.
    pub addr: Option<IpAddr>,
    /// String form of `addr`; empty on timeout.
    pub ip4: String,
    /// Round-trip time; zero unless this is a reply.
    #[serde(with = "duration_serde")]
    pub rtt: Duration,
}

impl Observation {
    /// An outgoing probe descriptor for the send worker.
    pub fn request(ttl: u8, id: u16, seq: u16, addr: IpAddr, ip4: impl Into<String>) -> Self {
        Self {
            kind: ObservationKind::Request,
            ttl,
            id,
            seq,
            addr: Some(addr),
            ip4: ip4.into(),
            rtt: Duration::ZERO,
        }
    }

    /// A correlated response with its measured round-trip time.
    pub fn reply(
        ttl: u8,
        id: u16,
        seq: u16,
        addr: IpAddr,
        ip4: impl Into<String>,
        rtt: Duration,
    ) -> Self {
        Self {
            kind: ObservationKind::Reply,
            ttl,
            id,
            seq,
            addr: Some(addr),
            ip4: ip4.into(),
            rtt,
        }
    }

    /// A probe that went unanswered past its read deadline.
    pub fn timeout(ttl: u8, id: u16, seq: u16) -> Self {
        Self {
            kind: ObservationKind::Timeout,
            ttl,
            id,
            seq,
            addr: None,
            ip4: String::new(),
            rtt: Duration::ZERO,
        }
    }

    pub fn is_reply(&self) -> bool {
        self.kind == ObservationKind::Reply
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ObservationKind::Timeout
    }
}

impl fmt::Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TTL: {}, ID: {}, Seq: {}, Addr: {}, Ip4: {}, Rtt: {:?}",
            self.ttl,
            self.id,
            self.seq,
            self.addr.map_or_else(|| "<none>".to_string(), |a| a.to_string()),
            self.ip4,
            self.rtt,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_request_fields() {
        let addr = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));
        let obs = Observation::request(64, 1, 1, addr, "8.8.8.8");

        assert_eq!(obs.kind, ObservationKind::Request);
        assert_eq!(obs.ttl, 64);
        assert_eq!(obs.id, 1);
        assert_eq!(obs.seq, 1);
        assert_eq!(obs.addr, Some(addr));
        assert_eq!(obs.ip4, "8.8.8.8");
        assert_eq!(obs.rtt, Duration::ZERO);
    }

    #[test]
    fn test_reply_fields() {
        let addr = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));
        let rtt = Duration::from_millis(50);
        let obs = Observation::reply(64, 1, 1, addr, "8.8.8.8", rtt);

        assert!(obs.is_reply());
        assert!(!obs.is_timeout());
        assert_eq!(obs.rtt, rtt);
        assert_eq!(obs.addr, Some(addr));
    }

    #[test]
    fn test_timeout_fields() {
        let obs = Observation::timeout(5, 1234, 2);

        assert!(obs.is_timeout());
        assert_eq!(obs.ttl, 5);
        assert_eq!(obs.id, 1234);
        assert_eq!(obs.seq, 2);
        assert_eq!(obs.addr, None);
        assert_eq!(obs.ip4, "");
        assert_eq!(obs.rtt, Duration::ZERO);
    }

    #[test]
    fn test_display_format() {
        let addr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let obs = Observation::reply(3, 7, 0, addr, "10.0.0.1", Duration::from_millis(12));
        let text = obs.to_string();

        assert!(text.contains("TTL: 3"));
        assert!(text.contains("ID: 7"));
        assert!(text.contains("Ip4: 10.0.0.1"));
    }

    #[test]
    fn test_serialization_roundtrip() {
        let addr = IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9));
        let obs = Observation::reply(2, 40000, 65535, addr, "9.9.9.9", Duration::from_millis(7));

        let json = serde_json::to_string(&obs).expect("serialize");
        let loaded: Observation = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(loaded, obs);
    }
}
