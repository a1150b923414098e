//! Integration tests for the codec→correlation→dispatch pipeline
//!
//! These tests drive the public building blocks against a scripted link,
//! without requiring raw socket privileges or network access.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use echotrace::observation::Observation;
use echotrace::probe::{Decoded, build_echo_request, decode, decode_datagram};
use echotrace::trace::{EngineState, ProbeEngine, SentTable};
use echotrace::{Mode, ObservationKind};

/// Compute and set the ICMP checksum on a raw message.
fn set_icmp_checksum(icmp_data: &mut [u8]) {
    icmp_data[2] = 0;
    icmp_data[3] = 0;

    let mut sum: u32 = 0;
    let mut i = 0;
    while i + 1 < icmp_data.len() {
        sum += u16::from_be_bytes([icmp_data[i], icmp_data[i + 1]]) as u32;
        i += 2;
    }
    if i < icmp_data.len() {
        sum += (icmp_data[i] as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    let checksum = !sum as u16;
    icmp_data[2] = (checksum >> 8) as u8;
    icmp_data[3] = (checksum & 0xFF) as u8;
}

/// The Echo Reply a target would produce for one of our requests.
fn echo_reply_for(request: &[u8]) -> Vec<u8> {
    let mut reply = request.to_vec();
    reply[0] = 0;
    set_icmp_checksum(&mut reply);
    reply
}

/// The Time Exceeded message a router would produce: error header, quoted
/// IPv4 header, quoted echo request.
fn time_exceeded_for(request: &[u8]) -> Vec<u8> {
    let mut packet = vec![0u8; 8 + 20 + request.len()];
    packet[0] = 11;
    packet[8] = 0x45;
    packet[17] = 1; // quoted protocol: ICMP
    packet[28..].copy_from_slice(request);
    set_icmp_checksum(&mut packet);
    packet
}

#[test]
fn test_codec_roundtrip_all_extremes() {
    for id in [0u16, 1, 0x8000, u16::MAX] {
        for seq in [0u16, 7, 0x00FF, u16::MAX] {
            let request = build_echo_request(id, seq);
            let reply = echo_reply_for(&request);
            assert_eq!(decode(&reply), Ok(Decoded::EchoReply { id, seq }));
        }
    }
}

#[test]
fn test_codec_time_exceeded_roundtrip() {
    let request = build_echo_request(0x4242, 3);
    let wrapped = time_exceeded_for(&request);

    assert_eq!(
        decode(&wrapped),
        Ok(Decoded::TimeExceeded { id: 0x4242, seq: 3 })
    );
}

#[test]
fn test_codec_datagram_with_outer_header() {
    let request = build_echo_request(77, 1);
    let reply = echo_reply_for(&request);

    let mut datagram = vec![0u8; 20 + reply.len()];
    datagram[0] = 0x45;
    datagram[9] = 1;
    datagram[20..].copy_from_slice(&reply);

    assert_eq!(
        decode_datagram(&datagram),
        Ok(Decoded::EchoReply { id: 77, seq: 1 })
    );
}

#[test]
fn test_correlation_tables_are_private_per_session() {
    // Two overlapping sessions may collide on identifiers; replies only
    // match the table that recorded the probe.
    let session_a = SentTable::new();
    let session_b = SentTable::new();

    session_a.record(4000, 0, 1);
    session_a.record(4000, 1, 1);
    session_b.record(4000, 0, 5);

    assert!(session_b.claim(4000, 1).is_none());
    assert_eq!(session_a.claim(4000, 1).map(|p| p.ttl), Some(1));
    assert_eq!(session_b.claim(4000, 0).map(|p| p.ttl), Some(5));
    assert!(session_b.claim(4000, 0).is_none());
}

fn target() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9))
}

/// Scripted stand-in for the socket workers.
fn spawn_mock_link(
    mut probe_rx: mpsc::Receiver<Observation>,
    reply_tx: mpsc::Sender<Observation>,
    script: impl Fn(u8, u16) -> Option<(IpAddr, Duration)> + Send + 'static,
) {
    tokio::spawn(async move {
        while let Some(probe) = probe_rx.recv().await {
            if let Some((from, delay)) = script(probe.ttl, probe.seq) {
                let reply_tx = reply_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let rtt = delay.max(Duration::from_millis(1));
                    let reply = Observation::reply(
                        probe.ttl,
                        probe.id,
                        probe.seq,
                        from,
                        from.to_string(),
                        rtt,
                    );
                    let _ = reply_tx.send(reply).await;
                });
            }
        }
    });
}

fn run_scripted_engine(
    mode: Mode,
    max_ttl: u8,
    count: u16,
    script: impl Fn(u8, u16) -> Option<(IpAddr, Duration)> + Send + 'static,
) -> (
    impl std::future::Future<Output = ()>,
    Arc<EngineState>,
    Arc<Mutex<Vec<Observation>>>,
) {
    let state = Arc::new(EngineState::new(max_ttl));
    let (probe_tx, probe_rx) = mpsc::channel(1);
    let (reply_tx, reply_rx) = mpsc::channel(1);
    spawn_mock_link(probe_rx, reply_tx, script);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let engine = ProbeEngine::new(
        mode,
        target(),
        count,
        Duration::from_millis(500),
        probe_tx,
        reply_rx,
        Arc::clone(&state),
    )
    .with_handler(Box::new(move |observation| sink.lock().push(observation)));

    (engine.run(), state, seen)
}

#[tokio::test(start_paused = true)]
async fn test_each_row_delivers_count_observations() {
    // Hops 1 and 2 answer, hop 3 is silent: every row still reports
    // exactly `count` observations, timeouts included.
    let (run, _state, seen) = run_scripted_engine(Mode::Traceroute, 3, 2, |ttl, _| match ttl {
        1 => Some((IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), Duration::from_millis(8))),
        2 => Some((IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), Duration::from_millis(12))),
        _ => None,
    });
    run.await;

    let seen = seen.lock();
    let mut per_row: HashMap<u8, usize> = HashMap::new();
    for observation in seen.iter() {
        *per_row.entry(observation.ttl).or_default() += 1;
    }

    assert_eq!(per_row.get(&1), Some(&2));
    assert_eq!(per_row.get(&2), Some(&2));
    assert_eq!(per_row.get(&3), Some(&2));
    assert!(seen.iter().filter(|o| o.ttl == 3).all(Observation::is_timeout));
    assert!(seen.iter().filter(|o| o.ttl != 3).all(Observation::is_reply));
}

#[tokio::test(start_paused = true)]
async fn test_reply_rtt_bounded_by_deadline() {
    let (run, _state, seen) = run_scripted_engine(Mode::Ping, 1, 4, |_, seq| {
        Some((target(), Duration::from_millis(5 * (seq as u64 + 1))))
    });
    run.await;

    let seen = seen.lock();
    assert_eq!(seen.len(), 4);
    for observation in seen.iter() {
        assert_eq!(observation.kind, ObservationKind::Reply);
        assert!(observation.rtt >= Duration::from_millis(1));
        assert!(observation.rtt <= Duration::from_millis(500));
    }
}

#[tokio::test(start_paused = true)]
async fn test_traceroute_single_row_matches_ping_shape() {
    // maxTTL=1, count=1 traceroute produces the same output shape as ping
    // with count=1; only the reported TTL differs (wire TTL 1 vs default 0).
    let script = |_: u8, _: u16| Some((target(), Duration::from_millis(10)));

    let (run, _, trace_seen) = run_scripted_engine(Mode::Traceroute, 1, 1, script);
    run.await;
    let (run, _, ping_seen) = run_scripted_engine(Mode::Ping, 1, 1, script);
    run.await;

    let trace_seen = trace_seen.lock();
    let ping_seen = ping_seen.lock();
    assert_eq!(trace_seen.len(), 1);
    assert_eq!(ping_seen.len(), 1);

    let (t, p) = (&trace_seen[0], &ping_seen[0]);
    assert_eq!(t.kind, p.kind);
    assert_eq!(t.seq, p.seq);
    assert_eq!(t.ip4, p.ip4);
    assert_eq!(t.rtt, p.rtt);
    assert_eq!(t.ttl, 1);
    assert_eq!(p.ttl, 0);
}

#[tokio::test(start_paused = true)]
async fn test_rows_beyond_terminal_never_run() {
    let (run, state, seen) = run_scripted_engine(Mode::Traceroute, 8, 1, |ttl, _| match ttl {
        1 => Some((IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), Duration::from_millis(5))),
        2 => Some((target(), Duration::from_millis(5))),
        _ => Some((IpAddr::V4(Ipv4Addr::new(10, 0, 0, 99)), Duration::from_millis(5))),
    });
    run.await;

    assert_eq!(state.max_hop(), 2);
    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|o| o.ttl <= 2));
}
