//! The socket engine: one raw ICMP socket driven by a send worker and a
//! receive worker on dedicated OS threads.
//!
//! The send worker is the only code that touches TTL: the session has a
//! single sender, so setsockopt-then-send never interleaves with another
//! probe's TTL.

use socket2::Socket;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::observation::Observation;
use crate::probe::{
    RECV_BUFFER_SIZE, build_echo_request, decode_datagram, is_timeout, recv_icmp, send_icmp,
    set_ttl,
};
use crate::trace::pending::SentTable;

const MIN_RTT: Duration = Duration::from_millis(1);

/// Handles to a running pair of socket workers.
pub struct SocketLink {
    send_handle: JoinHandle<()>,
    recv_handle: JoinHandle<()>,
}

impl SocketLink {
    /// Spawn the send and receive workers and return immediately.
    ///
    /// The workers exit cooperatively: the sender when the probe queue
    /// closes or cancellation fires, the receiver at its next 10ms read
    /// deadline after cancellation. The receiver owns the reply queue and
    /// closes it on exit.
    pub fn start(
        socket: Socket,
        probe_rx: mpsc::Receiver<Observation>,
        reply_tx: mpsc::Sender<Observation>,
        table: Arc<SentTable>,
        cancel: CancellationToken,
    ) -> Self {
        let socket = Arc::new(socket);

        let send_handle = {
            let socket = Arc::clone(&socket);
            let table = Arc::clone(&table);
            let cancel = cancel.clone();
            std::thread::spawn(move || run_sender(&socket, probe_rx, &table, &cancel))
        };

        let recv_handle =
            std::thread::spawn(move || run_receiver(&socket, reply_tx, &table, &cancel));

        Self {
            send_handle,
            recv_handle,
        }
    }

    /// Wait for both workers to exit. Call after shutdown has been signaled.
    pub fn join(self) {
        let _ = self.send_handle.join();
        let _ = self.recv_handle.join();
    }
}

fn run_sender(
    socket: &Socket,
    mut probe_rx: mpsc::Receiver<Observation>,
    table: &SentTable,
    cancel: &CancellationToken,
) {
    trace!("send worker start");
    while let Some(probe) = probe_rx.blocking_recv() {
        if cancel.is_cancelled() {
            break;
        }
        let Some(dest) = probe.addr else {
            debug!(%probe, "probe without destination dropped");
            continue;
        };

        // TTL 0 means "leave the OS default" (ping mode)
        if probe.ttl > 0 {
            if let Err(err) = set_ttl(socket, probe.ttl) {
                debug!(ttl = probe.ttl, %err, "failed to set TTL");
                continue;
            }
        }

        let packet = build_echo_request(probe.id, probe.seq);
        match send_icmp(socket, &packet, dest) {
            Ok(_) => {
                table.record(probe.id, probe.seq, probe.ttl);
                debug!(%probe, "probe sent");
            }
            Err(err) => {
                // Transient: the awaiting row will time out
                debug!(%probe, %err, "send failed");
            }
        }
    }
    trace!("send worker end");
}

fn run_receiver(
    socket: &Socket,
    reply_tx: mpsc::Sender<Observation>,
    table: &SentTable,
    cancel: &CancellationToken,
) {
    trace!("receive worker start");
    let mut buffer = [0u8; RECV_BUFFER_SIZE];

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let (len, src) = match recv_icmp(socket, &mut buffer) {
            Ok(read) => read,
            Err(err) if is_timeout(&err) => continue,
            Err(err) => {
                if cancel.is_cancelled() {
                    break;
                }
                debug!(%err, "receive error");
                continue;
            }
        };

        let (id, seq) = match decode_datagram(&buffer[..len]) {
            Ok(decoded) => match decoded.probe() {
                Some(key) => key,
                None => continue,
            },
            Err(err) => {
                trace!(%err, "undecodable packet dropped");
                continue;
            }
        };

        // Unmatched replies (other sessions, stray traffic) are dropped
        let Some(sent) = table.claim(id, seq) else {
            trace!(id, seq, "unmatched reply dropped");
            continue;
        };

        // Floor keeps a measured RTT from reading as the timeout sentinel
        let rtt = sent.at.elapsed().max(MIN_RTT);
        let observation = Observation::reply(sent.ttl, id, seq, src, src.to_string(), rtt);
        debug!(%observation, "reply correlated");

        if reply_tx.blocking_send(observation).is_err() {
            break;
        }
    }
    // reply_tx drops here, closing the reply queue for the dispatcher
    trace!("receive worker end");
}
