//! The probe orchestrator: a TTL-sharded dispatch fabric.
//!
//! One controller loop issues the first probe of each TTL row, then hands
//! the row to a continuation task for the remaining sequences. A dispatcher
//! task routes correlated replies from the socket workers to the row that
//! awaits them, and a single handler task delivers observations to the
//! caller so the callback never runs reentrantly.

use parking_lot::RwLock;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::Mode;
use crate::observation::Observation;

/// Callback invoked for every delivered observation.
pub type ObservationHandler = Box<dyn FnMut(Observation) + Send + 'static>;

/// State shared between the engine tasks and the session façade.
///
/// `stop()` flows through here: the exit flag halts new work at the next
/// decision point, the token wakes the workers, and clearing the row
/// senders closes every inbox exactly once.
#[derive(Debug)]
pub struct EngineState {
    exit: AtomicBool,
    cancel: CancellationToken,
    max_hop: AtomicUsize,
    rows: RwLock<Vec<Option<mpsc::Sender<Observation>>>>,
    next_id: AtomicU32,
}

impl EngineState {
    pub fn new(max_ttl: u8) -> Self {
        Self {
            exit: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            max_hop: AtomicUsize::new(max_ttl as usize),
            rows: RwLock::new(vec![None; max_ttl as usize]),
            // Seeded from process identity, like the classic ping id
            next_id: AtomicU32::new(std::process::id() & 0xffff),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_exiting(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }

    /// Current number of TTL rows worth probing. Monotonically non-increasing.
    pub fn max_hop(&self) -> usize {
        self.max_hop.load(Ordering::Acquire)
    }

    /// Signal termination: no further sends, no further deliveries.
    /// Idempotent.
    pub fn shut_down(&self) {
        self.exit.store(true, Ordering::Release);
        self.cancel.cancel();
        // Closing each inbox wakes any row still awaiting a reply
        for slot in self.rows.write().iter_mut() {
            *slot = None;
        }
    }

    /// Next 16-bit ICMP identifier, unique per row within the session.
    fn next_icmp_id(&self) -> u16 {
        (self.next_id.fetch_add(1, Ordering::SeqCst).wrapping_add(1)) as u16
    }

    fn install_row(&self, index: usize, sender: mpsc::Sender<Observation>) {
        self.rows.write()[index] = Some(sender);
    }

    fn row_sender(&self, index: usize) -> Option<mpsc::Sender<Observation>> {
        self.rows.read().get(index).and_then(Clone::clone)
    }

    /// Lower the hop ceiling to a terminal reply's TTL. Smallest wins.
    fn lower_max_hop(&self, ttl: u8) -> bool {
        let previous = self.max_hop.fetch_min(ttl as usize, Ordering::AcqRel);
        (ttl as usize) < previous
    }
}

/// The per-session orchestrator. Constructed by the session façade around a
/// running socket link, or around a mock link in tests.
pub struct ProbeEngine {
    mode: Mode,
    target: IpAddr,
    target_ip4: String,
    count: u16,
    read_timeout: Duration,
    probe_tx: mpsc::Sender<Observation>,
    reply_rx: mpsc::Receiver<Observation>,
    handler: Option<ObservationHandler>,
    state: Arc<EngineState>,
}

impl ProbeEngine {
    pub fn new(
        mode: Mode,
        target: IpAddr,
        count: u16,
        read_timeout: Duration,
        probe_tx: mpsc::Sender<Observation>,
        reply_rx: mpsc::Receiver<Observation>,
        state: Arc<EngineState>,
    ) -> Self {
        Self {
            mode,
            target,
            target_ip4: target.to_string(),
            count,
            read_timeout,
            probe_tx,
            reply_rx,
            handler: None,
            state,
        }
    }

    pub fn with_handler(mut self, handler: ObservationHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Drive the session to completion: every row probed `count` times,
    /// every observation delivered, all queues closed.
    pub async fn run(self) {
        let Self {
            mode,
            target,
            target_ip4,
            count,
            read_timeout,
            probe_tx,
            reply_rx,
            handler,
            state,
        } = self;
        trace!("engine run start");

        // The dispatcher exits when the reply queue closes or stop fires;
        // it is not joined, mirroring the fire-and-forget reply router.
        tokio::spawn(dispatch(
            reply_rx,
            Arc::clone(&state),
            mode,
            target_ip4.clone(),
        ));

        let (handler_tx, handler_rx) = mpsc::channel(1);
        let handler_task = tokio::spawn(run_handler(handler_rx, handler, Arc::clone(&state)));

        let mut continuations = Vec::new();
        let mut index = 0usize;
        while index < state.max_hop() {
            if state.is_exiting() {
                break;
            }

            // Lazy row init: identifier plus a single-capacity inbox
            let id = state.next_icmp_id();
            let (row_tx, mut row_rx) = mpsc::channel(1);
            state.install_row(index, row_tx);

            // Wire TTL 0 in ping mode leaves the OS default hop limit
            let wire_ttl = match mode {
                Mode::Traceroute => (index + 1) as u8,
                Mode::Ping => 0,
            };

            send_probe(&probe_tx, &state, wire_ttl, id, 0, target, &target_ip4).await;
            let observation = await_row(&mut row_rx, wire_ttl, id, 0, read_timeout).await;
            deliver(&handler_tx, &state, observation).await;

            // Remaining sequences run concurrently with later rows
            continuations.push(tokio::spawn(run_row(
                row_rx,
                wire_ttl,
                id,
                count,
                read_timeout,
                probe_tx.clone(),
                handler_tx.clone(),
                Arc::clone(&state),
                target,
                target_ip4.clone(),
            )));

            if mode == Mode::Ping {
                break;
            }
            index += 1;
        }

        for continuation in continuations {
            let _ = continuation.await;
        }

        // Closing the send queue stops the send worker; closing the handler
        // queue lets the handler task drain and finish before run returns.
        drop(probe_tx);
        drop(handler_tx);
        let _ = handler_task.await;
        trace!("engine run end");
    }
}

/// Issue the remaining sequences of one TTL row.
#[allow(clippy::too_many_arguments)]
async fn run_row(
    mut row_rx: mpsc::Receiver<Observation>,
    wire_ttl: u8,
    id: u16,
    count: u16,
    read_timeout: Duration,
    probe_tx: mpsc::Sender<Observation>,
    handler_tx: mpsc::Sender<Observation>,
    state: Arc<EngineState>,
    target: IpAddr,
    target_ip4: String,
) {
    trace!(ttl = wire_ttl, id, "row start");
    for seq in 1..count {
        if state.is_exiting() {
            return;
        }
        send_probe(&probe_tx, &state, wire_ttl, id, seq, target, &target_ip4).await;
        let observation = await_row(&mut row_rx, wire_ttl, id, seq, read_timeout).await;
        deliver(&handler_tx, &state, observation).await;
    }
    trace!(ttl = wire_ttl, id, "row end");
}

/// Hand a probe descriptor to the send worker.
async fn send_probe(
    probe_tx: &mpsc::Sender<Observation>,
    state: &EngineState,
    wire_ttl: u8,
    id: u16,
    seq: u16,
    target: IpAddr,
    target_ip4: &str,
) {
    if state.is_exiting() {
        return;
    }
    let probe = Observation::request(wire_ttl, id, seq, target, target_ip4);
    let _ = probe_tx.send(probe).await;
}

/// Await one observation for a row under the read deadline.
///
/// When a reply beats the deadline on a follow-up sequence, the remainder of
/// the deadline is slept out so consecutive probes of one row stay spaced at
/// the read interval. The first probe of a row is never delayed.
async fn await_row(
    row_rx: &mut mpsc::Receiver<Observation>,
    wire_ttl: u8,
    id: u16,
    seq: u16,
    read_timeout: Duration,
) -> Observation {
    let started = tokio::time::Instant::now();
    let deadline = started + read_timeout;
    let observation = loop {
        match tokio::time::timeout_at(deadline, row_rx.recv()).await {
            Ok(Some(observation)) => {
                // A reply for a sequence already reported as timed out:
                // that probe has had its one observation, drop the reply
                if observation.seq != seq {
                    trace!(%observation, expected = seq, "stale reply dropped");
                    continue;
                }
                break observation;
            }
            // Inbox closed by stop
            Ok(None) => return Observation::timeout(wire_ttl, id, seq),
            Err(_) => {
                trace!(ttl = wire_ttl, id, seq, "read deadline elapsed");
                return Observation::timeout(wire_ttl, id, seq);
            }
        }
    };
    if seq > 0 {
        let elapsed = started.elapsed();
        if elapsed < read_timeout {
            tokio::time::sleep(read_timeout - elapsed).await;
        }
    }
    observation
}

/// Queue an observation for the handler task.
async fn deliver(
    handler_tx: &mpsc::Sender<Observation>,
    state: &EngineState,
    observation: Observation,
) {
    if state.is_exiting() {
        return;
    }
    debug!(%observation, "observation");
    let _ = handler_tx.send(observation).await;
}

/// Route correlated replies to the row awaiting them, tightening the hop
/// ceiling when the target itself answers below it.
async fn dispatch(
    mut reply_rx: mpsc::Receiver<Observation>,
    state: Arc<EngineState>,
    mode: Mode,
    target_ip4: String,
) {
    let cancel = state.cancel_token();
    loop {
        let observation = tokio::select! {
            _ = cancel.cancelled() => break,
            received = reply_rx.recv() => match received {
                Some(observation) => observation,
                None => break,
            },
        };
        debug!(%observation, "reply");

        if mode == Mode::Traceroute
            && observation.ip4 == target_ip4
            && state.lower_max_hop(observation.ttl)
        {
            trace!(max_hop = observation.ttl, "terminal reply, max hop lowered");
        }

        let index = match mode {
            Mode::Traceroute => match (observation.ttl as usize).checked_sub(1) {
                Some(index) => index,
                None => continue,
            },
            Mode::Ping => observation.ttl as usize,
        };
        if let Some(row_tx) = state.row_sender(index) {
            let _ = row_tx.send(observation).await;
        }
    }
    trace!("dispatcher end");
}

/// Deliver observations to the caller's callback, one at a time.
async fn run_handler(
    mut handler_rx: mpsc::Receiver<Observation>,
    mut handler: Option<ObservationHandler>,
    state: Arc<EngineState>,
) {
    let cancel = state.cancel_token();
    loop {
        let observation = tokio::select! {
            _ = cancel.cancelled() => break,
            received = handler_rx.recv() => match received {
                Some(observation) => observation,
                None => break,
            },
        };
        if state.is_exiting() {
            break;
        }
        if let Some(callback) = handler.as_mut() {
            callback(observation);
        }
    }
}
