//! The public session façade: configure once, run once, stop once.

use parking_lot::Mutex;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::config::{Mode, SessionConfig};
use crate::error::{Error, Result};
use crate::observation::Observation;
use crate::probe::create_icmp_socket;
use crate::trace::{EngineState, ObservationHandler, ProbeEngine, SentTable, SocketLink};

/// One ping or traceroute measurement.
///
/// A session runs at most once and stops at most once; `stop` is safe to
/// call from a cancellation watcher racing natural completion. Share the
/// session behind an `Arc` to stop it from another task.
///
/// ```no_run
/// # async fn demo() -> echotrace::Result<()> {
/// let session = echotrace::Session::ping("1.1.1.1", 3);
/// session.on_observation(|observation| println!("{observation}"))?;
/// session.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Session {
    config: SessionConfig,
    state: Arc<EngineState>,
    handler: Mutex<Option<ObservationHandler>>,
    external_cancel: Mutex<Option<CancellationToken>>,
    resolved: OnceLock<(IpAddr, String)>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Session {
    /// Ping session with the default 500ms write and read durations.
    pub fn ping(target: impl Into<String>, count: u16) -> Self {
        Self::new(SessionConfig::ping(target, count))
    }

    /// Ping session with explicit write and read durations.
    pub fn ping_with(
        target: impl Into<String>,
        count: u16,
        write_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        Self::new(SessionConfig::ping_with(
            target,
            count,
            write_timeout,
            read_timeout,
        ))
    }

    /// Traceroute session with the default 500ms write and read durations.
    pub fn traceroute(target: impl Into<String>, max_ttl: u8, count: u16) -> Self {
        Self::new(SessionConfig::traceroute(target, max_ttl, count))
    }

    /// Traceroute session with explicit write and read durations.
    pub fn traceroute_with(
        target: impl Into<String>,
        max_ttl: u8,
        count: u16,
        write_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        Self::new(SessionConfig::traceroute_with(
            target,
            max_ttl,
            count,
            write_timeout,
            read_timeout,
        ))
    }

    /// Session from an explicit configuration.
    pub fn new(config: SessionConfig) -> Self {
        let state = Arc::new(EngineState::new(config.max_ttl));
        Self {
            config,
            state,
            handler: Mutex::new(None),
            external_cancel: Mutex::new(None),
            resolved: OnceLock::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Bind the observation callback. Must happen before `run`: binding
    /// afterwards would race in-flight deliveries, so it is rejected.
    pub fn on_observation(
        &self,
        handler: impl FnMut(Observation) + Send + 'static,
    ) -> Result<()> {
        if self.started.load(Ordering::Acquire) {
            return Err(Error::AlreadyStarted);
        }
        *self.handler.lock() = Some(Box::new(handler));
        Ok(())
    }

    /// Attach an external cancellation signal; when it fires, `stop` runs.
    /// Bind before `run`; the watcher is started there.
    pub fn bind_cancellation(&self, token: CancellationToken) {
        *self.external_cancel.lock() = Some(token);
    }

    /// The resolved target address, once `run` has resolved it.
    pub fn addr(&self) -> Option<IpAddr> {
        self.resolved.get().map(|(addr, _)| *addr)
    }

    /// The resolved target as a string; empty before resolution.
    pub fn ip4(&self) -> String {
        self.resolved
            .get()
            .map(|(_, ip4)| ip4.clone())
            .unwrap_or_default()
    }

    /// Run the session to completion, delivering every observation to the
    /// bound handler. Executes at most once; later calls are no-ops.
    ///
    /// Only setup failures (resolution, socket) are returned; once probing
    /// starts, every outcome is normalized into an observation.
    pub async fn run(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        trace!(host = %self.config.target, "run start");

        let (addr, ip4) = resolve_ip4(&self.config.target).ok_or_else(|| Error::Resolve {
            target: self.config.target.clone(),
        })?;
        let _ = self.resolved.set((addr, ip4));

        let socket = create_icmp_socket(self.config.write_timeout)?;

        let (probe_tx, probe_rx) = mpsc::channel(1);
        let (reply_tx, reply_rx) = mpsc::channel(1);
        let table = Arc::new(SentTable::new());
        let link = SocketLink::start(
            socket,
            probe_rx,
            reply_tx,
            table,
            self.state.cancel_token(),
        );

        if let Some(token) = self.external_cancel.lock().clone() {
            let state = Arc::clone(&self.state);
            let internal = self.state.cancel_token();
            tokio::spawn(async move {
                tokio::select! {
                    _ = internal.cancelled() => {}
                    _ = token.cancelled() => {
                        trace!("external cancellation");
                        state.shut_down();
                    }
                }
            });
        }

        let mut engine = ProbeEngine::new(
            self.config.mode,
            addr,
            self.config.count,
            self.config.read_timeout,
            probe_tx,
            reply_rx,
            Arc::clone(&self.state),
        );
        if let Some(handler) = self.handler.lock().take() {
            engine = engine.with_handler(handler);
        }
        engine.run().await;

        self.stop();
        link.join();
        trace!(host = %self.config.target, "run end");
        Ok(())
    }

    /// Stop the session: no further sends, no further deliveries.
    /// Idempotent, and safe before, during, or after `run`.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!(host = %self.config.target, "stop");
        self.state.shut_down();
    }
}

/// Resolve a target to IPv4: literal first, then one lookup.
fn resolve_ip4(target: &str) -> Option<(IpAddr, String)> {
    if let Ok(ip) = target.parse::<IpAddr>() {
        return match ip {
            IpAddr::V4(_) => Some((ip, ip.to_string())),
            IpAddr::V6(_) => None,
        };
    }

    let ip = format!("{target}:0")
        .to_socket_addrs()
        .ok()?
        .map(|s| s.ip())
        .find(IpAddr::is_ipv4)?;
    Some((ip, ip.to_string()))
}
