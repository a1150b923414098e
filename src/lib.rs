//! ICMP Echo based reachability measurement.
//!
//! One protocol engine serves two modes: a single-hop ping and a multi-hop
//! traceroute, with ping being the degenerate one-row case. Outgoing Echo
//! Requests are multiplexed across TTL values, inbound Echo Reply and Time
//! Exceeded messages are correlated back to their probes by `(id, seq)`, and
//! each observation, reply or timeout, is delivered to a caller-supplied
//! handler under a per-probe deadline.
//!
//! The raw ICMP socket requires elevated privilege on most operating
//! systems; acquiring it is the operator's concern.
//!
//! ```no_run
//! # async fn demo() -> echotrace::Result<()> {
//! let session = echotrace::Session::traceroute("example.com", 30, 3);
//! session.on_observation(|observation| println!("{observation}"))?;
//! session.run().await?;
//! # Ok(())
//! # }
//! ```

// Public API - session surface and data types
pub mod config;
pub mod error;
pub mod observation;
pub mod session;

// Building blocks: wire codec, socket workers, and the dispatch fabric.
// Public so embedders can drive the engine against their own link.
pub mod probe;
pub mod trace;

pub use config::{DEFAULT_TIMEOUT, Mode, SessionConfig};
pub use error::{Error, Result};
pub use observation::{Observation, ObservationKind};
pub use session::Session;
