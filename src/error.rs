use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to the caller.
///
/// Only setup failures escape `Session::run`; transient I/O conditions and
/// undecodable packets are normalized into timeout observations so the
/// handler sees a uniform stream.
#[derive(Error, Debug)]
pub enum Error {
    /// The target could not be resolved to an IPv4 address.
    #[error("failed to resolve {target} to an IPv4 address")]
    Resolve { target: String },

    /// The raw ICMP socket could not be created or configured.
    #[error("ICMP socket setup failed: {0}")]
    Socket(#[from] io::Error),

    /// The session has already started; handlers must be bound before run.
    #[error("session already started")]
    AlreadyStarted,
}
