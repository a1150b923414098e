use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// How long the receive worker blocks per read before re-checking for
/// cancellation.
pub const READ_POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Inbound read size. Echo replies and the quoted echo inside Time Exceeded
/// messages both fit: 20 (outer IP) + 8 (error header) + 20 (quoted IP) +
/// 8 (quoted echo) = 56 bytes.
pub const RECV_BUFFER_SIZE: usize = 64;

/// Create the raw ICMPv4 socket for a session, bound to 0.0.0.0.
///
/// Requires elevated privilege on most operating systems; acquiring it is
/// the operator's responsibility.
pub fn create_icmp_socket(write_timeout: Duration) -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
    socket.bind(&SockAddr::from(SocketAddr::new(
        IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        0,
    )))?;
    socket.set_nonblocking(false)?;
    socket.set_read_timeout(Some(READ_POLL_TIMEOUT))?;
    socket.set_write_timeout(Some(write_timeout))?;
    Ok(socket)
}

/// Set TTL on a socket
pub fn set_ttl(socket: &Socket, ttl: u8) -> io::Result<()> {
    socket.set_ttl(ttl as u32)
}

/// Send ICMP packet to target
pub fn send_icmp(socket: &Socket, packet: &[u8], target: IpAddr) -> io::Result<usize> {
    let addr = SocketAddr::new(target, 0);
    socket.send_to(packet, &SockAddr::from(addr))
}

/// Receive ICMP packet
pub fn recv_icmp(socket: &Socket, buffer: &mut [u8]) -> io::Result<(usize, IpAddr)> {
    // Convert buffer to MaybeUninit slice for socket2
    let uninit_buf: &mut [MaybeUninit<u8>] = unsafe {
        std::slice::from_raw_parts_mut(buffer.as_mut_ptr() as *mut MaybeUninit<u8>, buffer.len())
    };

    let (len, addr) = socket.recv_from(uninit_buf)?;
    let ip = addr
        .as_socket()
        .map(|s| s.ip())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "invalid source address"))?;
    Ok((len, ip))
}

/// True for the error kinds a poll-timeout read returns when the socket is
/// simply idle.
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
