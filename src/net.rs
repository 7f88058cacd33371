//!
//! net.rs
//! Small networking helpers shared by the three roles.
//!
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use socket2::{Domain, SockAddr, Socket, Type};

/// connect_from()
/// Opens a TCP connection to `remote`, bound to `local` first. Used by
/// the primary coordinator to dial the fail-safe coordinator from a
/// stable local port. `std::net::TcpStream::connect` has no way to pick
/// the local address, hence `socket2`.
pub fn connect_from(local: SocketAddr, remote: SocketAddr) -> io::Result<TcpStream> {
    let domain = if remote.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(local))?;
    socket.connect(&SockAddr::from(remote))?;
    socket.into_tcp_stream_checked()
}

trait IntoTcpStreamChecked {
    fn into_tcp_stream_checked(self) -> io::Result<TcpStream>;
}

impl IntoTcpStreamChecked for Socket {
    fn into_tcp_stream_checked(self) -> io::Result<TcpStream> {
        Ok(self.into())
    }
}

/// set_optional_timeout()
/// Applies `timeout` (if any) as both the read and write deadline on
/// `stream`. A `None` timeout leaves the stream blocking forever, which
/// is the default for the coordinator and fail-safe: they rely on TCP
/// close for liveness rather than a deadline.
pub fn set_optional_timeout(stream: &TcpStream, timeout: Option<Duration>) -> io::Result<()> {
    stream.set_read_timeout(timeout)?;
    stream.set_write_timeout(timeout)
}
