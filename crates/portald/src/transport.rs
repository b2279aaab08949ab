use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;

use dns_portal::transport::Transport;

/// A UDP socket on one IPv4 interface, driven by the tokio reactor.
///
/// The server only ever calls the non-blocking `try_*` methods; the
/// event loop awaits `readable` to find out when to call it.
#[derive(Debug)]
pub struct UdpTransport {
    interface: Ipv4Addr,
    socket: Option<UdpSocket>,
}

impl UdpTransport {
    pub fn new(interface: Ipv4Addr) -> Self {
        Self {
            interface,
            socket: None,
        }
    }

    /// Wait until a datagram may be pending.
    ///
    /// # Errors
    ///
    /// If the socket is not bound.
    pub async fn readable(&self) -> io::Result<()> {
        match &self.socket {
            Some(socket) => socket.readable().await,
            None => Err(not_bound()),
        }
    }

    fn socket(&self) -> io::Result<&UdpSocket> {
        self.socket.as_ref().ok_or_else(not_bound)
    }
}

impl Transport for UdpTransport {
    fn bind(&mut self, port: u16) -> io::Result<()> {
        let socket = std::net::UdpSocket::bind((self.interface, port))?;
        socket.set_nonblocking(true)?;
        self.socket = Some(UdpSocket::from_std(socket)?);
        Ok(())
    }

    fn close(&mut self) {
        self.socket = None;
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddrV4)>> {
        let socket = self.socket()?;
        loop {
            match socket.try_recv_from(buf) {
                Ok((len, SocketAddr::V4(peer))) => return Ok(Some((len, peer))),
                Ok((_, SocketAddr::V6(peer))) => {
                    tracing::debug!(%peer, "ignoring datagram from IPv6 peer");
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(error) => return Err(error),
            }
        }
    }

    fn send_to(&mut self, octets: &[u8], target: SocketAddrV4) -> io::Result<()> {
        let sent = self.socket()?.try_send_to(octets, SocketAddr::V4(target))?;
        if sent == octets.len() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("sent {sent} of {} octets", octets.len()),
            ))
        }
    }
}

fn not_bound() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "socket not bound")
}
