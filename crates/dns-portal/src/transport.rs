//! The datagram socket the server reads from and writes to.

use std::io;
use std::net::SocketAddrV4;

/// A non-blocking, IPv4, UDP-like endpoint.
///
/// The server never waits: `try_recv` returns `Ok(None)` when nothing
/// is pending, and `send_to` either hands the whole datagram over or
/// fails.
pub trait Transport {
    /// Bind to the given port on every local address.
    ///
    /// # Errors
    ///
    /// If the port can't be bound.
    fn bind(&mut self, port: u16) -> io::Result<()>;

    /// Release the port.  Closing a transport which is not bound does
    /// nothing.
    fn close(&mut self);

    /// Copy the next pending datagram into `buf`, returning its length
    /// and sender.  A datagram longer than `buf` is truncated to fit,
    /// and the rest is discarded.
    ///
    /// # Errors
    ///
    /// If the transport is not bound, or on an I/O error.
    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddrV4)>>;

    /// # Errors
    ///
    /// If the transport is not bound, or on an I/O error.
    fn send_to(&mut self, octets: &[u8], target: SocketAddrV4) -> io::Result<()>;
}

#[cfg(any(feature = "test-util", test))]
pub mod test_util {
    use std::collections::VecDeque;

    use super::*;

    /// An in-memory transport: datagrams are queued with `push` and
    /// everything sent is recorded.
    #[derive(Debug, Default)]
    pub struct MemoryTransport {
        pub port: Option<u16>,
        pub inbound: VecDeque<(Vec<u8>, SocketAddrV4)>,
        pub sent: Vec<(Vec<u8>, SocketAddrV4)>,
        /// Make every `send_to` fail.
        pub fail_sends: bool,
    }

    impl MemoryTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push(&mut self, octets: &[u8], from: SocketAddrV4) {
            self.inbound.push_back((octets.to_vec(), from));
        }

        /// Everything sent since the last call.
        pub fn take_sent(&mut self) -> Vec<(Vec<u8>, SocketAddrV4)> {
            std::mem::take(&mut self.sent)
        }

        fn check_bound(&self) -> io::Result<()> {
            if self.port.is_some() {
                Ok(())
            } else {
                Err(io::Error::new(io::ErrorKind::NotConnected, "transport not bound"))
            }
        }
    }

    impl Transport for MemoryTransport {
        fn bind(&mut self, port: u16) -> io::Result<()> {
            self.port = Some(port);
            Ok(())
        }

        fn close(&mut self) {
            self.port = None;
        }

        fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddrV4)>> {
            self.check_bound()?;
            let Some((octets, from)) = self.inbound.pop_front() else {
                return Ok(None);
            };

            let len = octets.len().min(buf.len());
            buf[..len].copy_from_slice(&octets[..len]);
            Ok(Some((len, from)))
        }

        fn send_to(&mut self, octets: &[u8], target: SocketAddrV4) -> io::Result<()> {
            self.check_bound()?;
            if self.fail_sends {
                return Err(io::Error::other("send failed"));
            }

            self.sent.push((octets.to_vec(), target));
            Ok(())
        }
    }
}
