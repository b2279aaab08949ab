use std::fmt;
use std::io;
use std::net::Ipv4Addr;

use dns_types::protocol::types::*;

use crate::dispatch::{dispatch, Disposition};
use crate::forwarder::Forwarder;
use crate::settings::{DomainPattern, Settings};
use crate::stats::Stats;
use crate::transport::Transport;

/// The result of one call to `process_next_request`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Processed {
    /// Nothing was waiting.
    Idle,
    Handled(Disposition),
}

/// A captive-portal DNS server over some transport.
///
/// This does no I/O of its own accord: the owner calls
/// `process_next_request` whenever the transport may have something to
/// read, and each call handles at most one datagram.
#[derive(Debug)]
pub struct Server<T> {
    transport: T,
    settings: Settings,
    forwarder: Option<Forwarder>,
    running: bool,
    stats: Stats,
    // one more than the largest acceptable datagram, so that oversized
    // datagrams can be told apart from ones which exactly fit
    buffer: [u8; UDP_MAX_LEN + 1],
}

impl<T: Transport> Server<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            settings: Settings::default(),
            forwarder: None,
            running: false,
            stats: Stats::new(),
            buffer: [0; UDP_MAX_LEN + 1],
        }
    }

    /// Bind the transport and start answering queries for `domain` with
    /// `resolved_ip`.  If `upstream` is given, queries for other names
    /// are forwarded to it.
    ///
    /// TTL and error code are kept from any earlier configuration.
    ///
    /// # Errors
    ///
    /// If `upstream` is `0.0.0.0`, or the transport can't be bound.
    pub fn start(
        &mut self,
        port: u16,
        domain: &str,
        resolved_ip: Ipv4Addr,
        upstream: Option<Ipv4Addr>,
    ) -> Result<(), ServerError> {
        if upstream.is_some_and(|ip| ip.is_unspecified()) {
            return Err(ServerError::UpstreamUnspecified);
        }
        if self.running {
            self.stop();
        }

        self.transport.bind(port)?;
        self.running = true;
        self.settings.listen_port = port;
        self.settings.resolved_ip = resolved_ip;

        match upstream {
            Some(upstream) => self.enable_forwarder(domain, upstream)?,
            None => self.disable_forwarder(domain, true),
        }

        tracing::info!(
            port,
            domain = %self.settings.domain,
            %resolved_ip,
            upstream = ?self.settings.upstream,
            "started"
        );
        Ok(())
    }

    pub fn set_ttl(&mut self, ttl: u32) {
        self.settings.ttl = ttl;
    }

    pub fn set_error_reply_code(&mut self, rcode: Rcode) {
        self.settings.error_rcode = rcode;
    }

    /// Forward queries for names other than `domain` to `upstream`.
    /// Queries already in flight are kept if the forwarder was already
    /// allocated.
    ///
    /// # Errors
    ///
    /// If `upstream` is `0.0.0.0`.
    pub fn enable_forwarder(&mut self, domain: &str, upstream: Ipv4Addr) -> Result<(), ServerError> {
        if upstream.is_unspecified() {
            return Err(ServerError::UpstreamUnspecified);
        }

        self.settings.domain = DomainPattern::new(domain);
        self.settings.upstream = Some(upstream);
        match &mut self.forwarder {
            Some(forwarder) => forwarder.set_upstream(upstream),
            None => self.forwarder = Some(Forwarder::new(upstream)),
        }

        tracing::info!(domain = %self.settings.domain, %upstream, "forwarding enabled");
        Ok(())
    }

    /// Stop forwarding: queries for names other than `domain` get the
    /// error reply code instead.  The forwarding ring is only released
    /// if `free_resources` is set; otherwise replies to queries already
    /// in flight are dropped until forwarding is enabled again.
    pub fn disable_forwarder(&mut self, domain: &str, free_resources: bool) {
        self.settings.domain = DomainPattern::new(domain);
        self.settings.upstream = None;
        if free_resources {
            self.forwarder = None;
        }

        tracing::info!(domain = %self.settings.domain, free_resources, "forwarding disabled");
    }

    /// Close the transport and release the forwarding ring.  Stopping a
    /// server which is not running does nothing.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }

        self.transport.close();
        self.running = false;
        self.settings.upstream = None;
        self.forwarder = None;

        tracing::info!("stopped");
    }

    /// Handle at most one pending datagram.  Never blocks.
    ///
    /// # Errors
    ///
    /// If the server is not running, or on a transport error.  Errors
    /// in the datagram itself are handled (or dropped) and are not
    /// errors here.
    pub fn process_next_request(&mut self) -> Result<Processed, ServerError> {
        if !self.running {
            return Err(ServerError::NotRunning);
        }

        let Some((len, peer)) = self.transport.try_recv(&mut self.buffer)? else {
            return Ok(Processed::Idle);
        };

        let forwarder = if self.settings.is_forwarding() {
            self.forwarder.as_mut()
        } else {
            None
        };
        let disposition = dispatch(
            &self.settings,
            forwarder,
            &mut self.transport,
            &self.buffer[..len],
            peer,
        )?;

        self.stats.record(&disposition);
        Ok(Processed::Handled(disposition))
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_forwarding(&self) -> bool {
        self.settings.is_forwarding()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Queries forwarded upstream and not yet answered.
    pub fn in_flight(&self) -> usize {
        self.forwarder.as_ref().map_or(0, Forwarder::in_flight)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

/// An error from the server's control surface.
#[derive(Debug)]
pub enum ServerError {
    NotRunning,
    UpstreamUnspecified,
    Io(io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServerError::NotRunning => write!(f, "server is not running"),
            ServerError::UpstreamUnspecified => write!(f, "upstream nameserver address is unspecified"),
            ServerError::Io(error) => write!(f, "transport error: {error}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Io(error) => Some(error),
            _ => None,
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(error: io::Error) -> Self {
        ServerError::Io(error)
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddrV4;

    use dns_types::protocol::deserialise::read_u16_be;
    use dns_types::protocol::types::test_util::*;

    use super::*;
    use crate::dispatch::DropReason;
    use crate::forwarder::QUEUE_CAPACITY;
    use crate::settings::DEFAULT_ERROR_RCODE;
    use crate::transport::test_util::MemoryTransport;

    const PORTAL: Ipv4Addr = Ipv4Addr::new(192, 168, 4, 1);
    const UPSTREAM: Ipv4Addr = Ipv4Addr::new(9, 9, 9, 9);

    fn client(n: u8) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(192, 168, 4, n), 30000 + u16::from(n))
    }

    fn upstream() -> SocketAddrV4 {
        SocketAddrV4::new(UPSTREAM, DNS_PORT)
    }

    fn server() -> Server<MemoryTransport> {
        Server::new(MemoryTransport::new())
    }

    fn handle(server: &mut Server<MemoryTransport>, octets: &[u8], from: SocketAddrV4) -> Disposition {
        server.transport_mut().push(octets, from);
        match server.process_next_request().unwrap() {
            Processed::Handled(disposition) => disposition,
            Processed::Idle => panic!("expected a datagram to be handled"),
        }
    }

    /// Turn a forwarded query into the reply upstream would send.
    fn as_upstream_reply(forwarded: &[u8]) -> Vec<u8> {
        let mut reply = forwarded.to_vec();
        reply[2] |= HEADER_MASK_QR;
        reply
    }

    #[test]
    #[rustfmt::skip]
    fn end_to_end_answer() {
        let mut server = server();
        server.start(DNS_PORT, "www.example.com", PORTAL, None).unwrap();
        server.set_ttl(0);

        let query = query_octets(0x1234, "www.example.com", 1, 1);
        assert_eq!(Disposition::Answered, handle(&mut server, &query, client(2)));

        let sent = server.transport_mut().take_sent();
        assert_eq!(1, sent.len());
        assert_eq!(client(2), sent[0].1);

        let mut expected = vec![
            0x12, 0x34,
            0b1000_0101, 0,
            0, 1,
            0, 1,
            0, 0,
            0, 0,
        ];
        expected.extend_from_slice(&query[HEADER_LEN..]);
        expected.extend_from_slice(&[
            0xc0, 0x0c,
            0, 1,
            0, 1,
            0, 0, 0, 0,
            0, 4,
            192, 168, 4, 1,
        ]);
        assert_eq!(expected, sent[0].0);
    }

    #[test]
    fn idle_when_nothing_pending() {
        let mut server = server();
        server.start(DNS_PORT, "*", PORTAL, None).unwrap();
        assert_eq!(Processed::Idle, server.process_next_request().unwrap());
    }

    #[test]
    fn not_running_is_an_error() {
        let mut server = server();
        assert!(matches!(server.process_next_request(), Err(ServerError::NotRunning)));

        server.start(DNS_PORT, "*", PORTAL, None).unwrap();
        server.stop();
        assert!(!server.is_running());
        assert!(matches!(server.process_next_request(), Err(ServerError::NotRunning)));
        assert_eq!(None, server.transport().port);
    }

    #[test]
    fn start_binds_port() {
        let mut server = server();
        server.start(5353, "*", PORTAL, None).unwrap();
        assert_eq!(Some(5353), server.transport().port);
        assert_eq!(5353, server.settings().listen_port);
    }

    #[test]
    fn start_rejects_unspecified_upstream() {
        let mut server = server();
        assert!(matches!(
            server.start(DNS_PORT, "*", PORTAL, Some(Ipv4Addr::UNSPECIFIED)),
            Err(ServerError::UpstreamUnspecified)
        ));
        assert!(!server.is_running());
        assert_eq!(None, server.transport().port);
    }

    #[test]
    fn settings_survive_restart() {
        let mut server = server();
        server.set_ttl(300);
        server.set_error_reply_code(Rcode::Refused);
        server.start(DNS_PORT, "example.com", PORTAL, None).unwrap();
        server.stop();
        server.start(DNS_PORT, "example.net", PORTAL, None).unwrap();

        assert_eq!(300, server.settings().ttl);
        assert_eq!(Rcode::Refused, server.settings().error_rcode);
        assert_eq!(DomainPattern::new("example.net"), server.settings().domain);
    }

    #[test]
    fn wildcard_answers_everything() {
        let mut server = server();
        server.start(DNS_PORT, "*", PORTAL, None).unwrap();

        for name in ["example.com", "connectivitycheck.gstatic.com", "a.b.c.d.e"] {
            let query = query_octets(1, name, 1, 1);
            assert_eq!(Disposition::Answered, handle(&mut server, &query, client(3)));
        }
        assert_eq!(3, server.stats().answered);
    }

    #[test]
    fn error_reply_code_used_when_not_forwarding() {
        let mut server = server();
        server.start(DNS_PORT, "example.com", PORTAL, None).unwrap();
        server.set_error_reply_code(Rcode::ServerFailure);

        let query = query_octets(0x0101, "example.org", 1, 1);
        assert_eq!(
            Disposition::ErrorReply(Rcode::ServerFailure),
            handle(&mut server, &query, client(4))
        );

        let sent = server.transport_mut().take_sent();
        let header = Header::from_octets(&sent[0].0).unwrap();
        assert_eq!(0x0101, header.id);
        assert_eq!(Rcode::ServerFailure, header.rcode);
        assert_eq!(&query[HEADER_LEN..], &sent[0].0[HEADER_LEN..]);
    }

    #[test]
    fn empty_domain_gets_error_reply() {
        let mut server = server();
        server.start(DNS_PORT, "", PORTAL, None).unwrap();

        for name in ["", "www", "example.com"] {
            let query = query_octets(0x0202, name, 1, 1);
            assert_eq!(
                Disposition::ErrorReply(DEFAULT_ERROR_RCODE),
                handle(&mut server, &query, client(4))
            );
        }
        assert_eq!(0, server.stats().answered);
    }

    #[test]
    fn oversized_and_undersized_leave_state_alone() {
        let mut server = server();
        server.start(DNS_PORT, "example.com", PORTAL, Some(UPSTREAM)).unwrap();

        assert_eq!(
            Disposition::Dropped(DropReason::Undersized),
            handle(&mut server, &[], client(5))
        );
        assert_eq!(
            Disposition::Dropped(DropReason::Oversized),
            handle(&mut server, &[0; 600], client(5))
        );
        assert!(server.transport_mut().take_sent().is_empty());
        assert_eq!(0, server.in_flight());
        assert_eq!(2, server.stats().dropped);
    }

    #[test]
    fn exactly_512_octets_accepted() {
        let mut server = server();
        server.start(DNS_PORT, "example.com", PORTAL, None).unwrap();

        let mut query = query_octets(1, "example.com", 1, 1);
        query.resize(UDP_MAX_LEN, 0);
        assert_eq!(Disposition::Answered, handle(&mut server, &query, client(5)));
    }

    #[test]
    fn forward_and_relay_once() {
        let mut server = server();
        server.start(DNS_PORT, "example.com", PORTAL, Some(UPSTREAM)).unwrap();
        assert!(server.is_forwarding());

        let query = query_octets(0xaaaa, "example.org", 1, 1);
        assert_eq!(
            Disposition::Forwarded { recycled: false },
            handle(&mut server, &query, client(6))
        );
        let (forwarded, to) = server.transport_mut().take_sent().remove(0);
        assert_eq!(upstream(), to);

        let reply = as_upstream_reply(&forwarded);
        assert_eq!(Disposition::Relayed, handle(&mut server, &reply, upstream()));
        assert_eq!(
            Disposition::Dropped(DropReason::Duplicate),
            handle(&mut server, &reply, upstream())
        );

        let sent = server.transport_mut().take_sent();
        assert_eq!(1, sent.len());
        assert_eq!(client(6), sent[0].1);
        assert_eq!(Some(0xaaaa), read_u16_be(&sent[0].0, 0));
        assert_eq!(&reply[2..], &sent[0].0[2..]);
        assert_eq!(1, server.stats().duplicates);
    }

    #[test]
    fn out_of_order_replies_reach_their_own_clients() {
        let mut server = server();
        server.start(DNS_PORT, "example.com", PORTAL, Some(UPSTREAM)).unwrap();

        let from = |n: usize| SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 4000 + n as u16);
        let mut forwarded = Vec::new();
        for n in 0..QUEUE_CAPACITY {
            let query = query_octets(0x100 + n as u16, "example.org", 1, 1);
            assert_eq!(
                Disposition::Forwarded { recycled: false },
                handle(&mut server, &query, from(n))
            );
            forwarded.push(server.transport_mut().take_sent().remove(0).0);
        }
        assert_eq!(QUEUE_CAPACITY, server.in_flight());

        for n in (0..QUEUE_CAPACITY).rev() {
            let reply = as_upstream_reply(&forwarded[n]);
            assert_eq!(Disposition::Relayed, handle(&mut server, &reply, upstream()));

            let sent = server.transport_mut().take_sent();
            assert_eq!(1, sent.len());
            assert_eq!(from(n), sent[0].1);
            assert_eq!(Some(0x100 + n as u16), read_u16_be(&sent[0].0, 0));
            assert_eq!(&reply[2..], &sent[0].0[2..]);
        }
        assert_eq!(0, server.in_flight());
        assert_eq!(QUEUE_CAPACITY as u64, server.stats().relayed);
    }

    #[test]
    fn ring_overflow_relays_to_newest_occupant() {
        let mut server = server();
        server.start(DNS_PORT, "example.com", PORTAL, Some(UPSTREAM)).unwrap();

        let mut forwarded = Vec::new();
        for n in 0..=QUEUE_CAPACITY {
            let query = query_octets(n as u16, "example.org", 1, 1);
            let disposition = handle(&mut server, &query, client(10 + n as u8));
            assert_eq!(
                Disposition::Forwarded {
                    recycled: n == QUEUE_CAPACITY
                },
                disposition
            );
            forwarded.push(server.transport_mut().take_sent().remove(0).0);
        }
        assert_eq!(1, server.stats().overflows);

        // the first query's reply is stale; the newest one's is relayed
        assert_eq!(
            Disposition::Dropped(DropReason::OutOfWindow),
            handle(&mut server, &as_upstream_reply(&forwarded[0]), upstream())
        );
        assert_eq!(
            Disposition::Relayed,
            handle(&mut server, &as_upstream_reply(&forwarded[QUEUE_CAPACITY]), upstream())
        );

        let sent = server.transport_mut().take_sent();
        assert_eq!(1, sent.len());
        assert_eq!(client(10 + QUEUE_CAPACITY as u8), sent[0].1);
        assert_eq!(Some(QUEUE_CAPACITY as u16), read_u16_be(&sent[0].0, 0));
    }

    #[test]
    fn disable_forwarder_keeps_or_frees_ring() {
        let mut server = server();
        server.start(DNS_PORT, "example.com", PORTAL, Some(UPSTREAM)).unwrap();
        let query = query_octets(1, "example.org", 1, 1);
        handle(&mut server, &query, client(7));
        server.transport_mut().take_sent();

        server.disable_forwarder("example.com", false);
        assert!(!server.is_forwarding());
        assert_eq!(1, server.in_flight());
        assert_eq!(
            Disposition::ErrorReply(Rcode::NameError),
            handle(&mut server, &query, client(7))
        );

        server.enable_forwarder("example.com", UPSTREAM).unwrap();
        assert_eq!(1, server.in_flight());

        server.disable_forwarder("example.com", true);
        assert_eq!(0, server.in_flight());
    }

    #[test]
    fn upstream_not_special_when_forwarding_disabled() {
        let mut server = server();
        server.start(DNS_PORT, "example.com", PORTAL, Some(UPSTREAM)).unwrap();
        server.disable_forwarder("example.com", false);

        let query = query_octets(1, "example.com", 1, 1);
        assert_eq!(Disposition::Answered, handle(&mut server, &query, upstream()));
    }

    #[test]
    fn enable_forwarder_rejects_unspecified() {
        let mut server = server();
        server.start(DNS_PORT, "example.com", PORTAL, None).unwrap();
        assert!(matches!(
            server.enable_forwarder("example.com", Ipv4Addr::UNSPECIFIED),
            Err(ServerError::UpstreamUnspecified)
        ));
        assert!(!server.is_forwarding());
    }

    #[test]
    fn transport_errors_propagate() {
        let mut server = server();
        server.start(DNS_PORT, "*", PORTAL, None).unwrap();
        server.transport_mut().fail_sends = true;
        server.transport_mut().push(&query_octets(1, "example.com", 1, 1), client(8));

        assert!(matches!(server.process_next_request(), Err(ServerError::Io(_))));
        assert_eq!(0, server.stats().answered);
    }
}
