use std::fmt;
use std::io;
use std::net::SocketAddrV4;

use dns_types::protocol::types::*;

use crate::classify::{classify, Outcome, Reason};
use crate::forwarder::{Forwarder, Relay};
use crate::reply::{reply_with_error, reply_with_ip};
use crate::settings::Settings;
use crate::transport::Transport;

/// What happened to a single datagram.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Disposition {
    /// Answered with the portal's address.
    Answered,
    /// Answered with an error and no records.
    ErrorReply(Rcode),
    /// Sent upstream.  `recycled` is set if this evicted an older query
    /// which had not been answered yet.
    Forwarded { recycled: bool },
    /// An upstream reply was passed back to the client.
    Relayed,
    Dropped(DropReason),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum DropReason {
    Oversized,
    Undersized,
    Malformed(Reason),
    OutOfWindow,
    Duplicate,
}

impl DropReason {
    /// Short label, suitable for metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::Oversized => "oversized",
            DropReason::Undersized => "undersized",
            DropReason::Malformed(reason) => reason.as_str(),
            DropReason::OutOfWindow => "out_of_window",
            DropReason::Duplicate => "duplicate",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DropReason::Malformed(reason) => write!(f, "{reason}"),
            _ => write!(f, "{}", self.as_str()),
        }
    }
}

/// Handle one received datagram: answer it, refuse it, forward it,
/// relay it, or drop it.
///
/// A datagram from the upstream address is always treated as a reply
/// to a forwarded query (when forwarding is enabled), whatever its
/// contents.
///
/// # Errors
///
/// If a reply cannot be sent.
pub fn dispatch<T: Transport + ?Sized>(
    settings: &Settings,
    mut forwarder: Option<&mut Forwarder>,
    transport: &mut T,
    datagram: &[u8],
    peer: SocketAddrV4,
) -> io::Result<Disposition> {
    if datagram.len() > UDP_MAX_LEN {
        tracing::debug!(%peer, len = datagram.len(), "dropping oversized datagram");
        return Ok(Disposition::Dropped(DropReason::Oversized));
    }
    if datagram.len() < HEADER_LEN {
        tracing::debug!(%peer, len = datagram.len(), "dropping undersized datagram");
        return Ok(Disposition::Dropped(DropReason::Undersized));
    }

    if let Some(forwarder) = forwarder.as_deref_mut() {
        if *peer.ip() == forwarder.upstream() {
            return Ok(match forwarder.handle_upstream_reply(transport, datagram)? {
                Relay::Relayed { .. } => Disposition::Relayed,
                Relay::OutOfWindow => Disposition::Dropped(DropReason::OutOfWindow),
                Relay::Duplicate => Disposition::Dropped(DropReason::Duplicate),
            });
        }
    }

    match classify(datagram, &settings.domain) {
        Outcome::Matched(query) => {
            let reply = reply_with_ip(
                &query.header,
                query.question.octets(),
                settings.resolved_ip,
                settings.ttl,
            );
            transport.send_to(&reply, peer)?;
            tracing::debug!(%peer, id = query.header.id, question = %query.question, "answered");
            Ok(Disposition::Answered)
        }
        Outcome::NoMatch(query) => {
            if let Some(forwarder) = forwarder {
                let forwarded = forwarder.forward(transport, datagram, peer)?;
                Ok(Disposition::Forwarded {
                    recycled: forwarded.recycled.is_some(),
                })
            } else {
                let rcode = settings.error_rcode;
                let reply = reply_with_error(&query.header, rcode, Some(query.question.octets()));
                transport.send_to(&reply, peer)?;
                tracing::debug!(%peer, id = query.header.id, question = %query.question, %rcode, "refused");
                Ok(Disposition::ErrorReply(rcode))
            }
        }
        Outcome::Malformed(malformed) => match (malformed.header, malformed.rcode()) {
            (Some(header), Some(rcode)) => {
                let reply = reply_with_error(&header, rcode, malformed.question.map(|q| q.octets()));
                transport.send_to(&reply, peer)?;
                tracing::debug!(%peer, id = header.id, reason = %malformed.reason, %rcode, "rejected");
                Ok(Disposition::ErrorReply(rcode))
            }
            _ => {
                tracing::debug!(%peer, reason = %malformed.reason, "dropping datagram");
                Ok(Disposition::Dropped(DropReason::Malformed(malformed.reason)))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use dns_types::protocol::deserialise::read_u16_be;
    use dns_types::protocol::types::test_util::*;

    use super::*;
    use crate::transport::test_util::MemoryTransport;

    const UPSTREAM: Ipv4Addr = Ipv4Addr::new(8, 8, 4, 4);
    const PORTAL: Ipv4Addr = Ipv4Addr::new(192, 168, 4, 1);

    fn client() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(192, 168, 4, 20), 40000)
    }

    fn bound() -> MemoryTransport {
        let mut transport = MemoryTransport::new();
        transport.bind(DNS_PORT).unwrap();
        transport
    }

    fn settings() -> Settings {
        Settings::new("example.com", PORTAL)
    }

    #[test]
    fn matched_answered() {
        let mut transport = bound();
        let query = query_octets(9, "www.example.com", 1, 1);

        let disposition = dispatch(&settings(), None, &mut transport, &query, client()).unwrap();
        assert_eq!(Disposition::Answered, disposition);

        let sent = transport.take_sent();
        assert_eq!(1, sent.len());
        assert_eq!(client(), sent[0].1);
        assert_eq!(&PORTAL.octets(), &sent[0].0[sent[0].0.len() - 4..]);
    }

    #[test]
    fn no_match_refused_with_configured_rcode() {
        let mut transport = bound();
        let mut settings = settings();
        settings.error_rcode = Rcode::Refused;
        let query = query_octets(9, "example.org", 1, 1);

        let disposition = dispatch(&settings, None, &mut transport, &query, client()).unwrap();
        assert_eq!(Disposition::ErrorReply(Rcode::Refused), disposition);

        let sent = transport.take_sent();
        let header = Header::from_octets(&sent[0].0).unwrap();
        assert_eq!(Rcode::Refused, header.rcode);
        assert_eq!(1, header.qdcount);
        assert_eq!(&query[HEADER_LEN..], &sent[0].0[HEADER_LEN..]);
    }

    #[test]
    fn no_match_forwarded() {
        let mut transport = bound();
        let mut forwarder = Forwarder::with_seed(UPSTREAM, 0);
        let query = query_octets(9, "example.org", 1, 1);

        let disposition = dispatch(&settings(), Some(&mut forwarder), &mut transport, &query, client()).unwrap();
        assert_eq!(Disposition::Forwarded { recycled: false }, disposition);

        let sent = transport.take_sent();
        assert_eq!(SocketAddrV4::new(UPSTREAM, DNS_PORT), sent[0].1);
    }

    #[test]
    fn matched_not_forwarded() {
        let mut transport = bound();
        let mut forwarder = Forwarder::with_seed(UPSTREAM, 0);
        let query = query_octets(9, "example.com", 1, 1);

        let disposition = dispatch(&settings(), Some(&mut forwarder), &mut transport, &query, client()).unwrap();
        assert_eq!(Disposition::Answered, disposition);
        assert_eq!(0, forwarder.in_flight());
    }

    #[test]
    fn upstream_reply_relayed() {
        let mut transport = bound();
        let mut forwarder = Forwarder::with_seed(UPSTREAM, 0);
        let query = query_octets(0x5555, "example.org", 1, 1);
        dispatch(&settings(), Some(&mut forwarder), &mut transport, &query, client()).unwrap();
        let forwarded = transport.take_sent().remove(0).0;

        let mut reply = forwarded.clone();
        reply[2] |= HEADER_MASK_QR;
        let from_upstream = SocketAddrV4::new(UPSTREAM, DNS_PORT);

        let disposition = dispatch(&settings(), Some(&mut forwarder), &mut transport, &reply, from_upstream).unwrap();
        assert_eq!(Disposition::Relayed, disposition);
        let sent = transport.take_sent();
        assert_eq!(client(), sent[0].1);
        assert_eq!(Some(0x5555), read_u16_be(&sent[0].0, 0));

        let disposition = dispatch(&settings(), Some(&mut forwarder), &mut transport, &reply, from_upstream).unwrap();
        assert_eq!(Disposition::Dropped(DropReason::Duplicate), disposition);
        assert!(transport.take_sent().is_empty());
    }

    #[test]
    fn upstream_address_only_special_when_forwarding() {
        let mut transport = bound();
        let query = query_octets(9, "example.com", 1, 1);
        let from_upstream = SocketAddrV4::new(UPSTREAM, 53000);

        let disposition = dispatch(&settings(), None, &mut transport, &query, from_upstream).unwrap();
        assert_eq!(Disposition::Answered, disposition);
    }

    #[test]
    fn size_limits() {
        let mut transport = bound();
        let mut forwarder = Forwarder::with_seed(UPSTREAM, 0);

        for (len, reason) in [
            (0, DropReason::Undersized),
            (11, DropReason::Undersized),
            (513, DropReason::Oversized),
            (600, DropReason::Oversized),
        ] {
            let mut datagram = query_octets(1, "example.com", 1, 1);
            datagram.resize(len, 0);
            let disposition =
                dispatch(&settings(), Some(&mut forwarder), &mut transport, &datagram, client()).unwrap();
            assert_eq!(Disposition::Dropped(reason), disposition);
        }

        assert!(transport.take_sent().is_empty());
        assert_eq!(0, forwarder.in_flight());
    }

    #[test]
    fn response_dropped_silently() {
        let mut transport = bound();
        let mut header = query_header(1);
        header.is_response = true;
        let mut datagram = header.to_octets().to_vec();
        datagram.append(&mut question_octets("example.com", 1, 1));

        let disposition = dispatch(&settings(), None, &mut transport, &datagram, client()).unwrap();
        assert_eq!(Disposition::Dropped(DropReason::Malformed(Reason::NotAQuery)), disposition);
        assert!(transport.take_sent().is_empty());
    }

    #[test]
    fn malformed_gets_header_only_error() {
        let mut transport = bound();
        let mut header = query_header(0x4242);
        header.qdcount = 2;
        let mut datagram = header.to_octets().to_vec();
        datagram.append(&mut question_octets("example.com", 1, 1));

        let disposition = dispatch(&settings(), None, &mut transport, &datagram, client()).unwrap();
        assert_eq!(Disposition::ErrorReply(Rcode::FormatError), disposition);

        let sent = transport.take_sent();
        assert_eq!(HEADER_LEN, sent[0].0.len());
        let reply = Header::from_octets(&sent[0].0).unwrap();
        assert_eq!(0x4242, reply.id);
        assert_eq!(0, reply.qdcount);
    }

    #[test]
    fn send_failure_propagates() {
        let mut transport = bound();
        transport.fail_sends = true;
        let query = query_octets(9, "example.com", 1, 1);

        assert!(dispatch(&settings(), None, &mut transport, &query, client()).is_err());
    }
}
