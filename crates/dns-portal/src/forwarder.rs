use bytes::BytesMut;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};

use dns_types::protocol::deserialise::read_u16_be;
use dns_types::protocol::serialise::write_u16_be;
use dns_types::protocol::types::*;

use crate::transport::Transport;

/// The ring holds `2 ^ QUEUE_SIZE_LOG2` in-flight queries.
pub const QUEUE_SIZE_LOG2: u32 = 3;

pub const QUEUE_CAPACITY: usize = 1 << QUEUE_SIZE_LOG2;

const QUEUE_MASK: u16 = (QUEUE_CAPACITY - 1) as u16;

/// A query which has been sent upstream and not yet answered.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct InFlight {
    client: SocketAddrV4,
    original_id: u16,
}

/// Forwarding multiplexer.
///
/// Queries are sent upstream with a fresh ID taken from a wrapping
/// 16-bit counter; the low bits of that ID pick a slot in a fixed-size
/// ring, where the client's address and original ID are kept until the
/// reply comes back.
///
/// There are no timers: a slot is only freed when its reply arrives or
/// when the counter comes round again and a newer query takes it over.
/// Only the last `QUEUE_CAPACITY` IDs handed out are accepted as
/// replies.
#[derive(Debug, Clone)]
pub struct Forwarder {
    upstream: Ipv4Addr,
    /// The most recently issued upstream ID.
    ids: u16,
    slots: [Option<InFlight>; QUEUE_CAPACITY],
}

/// What `forward` did.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Forwarded {
    pub upstream_id: u16,
    /// The client whose query was displaced from the slot, which will
    /// now never get an answer.
    pub recycled: Option<SocketAddrV4>,
}

/// What `handle_upstream_reply` did.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Relay {
    Relayed { client: SocketAddrV4 },
    /// The ID is not one of the last `QUEUE_CAPACITY` issued.
    OutOfWindow,
    /// The slot has already been answered, or was never filled.
    Duplicate,
}

impl Forwarder {
    /// A forwarder with a randomly seeded ID counter.
    pub fn new(upstream: Ipv4Addr) -> Self {
        Self::with_seed(upstream, rand::random())
    }

    pub fn with_seed(upstream: Ipv4Addr, seed: u16) -> Self {
        Self {
            upstream,
            ids: seed,
            slots: [None; QUEUE_CAPACITY],
        }
    }

    pub fn upstream(&self) -> Ipv4Addr {
        self.upstream
    }

    /// Point at a different nameserver.  Queries already in flight
    /// stay in the ring.
    pub fn set_upstream(&mut self, upstream: Ipv4Addr) {
        self.upstream = upstream;
    }

    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Send a query upstream under a fresh ID, remembering who asked.
    ///
    /// # Errors
    ///
    /// If the query has no ID field, or sending fails.  In the latter
    /// case the slot stays occupied.
    pub fn forward<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        query: &[u8],
        client: SocketAddrV4,
    ) -> io::Result<Forwarded> {
        let original_id = read_u16_be(query, 0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "query too short to forward"))?;

        self.ids = self.ids.wrapping_add(1);
        let upstream_id = self.ids;
        let slot = usize::from(upstream_id & QUEUE_MASK);

        let recycled = self.slots[slot].map(|displaced| displaced.client);
        if let Some(lost) = recycled {
            tracing::warn!(%lost, slot, "forwarding queue overflow, dropping oldest query");
        }
        self.slots[slot] = Some(InFlight {
            client,
            original_id,
        });

        let mut octets = BytesMut::from(query);
        write_u16_be(&mut octets, 0, upstream_id)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidInput, error))?;
        transport.send_to(&octets, SocketAddrV4::new(self.upstream, DNS_PORT))?;

        tracing::trace!(%client, original_id, upstream_id, slot, "forwarded");
        Ok(Forwarded {
            upstream_id,
            recycled,
        })
    }

    /// Relay a reply from upstream back to whoever asked, restoring
    /// their original ID.  Each slot is relayed at most once.
    ///
    /// # Errors
    ///
    /// If sending fails.  The slot has already been released by then,
    /// so a retransmitted reply will not be relayed.
    pub fn handle_upstream_reply<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        reply: &[u8],
    ) -> io::Result<Relay> {
        let Some(upstream_id) = read_u16_be(reply, 0) else {
            return Ok(Relay::OutOfWindow);
        };

        if self.ids.wrapping_sub(upstream_id) >= QUEUE_CAPACITY as u16 {
            tracing::trace!(upstream_id, latest = self.ids, "reply outside window");
            return Ok(Relay::OutOfWindow);
        }

        let slot = usize::from(upstream_id & QUEUE_MASK);
        let Some(in_flight) = self.slots[slot].take() else {
            tracing::trace!(upstream_id, slot, "duplicate reply");
            return Ok(Relay::Duplicate);
        };

        let mut octets = BytesMut::from(reply);
        write_u16_be(&mut octets, 0, in_flight.original_id)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidInput, error))?;
        transport.send_to(&octets, in_flight.client)?;

        tracing::trace!(client = %in_flight.client, original_id = in_flight.original_id, upstream_id, "relayed");
        Ok(Relay::Relayed {
            client: in_flight.client,
        })
    }
}
