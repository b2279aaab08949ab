//! Building the two kinds of reply the portal synthesises itself.
//!
//! Both echo the query's ID and question back verbatim.  The name is
//! never re-encoded: the answer record points at it with a compression
//! pointer.  Names are capped at 255 octets, so a reply is at most
//! 12 + 259 + 16 octets and always fits in one UDP datagram.

use std::net::Ipv4Addr;

use bytes::BytesMut;
use dns_types::protocol::serialise::WritableBuffer;
use dns_types::protocol::types::*;

/// Length of the RDATA of an A record.
const A_RDLENGTH: u16 = 4;

/// An authoritative answer with a single A record for the question's
/// name.
///
/// The flags of the query are kept (so opcode and RD are echoed) except
/// for QR and AA, which are set, and RA, TC, and RCODE, which are
/// cleared.
pub fn reply_with_ip(query: &Header, question: &[u8], address: Ipv4Addr, ttl: u32) -> BytesMut {
    let header = Header {
        is_response: true,
        is_authoritative: true,
        is_truncated: false,
        recursion_available: false,
        rcode: Rcode::NoError,
        qdcount: 1,
        ancount: 1,
        nscount: 0,
        arcount: 0,
        ..*query
    };

    let mut buffer = WritableBuffer::with_capacity(HEADER_LEN + question.len() + 16);
    header.serialise(&mut buffer);
    buffer.write_octets(question);

    buffer.write_u16(COMPRESSED_QUESTION_NAME);
    RecordType::A.serialise(&mut buffer);
    RecordClass::IN.serialise(&mut buffer);
    buffer.write_u32(ttl);
    buffer.write_u16(A_RDLENGTH);
    buffer.write_octets(&address.octets());

    buffer.octets
}

/// A header-only reply, or a header and the echoed question, with the
/// given error code.
pub fn reply_with_error(query: &Header, rcode: Rcode, question: Option<&[u8]>) -> BytesMut {
    let header = Header {
        is_response: true,
        is_authoritative: false,
        is_truncated: false,
        recursion_available: false,
        rcode,
        qdcount: u16::from(question.is_some()),
        ancount: 0,
        nscount: 0,
        arcount: 0,
        ..*query
    };

    let question = question.unwrap_or_default();
    let mut buffer = WritableBuffer::with_capacity(HEADER_LEN + question.len());
    header.serialise(&mut buffer);
    buffer.write_octets(question);

    buffer.octets
}
