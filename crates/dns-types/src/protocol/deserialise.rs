//! Deserialisation of DNS messages from the network.  See the `types`
//! module for details of the format.

use crate::protocol::types::*;

impl Header {
    /// Decode the header from the start of a datagram.  Anything after
    /// the first 12 octets is ignored.
    ///
    /// # Errors
    ///
    /// If there are fewer than 12 octets.
    pub fn from_octets(octets: &[u8]) -> Result<Self, Error> {
        Self::deserialise(&mut ConsumableBuffer::new(octets))
    }

    /// # Errors
    ///
    /// If the header is too short.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let id = buffer.next_u16().ok_or(Error::HeaderTooShort)?;
        let flags1 = buffer.next_u8().ok_or(Error::HeaderTooShort)?;
        let flags2 = buffer.next_u8().ok_or(Error::HeaderTooShort)?;
        let qdcount = buffer.next_u16().ok_or(Error::HeaderTooShort)?;
        let ancount = buffer.next_u16().ok_or(Error::HeaderTooShort)?;
        let nscount = buffer.next_u16().ok_or(Error::HeaderTooShort)?;
        let arcount = buffer.next_u16().ok_or(Error::HeaderTooShort)?;

        Ok(Self {
            id,
            is_response: flags1 & HEADER_MASK_QR != 0,
            opcode: Opcode::from((flags1 & HEADER_MASK_OPCODE) >> HEADER_OFFSET_OPCODE),
            is_authoritative: flags1 & HEADER_MASK_AA != 0,
            is_truncated: flags1 & HEADER_MASK_TC != 0,
            recursion_desired: flags1 & HEADER_MASK_RD != 0,
            recursion_available: flags2 & HEADER_MASK_RA != 0,
            rcode: Rcode::from((flags2 & HEADER_MASK_RCODE) >> HEADER_OFFSET_RCODE),
            qdcount,
            ancount,
            nscount,
            arcount,
        })
    }
}

impl<'a> Question<'a> {
    /// Parse a single question without copying it.  Compression
    /// pointers are rejected: the question is the first thing after
    /// the header, so there is nothing earlier for one to point to.
    ///
    /// # Errors
    ///
    /// If the question cannot be parsed.
    pub fn deserialise(buffer: &mut ConsumableBuffer<'a>) -> Result<Self, Error> {
        let start = buffer.position;

        loop {
            let size = buffer.next_u8().ok_or(Error::DomainTooShort)?;

            if usize::from(size) > LABEL_MAX_LEN {
                return Err(Error::DomainLabelInvalid);
            }

            if size == 0 {
                break;
            }

            if buffer.take(usize::from(size)).is_none() {
                return Err(Error::DomainTooShort);
            }

            if buffer.position - start > DOMAINNAME_MAX_LEN {
                return Err(Error::DomainTooLong);
            }
        }

        let name_len = buffer.position - start;
        if name_len > DOMAINNAME_MAX_LEN {
            return Err(Error::DomainTooLong);
        }

        let qtype = QueryType::deserialise(buffer)?;
        let qclass = QueryClass::deserialise(buffer)?;

        Ok(Question::new(
            &buffer.octets[start..buffer.position],
            name_len,
            qtype,
            qclass,
        ))
    }
}

impl QueryType {
    /// # Errors
    ///
    /// If the query type is too short.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let value = buffer.next_u16().ok_or(Error::QuestionTooShort)?;
        Ok(Self::from(value))
    }
}

impl QueryClass {
    /// # Errors
    ///
    /// If the query class is too short.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let value = buffer.next_u16().ok_or(Error::QuestionTooShort)?;
        Ok(Self::from(value))
    }
}

/// Read a big-endian `u16` at the given offset, if there are enough
/// octets.
pub fn read_u16_be(octets: &[u8], offset: usize) -> Option<u16> {
    let pair = octets.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_be_bytes([pair[0], pair[1]]))
}

/// Errors encountered when parsing a datagram.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// The datagram is shorter than the fixed header.  No reply can
    /// safely be built from it.
    HeaderTooShort,

    /// A question ends with an incomplete field.
    QuestionTooShort,

    /// A domain is incomplete.
    DomainTooShort,

    /// A domain is over 255 octets in size.
    DomainTooLong,

    /// A domain label is longer than 63 octets (which includes
    /// compression pointers).
    DomainLabelInvalid,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::HeaderTooShort => write!(f, "datagram shorter than header"),
            Error::QuestionTooShort => write!(f, "question ends with an incomplete field"),
            Error::DomainTooShort => write!(f, "domain name is incomplete"),
            Error::DomainTooLong => write!(f, "domain name is over {DOMAINNAME_MAX_LEN} octets"),
            Error::DomainLabelInvalid => write!(f, "domain label is invalid"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// A buffer which will be consumed by the parsing process.
pub struct ConsumableBuffer<'a> {
    octets: &'a [u8],
    position: usize,
}

impl<'a> ConsumableBuffer<'a> {
    pub fn new(octets: &'a [u8]) -> Self {
        Self {
            octets,
            position: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn next_u8(&mut self) -> Option<u8> {
        if self.octets.len() > self.position {
            let a = self.octets[self.position];
            self.position += 1;
            Some(a)
        } else {
            None
        }
    }

    pub fn next_u16(&mut self) -> Option<u16> {
        let value = read_u16_be(self.octets, self.position)?;
        self.position += 2;
        Some(value)
    }

    pub fn take(&mut self, size: usize) -> Option<&'a [u8]> {
        if self.octets.len() >= self.position + size {
            let slice = &self.octets[self.position..self.position + size];
            self.position += size;
            Some(slice)
        } else {
            None
        }
    }
}
