//! Serialisation of DNS messages to the wire format.  See the `types`
//! module for details of the format.

use bytes::{BufMut, BytesMut};

use crate::protocol::types::*;

impl Header {
    /// Encode the header.  Every field has a representation, so this
    /// cannot fail.
    pub fn to_octets(&self) -> [u8; HEADER_LEN] {
        let mut buffer = WritableBuffer::with_capacity(HEADER_LEN);
        self.serialise(&mut buffer);

        let mut octets = [0; HEADER_LEN];
        octets.copy_from_slice(&buffer.octets);
        octets
    }

    pub fn serialise(&self, buffer: &mut WritableBuffer) {
        // octet 1
        let flag_qr = if self.is_response { HEADER_MASK_QR } else { 0 };
        let field_opcode = HEADER_MASK_OPCODE & (u8::from(self.opcode) << HEADER_OFFSET_OPCODE);
        let flag_aa = if self.is_authoritative {
            HEADER_MASK_AA
        } else {
            0
        };
        let flag_tc = if self.is_truncated { HEADER_MASK_TC } else { 0 };
        let flag_rd = if self.recursion_desired {
            HEADER_MASK_RD
        } else {
            0
        };
        // octet 2 (Z is always zero)
        let flag_ra = if self.recursion_available {
            HEADER_MASK_RA
        } else {
            0
        };
        let field_rcode = HEADER_MASK_RCODE & (u8::from(self.rcode) << HEADER_OFFSET_RCODE);

        buffer.write_u16(self.id);
        buffer.write_u8(flag_qr | field_opcode | flag_aa | flag_tc | flag_rd);
        buffer.write_u8(flag_ra | field_rcode);
        buffer.write_u16(self.qdcount);
        buffer.write_u16(self.ancount);
        buffer.write_u16(self.nscount);
        buffer.write_u16(self.arcount);
    }
}

impl QueryType {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

impl QueryClass {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

impl RecordType {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

impl RecordClass {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

/// Overwrite a big-endian `u16` at the given offset.
///
/// # Errors
///
/// If the buffer does not extend past `offset + 1`.
pub fn write_u16_be(octets: &mut [u8], offset: usize, value: u16) -> Result<(), Error> {
    let len = octets.len();
    if offset >= len || len - offset < 2 {
        return Err(Error::BufferTooShort { offset, len });
    }

    octets[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    Ok(())
}

/// Errors encountered when serialising a message.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// A field was to be written past the end of the buffer.
    BufferTooShort { offset: usize, len: usize },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::BufferTooShort { offset, len } => {
                write!(f, "cannot write a u16 at offset {offset} of a {len} octet buffer")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// A buffer which can be written to, for serialisation purposes.
pub struct WritableBuffer {
    pub octets: BytesMut,
}

impl Default for WritableBuffer {
    fn default() -> Self {
        Self::with_capacity(UDP_MAX_LEN)
    }
}

impl WritableBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            octets: BytesMut::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, octet: u8) {
        self.octets.put_u8(octet);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_octets(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_octets(&value.to_be_bytes());
    }

    pub fn write_octets(&mut self, octets: &[u8]) {
        self.octets.put_slice(octets);
    }
}
