use std::io::Cursor;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};

use crate::error::{DecodeError, ProtocolError};

/// Byte-size of an `OfpHeader` on the wire.
pub const OFP_HEADER_SIZE: usize = 8;

/// Message type codes that keep the same value in every OpenFlow version.
///
/// The engine handles these itself, before any version-specific codec is involved.
pub mod type_code {
    pub const HELLO: u8 = 0;
    pub const ERROR: u8 = 1;
    pub const ECHO_REQUEST: u8 = 2;
    pub const ECHO_REPLY: u8 = 3;
}

/// OpenFlow Header
///
/// The first fields of every OpenFlow message, no matter the protocol version.
/// This is parsed to determine version and length of the remaining message, so that
/// it can be properly handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfpHeader {
    version: u8,
    typ: u8,
    length: u16,
    xid: u32,
}

impl OfpHeader {
    /// Create an `OfpHeader` out of the arguments.
    pub fn new(version: u8, typ: u8, length: u16, xid: u32) -> OfpHeader {
        OfpHeader {
            version,
            typ,
            length,
            xid,
        }
    }

    /// Return the byte-size of an `OfpHeader`.
    pub fn size() -> usize {
        OFP_HEADER_SIZE
    }

    /// Return the wire representation of the header.
    pub fn to_bytes(&self) -> [u8; OFP_HEADER_SIZE] {
        let mut buf = [0; OFP_HEADER_SIZE];
        buf[0] = self.version;
        buf[1] = self.typ;
        BigEndian::write_u16(&mut buf[2..4], self.length);
        BigEndian::write_u32(&mut buf[4..8], self.xid);
        buf
    }

    /// Append the header fields to a message buffer.
    pub fn marshal(&self, bytes: &mut Vec<u8>) {
        bytes.extend_from_slice(&self.to_bytes());
    }

    /// Parse the header at the start of `buf`.
    ///
    /// Fails if fewer than `OFP_HEADER_SIZE` bytes are available or if the length field
    /// claims a frame shorter than the header itself.
    pub fn parse(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < OFP_HEADER_SIZE {
            return Err(DecodeError::Truncated {
                what: "header",
                needed: OFP_HEADER_SIZE,
                available: buf.len(),
            }
            .into());
        }
        let mut bytes = Cursor::new(&buf[..OFP_HEADER_SIZE]);
        let header = OfpHeader {
            version: bytes.read_u8().map_err(DecodeError::from)?,
            typ: bytes.read_u8().map_err(DecodeError::from)?,
            length: bytes.read_u16::<BigEndian>().map_err(DecodeError::from)?,
            xid: bytes.read_u32::<BigEndian>().map_err(DecodeError::from)?,
        };
        if header.length() < OFP_HEADER_SIZE {
            return Err(ProtocolError::BadLength {
                length: header.length,
            });
        }
        Ok(header)
    }

    /// Return the `version` field of a header.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Return the raw OpenFlow message type code of a header.
    pub fn type_code(&self) -> u8 {
        self.typ
    }

    /// Return the `length` field of a header. Includes the length of the header itself.
    pub fn length(&self) -> usize {
        self.length as usize
    }

    /// Return the number of body bytes following the header.
    pub fn body_length(&self) -> usize {
        self.length().saturating_sub(OFP_HEADER_SIZE)
    }

    /// Return the `xid` field of a header, the transaction id associated with this packet.
    ///  Replies use the same id to facilitate pairing.
    pub fn xid(&self) -> u32 {
        self.xid
    }
}
