use super::Code;
use crate::attributes::{Attribute, AttributeType};
use std::io::{self, Cursor, Read, Write};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PacketError {
    #[error("Invalid packet length: {0}")]
    InvalidLength(usize),
    #[error("Invalid packet code: {0}")]
    InvalidCode(u8),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Attribute error: {0}")]
    AttributeError(String),
    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),
}

/// RADIUS Packet structure as defined in RFC 2865 Section 3
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |     Code      |  Identifier   |            Length             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                                                               |
/// |                         Authenticator                         |
/// |                                                               |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Attributes ...
/// +-+-+-+-+-+-+-+-+-+-+-+-+-
/// ```
#[derive(Debug, Clone)]
pub struct Packet {
    /// Packet type (1 byte)
    pub code: Code,
    /// Packet identifier for matching requests/responses (1 byte)
    pub identifier: u8,
    /// Request or Response Authenticator (16 bytes)
    pub authenticator: [u8; 16],
    /// Attributes in wire order
    pub attributes: Vec<Attribute>,
}

impl Packet {
    /// Minimum RADIUS packet size (20 bytes: 1 code + 1 id + 2 length + 16 authenticator)
    pub const MIN_PACKET_SIZE: usize = 20;
    /// Maximum RADIUS packet size (4096 bytes as per RFC 2865)
    pub const MAX_PACKET_SIZE: usize = 4096;
    /// Offset of the authenticator field in an encoded packet
    pub const AUTHENTICATOR_OFFSET: usize = 4;

    pub fn new(code: Code, identifier: u8, authenticator: [u8; 16]) -> Self {
        Packet {
            code,
            identifier,
            authenticator,
            attributes: Vec::new(),
        }
    }

    pub fn add_attribute(&mut self, attribute: Attribute) {
        self.attributes.push(attribute);
    }

    /// Encode packet to bytes
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        self.encode_with_authenticator(&self.authenticator)
    }

    /// Encode the packet with `authenticator` in place of its own.
    ///
    /// Authenticator and Message-Authenticator computations hash the packet
    /// with a substituted authenticator field; this avoids cloning the packet
    /// just to swap sixteen bytes.
    pub fn encode_with_authenticator(&self, authenticator: &[u8; 16]) -> Result<Vec<u8>, PacketError> {
        let mut buffer = Vec::with_capacity(self.length());

        buffer.write_all(&[self.code.as_u8(), self.identifier])?;

        // Length is filled in once the attributes are written
        let length_pos = buffer.len();
        buffer.write_all(&[0, 0])?;

        buffer.write_all(authenticator)?;

        for attr in &self.attributes {
            let attr_bytes = attr.encode()?;
            buffer.write_all(&attr_bytes)?;
        }

        let total_length = buffer.len();
        if total_length > Self::MAX_PACKET_SIZE {
            return Err(PacketError::PacketTooLarge(total_length));
        }

        buffer[length_pos..length_pos + 2].copy_from_slice(&(total_length as u16).to_be_bytes());

        Ok(buffer)
    }

    /// Read the Length field of a raw datagram and check it against the
    /// RFC 2865 bounds and the number of bytes actually received.
    ///
    /// Octets beyond Length are padding and must be ignored (RFC 2865 Section 3).
    pub fn declared_length(data: &[u8]) -> Result<usize, PacketError> {
        if data.len() < Self::MIN_PACKET_SIZE {
            return Err(PacketError::InvalidLength(data.len()));
        }

        let length = u16::from_be_bytes([data[2], data[3]]) as usize;
        if !(Self::MIN_PACKET_SIZE..=Self::MAX_PACKET_SIZE).contains(&length) {
            return Err(PacketError::InvalidLength(length));
        }
        if data.len() < length {
            return Err(PacketError::InvalidLength(data.len()));
        }

        Ok(length)
    }

    /// Decode packet from bytes
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        let length = Self::declared_length(data)?;
        let mut cursor = Cursor::new(&data[..length]);

        let mut header = [0u8; 4];
        cursor.read_exact(&mut header)?;
        let code = Code::from_u8(header[0]).ok_or(PacketError::InvalidCode(header[0]))?;
        let identifier = header[1];

        let mut authenticator = [0u8; 16];
        cursor.read_exact(&mut authenticator)?;

        let mut attributes = Vec::new();
        let mut attr_data = &data[Self::MIN_PACKET_SIZE..length];

        while !attr_data.is_empty() {
            let attr = Attribute::decode(attr_data)?;
            let attr_len = attr.encoded_length();
            attributes.push(attr);
            attr_data = &attr_data[attr_len..];
        }

        Ok(Packet {
            code,
            identifier,
            authenticator,
            attributes,
        })
    }

    /// Get the length of the encoded packet
    pub fn length(&self) -> usize {
        Self::MIN_PACKET_SIZE
            + self
                .attributes
                .iter()
                .map(Attribute::encoded_length)
                .sum::<usize>()
    }

    /// Find first attribute by type
    pub fn find_attribute(&self, attr_type: u8) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.attr_type == attr_type)
    }

    /// Find all attributes by type, in wire order
    pub fn find_all_attributes(&self, attr_type: u8) -> Vec<&Attribute> {
        self.attributes
            .iter()
            .filter(|a| a.attr_type == attr_type)
            .collect()
    }

    /// Proxy-State attributes (RFC 2865 Section 5.33) in the order received
    pub fn proxy_states(&self) -> impl Iterator<Item = &Attribute> {
        self.attributes
            .iter()
            .filter(|a| a.attr_type == AttributeType::ProxyState.as_u8())
    }
}
