use crate::packet::PacketError;
use std::net::Ipv4Addr;

/// RADIUS Attribute structure as defined in RFC 2865 Section 5
///
/// ```text
///  0                   1                   2
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |     Type      |    Length     |  Value ...
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Values are kept as raw octets; Proxy-State and Class in particular are
/// opaque and must be echoed or interpreted byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// Attribute type (1 byte)
    pub attr_type: u8,
    /// Attribute value (0-253 bytes)
    pub value: Vec<u8>,
}

impl Attribute {
    /// Minimum attribute length (type + length fields = 2 bytes)
    pub const MIN_LENGTH: usize = 2;
    /// Maximum attribute length (255 bytes including type and length)
    pub const MAX_LENGTH: usize = 255;
    /// Maximum value length (253 bytes)
    pub const MAX_VALUE_LENGTH: usize = 253;

    pub fn new(attr_type: u8, value: Vec<u8>) -> Result<Self, PacketError> {
        if value.len() > Self::MAX_VALUE_LENGTH {
            return Err(PacketError::AttributeError(format!(
                "Attribute value too long: {} bytes (max {})",
                value.len(),
                Self::MAX_VALUE_LENGTH
            )));
        }
        Ok(Attribute { attr_type, value })
    }

    /// Create a string attribute
    pub fn string(attr_type: u8, value: impl Into<String>) -> Result<Self, PacketError> {
        Self::new(attr_type, value.into().into_bytes())
    }

    /// Create an integer attribute (32-bit big-endian)
    pub fn integer(attr_type: u8, value: u32) -> Result<Self, PacketError> {
        Self::new(attr_type, value.to_be_bytes().to_vec())
    }

    /// Create an IPv4 address attribute
    pub fn ipv4(attr_type: u8, value: Ipv4Addr) -> Result<Self, PacketError> {
        Self::new(attr_type, value.octets().to_vec())
    }

    /// Encode attribute to bytes
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let length = self.encoded_length();
        if length > Self::MAX_LENGTH {
            return Err(PacketError::AttributeError(format!(
                "Encoded attribute too long: {} bytes",
                length
            )));
        }

        let mut buffer = Vec::with_capacity(length);
        buffer.push(self.attr_type);
        buffer.push(length as u8);
        buffer.extend_from_slice(&self.value);

        Ok(buffer)
    }

    /// Decode the attribute at the start of `data`
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < Self::MIN_LENGTH {
            return Err(PacketError::AttributeError(format!(
                "Attribute data too short: {} bytes",
                data.len()
            )));
        }

        let attr_type = data[0];
        let length = data[1] as usize;

        if length < Self::MIN_LENGTH {
            return Err(PacketError::AttributeError(format!(
                "Invalid attribute length: {}",
                length
            )));
        }

        if data.len() < length {
            return Err(PacketError::AttributeError(format!(
                "Insufficient data for attribute {}: expected {}, got {}",
                attr_type,
                length,
                data.len()
            )));
        }

        Ok(Attribute {
            attr_type,
            value: data[Self::MIN_LENGTH..length].to_vec(),
        })
    }

    /// Get the encoded length of this attribute
    pub fn encoded_length(&self) -> usize {
        Self::MIN_LENGTH + self.value.len()
    }

    /// Try to interpret value as a UTF-8 string
    pub fn as_string(&self) -> Result<String, std::string::FromUtf8Error> {
        String::from_utf8(self.value.clone())
    }

    /// Borrow the value as UTF-8 without copying
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }

    /// Try to interpret value as an integer (32-bit big-endian)
    pub fn as_integer(&self) -> Result<u32, PacketError> {
        let bytes: [u8; 4] = self.value.as_slice().try_into().map_err(|_| {
            PacketError::AttributeError(format!(
                "Expected 4 bytes for integer, got {}",
                self.value.len()
            ))
        })?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Try to interpret value as an IPv4 address
    pub fn as_ipv4(&self) -> Result<Ipv4Addr, PacketError> {
        let bytes: [u8; 4] = self.value.as_slice().try_into().map_err(|_| {
            PacketError::AttributeError(format!(
                "Expected 4 bytes for IPv4, got {}",
                self.value.len()
            ))
        })?;
        Ok(Ipv4Addr::from(bytes))
    }
}
