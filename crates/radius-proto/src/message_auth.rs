//! Message-Authenticator Support (RFC 2869 Section 5.14, RFC 3579 Section 3.2)
//!
//! Message-Authenticator is HMAC-MD5 keyed with the shared secret over the
//! whole packet, computed with the attribute's own 16 octets set to zero.
//! RFC 5997 makes it mandatory on Status-Server and on the reply to it.
//!
//! For requests the authenticator field holds the Request Authenticator. For
//! responses the HMAC is computed while the field still holds the Request
//! Authenticator of the packet being answered; the Response Authenticator is
//! calculated afterwards, over the final attribute bytes.

use crate::attributes::{Attribute, AttributeType};
use crate::packet::{Packet, PacketError};
use hmac::{Hmac, Mac};
use md5_digest::Md5;

type HmacMd5 = Hmac<Md5>;

/// Length of the Message-Authenticator value
pub const MESSAGE_AUTHENTICATOR_LENGTH: usize = 16;

fn new_mac(secret: &[u8]) -> HmacMd5 {
    HmacMd5::new_from_slice(secret).expect("HMAC can take key of any size")
}

/// Calculate Message-Authenticator for a RADIUS packet
///
/// `packet_bytes` must already have the Message-Authenticator value zeroed.
pub fn calculate_message_authenticator(packet_bytes: &[u8], secret: &[u8]) -> [u8; 16] {
    let mut mac = new_mac(secret);
    mac.update(packet_bytes);
    let bytes = mac.finalize().into_bytes();

    let mut output = [0u8; 16];
    output.copy_from_slice(&bytes);
    output
}

/// Locate the value of the first Message-Authenticator in a raw datagram
///
/// Returns the byte offset of the 16-octet value, `Ok(None)` when the packet
/// carries no Message-Authenticator, and an error when the attribute list is
/// malformed or the attribute has the wrong length.
pub fn find_message_authenticator(data: &[u8]) -> Result<Option<usize>, PacketError> {
    let length = Packet::declared_length(data)?;
    let mut offset = Packet::MIN_PACKET_SIZE;

    while offset < length {
        let attr = Attribute::decode(&data[offset..length])?;
        if attr.attr_type == AttributeType::MessageAuthenticator.as_u8() {
            if attr.value.len() != MESSAGE_AUTHENTICATOR_LENGTH {
                return Err(PacketError::AttributeError(format!(
                    "Message-Authenticator must be {} bytes, got {}",
                    MESSAGE_AUTHENTICATOR_LENGTH,
                    attr.value.len()
                )));
            }
            return Ok(Some(offset + Attribute::MIN_LENGTH));
        }
        offset += attr.encoded_length();
    }

    Ok(None)
}

/// Verify the Message-Authenticator of a received datagram
///
/// Returns `false` when the attribute is missing, malformed or does not
/// match. The comparison is constant-time.
pub fn verify_message_authenticator(data: &[u8], secret: &[u8]) -> bool {
    let offset = match find_message_authenticator(data) {
        Ok(Some(offset)) => offset,
        _ => return false,
    };
    let length = match Packet::declared_length(data) {
        Ok(length) => length,
        Err(_) => return false,
    };

    let received = &data[offset..offset + MESSAGE_AUTHENTICATOR_LENGTH];

    let mut zeroed = data[..length].to_vec();
    zeroed[offset..offset + MESSAGE_AUTHENTICATOR_LENGTH].fill(0);

    let mut mac = new_mac(secret);
    mac.update(&zeroed);
    mac.verify_slice(received).is_ok()
}

/// Add (or refresh) the Message-Authenticator of an outgoing packet
///
/// The attribute is appended when absent. Its value is computed with the
/// authenticator field temporarily set to `authenticator`: the packet's own
/// Request Authenticator for a request, the Request Authenticator of the
/// packet being answered for a response. `packet.authenticator` itself is
/// left untouched.
pub fn sign_message_authenticator(
    packet: &mut Packet,
    authenticator: &[u8; 16],
    secret: &[u8],
) -> Result<(), PacketError> {
    let attr_type = AttributeType::MessageAuthenticator.as_u8();
    let index = match packet.attributes.iter().position(|a| a.attr_type == attr_type) {
        Some(index) => {
            packet.attributes[index].value = vec![0u8; MESSAGE_AUTHENTICATOR_LENGTH];
            index
        }
        None => {
            packet.add_attribute(Attribute::new(attr_type, vec![0u8; MESSAGE_AUTHENTICATOR_LENGTH])?);
            packet.attributes.len() - 1
        }
    };

    let encoded = packet.encode_with_authenticator(authenticator)?;
    let mac = calculate_message_authenticator(&encoded, secret);
    packet.attributes[index].value = mac.to_vec();

    Ok(())
}
