//! Request and Response Authenticators (RFC 2865 Section 3, RFC 2866 Section 3)

use crate::packet::{Packet, PacketError};
use rand::Rng;

/// Generate a random Request Authenticator (16 bytes) per RFC 2865 Section 3
///
/// Used for Status-Server requests, whose authenticator is random rather than
/// derived from the shared secret.
pub fn generate_request_authenticator() -> [u8; 16] {
    let mut rng = rand::rng();
    let mut authenticator = [0u8; 16];
    rng.fill(&mut authenticator);
    authenticator
}

/// MD5(Code + ID + Length + `authenticator` + Attributes + Secret) over an
/// already-encoded packet, substituting the authenticator field.
fn digest_with_authenticator(encoded: &[u8], authenticator: &[u8; 16], secret: &[u8]) -> [u8; 16] {
    let mut ctx = md5::Context::new();
    ctx.consume(&encoded[..Packet::AUTHENTICATOR_OFFSET]);
    ctx.consume(authenticator);
    ctx.consume(&encoded[Packet::MIN_PACKET_SIZE..]);
    ctx.consume(secret);
    ctx.compute().0
}

/// Calculate the Request Authenticator of an Accounting-Request (RFC 2866 Section 3)
///
/// Request Authenticator = MD5(Code + ID + Length + 16 zero octets + Attributes + Secret)
pub fn calculate_accounting_request_authenticator(
    packet: &Packet,
    secret: &[u8],
) -> Result<[u8; 16], PacketError> {
    let encoded = packet.encode_with_authenticator(&[0u8; 16])?;
    Ok(digest_with_authenticator(&encoded, &[0u8; 16], secret))
}

/// Verify the Request Authenticator of a received Accounting-Request
///
/// Works on the datagram as received so the hash covers exactly the bytes the
/// NAS signed, not a re-encoding of them. Padding past the Length field is
/// excluded. Returns `false` for anything that is not a well-framed packet.
pub fn verify_accounting_request_authenticator(data: &[u8], secret: &[u8]) -> bool {
    let length = match Packet::declared_length(data) {
        Ok(length) => length,
        Err(_) => return false,
    };
    let packet = &data[..length];

    let received = &packet[Packet::AUTHENTICATOR_OFFSET..Packet::MIN_PACKET_SIZE];
    let expected = digest_with_authenticator(packet, &[0u8; 16], secret);

    constant_time_eq(received, &expected)
}

/// Calculate Response Authenticator per RFC 2865 Section 3
///
/// Response Authenticator = MD5(Code + ID + Length + Request Authenticator + Attributes + Secret)
pub fn calculate_response_authenticator(
    packet: &Packet,
    request_authenticator: &[u8; 16],
    secret: &[u8],
) -> Result<[u8; 16], PacketError> {
    let encoded = packet.encode_with_authenticator(request_authenticator)?;
    Ok(digest_with_authenticator(&encoded, request_authenticator, secret))
}

/// Verify Response Authenticator
///
/// Verifies that the Response Authenticator matches the expected value
/// calculated from the request and secret.
pub fn verify_response_authenticator(
    response: &Packet,
    request_authenticator: &[u8; 16],
    secret: &[u8],
) -> bool {
    match calculate_response_authenticator(response, request_authenticator, secret) {
        Ok(calculated) => constant_time_eq(&response.authenticator, &calculated),
        Err(_) => false,
    }
}

/// Constant-time comparison of two byte slices
///
/// Every byte is visited regardless of where the first difference is, so the
/// time taken does not reveal how much of an authenticator was guessed right.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
