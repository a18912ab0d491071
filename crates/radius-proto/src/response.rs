//! Building replies on an accounting port
//!
//! Every reply is an Accounting-Response with the request's Identifier and no
//! attributes other than the request's Proxy-State values, echoed in order
//! (RFC 2865 Section 5.33). Replies to Status-Server additionally carry a
//! Message-Authenticator (RFC 5997 Section 3).

use crate::attributes::{Attribute, AttributeType};
use crate::auth::calculate_response_authenticator;
use crate::message_auth::sign_message_authenticator;
use crate::packet::{Code, Packet, PacketError};

fn reply_skeleton(request: &Packet) -> Result<Packet, PacketError> {
    let mut response = Packet::new(Code::AccountingResponse, request.identifier, [0u8; 16]);
    for state in request.proxy_states() {
        response.add_attribute(Attribute::new(
            AttributeType::ProxyState.as_u8(),
            state.value.clone(),
        )?);
    }
    Ok(response)
}

fn seal(mut response: Packet, request: &Packet, secret: &[u8]) -> Result<Packet, PacketError> {
    response.authenticator =
        calculate_response_authenticator(&response, &request.authenticator, secret)?;
    Ok(response)
}

/// Accounting-Response acknowledging an Accounting-Request
pub fn build_accounting_response(request: &Packet, secret: &[u8]) -> Result<Packet, PacketError> {
    let response = reply_skeleton(request)?;
    seal(response, request, secret)
}

/// Accounting-Response answering a Status-Server probe on the accounting port
///
/// The Message-Authenticator is computed first, over the packet with the
/// request's authenticator in place; the Response Authenticator then covers
/// the finished attribute list.
pub fn build_status_server_response(request: &Packet, secret: &[u8]) -> Result<Packet, PacketError> {
    let mut response = reply_skeleton(request)?;
    sign_message_authenticator(&mut response, &request.authenticator, secret)?;
    seal(response, request, secret)
}
