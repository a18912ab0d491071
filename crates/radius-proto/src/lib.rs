//! RADIUS wire format for an accounting server
//!
//! Packet and attribute codec (RFC 2865), accounting authenticators and the
//! accounting attribute set (RFC 2866), Message-Authenticator (RFC 2869 /
//! RFC 3579) and Status-Server replies (RFC 5997).
//!
//! # Example
//!
//! ```rust
//! use radius_proto::{Attribute, AttributeType, Code, Packet};
//! use radius_proto::auth::{
//!     calculate_accounting_request_authenticator, verify_accounting_request_authenticator,
//! };
//!
//! let mut packet = Packet::new(Code::AccountingRequest, 1, [0u8; 16]);
//! packet.add_attribute(Attribute::integer(AttributeType::AcctStatusType.as_u8(), 1).unwrap());
//! packet.add_attribute(Attribute::string(AttributeType::AcctSessionId.as_u8(), "s1").unwrap());
//! packet.authenticator = calculate_accounting_request_authenticator(&packet, b"secret").unwrap();
//!
//! let bytes = packet.encode().unwrap();
//! assert!(verify_accounting_request_authenticator(&bytes, b"secret"));
//! ```

pub mod accounting;
pub mod attributes;
pub mod auth;
pub mod message_auth;
pub mod packet;
pub mod response;

pub use accounting::{AccountingError, AccountingRequest, AcctStatusType, AcctTerminateCause};
pub use attributes::{Attribute, AttributeType};
pub use auth::{
    calculate_accounting_request_authenticator, calculate_response_authenticator,
    generate_request_authenticator, verify_accounting_request_authenticator,
    verify_response_authenticator,
};
pub use message_auth::{
    calculate_message_authenticator, sign_message_authenticator, verify_message_authenticator,
};
pub use packet::{Code, Packet, PacketError};
pub use response::{build_accounting_response, build_status_server_response};
