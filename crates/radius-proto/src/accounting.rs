//! RADIUS Accounting Protocol Support (RFC 2866)
//!
//! Typed view of the attributes an accounting server acts on. A packet is
//! turned into an [`AccountingRequest`] once, after its Request Authenticator
//! has been verified, and the record is consumed by the session pipeline.
//!
//! # Example
//!
//! ```rust
//! use radius_proto::accounting::{AccountingRequest, AcctStatusType};
//! use radius_proto::{Attribute, AttributeType, Code, Packet};
//!
//! let mut packet = Packet::new(Code::AccountingRequest, 1, [0u8; 16]);
//! packet.add_attribute(Attribute::integer(AttributeType::AcctStatusType.as_u8(), 1).unwrap());
//! packet.add_attribute(Attribute::string(AttributeType::AcctSessionId.as_u8(), "sess-123").unwrap());
//!
//! let record = AccountingRequest::from_packet(&packet).unwrap();
//! assert_eq!(record.status(), Some(AcctStatusType::Start));
//! assert_eq!(record.session_id, "sess-123");
//! ```

use crate::attributes::{Attribute, AttributeType};
use crate::packet::Packet;
use std::fmt;
use std::net::Ipv4Addr;
use thiserror::Error;
use uuid::Uuid;

/// Accounting Status-Type values handled by this server (RFC 2866 Section 5.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AcctStatusType {
    /// Start (1) - Session has begun
    Start = 1,
    /// Stop (2) - Session has ended
    Stop = 2,
    /// Interim-Update (3) - Periodic update during session
    InterimUpdate = 3,
}

impl AcctStatusType {
    /// Convert from u32 value; Accounting-On/Off and vendor values are `None`
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(AcctStatusType::Start),
            2 => Some(AcctStatusType::Stop),
            3 => Some(AcctStatusType::InterimUpdate),
            _ => None,
        }
    }

    /// Convert to u32 value
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for AcctStatusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcctStatusType::Start => f.write_str("Start"),
            AcctStatusType::Stop => f.write_str("Stop"),
            AcctStatusType::InterimUpdate => f.write_str("Interim-Update"),
        }
    }
}

/// Acct-Terminate-Cause values (RFC 2866 Section 5.10)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AcctTerminateCause {
    UserRequest = 1,
    LostCarrier = 2,
    LostService = 3,
    IdleTimeout = 4,
    SessionTimeout = 5,
    AdminReset = 6,
    AdminReboot = 7,
    PortError = 8,
    NasError = 9,
    NasRequest = 10,
    NasReboot = 11,
    PortUnneeded = 12,
    PortPreempted = 13,
    PortSuspended = 14,
    ServiceUnavailable = 15,
    Callback = 16,
    UserError = 17,
    HostRequest = 18,
}

impl AcctTerminateCause {
    /// Convert from u32 value
    pub fn from_u32(value: u32) -> Option<Self> {
        use AcctTerminateCause::*;
        let cause = match value {
            1 => UserRequest,
            2 => LostCarrier,
            3 => LostService,
            4 => IdleTimeout,
            5 => SessionTimeout,
            6 => AdminReset,
            7 => AdminReboot,
            8 => PortError,
            9 => NasError,
            10 => NasRequest,
            11 => NasReboot,
            12 => PortUnneeded,
            13 => PortPreempted,
            14 => PortSuspended,
            15 => ServiceUnavailable,
            16 => Callback,
            17 => UserError,
            18 => HostRequest,
            _ => return None,
        };
        Some(cause)
    }

    /// Convert to u32 value
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Dictionary name
    pub fn name(self) -> &'static str {
        use AcctTerminateCause::*;
        match self {
            UserRequest => "User-Request",
            LostCarrier => "Lost-Carrier",
            LostService => "Lost-Service",
            IdleTimeout => "Idle-Timeout",
            SessionTimeout => "Session-Timeout",
            AdminReset => "Admin-Reset",
            AdminReboot => "Admin-Reboot",
            PortError => "Port-Error",
            NasError => "NAS-Error",
            NasRequest => "NAS-Request",
            NasReboot => "NAS-Reboot",
            PortUnneeded => "Port-Unneeded",
            PortPreempted => "Port-Preempted",
            PortSuspended => "Port-Suspended",
            ServiceUnavailable => "Service-Unavailable",
            Callback => "Callback",
            UserError => "User-Error",
            HostRequest => "Host-Request",
        }
    }

    /// Name for a raw value, falling back to the number for unknown causes
    pub fn describe(value: u32) -> String {
        match Self::from_u32(value) {
            Some(cause) => cause.name().to_string(),
            None => value.to_string(),
        }
    }
}

/// Errors extracting an [`AccountingRequest`] from a packet
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccountingError {
    /// Missing required attribute
    #[error("Missing required attribute: {0}")]
    MissingAttribute(&'static str),

    /// Invalid attribute value
    #[error("Invalid attribute value for {attribute}: {reason}")]
    InvalidAttributeValue {
        attribute: &'static str,
        reason: String,
    },
}

/// The attributes of one Accounting-Request
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AccountingRequest {
    /// Raw Acct-Status-Type; see [`AccountingRequest::status`]
    pub status_type: u32,
    /// Acct-Session-Id, never empty
    pub session_id: String,
    /// Class exactly as received
    pub class: Option<Vec<u8>>,
    /// Class interpreted as a canonical UUID, lower-case hyphenated
    pub session_uuid: Option<String>,
    /// User-Name when it is valid UTF-8
    pub user_name: Option<String>,
    pub nas_ip: Option<Ipv4Addr>,
    pub nas_identifier: Option<String>,
    pub calling_station_id: Option<String>,
    pub framed_ip: Option<Ipv4Addr>,
    pub input_octets: u32,
    pub output_octets: u32,
    pub session_time: u32,
    pub delay_time: Option<u32>,
    pub terminate_cause: Option<u32>,
    /// Proxy-State values in request order, duplicates preserved
    pub proxy_states: Vec<Vec<u8>>,
}

impl AccountingRequest {
    /// Extract the accounting attributes of a decoded packet
    ///
    /// Acct-Status-Type and a non-empty Acct-Session-Id are required. Only
    /// the first occurrence of single-valued attributes is considered;
    /// unknown attributes are ignored.
    pub fn from_packet(packet: &Packet) -> Result<Self, AccountingError> {
        let status_type = integer(packet, AttributeType::AcctStatusType)?
            .ok_or(AccountingError::MissingAttribute("Acct-Status-Type"))?;

        let session_id = text(packet, AttributeType::AcctSessionId)?
            .filter(|s| !s.is_empty())
            .ok_or(AccountingError::MissingAttribute("Acct-Session-Id"))?;

        let class = packet
            .find_attribute(AttributeType::Class.as_u8())
            .map(|a| a.value.clone());
        let session_uuid = class.as_deref().and_then(parse_class_uuid);

        let user_name = packet
            .find_attribute(AttributeType::UserName.as_u8())
            .and_then(|a| a.as_string().ok());

        Ok(AccountingRequest {
            status_type,
            session_id,
            class,
            session_uuid,
            user_name,
            nas_ip: ipv4(packet, AttributeType::NasIpAddress)?,
            nas_identifier: text(packet, AttributeType::NasIdentifier).ok().flatten(),
            calling_station_id: text(packet, AttributeType::CallingStationId).ok().flatten(),
            framed_ip: ipv4(packet, AttributeType::FramedIpAddress)?,
            input_octets: integer(packet, AttributeType::AcctInputOctets)?.unwrap_or(0),
            output_octets: integer(packet, AttributeType::AcctOutputOctets)?.unwrap_or(0),
            session_time: integer(packet, AttributeType::AcctSessionTime)?.unwrap_or(0),
            delay_time: integer(packet, AttributeType::AcctDelayTime)?,
            terminate_cause: integer(packet, AttributeType::AcctTerminateCause)?,
            proxy_states: packet.proxy_states().map(|a| a.value.clone()).collect(),
        })
    }

    /// The status type if it is one this server handles
    pub fn status(&self) -> Option<AcctStatusType> {
        AcctStatusType::from_u32(self.status_type)
    }
}

/// Interpret a Class value as a session UUID
///
/// Only the canonical 36-character hyphenated form is accepted; anything
/// else (opaque vendor Class values, braced or URN forms) yields `None`.
pub fn parse_class_uuid(value: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(value).ok()?;
    if text.len() != 36 {
        return None;
    }
    Uuid::parse_str(text).ok().map(|uuid| uuid.hyphenated().to_string())
}

fn invalid(attr_type: AttributeType, reason: impl Into<String>) -> AccountingError {
    AccountingError::InvalidAttributeValue {
        attribute: attr_type.name(),
        reason: reason.into(),
    }
}

fn first(packet: &Packet, attr_type: AttributeType) -> Option<&Attribute> {
    packet.find_attribute(attr_type.as_u8())
}

fn integer(packet: &Packet, attr_type: AttributeType) -> Result<Option<u32>, AccountingError> {
    first(packet, attr_type)
        .map(|a| a.as_integer().map_err(|e| invalid(attr_type, e.to_string())))
        .transpose()
}

fn ipv4(packet: &Packet, attr_type: AttributeType) -> Result<Option<Ipv4Addr>, AccountingError> {
    first(packet, attr_type)
        .map(|a| a.as_ipv4().map_err(|e| invalid(attr_type, e.to_string())))
        .transpose()
}

fn text(packet: &Packet, attr_type: AttributeType) -> Result<Option<String>, AccountingError> {
    first(packet, attr_type)
        .map(|a| a.as_string().map_err(|_| invalid(attr_type, "not valid UTF-8")))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Code;

    const UUID: &str = "550e8400-e29b-41d4-a716-446655440000";

    fn packet_with(attrs: Vec<Attribute>) -> Packet {
        let mut packet = Packet::new(Code::AccountingRequest, 1, [0u8; 16]);
        for attr in attrs {
            packet.add_attribute(attr);
        }
        packet
    }

    fn status(value: u32) -> Attribute {
        Attribute::integer(AttributeType::AcctStatusType.as_u8(), value).unwrap()
    }

    fn session_id(value: &str) -> Attribute {
        Attribute::string(AttributeType::AcctSessionId.as_u8(), value).unwrap()
    }

    #[test]
    fn test_full_interim_record() {
        let packet = packet_with(vec![
            status(3),
            session_id("sess-123"),
            Attribute::string(AttributeType::Class.as_u8(), UUID).unwrap(),
            Attribute::string(AttributeType::UserName.as_u8(), "0001010123456789@wlan.example").unwrap(),
            Attribute::ipv4(AttributeType::NasIpAddress.as_u8(), Ipv4Addr::new(192, 168, 1, 1)).unwrap(),
            Attribute::ipv4(AttributeType::FramedIpAddress.as_u8(), Ipv4Addr::new(10, 0, 0, 1)).unwrap(),
            Attribute::integer(AttributeType::AcctInputOctets.as_u8(), 1000).unwrap(),
            Attribute::integer(AttributeType::AcctOutputOctets.as_u8(), 2000).unwrap(),
            Attribute::integer(AttributeType::AcctSessionTime.as_u8(), 60).unwrap(),
        ]);

        let record = AccountingRequest::from_packet(&packet).unwrap();
        assert_eq!(record.status(), Some(AcctStatusType::InterimUpdate));
        assert_eq!(record.session_id, "sess-123");
        assert_eq!(record.session_uuid.as_deref(), Some(UUID));
        assert_eq!(record.nas_ip, Some(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(record.framed_ip, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!((record.input_octets, record.output_octets, record.session_time), (1000, 2000, 60));
        assert!(record.proxy_states.is_empty());
    }

    #[test]
    fn test_missing_status_type() {
        let packet = packet_with(vec![session_id("sess-123")]);
        assert_eq!(
            AccountingRequest::from_packet(&packet),
            Err(AccountingError::MissingAttribute("Acct-Status-Type"))
        );
    }

    #[test]
    fn test_missing_or_empty_session_id() {
        let packet = packet_with(vec![status(1)]);
        assert_eq!(
            AccountingRequest::from_packet(&packet),
            Err(AccountingError::MissingAttribute("Acct-Session-Id"))
        );

        let packet = packet_with(vec![status(1), session_id("")]);
        assert!(AccountingRequest::from_packet(&packet).is_err());
    }

    #[test]
    fn test_short_counter_is_typed_error() {
        let packet = packet_with(vec![
            status(3),
            session_id("s"),
            Attribute::new(AttributeType::AcctInputOctets.as_u8(), vec![0, 1]).unwrap(),
        ]);
        assert!(matches!(
            AccountingRequest::from_packet(&packet),
            Err(AccountingError::InvalidAttributeValue { attribute: "Acct-Input-Octets", .. })
        ));
    }

    #[test]
    fn test_only_first_status_type_counts() {
        let packet = packet_with(vec![status(2), session_id("s"), status(1)]);
        assert_eq!(
            AccountingRequest::from_packet(&packet).unwrap().status(),
            Some(AcctStatusType::Stop)
        );
    }

    #[test]
    fn test_unknown_status_type_is_not_a_parse_error() {
        let packet = packet_with(vec![status(7), session_id("s")]);
        let record = AccountingRequest::from_packet(&packet).unwrap();
        assert_eq!(record.status_type, 7);
        assert_eq!(record.status(), None);
    }

    #[test]
    fn test_non_uuid_class_leaves_uuid_empty() {
        let packet = packet_with(vec![
            status(1),
            session_id("s"),
            Attribute::new(AttributeType::Class.as_u8(), vec![0xff, 0x00, 0x12]).unwrap(),
        ]);
        let record = AccountingRequest::from_packet(&packet).unwrap();
        assert_eq!(record.class, Some(vec![0xff, 0x00, 0x12]));
        assert_eq!(record.session_uuid, None);
    }

    #[test]
    fn test_class_uuid_canonical_form_only() {
        assert_eq!(parse_class_uuid(UUID.as_bytes()).as_deref(), Some(UUID));
        assert_eq!(
            parse_class_uuid(UUID.to_uppercase().as_bytes()).as_deref(),
            Some(UUID)
        );
        assert_eq!(parse_class_uuid(b"550e8400e29b41d4a716446655440000"), None);
        assert_eq!(parse_class_uuid(b"not-a-uuid"), None);
    }

    #[test]
    fn test_proxy_states_preserved() {
        let packet = packet_with(vec![
            Attribute::new(AttributeType::ProxyState.as_u8(), b"P1".to_vec()).unwrap(),
            status(1),
            session_id("s"),
            Attribute::new(AttributeType::ProxyState.as_u8(), b"P2".to_vec()).unwrap(),
        ]);
        let record = AccountingRequest::from_packet(&packet).unwrap();
        assert_eq!(record.proxy_states, vec![b"P1".to_vec(), b"P2".to_vec()]);
    }

    #[test]
    fn test_terminate_cause_names() {
        assert_eq!(AcctTerminateCause::describe(4), "Idle-Timeout");
        assert_eq!(AcctTerminateCause::describe(99), "99");
        assert_eq!(AcctTerminateCause::from_u32(1), Some(AcctTerminateCause::UserRequest));
    }
}
