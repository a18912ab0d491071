/// RADIUS attribute types seen on an accounting listener
///
/// Types not listed here are carried through decoding untouched and ignored
/// by the accounting record extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AttributeType {
    /// User-Name (1) - RFC 2865
    UserName = 1,
    /// NAS-IP-Address (4) - RFC 2865
    NasIpAddress = 4,
    /// NAS-Port (5) - RFC 2865
    NasPort = 5,
    /// Service-Type (6) - RFC 2865
    ServiceType = 6,
    /// Framed-IP-Address (8) - RFC 2865
    FramedIpAddress = 8,
    /// Class (25) - RFC 2865
    Class = 25,
    /// Vendor-Specific (26) - RFC 2865
    VendorSpecific = 26,
    /// Called-Station-Id (30) - RFC 2865
    CalledStationId = 30,
    /// Calling-Station-Id (31) - RFC 2865
    CallingStationId = 31,
    /// NAS-Identifier (32) - RFC 2865
    NasIdentifier = 32,
    /// Proxy-State (33) - RFC 2865
    ProxyState = 33,
    /// Acct-Status-Type (40) - RFC 2866
    AcctStatusType = 40,
    /// Acct-Delay-Time (41) - RFC 2866
    AcctDelayTime = 41,
    /// Acct-Input-Octets (42) - RFC 2866
    AcctInputOctets = 42,
    /// Acct-Output-Octets (43) - RFC 2866
    AcctOutputOctets = 43,
    /// Acct-Session-Id (44) - RFC 2866
    AcctSessionId = 44,
    /// Acct-Authentic (45) - RFC 2866
    AcctAuthentic = 45,
    /// Acct-Session-Time (46) - RFC 2866
    AcctSessionTime = 46,
    /// Acct-Input-Packets (47) - RFC 2866
    AcctInputPackets = 47,
    /// Acct-Output-Packets (48) - RFC 2866
    AcctOutputPackets = 48,
    /// Acct-Terminate-Cause (49) - RFC 2866
    AcctTerminateCause = 49,
    /// Acct-Multi-Session-Id (50) - RFC 2866
    AcctMultiSessionId = 50,
    /// Acct-Input-Gigawords (52) - RFC 2869
    AcctInputGigawords = 52,
    /// Acct-Output-Gigawords (53) - RFC 2869
    AcctOutputGigawords = 53,
    /// Event-Timestamp (55) - RFC 2869
    EventTimestamp = 55,
    /// NAS-Port-Type (61) - RFC 2865
    NasPortType = 61,
    /// EAP-Message (79) - RFC 3579
    EapMessage = 79,
    /// Message-Authenticator (80) - RFC 2869 / RFC 3579
    MessageAuthenticator = 80,
}

impl AttributeType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(AttributeType::UserName),
            4 => Some(AttributeType::NasIpAddress),
            5 => Some(AttributeType::NasPort),
            6 => Some(AttributeType::ServiceType),
            8 => Some(AttributeType::FramedIpAddress),
            25 => Some(AttributeType::Class),
            26 => Some(AttributeType::VendorSpecific),
            30 => Some(AttributeType::CalledStationId),
            31 => Some(AttributeType::CallingStationId),
            32 => Some(AttributeType::NasIdentifier),
            33 => Some(AttributeType::ProxyState),
            40 => Some(AttributeType::AcctStatusType),
            41 => Some(AttributeType::AcctDelayTime),
            42 => Some(AttributeType::AcctInputOctets),
            43 => Some(AttributeType::AcctOutputOctets),
            44 => Some(AttributeType::AcctSessionId),
            45 => Some(AttributeType::AcctAuthentic),
            46 => Some(AttributeType::AcctSessionTime),
            47 => Some(AttributeType::AcctInputPackets),
            48 => Some(AttributeType::AcctOutputPackets),
            49 => Some(AttributeType::AcctTerminateCause),
            50 => Some(AttributeType::AcctMultiSessionId),
            52 => Some(AttributeType::AcctInputGigawords),
            53 => Some(AttributeType::AcctOutputGigawords),
            55 => Some(AttributeType::EventTimestamp),
            61 => Some(AttributeType::NasPortType),
            79 => Some(AttributeType::EapMessage),
            80 => Some(AttributeType::MessageAuthenticator),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Dictionary name, used in error messages
    pub fn name(self) -> &'static str {
        match self {
            AttributeType::UserName => "User-Name",
            AttributeType::NasIpAddress => "NAS-IP-Address",
            AttributeType::NasPort => "NAS-Port",
            AttributeType::ServiceType => "Service-Type",
            AttributeType::FramedIpAddress => "Framed-IP-Address",
            AttributeType::Class => "Class",
            AttributeType::VendorSpecific => "Vendor-Specific",
            AttributeType::CalledStationId => "Called-Station-Id",
            AttributeType::CallingStationId => "Calling-Station-Id",
            AttributeType::NasIdentifier => "NAS-Identifier",
            AttributeType::ProxyState => "Proxy-State",
            AttributeType::AcctStatusType => "Acct-Status-Type",
            AttributeType::AcctDelayTime => "Acct-Delay-Time",
            AttributeType::AcctInputOctets => "Acct-Input-Octets",
            AttributeType::AcctOutputOctets => "Acct-Output-Octets",
            AttributeType::AcctSessionId => "Acct-Session-Id",
            AttributeType::AcctAuthentic => "Acct-Authentic",
            AttributeType::AcctSessionTime => "Acct-Session-Time",
            AttributeType::AcctInputPackets => "Acct-Input-Packets",
            AttributeType::AcctOutputPackets => "Acct-Output-Packets",
            AttributeType::AcctTerminateCause => "Acct-Terminate-Cause",
            AttributeType::AcctMultiSessionId => "Acct-Multi-Session-Id",
            AttributeType::AcctInputGigawords => "Acct-Input-Gigawords",
            AttributeType::AcctOutputGigawords => "Acct-Output-Gigawords",
            AttributeType::EventTimestamp => "Event-Timestamp",
            AttributeType::NasPortType => "NAS-Port-Type",
            AttributeType::EapMessage => "EAP-Message",
            AttributeType::MessageAuthenticator => "Message-Authenticator",
        }
    }
}
