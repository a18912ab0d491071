use std::fmt;

/// RADIUS packet codes (RFC 2865 Section 4, RFC 2866, RFC 5997)
///
/// Only the codes an accounting listener can plausibly receive or send are
/// modelled. Anything else fails to decode with `PacketError::InvalidCode`
/// so the dispatcher can report it as an unknown code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Code {
    /// Access-Request (1)
    AccessRequest = 1,
    /// Access-Accept (2)
    AccessAccept = 2,
    /// Access-Reject (3)
    AccessReject = 3,
    /// Accounting-Request (4) - RFC 2866
    AccountingRequest = 4,
    /// Accounting-Response (5) - RFC 2866
    AccountingResponse = 5,
    /// Access-Challenge (11)
    AccessChallenge = 11,
    /// Status-Server (12) - RFC 5997
    StatusServer = 12,
    /// Status-Client (13) - RFC 5997
    StatusClient = 13,
}

impl Code {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Code::AccessRequest),
            2 => Some(Code::AccessAccept),
            3 => Some(Code::AccessReject),
            4 => Some(Code::AccountingRequest),
            5 => Some(Code::AccountingResponse),
            11 => Some(Code::AccessChallenge),
            12 => Some(Code::StatusServer),
            13 => Some(Code::StatusClient),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether this code is a request a server is expected to answer
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Code::AccessRequest | Code::AccountingRequest | Code::StatusServer
        )
    }

    /// RFC display name, used in log lines
    pub fn name(self) -> &'static str {
        match self {
            Code::AccessRequest => "Access-Request",
            Code::AccessAccept => "Access-Accept",
            Code::AccessReject => "Access-Reject",
            Code::AccountingRequest => "Accounting-Request",
            Code::AccountingResponse => "Accounting-Response",
            Code::AccessChallenge => "Access-Challenge",
            Code::StatusServer => "Status-Server",
            Code::StatusClient => "Status-Client",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.as_u8())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip_for_accounting_codes() {
        for code in [Code::AccountingRequest, Code::AccountingResponse, Code::StatusServer] {
            assert_eq!(Code::from_u8(code.as_u8()), Some(code));
        }
        assert_eq!(Code::from_u8(40), None);
    }

    #[test]
    fn test_code_display() {
        assert_eq!(Code::StatusServer.to_string(), "Status-Server(12)");
        assert!(Code::AccountingRequest.is_request());
        assert!(!Code::AccountingResponse.is_request());
    }
}
