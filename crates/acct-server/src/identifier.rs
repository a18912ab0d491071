//! Subscriber identifier for log lines
//!
//! Picks the best available identifier for a packet, in order:
//!
//! 1. IMSI from the session hash
//! 2. IMSI embedded in an EAP-AKA NAI User-Name (`0<imsi>@realm`, `6<imsi>@realm`)
//! 3. any other printable User-Name
//! 4. the session UUID from Class
//! 5. `unknown`
//!
//! IMSIs are masked unless masking is switched off.

use crate::session::Session;
use radius_proto::AccountingRequest;
use regex::Regex;
use std::sync::LazyLock;

static NAI_IMSI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[06]([0-9]{15})@").expect("NAI pattern is valid")
});

/// Longest User-Name written to logs (RFC 7542 NAI limit)
const MAX_LOGGABLE_LEN: usize = 253;

/// IMSI carried by an EAP-AKA permanent identity
pub fn imsi_from_nai(user_name: &str) -> Option<&str> {
    NAI_IMSI
        .captures(user_name)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// `001010123456789` becomes `001010********9`
pub fn mask_imsi(imsi: &str) -> String {
    let chars: Vec<char> = imsi.chars().collect();
    if chars.len() < 8 {
        return "*".repeat(chars.len().max(1));
    }
    let head: String = chars[..6].iter().collect();
    format!("{}********{}", head, chars[chars.len() - 1])
}

fn is_loggable(user_name: &str) -> bool {
    !user_name.is_empty()
        && user_name.len() <= MAX_LOGGABLE_LEN
        && !user_name.chars().any(char::is_control)
}

/// Chooses and formats the identifier
#[derive(Debug, Clone, Copy)]
pub struct IdentifierResolver {
    mask: bool,
}

impl IdentifierResolver {
    pub fn new(mask: bool) -> Self {
        Self { mask }
    }

    fn imsi(&self, imsi: &str) -> String {
        if self.mask {
            mask_imsi(imsi)
        } else {
            imsi.to_string()
        }
    }

    pub fn resolve(&self, session: Option<&Session>, record: &AccountingRequest) -> String {
        if let Some(session) = session.filter(|s| !s.imsi.is_empty()) {
            return self.imsi(&session.imsi);
        }

        if let Some(user_name) = record.user_name.as_deref() {
            if let Some(imsi) = imsi_from_nai(user_name) {
                return self.imsi(imsi);
            }
            if is_loggable(user_name) {
                return user_name.to_string();
            }
        }

        if let Some(uuid) = record.session_uuid.as_deref() {
            return uuid.to_string();
        }

        "unknown".to_string()
    }
}
