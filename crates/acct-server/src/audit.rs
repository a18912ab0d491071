//! Audit logging for accounting events
//!
//! Every operationally significant outcome is reported under a stable event
//! identifier. An [`AuditEntry`] is emitted as a `tracing` event (which the
//! JSON subscriber writes to stdout) and, when an audit file is configured,
//! appended to it as one JSON line.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{error, Level};
use uuid::Uuid;

/// Application name carried by every entry
pub const APP_NAME: &str = "eapaka-acct";

/// Stable event identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventId {
    PktRecv,
    RadiusAuthErr,
    RadiusParseErr,
    RadiusUnknownCode,
    RadiusNoSecret,
    AcctStart,
    AcctInterim,
    AcctStop,
    AcctDuplicateStart,
    AcctSequenceErr,
    AcctSessionNotFound,
    ValkeyConnErr,
    DbWriteErr,
    SysErr,
    PktSendErr,
}

impl EventId {
    pub fn as_str(self) -> &'static str {
        match self {
            EventId::PktRecv => "PKT_RECV",
            EventId::RadiusAuthErr => "RADIUS_AUTH_ERR",
            EventId::RadiusParseErr => "RADIUS_PARSE_ERR",
            EventId::RadiusUnknownCode => "RADIUS_UNKNOWN_CODE",
            EventId::RadiusNoSecret => "RADIUS_NO_SECRET",
            EventId::AcctStart => "ACCT_START",
            EventId::AcctInterim => "ACCT_INTERIM",
            EventId::AcctStop => "ACCT_STOP",
            EventId::AcctDuplicateStart => "ACCT_DUPLICATE_START",
            EventId::AcctSequenceErr => "ACCT_SEQUENCE_ERR",
            EventId::AcctSessionNotFound => "ACCT_SESSION_NOT_FOUND",
            EventId::ValkeyConnErr => "VALKEY_CONN_ERR",
            EventId::DbWriteErr => "DB_WRITE_ERR",
            EventId::SysErr => "SYS_ERR",
            EventId::PktSendErr => "PKT_SEND_ERR",
        }
    }

    /// Severity the event is logged at
    pub fn level(self) -> Level {
        match self {
            EventId::PktRecv => Level::DEBUG,
            EventId::AcctStart | EventId::AcctInterim | EventId::AcctStop => Level::INFO,
            EventId::RadiusAuthErr
            | EventId::RadiusParseErr
            | EventId::RadiusUnknownCode
            | EventId::RadiusNoSecret
            | EventId::AcctDuplicateStart
            | EventId::AcctSequenceErr
            | EventId::AcctSessionNotFound => Level::WARN,
            EventId::ValkeyConnErr | EventId::DbWriteErr | EventId::SysErr | EventId::PktSendErr => {
                Level::ERROR
            }
        }
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-datagram correlation data
#[derive(Debug, Clone)]
pub struct PacketContext {
    /// Random UUIDv4 identifying one datagram across log lines
    pub trace_id: String,
    /// Source address with IPv4-mapped IPv6 folded to IPv4
    pub src_ip: IpAddr,
}

impl PacketContext {
    pub fn new(src: SocketAddr) -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            src_ip: src.ip().to_canonical(),
        }
    }
}

/// Audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub app: String,
    /// Unix epoch seconds
    pub timestamp: u64,
    /// ISO 8601 formatted timestamp
    pub timestamp_iso: String,
    pub level: String,
    pub event_id: EventId,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acct_session_id: Option<String>,
    /// Resolved subscriber identifier, masked when configured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imsi: Option<String>,
    /// Machine-readable cause, e.g. `no_start_received`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_octets: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_octets: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_time: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_time: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminate_cause: Option<String>,
    /// NAS-IP-Address as declared in the request, not the UDP source
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nas_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nas_identifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calling_station_id: Option<String>,
}

impl AuditEntry {
    /// Create a new audit entry
    pub fn new(event_id: EventId, message: impl Into<String>) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();

        let timestamp = now.as_secs();
        let timestamp_iso = chrono::DateTime::from_timestamp(timestamp as i64, 0)
            .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
            .unwrap_or_else(|| "unknown".to_string());

        AuditEntry {
            app: APP_NAME.to_string(),
            timestamp,
            timestamp_iso,
            level: event_id.level().to_string(),
            event_id,
            message: message.into(),
            trace_id: None,
            src_ip: None,
            acct_session_id: None,
            imsi: None,
            reason: None,
            details: None,
            input_octets: None,
            output_octets: None,
            session_time: None,
            delay_time: None,
            terminate_cause: None,
            nas_ip: None,
            nas_identifier: None,
            calling_station_id: None,
        }
    }

    /// Set trace id and source address
    pub fn with_context(mut self, ctx: &PacketContext) -> Self {
        self.trace_id = Some(ctx.trace_id.clone());
        self.src_ip = Some(ctx.src_ip.to_string());
        self
    }

    pub fn with_session_id(mut self, acct_session_id: impl Into<String>) -> Self {
        self.acct_session_id = Some(acct_session_id.into());
        self
    }

    pub fn with_imsi(mut self, imsi: impl Into<String>) -> Self {
        self.imsi = Some(imsi.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Set octet counters
    pub fn with_octets(mut self, input: u32, output: u32) -> Self {
        self.input_octets = Some(input);
        self.output_octets = Some(output);
        self
    }

    pub fn with_session_time(mut self, seconds: u32) -> Self {
        self.session_time = Some(seconds);
        self
    }

    pub fn with_delay_time(mut self, seconds: Option<u32>) -> Self {
        self.delay_time = seconds;
        self
    }

    pub fn with_terminate_cause(mut self, cause: Option<String>) -> Self {
        self.terminate_cause = cause;
        self
    }

    pub fn with_nas_ip(mut self, nas_ip: Option<Ipv4Addr>) -> Self {
        self.nas_ip = nas_ip.map(|ip| ip.to_string());
        self
    }

    pub fn with_nas_identifier(mut self, nas_identifier: Option<String>) -> Self {
        self.nas_identifier = nas_identifier;
        self
    }

    pub fn with_calling_station_id(mut self, calling_station_id: Option<String>) -> Self {
        self.calling_station_id = calling_station_id;
        self
    }
}

macro_rules! emit {
    ($level:expr, $entry:expr) => {
        tracing::event!(
            $level,
            app = APP_NAME,
            event_id = $entry.event_id.as_str(),
            trace_id = $entry.trace_id.as_deref(),
            src_ip = $entry.src_ip.as_deref(),
            acct_session_id = $entry.acct_session_id.as_deref(),
            imsi = $entry.imsi.as_deref(),
            reason = $entry.reason.as_deref(),
            details = $entry.details.as_deref(),
            input_octets = $entry.input_octets,
            output_octets = $entry.output_octets,
            session_time = $entry.session_time,
            delay_time = $entry.delay_time,
            terminate_cause = $entry.terminate_cause.as_deref(),
            nas_ip = $entry.nas_ip.as_deref(),
            nas_identifier = $entry.nas_identifier.as_deref(),
            calling_station_id = $entry.calling_station_id.as_deref(),
            "{}",
            $entry.message
        )
    };
}

/// Audit logger
pub struct AuditLogger {
    /// File path for audit log
    file_path: Option<PathBuf>,
    /// Append-only file handle
    file: Option<Mutex<std::fs::File>>,
}

impl AuditLogger {
    /// Create a new audit logger, opening `file_path` for append
    pub fn new(file_path: Option<impl AsRef<Path>>) -> std::io::Result<Self> {
        let file_path = file_path.map(|p| p.as_ref().to_path_buf());
        let file = match file_path {
            Some(ref path) => Some(Mutex::new(
                OpenOptions::new().create(true).append(true).open(path)?,
            )),
            None => None,
        };

        Ok(AuditLogger { file_path, file })
    }

    /// Logger that only emits tracing events
    pub fn disabled() -> Self {
        AuditLogger {
            file_path: None,
            file: None,
        }
    }

    /// Log an audit entry
    pub async fn log(&self, entry: AuditEntry) {
        let level = entry.event_id.level();
        if level == Level::ERROR {
            emit!(Level::ERROR, entry);
        } else if level == Level::WARN {
            emit!(Level::WARN, entry);
        } else if level == Level::INFO {
            emit!(Level::INFO, entry);
        } else {
            emit!(Level::DEBUG, entry);
        }

        if let Some(ref file) = self.file {
            match serde_json::to_string(&entry) {
                Ok(json) => {
                    let mut f = file.lock().await;
                    if let Err(e) = writeln!(f, "{}", json) {
                        error!("Failed to write audit log: {}", e);
                    }
                }
                Err(e) => {
                    error!("Failed to serialize audit entry: {}", e);
                }
            }
        }
    }

    /// Check if file audit logging is enabled
    pub fn is_enabled(&self) -> bool {
        self.file.is_some()
    }

    /// Get the audit log file path
    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::NamedTempFile;

    fn context() -> PacketContext {
        PacketContext::new("192.168.1.1:5000".parse().unwrap())
    }

    #[test]
    fn test_event_id_serializes_to_stable_name() {
        for id in [EventId::AcctDuplicateStart, EventId::ValkeyConnErr, EventId::PktRecv] {
            let json = serde_json::to_string(&id).unwrap();
            assert_eq!(json, format!("\"{}\"", id.as_str()));
        }
    }

    #[test]
    fn test_event_levels() {
        assert_eq!(EventId::PktRecv.level(), Level::DEBUG);
        assert_eq!(EventId::AcctStart.level(), Level::INFO);
        assert_eq!(EventId::AcctSequenceErr.level(), Level::WARN);
        assert_eq!(EventId::DbWriteErr.level(), Level::ERROR);
    }

    #[test]
    fn test_context_canonicalises_mapped_ipv4() {
        let ctx = PacketContext::new("[::ffff:10.1.2.3]:1813".parse().unwrap());
        assert_eq!(ctx.src_ip, "10.1.2.3".parse::<IpAddr>().unwrap());
        assert_eq!(ctx.trace_id.len(), 36);
        assert_ne!(ctx.trace_id, PacketContext::new("10.1.2.3:1".parse().unwrap()).trace_id);
    }

    #[test]
    fn test_audit_entry_serialization() {
        let entry = AuditEntry::new(EventId::AcctSequenceErr, "Accounting sequence problem")
            .with_context(&context())
            .with_session_id("sess-new")
            .with_reason("no_start_received");

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"event_id\":\"ACCT_SEQUENCE_ERR\""));
        assert!(json.contains("\"app\":\"eapaka-acct\""));
        assert!(json.contains("\"level\":\"WARN\""));
        assert!(json.contains("\"src_ip\":\"192.168.1.1\""));
        assert!(json.contains("no_start_received"));
        assert!(!json.contains("imsi"));
    }

    #[tokio::test]
    async fn test_audit_logger_file() {
        let temp_file = NamedTempFile::new().unwrap();
        let logger = AuditLogger::new(Some(temp_file.path())).unwrap();
        assert!(logger.is_enabled());

        logger
            .log(AuditEntry::new(EventId::AcctStart, "Accounting start").with_imsi("001010********9"))
            .await;
        logger
            .log(AuditEntry::new(EventId::AcctStop, "Accounting stop").with_octets(1, 2))
            .await;

        let content = fs::read_to_string(temp_file.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: AuditEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.event_id, EventId::AcctStart);
        assert_eq!(first.imsi.as_deref(), Some("001010********9"));
        let second: AuditEntry = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.output_octets, Some(2));
    }

    #[tokio::test]
    async fn test_disabled_logger() {
        let logger = AuditLogger::disabled();
        assert!(!logger.is_enabled());
        assert!(logger.file_path().is_none());
        logger.log(AuditEntry::new(EventId::SysErr, "nothing written")).await;
    }
}
