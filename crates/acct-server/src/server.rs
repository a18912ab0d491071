use crate::accounting::AccountingProcessor;
use crate::audit::{AuditEntry, AuditLogger, EventId, PacketContext};
use crate::store::Store;
use radius_proto::auth::verify_accounting_request_authenticator;
use radius_proto::message_auth::verify_message_authenticator;
use radius_proto::response::{build_accounting_response, build_status_server_response};
use radius_proto::{AccountingRequest, Code, Packet, PacketError};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Instrument};

/// How long in-flight packets may run after shutdown is requested
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Longest pause between receives while the socket keeps failing
const MAX_RECV_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Turns one datagram into an optional reply
///
/// Holds everything a packet needs and nothing tied to the socket, so it
/// can be driven directly in tests.
pub struct PacketHandler {
    store: Arc<dyn Store>,
    processor: AccountingProcessor,
    audit: Arc<AuditLogger>,
    fallback_secret: Option<Vec<u8>>,
}

impl PacketHandler {
    pub fn new(
        store: Arc<dyn Store>,
        audit: Arc<AuditLogger>,
        fallback_secret: Option<Vec<u8>>,
        mask_imsi: bool,
    ) -> Self {
        let processor = AccountingProcessor::new(Arc::clone(&store), Arc::clone(&audit), mask_imsi);
        Self {
            store,
            processor,
            audit,
            fallback_secret: fallback_secret.filter(|s| !s.is_empty()),
        }
    }

    /// Handle a datagram received from `src`
    pub async fn handle_packet(&self, data: &[u8], src: SocketAddr) -> Option<Vec<u8>> {
        self.handle(&PacketContext::new(src), data).await
    }

    async fn drop_packet(&self, ctx: &PacketContext, event_id: EventId, message: &str, details: String) {
        self.audit
            .log(
                AuditEntry::new(event_id, message)
                    .with_context(ctx)
                    .with_details(details),
            )
            .await;
    }

    /// Shared secret for the source: registered client first, then the
    /// configured fallback
    async fn resolve_secret(&self, ctx: &PacketContext) -> Option<Vec<u8>> {
        match self.store.client_secret(&ctx.src_ip.to_string()).await {
            Ok(Some(secret)) => return Some(secret.into_bytes()),
            Ok(None) => {}
            Err(e) => {
                self.drop_packet(ctx, EventId::ValkeyConnErr, "Client secret lookup failed", e.to_string())
                    .await;
            }
        }
        self.fallback_secret.clone()
    }

    async fn handle(&self, ctx: &PacketContext, data: &[u8]) -> Option<Vec<u8>> {
        self.audit
            .log(
                AuditEntry::new(EventId::PktRecv, "Packet received")
                    .with_context(ctx)
                    .with_details(format!("{} bytes", data.len())),
            )
            .await;

        let Some(secret) = self.resolve_secret(ctx).await else {
            self.drop_packet(ctx, EventId::RadiusNoSecret, "No shared secret for client", ctx.src_ip.to_string())
                .await;
            return None;
        };

        // Accounting-Requests are authenticated on the raw bytes before the
        // attribute list is parsed.
        if is_framed_accounting_request(data) && !verify_accounting_request_authenticator(data, &secret) {
            self.drop_packet(
                ctx,
                EventId::RadiusAuthErr,
                "Request Authenticator mismatch",
                format!("identifier {}", data[1]),
            )
            .await;
            return None;
        }

        let request = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(PacketError::InvalidCode(code)) => {
                self.drop_packet(ctx, EventId::RadiusUnknownCode, "Unsupported RADIUS code", format!("code {}", code))
                    .await;
                return None;
            }
            Err(e) => {
                self.drop_packet(ctx, EventId::RadiusParseErr, "Malformed RADIUS packet", e.to_string())
                    .await;
                return None;
            }
        };

        let response = match request.code {
            Code::AccountingRequest => self.handle_accounting_request(ctx, &request, &secret).await?,
            Code::StatusServer => self.handle_status_server(ctx, data, &request, &secret)?,
            other => {
                self.drop_packet(ctx, EventId::RadiusUnknownCode, "Unsupported RADIUS code", other.to_string())
                    .await;
                return None;
            }
        };

        match response.encode() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                self.drop_packet(ctx, EventId::SysErr, "Failed to encode response", e.to_string())
                    .await;
                None
            }
        }
    }

    async fn handle_accounting_request(
        &self,
        ctx: &PacketContext,
        request: &Packet,
        secret: &[u8],
    ) -> Option<Packet> {
        let record = match AccountingRequest::from_packet(request) {
            Ok(record) => record,
            Err(e) => {
                self.drop_packet(ctx, EventId::RadiusParseErr, "Invalid Accounting-Request", e.to_string())
                    .await;
                return None;
            }
        };

        if !self.processor.process(ctx, &record).await {
            self.audit
                .log(
                    AuditEntry::new(EventId::RadiusUnknownCode, "Unsupported Acct-Status-Type")
                        .with_context(ctx)
                        .with_session_id(record.session_id.clone())
                        .with_details(format!("Acct-Status-Type {}", record.status_type)),
                )
                .await;
            return None;
        }

        match build_accounting_response(request, secret) {
            Ok(response) => Some(response),
            Err(e) => {
                self.drop_packet(ctx, EventId::SysErr, "Failed to build response", e.to_string())
                    .await;
                None
            }
        }
    }

    fn handle_status_server(
        &self,
        ctx: &PacketContext,
        data: &[u8],
        request: &Packet,
        secret: &[u8],
    ) -> Option<Packet> {
        if !verify_message_authenticator(data, secret) {
            debug!(
                src_ip = %ctx.src_ip,
                request_id = request.identifier,
                "Dropping Status-Server without a valid Message-Authenticator"
            );
            return None;
        }

        build_status_server_response(request, secret)
            .map_err(|e| debug!(error = %e, "Failed to build Status-Server response"))
            .ok()
    }
}

/// Pause after `consecutive` failed receives: none for an isolated error,
/// then 10 ms doubling up to [`MAX_RECV_BACKOFF`]
fn recv_backoff(consecutive: u32) -> Duration {
    if consecutive < 2 {
        return Duration::ZERO;
    }
    let exponent = (consecutive - 2).min(10);
    (Duration::from_millis(10) * 2u32.pow(exponent)).min(MAX_RECV_BACKOFF)
}

/// Code 4 with a Length field that frames the datagram
fn is_framed_accounting_request(data: &[u8]) -> bool {
    Packet::declared_length(data).is_ok() && data[0] == Code::AccountingRequest.as_u8()
}

/// Open a non-blocking UDP socket on `addr`
///
/// IPv6 sockets are made dual-stack so `[::]` also receives IPv4 traffic as
/// mapped addresses.
fn bind_socket(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    if addr.is_ipv6() {
        if let Err(e) = socket.set_only_v6(false) {
            warn!(error = %e, "Could not enable dual-stack, listening on IPv6 only");
        }
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Accounting server
pub struct AcctServer {
    socket: Arc<UdpSocket>,
    handler: Arc<PacketHandler>,
}

impl AcctServer {
    /// Bind the UDP listener
    ///
    /// `[::]` falls back to `0.0.0.0` on hosts without IPv6.
    pub async fn bind(addr: SocketAddr, handler: PacketHandler) -> Result<Self, ServerError> {
        let socket = match bind_socket(addr) {
            Ok(socket) => socket,
            Err(e) if addr.ip() == IpAddr::V6(Ipv6Addr::UNSPECIFIED) => {
                warn!(error = %e, "IPv6 unavailable, listening on IPv4 only");
                bind_socket(SocketAddr::from((Ipv4Addr::UNSPECIFIED, addr.port())))?
            }
            Err(e) => return Err(e.into()),
        };
        info!("RADIUS accounting server listening on {}", socket.local_addr()?);

        Ok(AcctServer {
            socket: Arc::new(socket),
            handler: Arc::new(handler),
        })
    }

    /// Get the local address the server is listening on
    ///
    /// This is useful for testing when binding to port 0 (OS-assigned port)
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.socket.local_addr().map_err(ServerError::from)
    }

    /// Receive and answer datagrams until `shutdown` is cancelled
    ///
    /// Each datagram is handled on its own task. After cancellation no new
    /// datagrams are read and in-flight ones get [`SHUTDOWN_GRACE`] to finish.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let tracker = TaskTracker::new();
        let mut buf = vec![0u8; Packet::MAX_PACKET_SIZE];
        let mut recv_errors = 0u32;

        loop {
            let (len, src) = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        // ICMP port unreachable surfaces here on some platforms.
                        recv_errors = recv_errors.saturating_add(1);
                        warn!(error = %e, consecutive = recv_errors, "UDP receive failed");
                        let pause = recv_backoff(recv_errors);
                        if !pause.is_zero() {
                            tokio::select! {
                                _ = shutdown.cancelled() => break,
                                _ = tokio::time::sleep(pause) => {}
                            }
                        }
                        continue;
                    }
                },
            };
            recv_errors = 0;

            let data = buf[..len].to_vec();
            let ctx = PacketContext::new(src);
            let handler = Arc::clone(&self.handler);
            let socket = Arc::clone(&self.socket);
            let span = tracing::info_span!("packet", trace_id = %ctx.trace_id, src_ip = %ctx.src_ip);

            tracker.spawn(
                async move {
                    // Inner task so a panic in processing is observed here
                    // instead of tearing down the listener.
                    let worker = {
                        let handler = Arc::clone(&handler);
                        let ctx = ctx.clone();
                        tokio::spawn(async move { handler.handle(&ctx, &data).await }.in_current_span())
                    };

                    match worker.await {
                        Ok(Some(response)) => {
                            if let Err(e) = socket.send_to(&response, src).await {
                                handler
                                    .drop_packet(&ctx, EventId::PktSendErr, "Failed to send response", e.to_string())
                                    .await;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            handler
                                .drop_packet(&ctx, EventId::SysErr, "Packet handler failed", e.to_string())
                                .await;
                        }
                    }
                }
                .instrument(span),
            );
        }

        tracker.close();
        info!(in_flight = tracker.len(), "Listener stopped, draining in-flight packets");
        if tokio::time::timeout(SHUTDOWN_GRACE, tracker.wait()).await.is_err() {
            warn!(in_flight = tracker.len(), "Shutdown grace period expired");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use radius_proto::auth::calculate_accounting_request_authenticator;
    use radius_proto::{Attribute, AttributeType};
    use std::fs;
    use tempfile::NamedTempFile;

    const SECRET: &str = "testing123";

    fn src() -> SocketAddr {
        "192.168.1.1:40000".parse().unwrap()
    }

    async fn handler_with(
        store: MemoryStore,
        fallback: Option<&str>,
    ) -> (PacketHandler, NamedTempFile) {
        let audit_file = NamedTempFile::new().unwrap();
        let audit = Arc::new(AuditLogger::new(Some(audit_file.path())).unwrap());
        let handler = PacketHandler::new(
            Arc::new(store),
            audit,
            fallback.map(|s| s.as_bytes().to_vec()),
            true,
        );
        (handler, audit_file)
    }

    fn event_ids(file: &NamedTempFile) -> Vec<String> {
        fs::read_to_string(file.path())
            .unwrap()
            .lines()
            .map(|line| {
                let value: serde_json::Value = serde_json::from_str(line).unwrap();
                value["event_id"].as_str().unwrap().to_string()
            })
            .collect()
    }

    fn signed_request(status: u32, sid: &str, secret: &str) -> Vec<u8> {
        let mut packet = Packet::new(Code::AccountingRequest, 9, [0u8; 16]);
        packet.add_attribute(Attribute::integer(AttributeType::AcctStatusType.as_u8(), status).unwrap());
        packet.add_attribute(Attribute::string(AttributeType::AcctSessionId.as_u8(), sid).unwrap());
        packet.authenticator =
            calculate_accounting_request_authenticator(&packet, secret.as_bytes()).unwrap();
        packet.encode().unwrap()
    }

    #[tokio::test]
    async fn test_registered_client_secret_is_used() {
        let store = MemoryStore::new();
        store.insert_client("192.168.1.1", SECRET).await;
        let (handler, _audit) = handler_with(store, Some("other")).await;

        let reply = handler
            .handle_packet(&signed_request(1, "s", SECRET), src())
            .await
            .unwrap();
        let reply = Packet::decode(&reply).unwrap();
        assert_eq!(reply.code, Code::AccountingResponse);
        assert_eq!(reply.identifier, 9);
    }

    #[tokio::test]
    async fn test_fallback_secret() {
        let (handler, _audit) = handler_with(MemoryStore::new(), Some(SECRET)).await;
        assert!(handler
            .handle_packet(&signed_request(1, "s", SECRET), src())
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_no_secret_drops() {
        let (handler, audit) = handler_with(MemoryStore::new(), None).await;
        assert!(handler
            .handle_packet(&signed_request(1, "s", SECRET), src())
            .await
            .is_none());
        assert_eq!(event_ids(&audit), vec!["PKT_RECV", "RADIUS_NO_SECRET"]);
    }

    #[tokio::test]
    async fn test_wrong_secret_is_auth_error() {
        let (handler, audit) = handler_with(MemoryStore::new(), Some(SECRET)).await;
        assert!(handler
            .handle_packet(&signed_request(1, "s", "wrong"), src())
            .await
            .is_none());
        assert_eq!(event_ids(&audit), vec!["PKT_RECV", "RADIUS_AUTH_ERR"]);
    }

    #[tokio::test]
    async fn test_truncated_packet_is_parse_error() {
        let (handler, audit) = handler_with(MemoryStore::new(), Some(SECRET)).await;
        assert!(handler.handle_packet(&[4, 1, 0], src()).await.is_none());
        assert_eq!(event_ids(&audit), vec!["PKT_RECV", "RADIUS_PARSE_ERR"]);
    }

    #[test]
    fn test_recv_backoff() {
        assert_eq!(recv_backoff(1), Duration::ZERO);
        assert_eq!(recv_backoff(2), Duration::from_millis(10));
        assert_eq!(recv_backoff(3), Duration::from_millis(20));
        assert_eq!(recv_backoff(8), Duration::from_millis(640));
        assert_eq!(recv_backoff(9), MAX_RECV_BACKOFF);
        assert_eq!(recv_backoff(u32::MAX), MAX_RECV_BACKOFF);
    }

    #[tokio::test]
    async fn test_forged_request_with_broken_attributes_is_auth_error() {
        let (handler, audit) = handler_with(MemoryStore::new(), Some(SECRET)).await;

        // Acct-Session-Id claiming a length of 1, below the attribute minimum.
        let mut forged = vec![Code::AccountingRequest.as_u8(), 3, 0, 22];
        forged.extend_from_slice(&[0u8; 16]);
        forged.extend_from_slice(&[AttributeType::AcctSessionId.as_u8(), 1]);

        assert!(handler.handle_packet(&forged, src()).await.is_none());
        assert_eq!(event_ids(&audit), vec!["PKT_RECV", "RADIUS_AUTH_ERR"]);
    }

    #[tokio::test]
    async fn test_missing_session_id_is_parse_error() {
        let (handler, audit) = handler_with(MemoryStore::new(), Some(SECRET)).await;
        let mut packet = Packet::new(Code::AccountingRequest, 1, [0u8; 16]);
        packet.add_attribute(Attribute::integer(AttributeType::AcctStatusType.as_u8(), 1).unwrap());
        packet.authenticator =
            calculate_accounting_request_authenticator(&packet, SECRET.as_bytes()).unwrap();

        assert!(handler
            .handle_packet(&packet.encode().unwrap(), src())
            .await
            .is_none());
        assert_eq!(event_ids(&audit), vec!["PKT_RECV", "RADIUS_PARSE_ERR"]);
    }

    #[tokio::test]
    async fn test_unknown_codes_are_dropped() {
        let (handler, audit) = handler_with(MemoryStore::new(), Some(SECRET)).await;

        // Access-Request is a valid RADIUS code but not served here.
        let access = Packet::new(Code::AccessRequest, 1, [0u8; 16]).encode().unwrap();
        assert!(handler.handle_packet(&access, src()).await.is_none());

        let mut bogus = access.clone();
        bogus[0] = 99;
        assert!(handler.handle_packet(&bogus, src()).await.is_none());

        // Accounting-On is authentic but not handled.
        assert!(handler
            .handle_packet(&signed_request(7, "s", SECRET), src())
            .await
            .is_none());

        let ids = event_ids(&audit);
        assert_eq!(ids.iter().filter(|id| *id == "RADIUS_UNKNOWN_CODE").count(), 3);
    }

    #[tokio::test]
    async fn test_status_server_without_message_authenticator_is_dropped() {
        let (handler, audit) = handler_with(MemoryStore::new(), Some(SECRET)).await;
        let status = Packet::new(Code::StatusServer, 1, [5u8; 16]).encode().unwrap();

        assert!(handler.handle_packet(&status, src()).await.is_none());
        assert_eq!(event_ids(&audit), vec!["PKT_RECV"]);
    }
}
