//! Accounting processor
//!
//! Runs the Start, Interim-Update and Stop flows for one authenticated,
//! parsed Accounting-Request. Every flow completes: duplicate and sequence
//! outcomes are logged, store failures are logged under their own event id
//! and the remaining steps still run. The caller always answers the NAS.

use crate::audit::{AuditEntry, AuditLogger, EventId, PacketContext};
use crate::duplicate::{DuplicateDetector, Verdict};
use crate::identifier::{imsi_from_nai, IdentifierResolver};
use crate::session::{InterimUpdate, Session, SessionMirror, StartUpdate};
use crate::store::{Store, StoreError};
use radius_proto::{AccountingRequest, AcctStatusType, AcctTerminateCause};
use std::sync::Arc;
use tracing::debug;

/// Store operation being reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreOp {
    Read,
    Write,
}

/// Outcome of reading the session named by Class
enum Lookup {
    Found(Session),
    /// The hash exists but a numeric field does not decode
    Undecodable,
    Missing,
    /// Transport failure; existence unknown
    Unreadable,
}

impl Lookup {
    /// Whether the hash is known to exist and may be updated
    fn exists(&self) -> bool {
        matches!(self, Lookup::Found(_) | Lookup::Undecodable)
    }

    fn into_session(self) -> Option<Session> {
        match self {
            Lookup::Found(session) => Some(session),
            _ => None,
        }
    }
}

pub struct AccountingProcessor {
    detector: DuplicateDetector,
    sessions: SessionMirror,
    resolver: IdentifierResolver,
    audit: Arc<AuditLogger>,
}

impl AccountingProcessor {
    pub fn new(store: Arc<dyn Store>, audit: Arc<AuditLogger>, mask_imsi: bool) -> Self {
        Self {
            detector: DuplicateDetector::new(Arc::clone(&store)),
            sessions: SessionMirror::new(store),
            resolver: IdentifierResolver::new(mask_imsi),
            audit,
        }
    }

    /// Route a record by Acct-Status-Type
    ///
    /// Returns `false` for status types this server does not handle; the
    /// caller drops those packets.
    pub async fn process(&self, ctx: &PacketContext, record: &AccountingRequest) -> bool {
        match record.status() {
            Some(AcctStatusType::Start) => self.handle_start(ctx, record).await,
            Some(AcctStatusType::InterimUpdate) => self.handle_interim(ctx, record).await,
            Some(AcctStatusType::Stop) => self.handle_stop(ctx, record).await,
            None => return false,
        }
        true
    }

    fn entry(
        &self,
        ctx: &PacketContext,
        record: &AccountingRequest,
        event_id: EventId,
        message: &str,
    ) -> AuditEntry {
        AuditEntry::new(event_id, message)
            .with_context(ctx)
            .with_session_id(record.session_id.clone())
    }

    async fn store_failure(
        &self,
        ctx: &PacketContext,
        record: &AccountingRequest,
        op: StoreOp,
        what: &str,
        err: &StoreError,
    ) {
        let event_id = match (err, op) {
            (StoreError::Malformed { .. }, _) => EventId::SysErr,
            (_, StoreOp::Write) => EventId::DbWriteErr,
            (_, StoreOp::Read) => EventId::ValkeyConnErr,
        };
        self.audit
            .log(
                self.entry(ctx, record, event_id, "Store operation failed")
                    .with_details(format!("{}: {}", what, err)),
            )
            .await;
    }

    async fn session_not_found(&self, ctx: &PacketContext, record: &AccountingRequest, details: &str) {
        self.audit
            .log(
                self.entry(ctx, record, EventId::AcctSessionNotFound, "Session not found")
                    .with_details(details),
            )
            .await;
    }

    /// Log the outcome of a duplicate check; `true` means stop processing
    async fn apply_verdict(
        &self,
        ctx: &PacketContext,
        record: &AccountingRequest,
        what: &str,
        verdict: Result<Verdict, StoreError>,
    ) -> bool {
        match verdict {
            Ok(Verdict::Accept) => false,
            Ok(Verdict::AcceptWithWarning(reason)) => {
                self.audit
                    .log(
                        self.entry(ctx, record, EventId::AcctSequenceErr, "Accounting sequence error")
                            .with_reason(reason.as_str()),
                    )
                    .await;
                false
            }
            Ok(Verdict::Duplicate) => {
                self.audit
                    .log(
                        self.entry(ctx, record, EventId::AcctDuplicateStart, "Duplicate accounting request")
                            .with_details(what),
                    )
                    .await;
                true
            }
            Err(e) => {
                self.store_failure(ctx, record, StoreOp::Read, what, &e).await;
                false
            }
        }
    }

    /// Read the session named by Class, logging every way it can be missing
    async fn load_session(&self, ctx: &PacketContext, record: &AccountingRequest, uuid: &str) -> Lookup {
        match self.sessions.get(uuid).await {
            Ok(session) => Lookup::Found(session),
            Err(StoreError::NotFound) => {
                self.session_not_found(ctx, record, &format!("no session {}", uuid)).await;
                Lookup::Missing
            }
            Err(e @ StoreError::Malformed { .. }) => {
                self.store_failure(ctx, record, StoreOp::Read, "session get", &e).await;
                Lookup::Undecodable
            }
            Err(e) => {
                self.store_failure(ctx, record, StoreOp::Read, "session get", &e).await;
                Lookup::Unreadable
            }
        }
    }

    pub async fn handle_start(&self, ctx: &PacketContext, record: &AccountingRequest) {
        let sid = record.session_id.as_str();

        let verdict = self.detector.check_and_mark_start(sid).await;
        if self.apply_verdict(ctx, record, "start", verdict).await {
            return;
        }

        let mut session = None;
        match record.session_uuid.as_deref() {
            None => {
                self.session_not_found(ctx, record, "no session UUID in Class").await;
            }
            Some(uuid) => {
                let lookup = self.load_session(ctx, record, uuid).await;
                if lookup.exists() {
                    let update = StartUpdate {
                        start_time: chrono::Utc::now().timestamp(),
                        nas_ip: ctx.src_ip,
                        acct_id: record.session_id.clone(),
                        client_ip: record.framed_ip,
                    };
                    if let Err(e) = self.sessions.update_on_start(uuid, &update).await {
                        self.store_failure(ctx, record, StoreOp::Write, "session update", &e).await;
                    }
                }
                session = lookup.into_session();
            }
        }

        let identity = self.resolver.resolve(session.as_ref(), record);
        self.audit
            .log(
                self.entry(ctx, record, EventId::AcctStart, "Accounting start")
                    .with_imsi(identity)
                    .with_nas_ip(record.nas_ip)
                    .with_nas_identifier(record.nas_identifier.clone())
                    .with_calling_station_id(record.calling_station_id.clone()),
            )
            .await;
    }

    pub async fn handle_interim(&self, ctx: &PacketContext, record: &AccountingRequest) {
        let sid = record.session_id.as_str();

        let verdict = self
            .detector
            .check_interim_duplicate(sid, record.input_octets, record.output_octets)
            .await;
        if self.apply_verdict(ctx, record, "interim", verdict).await {
            return;
        }

        let mut session = None;
        if let Some(uuid) = record.session_uuid.as_deref() {
            let lookup = self.load_session(ctx, record, uuid).await;
            if lookup.exists() {
                let update = InterimUpdate {
                    nas_ip: ctx.src_ip,
                    client_ip: record.framed_ip,
                    input_octets: record.input_octets,
                    output_octets: record.output_octets,
                };
                if let Err(e) = self.sessions.update_on_interim(uuid, &update).await {
                    self.store_failure(ctx, record, StoreOp::Write, "session update", &e).await;
                }
            }
            session = lookup.into_session();
        }

        let identity = self.resolver.resolve(session.as_ref(), record);
        self.audit
            .log(
                self.entry(ctx, record, EventId::AcctInterim, "Accounting interim update")
                    .with_imsi(identity)
                    .with_octets(record.input_octets, record.output_octets)
                    .with_session_time(record.session_time)
                    .with_delay_time(record.delay_time),
            )
            .await;
    }

    pub async fn handle_stop(&self, ctx: &PacketContext, record: &AccountingRequest) {
        let sid = record.session_id.as_str();

        match self.detector.check_stop_duplicate(sid).await {
            Ok(Verdict::Duplicate) => {
                debug!(acct_session_id = sid, "Ignoring retransmitted Stop");
                return;
            }
            Ok(_) => {}
            Err(e) => self.store_failure(ctx, record, StoreOp::Read, "stop", &e).await,
        }

        if let Err(e) = self.detector.mark_as_stopped(sid).await {
            self.store_failure(ctx, record, StoreOp::Write, "mark stopped", &e).await;
        }

        let mut session = None;
        if let Some(uuid) = record.session_uuid.as_deref() {
            session = self.load_session(ctx, record, uuid).await.into_session();

            if let Err(e) = self.sessions.delete(uuid).await {
                self.store_failure(ctx, record, StoreOp::Write, "session delete", &e).await;
            }

            let imsi = session
                .as_ref()
                .map(|s| s.imsi.as_str())
                .filter(|imsi| !imsi.is_empty())
                .or_else(|| record.user_name.as_deref().and_then(imsi_from_nai));
            if let Some(imsi) = imsi {
                if let Err(e) = self.sessions.remove_user_index(imsi, uuid).await {
                    self.store_failure(ctx, record, StoreOp::Write, "user index remove", &e)
                        .await;
                }
            }
        }

        let identity = self.resolver.resolve(session.as_ref(), record);
        self.audit
            .log(
                self.entry(ctx, record, EventId::AcctStop, "Accounting stop")
                    .with_imsi(identity)
                    .with_octets(record.input_octets, record.output_octets)
                    .with_session_time(record.session_time)
                    .with_delay_time(record.delay_time)
                    .with_terminate_cause(record.terminate_cause.map(AcctTerminateCause::describe)),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        ClientStore, DuplicateStore, MemoryStore, SessionStore, UserIndexStore,
    };
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::NamedTempFile;

    const UUID: &str = "550e8400-e29b-41d4-a716-446655440000";
    const IMSI: &str = "001010123456789";

    /// Store double whose every call fails with a transport error
    struct FailingStore;

    fn down() -> StoreError {
        StoreError::Unavailable("connection refused".to_string())
    }

    #[async_trait]
    impl ClientStore for FailingStore {
        async fn client_secret(&self, _ip: &str) -> Result<Option<String>, StoreError> {
            Err(down())
        }
    }

    #[async_trait]
    impl SessionStore for FailingStore {
        async fn session_exists(&self, _uuid: &str) -> Result<bool, StoreError> {
            Err(down())
        }
        async fn session_get(&self, _uuid: &str) -> Result<HashMap<String, String>, StoreError> {
            Err(down())
        }
        async fn session_merge(
            &self,
            _uuid: &str,
            _fields: &[(&'static str, String)],
        ) -> Result<(), StoreError> {
            Err(down())
        }
        async fn session_delete(&self, _uuid: &str) -> Result<(), StoreError> {
            Err(down())
        }
    }

    #[async_trait]
    impl DuplicateStore for FailingStore {
        async fn marker_get(&self, _sid: &str) -> Result<Option<String>, StoreError> {
            Err(down())
        }
        async fn marker_set(&self, _sid: &str, _value: &str) -> Result<(), StoreError> {
            Err(down())
        }
    }

    #[async_trait]
    impl UserIndexStore for FailingStore {
        async fn user_index_remove(&self, _imsi: &str, _uuid: &str) -> Result<(), StoreError> {
            Err(down())
        }
    }

    #[async_trait]
    impl Store for FailingStore {
        async fn ping(&self) -> Result<(), StoreError> {
            Err(down())
        }
    }

    struct Harness {
        store: MemoryStore,
        processor: AccountingProcessor,
        audit_file: NamedTempFile,
    }

    impl Harness {
        fn new() -> Self {
            let store = MemoryStore::new();
            let (processor, audit_file) = processor_over(Arc::new(store.clone()));
            Harness {
                store,
                processor,
                audit_file,
            }
        }

        fn events(&self) -> Vec<AuditEntry> {
            read_events(&self.audit_file)
        }

        fn count(&self, event_id: EventId) -> usize {
            self.events().iter().filter(|e| e.event_id == event_id).count()
        }
    }

    fn processor_over(store: Arc<dyn Store>) -> (AccountingProcessor, NamedTempFile) {
        let audit_file = NamedTempFile::new().unwrap();
        let audit = Arc::new(AuditLogger::new(Some(audit_file.path())).unwrap());
        (AccountingProcessor::new(store, audit, true), audit_file)
    }

    fn read_events(file: &NamedTempFile) -> Vec<AuditEntry> {
        fs::read_to_string(file.path())
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn ctx() -> PacketContext {
        PacketContext::new("192.168.1.1:40000".parse().unwrap())
    }

    fn record(status: AcctStatusType, sid: &str) -> AccountingRequest {
        AccountingRequest {
            status_type: status.as_u32(),
            session_id: sid.to_string(),
            ..Default::default()
        }
    }

    fn with_session(mut record: AccountingRequest) -> AccountingRequest {
        record.class = Some(UUID.as_bytes().to_vec());
        record.session_uuid = Some(UUID.to_string());
        record
    }

    #[tokio::test]
    async fn test_fresh_start_enriches_session() {
        let h = Harness::new();
        h.store.insert_session(UUID, &[("imsi", IMSI)]).await;

        let mut start = with_session(record(AcctStatusType::Start, "sess-123"));
        start.framed_ip = Some("10.0.0.1".parse().unwrap());
        start.nas_ip = Some("10.1.1.1".parse().unwrap());
        assert!(h.processor.process(&ctx(), &start).await);

        assert_eq!(h.store.raw_marker("sess-123").await.as_deref(), Some("start"));
        let session = h.store.session_get(UUID).await.unwrap();
        assert_eq!(session["acct_id"], "sess-123");
        assert_eq!(session["nas_ip"], "192.168.1.1");
        assert_eq!(session["client_ip"], "10.0.0.1");

        let events = h.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, EventId::AcctStart);
        assert_eq!(events[0].imsi.as_deref(), Some("001010********9"));
        assert_eq!(events[0].nas_ip.as_deref(), Some("10.1.1.1"));
    }

    #[tokio::test]
    async fn test_repeated_start_logs_once() {
        let h = Harness::new();
        let start = record(AcctStatusType::Start, "sess-dup");

        for _ in 0..3 {
            h.processor.process(&ctx(), &start).await;
        }

        assert_eq!(h.count(EventId::AcctStart), 1);
        assert_eq!(h.count(EventId::AcctDuplicateStart), 2);
    }

    #[tokio::test]
    async fn test_start_without_class_reports_missing_session() {
        let h = Harness::new();
        h.processor.process(&ctx(), &record(AcctStatusType::Start, "s")).await;

        assert_eq!(h.count(EventId::AcctSessionNotFound), 1);
        assert_eq!(h.count(EventId::AcctStart), 1);
        assert_eq!(h.store.keys().await, vec!["acct:seen:s".to_string()]);
    }

    #[tokio::test]
    async fn test_start_for_unknown_session_does_not_create_it() {
        let h = Harness::new();
        h.processor
            .process(&ctx(), &with_session(record(AcctStatusType::Start, "s")))
            .await;

        assert_eq!(h.count(EventId::AcctSessionNotFound), 1);
        assert!(!h.store.session_exists(UUID).await.unwrap());
    }

    #[tokio::test]
    async fn test_start_after_stop() {
        let h = Harness::new();
        h.store.marker_set("sess-restart", "stop").await.unwrap();

        h.processor
            .process(&ctx(), &record(AcctStatusType::Start, "sess-restart"))
            .await;

        let warnings: Vec<AuditEntry> = h
            .events()
            .into_iter()
            .filter(|e| e.event_id == EventId::AcctSequenceErr)
            .collect();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].reason.as_deref(), Some("start_after_stop"));
        assert_eq!(h.store.raw_marker("sess-restart").await.as_deref(), Some("start"));
    }

    #[tokio::test]
    async fn test_interim_without_start() {
        let h = Harness::new();
        let mut interim = record(AcctStatusType::InterimUpdate, "sess-new");
        interim.input_octets = 1000;
        interim.output_octets = 2000;

        h.processor.process(&ctx(), &interim).await;

        let events = h.events();
        let warnings: Vec<&AuditEntry> = events
            .iter()
            .filter(|e| e.event_id == EventId::AcctSequenceErr)
            .collect();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].reason.as_deref(), Some("no_start_received"));
        assert_eq!(
            h.store.raw_marker("sess-new").await.as_deref(),
            Some("interim:1000:2000")
        );
        assert_eq!(h.count(EventId::AcctInterim), 1);
    }

    #[tokio::test]
    async fn test_interim_value_sensitivity() {
        let h = Harness::new();
        let mut interim = record(AcctStatusType::InterimUpdate, "sess-i");
        interim.input_octets = 100;
        interim.output_octets = 200;

        h.processor.process(&ctx(), &interim).await;
        h.processor.process(&ctx(), &interim).await;
        assert_eq!(h.count(EventId::AcctInterim), 1);
        assert_eq!(h.count(EventId::AcctDuplicateStart), 1);

        interim.input_octets = 200;
        interim.output_octets = 400;
        h.processor.process(&ctx(), &interim).await;
        assert_eq!(h.count(EventId::AcctInterim), 2);
    }

    #[tokio::test]
    async fn test_interim_updates_counters() {
        let h = Harness::new();
        h.store.insert_session(UUID, &[("imsi", IMSI)]).await;
        h.store.marker_set("sess-123", "start").await.unwrap();

        let mut interim = with_session(record(AcctStatusType::InterimUpdate, "sess-123"));
        interim.input_octets = 5000;
        interim.output_octets = 6000;
        h.processor.process(&ctx(), &interim).await;

        let session = h.store.session_get(UUID).await.unwrap();
        assert_eq!(session["input_octets"], "5000");
        assert_eq!(session["output_octets"], "6000");
        assert_eq!(h.count(EventId::AcctSequenceErr), 0);
    }

    #[tokio::test]
    async fn test_stop_cleans_up() {
        let h = Harness::new();
        h.store.insert_session(UUID, &[("imsi", IMSI)]).await;
        h.store.insert_user_index(IMSI, UUID).await;
        h.store.insert_user_index(IMSI, "other-session").await;
        h.store.marker_set("sess-123", "start").await.unwrap();

        let mut stop = with_session(record(AcctStatusType::Stop, "sess-123"));
        stop.input_octets = 12_345_678;
        stop.output_octets = 23_456_789;
        stop.session_time = 1800;
        stop.terminate_cause = Some(1);
        h.processor.process(&ctx(), &stop).await;

        assert!(!h.store.session_exists(UUID).await.unwrap());
        assert_eq!(h.store.user_index_members(IMSI).await, vec!["other-session"]);
        assert_eq!(h.store.raw_marker("sess-123").await.as_deref(), Some("stop"));

        let events = h.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, EventId::AcctStop);
        assert_eq!(events[0].session_time, Some(1800));
        assert_eq!(events[0].terminate_cause.as_deref(), Some("User-Request"));
        assert_eq!(events[0].imsi.as_deref(), Some("001010********9"));
    }

    #[tokio::test]
    async fn test_repeated_stop_is_silent() {
        let h = Harness::new();
        let stop = record(AcctStatusType::Stop, "sess-s");

        h.processor.process(&ctx(), &stop).await;
        h.processor.process(&ctx(), &stop).await;

        assert_eq!(h.events().len(), 1);
        assert_eq!(h.count(EventId::AcctStop), 1);
    }

    #[tokio::test]
    async fn test_stop_uses_nai_when_session_is_gone() {
        let h = Harness::new();
        h.store.insert_user_index(IMSI, UUID).await;

        let mut stop = with_session(record(AcctStatusType::Stop, "sess-gone"));
        stop.user_name = Some(format!("0{}@wlan.example", IMSI));
        h.processor.process(&ctx(), &stop).await;

        assert_eq!(h.count(EventId::AcctSessionNotFound), 1);
        assert!(h.store.user_index_members(IMSI).await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_status_type_is_rejected() {
        let h = Harness::new();
        let mut other = record(AcctStatusType::Start, "s");
        other.status_type = 7;

        assert!(!h.processor.process(&ctx(), &other).await);
        assert!(h.events().is_empty());
        assert!(h.store.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_store_outage_does_not_abort_flows() {
        let (processor, audit_file) = processor_over(Arc::new(FailingStore));

        processor
            .process(&ctx(), &with_session(record(AcctStatusType::Start, "s")))
            .await;
        let events = read_events(&audit_file);
        assert!(events.iter().any(|e| e.event_id == EventId::ValkeyConnErr));
        assert_eq!(events.last().map(|e| e.event_id), Some(EventId::AcctStart));

        processor
            .process(&ctx(), &with_session(record(AcctStatusType::Stop, "s")))
            .await;
        let events = read_events(&audit_file);
        assert!(events.iter().any(|e| e.event_id == EventId::DbWriteErr));
        assert_eq!(events.last().map(|e| e.event_id), Some(EventId::AcctStop));
    }

    #[tokio::test]
    async fn test_malformed_session_is_system_error() {
        let h = Harness::new();
        h.store
            .insert_session(UUID, &[("imsi", IMSI), ("start_time", "yesterday")])
            .await;

        let mut interim = with_session(record(AcctStatusType::InterimUpdate, "s"));
        interim.input_octets = 10;
        interim.output_octets = 20;
        h.processor.process(&ctx(), &interim).await;

        assert_eq!(h.count(EventId::SysErr), 1);
        assert_eq!(h.count(EventId::AcctInterim), 1);

        let session = h.store.session_get(UUID).await.unwrap();
        assert_eq!(session["input_octets"], "10");
        assert_eq!(session["output_octets"], "20");
    }

    #[tokio::test]
    async fn test_start_updates_session_with_undecodable_field() {
        let h = Harness::new();
        h.store
            .insert_session(UUID, &[("imsi", IMSI), ("input_octets", "n/a")])
            .await;

        h.processor
            .process(&ctx(), &with_session(record(AcctStatusType::Start, "sess-123")))
            .await;

        let session = h.store.session_get(UUID).await.unwrap();
        assert_eq!(session["acct_id"], "sess-123");
        assert!(session.contains_key("start_time"));
        assert!(h.store.ttl(&crate::store::keys::session(UUID)).await.is_some());
        assert_eq!(h.count(EventId::SysErr), 1);
        assert_eq!(h.count(EventId::AcctSessionNotFound), 0);
        assert_eq!(h.count(EventId::AcctStart), 1);
    }

    #[tokio::test]
    async fn test_unreadable_session_is_not_written() {
        let (processor, audit_file) = processor_over(Arc::new(FailingStore));

        processor
            .process(&ctx(), &with_session(record(AcctStatusType::InterimUpdate, "s")))
            .await;

        let events = read_events(&audit_file);
        assert!(!events.iter().any(|e| e.event_id == EventId::DbWriteErr));
        assert_eq!(events.last().map(|e| e.event_id), Some(EventId::AcctInterim));
    }
}
