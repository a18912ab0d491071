//! Duplicate and sequence detection per Acct-Session-Id
//!
//! A single marker per session id records the last accepted transition:
//!
//! ```text
//! start | interim:<in>:<out> | stop
//! ```
//!
//! | Current            | Event           | Outcome            | New state         |
//! |--------------------|-----------------|--------------------|-------------------|
//! | none               | Start           | accept             | `start`           |
//! | start, interim     | Start           | duplicate          | unchanged         |
//! | stop               | Start           | warn start_after_stop | `start`        |
//! | none, stop         | Interim(i,o)    | warn no_start_received | `interim:i:o` |
//! | start, other interim | Interim(i,o)  | accept             | `interim:i:o`     |
//! | `interim:i:o`      | Interim(i,o)    | duplicate          | unchanged         |
//! | none, start, interim | Stop          | accept             | `stop`            |
//! | stop               | Stop            | duplicate          | unchanged         |
//!
//! Two writers racing on one session id are last-write-wins.

use crate::store::{Store, StoreError};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Decoded marker value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Start,
    Interim { input_octets: u32, output_octets: u32 },
    Stop,
}

impl Marker {
    /// Parse a stored marker; anything outside the grammar is `None`
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "start" => Some(Marker::Start),
            "stop" => Some(Marker::Stop),
            _ => {
                let counters = value.strip_prefix("interim:")?;
                let (input, output) = counters.split_once(':')?;
                Some(Marker::Interim {
                    input_octets: input.parse().ok()?,
                    output_octets: output.parse().ok()?,
                })
            }
        }
    }

    /// Whether the marker proves a Start was seen for a live session
    pub fn is_started(self) -> bool {
        matches!(self, Marker::Start | Marker::Interim { .. })
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Marker::Start => f.write_str("start"),
            Marker::Stop => f.write_str("stop"),
            Marker::Interim {
                input_octets,
                output_octets,
            } => write!(f, "interim:{}:{}", input_octets, output_octets),
        }
    }
}

/// Why an accepted packet is out of sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceReason {
    StartAfterStop,
    NoStartReceived,
}

impl SequenceReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SequenceReason::StartAfterStop => "start_after_stop",
            SequenceReason::NoStartReceived => "no_start_received",
        }
    }
}

impl fmt::Display for SequenceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a duplicate check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    AcceptWithWarning(SequenceReason),
    Duplicate,
}

/// Duplicate detector over the marker store
#[derive(Clone)]
pub struct DuplicateDetector {
    store: Arc<dyn Store>,
}

impl DuplicateDetector {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Current state; an unparseable marker reads as absent
    pub async fn state(&self, acct_session_id: &str) -> Result<Option<Marker>, StoreError> {
        let raw = self.store.marker_get(acct_session_id).await?;
        let marker = raw.as_deref().and_then(Marker::parse);
        if let (Some(raw), None) = (&raw, marker) {
            debug!(acct_session_id, marker = %raw, "Ignoring unrecognised duplicate marker");
        }
        Ok(marker)
    }

    async fn set(&self, acct_session_id: &str, marker: Marker) -> Result<(), StoreError> {
        self.store
            .marker_set(acct_session_id, &marker.to_string())
            .await
    }

    /// Accept a Start and record it, or report a retransmission
    pub async fn check_and_mark_start(&self, acct_session_id: &str) -> Result<Verdict, StoreError> {
        let verdict = match self.state(acct_session_id).await? {
            None => Verdict::Accept,
            Some(Marker::Stop) => Verdict::AcceptWithWarning(SequenceReason::StartAfterStop),
            Some(_) => return Ok(Verdict::Duplicate),
        };

        self.set(acct_session_id, Marker::Start).await?;
        Ok(verdict)
    }

    /// Accept an Interim-Update and record its counters, or report an exact
    /// retransmission
    ///
    /// An Interim for a session with no live Start both warns and stands in
    /// for the missing Start: the recorded `interim:` state satisfies
    /// [`DuplicateDetector::has_seen_start`].
    pub async fn check_interim_duplicate(
        &self,
        acct_session_id: &str,
        input_octets: u32,
        output_octets: u32,
    ) -> Result<Verdict, StoreError> {
        let current = self.state(acct_session_id).await?;
        let next = Marker::Interim {
            input_octets,
            output_octets,
        };

        let verdict = match current {
            Some(marker) if marker == next => return Ok(Verdict::Duplicate),
            Some(Marker::Start) | Some(Marker::Interim { .. }) => Verdict::Accept,
            None | Some(Marker::Stop) => Verdict::AcceptWithWarning(SequenceReason::NoStartReceived),
        };

        self.set(acct_session_id, next).await?;
        Ok(verdict)
    }

    /// Check a Stop without recording it; pair with
    /// [`DuplicateDetector::mark_as_stopped`]
    pub async fn check_stop_duplicate(&self, acct_session_id: &str) -> Result<Verdict, StoreError> {
        match self.state(acct_session_id).await? {
            Some(Marker::Stop) => Ok(Verdict::Duplicate),
            _ => Ok(Verdict::Accept),
        }
    }

    pub async fn has_seen_start(&self, acct_session_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .state(acct_session_id)
            .await?
            .map(Marker::is_started)
            .unwrap_or(false))
    }

    pub async fn mark_as_start(&self, acct_session_id: &str) -> Result<(), StoreError> {
        self.set(acct_session_id, Marker::Start).await
    }

    pub async fn mark_as_stopped(&self, acct_session_id: &str) -> Result<(), StoreError> {
        self.set(acct_session_id, Marker::Stop).await
    }
}
