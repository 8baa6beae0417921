//! Persistent entities and the repository surface.
//!
//! The engine never talks to a concrete datastore: every mutation goes
//! through [`VenStore`], where each call is one atomic unit of work.
//! [`MemoryStore`] is the in-process implementation used by tests and by
//! hosts that do not need durable state.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::config::DEFAULT_REPORT_INTERVAL_SECS;

/// Lifecycle state of a demand-response event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Unresponded,
    Far,
    Near,
    Active,
    Completed,
    Cancelled,
}

impl EventStatus {
    /// Terminal states are never left by tick maintenance.
    pub fn is_terminal(self) -> bool {
        matches!(self, EventStatus::Completed | EventStatus::Cancelled)
    }
}

/// Whether the VTN expects `oadrCreatedEvent` acknowledgments for an
/// event (`oadrResponseRequired`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseRequired {
    Always,
    Never,
}

/// The VEN's consent decision for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OptType {
    None,
    OptIn,
    OptOut,
}

/// Lifecycle state of a telemetry report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStatus {
    Inactive,
    Active,
    Completed,
    Cancelled,
}

impl ReportStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ReportStatus::Completed | ReportStatus::Cancelled)
    }
}

/// A demand-response event as stored locally.
///
/// `start_time` is the randomized effective start
/// (`official_start + start_offset` with `start_offset` drawn once from
/// `[0, start_after]`); `end_time` is absent exactly when `duration` is
/// zero (open-ended until cancelled). Records are never purged: terminal
/// events remain as history.
#[derive(Debug, Clone)]
pub struct Event {
    /// Stable VTN-assigned identifier.
    pub event_id: String,
    /// Request ID of the payload that created or last updated the event.
    pub request_id: Option<String>,
    pub status: EventStatus,
    pub opt_type: OptType,
    /// Whether state changes owe the VTN an `oadrCreatedEvent`.
    pub response_required: ResponseRequired,
    pub priority: i32,
    /// Per-event version counter; only moves forward.
    pub modification_number: u32,
    /// Start instant as declared by the VTN.
    pub official_start: DateTime<Utc>,
    /// Declared duration; zero means open-ended.
    pub duration: TimeDelta,
    /// Maximum start randomization window.
    pub start_after: TimeDelta,
    /// Randomized offset drawn once per logical content-version.
    pub start_offset: TimeDelta,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// When this VEN first saw the event.
    pub created: DateTime<Utc>,
    /// Opaque serialized signal payload.
    pub signals: serde_json::Value,
    pub test_event: bool,
}

impl Event {
    /// Whether tick maintenance still applies to this event.
    pub fn is_active_or_pending(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// A telemetry report instance or registration.
#[derive(Debug, Clone)]
pub struct Report {
    /// Stable identifier, survives re-registration.
    pub specifier_id: String,
    /// Report request ID assigned by the VTN; absent until requested.
    pub request_id: Option<String>,
    /// Display name from configuration.
    pub name: String,
    pub status: ReportStatus,
    pub start_time: Option<DateTime<Utc>>,
    /// Absent means the report continues indefinitely.
    pub end_time: Option<DateTime<Utc>>,
    pub duration: Option<TimeDelta>,
    /// Minimum seconds between telemetry sends; 0 means one-shot.
    pub interval_secs: Option<u64>,
    pub granularity_secs: Option<u64>,
    /// Opaque telemetry schema from configuration.
    pub telemetry_parameters: serde_json::Value,
    /// Watermark of the last telemetry send; absent until the first one.
    pub last_report: Option<DateTime<Utc>>,
}

impl Report {
    pub fn is_active_or_pending(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Send interval with the profile default applied.
    pub fn effective_interval_secs(&self) -> u64 {
        self.interval_secs.unwrap_or(DEFAULT_REPORT_INTERVAL_SECS)
    }
}

/// One appended telemetry observation.
#[derive(Debug, Clone)]
pub struct TelemetryValues {
    pub report_specifier_id: String,
    /// When the observation was ingested; drives watermark selection.
    pub created: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Opaque data-point payload.
    pub values: serde_json::Value,
}

/// Repository failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate {kind} record: {id}")]
    Duplicate { kind: &'static str, id: String },
    #[error("no {kind} record: {id}")]
    NotFound { kind: &'static str, id: String },
}

/// Transactional repository surface required by the protocol engine.
///
/// Every method is a single atomic unit of work; no engine operation
/// spans multiple calls that must commit together. Lookups return owned
/// copies — mutations go back through the `update_*` methods.
pub trait VenStore {
    fn insert_event(&mut self, event: Event) -> Result<(), StoreError>;
    fn event(&self, event_id: &str) -> Option<Event>;
    /// Updates the record keyed by `event.event_id` in place.
    fn update_event(&mut self, event: &Event) -> Result<(), StoreError>;
    /// Predicate-filtered select, in insertion order.
    fn events_where(&self, pred: &dyn Fn(&Event) -> bool) -> Vec<Event>;

    fn insert_report(&mut self, report: Report) -> Result<(), StoreError>;
    fn report_by_specifier(&self, specifier_id: &str) -> Option<Report>;
    fn report_by_request(&self, report_request_id: &str) -> Option<Report>;
    /// Updates the record keyed by `report.specifier_id` in place.
    fn update_report(&mut self, report: &Report) -> Result<(), StoreError>;
    fn reports_where(&self, pred: &dyn Fn(&Report) -> bool) -> Vec<Report>;

    fn append_telemetry(&mut self, telemetry: TelemetryValues) -> Result<(), StoreError>;
    /// Telemetry for one specifier with `created > watermark`; everything
    /// when no watermark is given.
    fn telemetry_since(
        &self,
        specifier_id: &str,
        watermark: Option<DateTime<Utc>>,
    ) -> Vec<TelemetryValues>;
}

/// In-memory repository preserving insertion order.
#[derive(Debug, Default)]
pub struct MemoryStore {
    events: Vec<Event>,
    reports: Vec<Report>,
    telemetry: Vec<TelemetryValues>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VenStore for MemoryStore {
    fn insert_event(&mut self, event: Event) -> Result<(), StoreError> {
        if self.events.iter().any(|e| e.event_id == event.event_id) {
            return Err(StoreError::Duplicate {
                kind: "event",
                id: event.event_id,
            });
        }
        self.events.push(event);
        Ok(())
    }

    fn event(&self, event_id: &str) -> Option<Event> {
        self.events.iter().find(|e| e.event_id == event_id).cloned()
    }

    fn update_event(&mut self, event: &Event) -> Result<(), StoreError> {
        match self.events.iter_mut().find(|e| e.event_id == event.event_id) {
            Some(stored) => {
                *stored = event.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                kind: "event",
                id: event.event_id.clone(),
            }),
        }
    }

    fn events_where(&self, pred: &dyn Fn(&Event) -> bool) -> Vec<Event> {
        self.events.iter().filter(|e| pred(e)).cloned().collect()
    }

    fn insert_report(&mut self, report: Report) -> Result<(), StoreError> {
        if self
            .reports
            .iter()
            .any(|r| r.specifier_id == report.specifier_id)
        {
            return Err(StoreError::Duplicate {
                kind: "report",
                id: report.specifier_id,
            });
        }
        self.reports.push(report);
        Ok(())
    }

    fn report_by_specifier(&self, specifier_id: &str) -> Option<Report> {
        self.reports
            .iter()
            .find(|r| r.specifier_id == specifier_id)
            .cloned()
    }

    fn report_by_request(&self, report_request_id: &str) -> Option<Report> {
        self.reports
            .iter()
            .find(|r| r.request_id.as_deref() == Some(report_request_id))
            .cloned()
    }

    fn update_report(&mut self, report: &Report) -> Result<(), StoreError> {
        match self
            .reports
            .iter_mut()
            .find(|r| r.specifier_id == report.specifier_id)
        {
            Some(stored) => {
                *stored = report.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                kind: "report",
                id: report.specifier_id.clone(),
            }),
        }
    }

    fn reports_where(&self, pred: &dyn Fn(&Report) -> bool) -> Vec<Report> {
        self.reports.iter().filter(|r| pred(r)).cloned().collect()
    }

    fn append_telemetry(&mut self, telemetry: TelemetryValues) -> Result<(), StoreError> {
        self.telemetry.push(telemetry);
        Ok(())
    }

    fn telemetry_since(
        &self,
        specifier_id: &str,
        watermark: Option<DateTime<Utc>>,
    ) -> Vec<TelemetryValues> {
        self.telemetry
            .iter()
            .filter(|t| t.report_specifier_id == specifier_id)
            .filter(|t| watermark.is_none_or(|w| t.created > w))
            .cloned()
            .collect()
    }
}
