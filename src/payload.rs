//! Typed payload objects exchanged with the VTN.
//!
//! The OpenADR XML codec is an external collaborator: these types model
//! decoded `oadrSignedObject` content and the requests the VEN originates,
//! not their wire form.

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::ResponseCode;
use crate::store::{EventStatus, OptType, ResponseRequired, TelemetryValues};
use crate::transport::Endpoint;

/// Generic `eiResponse` element embedded in several VTN payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct EiResponse {
    pub code: ResponseCode,
    pub description: Option<String>,
    pub request_id: Option<String>,
}

impl EiResponse {
    /// An OK response echoing `request_id`.
    pub fn ok(request_id: impl Into<String>) -> Self {
        Self {
            code: ResponseCode::OK,
            description: None,
            request_id: Some(request_id.into()),
        }
    }
}

/// Decoded `eiEvent` content of one `oadrEvent`.
#[derive(Debug, Clone)]
pub struct EiEventData {
    pub event_id: String,
    pub modification_number: u32,
    pub priority: i32,
    /// Event status as declared by the VTN.
    pub status: EventStatus,
    pub official_start: DateTime<Utc>,
    /// Declared duration; zero means open-ended.
    pub duration: TimeDelta,
    /// Maximum start randomization window (OADR rule 30).
    pub start_after: TimeDelta,
    /// Opaque serialized signal payload.
    pub signals: serde_json::Value,
    pub test_event: bool,
    /// `eiTarget` venID list; empty means every VEN.
    pub targets: Vec<String>,
}

/// One event entry of an `oadrDistributeEvent`.
#[derive(Debug, Clone)]
pub struct OadrEvent {
    pub event: EiEventData,
    pub response_required: ResponseRequired,
}

/// `oadrDistributeEvent`: the VTN's full current event picture.
#[derive(Debug, Clone, Default)]
pub struct DistributeEvent {
    /// Root-level requestID (OADR rule 41).
    pub request_id: Option<String>,
    pub vtn_id: Option<String>,
    pub ei_response: Option<EiResponse>,
    pub events: Vec<OadrEvent>,
}

/// `oadrRegisterReport` sent by the VTN: its own METADATA. The VEN
/// requests none of the VTN's reports, so only the envelope is modeled.
#[derive(Debug, Clone, Default)]
pub struct RegisterReport {
    pub request_id: Option<String>,
}

/// One `oadrReportRequest`.
#[derive(Debug, Clone)]
pub struct ReportRequest {
    pub report_request_id: String,
    pub specifier_id: String,
    pub start_time: DateTime<Utc>,
    /// Absent means the report continues indefinitely.
    pub end_time: Option<DateTime<Utc>>,
    pub duration: Option<TimeDelta>,
    /// Minimum seconds between sends; 0 requests a one-shot report.
    pub interval_secs: Option<u64>,
    pub granularity_secs: Option<u64>,
}

/// `oadrRegisteredReport`: METADATA acknowledgment, optionally carrying
/// report requests.
#[derive(Debug, Clone)]
pub struct RegisteredReport {
    pub ei_response: EiResponse,
    pub report_requests: Vec<ReportRequest>,
}

/// `oadrCreateReport`: standalone report requests.
#[derive(Debug, Clone, Default)]
pub struct CreateReport {
    pub report_requests: Vec<ReportRequest>,
}

/// `oadrUpdatedReport`: telemetry acknowledgment, optionally piggybacking
/// a cancellation.
#[derive(Debug, Clone)]
pub struct UpdatedReport {
    pub ei_response: EiResponse,
    pub cancel_report: Option<CancelReport>,
}

/// `oadrCancelReport`.
#[derive(Debug, Clone, Default)]
pub struct CancelReport {
    pub request_id: Option<String>,
    pub report_request_ids: Vec<String>,
    /// Whether one final report is expected after cancellation.
    pub report_to_follow: bool,
}

/// `oadrResponse`: generic acknowledgment of a prior VEN request.
#[derive(Debug, Clone)]
pub struct OadrResponse {
    pub ei_response: EiResponse,
}

/// `oadrCreatedPartyRegistration`: the VTN's answer to a registration.
#[derive(Debug, Clone)]
pub struct CreatedPartyRegistration {
    pub ei_response: EiResponse,
    pub ven_id: String,
    pub vtn_id: String,
    pub registration_id: Option<String>,
    pub poll_interval_secs: Option<u64>,
}

/// One decoded VTN payload of a known kind.
#[derive(Debug, Clone)]
pub enum VtnPayload {
    DistributeEvent(DistributeEvent),
    RegisterReport(RegisterReport),
    RegisteredReport(RegisteredReport),
    CreateReport(CreateReport),
    UpdatedReport(UpdatedReport),
    CancelReport(CancelReport),
    Response(OadrResponse),
    CreatedPartyRegistration(CreatedPartyRegistration),
}

/// Decoded `oadrSignedObject` envelope.
///
/// The schema allows any subset of the payload slots to be populated; the
/// dispatcher requires exactly one.
#[derive(Debug, Clone, Default)]
pub struct SignedObject {
    pub distribute_event: Option<DistributeEvent>,
    pub register_report: Option<RegisterReport>,
    pub registered_report: Option<RegisteredReport>,
    pub create_report: Option<CreateReport>,
    pub updated_report: Option<UpdatedReport>,
    pub cancel_report: Option<CancelReport>,
    pub response: Option<OadrResponse>,
    pub created_party_registration: Option<CreatedPartyRegistration>,
}

impl From<VtnPayload> for SignedObject {
    /// An envelope carrying exactly the given payload.
    fn from(payload: VtnPayload) -> Self {
        let mut signed_object = SignedObject::default();
        match payload {
            VtnPayload::DistributeEvent(p) => signed_object.distribute_event = Some(p),
            VtnPayload::RegisterReport(p) => signed_object.register_report = Some(p),
            VtnPayload::RegisteredReport(p) => signed_object.registered_report = Some(p),
            VtnPayload::CreateReport(p) => signed_object.create_report = Some(p),
            VtnPayload::UpdatedReport(p) => signed_object.updated_report = Some(p),
            VtnPayload::CancelReport(p) => signed_object.cancel_report = Some(p),
            VtnPayload::Response(p) => signed_object.response = Some(p),
            VtnPayload::CreatedPartyRegistration(p) => {
                signed_object.created_party_registration = Some(p);
            }
        }
        signed_object
    }
}

/// METADATA entry describing one reportable specifier.
#[derive(Debug, Clone)]
pub struct MetadataReport {
    pub specifier_id: String,
    pub name: String,
    pub interval_secs: u64,
    pub telemetry_parameters: serde_json::Value,
}

/// Outbound VEN request, one variant per supported payload kind.
#[derive(Debug, Clone)]
pub enum VenRequest {
    /// `oadrPoll` (OADR rule 37: pull mode is mandatory).
    Poll { ven_id: String },
    /// `oadrQueryRegistration`.
    QueryRegistration,
    /// `oadrCreatePartyRegistration`. venID and registrationID are left
    /// empty on a first registration (OADR rule 404).
    CreatePartyRegistration {
        ven_name: String,
        xml_signature: bool,
    },
    /// `oadrRequestEvent`.
    RequestEvent { ven_id: String },
    /// `oadrCreatedEvent`, echoing the eventResponse. Error code and
    /// message report protocol violations (OADR rule 48).
    CreatedEvent {
        ven_id: String,
        request_id: Option<String>,
        event_id: Option<String>,
        modification_number: Option<u32>,
        opt_type: OptType,
        response_code: ResponseCode,
        response_description: Option<String>,
    },
    /// `oadrRegisterReport` (METADATA).
    RegisterReport {
        ven_id: String,
        reports: Vec<MetadataReport>,
    },
    /// `oadrUpdateReport`: telemetry plus VEN online/override flags.
    UpdateReport {
        ven_id: String,
        request_id: Option<String>,
        specifier_id: String,
        granularity_secs: Option<u64>,
        telemetry: Vec<TelemetryValues>,
        online: bool,
        manual_override: bool,
    },
    /// `oadrCreatedReport` with the pending report list (OADR rule 329).
    CreatedReport {
        ven_id: String,
        report_request_id: String,
        pending_report_request_ids: Vec<String>,
    },
    /// `oadrCanceledReport` with the pending report list.
    CanceledReport {
        ven_id: String,
        request_id: Option<String>,
        report_request_id: String,
        pending_report_request_ids: Vec<String>,
    },
    /// `oadrResponse`: generic ack/error carrier.
    Response {
        ven_id: String,
        code: ResponseCode,
        description: String,
        request_id: String,
    },
}

impl VenRequest {
    /// Service endpoint this request must be posted to.
    pub fn endpoint(&self) -> Endpoint {
        match self {
            VenRequest::Poll { .. } | VenRequest::Response { .. } => Endpoint::OadrPoll,
            VenRequest::QueryRegistration | VenRequest::CreatePartyRegistration { .. } => {
                Endpoint::EiRegisterParty
            }
            VenRequest::RequestEvent { .. } | VenRequest::CreatedEvent { .. } => Endpoint::EiEvent,
            VenRequest::RegisterReport { .. }
            | VenRequest::UpdateReport { .. }
            | VenRequest::CreatedReport { .. }
            | VenRequest::CanceledReport { .. } => Endpoint::EiReport,
        }
    }
}
