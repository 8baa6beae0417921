//! Shared test fixtures for integration tests.

use std::collections::VecDeque;

use chrono::{DateTime, TimeDelta, Utc};
use oadr_ven::config::VenConfig;
use oadr_ven::error::OadrError;
use oadr_ven::payload::{EiEventData, OadrEvent, SignedObject, VenRequest, VtnPayload};
use oadr_ven::store::{EventStatus, MemoryStore, ResponseRequired};
use oadr_ven::transport::{PostOutcome, Transport};
use oadr_ven::ven::agent::VenAgent;
use oadr_ven::ven::clock::ManualClock;

/// In-memory transport that records every request and answers from a
/// queue of canned outcomes (empty responses once the queue drains).
#[derive(Default)]
pub struct FakeTransport {
    pub sent: Vec<VenRequest>,
    responses: VecDeque<PostOutcome>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a payload for the next post, as if the VTN returned it.
    pub fn queue_payload(&mut self, payload: VtnPayload) {
        self.responses
            .push_back(PostOutcome::Payload(SignedObject::from(payload)));
    }

    pub fn queue_outcome(&mut self, outcome: PostOutcome) {
        self.responses.push_back(outcome);
    }

    /// Requests sent since the last call to this method.
    pub fn drain_sent(&mut self) -> Vec<VenRequest> {
        std::mem::take(&mut self.sent)
    }
}

impl Transport for FakeTransport {
    fn post(&mut self, request: &VenRequest) -> Result<PostOutcome, OadrError> {
        self.sent.push(request.clone());
        Ok(self.responses.pop_front().unwrap_or(PostOutcome::Empty))
    }
}

/// Default VEN configuration (15 s poll, optIn after 30 min, one
/// telemetry_usage report at 15 s).
pub fn default_config() -> VenConfig {
    VenConfig::from_toml_str(
        r#"
        ven_id = "ven-123"
        vtn_id = "vtn-1"
        vtn_address = "https://vtn.example:8443"
        client_pem_bundle = "/etc/ven/client.pem"
        vtn_ca_cert = "/etc/ven/ca.crt"

        [report_parameters.telemetry_usage]
        report_name = "TELEMETRY_USAGE"
        report_interval_secs_default = 15
        "#,
    )
    .expect("default config should parse")
}

/// Fixed start instant shared by the integration scenarios.
pub fn base_time() -> DateTime<Utc> {
    "2024-06-01T12:00:00Z"
        .parse()
        .expect("timestamp should parse")
}

/// Agent over a `MemoryStore` and `FakeTransport`, plus the clock handle
/// that drives it.
pub fn default_agent(
    config: VenConfig,
) -> (
    VenAgent<MemoryStore, FakeTransport, ManualClock>,
    ManualClock,
) {
    let clock = ManualClock::new(base_time());
    let agent = VenAgent::new(
        config,
        MemoryStore::new(),
        FakeTransport::new(),
        clock.clone(),
    )
    .expect("agent should build");
    (agent, clock)
}

/// Event starting one hour after [`base_time`], 30 minutes long, with an
/// acknowledgment required.
pub fn oadr_event(event_id: &str, modification_number: u32) -> OadrEvent {
    OadrEvent {
        event: EiEventData {
            event_id: event_id.to_string(),
            modification_number,
            priority: 1,
            status: EventStatus::Far,
            official_start: base_time() + TimeDelta::hours(1),
            duration: TimeDelta::minutes(30),
            start_after: TimeDelta::zero(),
            signals: serde_json::json!([{ "signalName": "simple", "value": 1.0 }]),
            test_event: false,
            targets: Vec::new(),
        },
        response_required: ResponseRequired::Always,
    }
}
