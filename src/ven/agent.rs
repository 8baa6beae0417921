//! The VEN protocol agent.
//!
//! [`VenAgent`] owns the stores and state machines and talks to the VTN
//! through a [`Transport`]. The host drives it by calling [`VenAgent::tick`]
//! periodically; everything else happens as a consequence of ticks and of
//! the payloads the VTN returns.

use chrono::{DateTime, TimeDelta, Utc};

use crate::config::{DEFAULT_POLL_INTERVAL_SECS, MIN_POLL_INTERVAL_SECS, VenConfig};
use crate::error::{OadrError, ResponseCode};
use crate::payload::{
    CancelReport, CreatedPartyRegistration, DistributeEvent, OadrEvent, ReportRequest,
    SignedObject, VenRequest, VtnPayload,
};
use crate::signing::SecurityLevel;
use crate::store::{Event, EventStatus, OptType, ResponseRequired, VenStore};
use crate::transport::{PostOutcome, Transport};
use crate::ven::clock::Clock;
use crate::ven::dispatch::{self, PayloadKind};
use crate::ven::events::EventEngine;
use crate::ven::reports::{DueUpdate, ReportAck, ReportEngine};

/// OpenADR 2.0b "Simple" pull-profile VEN.
pub struct VenAgent<S: VenStore, T: Transport, C: Clock> {
    config: VenConfig,
    store: S,
    transport: T,
    clock: C,
    events: EventEngine,
    reports: ReportEngine,
    last_poll: Option<DateTime<Utc>>,
    reports_registered: bool,
    registration_id: Option<String>,
    online: bool,
    manual_override: bool,
}

impl<S: VenStore, T: Transport, C: Clock> VenAgent<S, T, C> {
    /// Builds an agent from a validated configuration.
    pub fn new(config: VenConfig, store: S, transport: T, clock: C) -> Result<Self, OadrError> {
        if let Some(error) = config.validate().into_iter().next() {
            return Err(OadrError::Internal(error.to_string()));
        }
        let events = EventEngine::new(
            config.opt_default_decision,
            config.opt_timeout_secs,
            config.randomization_seed,
        );
        let reports = ReportEngine::new(config.report_parameters.clone());
        Ok(Self {
            config,
            store,
            transport,
            clock,
            events,
            reports,
            last_poll: None,
            reports_registered: false,
            registration_id: None,
            online: true,
            manual_override: false,
        })
    }

    /// One pass of the periodic duty cycle.
    ///
    /// The first tick registers the configured reports as METADATA. Every
    /// tick then polls the VTN when the poll interval has elapsed, runs
    /// the event transitions (acknowledging forced opt decisions), and
    /// sends whatever telemetry updates have come due.
    pub fn tick(&mut self) -> Result<(), OadrError> {
        let now = self.clock.now();

        if !self.reports_registered {
            let reports = self.reports.register_metadata(&mut self.store)?;
            self.reports_registered = true;
            let request = VenRequest::RegisterReport {
                ven_id: self.config.ven_id.clone(),
                reports,
            };
            self.send(&request)?;
        }

        let poll_interval = TimeDelta::seconds(self.config.poll_interval_secs as i64);
        if self.last_poll.is_none_or(|last| now - last > poll_interval) {
            self.send_poll(now)?;
        }

        for ack in self.events.process(&mut self.store, now)? {
            if let Some(event) = self.store.event(&ack.event_id) {
                self.send_created_event(&event, ResponseCode::OK, None)?;
            }
        }

        let specifiers: Vec<String> = self
            .reports
            .active_or_pending(&self.store)
            .into_iter()
            .map(|r| r.specifier_id)
            .collect();
        for specifier_id in specifiers {
            if let Some(due) = self.reports.process(&mut self.store, &specifier_id, now)? {
                self.send_update_report(due, now)?;
            }
        }
        Ok(())
    }

    /// Registers this VEN with the VTN (`oadrCreatePartyRegistration`).
    /// The IDs and poll interval the VTN assigns are applied when its
    /// `oadrCreatedPartyRegistration` arrives.
    pub fn register(&mut self, ven_name: &str) -> Result<(), OadrError> {
        if ven_name.is_empty() {
            return Err(OadrError::Internal(
                "registration needs a non-empty ven_name".to_string(),
            ));
        }
        let request = VenRequest::CreatePartyRegistration {
            ven_name: ven_name.to_string(),
            xml_signature: self.config.security_level == SecurityLevel::High,
        };
        self.send(&request)
    }

    /// Asks the VTN to restate this VEN's registration.
    pub fn query_registration(&mut self) -> Result<(), OadrError> {
        self.send(&VenRequest::QueryRegistration)
    }

    /// Asks the VTN for its current events without waiting for a poll.
    pub fn request_events(&mut self) -> Result<(), OadrError> {
        let request = VenRequest::RequestEvent {
            ven_id: self.config.ven_id.clone(),
        };
        self.send(&request)
    }

    /// Records one telemetry observation for a configured report.
    pub fn add_telemetry(
        &mut self,
        telemetry: crate::store::TelemetryValues,
    ) -> Result<(), OadrError> {
        self.reports.add_telemetry(&mut self.store, telemetry)
    }

    /// Flag carried in every telemetry update: whether the resource
    /// behind this VEN is online.
    pub fn set_online(&mut self, online: bool) {
        self.online = online;
    }

    /// Flag carried in every telemetry update: whether the resource is
    /// under manual control and cannot respond to events.
    pub fn set_manual_override(&mut self, manual_override: bool) {
        self.manual_override = manual_override;
    }

    pub fn config(&self) -> &VenConfig {
        &self.config
    }

    pub fn registration_id(&self) -> Option<&str> {
        self.registration_id.as_deref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Events currently in their active window.
    pub fn active_events(&self) -> Vec<Event> {
        self.store
            .events_where(&|e: &Event| e.status == EventStatus::Active)
    }

    /// Non-terminal events, most pressing first.
    pub fn active_or_pending_events(&self) -> Vec<Event> {
        self.events.active_or_pending(&self.store)
    }

    /// Report requests still owed to the VTN.
    pub fn pending_report_request_ids(&self) -> Vec<String> {
        self.reports.pending_request_ids(&self.store)
    }

    /// Whether any opted-in event is active right now, i.e. whether load
    /// curtailment is expected of the resource.
    pub fn is_event_in_progress(&self) -> bool {
        !self
            .store
            .events_where(&|e: &Event| {
                e.status == EventStatus::Active && e.opt_type == OptType::OptIn
            })
            .is_empty()
    }

    /// Applies a host-side decision to an event.
    pub fn set_event_status(
        &mut self,
        event_id: &str,
        status: EventStatus,
    ) -> Result<(), OadrError> {
        self.events.set_status(&mut self.store, event_id, status)
    }

    /// Services one decoded VTN envelope.
    ///
    /// Failures follow the error taxonomy: VTN-facing errors are reported
    /// back as an `oadrResponse` (echoing the payload's request id when
    /// one was extracted) and swallowed, internal ones are logged and
    /// swallowed, anything else is reported generically and re-raised to
    /// the caller.
    pub fn service_vtn_payload(&mut self, signed_object: SignedObject) -> Result<(), OadrError> {
        let mut request_id = None;
        match self.dispatch(signed_object, &mut request_id) {
            Ok(followup) => {
                if followup {
                    // Another payload may be queued behind this one.
                    let now = self.clock.now();
                    self.send_poll(now)?;
                }
                Ok(())
            }
            Err(OadrError::Internal(message)) => {
                tracing::warn!(%message, "ignoring VTN payload");
                Ok(())
            }
            Err(err) => {
                if let Some((code, description)) = err.vtn_response() {
                    tracing::warn!(%code, %description, "rejecting VTN payload");
                    self.send_response(code, &description, request_id.as_deref())
                } else {
                    tracing::error!(error = %err, "failed to service VTN payload");
                    self.send_response(
                        ResponseCode::INVALID_DATA,
                        &err.to_string(),
                        request_id.as_deref(),
                    )?;
                    Err(err)
                }
            }
        }
    }

    /// Identifies the payload, applies its policy, and runs its handler.
    /// Returns whether a follow-up poll is owed. The extracted request id
    /// is written through `known_request_id` so a failing handler can
    /// still be answered with it.
    fn dispatch(
        &mut self,
        signed_object: SignedObject,
        known_request_id: &mut Option<String>,
    ) -> Result<bool, OadrError> {
        let payload = dispatch::classify(signed_object)?;
        let kind = payload.kind();
        let request_id = dispatch::check_ei_response(&payload)?;
        known_request_id.clone_from(&request_id);
        tracing::debug!(kind = kind.name(), "servicing VTN payload");

        match payload {
            VtnPayload::DistributeEvent(p) => {
                self.handle_distribute_event(&p, request_id.as_deref())?;
            }
            VtnPayload::RegisterReport(p) => {
                // The VTN registering its own METADATA; this VEN requests
                // none of the VTN's reports, so a plain ack suffices.
                self.send_response(ResponseCode::OK, "", p.request_id.as_deref())?;
            }
            VtnPayload::RegisteredReport(p) => {
                self.handle_report_requests(&p.report_requests)?;
            }
            VtnPayload::CreateReport(p) => {
                self.handle_report_requests(&p.report_requests)?;
            }
            VtnPayload::UpdatedReport(p) => {
                if let Some(cancel) = &p.cancel_report {
                    // A cancellation riding on the ack of our own update
                    // is never acknowledged back.
                    self.handle_cancel_report(cancel, false)?;
                }
            }
            VtnPayload::CancelReport(p) => {
                self.handle_cancel_report(&p, true)?;
            }
            VtnPayload::Response(_) => {}
            VtnPayload::CreatedPartyRegistration(p) => {
                self.handle_created_party_registration(&p);
            }
        }

        // Anything besides a plain ack may have more queued behind it
        // (OADR rule 37: poll again after servicing a payload).
        Ok(kind != PayloadKind::Response)
    }

    fn handle_distribute_event(
        &mut self,
        payload: &DistributeEvent,
        request_id: Option<&str>,
    ) -> Result<(), OadrError> {
        if let Some(vtn_id) = &payload.vtn_id {
            if *vtn_id != self.config.vtn_id {
                return Err(OadrError::BadData(format!(
                    "event distribution from unexpected VTN {vtn_id}"
                )));
            }
        }
        if payload.events.is_empty() {
            return Err(OadrError::Internal(
                "event distribution with no events".to_string(),
            ));
        }

        let now = self.clock.now();
        for oadr_event in &payload.events {
            if let Err(err) = self.handle_oadr_event(oadr_event, request_id, now) {
                // One bad event never blocks the rest of the batch.
                match err.vtn_response() {
                    Some((code, description)) => {
                        tracing::warn!(
                            event_id = %oadr_event.event.event_id,
                            %code,
                            %description,
                            "rejecting event"
                        );
                        self.send_created_event_error(
                            oadr_event,
                            request_id,
                            code,
                            &description,
                        )?;
                    }
                    None => {
                        tracing::warn!(
                            event_id = %oadr_event.event.event_id,
                            error = %err,
                            "skipping event"
                        );
                    }
                }
            }
        }

        // The distribution is the VTN's full picture; events it no
        // longer mentions are gone.
        let known: Vec<String> = payload
            .events
            .iter()
            .map(|e| e.event.event_id.clone())
            .collect();
        self.events.implied_cancel(&mut self.store, &known)?;
        Ok(())
    }

    fn handle_oadr_event(
        &mut self,
        oadr_event: &OadrEvent,
        request_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), OadrError> {
        let targets = &oadr_event.event.targets;
        if !targets.is_empty() && !targets.contains(&self.config.ven_id) {
            tracing::debug!(
                event_id = %oadr_event.event.event_id,
                "event targets other VENs, ignoring"
            );
            return Ok(());
        }

        let event = self
            .events
            .create_or_update(&mut self.store, oadr_event, request_id, now)?;
        // A redelivery is re-acknowledged too: "always" means always.
        if event.response_required == ResponseRequired::Always {
            self.send_created_event(&event, ResponseCode::OK, None)?;
        }
        Ok(())
    }

    fn handle_report_requests(&mut self, requests: &[ReportRequest]) -> Result<(), OadrError> {
        if requests.is_empty() {
            return Ok(());
        }

        let mut acks = Vec::new();
        for request in requests {
            match self.reports.create_or_update_one(&mut self.store, request) {
                Ok(ack) => acks.push(ack),
                Err(err) => match err.vtn_response() {
                    // One bad request never blocks the rest of the batch.
                    Some((code, description)) => {
                        tracing::warn!(
                            report_request_id = %request.report_request_id,
                            %code,
                            %description,
                            "rejecting report request"
                        );
                        self.send_response(code, &description, None)?;
                    }
                    None => return Err(err),
                },
            }
        }

        let known: Vec<String> = requests
            .iter()
            .map(|r| r.report_request_id.clone())
            .collect();
        acks.extend(self.reports.implied_cancel(&mut self.store, &known)?);

        for ack in acks {
            self.send_report_ack(ack, None)?;
        }
        Ok(())
    }

    fn handle_cancel_report(
        &mut self,
        payload: &CancelReport,
        acknowledge: bool,
    ) -> Result<(), OadrError> {
        if payload.report_request_ids.is_empty() {
            return Err(OadrError::BadData(
                "report cancellation names no report requests".to_string(),
            ));
        }
        let now = self.clock.now();
        for report_request_id in &payload.report_request_ids {
            if acknowledge && payload.report_to_follow {
                // One last delivery before the report goes away.
                if let Some(report) = self.store.report_by_request(report_request_id) {
                    let telemetry = self
                        .store
                        .telemetry_since(&report.specifier_id, report.last_report);
                    self.send_update_report(DueUpdate { report, telemetry }, now)?;
                }
            }
            if let Some(ack) = self
                .reports
                .cancel(&mut self.store, report_request_id, acknowledge)?
            {
                self.send_report_ack(ack, payload.request_id.as_deref())?;
            }
        }
        Ok(())
    }

    fn handle_created_party_registration(&mut self, payload: &CreatedPartyRegistration) {
        tracing::info!(
            ven_id = %payload.ven_id,
            vtn_id = %payload.vtn_id,
            "registration confirmed by VTN"
        );
        self.config.ven_id = payload.ven_id.clone();
        self.config.vtn_id = payload.vtn_id.clone();
        self.registration_id = payload.registration_id.clone();
        let interval = payload
            .poll_interval_secs
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS);
        if interval < MIN_POLL_INTERVAL_SECS {
            tracing::warn!(interval, "VTN poll interval below floor, clamping");
        }
        self.config.poll_interval_secs = interval.max(MIN_POLL_INTERVAL_SECS);
    }

    fn send_poll(&mut self, now: DateTime<Utc>) -> Result<(), OadrError> {
        // Stamp first so a failing poll still waits out the interval.
        self.last_poll = Some(now);
        let request = VenRequest::Poll {
            ven_id: self.config.ven_id.clone(),
        };
        self.send(&request)
    }

    fn send_created_event(
        &mut self,
        event: &Event,
        response_code: ResponseCode,
        response_description: Option<&str>,
    ) -> Result<(), OadrError> {
        let request = VenRequest::CreatedEvent {
            ven_id: self.config.ven_id.clone(),
            request_id: event.request_id.clone(),
            event_id: Some(event.event_id.clone()),
            modification_number: Some(event.modification_number),
            opt_type: event.opt_type,
            response_code,
            response_description: response_description.map(str::to_string),
        };
        self.send(&request)
    }

    fn send_created_event_error(
        &mut self,
        oadr_event: &OadrEvent,
        request_id: Option<&str>,
        code: ResponseCode,
        description: &str,
    ) -> Result<(), OadrError> {
        let request = VenRequest::CreatedEvent {
            ven_id: self.config.ven_id.clone(),
            request_id: request_id.map(str::to_string),
            event_id: Some(oadr_event.event.event_id.clone()),
            modification_number: Some(oadr_event.event.modification_number),
            opt_type: OptType::None,
            response_code: code,
            response_description: Some(description.to_string()),
        };
        self.send(&request)
    }

    fn send_report_ack(
        &mut self,
        ack: ReportAck,
        request_id: Option<&str>,
    ) -> Result<(), OadrError> {
        let pending_report_request_ids = self.reports.pending_request_ids(&self.store);
        let request = match ack {
            ReportAck::Created { report_request_id } => VenRequest::CreatedReport {
                ven_id: self.config.ven_id.clone(),
                report_request_id,
                pending_report_request_ids,
            },
            ReportAck::Canceled { report_request_id } => VenRequest::CanceledReport {
                ven_id: self.config.ven_id.clone(),
                request_id: request_id.map(str::to_string),
                report_request_id,
                pending_report_request_ids,
            },
        };
        self.send(&request)
    }

    fn send_update_report(&mut self, due: DueUpdate, now: DateTime<Utc>) -> Result<(), OadrError> {
        tracing::debug!(
            specifier_id = %due.report.specifier_id,
            observations = due.telemetry.len(),
            "sending telemetry update"
        );
        let specifier_id = due.report.specifier_id.clone();
        let request = VenRequest::UpdateReport {
            ven_id: self.config.ven_id.clone(),
            request_id: due.report.request_id.clone(),
            specifier_id: specifier_id.clone(),
            granularity_secs: due.report.granularity_secs,
            telemetry: due.telemetry,
            online: self.online,
            manual_override: self.manual_override,
        };
        self.send(&request)?;
        self.reports.mark_sent(&mut self.store, &specifier_id, now)
    }

    fn send_response(
        &mut self,
        code: ResponseCode,
        description: &str,
        request_id: Option<&str>,
    ) -> Result<(), OadrError> {
        let request = VenRequest::Response {
            ven_id: self.config.ven_id.clone(),
            code,
            description: description.to_string(),
            // "0" stands in when no id is known (OADR rule 63).
            request_id: request_id.unwrap_or("0").to_string(),
        };
        self.send(&request)
    }

    /// Posts one request and services whatever the VTN sends back.
    fn send(&mut self, request: &VenRequest) -> Result<(), OadrError> {
        match self.transport.post(request)? {
            PostOutcome::Payload(signed_object) => self.service_vtn_payload(signed_object),
            PostOutcome::Empty | PostOutcome::NoResponse => Ok(()),
        }
    }
}
