//! Telemetry report state machine.
//!
//! Reports the VEN can deliver are declared in configuration, registered
//! with the VTN as METADATA, and instantiated when the VTN requests them.
//! [`ReportEngine::process`] drives activation, completion, and the
//! telemetry send schedule; the agent turns due updates into
//! `oadrUpdateReport` requests.

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::BTreeMap;

use crate::config::ReportParameters;
use crate::error::OadrError;
use crate::payload::{MetadataReport, ReportRequest};
use crate::store::{Report, ReportStatus, StoreError, TelemetryValues, VenStore};

/// A report transition the VTN must be told about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportAck {
    /// Send `oadrCreatedReport` for this request.
    Created { report_request_id: String },
    /// Send `oadrCanceledReport` for this request.
    Canceled { report_request_id: String },
}

/// A report whose next telemetry send is due.
#[derive(Debug, Clone)]
pub struct DueUpdate {
    pub report: Report,
    /// Observations newer than the report's watermark, oldest first.
    pub telemetry: Vec<TelemetryValues>,
}

/// Applies report semantics on top of a [`VenStore`].
pub struct ReportEngine {
    parameters: BTreeMap<String, ReportParameters>,
}

impl ReportEngine {
    pub fn new(parameters: BTreeMap<String, ReportParameters>) -> Self {
        Self { parameters }
    }

    /// Ensures a record exists for every configured specifier and returns
    /// the METADATA describing them. Idempotent: re-registration leaves
    /// existing records (and their watermarks) alone.
    pub fn register_metadata<S: VenStore>(
        &self,
        store: &mut S,
    ) -> Result<Vec<MetadataReport>, OadrError> {
        let mut metadata = Vec::new();
        for (specifier_id, params) in &self.parameters {
            if store.report_by_specifier(specifier_id).is_none() {
                store.insert_report(Report {
                    specifier_id: specifier_id.clone(),
                    request_id: None,
                    name: params.report_name.clone(),
                    status: ReportStatus::Inactive,
                    start_time: None,
                    end_time: None,
                    duration: None,
                    interval_secs: None,
                    granularity_secs: None,
                    telemetry_parameters: params.telemetry_parameters.clone(),
                    last_report: None,
                })?;
            }
            metadata.push(MetadataReport {
                specifier_id: specifier_id.clone(),
                name: params.report_name.clone(),
                interval_secs: params.report_interval_secs_default,
                telemetry_parameters: params.telemetry_parameters.clone(),
            });
        }
        Ok(metadata)
    }

    /// Applies one `oadrReportRequest`, instantiating or re-parameterizing
    /// the named report. Fails with code 454 when the specifier was never
    /// registered.
    pub fn create_or_update_one<S: VenStore>(
        &self,
        store: &mut S,
        request: &ReportRequest,
    ) -> Result<ReportAck, OadrError> {
        let mut report = store
            .report_by_specifier(&request.specifier_id)
            .ok_or_else(|| {
                OadrError::BadData(format!(
                    "report request {} names unregistered specifier {}",
                    request.report_request_id, request.specifier_id
                ))
            })?;

        tracing::info!(
            specifier_id = %request.specifier_id,
            report_request_id = %request.report_request_id,
            "report requested"
        );
        report.request_id = Some(request.report_request_id.clone());
        report.start_time = Some(request.start_time);
        report.end_time = request.end_time;
        report.duration = request.duration;
        report.interval_secs = request.interval_secs;
        report.granularity_secs = request.granularity_secs;
        // A fresh request revives a finished report from the top.
        report.status = ReportStatus::Inactive;
        report.last_report = None;
        store.update_report(&report)?;

        Ok(ReportAck::Created {
            report_request_id: request.report_request_id.clone(),
        })
    }

    /// Cancels the report behind a request id. Unknown ids are logged and
    /// ignored: the VTN may cancel something it never managed to create.
    pub fn cancel<S: VenStore>(
        &self,
        store: &mut S,
        report_request_id: &str,
        acknowledge: bool,
    ) -> Result<Option<ReportAck>, OadrError> {
        let Some(mut report) = store.report_by_request(report_request_id) else {
            tracing::warn!(report_request_id, "cancel for unknown report request");
            return Ok(None);
        };
        tracing::info!(specifier_id = %report.specifier_id, report_request_id, "report cancelled");
        report.status = ReportStatus::Cancelled;
        store.update_report(&report)?;
        Ok(acknowledge.then(|| ReportAck::Canceled {
            report_request_id: report_request_id.to_string(),
        }))
    }

    /// Cancels every active report whose request id is absent from
    /// `known_request_ids`, acknowledging each. A batch of report
    /// requests states the VTN's full picture, like event distribution.
    pub fn implied_cancel<S: VenStore>(
        &self,
        store: &mut S,
        known_request_ids: &[String],
    ) -> Result<Vec<ReportAck>, OadrError> {
        let orphans = store.reports_where(&|r: &Report| {
            r.status == ReportStatus::Active
                && r.request_id.as_ref().is_some_and(|id| !known_request_ids.contains(id))
        });
        let mut acks = Vec::new();
        for report in orphans {
            let request_id = report.request_id.clone().unwrap_or_default();
            tracing::info!(
                specifier_id = %report.specifier_id,
                report_request_id = %request_id,
                "report dropped by VTN, cancelling"
            );
            if let Some(ack) = self.cancel(store, &request_id, true)? {
                acks.push(ack);
            }
        }
        Ok(acks)
    }

    /// Non-terminal reports, active ones first.
    pub fn active_or_pending<S: VenStore>(&self, store: &S) -> Vec<Report> {
        let mut reports = store.reports_where(&Report::is_active_or_pending);
        reports.sort_by_key(|r| match r.status {
            ReportStatus::Active => 0u8,
            _ => 1,
        });
        reports
    }

    /// Request ids of every report still owed to the VTN, for the
    /// pending-reports list carried by created/canceled acknowledgments.
    pub fn pending_request_ids<S: VenStore>(&self, store: &S) -> Vec<String> {
        store
            .reports_where(&Report::is_active_or_pending)
            .into_iter()
            .filter_map(|r| r.request_id)
            .collect()
    }

    /// Runs the time-driven transitions for one report and returns its
    /// due telemetry update, if any.
    ///
    /// An inactive report activates once its start arrives; an active one
    /// completes once its end passes, and is otherwise due whenever the
    /// send interval has elapsed since the watermark (immediately, on the
    /// first send).
    pub fn process<S: VenStore>(
        &self,
        store: &mut S,
        specifier_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DueUpdate>, OadrError> {
        let Some(mut report) = store.report_by_specifier(specifier_id) else {
            return Ok(None);
        };

        if report.status == ReportStatus::Inactive {
            let started = report.start_time.is_some_and(|start| now >= start);
            let over = report.end_time.is_some_and(|end| now >= end);
            if started && !over {
                tracing::info!(specifier_id, "report active");
                report.status = ReportStatus::Active;
                store.update_report(&report)?;
            }
        }

        if report.status != ReportStatus::Active {
            return Ok(None);
        }

        if report.end_time.is_some_and(|end| now >= end) {
            tracing::info!(specifier_id, "report complete");
            report.status = ReportStatus::Completed;
            store.update_report(&report)?;
            return Ok(None);
        }

        let interval = TimeDelta::seconds(report.effective_interval_secs() as i64);
        let due = match report.last_report {
            None => true,
            Some(last) => now - last >= interval,
        };
        if !due {
            return Ok(None);
        }
        let telemetry = store.telemetry_since(specifier_id, report.last_report);
        Ok(Some(DueUpdate { report, telemetry }))
    }

    /// Records a telemetry send. An explicit zero interval requests a
    /// single delivery, so the report completes here.
    pub fn mark_sent<S: VenStore>(
        &self,
        store: &mut S,
        specifier_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), OadrError> {
        let mut report = store.report_by_specifier(specifier_id).ok_or_else(|| {
            StoreError::NotFound {
                kind: "report",
                id: specifier_id.to_string(),
            }
        })?;
        report.last_report = Some(now);
        if report.interval_secs == Some(0) {
            tracing::info!(specifier_id, "one-shot report complete");
            report.status = ReportStatus::Completed;
        }
        store.update_report(&report)?;
        Ok(())
    }

    /// Appends one observation for a configured specifier.
    pub fn add_telemetry<S: VenStore>(
        &self,
        store: &mut S,
        telemetry: TelemetryValues,
    ) -> Result<(), OadrError> {
        if !self.parameters.contains_key(&telemetry.report_specifier_id) {
            return Err(OadrError::BadData(format!(
                "telemetry for unconfigured specifier {}",
                telemetry.report_specifier_id
            )));
        }
        store.append_telemetry(telemetry)?;
        Ok(())
    }
}
