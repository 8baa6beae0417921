//! VTN payload identification and dispatch policy.
//!
//! Each of the fixed payload kinds carries a fixed policy: whether an
//! embedded `eiResponse` must be checked, and where the request id lives.
//! The dispatcher applies the policy before any handler runs.

use crate::error::OadrError;
use crate::payload::{EiResponse, SignedObject, VtnPayload};

/// The payload kinds a VTN may deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    DistributeEvent,
    RegisterReport,
    RegisteredReport,
    CreateReport,
    UpdatedReport,
    CancelReport,
    Response,
    CreatedPartyRegistration,
}

/// When the embedded `eiResponse` code must be validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCheck {
    Always,
    Optional,
    Never,
}

/// Where the request id of a payload kind lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestIdLocation {
    /// Top-level requestID field (OADR rule 41 for oadrDistributeEvent).
    Root,
    /// Inside the embedded `eiResponse`.
    EmbeddedResponse,
    /// The kind carries no request id.
    None,
}

/// Fixed per-kind dispatch policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPolicy {
    pub response_check: ResponseCheck,
    pub id_location: RequestIdLocation,
}

impl PayloadKind {
    /// Wire name of this kind.
    pub fn name(self) -> &'static str {
        match self {
            PayloadKind::DistributeEvent => "oadrDistributeEvent",
            PayloadKind::RegisterReport => "oadrRegisterReport",
            PayloadKind::RegisteredReport => "oadrRegisteredReport",
            PayloadKind::CreateReport => "oadrCreateReport",
            PayloadKind::UpdatedReport => "oadrUpdatedReport",
            PayloadKind::CancelReport => "oadrCancelReport",
            PayloadKind::Response => "oadrResponse",
            PayloadKind::CreatedPartyRegistration => "oadrCreatedPartyRegistration",
        }
    }

    pub fn policy(self) -> DispatchPolicy {
        match self {
            PayloadKind::DistributeEvent => DispatchPolicy {
                response_check: ResponseCheck::Optional,
                id_location: RequestIdLocation::Root,
            },
            PayloadKind::RegisterReport => DispatchPolicy {
                response_check: ResponseCheck::Never,
                id_location: RequestIdLocation::None,
            },
            PayloadKind::RegisteredReport => DispatchPolicy {
                response_check: ResponseCheck::Always,
                id_location: RequestIdLocation::EmbeddedResponse,
            },
            PayloadKind::CreateReport => DispatchPolicy {
                response_check: ResponseCheck::Never,
                id_location: RequestIdLocation::None,
            },
            PayloadKind::UpdatedReport => DispatchPolicy {
                response_check: ResponseCheck::Always,
                id_location: RequestIdLocation::EmbeddedResponse,
            },
            PayloadKind::CancelReport => DispatchPolicy {
                response_check: ResponseCheck::Never,
                id_location: RequestIdLocation::Root,
            },
            PayloadKind::Response => DispatchPolicy {
                response_check: ResponseCheck::Always,
                id_location: RequestIdLocation::EmbeddedResponse,
            },
            PayloadKind::CreatedPartyRegistration => DispatchPolicy {
                response_check: ResponseCheck::Always,
                id_location: RequestIdLocation::EmbeddedResponse,
            },
        }
    }
}

impl VtnPayload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            VtnPayload::DistributeEvent(_) => PayloadKind::DistributeEvent,
            VtnPayload::RegisterReport(_) => PayloadKind::RegisterReport,
            VtnPayload::RegisteredReport(_) => PayloadKind::RegisteredReport,
            VtnPayload::CreateReport(_) => PayloadKind::CreateReport,
            VtnPayload::UpdatedReport(_) => PayloadKind::UpdatedReport,
            VtnPayload::CancelReport(_) => PayloadKind::CancelReport,
            VtnPayload::Response(_) => PayloadKind::Response,
            VtnPayload::CreatedPartyRegistration(_) => PayloadKind::CreatedPartyRegistration,
        }
    }

    fn ei_response(&self) -> Option<&EiResponse> {
        match self {
            VtnPayload::DistributeEvent(p) => p.ei_response.as_ref(),
            VtnPayload::RegisteredReport(p) => Some(&p.ei_response),
            VtnPayload::UpdatedReport(p) => Some(&p.ei_response),
            VtnPayload::Response(p) => Some(&p.ei_response),
            VtnPayload::CreatedPartyRegistration(p) => Some(&p.ei_response),
            VtnPayload::RegisterReport(_)
            | VtnPayload::CreateReport(_)
            | VtnPayload::CancelReport(_) => None,
        }
    }

    fn root_request_id(&self) -> Option<String> {
        match self {
            VtnPayload::DistributeEvent(p) => p.request_id.clone(),
            VtnPayload::CancelReport(p) => p.request_id.clone(),
            _ => None,
        }
    }
}

/// Identifies exactly one payload kind in the envelope.
///
/// Zero populated slots fails with code 453 (not recognised); more than
/// one fails with code 454 (invalid data).
pub fn classify(signed_object: SignedObject) -> Result<VtnPayload, OadrError> {
    let SignedObject {
        distribute_event,
        register_report,
        registered_report,
        create_report,
        updated_report,
        cancel_report,
        response,
        created_party_registration,
    } = signed_object;

    let mut found: Vec<VtnPayload> = Vec::new();
    if let Some(p) = distribute_event {
        found.push(VtnPayload::DistributeEvent(p));
    }
    if let Some(p) = register_report {
        found.push(VtnPayload::RegisterReport(p));
    }
    if let Some(p) = registered_report {
        found.push(VtnPayload::RegisteredReport(p));
    }
    if let Some(p) = create_report {
        found.push(VtnPayload::CreateReport(p));
    }
    if let Some(p) = updated_report {
        found.push(VtnPayload::UpdatedReport(p));
    }
    if let Some(p) = cancel_report {
        found.push(VtnPayload::CancelReport(p));
    }
    if let Some(p) = response {
        found.push(VtnPayload::Response(p));
    }
    if let Some(p) = created_party_registration {
        found.push(VtnPayload::CreatedPartyRegistration(p));
    }

    match found.len() {
        1 => Ok(found.swap_remove(0)),
        0 => Err(OadrError::not_recognised(
            "did not recognise any payload in the SignedObject",
        )),
        _ => {
            let names: Vec<&str> = found.iter().map(|p| p.kind().name()).collect();
            Err(OadrError::invalid_data(format!(
                "too many signedObject elements ({})",
                names.join(",")
            )))
        }
    }
}

/// Applies the kind's response-check policy and extracts the request id.
///
/// A non-OK embedded code means the VTN is rejecting one of our prior
/// requests; that is a local problem (`Internal`), never echoed back.
pub fn check_ei_response(payload: &VtnPayload) -> Result<Option<String>, OadrError> {
    let policy = payload.kind().policy();
    let ei_response = payload.ei_response();

    let must_check = match policy.response_check {
        ResponseCheck::Always => true,
        ResponseCheck::Optional => ei_response.is_some(),
        ResponseCheck::Never => false,
    };
    if must_check {
        let ei_response = ei_response.ok_or_else(|| {
            OadrError::BadData(format!("{} is missing its eiResponse", payload.kind().name()))
        })?;
        if !ei_response.code.is_ok() {
            return Err(OadrError::Internal(format!(
                "error response from VTN: {} {}",
                ei_response.code,
                ei_response.description.as_deref().unwrap_or("")
            )));
        }
    }

    Ok(match policy.id_location {
        RequestIdLocation::None => None,
        RequestIdLocation::Root => payload.root_request_id(),
        RequestIdLocation::EmbeddedResponse => {
            ei_response.and_then(|r| r.request_id.clone())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::{
        PayloadKind, RequestIdLocation, ResponseCheck, check_ei_response, classify,
    };
    use crate::error::{OadrError, ResponseCode};
    use crate::payload::{
        CancelReport, DistributeEvent, EiResponse, OadrResponse, SignedObject, VtnPayload,
    };

    #[test]
    fn empty_envelope_is_not_recognised() {
        let err = classify(SignedObject::default()).expect_err("must fail");
        let (code, _) = err.vtn_response().expect("interface error");
        assert_eq!(code, ResponseCode::NOT_RECOGNISED);
    }

    #[test]
    fn two_populated_slots_are_invalid_data() {
        let signed_object = SignedObject {
            distribute_event: Some(DistributeEvent::default()),
            cancel_report: Some(CancelReport::default()),
            ..SignedObject::default()
        };
        let err = classify(signed_object).expect_err("must fail");
        let (code, message) = err.vtn_response().expect("interface error");
        assert_eq!(code, ResponseCode::INVALID_DATA);
        assert!(message.contains("oadrDistributeEvent"));
        assert!(message.contains("oadrCancelReport"));
    }

    #[test]
    fn single_slot_classifies_to_its_kind() {
        let signed_object = SignedObject::from(VtnPayload::Response(OadrResponse {
            ei_response: EiResponse::ok("req-7"),
        }));
        let payload = classify(signed_object).expect("must classify");
        assert_eq!(payload.kind(), PayloadKind::Response);
    }

    #[test]
    fn policies_match_the_fixed_table() {
        let policy = PayloadKind::DistributeEvent.policy();
        assert_eq!(policy.response_check, ResponseCheck::Optional);
        assert_eq!(policy.id_location, RequestIdLocation::Root);

        let policy = PayloadKind::RegisteredReport.policy();
        assert_eq!(policy.response_check, ResponseCheck::Always);
        assert_eq!(policy.id_location, RequestIdLocation::EmbeddedResponse);

        let policy = PayloadKind::CancelReport.policy();
        assert_eq!(policy.response_check, ResponseCheck::Never);
        assert_eq!(policy.id_location, RequestIdLocation::Root);

        let policy = PayloadKind::RegisterReport.policy();
        assert_eq!(policy.response_check, ResponseCheck::Never);
        assert_eq!(policy.id_location, RequestIdLocation::None);
    }

    #[test]
    fn request_id_is_taken_from_the_policy_location() {
        let payload = VtnPayload::DistributeEvent(DistributeEvent {
            request_id: Some("root-id".to_string()),
            ..DistributeEvent::default()
        });
        assert_eq!(
            check_ei_response(&payload).expect("check should pass"),
            Some("root-id".to_string())
        );

        let payload = VtnPayload::Response(OadrResponse {
            ei_response: EiResponse::ok("embedded-id"),
        });
        assert_eq!(
            check_ei_response(&payload).expect("check should pass"),
            Some("embedded-id".to_string())
        );
    }

    #[test]
    fn non_ok_embedded_code_is_an_internal_error() {
        let payload = VtnPayload::Response(OadrResponse {
            ei_response: EiResponse {
                code: ResponseCode::TARGET_MISMATCH,
                description: Some("wrong ven".to_string()),
                request_id: Some("req-1".to_string()),
            },
        });
        let err = check_ei_response(&payload).expect_err("must fail");
        assert!(matches!(err, OadrError::Internal(_)));
    }

    #[test]
    fn optional_check_passes_when_response_is_absent() {
        let payload = VtnPayload::DistributeEvent(DistributeEvent::default());
        assert!(check_ei_response(&payload).expect("check should pass").is_none());
    }
}
