//! OpenADR error taxonomy and application-layer response codes.

use std::fmt;

use thiserror::Error;

use crate::store::StoreError;

/// OpenADR 2.0b application-layer response code, carried in `eiResponse`
/// and `eventResponse` elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseCode(pub u16);

impl ResponseCode {
    /// Normal response.
    pub const OK: ResponseCode = ResponseCode(200);
    /// Out of sequence (e.g. a stale modification number).
    pub const OUT_OF_SEQUENCE: ResponseCode = ResponseCode(450);
    pub const NOT_ALLOWED: ResponseCode = ResponseCode(451);
    pub const INVALID_ID: ResponseCode = ResponseCode(452);
    pub const NOT_RECOGNISED: ResponseCode = ResponseCode(453);
    pub const INVALID_DATA: ResponseCode = ResponseCode(454);
    pub const COMPLIANCE_ERROR: ResponseCode = ResponseCode(459);
    pub const SIGNAL_NOT_SUPPORTED: ResponseCode = ResponseCode(460);
    pub const REPORT_NOT_SUPPORTED: ResponseCode = ResponseCode(461);
    pub const TARGET_MISMATCH: ResponseCode = ResponseCode(462);
    pub const NOT_REGISTERED: ResponseCode = ResponseCode(463);
    pub const DEPLOYMENT_ERROR: ResponseCode = ResponseCode(469);

    /// Whether this code reports success.
    pub fn is_ok(self) -> bool {
        self == Self::OK
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised by the VEN protocol engine.
///
/// The taxonomy determines how a failure propagates: `Interface` and
/// `BadData` are echoed to the VTN as an `oadrResponse`, `Internal` is
/// logged and swallowed, `Transport` is recovered by waiting for the next
/// poll cycle, and everything else is fatal for the inbound request that
/// triggered it.
#[derive(Debug, Error)]
pub enum OadrError {
    /// Protocol-level problem in a VTN payload. Carries the OpenADR
    /// response code reported back via `oadrResponse`.
    #[error("protocol error {code}: {message}")]
    Interface { code: ResponseCode, message: String },

    /// Malformed payload content. Reported back with code 454.
    #[error("bad data: {0}")]
    BadData(String),

    /// Local problem, e.g. the VTN acknowledged one of our prior requests
    /// with a non-OK code. Logged only, never sent to the VTN.
    #[error("internal error: {0}")]
    Internal(String),

    /// Illegal local state transition.
    #[error("invalid status transition: {0}")]
    InvalidStatus(String),

    /// Non-2xx/204 HTTP result from the VTN.
    #[error("VTN returned HTTP {status}: {body}")]
    Transport { status: u16, body: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Signing or verification failure in high-security mode.
    #[error("signing error: {0}")]
    Signing(String),
}

impl OadrError {
    /// Payload kind not recognised (code 453).
    pub fn not_recognised(message: impl Into<String>) -> Self {
        OadrError::Interface {
            code: ResponseCode::NOT_RECOGNISED,
            message: message.into(),
        }
    }

    /// Payload content invalid (code 454).
    pub fn invalid_data(message: impl Into<String>) -> Self {
        OadrError::Interface {
            code: ResponseCode::INVALID_DATA,
            message: message.into(),
        }
    }

    /// Modification number ordering violation (code 450).
    pub fn out_of_sequence(message: impl Into<String>) -> Self {
        OadrError::Interface {
            code: ResponseCode::OUT_OF_SEQUENCE,
            message: message.into(),
        }
    }

    /// Response code and description to echo to the VTN, for the
    /// VTN-facing members of the taxonomy.
    pub fn vtn_response(&self) -> Option<(ResponseCode, String)> {
        match self {
            OadrError::Interface { code, message } => Some((*code, message.clone())),
            OadrError::BadData(message) => Some((ResponseCode::INVALID_DATA, message.clone())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{OadrError, ResponseCode};

    #[test]
    fn interface_errors_are_echoed_to_the_vtn() {
        let err = OadrError::out_of_sequence("modification number 2 is stale");
        let (code, message) = err.vtn_response().expect("interface error is VTN-facing");
        assert_eq!(code, ResponseCode::OUT_OF_SEQUENCE);
        assert_eq!(message, "modification number 2 is stale");
    }

    #[test]
    fn bad_data_maps_to_invalid_data_code() {
        let err = OadrError::BadData("no SignedObject in payload".to_string());
        let (code, _) = err.vtn_response().expect("bad data is VTN-facing");
        assert_eq!(code, ResponseCode::INVALID_DATA);
    }

    #[test]
    fn internal_errors_stay_local() {
        let err = OadrError::Internal("error response from VTN: 462".to_string());
        assert!(err.vtn_response().is_none());
    }
}
