//! HTTPS transport to the VTN and outcome classification.

use std::fs;

use crate::config::VenConfig;
use crate::error::OadrError;
use crate::payload::{SignedObject, VenRequest};
use crate::signing::Envelope;

/// Fixed path prefix of the OpenADR 2.0b "Simple" services.
pub const ENDPOINT_BASE: &str = "/OpenADR2/Simple/2.0b/";

/// OpenADR service endpoint under [`ENDPOINT_BASE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    EiEvent,
    EiReport,
    EiRegisterParty,
    OadrPoll,
}

impl Endpoint {
    /// Path segment of this service.
    pub fn path(self) -> &'static str {
        match self {
            Endpoint::EiEvent => "EiEvent",
            Endpoint::EiReport => "EiReport",
            Endpoint::EiRegisterParty => "EiRegisterParty",
            Endpoint::OadrPoll => "OadrPoll",
        }
    }

    /// Full URL of this service under a VTN base address.
    pub fn url(self, base: &str) -> String {
        format!("{}{ENDPOINT_BASE}{}", base.trim_end_matches('/'), self.path())
    }
}

/// Classified result of posting one request to the VTN.
#[derive(Debug)]
pub enum PostOutcome {
    /// HTTP 200 with a decoded body; must be fed back to the dispatcher.
    Payload(SignedObject),
    /// Nothing to act on (HTTP 204, or 200 with an empty body).
    Empty,
    /// The VTN was unreachable; the next scheduled poll is the retry.
    NoResponse,
}

/// Posts one request to the VTN and classifies the outcome.
pub trait Transport {
    fn post(&mut self, request: &VenRequest) -> Result<PostOutcome, OadrError>;
}

/// Encodes outbound requests and decodes inbound envelopes.
///
/// The concrete OpenADR XML codec is an external collaborator
/// implementing this contract.
pub trait PayloadCodec {
    fn encode(&self, request: &VenRequest) -> Result<Vec<u8>, OadrError>;
    fn decode(&self, body: &[u8]) -> Result<SignedObject, OadrError>;
}

/// Blocking mutual-TLS HTTP transport.
///
/// Timeouts are delegated to the client's defaults and surface as
/// connection failures; there is no internal retry loop.
pub struct HttpTransport<C> {
    base_url: String,
    envelope: Envelope,
    codec: C,
    client: reqwest::blocking::Client,
}

impl<C: PayloadCodec> HttpTransport<C> {
    /// Builds a client presenting the configured identity and trusting
    /// only the configured CA.
    pub fn new(config: &VenConfig, envelope: Envelope, codec: C) -> Result<Self, OadrError> {
        let bundle = fs::read(&config.client_pem_bundle).map_err(|e| {
            OadrError::Internal(format!(
                "cannot read client pem bundle \"{}\": {e}",
                config.client_pem_bundle.display()
            ))
        })?;
        let identity = reqwest::Identity::from_pem(&bundle)
            .map_err(|e| OadrError::Internal(format!("invalid client pem bundle: {e}")))?;
        let ca = fs::read(&config.vtn_ca_cert).map_err(|e| {
            OadrError::Internal(format!(
                "cannot read CA certificate \"{}\": {e}",
                config.vtn_ca_cert.display()
            ))
        })?;
        let ca_cert = reqwest::Certificate::from_pem(&ca)
            .map_err(|e| OadrError::Internal(format!("invalid CA certificate: {e}")))?;
        let client = reqwest::blocking::Client::builder()
            .identity(identity)
            .add_root_certificate(ca_cert)
            .build()
            .map_err(|e| OadrError::Internal(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            base_url: config.vtn_address.clone(),
            envelope,
            codec,
            client,
        })
    }
}

impl<C: PayloadCodec> Transport for HttpTransport<C> {
    fn post(&mut self, request: &VenRequest) -> Result<PostOutcome, OadrError> {
        let url = request.endpoint().url(&self.base_url);
        let body = self.envelope.seal(self.codec.encode(request)?)?;

        tracing::debug!(%url, "posting VEN request");
        let response = match self
            .client
            .post(&url)
            .header("Content-Type", "application/xml")
            .body(body)
            .send()
        {
            Ok(response) => response,
            Err(err) => {
                // Treated as "VTN offline"; the next poll cycle retries.
                tracing::warn!(%url, error = %err, "connection error posting to VTN");
                return Ok(PostOutcome::NoResponse);
            }
        };

        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .map_err(|e| OadrError::Internal(format!("cannot read VTN response body: {e}")))?;
        match status {
            200 if bytes.is_empty() => {
                tracing::warn!(%url, "zero-length response from VTN");
                Ok(PostOutcome::Empty)
            }
            200 => {
                let raw = self.envelope.open(&bytes)?;
                Ok(PostOutcome::Payload(self.codec.decode(raw)?))
            }
            204 => Ok(PostOutcome::Empty),
            _ => {
                let body = String::from_utf8_lossy(&bytes).into_owned();
                tracing::error!(%url, status, "error response from VTN");
                Err(OadrError::Transport { status, body })
            }
        }
    }
}
