//! Payload signing contracts and the security-level envelope.
//!
//! The concrete XML-signature cryptography is an external collaborator:
//! this module only fixes the interface and the fail-fast rule that an
//! unverifiable request is never sent.

use serde::Deserialize;

use crate::error::OadrError;

/// Security level negotiated with the VTN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    /// Payloads carry no Signature element.
    #[default]
    Standard,
    /// Every payload is signed and verified via a third-party authority.
    High,
}

/// Signs a serialized `SignedObject`.
///
/// Implementations are expected to produce a detached signature over the
/// exclusive-c14n canonicalized payload, embedded alongside the
/// `SignedObject` in the resulting bytes.
pub trait Signer {
    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, OadrError>;
}

/// Verifies a signed payload against the configured CA certificate.
pub trait Verifier {
    fn verify(&self, payload: &[u8]) -> Result<(), OadrError>;
}

/// Applies the configured security level to payload bytes in both
/// directions.
pub struct Envelope {
    level: SecurityLevel,
    signer: Option<Box<dyn Signer>>,
    verifier: Option<Box<dyn Verifier>>,
}

impl Envelope {
    /// Standard security: payloads pass through untouched.
    pub fn standard() -> Self {
        Self {
            level: SecurityLevel::Standard,
            signer: None,
            verifier: None,
        }
    }

    /// High security: sign outbound payloads and verify both directions.
    pub fn high(signer: Box<dyn Signer>, verifier: Box<dyn Verifier>) -> Self {
        Self {
            level: SecurityLevel::High,
            signer: Some(signer),
            verifier: Some(verifier),
        }
    }

    pub fn level(&self) -> SecurityLevel {
        self.level
    }

    /// Prepares an outbound serialized `SignedObject` for posting.
    ///
    /// In high security the payload is signed and then self-verified
    /// against the CA certificate, so a request with a broken signature
    /// fails here instead of reaching the VTN.
    pub fn seal(&self, payload: Vec<u8>) -> Result<Vec<u8>, OadrError> {
        match self.level {
            SecurityLevel::Standard => Ok(payload),
            SecurityLevel::High => {
                let signer = self
                    .signer
                    .as_ref()
                    .ok_or_else(|| OadrError::Signing("no signer configured".to_string()))?;
                let verifier = self
                    .verifier
                    .as_ref()
                    .ok_or_else(|| OadrError::Signing("no verifier configured".to_string()))?;
                let signed = signer.sign(&payload)?;
                verifier.verify(&signed)?;
                Ok(signed)
            }
        }
    }

    /// Checks an inbound payload before it is decoded.
    pub fn open<'a>(&self, payload: &'a [u8]) -> Result<&'a [u8], OadrError> {
        if self.level == SecurityLevel::High {
            let verifier = self
                .verifier
                .as_ref()
                .ok_or_else(|| OadrError::Signing("no verifier configured".to_string()))?;
            verifier.verify(payload)?;
        }
        Ok(payload)
    }
}
