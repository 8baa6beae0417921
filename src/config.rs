//! TOML-based VEN configuration.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::signing::SecurityLevel;
use crate::store::OptType;

/// Floor for the poll interval; construction fails below it.
pub const MIN_POLL_INTERVAL_SECS: u64 = 5;
/// Poll interval used when the VTN does not dictate one.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 15;
/// Telemetry send interval used when a report does not carry one.
pub const DEFAULT_REPORT_INTERVAL_SECS: u64 = 15;
/// How long to wait before forcing the default opt decision.
pub const DEFAULT_OPT_TIMEOUT_SECS: u64 = 30 * 60;

/// Top-level VEN configuration parsed from TOML.
///
/// Load from TOML with [`VenConfig::from_toml_file`]; all optional fields
/// default to the OpenADR "Simple" profile baseline.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VenConfig {
    /// OpenADR ID of this virtual end node.
    pub ven_id: String,
    /// ID of the VTN this VEN communicates with.
    pub vtn_id: String,
    /// Base URL of the VTN, e.g. `https://vtn.example:8443`.
    pub vtn_address: String,
    /// Path of the PEM bundle (private key + certificate concatenated)
    /// presented for HTTPS mutual auth.
    pub client_pem_bundle: PathBuf,
    /// Path of the CA certificate the VTN's certificates are signed with.
    pub vtn_ca_cert: PathBuf,
    /// `standard` omits Signature elements; `high` signs every payload.
    #[serde(default)]
    pub security_level: SecurityLevel,
    /// How often an `oadrPoll` is sent to the VTN (seconds).
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Opt decision applied when the host never makes an explicit one.
    #[serde(default = "default_opt_decision")]
    pub opt_default_decision: OptType,
    /// Seconds to wait before forcing the default opt decision; 0 forces
    /// it immediately.
    #[serde(default = "default_opt_timeout_secs")]
    pub opt_timeout_secs: u64,
    /// Master seed for event start-time randomization.
    #[serde(default = "default_seed")]
    pub randomization_seed: u64,
    /// Telemetry report definitions, keyed by report specifier ID.
    #[serde(default)]
    pub report_parameters: BTreeMap<String, ReportParameters>,
}

/// Definition of one reportable telemetry stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportParameters {
    /// Display name sent in METADATA registration.
    pub report_name: String,
    /// Send interval applied until the VTN requests a different one.
    #[serde(default = "default_report_interval_secs")]
    pub report_interval_secs_default: u64,
    /// Opaque telemetry schema forwarded to the VTN as-is.
    #[serde(default)]
    pub telemetry_parameters: serde_json::Value,
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_opt_decision() -> OptType {
    OptType::OptIn
}

fn default_opt_timeout_secs() -> u64 {
    DEFAULT_OPT_TIMEOUT_SECS
}

fn default_seed() -> u64 {
    42
}

fn default_report_interval_secs() -> u64 {
    DEFAULT_REPORT_INTERVAL_SECS
}

/// Configuration error with field path and constraint description.
#[derive(Debug, Error)]
#[error("config error: {field} — {message}")]
pub struct ConfigError {
    /// Dotted field path (e.g., `"poll_interval_secs"`).
    pub field: String,
    /// Human-readable constraint description.
    pub message: String,
}

impl VenConfig {
    /// Parses a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be read or the TOML is
    /// invalid.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError {
            field: "config".to_string(),
            message: format!("cannot read \"{}\": {e}", path.display()),
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses a configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the TOML is invalid or contains unknown
    /// fields.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError {
            field: "toml".to_string(),
            message: e.to_string(),
        })
    }

    /// Validates all fields and returns a list of errors.
    ///
    /// Returns an empty vector if configuration is valid.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        if self.poll_interval_secs < MIN_POLL_INTERVAL_SECS {
            errors.push(ConfigError {
                field: "poll_interval_secs".to_string(),
                message: format!("must be at least {MIN_POLL_INTERVAL_SECS} seconds"),
            });
        }
        if self.vtn_address.is_empty() {
            errors.push(ConfigError {
                field: "vtn_address".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        for (specifier_id, params) in &self.report_parameters {
            if params.report_name.is_empty() {
                errors.push(ConfigError {
                    field: format!("report_parameters.{specifier_id}.report_name"),
                    message: "must not be empty".to_string(),
                });
            }
        }
        errors
    }
}
