//! Error types for ceremony operations.
//!
//! Every error is terminal for the ceremony in progress. Nothing here is
//! retried or recovered locally: errors propagate to `main`, which reports
//! them and exits non-zero.

use crate::ceremony::CeremonyType;
use crate::issuance::lint::LintFindings;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for ceremony operations.
#[derive(Error, Debug)]
pub enum CeremonyError {
    /// A configuration or profile rule was violated. Raised before the HSM is touched.
    #[error("failed to validate config: {0}")]
    ConfigValidation(String),

    /// The requested key label is already in use on the token
    #[error("an object with label {label:?} already exists on the HSM")]
    LabelCollision { label: String },

    /// Device communication or operation failure
    #[error("HSM error: {0}")]
    Hsm(#[from] HsmError),

    /// Attributes read back from a generated key differ from the request
    #[error("generated key attributes do not match request: {0}")]
    AttributeMismatch(String),

    /// A generated key failed its sign/verify self-test
    #[error("key self-verification failed: {0}")]
    Verification(String),

    /// The to-be-signed template failed pre-issuance linting
    #[error("certificate failed pre-issuance lint: {0}")]
    Lint(LintFindings),

    /// An issued artifact does not verify against its issuer
    #[error("failed to verify signature: {0}")]
    SignatureVerification(String),

    /// A validity window violates the issuer window or a domain maximum
    #[error("invalid validity window: {0}")]
    TimeWindow(String),

    /// The destination file already exists
    #[error("output file {0:?} already exists")]
    OutputCollision(PathBuf),

    /// Storage I/O error
    #[error("storage I/O error: {0}")]
    StorageError(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// A configuration document could not be parsed
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Certificate encoding or decoding error
    #[error("certificate error: {0}")]
    CertificateError(String),

    /// PEM encoding/decoding error
    #[error("PEM error: {0}")]
    PemError(String),

    /// Cryptographic operation failed
    #[error("cryptographic error: {0}")]
    CryptoError(String),

    /// A failure annotated with the ceremony it aborted
    #[error("{ceremony} ceremony failed: {source}")]
    Ceremony {
        ceremony: CeremonyType,
        #[source]
        source: Box<CeremonyError>,
    },
}

impl From<der::Error> for CeremonyError {
    fn from(err: der::Error) -> Self {
        CeremonyError::CertificateError(err.to_string())
    }
}

/// Errors reported by an HSM session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HsmError {
    /// The PKCS#11 module could not be loaded or initialized
    #[error("failed to setup session and PKCS#11 context for slot {slot}: {reason}")]
    SessionSetup { slot: u64, reason: String },

    /// No object matched a search template
    #[error("no objects found matching provided template")]
    NoObject,

    /// More than one object matched where exactly one was expected
    #[error("too many objects ({0}) that match the provided template")]
    TooManyObjects(usize),

    /// A referenced object handle does not exist
    #[error("invalid object handle {0}")]
    InvalidHandle(u64),

    /// The device does not support the requested mechanism or attribute
    #[error("unsupported by device: {0}")]
    Unsupported(String),

    /// The device returned data the caller could not interpret
    #[error("invalid response from device: {0}")]
    InvalidResponse(String),

    /// Any other error raised by the device
    #[error("device error: {0}")]
    Device(String),
}

/// A specialized Result type for ceremony operations.
pub type Result<T> = std::result::Result<T, CeremonyError>;
