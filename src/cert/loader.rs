//! PEM encoding and loading of certificates and public keys.

use crate::crypto::PublicKey;
use crate::error::{CeremonyError, Result};
use der::{Decode, Encode};
use std::fs;
use std::path::Path;
use x509_cert::Certificate;

/// Convert a Certificate to PEM format.
pub fn cert_to_pem(cert: &Certificate) -> Result<String> {
    let der = cert.to_der().map_err(|e| {
        CeremonyError::CertificateError(format!("failed to encode certificate: {}", e))
    })?;

    Ok(pem::encode(&pem::Pem::new("CERTIFICATE", der)))
}

/// Load a Certificate from PEM format.
pub fn cert_from_pem(pem_str: &str) -> Result<Certificate> {
    let pem = pem::parse(pem_str)
        .map_err(|e| CeremonyError::PemError(format!("failed to parse PEM: {}", e)))?;

    if pem.tag() != "CERTIFICATE" {
        return Err(CeremonyError::PemError(format!(
            "expected CERTIFICATE, got {}",
            pem.tag()
        )));
    }

    Certificate::from_der(pem.contents()).map_err(|e| {
        CeremonyError::CertificateError(format!("failed to decode certificate: {}", e))
    })
}

/// Load a PEM certificate from disk.
///
/// # Example
///
/// ```rust,no_run
/// use ceremony::cert::loader::load_certificate;
///
/// # fn example() -> ceremony::error::Result<()> {
/// let issuer = load_certificate("root.pem")?;
/// println!("{}", issuer.tbs_certificate.subject);
/// # Ok(())
/// # }
/// ```
pub fn load_certificate(path: impl AsRef<Path>) -> Result<Certificate> {
    let path = path.as_ref();
    let pem_str = fs::read_to_string(path).map_err(|e| {
        CeremonyError::CertificateError(format!(
            "failed to load certificate {:?}: {}",
            path, e
        ))
    })?;
    cert_from_pem(&pem_str)
}

/// Load a PEM `PUBLIC KEY` from disk, returning the key and its SPKI DER.
pub fn load_public_key(path: impl AsRef<Path>) -> Result<(PublicKey, Vec<u8>)> {
    let path = path.as_ref();
    let pem_str = fs::read_to_string(path).map_err(|e| {
        CeremonyError::CryptoError(format!("failed to read public key {:?}: {}", path, e))
    })?;
    let key = PublicKey::from_pem(&pem_str)?;
    let der = key.to_spki_der()?;
    Ok((key, der))
}
