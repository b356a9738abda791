//! Reading extensions and keys back out of parsed certificates, and checking
//! who signed them.

use crate::crypto::{PublicKey, SignatureAlgorithm};
use crate::error::{CeremonyError, Result};
use crate::oid;
use const_oid::ObjectIdentifier;
use der::{Decode, Encode};
use x509_cert::ext::pkix::{ExtendedKeyUsage, SubjectKeyIdentifier};
use x509_cert::ext::Extension;
use x509_cert::Certificate;

pub fn find_extension<'a>(cert: &'a Certificate, id: &ObjectIdentifier) -> Option<&'a Extension> {
    cert.tbs_certificate
        .extensions
        .as_ref()
        .and_then(|exts| exts.iter().find(|e| e.extn_id == *id))
}

/// The public key a certificate certifies.
pub fn public_key(cert: &Certificate) -> Result<PublicKey> {
    PublicKey::from_spki(&cert.tbs_certificate.subject_public_key_info)
}

/// Value of the subject key identifier extension, if present.
pub fn subject_key_id(cert: &Certificate) -> Result<Option<Vec<u8>>> {
    find_extension(cert, &oid::SUBJECT_KEY_IDENTIFIER)
        .map(|ext| {
            SubjectKeyIdentifier::from_der(ext.extn_value.as_bytes())
                .map(|skid| skid.0.as_bytes().to_vec())
                .map_err(CeremonyError::from)
        })
        .transpose()
}

/// OIDs of the extended key usage extension; empty when absent.
pub fn extended_key_usages(cert: &Certificate) -> Result<Vec<ObjectIdentifier>> {
    match find_extension(cert, &oid::EXTENDED_KEY_USAGE) {
        Some(ext) => Ok(ExtendedKeyUsage::from_der(ext.extn_value.as_bytes())?.0),
        None => Ok(Vec::new()),
    }
}

/// Verify the signature on `cert` with `issuer_key`.
pub fn verify_signed_by(cert: &Certificate, issuer_key: &PublicKey) -> Result<()> {
    let algorithm = SignatureAlgorithm::from_algorithm_identifier(&cert.signature_algorithm)?;
    let tbs = cert.tbs_certificate.to_der()?;
    let signature = cert.signature.as_bytes().ok_or_else(|| {
        CeremonyError::SignatureVerification("signature bit string has unused bits".to_string())
    })?;
    issuer_key.verify(algorithm, &tbs, signature)
}

/// Verify that `issuer` signed `cert`, including the name chaining.
pub fn verify_issued_by(cert: &Certificate, issuer: &Certificate) -> Result<()> {
    if cert.tbs_certificate.issuer != issuer.tbs_certificate.subject {
        return Err(CeremonyError::SignatureVerification(format!(
            "certificate issuer {} does not match issuer subject {}",
            cert.tbs_certificate.issuer, issuer.tbs_certificate.subject
        )));
    }
    verify_signed_by(cert, &public_key(issuer)?)
}
