//! Certificate revocation lists signed during a ceremony.

use crate::cert::inspect::{public_key, subject_key_id};
use crate::cert::validity::{to_x509_time, window};
use crate::crypto::SignatureAlgorithm;
use crate::error::{CeremonyError, Result};
use crate::hsm::{FailingRandom, Signer};
use crate::oid;
use chrono::{DateTime, Duration, Utc};
use der::asn1::{BitString, OctetString};
use der::{Decode, Encode};
use tracing::info;
use x509_cert::certificate::Version;
use x509_cert::crl::{CertificateList, RevokedCert, TbsCertList};
use x509_cert::ext::pkix::AuthorityKeyIdentifier;
use x509_cert::ext::Extension;
use x509_cert::serial_number::SerialNumber;
use x509_cert::time::Validity;
use x509_cert::Certificate;

/// PEM label of an encoded CRL.
pub const CRL_PEM_TAG: &str = "X509 CRL";

/// Longest span a CRL may cover.
pub const MAX_CRL_VALIDITY_DAYS: i64 = 365;

/// One certificate on a CRL.
#[derive(Debug, Clone)]
pub struct RevokedEntry {
    pub serial_number: SerialNumber,
    pub revocation_date: DateTime<Utc>,
    /// RFC 5280 CRLReason code
    pub reason: u8,
}

/// RFC 5280 reason codes, excluding `unspecified` and the unused value 7.
pub fn is_valid_reason(code: u8) -> bool {
    matches!(code, 1..=6 | 8..=10)
}

/// Check a CRL window against the issuer's validity and the 12 month ceiling.
pub fn check_crl_window(
    this_update: DateTime<Utc>,
    next_update: DateTime<Utc>,
    issuer_validity: &Validity,
) -> Result<()> {
    let (not_before, not_after) = window(issuer_validity)?;
    if next_update <= this_update {
        return Err(CeremonyError::TimeWindow(
            "thisUpdate must be before nextUpdate".to_string(),
        ));
    }
    if this_update < not_before {
        return Err(CeremonyError::TimeWindow(
            "thisUpdate is before issuing certificate's notBefore".to_string(),
        ));
    }
    if next_update > not_after {
        return Err(CeremonyError::TimeWindow(
            "nextUpdate is after issuing certificate's notAfter".to_string(),
        ));
    }
    if next_update - this_update > Duration::days(MAX_CRL_VALIDITY_DAYS) {
        return Err(CeremonyError::TimeWindow(
            "nextUpdate must be less than 12 months after thisUpdate".to_string(),
        ));
    }
    Ok(())
}

fn reason_code_extension(code: u8) -> Result<Extension> {
    // CRLReason ::= ENUMERATED
    Ok(Extension {
        extn_id: oid::CRL_REASON,
        critical: false,
        extn_value: OctetString::new(vec![0x0a, 0x01, code])?,
    })
}

fn revoked_cert(entry: &RevokedEntry) -> Result<RevokedCert> {
    if !is_valid_reason(entry.reason) {
        return Err(CeremonyError::ConfigValidation(format!(
            "invalid revocation reason {}",
            entry.reason
        )));
    }
    Ok(RevokedCert {
        serial_number: entry.serial_number.clone(),
        revocation_date: to_x509_time(entry.revocation_date)?,
        crl_entry_extensions: Some(vec![reason_code_extension(entry.reason)?]),
    })
}

/// Build, sign and verify a CRL for `issuer`, returning it PEM encoded.
///
/// # Arguments
///
/// * `signer` - The key certified by `issuer`
/// * `issuer` - The certificate the CRL is issued under
/// * `number` - CRL sequence number; uniqueness is the operator's concern
/// * `revoked` - Entries in output order
pub fn generate_crl(
    signer: &dyn Signer,
    issuer: &Certificate,
    this_update: DateTime<Utc>,
    next_update: DateTime<Utc>,
    number: u64,
    revoked: &[RevokedEntry],
) -> Result<String> {
    check_crl_window(this_update, next_update, &issuer.tbs_certificate.validity)?;

    let akid = subject_key_id(issuer)?.ok_or_else(|| {
        CeremonyError::CertificateError(
            "issuer certificate has no subject key identifier".to_string(),
        )
    })?;
    let crl_extensions = vec![
        Extension {
            extn_id: oid::AUTHORITY_KEY_IDENTIFIER,
            critical: false,
            extn_value: OctetString::new(
                AuthorityKeyIdentifier {
                    key_identifier: Some(OctetString::new(akid)?),
                    authority_cert_issuer: None,
                    authority_cert_serial_number: None,
                }
                .to_der()?,
            )?,
        },
        Extension {
            extn_id: oid::CRL_NUMBER,
            critical: false,
            extn_value: OctetString::new(number.to_der()?)?,
        },
    ];

    let revoked_certificates = revoked
        .iter()
        .map(revoked_cert)
        .collect::<Result<Vec<_>>>()?;

    let issuer_key = public_key(issuer)?;
    let algorithm = SignatureAlgorithm::default_for(&issuer_key);
    let tbs = TbsCertList {
        version: Version::V2,
        signature: algorithm.algorithm_identifier()?,
        issuer: issuer.tbs_certificate.subject.clone(),
        this_update: to_x509_time(this_update)?,
        next_update: Some(to_x509_time(next_update)?),
        revoked_certificates: (!revoked_certificates.is_empty()).then_some(revoked_certificates),
        crl_extensions: Some(crl_extensions),
    };

    let tbs_der = tbs.to_der()?;
    let signature = signer.sign(&mut FailingRandom, algorithm, &tbs_der)?;
    let der = CertificateList {
        tbs_cert_list: tbs,
        signature_algorithm: algorithm.algorithm_identifier()?,
        signature: BitString::from_bytes(&signature)?,
    }
    .to_der()?;

    let parsed = CertificateList::from_der(&der)?;
    issuer_key
        .verify(algorithm, &parsed.tbs_cert_list.to_der()?, &signature)
        .map_err(|e| CeremonyError::SignatureVerification(format!("CRL: {}", e)))?;

    info!(number, entries = revoked.len(), "signed CRL");
    Ok(pem::encode(&pem::Pem::new(CRL_PEM_TAG, der)))
}
