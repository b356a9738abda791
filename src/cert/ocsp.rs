//! Pre-signed OCSP responses.
//!
//! The ASN.1 structures follow RFC 6960 section 4.2.1 and cover only what a
//! single-certificate response needs.

use crate::cert::inspect::{extended_key_usages, public_key, verify_issued_by};
use crate::cert::validity::window;
use crate::crypto::SignatureAlgorithm;
use crate::error::{CeremonyError, Result};
use crate::hsm::{FailingRandom, Signer};
use crate::oid;
use base64::Engine;
use chrono::{DateTime, DurationRound, Utc};
use const_oid::ObjectIdentifier;
use der::asn1::{Any, BitString, GeneralizedTime, Null, OctetString};
use der::{Choice, Decode, Encode, Enumerated, Sequence, Tag};
use sha1::{Digest, Sha1};
use spki::AlgorithmIdentifierOwned;
use std::time::Duration;
use tracing::info;
use x509_cert::certificate::Version;
use x509_cert::serial_number::SerialNumber;
use x509_cert::Certificate;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Enumerated)]
#[repr(u32)]
pub enum OcspResponseStatus {
    Successful = 0,
    MalformedRequest = 1,
    InternalError = 2,
    TryLater = 3,
    SigRequired = 5,
    Unauthorized = 6,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct OcspResponse {
    pub response_status: OcspResponseStatus,
    #[asn1(context_specific = "0", optional = "true", tag_mode = "EXPLICIT")]
    pub response_bytes: Option<ResponseBytes>,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct ResponseBytes {
    pub response_type: ObjectIdentifier,
    pub response: OctetString,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct BasicOcspResponse {
    pub tbs_response_data: ResponseData,
    pub signature_algorithm: AlgorithmIdentifierOwned,
    pub signature: BitString,
    #[asn1(context_specific = "0", optional = "true", tag_mode = "EXPLICIT")]
    pub certs: Option<Vec<Certificate>>,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct ResponseData {
    #[asn1(context_specific = "0", default = "Default::default")]
    pub version: Version,
    pub responder_id: ResponderId,
    pub produced_at: GeneralizedTime,
    pub responses: Vec<SingleResponse>,
}

#[derive(Clone, Debug, Eq, PartialEq, Choice)]
pub enum ResponderId {
    /// SHA-1 of the responder's public key bit string
    #[asn1(context_specific = "2", tag_mode = "EXPLICIT", constructed = "true")]
    ByKey(OctetString),
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct SingleResponse {
    pub cert_id: CertId,
    pub cert_status: CertStatus,
    pub this_update: GeneralizedTime,
    #[asn1(context_specific = "0", optional = "true", tag_mode = "EXPLICIT")]
    pub next_update: Option<GeneralizedTime>,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct CertId {
    pub hash_algorithm: AlgorithmIdentifierOwned,
    pub issuer_name_hash: OctetString,
    pub issuer_key_hash: OctetString,
    pub serial_number: SerialNumber,
}

#[derive(Clone, Debug, Eq, PartialEq, Choice)]
pub enum CertStatus {
    #[asn1(context_specific = "0", tag_mode = "IMPLICIT")]
    Good(Null),
    #[asn1(context_specific = "1", tag_mode = "IMPLICIT", constructed = "true")]
    Revoked(RevokedInfo),
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct RevokedInfo {
    pub revocation_time: GeneralizedTime,
}

/// Status an OCSP response asserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Good,
    Revoked,
}

fn generalized_time(time: DateTime<Utc>) -> Result<GeneralizedTime> {
    let secs = u64::try_from(time.timestamp()).map_err(|_| {
        CeremonyError::CertificateError(format!("{} predates the Unix epoch", time))
    })?;
    Ok(GeneralizedTime::from_unix_duration(Duration::from_secs(secs))?)
}

fn sha1_octets(data: &[u8]) -> Result<OctetString> {
    Ok(OctetString::new(Sha1::digest(data).to_vec())?)
}

/// CertID for `cert` as issued by `issuer`, hashed with SHA-1.
pub fn cert_id(cert: &Certificate, issuer: &Certificate) -> Result<CertId> {
    Ok(CertId {
        hash_algorithm: AlgorithmIdentifierOwned {
            oid: oid::SHA1,
            parameters: Some(Any::new(Tag::Null, Vec::<u8>::new())?),
        },
        issuer_name_hash: sha1_octets(&issuer.tbs_certificate.subject.to_der()?)?,
        issuer_key_hash: sha1_octets(
            issuer
                .tbs_certificate
                .subject_public_key_info
                .subject_public_key
                .raw_bytes(),
        )?,
        serial_number: cert.tbs_certificate.serial_number.clone(),
    })
}

fn responder_id(signing_cert: &Certificate) -> Result<ResponderId> {
    Ok(ResponderId::ByKey(sha1_octets(
        signing_cert
            .tbs_certificate
            .subject_public_key_info
            .subject_public_key
            .raw_bytes(),
    )?))
}

/// Build and sign an OCSP response for `cert`, returning base64 plus a newline.
///
/// With a `delegated_issuer` the response is signed by its key and the
/// delegated certificate is embedded; otherwise `issuer` signs directly.
/// `signer` must hold the private key of whichever certificate signs.
pub fn generate_ocsp_response(
    signer: &dyn Signer,
    issuer: &Certificate,
    delegated_issuer: Option<&Certificate>,
    cert: &Certificate,
    this_update: DateTime<Utc>,
    next_update: DateTime<Utc>,
    status: Status,
) -> Result<String> {
    verify_issued_by(cert, issuer).map_err(|e| {
        CeremonyError::SignatureVerification(format!(
            "invalid signature on certificate from issuer: {}",
            e
        ))
    })?;

    let signing_cert = match delegated_issuer {
        Some(delegated) => {
            verify_issued_by(delegated, issuer).map_err(|e| {
                CeremonyError::SignatureVerification(format!(
                    "invalid signature on delegated issuer from issuer: {}",
                    e
                ))
            })?;
            if !extended_key_usages(delegated)?.contains(&oid::KP_OCSP_SIGNING) {
                return Err(CeremonyError::ConfigValidation(
                    "delegated issuer certificate doesn't contain OCSPSigning extended key usage"
                        .to_string(),
                ));
            }
            delegated
        }
        None => issuer,
    };

    if next_update <= this_update {
        return Err(CeremonyError::TimeWindow(
            "thisUpdate must be before nextUpdate".to_string(),
        ));
    }
    let (not_before, not_after) = window(&signing_cert.tbs_certificate.validity)?;
    if this_update < not_before {
        return Err(CeremonyError::TimeWindow(
            "thisUpdate is before signing certificate's notBefore".to_string(),
        ));
    }
    if next_update > not_after {
        return Err(CeremonyError::TimeWindow(
            "nextUpdate is after signing certificate's notAfter".to_string(),
        ));
    }

    let signing_key = public_key(signing_cert)?;
    let algorithm = SignatureAlgorithm::default_for(&signing_key);
    let produced_at = Utc::now()
        .duration_trunc(chrono::Duration::minutes(1))
        .map_err(|e| CeremonyError::CertificateError(e.to_string()))?;
    let cert_status = match status {
        Status::Good => CertStatus::Good(Null),
        Status::Revoked => CertStatus::Revoked(RevokedInfo {
            revocation_time: generalized_time(this_update)?,
        }),
    };

    let tbs = ResponseData {
        version: Version::V1,
        responder_id: responder_id(signing_cert)?,
        produced_at: generalized_time(produced_at)?,
        responses: vec![SingleResponse {
            cert_id: cert_id(cert, issuer)?,
            cert_status,
            this_update: generalized_time(this_update)?,
            next_update: Some(generalized_time(next_update)?),
        }],
    };
    let signature = signer.sign(&mut FailingRandom, algorithm, &tbs.to_der()?)?;

    let basic = BasicOcspResponse {
        tbs_response_data: tbs,
        signature_algorithm: algorithm.algorithm_identifier()?,
        signature: BitString::from_bytes(&signature)?,
        certs: delegated_issuer.map(|d| vec![d.clone()]),
    };
    let der = OcspResponse {
        response_status: OcspResponseStatus::Successful,
        response_bytes: Some(ResponseBytes {
            response_type: oid::OCSP_BASIC,
            response: OctetString::new(basic.to_der()?)?,
        }),
    }
    .to_der()?;

    verify_ocsp_response(&der, cert, issuer)?;
    info!(
        serial = %hex::encode(cert.tbs_certificate.serial_number.as_bytes()),
        status = ?status,
        delegated = delegated_issuer.is_some(),
        "signed OCSP response"
    );

    let mut encoded = base64::engine::general_purpose::STANDARD.encode(&der);
    encoded.push('\n');
    Ok(encoded)
}

/// Parse a DER response and check it answers for `cert` under `issuer`
/// with a valid signature from the issuer or an embedded delegated signer.
pub fn verify_ocsp_response(der: &[u8], cert: &Certificate, issuer: &Certificate) -> Result<()> {
    let invalid = |msg: &str| CeremonyError::SignatureVerification(format!("OCSP response: {}", msg));

    let response = OcspResponse::from_der(der)?;
    if response.response_status != OcspResponseStatus::Successful {
        return Err(invalid("status is not successful"));
    }
    let bytes = response
        .response_bytes
        .ok_or_else(|| invalid("missing response bytes"))?;
    if bytes.response_type != oid::OCSP_BASIC {
        return Err(invalid("not a basic response"));
    }
    let basic = BasicOcspResponse::from_der(bytes.response.as_bytes())?;

    let signing_cert = match basic.certs.as_ref().and_then(|c| c.first()) {
        Some(delegated) => {
            verify_issued_by(delegated, issuer)?;
            delegated
        }
        None => issuer,
    };
    if basic.tbs_response_data.responder_id != responder_id(signing_cert)? {
        return Err(invalid("responder ID does not match the signing certificate"));
    }

    let [single] = basic.tbs_response_data.responses.as_slice() else {
        return Err(invalid("expected exactly one response"));
    };
    if single.cert_id != cert_id(cert, issuer)? {
        return Err(invalid("certificate ID does not match"));
    }

    let algorithm = SignatureAlgorithm::from_algorithm_identifier(&basic.signature_algorithm)?;
    let signature = basic
        .signature
        .as_bytes()
        .ok_or_else(|| invalid("signature has unused bits"))?;
    public_key(signing_cert)?.verify(algorithm, &basic.tbs_response_data.to_der()?, signature)
}
