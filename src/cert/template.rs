//! Builds unsigned certificate templates from validated profiles.
//!
//! A [`CertTemplate`] holds every decision about a certificate except who
//! issues it. The issuance pipeline turns it into a `TbsCertificate` once the
//! issuer name is known.

use crate::cert::inspect;
use crate::cert::profile::{CertProfile, CertType, PolicyInfo};
use crate::cert::validity::{self, parse_date};
use crate::crypto::SignatureAlgorithm;
use crate::error::{CeremonyError, Result};
use crate::hsm::random::random_bytes;
use crate::oid;
use chrono::{DateTime, Utc};
use const_oid::ObjectIdentifier;
use der::asn1::{Any, Ia5String, OctetString};
use der::{Decode, Encode};
use flagset::FlagSet;
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use spki::SubjectPublicKeyInfoOwned;
use x509_cert::certificate::Version;
use x509_cert::ext::pkix::crl::dp::DistributionPoint;
use x509_cert::ext::pkix::name::{DistributionPointName, GeneralName};
use x509_cert::ext::pkix::certpolicy::{PolicyInformation, PolicyQualifierInfo};
use x509_cert::ext::pkix::{
    AccessDescription, AuthorityInfoAccessSyntax, AuthorityKeyIdentifier, BasicConstraints,
    CertificatePolicies, CrlDistributionPoints, ExtendedKeyUsage, KeyUsage, KeyUsages,
    SubjectKeyIdentifier,
};
use x509_cert::ext::Extension;
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::{Certificate, TbsCertificate};

/// Bytes of randomness in every serial number.
pub const SERIAL_LEN: usize = 16;

/// DER of ASN.1 NULL, the value of the OCSP no-check extension.
pub const ASN1_NULL: [u8; 2] = [0x05, 0x00];

/// An unsigned certificate, minus its issuer.
#[derive(Debug, Clone)]
pub struct CertTemplate {
    pub cert_type: CertType,
    pub serial_number: SerialNumber,
    pub subject: Name,
    /// `None` only for CSR templates
    pub validity: Option<(DateTime<Utc>, DateTime<Utc>)>,
    /// `None` only for CSR templates
    pub signature_algorithm: Option<SignatureAlgorithm>,
    pub subject_public_key_info: SubjectPublicKeyInfoOwned,
    pub subject_key_id: Vec<u8>,
    pub authority_key_id: Option<Vec<u8>>,
    pub key_usage: FlagSet<KeyUsages>,
    pub basic_constraints: BasicConstraints,
    pub extended_key_usage: Vec<ObjectIdentifier>,
    pub ocsp_server: Option<String>,
    pub issuing_certificate_url: Option<String>,
    pub crl_distribution_point: Option<String>,
    /// Extensions emitted after the standard ones, in order
    pub extra_extensions: Vec<Extension>,
}

fn key_usage_bit(name: &str) -> Option<KeyUsages> {
    match name {
        "Digital Signature" => Some(KeyUsages::DigitalSignature),
        "CRL Sign" => Some(KeyUsages::CRLSign),
        "Cert Sign" => Some(KeyUsages::KeyCertSign),
        _ => None,
    }
}

/// SHA-256 over the subject public key bit string.
pub fn subject_key_id(spki: &SubjectPublicKeyInfoOwned) -> Vec<u8> {
    Sha256::digest(spki.subject_public_key.raw_bytes()).to_vec()
}

/// Interpret big-endian bytes as a non-negative INTEGER.
pub fn serial_from_bytes(bytes: &[u8]) -> Result<SerialNumber> {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    let mut value = bytes[start..].to_vec();
    if value.is_empty() {
        value.push(0);
    } else if value[0] & 0x80 != 0 {
        value.insert(0, 0);
    }
    SerialNumber::new(&value).map_err(|e| {
        CeremonyError::CertificateError(format!("failed to create serial number: {}", e))
    })
}

fn extension<T: Encode>(id: ObjectIdentifier, critical: bool, value: &T) -> Result<Extension> {
    Ok(Extension {
        extn_id: id,
        critical,
        extn_value: OctetString::new(value.to_der()?)?,
    })
}

fn uri(url: &str) -> Result<GeneralName> {
    Ok(GeneralName::UniformResourceIdentifier(Ia5String::new(url)?))
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

/// One certificate policies extension holding a PolicyInformation per entry.
pub fn certificate_policies(policies: &[PolicyInfo]) -> Result<Extension> {
    let mut infos = Vec::with_capacity(policies.len());
    for policy in policies {
        let policy_identifier = ObjectIdentifier::new(&policy.oid).map_err(|e| {
            CeremonyError::ConfigValidation(format!("invalid policy OID {:?}: {}", policy.oid, e))
        })?;
        let policy_qualifiers = if policy.cps_uri.is_empty() {
            None
        } else {
            let cps = Ia5String::new(&policy.cps_uri)?;
            Some(vec![PolicyQualifierInfo {
                policy_qualifier_id: oid::QT_CPS,
                qualifier: Some(Any::from_der(&cps.to_der()?)?),
            }])
        };
        infos.push(PolicyInformation {
            policy_identifier,
            policy_qualifiers,
        });
    }
    extension(oid::CERTIFICATE_POLICIES, false, &CertificatePolicies(infos))
}

/// Build the template for `cert_type` from a validated profile.
///
/// # Arguments
///
/// * `rng` - Source of the 16 serial bytes; the HSM during a ceremony
/// * `profile` - A profile that already passed [`CertProfile::validate`]
/// * `spki_der` - DER SubjectPublicKeyInfo of the subject key
/// * `cert_type` - Which certificate is being built
pub fn make_template(
    rng: &mut (impl RngCore + CryptoRng),
    profile: &CertProfile,
    spki_der: &[u8],
    cert_type: CertType,
) -> Result<CertTemplate> {
    let spki = SubjectPublicKeyInfoOwned::from_der(spki_der)?;
    let subject_key_id = subject_key_id(&spki);

    let serial = random_bytes(rng, SERIAL_LEN).map_err(|e| {
        CeremonyError::CertificateError(format!("failed to generate serial number: {}", e))
    })?;
    let serial_number = serial_from_bytes(&serial)?;

    let mut key_usage = FlagSet::<KeyUsages>::default();
    for name in profile.key_usages.iter().flatten() {
        let bit = key_usage_bit(name).ok_or_else(|| {
            CeremonyError::ConfigValidation(format!("unknown key usage {:?}", name))
        })?;
        key_usage |= bit;
    }
    match cert_type {
        CertType::OcspSigner => key_usage = KeyUsages::DigitalSignature.into(),
        CertType::CrlSigner => key_usage = KeyUsages::CRLSign.into(),
        _ => {}
    }
    if key_usage.is_empty() {
        return Err(CeremonyError::ConfigValidation(
            "at least one key usage must be set".to_string(),
        ));
    }

    let (validity, signature_algorithm) = if cert_type == CertType::Request {
        (None, None)
    } else {
        let algorithm: SignatureAlgorithm = profile.signature_algorithm.parse()?;
        let not_before = parse_date(&profile.not_before, "not-before")?;
        let not_after = parse_date(&profile.not_after, "not-after")?;
        (Some((not_before, not_after)), Some(algorithm))
    };

    let mut template = CertTemplate {
        cert_type,
        serial_number,
        subject: profile.subject()?,
        validity,
        signature_algorithm,
        subject_public_key_info: spki,
        subject_key_id,
        authority_key_id: None,
        key_usage,
        basic_constraints: BasicConstraints {
            ca: true,
            path_len_constraint: None,
        },
        extended_key_usage: Vec::new(),
        ocsp_server: non_empty(&profile.ocsp_url),
        issuing_certificate_url: non_empty(&profile.issuer_url),
        crl_distribution_point: non_empty(&profile.crl_url),
        extra_extensions: Vec::new(),
    };

    match cert_type {
        CertType::Root | CertType::CrossCertificate => {}
        CertType::OcspSigner => {
            template.extended_key_usage = vec![oid::KP_OCSP_SIGNING];
            template.extra_extensions.push(Extension {
                extn_id: oid::OCSP_NO_CHECK,
                critical: false,
                extn_value: OctetString::new(ASN1_NULL.to_vec())?,
            });
            template.basic_constraints.ca = false;
        }
        CertType::CrlSigner => {
            template.basic_constraints.ca = false;
        }
        CertType::Request | CertType::Intermediate => {
            // serverAuth is what technically constrains the intermediate;
            // clientAuth matches the end-entity certificates it will issue.
            template.extended_key_usage = vec![oid::KP_CLIENT_AUTH, oid::KP_SERVER_AUTH];
            template.basic_constraints.path_len_constraint = Some(0);
        }
    }

    if let Some(policies) = profile.policies.as_ref().filter(|p| !p.is_empty()) {
        template.extra_extensions.push(certificate_policies(policies)?);
    }

    Ok(template)
}

impl CertTemplate {
    /// Point the template at `issuer`: copy its SKID into the AKID and
    /// require the template's validity to nest inside the issuer's.
    pub fn chain_to(&mut self, issuer: &Certificate) -> Result<()> {
        self.authority_key_id = inspect::subject_key_id(issuer)?;
        if let Some((not_before, not_after)) = self.validity {
            validity::check_nested(
                not_before,
                not_after,
                &issuer.tbs_certificate.validity,
                "certificate validity",
            )?;
        }
        Ok(())
    }

    /// Extensions in emission order: key usage, EKU, basic constraints, SKID,
    /// AKID, AIA, CRL distribution points, then the extra extensions.
    pub fn extensions(&self) -> Result<Vec<Extension>> {
        let mut exts = vec![extension(oid::KEY_USAGE, true, &KeyUsage(self.key_usage))?];

        if !self.extended_key_usage.is_empty() {
            exts.push(extension(
                oid::EXTENDED_KEY_USAGE,
                false,
                &ExtendedKeyUsage(self.extended_key_usage.clone()),
            )?);
        }

        exts.push(extension(oid::BASIC_CONSTRAINTS, true, &self.basic_constraints)?);
        exts.push(extension(
            oid::SUBJECT_KEY_IDENTIFIER,
            false,
            &SubjectKeyIdentifier(OctetString::new(self.subject_key_id.clone())?),
        )?);

        if let Some(akid) = self.authority_key_id.as_ref().filter(|a| !a.is_empty()) {
            exts.push(extension(
                oid::AUTHORITY_KEY_IDENTIFIER,
                false,
                &AuthorityKeyIdentifier {
                    key_identifier: Some(OctetString::new(akid.clone())?),
                    authority_cert_issuer: None,
                    authority_cert_serial_number: None,
                },
            )?);
        }

        let mut access = Vec::new();
        if let Some(url) = &self.ocsp_server {
            access.push(AccessDescription {
                access_method: oid::AD_OCSP,
                access_location: uri(url)?,
            });
        }
        if let Some(url) = &self.issuing_certificate_url {
            access.push(AccessDescription {
                access_method: oid::AD_CA_ISSUERS,
                access_location: uri(url)?,
            });
        }
        if !access.is_empty() {
            exts.push(extension(
                oid::AUTHORITY_INFO_ACCESS,
                false,
                &AuthorityInfoAccessSyntax(access),
            )?);
        }

        if let Some(url) = &self.crl_distribution_point {
            let point = DistributionPoint {
                distribution_point: Some(DistributionPointName::FullName(vec![uri(url)?])),
                reasons: None,
                crl_issuer: None,
            };
            exts.push(extension(
                oid::CRL_DISTRIBUTION_POINTS,
                false,
                &CrlDistributionPoints(vec![point]),
            )?);
        }

        exts.extend(self.extra_extensions.iter().cloned());
        Ok(exts)
    }

    /// The to-be-signed certificate with `issuer` as issuer name.
    pub fn to_tbs(&self, issuer: &Name) -> Result<TbsCertificate> {
        let (algorithm, (not_before, not_after)) =
            match (self.signature_algorithm, self.validity) {
                (Some(algorithm), Some(validity)) => (algorithm, validity),
                _ => {
                    return Err(CeremonyError::CertificateError(
                        "a CSR template cannot be issued as a certificate".to_string(),
                    ))
                }
            };

        Ok(TbsCertificate {
            version: Version::V3,
            serial_number: self.serial_number.clone(),
            signature: algorithm.algorithm_identifier()?,
            issuer: issuer.clone(),
            validity: validity::to_validity(not_before, not_after)?,
            subject: self.subject.clone(),
            subject_public_key_info: self.subject_public_key_info.clone(),
            issuer_unique_id: None,
            subject_unique_id: None,
            extensions: Some(self.extensions()?),
        })
    }
}
