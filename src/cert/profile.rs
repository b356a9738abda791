//! Certificate profiles and the per-type rules governing them.
//!
//! Which profile fields are legal, and which are required, is a pure
//! function of the [`CertType`] being issued. [`CertProfile::validate`]
//! enforces that table and runs before any HSM session is opened.

use crate::error::{CeremonyError, Result};
use crate::oid;
use der::asn1::{Any, PrintableStringRef, SetOfVec, Utf8StringRef};
use der::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt;
use x509_cert::attr::AttributeTypeAndValue;
use x509_cert::name::{Name, RdnSequence, RelativeDistinguishedName};

/// One certificate policy entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct PolicyInfo {
    pub oid: String,
    #[serde(default)]
    pub cps_uri: String,
}

/// The declarative description of a certificate or CSR.
///
/// Empty strings mean "not set". `policies` and `key_usages` distinguish an
/// absent list from an empty one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct CertProfile {
    pub signature_algorithm: String,
    pub common_name: String,
    pub organization: String,
    pub country: String,
    /// `YYYY-MM-DD HH:MM:SS`, UTC
    pub not_before: String,
    /// `YYYY-MM-DD HH:MM:SS`, UTC
    pub not_after: String,
    pub ocsp_url: String,
    pub crl_url: String,
    pub issuer_url: String,
    pub policies: Option<Vec<PolicyInfo>>,
    pub key_usages: Option<Vec<String>>,
}

/// What a profile is used to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CertType {
    Root,
    Intermediate,
    OcspSigner,
    CrlSigner,
    CrossCertificate,
    /// A certificate signing request
    Request,
}

impl CertType {
    pub const ALL: [CertType; 6] = [
        CertType::Root,
        CertType::Intermediate,
        CertType::OcspSigner,
        CertType::CrlSigner,
        CertType::CrossCertificate,
        CertType::Request,
    ];

    /// OCSP and CRL signers: certificates that sign on an issuer's behalf.
    pub fn is_delegated_signer(self) -> bool {
        matches!(self, CertType::OcspSigner | CertType::CrlSigner)
    }
}

impl fmt::Display for CertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CertType::Root => "root",
            CertType::Intermediate => "intermediate",
            CertType::OcspSigner => "ocsp-signer",
            CertType::CrlSigner => "crl-signer",
            CertType::CrossCertificate => "cross-certificate",
            CertType::Request => "cross-csr",
        };
        f.write_str(name)
    }
}

fn invalid(message: &str) -> CeremonyError {
    CeremonyError::ConfigValidation(message.to_string())
}

impl CertProfile {
    /// Check the profile against the field rules for `cert_type`.
    ///
    /// The first violated rule is reported, naming the offending field.
    pub fn validate(&self, cert_type: CertType) -> Result<()> {
        if cert_type == CertType::Request {
            if !self.not_before.is_empty() {
                return Err(invalid("not-before cannot be set for a CSR"));
            }
            if !self.not_after.is_empty() {
                return Err(invalid("not-after cannot be set for a CSR"));
            }
            if !self.signature_algorithm.is_empty() {
                return Err(invalid("signature-algorithm cannot be set for a CSR"));
            }
            if !self.ocsp_url.is_empty() {
                return Err(invalid("ocsp-url cannot be set for a CSR"));
            }
            if !self.crl_url.is_empty() {
                return Err(invalid("crl-url cannot be set for a CSR"));
            }
            if !self.issuer_url.is_empty() {
                return Err(invalid("issuer-url cannot be set for a CSR"));
            }
            if self.policies.is_some() {
                return Err(invalid("policies cannot be set for a CSR"));
            }
            if self.key_usages.is_some() {
                return Err(invalid("key-usages cannot be set for a CSR"));
            }
        } else {
            if self.not_before.is_empty() {
                return Err(invalid("not-before is required"));
            }
            if self.not_after.is_empty() {
                return Err(invalid("not-after is required"));
            }
            if self.signature_algorithm.is_empty() {
                return Err(invalid("signature-algorithm is required"));
            }
        }

        if self.common_name.is_empty() {
            return Err(invalid("common-name is required"));
        }
        if self.organization.is_empty() {
            return Err(invalid("organization is required"));
        }
        if self.country.is_empty() {
            return Err(invalid("country is required"));
        }

        if cert_type == CertType::Intermediate {
            if self.crl_url.is_empty() {
                return Err(invalid("crl-url is required for intermediates"));
            }
            if self.issuer_url.is_empty() {
                return Err(invalid("issuer-url is required for intermediates"));
            }
        }

        if cert_type.is_delegated_signer() {
            if self.key_usages.as_ref().is_some_and(|k| !k.is_empty()) {
                return Err(invalid("key-usages cannot be set for a delegated signer"));
            }
            if !self.crl_url.is_empty() {
                return Err(invalid("crl-url cannot be set for a delegated signer"));
            }
            if !self.ocsp_url.is_empty() {
                return Err(invalid("ocsp-url cannot be set for a delegated signer"));
            }
        }

        Ok(())
    }

    /// Subject name `C=<country>, O=<organization>, CN=<common name>`.
    pub fn subject(&self) -> Result<Name> {
        let mut rdns = Vec::new();
        for (oid, value) in [
            (oid::COUNTRY_NAME, &self.country),
            (oid::ORGANIZATION_NAME, &self.organization),
            (oid::COMMON_NAME, &self.common_name),
        ] {
            if value.is_empty() {
                continue;
            }
            rdns.push(single_attribute_rdn(oid, value)?);
        }
        Ok(RdnSequence(rdns))
    }
}

/// PrintableString when the value allows it, UTF8String otherwise.
fn directory_string(value: &str) -> Result<Any> {
    let encoded = match PrintableStringRef::new(value) {
        Ok(printable) => printable.to_der(),
        Err(_) => Utf8StringRef::new(value).and_then(|utf8| utf8.to_der()),
    };
    encoded.and_then(|der| Any::from_der(&der)).map_err(|e| {
        CeremonyError::CertificateError(format!("invalid subject value {:?}: {}", value, e))
    })
}

fn single_attribute_rdn(
    oid: const_oid::ObjectIdentifier,
    value: &str,
) -> Result<RelativeDistinguishedName> {
    let attr = AttributeTypeAndValue {
        oid,
        value: directory_string(value)?,
    };

    let mut attr_set = SetOfVec::new();
    attr_set
        .insert_ordered(attr)
        .map_err(|e| CeremonyError::CertificateError(format!("failed to add attribute: {}", e)))?;

    Ok(RelativeDistinguishedName::from(attr_set))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_profile() -> CertProfile {
        CertProfile {
            signature_algorithm: "ECDSAWithSHA384".to_string(),
            common_name: "CA".to_string(),
            organization: "Org".to_string(),
            country: "US".to_string(),
            not_before: "2020-01-01 12:00:00".to_string(),
            not_after: "2040-01-01 12:00:00".to_string(),
            ocsp_url: "http://ocsp".to_string(),
            crl_url: "http://crl".to_string(),
            issuer_url: "http://issuer".to_string(),
            policies: Some(vec![PolicyInfo {
                oid: "2.23.140.1.2.1".to_string(),
                cps_uri: String::new(),
            }]),
            key_usages: Some(vec!["Cert Sign".to_string(), "CRL Sign".to_string()]),
        }
    }

    fn csr_profile() -> CertProfile {
        CertProfile {
            common_name: "CA".to_string(),
            organization: "Org".to_string(),
            country: "US".to_string(),
            ..Default::default()
        }
    }

    /// The rules as a table: which fields must be absent, and which required,
    /// for each cert type.
    fn forbidden(cert_type: CertType) -> &'static [&'static str] {
        match cert_type {
            CertType::Request => &[
                "not-before",
                "not-after",
                "signature-algorithm",
                "ocsp-url",
                "crl-url",
                "issuer-url",
                "policies",
                "key-usages",
            ],
            CertType::OcspSigner | CertType::CrlSigner => &["key-usages", "crl-url", "ocsp-url"],
            _ => &[],
        }
    }

    fn required(cert_type: CertType) -> Vec<&'static str> {
        let mut fields = vec!["common-name", "organization", "country"];
        if cert_type != CertType::Request {
            fields.extend(["not-before", "not-after", "signature-algorithm"]);
        }
        if cert_type == CertType::Intermediate {
            fields.extend(["crl-url", "issuer-url"]);
        }
        fields
    }

    fn clear(profile: &mut CertProfile, field: &str) {
        match field {
            "signature-algorithm" => profile.signature_algorithm.clear(),
            "common-name" => profile.common_name.clear(),
            "organization" => profile.organization.clear(),
            "country" => profile.country.clear(),
            "not-before" => profile.not_before.clear(),
            "not-after" => profile.not_after.clear(),
            "ocsp-url" => profile.ocsp_url.clear(),
            "crl-url" => profile.crl_url.clear(),
            "issuer-url" => profile.issuer_url.clear(),
            "policies" => profile.policies = None,
            "key-usages" => profile.key_usages = None,
            other => panic!("unknown field {}", other),
        }
    }

    fn minimal_valid(cert_type: CertType) -> CertProfile {
        let mut profile = full_profile();
        for field in forbidden(cert_type) {
            clear(&mut profile, field);
        }
        profile
    }

    #[test]
    fn test_minimal_profiles_accepted() {
        for cert_type in CertType::ALL {
            assert!(
                minimal_valid(cert_type).validate(cert_type).is_ok(),
                "{} rejected its minimal profile",
                cert_type
            );
        }
    }

    #[test]
    fn test_each_required_field_enforced() {
        for cert_type in CertType::ALL {
            for field in required(cert_type) {
                let mut profile = minimal_valid(cert_type);
                clear(&mut profile, field);
                let err = profile.validate(cert_type).unwrap_err().to_string();
                assert!(
                    err.contains(field),
                    "{}: missing {} gave {:?}",
                    cert_type,
                    field,
                    err
                );
            }
        }
    }

    #[test]
    fn test_each_forbidden_field_enforced() {
        for cert_type in CertType::ALL {
            for field in forbidden(cert_type) {
                let mut profile = minimal_valid(cert_type);
                let full = full_profile();
                match *field {
                    "not-before" => profile.not_before = full.not_before,
                    "not-after" => profile.not_after = full.not_after,
                    "signature-algorithm" => profile.signature_algorithm = full.signature_algorithm,
                    "ocsp-url" => profile.ocsp_url = full.ocsp_url,
                    "crl-url" => profile.crl_url = full.crl_url,
                    "issuer-url" => profile.issuer_url = full.issuer_url,
                    "policies" => profile.policies = Some(vec![]),
                    "key-usages" => profile.key_usages = full.key_usages,
                    other => panic!("unknown field {}", other),
                }
                let err = profile.validate(cert_type).unwrap_err().to_string();
                assert!(err.contains(field), "{}: {} gave {:?}", cert_type, field, err);
            }
        }
    }

    #[test]
    fn test_optional_fields_do_not_matter_for_root_and_cross() {
        for cert_type in [CertType::Root, CertType::CrossCertificate] {
            let mut profile = full_profile();
            for field in ["ocsp-url", "crl-url", "issuer-url", "policies", "key-usages"] {
                clear(&mut profile, field);
            }
            assert!(profile.validate(cert_type).is_ok());
        }
    }

    #[test]
    fn test_empty_policy_list_is_not_absent_for_csr() {
        let mut profile = csr_profile();
        assert!(profile.validate(CertType::Request).is_ok());
        profile.policies = Some(vec![]);
        assert!(profile.validate(CertType::Request).is_err());
    }

    #[test]
    fn test_subject_order() {
        let subject = full_profile().subject().unwrap();
        let oids: Vec<_> = subject
            .0
            .iter()
            .map(|rdn| rdn.0.iter().next().unwrap().oid)
            .collect();
        assert_eq!(
            oids,
            vec![oid::COUNTRY_NAME, oid::ORGANIZATION_NAME, oid::COMMON_NAME]
        );
    }

    #[test]
    fn test_deserialize_kebab_case() {
        let profile: CertProfile = serde_json::from_str(
            r#"{"common-name": "CA", "key-usages": ["Cert Sign"], "policies": [{"oid": "1.2.3", "cps-uri": "http://cps"}]}"#,
        )
        .unwrap();
        assert_eq!(profile.common_name, "CA");
        assert_eq!(profile.key_usages, Some(vec!["Cert Sign".to_string()]));
        assert_eq!(profile.policies.unwrap()[0].cps_uri, "http://cps");

        let unknown = serde_json::from_str::<CertProfile>(r#"{"common-nam": "CA"}"#);
        assert!(unknown.is_err());
    }
}
