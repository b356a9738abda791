//! Pre-issuance linting of to-be-signed certificates.
//!
//! A lint inspects the unsigned certificate and reports a finding when it
//! would produce something the hierarchy must never contain. Any finding not
//! listed in the ceremony's `skip-lints` aborts issuance before the HSM signs.

use crate::crypto::{PublicKey, SignatureAlgorithm};
use crate::oid;
use const_oid::ObjectIdentifier;
use der::Decode;
use std::collections::HashSet;
use std::fmt;
use x509_cert::ext::pkix::{BasicConstraints, KeyUsage, KeyUsages};
use x509_cert::ext::Extension;
use x509_cert::TbsCertificate;

/// A single failed lint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LintFinding {
    pub lint: &'static str,
    pub message: String,
}

/// Every lint that failed for one certificate.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LintFindings(pub Vec<LintFinding>);

impl LintFindings {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.0.iter().map(|f| f.lint).collect()
    }
}

impl fmt::Display for LintFindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, finding) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", finding.lint, finding.message)?;
        }
        Ok(())
    }
}

/// Checks a to-be-signed certificate before it is signed.
pub trait Linter {
    /// Run every lint not named in `exclusions`.
    fn check(
        &self,
        tbs: &TbsCertificate,
        subject_key: &PublicKey,
        issuer_key: &PublicKey,
        exclusions: &[String],
    ) -> Result<(), LintFindings>;
}

struct LintInput<'a> {
    tbs: &'a TbsCertificate,
    subject_key: &'a PublicKey,
    issuer_key: &'a PublicKey,
}

impl LintInput<'_> {
    fn extension(&self, id: &ObjectIdentifier) -> Option<&Extension> {
        self.tbs
            .extensions
            .as_ref()
            .and_then(|exts| exts.iter().find(|e| e.extn_id == *id))
    }

    fn basic_constraints(&self) -> Option<BasicConstraints> {
        self.extension(&oid::BASIC_CONSTRAINTS)
            .and_then(|e| BasicConstraints::from_der(e.extn_value.as_bytes()).ok())
    }

    fn is_ca(&self) -> bool {
        self.basic_constraints().map(|bc| bc.ca).unwrap_or(false)
    }

    fn self_issued(&self) -> bool {
        self.tbs.issuer == self.tbs.subject
    }
}

type LintFn = fn(&LintInput<'_>) -> Option<String>;

/// Names of the lints [`CeremonyLinter`] runs, in order.
pub const LINT_NAMES: [&str; 11] = [
    "e_serial_number_not_positive",
    "e_serial_number_longer_than_20_octets",
    "e_validity_time_not_positive",
    "e_subject_empty",
    "e_ext_duplicate_extension",
    "e_key_usage_missing_or_not_critical",
    "e_basic_constraints_missing_or_not_critical",
    "e_ca_key_cert_sign_not_set",
    "e_ca_subject_key_identifier_missing",
    "e_authority_key_identifier_missing",
    "e_signature_algorithm_key_mismatch",
];

const LINTS: [LintFn; 11] = [
    serial_not_positive,
    serial_too_long,
    validity_not_positive,
    subject_empty,
    duplicate_extension,
    key_usage_critical,
    basic_constraints_critical,
    ca_key_cert_sign,
    ca_subject_key_identifier,
    authority_key_identifier,
    signature_algorithm_key,
];

/// Whether `name` is a lint [`CeremonyLinter`] knows about.
pub fn is_known_lint(name: &str) -> bool {
    LINT_NAMES.contains(&name)
}

fn serial_not_positive(input: &LintInput<'_>) -> Option<String> {
    let bytes = input.tbs.serial_number.as_bytes();
    if bytes.first().map(|b| b & 0x80 != 0).unwrap_or(true) || bytes.iter().all(|b| *b == 0) {
        return Some("serial number must be a positive integer".to_string());
    }
    None
}

fn serial_too_long(input: &LintInput<'_>) -> Option<String> {
    let len = input.tbs.serial_number.as_bytes().len();
    (len > 20).then(|| format!("serial number is {} octets", len))
}

fn validity_not_positive(input: &LintInput<'_>) -> Option<String> {
    let validity = &input.tbs.validity;
    (validity.not_after.to_unix_duration() <= validity.not_before.to_unix_duration())
        .then(|| "notAfter is not after notBefore".to_string())
}

fn subject_empty(input: &LintInput<'_>) -> Option<String> {
    input
        .tbs
        .subject
        .0
        .is_empty()
        .then(|| "subject name is empty".to_string())
}

fn duplicate_extension(input: &LintInput<'_>) -> Option<String> {
    let mut seen = HashSet::new();
    input
        .tbs
        .extensions
        .iter()
        .flatten()
        .find(|e| !seen.insert(e.extn_id))
        .map(|e| format!("extension {} appears more than once", e.extn_id))
}

fn key_usage_critical(input: &LintInput<'_>) -> Option<String> {
    match input.extension(&oid::KEY_USAGE) {
        None => Some("key usage extension is missing".to_string()),
        Some(ext) if !ext.critical => Some("key usage extension is not critical".to_string()),
        Some(_) => None,
    }
}

fn basic_constraints_critical(input: &LintInput<'_>) -> Option<String> {
    match input.extension(&oid::BASIC_CONSTRAINTS) {
        None => Some("basic constraints extension is missing".to_string()),
        Some(ext) if !ext.critical => {
            Some("basic constraints extension is not critical".to_string())
        }
        Some(_) => None,
    }
}

fn ca_key_cert_sign(input: &LintInput<'_>) -> Option<String> {
    if !input.is_ca() {
        return None;
    }
    let usage = input
        .extension(&oid::KEY_USAGE)
        .and_then(|e| KeyUsage::from_der(e.extn_value.as_bytes()).ok());
    match usage {
        Some(ku) if ku.0.contains(KeyUsages::KeyCertSign) => None,
        _ => Some("CA certificate does not assert keyCertSign".to_string()),
    }
}

fn ca_subject_key_identifier(input: &LintInput<'_>) -> Option<String> {
    (input.is_ca() && input.extension(&oid::SUBJECT_KEY_IDENTIFIER).is_none())
        .then(|| "CA certificate has no subject key identifier".to_string())
}

fn authority_key_identifier(input: &LintInput<'_>) -> Option<String> {
    (!input.self_issued() && input.extension(&oid::AUTHORITY_KEY_IDENTIFIER).is_none())
        .then(|| "certificate has no authority key identifier".to_string())
}

fn signature_algorithm_key(input: &LintInput<'_>) -> Option<String> {
    let algorithm = match SignatureAlgorithm::from_algorithm_identifier(&input.tbs.signature) {
        Ok(algorithm) => algorithm,
        Err(e) => return Some(e.to_string()),
    };
    if let Err(e) = algorithm.check_key(input.issuer_key) {
        return Some(e.to_string());
    }
    let spki_matches = input
        .subject_key
        .to_spki()
        .map(|spki| spki == input.tbs.subject_public_key_info)
        .unwrap_or(false);
    (!spki_matches).then(|| "subject public key info does not match the subject key".to_string())
}

/// The fixed lint set every ceremony certificate is checked against.
#[derive(Debug, Default, Clone, Copy)]
pub struct CeremonyLinter;

impl Linter for CeremonyLinter {
    fn check(
        &self,
        tbs: &TbsCertificate,
        subject_key: &PublicKey,
        issuer_key: &PublicKey,
        exclusions: &[String],
    ) -> Result<(), LintFindings> {
        let input = LintInput {
            tbs,
            subject_key,
            issuer_key,
        };
        let mut findings = Vec::new();
        for (&name, lint) in LINT_NAMES.iter().zip(LINTS.iter()) {
            if exclusions.iter().any(|e| e.as_str() == name) {
                continue;
            }
            if let Some(message) = lint(&input) {
                findings.push(LintFinding {
                    lint: name,
                    message,
                });
            }
        }

        if findings.is_empty() {
            Ok(())
        } else {
            Err(LintFindings(findings))
        }
    }
}
