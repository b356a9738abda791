//! The lint, sign, verify and write pipeline every certificate goes through.
//!
//! Each step is a hard gate: a lint finding, a signing failure or a signature
//! that does not verify stops issuance before anything reaches disk.

pub mod lint;

use crate::cert::inspect::{public_key, verify_issued_by, verify_signed_by};
use crate::cert::loader::cert_to_pem;
use crate::crypto::{PublicKey, SignatureAlgorithm};
use crate::error::{CeremonyError, Result};
use crate::hsm::{FailingRandom, Signer};
use crate::storage::output::write_new;
use der::asn1::BitString;
use der::{Decode, Encode};
use lint::Linter;
use std::path::Path;
use tracing::{debug, info};
use x509_cert::{Certificate, TbsCertificate};

/// Who signs a certificate.
#[derive(Debug, Clone, Copy)]
pub enum Issuer<'a> {
    /// The subject key signs its own certificate.
    SelfSigned,
    Certificate(&'a Certificate),
}

/// Lint, sign and verify `tbs`, returning the parsed certificate.
///
/// # Arguments
///
/// * `tbs` - The to-be-signed certificate; its `signature` field picks the algorithm
/// * `issuer` - The issuing certificate, or [`Issuer::SelfSigned`] for roots
/// * `subject_key` - The key the certificate certifies
/// * `signer` - The issuer's private key
/// * `linter` - Pre-issuance checks
/// * `exclusions` - Lint names to skip
pub fn issue(
    tbs: TbsCertificate,
    issuer: Issuer<'_>,
    subject_key: &PublicKey,
    signer: &dyn Signer,
    linter: &dyn Linter,
    exclusions: &[String],
) -> Result<Certificate> {
    let issuer_key = match issuer {
        Issuer::SelfSigned => subject_key.clone(),
        Issuer::Certificate(cert) => public_key(cert)?,
    };

    linter
        .check(&tbs, subject_key, &issuer_key, exclusions)
        .map_err(CeremonyError::Lint)?;
    debug!("pre-issuance lints passed");

    let algorithm = SignatureAlgorithm::from_algorithm_identifier(&tbs.signature)?;
    let signature = signer.sign(&mut FailingRandom, algorithm, &tbs.to_der()?)?;

    let der = Certificate {
        signature_algorithm: tbs.signature.clone(),
        tbs_certificate: tbs,
        signature: BitString::from_bytes(&signature)?,
    }
    .to_der()?;
    let cert = Certificate::from_der(&der)?;

    match issuer {
        // The issuer of a self-signed certificate is the certificate itself.
        Issuer::SelfSigned => verify_signed_by(&cert, &public_key(&cert)?)?,
        Issuer::Certificate(issuer_cert) => verify_issued_by(&cert, issuer_cert)?,
    }

    info!(
        subject = %cert.tbs_certificate.subject,
        issuer = %cert.tbs_certificate.issuer,
        serial = %hex::encode(cert.tbs_certificate.serial_number.as_bytes()),
        algorithm = %algorithm,
        "issued certificate"
    );
    Ok(cert)
}

/// [`issue`], then write the certificate as PEM to a new file at `output`.
pub fn issue_and_write(
    tbs: TbsCertificate,
    issuer: Issuer<'_>,
    subject_key: &PublicKey,
    signer: &dyn Signer,
    linter: &dyn Linter,
    exclusions: &[String],
    output: &Path,
) -> Result<Certificate> {
    let cert = issue(tbs, issuer, subject_key, signer, linter, exclusions)?;
    let pem = cert_to_pem(&cert)?;
    info!("certificate PEM:\n{}", pem);
    write_new(output, pem.as_bytes())?;
    Ok(cert)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::profile::{CertProfile, CertType};
    use crate::cert::template::make_template;
    use crate::crypto::{Curve, KeyGenSpec};
    use crate::hsm::soft::{Fault, SoftHsm};
    use crate::hsm::{HsmRandom, HsmSigner};
    use crate::issuance::lint::CeremonyLinter;
    use crate::keygen::generate_key;
    use std::fs;
    use tempfile::TempDir;

    fn root_profile() -> CertProfile {
        CertProfile {
            signature_algorithm: "ECDSAWithSHA256".to_string(),
            common_name: "Pipeline Root".to_string(),
            organization: "Org".to_string(),
            country: "US".to_string(),
            not_before: "2020-01-01 00:00:00".to_string(),
            not_after: "2040-01-01 00:00:00".to_string(),
            key_usages: Some(vec!["Cert Sign".to_string(), "CRL Sign".to_string()]),
            ..Default::default()
        }
    }

    fn root_tbs(hsm: &SoftHsm, spki_der: &[u8], key_usages: &[&str]) -> TbsCertificate {
        let mut profile = root_profile();
        profile.key_usages = Some(key_usages.iter().map(|s| s.to_string()).collect());
        let template =
            make_template(&mut HsmRandom::new(hsm), &profile, spki_der, CertType::Root).unwrap();
        template.to_tbs(&template.subject).unwrap()
    }

    #[test]
    fn test_self_signed_issue_and_write() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("root.pem");
        let hsm = SoftHsm::new();
        let key = generate_key(&hsm, &KeyGenSpec::Ecdsa { curve: Curve::P256 }, "root").unwrap();
        let signer = HsmSigner::new(&hsm, key.private_handle, key.public_key.clone());
        let tbs = root_tbs(&hsm, &key.spki_der, &["Cert Sign", "CRL Sign"]);

        let cert = issue_and_write(
            tbs,
            Issuer::SelfSigned,
            &key.public_key,
            &signer,
            &CeremonyLinter,
            &[],
            &output,
        )
        .unwrap();

        let written = fs::read_to_string(&output).unwrap();
        assert_eq!(crate::cert::loader::cert_from_pem(&written).unwrap(), cert);
        verify_signed_by(&cert, &key.public_key).unwrap();
    }

    #[test]
    fn test_lint_failure_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("root.pem");
        let hsm = SoftHsm::new();
        let key = generate_key(&hsm, &KeyGenSpec::Ecdsa { curve: Curve::P256 }, "root").unwrap();
        let signer = HsmSigner::new(&hsm, key.private_handle, key.public_key.clone());
        let tbs = root_tbs(&hsm, &key.spki_der, &["CRL Sign"]);

        let err = issue_and_write(
            tbs,
            Issuer::SelfSigned,
            &key.public_key,
            &signer,
            &CeremonyLinter,
            &[],
            &output,
        )
        .unwrap_err();
        assert!(matches!(err, CeremonyError::Lint(_)));
        assert!(!output.exists());
    }

    #[test]
    fn test_bad_signature_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("root.pem");
        let hsm = SoftHsm::new();
        let key = generate_key(&hsm, &KeyGenSpec::Ecdsa { curve: Curve::P256 }, "root").unwrap();
        hsm.inject_fault(Fault::CorruptSignatures);
        let signer = HsmSigner::new(&hsm, key.private_handle, key.public_key.clone());
        let tbs = root_tbs(&hsm, &key.spki_der, &["Cert Sign"]);

        let err = issue_and_write(
            tbs,
            Issuer::SelfSigned,
            &key.public_key,
            &signer,
            &CeremonyLinter,
            &[],
            &output,
        )
        .unwrap_err();
        assert!(matches!(err, CeremonyError::SignatureVerification(_)));
        assert!(!output.exists());
    }

    #[test]
    fn test_signer_must_not_use_process_randomness() {
        struct GreedySigner(PublicKey);

        impl Signer for GreedySigner {
            fn public_key(&self) -> &PublicKey {
                &self.0
            }

            fn sign(
                &self,
                rng: &mut dyn rand::RngCore,
                _algorithm: SignatureAlgorithm,
                _message: &[u8],
            ) -> Result<Vec<u8>> {
                crate::hsm::random_bytes(rng, 32)
            }
        }

        let hsm = SoftHsm::new();
        let key = generate_key(&hsm, &KeyGenSpec::Ecdsa { curve: Curve::P256 }, "root").unwrap();
        let tbs = root_tbs(&hsm, &key.spki_der, &["Cert Sign"]);
        let signer = GreedySigner(key.public_key.clone());

        let err = issue(
            tbs,
            Issuer::SelfSigned,
            &key.public_key,
            &signer,
            &CeremonyLinter,
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, CeremonyError::CryptoError(_)));
    }
}
