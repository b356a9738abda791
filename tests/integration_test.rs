//! Integration tests for hsm-ceremony.
//!
//! These tests run complete ceremonies against the in-memory token, feeding
//! each ceremony's outputs into the next the way an operator would.

use base64::Engine;
use ceremony::ceremony::run;
use ceremony::cert::inspect::{extended_key_usages, subject_key_id, verify_issued_by, verify_signed_by};
use ceremony::cert::loader::load_certificate;
use ceremony::cert::ocsp::{BasicOcspResponse, CertStatus, OcspResponse};
use ceremony::config::CeremonyConfig;
use ceremony::crypto::PublicKey;
use ceremony::error::{CeremonyError, Result};
use ceremony::hsm::soft::SoftHsm;
use ceremony::oid;
use der::Decode;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use x509_cert::crl::CertificateList;
use x509_cert::ext::pkix::{BasicConstraints, KeyUsage, KeyUsages};
use x509_cert::request::CertReq;

const ROOT_LABEL: &str = "root signing key";

fn path(dir: &Path, name: &str) -> String {
    dir.join(name).display().to_string()
}

/// Write `config` to `<name>.yaml` in `dir`, load it back and run it.
fn run_config(hsm: &SoftHsm, dir: &Path, name: &str, config: Value) -> Result<()> {
    let config_path: PathBuf = dir.join(format!("{}.yaml", name));
    fs::write(&config_path, serde_yaml::to_string(&config)?)?;
    let config = CeremonyConfig::load(&config_path)?;
    run(&config, hsm)
}

fn root_ceremony(hsm: &SoftHsm, dir: &Path) -> Result<()> {
    run_config(
        hsm,
        dir,
        "root",
        json!({
            "ceremony-type": "root",
            "pkcs11": {"module": "in-memory", "store-key-in-slot": 0, "store-key-with-label": ROOT_LABEL},
            "key": {"type": "ecdsa", "ecdsa-curve": "P-384"},
            "outputs": {
                "public-key-path": path(dir, "root.pub.pem"),
                "certificate-path": path(dir, "root.pem")
            },
            "certificate-profile": {
                "signature-algorithm": "ECDSAWithSHA384",
                "common-name": "Ceremony Root X1",
                "organization": "Ceremony Test",
                "country": "US",
                "not-before": "2020-01-01 00:00:00",
                "not-after": "2040-01-01 00:00:00",
                "key-usages": ["Cert Sign", "CRL Sign"]
            }
        }),
    )
}

fn key_ceremony(hsm: &SoftHsm, dir: &Path, label: &str, name: &str) -> Result<()> {
    run_config(
        hsm,
        dir,
        &format!("{}-key", name),
        json!({
            "ceremony-type": "key",
            "pkcs11": {"module": "in-memory", "store-key-with-label": label},
            "key": {"type": "ecdsa", "ecdsa-curve": "P-256"},
            "outputs": {"public-key-path": path(dir, &format!("{}.pub.pem", name))}
        }),
    )
}

fn issued_ceremony(
    hsm: &SoftHsm,
    dir: &Path,
    ceremony_type: &str,
    name: &str,
    profile: Value,
) -> Result<()> {
    run_config(
        hsm,
        dir,
        name,
        json!({
            "ceremony-type": ceremony_type,
            "pkcs11": {"module": "in-memory", "signing-key-slot": 0, "signing-key-label": ROOT_LABEL},
            "inputs": {
                "public-key-path": path(dir, &format!("{}.pub.pem", name)),
                "issuer-certificate-path": path(dir, "root.pem")
            },
            "outputs": {"certificate-path": path(dir, &format!("{}.pem", name))},
            "certificate-profile": profile
        }),
    )
}

fn intermediate_profile() -> Value {
    json!({
        "signature-algorithm": "ECDSAWithSHA384",
        "common-name": "Ceremony Intermediate E1",
        "organization": "Ceremony Test",
        "country": "US",
        "not-before": "2020-01-01 00:00:00",
        "not-after": "2030-01-01 00:00:00",
        "crl-url": "http://crl.example.com/root.crl",
        "issuer-url": "http://certs.example.com/root.der",
        "ocsp-url": "http://ocsp.example.com",
        "key-usages": ["Digital Signature", "Cert Sign", "CRL Sign"],
        "policies": [{"oid": "2.23.140.1.2.1"}]
    })
}

fn ocsp_signer_profile() -> Value {
    json!({
        "signature-algorithm": "ECDSAWithSHA384",
        "common-name": "Ceremony OCSP Signer",
        "organization": "Ceremony Test",
        "country": "US",
        "not-before": "2020-01-01 00:00:00",
        "not-after": "2025-01-01 00:00:00",
        "issuer-url": "http://certs.example.com/root.der"
    })
}

/// Root, intermediate and OCSP signer certificates in `dir`.
fn hierarchy(hsm: &SoftHsm, dir: &Path) -> Result<()> {
    root_ceremony(hsm, dir)?;
    key_ceremony(hsm, dir, "intermediate key", "intermediate")?;
    issued_ceremony(hsm, dir, "intermediate", "intermediate", intermediate_profile())?;
    key_ceremony(hsm, dir, "ocsp key", "ocsp")?;
    issued_ceremony(hsm, dir, "ocsp-signer", "ocsp", ocsp_signer_profile())
}

#[test]
fn test_root_ceremony_p384() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let hsm = SoftHsm::new();
    root_ceremony(&hsm, dir.path())?;

    let root = load_certificate(dir.path().join("root.pem"))?;
    let public = PublicKey::from_pem(&fs::read_to_string(dir.path().join("root.pub.pem"))?)?;

    // Self-signed by the generated key
    verify_signed_by(&root, &public)?;
    assert_eq!(root.tbs_certificate.issuer, root.tbs_certificate.subject);
    assert_eq!(
        PublicKey::from_spki(&root.tbs_certificate.subject_public_key_info)?,
        public
    );

    let key_usage = root
        .tbs_certificate
        .extensions
        .as_ref()
        .and_then(|exts| exts.iter().find(|e| e.extn_id == oid::KEY_USAGE))
        .map(|e| KeyUsage::from_der(e.extn_value.as_bytes()).unwrap())
        .unwrap();
    assert_eq!(key_usage.0, KeyUsages::KeyCertSign | KeyUsages::CRLSign);

    let spki_bits = root
        .tbs_certificate
        .subject_public_key_info
        .subject_public_key
        .raw_bytes();
    assert_eq!(
        subject_key_id(&root)?,
        Some(Sha256::digest(spki_bits).to_vec())
    );
    assert!(extended_key_usages(&root)?.is_empty());

    // One key pair on the token
    assert_eq!(hsm.object_count(), 2);
    Ok(())
}

#[test]
fn test_intermediate_and_delegated_signers() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let hsm = SoftHsm::new();
    hierarchy(&hsm, dir.path())?;

    let root = load_certificate(dir.path().join("root.pem"))?;
    let intermediate = load_certificate(dir.path().join("intermediate.pem"))?;
    verify_issued_by(&intermediate, &root)?;
    assert_eq!(
        extended_key_usages(&intermediate)?,
        vec![oid::KP_CLIENT_AUTH, oid::KP_SERVER_AUTH]
    );
    let bc = intermediate
        .tbs_certificate
        .extensions
        .as_ref()
        .and_then(|exts| exts.iter().find(|e| e.extn_id == oid::BASIC_CONSTRAINTS))
        .map(|e| BasicConstraints::from_der(e.extn_value.as_bytes()).unwrap())
        .unwrap();
    assert!(bc.ca);
    assert_eq!(bc.path_len_constraint, Some(0));

    let ocsp = load_certificate(dir.path().join("ocsp.pem"))?;
    verify_issued_by(&ocsp, &root)?;
    assert_eq!(extended_key_usages(&ocsp)?, vec![oid::KP_OCSP_SIGNING]);
    Ok(())
}

#[test]
fn test_ocsp_response_ceremony() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let hsm = SoftHsm::new();
    hierarchy(&hsm, dir.path())?;

    run_config(
        &hsm,
        dir.path(),
        "ocsp-response",
        json!({
            "ceremony-type": "ocsp-response",
            "pkcs11": {"module": "in-memory", "signing-key-label": "ocsp key"},
            "inputs": {
                "certificate-path": path(dir.path(), "intermediate.pem"),
                "issuer-certificate-path": path(dir.path(), "root.pem"),
                "delegated-issuer-certificate-path": path(dir.path(), "ocsp.pem")
            },
            "outputs": {"response-path": path(dir.path(), "intermediate.ocsp")},
            "ocsp-profile": {
                "this-update": "2020-06-01 00:00:00",
                "next-update": "2020-06-08 00:00:00",
                "status": "revoked"
            }
        }),
    )?;

    let b64 = fs::read_to_string(dir.path().join("intermediate.ocsp"))?;
    assert!(b64.ends_with('\n'));
    let der = base64::engine::general_purpose::STANDARD
        .decode(b64.trim_end())
        .unwrap();
    let response = OcspResponse::from_der(&der).unwrap();
    let basic =
        BasicOcspResponse::from_der(response.response_bytes.unwrap().response.as_bytes()).unwrap();
    let ocsp = load_certificate(dir.path().join("ocsp.pem"))?;
    assert_eq!(basic.certs, Some(vec![ocsp]));
    assert!(matches!(
        basic.tbs_response_data.responses[0].cert_status,
        CertStatus::Revoked(_)
    ));
    Ok(())
}

#[test]
fn test_crl_ceremony_and_output_collision() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let hsm = SoftHsm::new();
    hierarchy(&hsm, dir.path())?;

    let crl_config = json!({
        "ceremony-type": "crl",
        "pkcs11": {"module": "in-memory", "signing-key-label": ROOT_LABEL},
        "inputs": {"issuer-certificate-path": path(dir.path(), "root.pem")},
        "outputs": {"crl-path": path(dir.path(), "root.crl.pem")},
        "crl-profile": {
            "this-update": "2020-06-01 00:00:00",
            "next-update": "2020-12-01 00:00:00",
            "number": 80,
            "revoked-certificates": [{
                "certificate-path": path(dir.path(), "intermediate.pem"),
                "revocation-date": "2020-05-30 00:00:00",
                "revocation-reason": 1
            }]
        }
    });
    run_config(&hsm, dir.path(), "crl", crl_config.clone())?;

    let written = fs::read_to_string(dir.path().join("root.crl.pem"))?;
    let parsed = pem::parse(&written).unwrap();
    assert_eq!(parsed.tag(), "X509 CRL");
    let crl = CertificateList::from_der(parsed.contents()).unwrap();
    let intermediate = load_certificate(dir.path().join("intermediate.pem"))?;
    let revoked = crl.tbs_cert_list.revoked_certificates.unwrap();
    assert_eq!(
        revoked[0].serial_number,
        intermediate.tbs_certificate.serial_number
    );

    // Running the same ceremony again must not touch the existing CRL
    let err = run_config(&hsm, dir.path(), "crl", crl_config).unwrap_err();
    assert!(err.to_string().contains("which already exists"));
    assert_eq!(fs::read_to_string(dir.path().join("root.crl.pem"))?, written);
    Ok(())
}

#[test]
fn test_crl_longer_than_a_year_rejected() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let hsm = SoftHsm::new();
    root_ceremony(&hsm, dir.path())?;

    let err = run_config(
        &hsm,
        dir.path(),
        "crl",
        json!({
            "ceremony-type": "crl",
            "pkcs11": {"module": "in-memory", "signing-key-label": ROOT_LABEL},
            "inputs": {"issuer-certificate-path": path(dir.path(), "root.pem")},
            "outputs": {"crl-path": path(dir.path(), "root.crl.pem")},
            "crl-profile": {
                "this-update": "2020-01-01 00:00:00",
                "next-update": "2021-01-02 00:00:00",
                "number": 1
            }
        }),
    )
    .unwrap_err();

    match err {
        CeremonyError::Ceremony { source, .. } => {
            assert!(matches!(*source, CeremonyError::TimeWindow(_)));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(!dir.path().join("root.crl.pem").exists());
    Ok(())
}

#[test]
fn test_cross_csr_ceremony() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let hsm = SoftHsm::new();
    root_ceremony(&hsm, dir.path())?;

    run_config(
        &hsm,
        dir.path(),
        "cross-csr",
        json!({
            "ceremony-type": "cross-csr",
            "pkcs11": {"module": "in-memory", "signing-key-label": ROOT_LABEL},
            "inputs": {"public-key-path": path(dir.path(), "root.pub.pem")},
            "outputs": {"csr-path": path(dir.path(), "root.csr.pem")},
            "certificate-profile": {
                "common-name": "Ceremony Root X1",
                "organization": "Ceremony Test",
                "country": "US"
            }
        }),
    )?;

    let parsed = pem::parse(fs::read_to_string(dir.path().join("root.csr.pem"))?).unwrap();
    assert_eq!(parsed.tag(), "CERTIFICATE REQUEST");
    let req = CertReq::from_der(parsed.contents()).unwrap();
    let root = load_certificate(dir.path().join("root.pem"))?;
    assert_eq!(req.info.subject, root.tbs_certificate.subject);
    assert_eq!(
        req.info.public_key,
        root.tbs_certificate.subject_public_key_info
    );
    Ok(())
}

#[test]
fn test_wrong_signing_key_is_refused() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let hsm = SoftHsm::new();
    root_ceremony(&hsm, dir.path())?;
    key_ceremony(&hsm, dir.path(), "intermediate key", "intermediate")?;

    // The label exists but holds a different key than the issuer certificate's
    let err = run_config(
        &hsm,
        dir.path(),
        "intermediate",
        json!({
            "ceremony-type": "intermediate",
            "pkcs11": {"module": "in-memory", "signing-key-label": "intermediate key"},
            "inputs": {
                "public-key-path": path(dir.path(), "intermediate.pub.pem"),
                "issuer-certificate-path": path(dir.path(), "root.pem")
            },
            "outputs": {"certificate-path": path(dir.path(), "intermediate.pem")},
            "certificate-profile": intermediate_profile()
        }),
    )
    .unwrap_err();

    assert!(err.to_string().starts_with("intermediate ceremony failed: "));
    assert!(!dir.path().join("intermediate.pem").exists());
    Ok(())
}
