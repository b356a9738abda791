//! Ceremony workflows and the dispatcher that selects one.
//!
//! Every workflow validates its configuration before it opens an HSM
//! session, and stops at the first failure. Nothing is retried.

use crate::cert::crl::{generate_crl, RevokedEntry};
use crate::cert::csr::generate_csr;
use crate::cert::inspect::public_key;
use crate::cert::loader::{load_certificate, load_public_key};
use crate::cert::ocsp::generate_ocsp_response;
use crate::cert::profile::CertType;
use crate::cert::template::make_template;
use crate::config::{
    parse_date, CeremonyConfig, CrlConfig, CsrConfig, IntermediateConfig, KeyConfig,
    OcspRespConfig, Pkcs11KeyGenConfig, Pkcs11SigningConfig, RootConfig,
};
use crate::error::{CeremonyError, Result};
use crate::hsm::{HsmConnector, HsmRandom, HsmSigner};
use crate::issuance::lint::CeremonyLinter;
use crate::issuance::{issue_and_write, Issuer};
use crate::keygen::{generate_key, GeneratedKey};
use crate::storage::output::write_new;
use serde::Serialize;
use std::fmt;
use tracing::info;

/// The nine ceremonies this tool performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CeremonyType {
    Root,
    Intermediate,
    CrossCertificate,
    CrossCsr,
    OcspSigner,
    CrlSigner,
    Key,
    OcspResponse,
    Crl,
}

impl fmt::Display for CeremonyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CeremonyType::Root => "root",
            CeremonyType::Intermediate => "intermediate",
            CeremonyType::CrossCertificate => "cross-certificate",
            CeremonyType::CrossCsr => "cross-csr",
            CeremonyType::OcspSigner => "ocsp-signer",
            CeremonyType::CrlSigner => "crl-signer",
            CeremonyType::Key => "key",
            CeremonyType::OcspResponse => "ocsp-response",
            CeremonyType::Crl => "crl",
        };
        f.write_str(name)
    }
}

impl CeremonyConfig {
    pub fn ceremony_type(&self) -> CeremonyType {
        match self {
            CeremonyConfig::Root(_) => CeremonyType::Root,
            CeremonyConfig::Intermediate(_) => CeremonyType::Intermediate,
            CeremonyConfig::CrossCertificate(_) => CeremonyType::CrossCertificate,
            CeremonyConfig::CrossCsr(_) => CeremonyType::CrossCsr,
            CeremonyConfig::OcspSigner(_) => CeremonyType::OcspSigner,
            CeremonyConfig::CrlSigner(_) => CeremonyType::CrlSigner,
            CeremonyConfig::Key(_) => CeremonyType::Key,
            CeremonyConfig::OcspResponse(_) => CeremonyType::OcspResponse,
            CeremonyConfig::Crl(_) => CeremonyType::Crl,
        }
    }
}

/// Run the ceremony `config` describes against HSMs reached through `connector`.
///
/// Errors are wrapped in [`CeremonyError::Ceremony`] naming the ceremony.
///
/// # Example
///
/// ```rust,no_run
/// use ceremony::ceremony::run;
/// use ceremony::config::CeremonyConfig;
/// use ceremony::hsm::soft::SoftHsm;
///
/// # fn example() -> ceremony::error::Result<()> {
/// let config = CeremonyConfig::load("key-ceremony.json")?;
/// run(&config, &SoftHsm::new())?;
/// # Ok(())
/// # }
/// ```
pub fn run<C: HsmConnector>(config: &CeremonyConfig, connector: &C) -> Result<()> {
    let ceremony = config.ceremony_type();
    info!(%ceremony, "starting ceremony");

    let result = match config {
        CeremonyConfig::Root(config) => root_ceremony(config, connector),
        CeremonyConfig::Intermediate(config) => {
            issued_ceremony(config, CertType::Intermediate, connector)
        }
        CeremonyConfig::CrossCertificate(config) => {
            issued_ceremony(config, CertType::CrossCertificate, connector)
        }
        CeremonyConfig::CrossCsr(config) => csr_ceremony(config, connector),
        CeremonyConfig::OcspSigner(config) => {
            issued_ceremony(config, CertType::OcspSigner, connector)
        }
        CeremonyConfig::CrlSigner(config) => {
            issued_ceremony(config, CertType::CrlSigner, connector)
        }
        CeremonyConfig::Key(config) => key_ceremony(config, connector),
        CeremonyConfig::OcspResponse(config) => ocsp_response_ceremony(config, connector),
        CeremonyConfig::Crl(config) => crl_ceremony(config, connector),
    };

    result.map_err(|source| CeremonyError::Ceremony {
        ceremony,
        source: Box::new(source),
    })?;
    info!(%ceremony, "ceremony complete");
    Ok(())
}

fn pin(pin: &str) -> Option<&str> {
    (!pin.is_empty()).then_some(pin)
}

fn open_keygen_session<C: HsmConnector>(
    pkcs11: &Pkcs11KeyGenConfig,
    connector: &C,
) -> Result<C::Session> {
    let session =
        connector.open_session(&pkcs11.module, pkcs11.store_key_in_slot, pin(&pkcs11.pin))?;
    info!("Opened PKCS#11 session for slot {}", pkcs11.store_key_in_slot);
    Ok(session)
}

fn open_signing_session<C: HsmConnector>(
    pkcs11: &Pkcs11SigningConfig,
    connector: &C,
) -> Result<C::Session> {
    let session =
        connector.open_session(&pkcs11.module, pkcs11.signing_key_slot, pin(&pkcs11.pin))?;
    info!("Opened PKCS#11 session for slot {}", pkcs11.signing_key_slot);
    Ok(session)
}

fn write_public_key(key: &GeneratedKey, path: &std::path::Path) -> Result<()> {
    let pem = key.public_key.to_pem()?;
    info!("Public key PEM:\n{}", pem);
    write_new(path, pem.as_bytes())
}

fn root_ceremony<C: HsmConnector>(config: &RootConfig, connector: &C) -> Result<()> {
    config.validate()?;
    let session = open_keygen_session(&config.pkcs11, connector)?;
    let label = &config.pkcs11.store_key_with_label;

    let key = generate_key(&session, &config.key.spec()?, label)?;
    write_public_key(&key, &config.outputs.public_key_path)?;

    let signer = HsmSigner::open(&session, label, &key.public_key)?;
    let template = make_template(
        &mut HsmRandom::new(&session),
        &config.certificate_profile,
        &key.spki_der,
        CertType::Root,
    )?;
    let tbs = template.to_tbs(&template.subject)?;

    issue_and_write(
        tbs,
        Issuer::SelfSigned,
        &key.public_key,
        &signer,
        &CeremonyLinter,
        &config.skip_lints,
        &config.outputs.certificate_path,
    )?;
    Ok(())
}

/// Intermediate, cross-certificate and delegated signer ceremonies.
fn issued_ceremony<C: HsmConnector>(
    config: &IntermediateConfig,
    cert_type: CertType,
    connector: &C,
) -> Result<()> {
    config.validate(cert_type)?;

    let (subject_key, spki_der) = load_public_key(&config.inputs.public_key_path)?;
    let issuer = load_certificate(&config.inputs.issuer_certificate_path)?;
    let issuer_key = public_key(&issuer)?;

    let session = open_signing_session(&config.pkcs11, connector)?;
    let signer = HsmSigner::open(&session, &config.pkcs11.signing_key_label, &issuer_key)?;
    info!("Retrieved private key handle");

    let mut template = make_template(
        &mut HsmRandom::new(&session),
        &config.certificate_profile,
        &spki_der,
        cert_type,
    )?;
    template.chain_to(&issuer)?;
    let tbs = template.to_tbs(&issuer.tbs_certificate.subject)?;

    issue_and_write(
        tbs,
        Issuer::Certificate(&issuer),
        &subject_key,
        &signer,
        &CeremonyLinter,
        &config.skip_lints,
        &config.outputs.certificate_path,
    )?;
    Ok(())
}

fn csr_ceremony<C: HsmConnector>(config: &CsrConfig, connector: &C) -> Result<()> {
    config.validate()?;

    let (key, _) = load_public_key(&config.inputs.public_key_path)?;
    let session = open_signing_session(&config.pkcs11, connector)?;
    let signer = HsmSigner::open(&session, &config.pkcs11.signing_key_label, &key)?;
    info!("Retrieved private key handle");

    let csr = generate_csr(&config.certificate_profile, &signer)?;
    write_new(&config.outputs.csr_path, csr.as_bytes())?;
    info!("CSR written to {:?}", config.outputs.csr_path);
    Ok(())
}

/// Access details for a key, in the form PKCS#11 clients consume.
#[derive(Debug, Serialize)]
struct HsmAccess<'a> {
    module: &'a str,
    #[serde(rename = "tokenLabel")]
    token_label: &'a str,
    pin: &'a str,
}

fn key_ceremony<C: HsmConnector>(config: &KeyConfig, connector: &C) -> Result<()> {
    config.validate()?;
    let session = open_keygen_session(&config.pkcs11, connector)?;

    let key = generate_key(
        &session,
        &config.key.spec()?,
        &config.pkcs11.store_key_with_label,
    )?;
    write_public_key(&key, &config.outputs.public_key_path)?;

    if !config.outputs.pkcs11_config_path.as_os_str().is_empty() {
        let access = serde_json::to_string(&HsmAccess {
            module: &config.pkcs11.module,
            token_label: &config.pkcs11.store_key_with_label,
            pin: &config.pkcs11.pin,
        })?;
        write_new(&config.outputs.pkcs11_config_path, access.as_bytes())?;
    }
    Ok(())
}

fn ocsp_response_ceremony<C: HsmConnector>(config: &OcspRespConfig, connector: &C) -> Result<()> {
    config.validate()?;

    let cert = load_certificate(&config.inputs.certificate_path)?;
    let issuer = load_certificate(&config.inputs.issuer_certificate_path)?;
    let delegated_issuer = config
        .delegated_issuer_path()
        .map(|path| load_certificate(path))
        .transpose()?;
    let signing_key = public_key(delegated_issuer.as_ref().unwrap_or(&issuer))?;

    let session = open_signing_session(&config.pkcs11, connector)?;
    let signer = HsmSigner::open(&session, &config.pkcs11.signing_key_label, &signing_key)?;
    info!("Retrieved private key handle");

    let profile = &config.ocsp_profile;
    let response = generate_ocsp_response(
        &signer,
        &issuer,
        delegated_issuer.as_ref(),
        &cert,
        parse_date(&profile.this_update, "ocsp-profile.this-update")?,
        parse_date(&profile.next_update, "ocsp-profile.next-update")?,
        profile.status()?,
    )?;
    write_new(&config.outputs.response_path, response.as_bytes())
}

fn crl_ceremony<C: HsmConnector>(config: &CrlConfig, connector: &C) -> Result<()> {
    config.validate()?;

    let issuer = load_certificate(&config.inputs.issuer_certificate_path)?;
    let profile = &config.crl_profile;
    let mut revoked = Vec::with_capacity(profile.revoked_certificates.len());
    for entry in &profile.revoked_certificates {
        let cert = load_certificate(&entry.certificate_path)?;
        revoked.push(RevokedEntry {
            serial_number: cert.tbs_certificate.serial_number.clone(),
            revocation_date: parse_date(
                &entry.revocation_date,
                "crl-profile.revoked-certificates.revocation-date",
            )?,
            reason: entry.revocation_reason,
        });
    }

    let session = open_signing_session(&config.pkcs11, connector)?;
    let signer = HsmSigner::open(&session, &config.pkcs11.signing_key_label, &public_key(&issuer)?)?;
    info!("Retrieved private key handle");

    let crl = generate_crl(
        &signer,
        &issuer,
        parse_date(&profile.this_update, "crl-profile.this-update")?,
        parse_date(&profile.next_update, "crl-profile.next-update")?,
        profile.number,
        &revoked,
    )?;
    info!("Signed CRL PEM:\n{}", crl);
    write_new(&config.outputs.crl_path, crl.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hsm::soft::SoftHsm;
    use std::fs;
    use tempfile::TempDir;

    fn key_config(dir: &TempDir, label: &str) -> CeremonyConfig {
        let json = format!(
            r#"{{
                "ceremony-type": "key",
                "pkcs11": {{"module": "softhsm", "pin": "1234", "store-key-with-label": "{label}"}},
                "key": {{"type": "ecdsa", "ecdsa-curve": "P-256"}},
                "outputs": {{
                    "public-key-path": "{public}",
                    "pkcs11-config-path": "{access}"
                }}
            }}"#,
            label = label,
            public = dir.path().join(format!("{}.pub.pem", label)).display(),
            access = dir.path().join(format!("{}.json", label)).display(),
        );
        CeremonyConfig::from_yaml(&json).unwrap()
    }

    #[test]
    fn test_ceremony_type_names() {
        assert_eq!(CeremonyType::CrossCsr.to_string(), "cross-csr");
        assert_eq!(CeremonyType::OcspResponse.to_string(), "ocsp-response");
    }

    #[test]
    fn test_key_ceremony_writes_access_document() {
        let dir = TempDir::new().unwrap();
        let hsm = SoftHsm::with_pin("1234");
        run(&key_config(&dir, "issuer"), &hsm).unwrap();

        let access: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("issuer.json")).unwrap())
                .unwrap();
        assert_eq!(access["module"], "softhsm");
        assert_eq!(access["tokenLabel"], "issuer");
        assert_eq!(access["pin"], "1234");

        let public = fs::read_to_string(dir.path().join("issuer.pub.pem")).unwrap();
        assert!(crate::crypto::PublicKey::from_pem(&public).is_ok());
        assert_eq!(hsm.object_count(), 2);
    }

    #[test]
    fn test_wrong_pin_fails_with_context() {
        let dir = TempDir::new().unwrap();
        let hsm = SoftHsm::with_pin("0000");
        let err = run(&key_config(&dir, "issuer"), &hsm).unwrap_err();

        assert!(err.to_string().starts_with("key ceremony failed: "));
        assert!(matches!(
            err,
            CeremonyError::Ceremony { ceremony: CeremonyType::Key, ref source }
                if matches!(**source, CeremonyError::Hsm(_))
        ));
        assert_eq!(hsm.object_count(), 0);
    }

    #[test]
    fn test_invalid_config_never_touches_hsm() {
        let dir = TempDir::new().unwrap();
        let hsm = SoftHsm::new();
        let config = CeremonyConfig::from_yaml(
            r#"{"ceremony-type": "key", "pkcs11": {"module": "softhsm", "store-key-with-label": "k"}, "key": {"type": "rsa", "rsa-mod-length": 1024}}"#,
        )
        .unwrap();

        let err = run(&config, &hsm).unwrap_err();
        assert!(err.to_string().contains("key.rsa-mod-length"));
        assert_eq!(hsm.object_count(), 0);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_second_key_with_same_label_collides() {
        let dir = TempDir::new().unwrap();
        let hsm = SoftHsm::with_pin("1234");
        run(&key_config(&dir, "issuer"), &hsm).unwrap();

        let other = TempDir::new().unwrap();
        let err = run(&key_config(&other, "issuer"), &hsm).unwrap_err();
        assert!(matches!(
            err,
            CeremonyError::Ceremony { ref source, .. }
                if matches!(**source, CeremonyError::LabelCollision { .. })
        ));
        assert_eq!(hsm.object_count(), 2);
    }
}
