//! Ceremony configuration documents.
//!
//! A configuration is one YAML document whose `ceremony-type` selects the
//! variant of [`CeremonyConfig`]. JSON documents parse too. Unknown fields are rejected while parsing;
//! everything else is checked by [`CeremonyConfig::validate`] before any HSM
//! session is opened.

use crate::cert::crl::is_valid_reason;
use crate::cert::ocsp::Status;
use crate::cert::profile::{CertProfile, CertType};
use crate::crypto::{Curve, KeyGenSpec, SignatureAlgorithm};
use crate::error::{CeremonyError, Result};
use crate::issuance::lint::is_known_lint;
use serde::{Deserialize, Deserializer};
use std::fs;
use std::path::{Path, PathBuf};

pub use crate::cert::validity::parse_date;

fn invalid(message: impl Into<String>) -> CeremonyError {
    CeremonyError::ConfigValidation(message.into())
}

/// Fail if an output path is unset or already exists.
pub fn check_output_file(path: &Path, field: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(invalid(format!("outputs.{} is required", field)));
    }
    if path.exists() {
        return Err(invalid(format!(
            "outputs.{} is {:?}, which already exists",
            field, path
        )));
    }
    Ok(())
}

fn check_input_file(path: &Path, field: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(invalid(format!("inputs.{} is required", field)));
    }
    Ok(())
}

fn check_skip_lints(skip_lints: &[String]) -> Result<()> {
    match skip_lints.iter().find(|name| !is_known_lint(name)) {
        Some(name) => Err(invalid(format!("skip-lints contains unknown lint {:?}", name))),
        None => Ok(()),
    }
}

/// Parse the dates and algorithm a certificate profile names, so a typo is
/// caught before the HSM generates or signs anything.
fn check_profile_values(profile: &CertProfile) -> Result<()> {
    parse_date(&profile.not_before, "certificate-profile.not-before")?;
    parse_date(&profile.not_after, "certificate-profile.not-after")?;
    profile.signature_algorithm.parse::<SignatureAlgorithm>()?;
    Ok(())
}

/// Accept a PIN written as a bare number (`pin: 1234`) as well as a string.
fn pin_text<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Pin {
        Text(String),
        Number(u64),
    }
    Ok(match Pin::deserialize(deserializer)? {
        Pin::Text(text) => text,
        Pin::Number(number) => number.to_string(),
    })
}

/// HSM slot and label a new key is generated into.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct Pkcs11KeyGenConfig {
    pub module: String,
    /// Empty when the PIN is entered on a PED
    #[serde(deserialize_with = "pin_text")]
    pub pin: String,
    pub store_key_in_slot: u64,
    pub store_key_with_label: String,
}

impl Pkcs11KeyGenConfig {
    pub fn validate(&self) -> Result<()> {
        if self.module.is_empty() {
            return Err(invalid("pkcs11.module is required"));
        }
        if self.store_key_with_label.is_empty() {
            return Err(invalid("pkcs11.store-key-with-label is required"));
        }
        Ok(())
    }
}

/// HSM slot and label of an existing signing key.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct Pkcs11SigningConfig {
    pub module: String,
    #[serde(deserialize_with = "pin_text")]
    pub pin: String,
    pub signing_key_slot: u64,
    pub signing_key_label: String,
}

impl Pkcs11SigningConfig {
    pub fn validate(&self) -> Result<()> {
        if self.module.is_empty() {
            return Err(invalid("pkcs11.module is required"));
        }
        if self.signing_key_label.is_empty() {
            return Err(invalid("pkcs11.signing-key-label is required"));
        }
        Ok(())
    }
}

/// The `key` section of root and key ceremonies.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct KeyGenConfig {
    #[serde(rename = "type")]
    pub key_type: String,
    pub rsa_mod_length: usize,
    pub ecdsa_curve: String,
}

impl KeyGenConfig {
    pub fn validate(&self) -> Result<()> {
        self.spec().map(|_| ())
    }

    /// The validated key specification.
    pub fn spec(&self) -> Result<KeyGenSpec> {
        match self.key_type.as_str() {
            "" => Err(invalid("key.type is required")),
            "rsa" => {
                if self.rsa_mod_length != 2048 && self.rsa_mod_length != 4096 {
                    return Err(invalid("key.rsa-mod-length can only be 2048 or 4096"));
                }
                if !self.ecdsa_curve.is_empty() {
                    return Err(invalid("if key.type = 'rsa' then key.ecdsa-curve is not used"));
                }
                Ok(KeyGenSpec::Rsa {
                    modulus_bits: self.rsa_mod_length,
                })
            }
            "ecdsa" => {
                let curve: Curve = self.ecdsa_curve.parse().map_err(|_| {
                    invalid("key.ecdsa-curve can only be 'P-224', 'P-256', 'P-384', or 'P-521'")
                })?;
                if self.rsa_mod_length != 0 {
                    return Err(invalid(
                        "if key.type = 'ecdsa' then key.rsa-mod-length is not used",
                    ));
                }
                Ok(KeyGenSpec::Ecdsa { curve })
            }
            _ => Err(invalid("key.type can only be 'rsa' or 'ecdsa'")),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct RootOutputs {
    pub public_key_path: PathBuf,
    pub certificate_path: PathBuf,
}

/// Generate a key and self-sign a root certificate for it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct RootConfig {
    pub pkcs11: Pkcs11KeyGenConfig,
    pub key: KeyGenConfig,
    pub outputs: RootOutputs,
    pub certificate_profile: CertProfile,
    pub skip_lints: Vec<String>,
}

impl RootConfig {
    pub fn validate(&self) -> Result<()> {
        self.pkcs11.validate()?;
        self.key.validate()?;
        check_output_file(&self.outputs.public_key_path, "public-key-path")?;
        check_output_file(&self.outputs.certificate_path, "certificate-path")?;
        self.certificate_profile.validate(CertType::Root)?;
        check_profile_values(&self.certificate_profile)?;
        check_skip_lints(&self.skip_lints)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct IssuedInputs {
    pub public_key_path: PathBuf,
    pub issuer_certificate_path: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct CertificateOutputs {
    pub certificate_path: PathBuf,
}

/// Issue a certificate for an existing public key with an existing issuer.
///
/// Shared by the intermediate, cross-certificate, ocsp-signer and
/// crl-signer ceremonies.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct IntermediateConfig {
    pub pkcs11: Pkcs11SigningConfig,
    pub inputs: IssuedInputs,
    pub outputs: CertificateOutputs,
    pub certificate_profile: CertProfile,
    pub skip_lints: Vec<String>,
}

impl IntermediateConfig {
    pub fn validate(&self, cert_type: CertType) -> Result<()> {
        self.pkcs11.validate()?;
        check_input_file(&self.inputs.public_key_path, "public-key-path")?;
        check_input_file(&self.inputs.issuer_certificate_path, "issuer-certificate-path")?;
        check_output_file(&self.outputs.certificate_path, "certificate-path")?;
        self.certificate_profile.validate(cert_type)?;
        check_profile_values(&self.certificate_profile)?;
        check_skip_lints(&self.skip_lints)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct PublicKeyInput {
    pub public_key_path: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct CsrOutputs {
    pub csr_path: PathBuf,
}

/// Produce a CSR for an existing HSM key, for cross-signing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct CsrConfig {
    pub pkcs11: Pkcs11SigningConfig,
    pub inputs: PublicKeyInput,
    pub outputs: CsrOutputs,
    pub certificate_profile: CertProfile,
}

impl CsrConfig {
    pub fn validate(&self) -> Result<()> {
        self.pkcs11.validate()?;
        check_input_file(&self.inputs.public_key_path, "public-key-path")?;
        check_output_file(&self.outputs.csr_path, "csr-path")?;
        self.certificate_profile.validate(CertType::Request)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct KeyOutputs {
    pub public_key_path: PathBuf,
    /// Optional HSM-access document for the new key
    pub pkcs11_config_path: PathBuf,
}

/// Generate a key and write out its public half.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct KeyConfig {
    pub pkcs11: Pkcs11KeyGenConfig,
    pub key: KeyGenConfig,
    pub outputs: KeyOutputs,
}

impl KeyConfig {
    pub fn validate(&self) -> Result<()> {
        self.pkcs11.validate()?;
        self.key.validate()?;
        check_output_file(&self.outputs.public_key_path, "public-key-path")?;
        if !self.outputs.pkcs11_config_path.as_os_str().is_empty() {
            check_output_file(&self.outputs.pkcs11_config_path, "pkcs11-config-path")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct OcspInputs {
    pub certificate_path: PathBuf,
    pub issuer_certificate_path: PathBuf,
    /// Optional; when set the response is signed by this certificate's key
    pub delegated_issuer_certificate_path: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct OcspOutputs {
    pub response_path: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct OcspProfile {
    pub this_update: String,
    pub next_update: String,
    pub status: String,
}

impl OcspProfile {
    pub fn status(&self) -> Result<Status> {
        match self.status.as_str() {
            "good" => Ok(Status::Good),
            "revoked" => Ok(Status::Revoked),
            _ => Err(invalid(
                "ocsp-profile.status must be either \"good\" or \"revoked\"",
            )),
        }
    }
}

/// Sign an OCSP response for one certificate.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct OcspRespConfig {
    pub pkcs11: Pkcs11SigningConfig,
    pub inputs: OcspInputs,
    pub outputs: OcspOutputs,
    pub ocsp_profile: OcspProfile,
}

impl OcspRespConfig {
    pub fn validate(&self) -> Result<()> {
        self.pkcs11.validate()?;
        check_input_file(&self.inputs.certificate_path, "certificate-path")?;
        check_input_file(&self.inputs.issuer_certificate_path, "issuer-certificate-path")?;
        check_output_file(&self.outputs.response_path, "response-path")?;

        if self.ocsp_profile.this_update.is_empty() {
            return Err(invalid("ocsp-profile.this-update is required"));
        }
        if self.ocsp_profile.next_update.is_empty() {
            return Err(invalid("ocsp-profile.next-update is required"));
        }
        self.ocsp_profile.status()?;
        parse_date(&self.ocsp_profile.this_update, "ocsp-profile.this-update")?;
        parse_date(&self.ocsp_profile.next_update, "ocsp-profile.next-update")?;
        Ok(())
    }

    pub fn delegated_issuer_path(&self) -> Option<&Path> {
        let path = self.inputs.delegated_issuer_certificate_path.as_path();
        (!path.as_os_str().is_empty()).then_some(path)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct IssuerInput {
    pub issuer_certificate_path: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct CrlOutputs {
    pub crl_path: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct RevokedCertificateConfig {
    pub certificate_path: PathBuf,
    pub revocation_date: String,
    pub revocation_reason: u8,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct CrlProfile {
    pub this_update: String,
    pub next_update: String,
    pub number: u64,
    pub revoked_certificates: Vec<RevokedCertificateConfig>,
}

/// Sign a CRL.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct CrlConfig {
    pub pkcs11: Pkcs11SigningConfig,
    pub inputs: IssuerInput,
    pub outputs: CrlOutputs,
    pub crl_profile: CrlProfile,
}

impl CrlConfig {
    pub fn validate(&self) -> Result<()> {
        self.pkcs11.validate()?;
        check_input_file(&self.inputs.issuer_certificate_path, "issuer-certificate-path")?;
        check_output_file(&self.outputs.crl_path, "crl-path")?;

        let profile = &self.crl_profile;
        if profile.this_update.is_empty() {
            return Err(invalid("crl-profile.this-update is required"));
        }
        if profile.next_update.is_empty() {
            return Err(invalid("crl-profile.next-update is required"));
        }
        if profile.number == 0 {
            return Err(invalid("crl-profile.number must be non-zero"));
        }
        parse_date(&profile.this_update, "crl-profile.this-update")?;
        parse_date(&profile.next_update, "crl-profile.next-update")?;

        for revoked in &profile.revoked_certificates {
            if revoked.certificate_path.as_os_str().is_empty() {
                return Err(invalid(
                    "crl-profile.revoked-certificates.certificate-path is required",
                ));
            }
            if revoked.revocation_date.is_empty() {
                return Err(invalid(
                    "crl-profile.revoked-certificates.revocation-date is required",
                ));
            }
            if revoked.revocation_reason == 0 {
                return Err(invalid(
                    "crl-profile.revoked-certificates.revocation-reason is required",
                ));
            }
            if !is_valid_reason(revoked.revocation_reason) {
                return Err(invalid(format!(
                    "crl-profile.revoked-certificates.revocation-reason {} is not a valid reason code",
                    revoked.revocation_reason
                )));
            }
            parse_date(
                &revoked.revocation_date,
                "crl-profile.revoked-certificates.revocation-date",
            )?;
        }
        Ok(())
    }
}

/// A parsed ceremony configuration, one variant per ceremony type.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "ceremony-type", rename_all = "kebab-case")]
pub enum CeremonyConfig {
    Root(RootConfig),
    Intermediate(IntermediateConfig),
    CrossCertificate(IntermediateConfig),
    CrossCsr(CsrConfig),
    OcspSigner(IntermediateConfig),
    CrlSigner(IntermediateConfig),
    Key(KeyConfig),
    OcspResponse(OcspRespConfig),
    Crl(CrlConfig),
}

impl CeremonyConfig {
    /// Parse a YAML configuration document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Read and parse a configuration file.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use ceremony::config::CeremonyConfig;
    ///
    /// # fn example() -> ceremony::error::Result<()> {
    /// let config = CeremonyConfig::load("root-ceremony.yaml")?;
    /// config.validate()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
    }

    /// Run every configuration check for this ceremony type.
    pub fn validate(&self) -> Result<()> {
        match self {
            CeremonyConfig::Root(config) => config.validate(),
            CeremonyConfig::Intermediate(config) => config.validate(CertType::Intermediate),
            CeremonyConfig::CrossCertificate(config) => {
                config.validate(CertType::CrossCertificate)
            }
            CeremonyConfig::CrossCsr(config) => config.validate(),
            CeremonyConfig::OcspSigner(config) => config.validate(CertType::OcspSigner),
            CeremonyConfig::CrlSigner(config) => config.validate(CertType::CrlSigner),
            CeremonyConfig::Key(config) => config.validate(),
            CeremonyConfig::OcspResponse(config) => config.validate(),
            CeremonyConfig::Crl(config) => config.validate(),
        }
    }
}
