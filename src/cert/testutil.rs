//! Fixtures shared by the certificate builder tests.

use crate::cert::profile::{CertProfile, CertType};
use crate::cert::template::make_template;
use crate::crypto::{Curve, KeyGenSpec};
use crate::hsm::soft::SoftHsm;
use crate::hsm::{HsmRandom, HsmSigner};
use crate::issuance::lint::CeremonyLinter;
use crate::issuance::{issue, Issuer};
use crate::keygen::{generate_key, GeneratedKey};
use x509_cert::Certificate;

pub fn ca_profile(not_before: &str, not_after: &str) -> CertProfile {
    CertProfile {
        signature_algorithm: "ECDSAWithSHA256".to_string(),
        common_name: "Test Root".to_string(),
        organization: "Org".to_string(),
        country: "US".to_string(),
        not_before: not_before.to_string(),
        not_after: not_after.to_string(),
        key_usages: Some(vec!["Cert Sign".to_string(), "CRL Sign".to_string()]),
        ..Default::default()
    }
}

/// A P-256 key labelled `label` on `hsm` and a self-signed root for it.
pub fn root(hsm: &SoftHsm, label: &str, not_before: &str, not_after: &str) -> (GeneratedKey, Certificate) {
    let key = generate_key(hsm, &KeyGenSpec::Ecdsa { curve: Curve::P256 }, label).unwrap();
    let template = make_template(
        &mut HsmRandom::new(hsm),
        &ca_profile(not_before, not_after),
        &key.spki_der,
        CertType::Root,
    )
    .unwrap();
    let tbs = template.to_tbs(&template.subject).unwrap();
    let signer = HsmSigner::new(hsm, key.private_handle, key.public_key.clone());
    let cert = issue(tbs, Issuer::SelfSigned, &key.public_key, &signer, &CeremonyLinter, &[]).unwrap();
    (key, cert)
}

/// A certificate of `cert_type` for a fresh key, issued by `issuer`.
pub fn issued(
    hsm: &SoftHsm,
    issuer_key: &GeneratedKey,
    issuer: &Certificate,
    profile: &CertProfile,
    cert_type: CertType,
    label: &str,
) -> (GeneratedKey, Certificate) {
    let key = generate_key(hsm, &KeyGenSpec::Ecdsa { curve: Curve::P256 }, label).unwrap();
    let mut template =
        make_template(&mut HsmRandom::new(hsm), profile, &key.spki_der, cert_type).unwrap();
    template.chain_to(issuer).unwrap();
    let tbs = template.to_tbs(&issuer.tbs_certificate.subject).unwrap();
    let signer = HsmSigner::new(hsm, issuer_key.private_handle, issuer_key.public_key.clone());
    let cert = issue(
        tbs,
        Issuer::Certificate(issuer),
        &key.public_key,
        &signer,
        &CeremonyLinter,
        &[],
    )
    .unwrap();
    (key, cert)
}
