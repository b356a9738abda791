//! Certificate signing requests for cross-signing.

use crate::cert::profile::CertProfile;
use crate::crypto::SignatureAlgorithm;
use crate::error::{CeremonyError, Result};
use crate::hsm::{FailingRandom, Signer};
use der::asn1::BitString;
use der::{Decode, Encode};
use tracing::info;
use x509_cert::request::{CertReq, CertReqInfo, Version};

/// PEM label of an encoded CSR.
pub const CSR_PEM_TAG: &str = "CERTIFICATE REQUEST";

/// Build and sign a CSR for the signer's key, returning it PEM encoded.
///
/// Only the subject from `profile` is used; the request carries no
/// attributes or requested extensions.
pub fn generate_csr(profile: &CertProfile, signer: &dyn Signer) -> Result<String> {
    let public_key = signer.public_key();
    let algorithm = SignatureAlgorithm::default_for(public_key);

    let info = CertReqInfo {
        version: Version::V1,
        subject: profile.subject()?,
        public_key: public_key.to_spki()?,
        attributes: Default::default(),
    };
    let info_der = info.to_der()?;
    let signature = signer.sign(&mut FailingRandom, algorithm, &info_der)?;

    let req = CertReq {
        info,
        algorithm: algorithm.algorithm_identifier()?,
        signature: BitString::from_bytes(&signature)?,
    };
    let der = req.to_der()?;

    verify_csr(&der)?;
    info!(algorithm = %algorithm, "signed certificate request");

    Ok(pem::encode(&pem::Pem::new(CSR_PEM_TAG, der)))
}

/// Check that a DER CSR is signed by the key it requests a certificate for.
pub fn verify_csr(der: &[u8]) -> Result<()> {
    let req = CertReq::from_der(der)?;
    let algorithm = SignatureAlgorithm::from_algorithm_identifier(&req.algorithm)?;
    let key = crate::crypto::PublicKey::from_spki(&req.info.public_key)?;
    let signature = req.signature.as_bytes().ok_or_else(|| {
        CeremonyError::SignatureVerification("CSR signature has unused bits".to_string())
    })?;
    key.verify(algorithm, &req.info.to_der()?, signature)
        .map_err(|e| CeremonyError::SignatureVerification(format!("CSR: {}", e)))
}
