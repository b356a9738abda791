//! Signing with keys held on the HSM.

use super::{
    find_object, object_id, Attribute, HsmResult, HsmSession, KeyType, Mechanism, ObjectClass,
    ObjectHandle,
};
use crate::crypto::{ecdsa_raw_to_der, PublicKey, SignatureAlgorithm};
use crate::error::{HsmError, Result};
use der::asn1::OctetString;
use der::Encode;
use rand::RngCore;
use tracing::debug;

/// Produces signatures for a known public key.
pub trait Signer {
    fn public_key(&self) -> &PublicKey;

    /// Sign `message` under `algorithm`.
    ///
    /// Returns a PKCS#1 v1.5 signature for RSA keys and a DER
    /// `Ecdsa-Sig-Value` for ECDSA keys. `rng` is the only randomness the
    /// signer may use.
    fn sign(
        &self,
        rng: &mut dyn RngCore,
        algorithm: SignatureAlgorithm,
        message: &[u8],
    ) -> Result<Vec<u8>>;
}

/// A signer backed by a private key object on the HSM.
///
/// The device supplies its own entropy, so the `rng` handed to
/// [`Signer::sign`] is never read.
pub struct HsmSigner<'a, S: HsmSession + ?Sized> {
    session: &'a S,
    private_key: ObjectHandle,
    public_key: PublicKey,
}

impl<'a, S: HsmSession + ?Sized> HsmSigner<'a, S> {
    /// Wrap a private key handle whose public half is already known.
    pub fn new(session: &'a S, private_key: ObjectHandle, public_key: PublicKey) -> Self {
        Self {
            session,
            private_key,
            public_key,
        }
    }

    /// Resolve the key pair labelled `label` whose public half is `expected`.
    ///
    /// The public object is matched on label and key material, its CKA_ID is
    /// read, and exactly one private object with that CKA_ID must exist.
    /// EC points are searched in the DER-wrapped form first and then raw.
    pub fn open(session: &'a S, label: &str, expected: &PublicKey) -> Result<Self> {
        let mut template = vec![
            Attribute::Class(ObjectClass::PublicKey),
            Attribute::Label(label.as_bytes().to_vec()),
        ];
        let public_handle = match expected {
            PublicKey::Rsa { modulus, exponent } => {
                template.push(Attribute::KeyType(KeyType::Rsa));
                template.push(Attribute::Modulus(modulus.clone()));
                template.push(Attribute::PublicExponent(exponent.clone()));
                find_object(session, &template)?
            }
            PublicKey::Ecdsa { curve, point } => {
                template.push(Attribute::KeyType(KeyType::Ec));
                template.push(Attribute::EcParams(curve.params_der()?));
                let wrapped = OctetString::new(point.clone())?.to_der()?;
                match find_ec_public(session, &template, wrapped) {
                    Err(HsmError::NoObject) => {
                        debug!(label, "no wrapped EC point match, retrying with raw point");
                        find_ec_public(session, &template, point.clone())?
                    }
                    found => found?,
                }
            }
        };
        let id = object_id(session, public_handle)?;
        let private_key = find_object(
            session,
            &[Attribute::Class(ObjectClass::PrivateKey), Attribute::Id(id.clone())],
        )?;
        debug!(label, key_id = %hex::encode(&id), "resolved signing key on HSM");

        Ok(Self::new(session, private_key, expected.clone()))
    }
}

fn find_ec_public<S: HsmSession + ?Sized>(
    session: &S,
    template: &[Attribute],
    point: Vec<u8>,
) -> HsmResult<ObjectHandle> {
    let mut template = template.to_vec();
    template.push(Attribute::EcPoint(point));
    find_object(session, &template)
}

impl<S: HsmSession + ?Sized> Signer for HsmSigner<'_, S> {
    fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    fn sign(
        &self,
        _rng: &mut dyn RngCore,
        algorithm: SignatureAlgorithm,
        message: &[u8],
    ) -> Result<Vec<u8>> {
        algorithm.check_key(&self.public_key)?;
        let hash = algorithm.hash();
        let digest = hash.digest(message);

        match &self.public_key {
            PublicKey::Rsa { .. } => {
                let mut digest_info = hash.digest_info_prefix().into_vec();
                digest_info.extend_from_slice(&digest);
                Ok(self
                    .session
                    .sign(Mechanism::RsaPkcs, self.private_key, &digest_info)?)
            }
            PublicKey::Ecdsa { curve, .. } => {
                let raw = self.session.sign(Mechanism::Ecdsa, self.private_key, &digest)?;
                ecdsa_raw_to_der(*curve, &raw)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Curve, KeyGenSpec};
    use crate::error::CeremonyError;
    use crate::hsm::soft::{Fault, SoftHsm};
    use crate::hsm::FailingRandom;
    use crate::keygen::generate_key;

    #[test]
    fn test_open_and_sign_with_generated_key() {
        let hsm = SoftHsm::new();
        let key = generate_key(&hsm, &KeyGenSpec::Ecdsa { curve: Curve::P256 }, "signer").unwrap();

        let signer = HsmSigner::open(&hsm, "signer", &key.public_key).unwrap();
        let sig = signer
            .sign(&mut FailingRandom, SignatureAlgorithm::EcdsaWithSha256, b"tbs")
            .unwrap();
        key.public_key
            .verify(SignatureAlgorithm::EcdsaWithSha256, b"tbs", &sig)
            .unwrap();
    }

    #[test]
    fn test_open_rejects_wrong_public_key() {
        let hsm = SoftHsm::new();
        generate_key(&hsm, &KeyGenSpec::Ecdsa { curve: Curve::P256 }, "a").unwrap();
        let other = generate_key(&hsm, &KeyGenSpec::Ecdsa { curve: Curve::P256 }, "b").unwrap();

        let result = HsmSigner::open(&hsm, "a", &other.public_key);
        assert!(matches!(result, Err(CeremonyError::Hsm(HsmError::NoObject))));
    }

    #[test]
    fn test_sign_rejects_mismatched_algorithm() {
        let hsm = SoftHsm::new();
        let key = generate_key(&hsm, &KeyGenSpec::Ecdsa { curve: Curve::P384 }, "k").unwrap();
        let signer = HsmSigner::open(&hsm, "k", &key.public_key).unwrap();
        assert!(signer
            .sign(&mut FailingRandom, SignatureAlgorithm::Sha256WithRsa, b"tbs")
            .is_err());
    }

    #[test]
    fn test_open_key_stored_with_raw_ec_point() {
        let hsm = SoftHsm::new();
        hsm.inject_fault(Fault::RawEcPoint);
        let key = generate_key(&hsm, &KeyGenSpec::Ecdsa { curve: Curve::P256 }, "raw").unwrap();

        let signer = HsmSigner::open(&hsm, "raw", &key.public_key).unwrap();
        let sig = signer
            .sign(&mut FailingRandom, SignatureAlgorithm::EcdsaWithSha256, b"tbs")
            .unwrap();
        key.public_key
            .verify(SignatureAlgorithm::EcdsaWithSha256, b"tbs", &sig)
            .unwrap();
    }

    #[test]
    fn test_rsa_sign_and_verify() {
        let hsm = SoftHsm::new();
        let key = generate_key(&hsm, &KeyGenSpec::Rsa { modulus_bits: 2048 }, "rsa").unwrap();
        let signer = HsmSigner::open(&hsm, "rsa", &key.public_key).unwrap();
        for alg in [
            SignatureAlgorithm::Sha256WithRsa,
            SignatureAlgorithm::Sha384WithRsa,
            SignatureAlgorithm::Sha512WithRsa,
        ] {
            let sig = signer.sign(&mut FailingRandom, alg, b"tbs").unwrap();
            key.public_key.verify(alg, b"tbs", &sig).unwrap();
        }
    }
}
