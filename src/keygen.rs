//! Key-pair generation on the HSM with attribute read-back and a
//! sign/verify self-test.
//!
//! A key is returned only once the device has proven it can sign with it:
//!
//! 1. the label must be unused on the token
//! 2. a 4-byte CKA_ID is drawn from the device RNG
//! 3. the pair is generated with token-resident, non-extractable templates
//! 4. the public half is read back and compared with the request
//! 5. a device signature over device randomness is verified in software

use crate::crypto::{Curve, KeyGenSpec, PublicKey, SignatureAlgorithm, RSA_PUBLIC_EXPONENT};
use crate::error::{CeremonyError, Result};
use crate::hsm::{
    self, Attribute, FailingRandom, HsmSession, HsmSigner, KeyType, Mechanism, ObjectHandle,
    Signer,
};
use tracing::info;

/// Length of the CKA_ID shared by both halves of a generated pair.
pub const KEY_ID_LEN: usize = 4;

/// A freshly generated key pair that passed its self-test.
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    pub public_key: PublicKey,
    pub spki_der: Vec<u8>,
    pub id: Vec<u8>,
    pub private_handle: ObjectHandle,
}

fn templates(spec: &KeyGenSpec, label: &str, id: &[u8]) -> Result<(Vec<Attribute>, Vec<Attribute>)> {
    let mut public = vec![
        Attribute::Token(true),
        Attribute::Verify(true),
        Attribute::Label(label.as_bytes().to_vec()),
        Attribute::Id(id.to_vec()),
    ];
    match spec {
        KeyGenSpec::Rsa { modulus_bits } => {
            public.push(Attribute::KeyType(KeyType::Rsa));
            public.push(Attribute::ModulusBits(*modulus_bits as u64));
            public.push(Attribute::PublicExponent(
                RSA_PUBLIC_EXPONENT.to_be_bytes()[1..].to_vec(),
            ));
        }
        KeyGenSpec::Ecdsa { curve } => {
            public.push(Attribute::KeyType(KeyType::Ec));
            public.push(Attribute::EcParams(curve.params_der()?));
        }
    }

    let private = vec![
        Attribute::Token(true),
        Attribute::Private(true),
        Attribute::Sensitive(true),
        Attribute::Extractable(false),
        Attribute::Sign(true),
        Attribute::Label(label.as_bytes().to_vec()),
        Attribute::Id(id.to_vec()),
    ];
    Ok((public, private))
}

fn check_rsa(public_key: &PublicKey, modulus_bits: usize) -> Result<()> {
    if let PublicKey::Rsa { exponent, .. } = public_key {
        if exponent.as_slice() != &RSA_PUBLIC_EXPONENT.to_be_bytes()[1..] {
            return Err(CeremonyError::AttributeMismatch(format!(
                "returned CKA_PUBLIC_EXPONENT ({}) doesn't match expected value ({})",
                hex::encode(exponent),
                RSA_PUBLIC_EXPONENT
            )));
        }
    }
    match public_key.modulus_bits() {
        Some(bits) if bits == modulus_bits => Ok(()),
        other => Err(CeremonyError::AttributeMismatch(format!(
            "returned CKA_MODULUS isn't of the expected bit length ({:?}, expected {})",
            other, modulus_bits
        ))),
    }
}

/// Compare CKA_EC_PARAMS with the request before the point is decoded
/// against it.
fn check_ec_params(params: &[u8], curve: Curve) -> Result<()> {
    if params == curve.params_der()?.as_slice() {
        return Ok(());
    }
    let returned = Curve::from_params_der(params)
        .map(|c| c.to_string())
        .unwrap_or_else(|| hex::encode(params));
    Err(CeremonyError::AttributeMismatch(format!(
        "returned CKA_EC_PARAMS ({}) don't match expected curve ({})",
        returned, curve
    )))
}

/// Sign device randomness with the new key and verify it in software.
fn self_test<S: HsmSession + ?Sized>(
    session: &S,
    private_handle: ObjectHandle,
    public_key: &PublicKey,
) -> Result<()> {
    let challenge = session.generate_random(4)?;
    let algorithm = SignatureAlgorithm::default_for(public_key);
    let signer = HsmSigner::new(session, private_handle, public_key.clone());

    let signature = signer
        .sign(&mut FailingRandom, algorithm, &challenge)
        .map_err(|e| CeremonyError::Verification(format!("failed to sign test data: {}", e)))?;
    public_key
        .verify(algorithm, &challenge, &signature)
        .map_err(|e| CeremonyError::Verification(e.to_string()))
}

/// Generate a key pair labelled `label` on the HSM and prove it works.
///
/// # Arguments
///
/// * `session` - Open session on the target slot
/// * `spec` - Key algorithm and size
/// * `label` - CKA_LABEL for both halves; must not already exist
///
/// # Example
///
/// ```
/// use ceremony::crypto::{Curve, KeyGenSpec};
/// use ceremony::hsm::soft::SoftHsm;
/// use ceremony::keygen::generate_key;
///
/// # fn example() -> ceremony::error::Result<()> {
/// let hsm = SoftHsm::new();
/// let key = generate_key(&hsm, &KeyGenSpec::Ecdsa { curve: Curve::P256 }, "root")?;
/// assert_eq!(key.id.len(), 4);
/// # Ok(())
/// # }
/// # example().unwrap();
/// ```
pub fn generate_key<S: HsmSession + ?Sized>(
    session: &S,
    spec: &KeyGenSpec,
    label: &str,
) -> Result<GeneratedKey> {
    let existing = session.find_objects(&[Attribute::Label(label.as_bytes().to_vec())])?;
    if !existing.is_empty() {
        return Err(CeremonyError::LabelCollision {
            label: label.to_string(),
        });
    }

    let id = session.generate_random(KEY_ID_LEN)?;
    let (public_template, private_template) = templates(spec, label, &id)?;
    let mechanism = match spec {
        KeyGenSpec::Rsa { .. } => Mechanism::RsaKeyPairGen,
        KeyGenSpec::Ecdsa { .. } => Mechanism::EcKeyPairGen,
    };

    info!(%spec, label, "generating key pair");
    let (public_handle, private_handle) =
        session.generate_key_pair(mechanism, &public_template, &private_template)?;
    info!(key_id = %hex::encode(&id), "key pair generated");

    let public_key = match spec {
        KeyGenSpec::Rsa { modulus_bits } => {
            let key = hsm::rsa_public_key(session, public_handle)?;
            check_rsa(&key, *modulus_bits)?;
            key
        }
        KeyGenSpec::Ecdsa { curve } => {
            check_ec_params(&hsm::ec_params(session, public_handle)?, *curve)?;
            hsm::ec_public_key(session, public_handle)?
        }
    };
    info!("extracted public key, attributes match request");

    self_test(session, private_handle, &public_key)?;
    info!("key self-test passed");

    Ok(GeneratedKey {
        spki_der: public_key.to_spki_der()?,
        public_key,
        id,
        private_handle,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hsm::soft::{Fault, SoftHsm};

    #[test]
    fn test_generate_ecdsa_keys_self_verify() {
        for curve in [Curve::P224, Curve::P256, Curve::P384] {
            let hsm = SoftHsm::new();
            let key = generate_key(&hsm, &KeyGenSpec::Ecdsa { curve }, "ec key").unwrap();
            assert!(matches!(key.public_key, PublicKey::Ecdsa { curve: c, .. } if c == curve));
            assert_eq!(PublicKey::from_spki_der(&key.spki_der).unwrap(), key.public_key);
        }
    }

    #[test]
    fn test_generate_rsa_key() {
        let hsm = SoftHsm::new();
        let key = generate_key(&hsm, &KeyGenSpec::Rsa { modulus_bits: 2048 }, "rsa key").unwrap();
        assert_eq!(key.public_key.modulus_bits(), Some(2048));
        assert_eq!(key.id.len(), KEY_ID_LEN);
    }

    #[test]
    fn test_label_collision() {
        let hsm = SoftHsm::new();
        let spec = KeyGenSpec::Ecdsa { curve: Curve::P256 };
        generate_key(&hsm, &spec, "taken").unwrap();
        let objects = hsm.object_count();

        let result = generate_key(&hsm, &spec, "taken");
        assert!(matches!(result, Err(CeremonyError::LabelCollision { .. })));
        assert_eq!(hsm.object_count(), objects);
    }

    #[test]
    fn test_private_template_is_locked_down() {
        let (_, private) = templates(&KeyGenSpec::Ecdsa { curve: Curve::P256 }, "x", &[1, 2, 3, 4])
            .unwrap();
        assert!(private.contains(&Attribute::Sensitive(true)));
        assert!(private.contains(&Attribute::Extractable(false)));
        assert!(private.contains(&Attribute::Sign(true)));
        assert!(private.contains(&Attribute::Id(vec![1, 2, 3, 4])));
    }

    #[test]
    fn test_wrong_curve_is_attribute_mismatch() {
        for curve in [Curve::P256, Curve::P384] {
            let hsm = SoftHsm::new();
            hsm.inject_fault(Fault::WrongCurve);
            let result = generate_key(&hsm, &KeyGenSpec::Ecdsa { curve }, "k");
            match result {
                Err(CeremonyError::AttributeMismatch(message)) => {
                    assert!(message.contains("CKA_EC_PARAMS"), "{}", message);
                    assert!(message.contains(&curve.to_string()), "{}", message);
                }
                other => panic!("expected attribute mismatch, got {:?}", other.map(|k| k.id)),
            }
        }
    }

    #[test]
    fn test_raw_ec_point_accepted() {
        let hsm = SoftHsm::new();
        hsm.inject_fault(Fault::RawEcPoint);
        let key = generate_key(&hsm, &KeyGenSpec::Ecdsa { curve: Curve::P384 }, "k").unwrap();
        assert!(matches!(key.public_key, PublicKey::Ecdsa { curve: Curve::P384, .. }));
    }

    #[test]
    fn test_wrong_exponent_is_attribute_mismatch() {
        let hsm = SoftHsm::new();
        hsm.inject_fault(Fault::WrongPublicExponent);
        let result = generate_key(&hsm, &KeyGenSpec::Rsa { modulus_bits: 2048 }, "k");
        assert!(matches!(result, Err(CeremonyError::AttributeMismatch(_))));
    }

    #[test]
    fn test_corrupt_signature_fails_self_test() {
        let hsm = SoftHsm::new();
        hsm.inject_fault(Fault::CorruptSignatures);
        let result = generate_key(&hsm, &KeyGenSpec::Ecdsa { curve: Curve::P384 }, "k");
        assert!(matches!(result, Err(CeremonyError::Verification(_))));
    }
}
