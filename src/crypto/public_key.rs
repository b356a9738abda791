//! Public keys recovered from the HSM or from certificates, and software
//! signature verification.

use crate::crypto::algorithm::{Curve, HashAlgorithm, KeyFamily, SignatureAlgorithm};
use crate::error::{CeremonyError, Result};
use crate::oid;
use const_oid::ObjectIdentifier;
use der::asn1::{Any, BitString, UintRef};
use der::{Decode, Encode, Tag};
use rsa::pkcs1::RsaPublicKey as RsaPublicKeyDer;
use rsa::{BigUint, RsaPublicKey};
use signature::hazmat::PrehashVerifier;
use spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};

const MAX_RSA_MODULUS_BITS: usize = 8192;

/// A public key in algorithm-specific form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKey {
    /// Big-endian modulus and exponent without leading zeros.
    Rsa { modulus: Vec<u8>, exponent: Vec<u8> },
    /// Uncompressed SEC1 point.
    Ecdsa { curve: Curve, point: Vec<u8> },
}

fn strip_leading_zeros(bytes: &[u8]) -> Vec<u8> {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes[start..].to_vec()
}

impl PublicKey {
    pub fn rsa(modulus: &[u8], exponent: &[u8]) -> Self {
        PublicKey::Rsa {
            modulus: strip_leading_zeros(modulus),
            exponent: strip_leading_zeros(exponent),
        }
    }

    pub fn family(&self) -> KeyFamily {
        match self {
            PublicKey::Rsa { .. } => KeyFamily::Rsa,
            PublicKey::Ecdsa { .. } => KeyFamily::Ecdsa,
        }
    }

    pub fn family_name(&self) -> &'static str {
        match self.family() {
            KeyFamily::Rsa => "RSA",
            KeyFamily::Ecdsa => "ECDSA",
        }
    }

    /// Bit length of an RSA modulus; `None` for EC keys.
    pub fn modulus_bits(&self) -> Option<usize> {
        match self {
            PublicKey::Rsa { modulus, .. } => Some(match modulus.first() {
                Some(top) => (modulus.len() - 1) * 8 + (8 - top.leading_zeros() as usize),
                None => 0,
            }),
            PublicKey::Ecdsa { .. } => None,
        }
    }

    pub fn to_spki(&self) -> Result<SubjectPublicKeyInfoOwned> {
        match self {
            PublicKey::Rsa { modulus, exponent } => {
                let body = RsaPublicKeyDer {
                    modulus: UintRef::new(modulus)?,
                    public_exponent: UintRef::new(exponent)?,
                }
                .to_der()?;
                Ok(SubjectPublicKeyInfoOwned {
                    algorithm: AlgorithmIdentifierOwned {
                        oid: oid::RSA_ENCRYPTION,
                        parameters: Some(Any::new(Tag::Null, Vec::<u8>::new())?),
                    },
                    subject_public_key: BitString::from_bytes(&body)?,
                })
            }
            PublicKey::Ecdsa { curve, point } => Ok(SubjectPublicKeyInfoOwned {
                algorithm: AlgorithmIdentifierOwned {
                    oid: oid::EC_PUBLIC_KEY,
                    parameters: Some(Any::from_der(&curve.params_der()?)?),
                },
                subject_public_key: BitString::from_bytes(point)?,
            }),
        }
    }

    pub fn to_spki_der(&self) -> Result<Vec<u8>> {
        Ok(self.to_spki()?.to_der()?)
    }

    /// PEM `PUBLIC KEY` encoding of the SPKI.
    pub fn to_pem(&self) -> Result<String> {
        Ok(pem::encode(&pem::Pem::new("PUBLIC KEY", self.to_spki_der()?)))
    }

    pub fn from_spki(spki: &SubjectPublicKeyInfoOwned) -> Result<Self> {
        let bits = spki.subject_public_key.as_bytes().ok_or_else(|| {
            CeremonyError::CryptoError("public key bit string has unused bits".to_string())
        })?;

        if spki.algorithm.oid == oid::RSA_ENCRYPTION {
            let key = RsaPublicKeyDer::from_der(bits)?;
            return Ok(PublicKey::rsa(
                key.modulus.as_bytes(),
                key.public_exponent.as_bytes(),
            ));
        }

        if spki.algorithm.oid == oid::EC_PUBLIC_KEY {
            let params = spki.algorithm.parameters.as_ref().ok_or_else(|| {
                CeremonyError::CryptoError("EC public key without curve parameters".to_string())
            })?;
            let curve_oid = ObjectIdentifier::from_der(&params.to_der()?)?;
            let curve = Curve::from_oid(&curve_oid).ok_or_else(|| {
                CeremonyError::CryptoError(format!("unsupported curve {}", curve_oid))
            })?;
            if bits.len() != 1 + 2 * curve.coordinate_len() || bits[0] != 0x04 {
                return Err(CeremonyError::CryptoError(format!(
                    "EC public key is not an uncompressed {} point",
                    curve
                )));
            }
            return Ok(PublicKey::Ecdsa {
                curve,
                point: bits.to_vec(),
            });
        }

        Err(CeremonyError::CryptoError(format!(
            "unsupported public key algorithm {}",
            spki.algorithm.oid
        )))
    }

    pub fn from_spki_der(der: &[u8]) -> Result<Self> {
        Self::from_spki(&SubjectPublicKeyInfoOwned::from_der(der)?)
    }

    /// Parse a PEM `PUBLIC KEY` block.
    pub fn from_pem(pem_str: &str) -> Result<Self> {
        let pem = pem::parse(pem_str)
            .map_err(|e| CeremonyError::PemError(format!("failed to parse PEM: {}", e)))?;
        if pem.tag() != "PUBLIC KEY" {
            return Err(CeremonyError::PemError(format!(
                "expected PUBLIC KEY, got {}",
                pem.tag()
            )));
        }
        Self::from_spki_der(pem.contents())
    }

    /// Verify `signature` over `message` under `algorithm`.
    ///
    /// ECDSA signatures are DER `Ecdsa-Sig-Value`; RSA signatures are PKCS#1 v1.5.
    pub fn verify(
        &self,
        algorithm: SignatureAlgorithm,
        message: &[u8],
        signature: &[u8],
    ) -> Result<()> {
        algorithm.check_key(self)?;
        let hash = algorithm.hash();
        self.verify_digest(hash, &hash.digest(message), signature)
    }

    /// Verify a signature over an already computed digest.
    pub fn verify_digest(
        &self,
        hash: HashAlgorithm,
        digest: &[u8],
        signature: &[u8],
    ) -> Result<()> {
        let failed = |e: &dyn std::fmt::Display| {
            CeremonyError::SignatureVerification(format!("{} signature: {}", self.family_name(), e))
        };

        match self {
            PublicKey::Rsa { modulus, exponent } => {
                let key = RsaPublicKey::new_with_max_size(
                    BigUint::from_bytes_be(modulus),
                    BigUint::from_bytes_be(exponent),
                    MAX_RSA_MODULUS_BITS,
                )
                .map_err(|e| failed(&e))?;
                key.verify(hash.pkcs1v15(), digest, signature)
                    .map_err(|e| failed(&e))
            }
            PublicKey::Ecdsa { curve, point } => {
                macro_rules! verify_prehash {
                    ($curve:ident) => {{
                        let key = $curve::ecdsa::VerifyingKey::from_sec1_bytes(point)
                            .map_err(|e| failed(&e))?;
                        let sig = $curve::ecdsa::Signature::from_der(signature)
                            .map_err(|e| failed(&e))?;
                        key.verify_prehash(digest, &sig).map_err(|e| failed(&e))
                    }};
                }
                match curve {
                    Curve::P224 => verify_prehash!(p224),
                    Curve::P256 => verify_prehash!(p256),
                    Curve::P384 => verify_prehash!(p384),
                    Curve::P521 => verify_prehash!(p521),
                }
            }
        }
    }
}

/// Convert a raw `r || s` ECDSA signature, as returned by CKM_ECDSA, to DER.
pub fn ecdsa_raw_to_der(curve: Curve, raw: &[u8]) -> Result<Vec<u8>> {
    let invalid = |e: signature::Error| {
        CeremonyError::CryptoError(format!("invalid {} ECDSA signature: {}", curve, e))
    };
    macro_rules! to_der {
        ($curve:ident) => {
            $curve::ecdsa::Signature::from_slice(raw)
                .map_err(invalid)?
                .to_der()
                .as_bytes()
                .to_vec()
        };
    }
    Ok(match curve {
        Curve::P224 => to_der!(p224),
        Curve::P256 => to_der!(p256),
        Curve::P384 => to_der!(p384),
        Curve::P521 => to_der!(p521),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::hazmat::PrehashSigner;
    use rand::rngs::OsRng;

    #[test]
    fn test_rsa_modulus_bits() {
        let mut modulus = vec![0x00, 0x80];
        modulus.extend_from_slice(&[0x11; 255]);
        let key = PublicKey::rsa(&modulus, &[0x01, 0x00, 0x01]);
        assert_eq!(key.modulus_bits(), Some(2048));
        assert_eq!(
            PublicKey::rsa(&[0x01], &[3]).modulus_bits(),
            Some(1)
        );
    }

    #[test]
    fn test_spki_roundtrip_rsa_and_ec() {
        let rsa = PublicKey::rsa(&[0xC3; 256], &[0x01, 0x00, 0x01]);
        assert_eq!(PublicKey::from_spki_der(&rsa.to_spki_der().unwrap()).unwrap(), rsa);

        let signing = p256::ecdsa::SigningKey::random(&mut OsRng);
        let point = signing
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();
        let ec = PublicKey::Ecdsa {
            curve: Curve::P256,
            point,
        };
        let pem = ec.to_pem().unwrap();
        assert!(pem.contains("BEGIN PUBLIC KEY"));
        assert_eq!(PublicKey::from_pem(&pem).unwrap(), ec);
    }

    #[test]
    fn test_verify_ecdsa_from_raw_signature() {
        let signing = p256::ecdsa::SigningKey::random(&mut OsRng);
        let key = PublicKey::Ecdsa {
            curve: Curve::P256,
            point: signing
                .verifying_key()
                .to_encoded_point(false)
                .as_bytes()
                .to_vec(),
        };
        let message = b"ceremony";
        let digest = HashAlgorithm::Sha256.digest(message);
        let sig: p256::ecdsa::Signature = signing.sign_prehash(&digest).unwrap();
        let der = ecdsa_raw_to_der(Curve::P256, &sig.to_bytes()).unwrap();
        assert_eq!(der, sig.to_der().as_bytes());

        assert!(key
            .verify(SignatureAlgorithm::EcdsaWithSha256, message, &der)
            .is_ok());
        assert!(matches!(
            key.verify(SignatureAlgorithm::EcdsaWithSha256, b"other", &der),
            Err(CeremonyError::SignatureVerification(_))
        ));
        assert!(key
            .verify(SignatureAlgorithm::Sha256WithRsa, message, &der)
            .is_err());
    }

    #[test]
    fn test_ecdsa_raw_to_der_rejects_wrong_length() {
        assert!(ecdsa_raw_to_der(Curve::P256, &[1, 2, 3]).is_err());
        assert!(ecdsa_raw_to_der(Curve::P256, &[]).is_err());
        assert!(ecdsa_raw_to_der(Curve::P384, &[0x11; 64]).is_err());
    }

    #[test]
    fn test_rsa_spki_matches_rsa_crate() {
        use rsa::pkcs8::EncodePublicKey;
        use rsa::traits::PublicKeyParts;

        let private = rsa::RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let public = private.to_public_key();
        let key = PublicKey::rsa(&public.n().to_bytes_be(), &public.e().to_bytes_be());
        assert_eq!(
            key.to_spki_der().unwrap(),
            public.to_public_key_der().unwrap().as_bytes()
        );
    }
}
