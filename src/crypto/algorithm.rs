//! Key and signature algorithm identifiers.

use crate::crypto::PublicKey;
use crate::error::{CeremonyError, Result};
use crate::oid;
use const_oid::ObjectIdentifier;
use der::asn1::Any;
use der::{Decode, Encode, Tag};
use rsa::Pkcs1v15Sign;
use sha2::{Digest, Sha256, Sha384, Sha512};
use spki::AlgorithmIdentifierOwned;
use std::fmt;
use std::str::FromStr;

/// The only RSA public exponent a ceremony will generate or accept.
pub const RSA_PUBLIC_EXPONENT: u32 = 65537;

/// Named curves supported for ECDSA keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Curve {
    P224,
    P256,
    P384,
    P521,
}

impl Curve {
    pub fn oid(self) -> ObjectIdentifier {
        match self {
            Curve::P224 => oid::SECP224R1,
            Curve::P256 => oid::SECP256R1,
            Curve::P384 => oid::SECP384R1,
            Curve::P521 => oid::SECP521R1,
        }
    }

    pub fn from_oid(oid: &ObjectIdentifier) -> Option<Self> {
        [Curve::P224, Curve::P256, Curve::P384, Curve::P521]
            .into_iter()
            .find(|c| c.oid() == *oid)
    }

    /// DER encoding of the curve OID, as carried in CKA_EC_PARAMS.
    pub fn params_der(self) -> Result<Vec<u8>> {
        Ok(self.oid().to_der()?)
    }

    /// Decode CKA_EC_PARAMS back to a curve. Unknown curves yield `None`.
    pub fn from_params_der(params: &[u8]) -> Option<Self> {
        ObjectIdentifier::from_der(params)
            .ok()
            .and_then(|oid| Self::from_oid(&oid))
    }

    /// Length in bytes of one field element.
    pub fn coordinate_len(self) -> usize {
        match self {
            Curve::P224 => 28,
            Curve::P256 => 32,
            Curve::P384 => 48,
            Curve::P521 => 66,
        }
    }

    /// Digest paired with this curve for self-tests and default signatures.
    pub fn hash(self) -> HashAlgorithm {
        match self {
            Curve::P224 | Curve::P256 => HashAlgorithm::Sha256,
            Curve::P384 => HashAlgorithm::Sha384,
            Curve::P521 => HashAlgorithm::Sha512,
        }
    }
}

impl fmt::Display for Curve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Curve::P224 => "P-224",
            Curve::P256 => "P-256",
            Curve::P384 => "P-384",
            Curve::P521 => "P-521",
        };
        f.write_str(name)
    }
}

impl FromStr for Curve {
    type Err = CeremonyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "P-224" => Ok(Curve::P224),
            "P-256" => Ok(Curve::P256),
            "P-384" => Ok(Curve::P384),
            "P-521" => Ok(Curve::P521),
            other => Err(CeremonyError::ConfigValidation(format!(
                "specified ECDSA curve {:?} is not supported",
                other
            ))),
        }
    }
}

/// What kind of key to generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyGenSpec {
    /// RSA with public exponent 65537
    Rsa { modulus_bits: usize },
    Ecdsa { curve: Curve },
}

impl fmt::Display for KeyGenSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyGenSpec::Rsa { modulus_bits } => write!(f, "RSA-{}", modulus_bits),
            KeyGenSpec::Ecdsa { curve } => write!(f, "ECDSA {}", curve),
        }
    }
}

/// Digests used for signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            HashAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
            HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    /// PKCS#1 v1.5 signature scheme over this digest.
    pub fn pkcs1v15(self) -> Pkcs1v15Sign {
        match self {
            HashAlgorithm::Sha256 => Pkcs1v15Sign::new::<Sha256>(),
            HashAlgorithm::Sha384 => Pkcs1v15Sign::new::<Sha384>(),
            HashAlgorithm::Sha512 => Pkcs1v15Sign::new::<Sha512>(),
        }
    }

    /// DER DigestInfo header that precedes the digest in a PKCS#1 v1.5 signature.
    pub fn digest_info_prefix(self) -> Box<[u8]> {
        self.pkcs1v15().prefix
    }
}

/// Family of a signing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    Rsa,
    Ecdsa,
}

/// Signature algorithms a ceremony profile may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    Sha256WithRsa,
    Sha384WithRsa,
    Sha512WithRsa,
    EcdsaWithSha256,
    EcdsaWithSha384,
    EcdsaWithSha512,
}

const ALL_SIGNATURE_ALGORITHMS: [SignatureAlgorithm; 6] = [
    SignatureAlgorithm::Sha256WithRsa,
    SignatureAlgorithm::Sha384WithRsa,
    SignatureAlgorithm::Sha512WithRsa,
    SignatureAlgorithm::EcdsaWithSha256,
    SignatureAlgorithm::EcdsaWithSha384,
    SignatureAlgorithm::EcdsaWithSha512,
];

impl SignatureAlgorithm {
    /// Profile name, e.g. `SHA256WithRSA`.
    pub fn name(self) -> &'static str {
        match self {
            SignatureAlgorithm::Sha256WithRsa => "SHA256WithRSA",
            SignatureAlgorithm::Sha384WithRsa => "SHA384WithRSA",
            SignatureAlgorithm::Sha512WithRsa => "SHA512WithRSA",
            SignatureAlgorithm::EcdsaWithSha256 => "ECDSAWithSHA256",
            SignatureAlgorithm::EcdsaWithSha384 => "ECDSAWithSHA384",
            SignatureAlgorithm::EcdsaWithSha512 => "ECDSAWithSHA512",
        }
    }

    pub fn oid(self) -> ObjectIdentifier {
        match self {
            SignatureAlgorithm::Sha256WithRsa => oid::SHA256_WITH_RSA,
            SignatureAlgorithm::Sha384WithRsa => oid::SHA384_WITH_RSA,
            SignatureAlgorithm::Sha512WithRsa => oid::SHA512_WITH_RSA,
            SignatureAlgorithm::EcdsaWithSha256 => oid::ECDSA_WITH_SHA256,
            SignatureAlgorithm::EcdsaWithSha384 => oid::ECDSA_WITH_SHA384,
            SignatureAlgorithm::EcdsaWithSha512 => oid::ECDSA_WITH_SHA512,
        }
    }

    pub fn hash(self) -> HashAlgorithm {
        match self {
            SignatureAlgorithm::Sha256WithRsa | SignatureAlgorithm::EcdsaWithSha256 => {
                HashAlgorithm::Sha256
            }
            SignatureAlgorithm::Sha384WithRsa | SignatureAlgorithm::EcdsaWithSha384 => {
                HashAlgorithm::Sha384
            }
            SignatureAlgorithm::Sha512WithRsa | SignatureAlgorithm::EcdsaWithSha512 => {
                HashAlgorithm::Sha512
            }
        }
    }

    pub fn family(self) -> KeyFamily {
        match self {
            SignatureAlgorithm::Sha256WithRsa
            | SignatureAlgorithm::Sha384WithRsa
            | SignatureAlgorithm::Sha512WithRsa => KeyFamily::Rsa,
            _ => KeyFamily::Ecdsa,
        }
    }

    /// AlgorithmIdentifier for certificates, CSRs, CRLs and OCSP responses.
    ///
    /// RSA identifiers carry an explicit NULL parameter; ECDSA ones carry none.
    pub fn algorithm_identifier(self) -> Result<AlgorithmIdentifierOwned> {
        let parameters = match self.family() {
            KeyFamily::Rsa => Some(Any::new(Tag::Null, Vec::<u8>::new())?),
            KeyFamily::Ecdsa => None,
        };
        Ok(AlgorithmIdentifierOwned {
            oid: self.oid(),
            parameters,
        })
    }

    pub fn from_algorithm_identifier(alg: &AlgorithmIdentifierOwned) -> Result<Self> {
        ALL_SIGNATURE_ALGORITHMS
            .into_iter()
            .find(|a| a.oid() == alg.oid)
            .ok_or_else(|| {
                CeremonyError::CertificateError(format!(
                    "unsupported signature algorithm {}",
                    alg.oid
                ))
            })
    }

    /// Algorithm chosen when the caller does not name one: SHA-256 for RSA,
    /// the curve's paired digest for ECDSA.
    pub fn default_for(key: &PublicKey) -> Self {
        match key {
            PublicKey::Rsa { .. } => SignatureAlgorithm::Sha256WithRsa,
            PublicKey::Ecdsa { curve, .. } => match curve.hash() {
                HashAlgorithm::Sha256 => SignatureAlgorithm::EcdsaWithSha256,
                HashAlgorithm::Sha384 => SignatureAlgorithm::EcdsaWithSha384,
                HashAlgorithm::Sha512 => SignatureAlgorithm::EcdsaWithSha512,
            },
        }
    }

    /// Fail unless this algorithm can be produced by `key`.
    pub fn check_key(self, key: &PublicKey) -> Result<()> {
        if self.family() != key.family() {
            return Err(CeremonyError::CryptoError(format!(
                "signature algorithm {} does not match {} signing key",
                self,
                key.family_name()
            )));
        }
        Ok(())
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SignatureAlgorithm {
    type Err = CeremonyError;

    fn from_str(s: &str) -> Result<Self> {
        ALL_SIGNATURE_ALGORITHMS
            .into_iter()
            .find(|a| a.name() == s)
            .ok_or_else(|| {
                CeremonyError::ConfigValidation(format!("unsupported signature algorithm {:?}", s))
            })
    }
}
