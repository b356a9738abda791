//! HSM session port.
//!
//! The ceremony core never talks to a PKCS#11 library directly. It talks to an
//! [`HsmSession`], a narrow capability covering the five operations a
//! ceremony needs. Two adapters implement it:
//!
//! - [`soft::SoftHsm`]: an in-memory token used for rehearsals and tests
//! - `pkcs11::Pkcs11Session`: a real device through `cryptoki` (feature `pkcs11`)
//!
//! Sessions are opened through an [`HsmConnector`] and owned by the
//! ceremony workflow for its whole lifetime.

pub mod random;
pub mod signer;
pub mod soft;

#[cfg(feature = "pkcs11")]
pub mod pkcs11;

use crate::crypto::{Curve, PublicKey};
use crate::error::{CeremonyError, HsmError, Result};
use der::asn1::OctetString;
use der::Decode;

pub use random::{random_bytes, FailingRandom, HsmRandom};
pub use signer::{HsmSigner, Signer};

/// Opaque identifier of an object on the token.
pub type ObjectHandle = u64;

/// Result of a raw session operation.
pub type HsmResult<T> = std::result::Result<T, HsmError>;

/// CKA_CLASS values a ceremony deals with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectClass {
    PublicKey,
    PrivateKey,
}

/// CKA_KEY_TYPE values a ceremony deals with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Rsa,
    Ec,
}

/// An object attribute with its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    Class(ObjectClass),
    KeyType(KeyType),
    Label(Vec<u8>),
    Id(Vec<u8>),
    Token(bool),
    Private(bool),
    Sensitive(bool),
    Extractable(bool),
    Sign(bool),
    Verify(bool),
    ModulusBits(u64),
    PublicExponent(Vec<u8>),
    Modulus(Vec<u8>),
    EcParams(Vec<u8>),
    EcPoint(Vec<u8>),
}

/// Attribute names, used when reading attributes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeType {
    Class,
    KeyType,
    Label,
    Id,
    Token,
    Private,
    Sensitive,
    Extractable,
    Sign,
    Verify,
    ModulusBits,
    PublicExponent,
    Modulus,
    EcParams,
    EcPoint,
}

impl Attribute {
    /// The type tag of this attribute.
    pub fn attribute_type(&self) -> AttributeType {
        match self {
            Attribute::Class(_) => AttributeType::Class,
            Attribute::KeyType(_) => AttributeType::KeyType,
            Attribute::Label(_) => AttributeType::Label,
            Attribute::Id(_) => AttributeType::Id,
            Attribute::Token(_) => AttributeType::Token,
            Attribute::Private(_) => AttributeType::Private,
            Attribute::Sensitive(_) => AttributeType::Sensitive,
            Attribute::Extractable(_) => AttributeType::Extractable,
            Attribute::Sign(_) => AttributeType::Sign,
            Attribute::Verify(_) => AttributeType::Verify,
            Attribute::ModulusBits(_) => AttributeType::ModulusBits,
            Attribute::PublicExponent(_) => AttributeType::PublicExponent,
            Attribute::Modulus(_) => AttributeType::Modulus,
            Attribute::EcParams(_) => AttributeType::EcParams,
            Attribute::EcPoint(_) => AttributeType::EcPoint,
        }
    }
}

/// Mechanisms a ceremony requests from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    /// CKM_RSA_PKCS_KEY_PAIR_GEN
    RsaKeyPairGen,
    /// CKM_EC_KEY_PAIR_GEN
    EcKeyPairGen,
    /// CKM_RSA_PKCS: raw PKCS#1 v1.5 padding over a caller-built DigestInfo
    RsaPkcs,
    /// CKM_ECDSA: signs a precomputed digest, returns r || s
    Ecdsa,
}

/// The operations a ceremony performs against an HSM.
///
/// Methods take `&self`: a session is a single-threaded handle and adapters
/// manage their own interior state.
pub trait HsmSession {
    /// Generate a key pair, returning `(public, private)` handles.
    fn generate_key_pair(
        &self,
        mechanism: Mechanism,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> HsmResult<(ObjectHandle, ObjectHandle)>;

    /// Read the requested attributes of an object.
    fn get_attributes(
        &self,
        object: ObjectHandle,
        types: &[AttributeType],
    ) -> HsmResult<Vec<Attribute>>;

    /// Sign `data` with the private key `key`.
    fn sign(&self, mechanism: Mechanism, key: ObjectHandle, data: &[u8]) -> HsmResult<Vec<u8>>;

    /// Draw `len` bytes from the device RNG.
    fn generate_random(&self, len: usize) -> HsmResult<Vec<u8>>;

    /// Every object matching all attributes in `template`.
    fn find_objects(&self, template: &[Attribute]) -> HsmResult<Vec<ObjectHandle>>;
}

/// Opens sessions against a PKCS#11 module.
pub trait HsmConnector {
    type Session: HsmSession;

    /// Load `module`, open a read-write session on `slot` and log in with `pin`.
    fn open_session(&self, module: &str, slot: u64, pin: Option<&str>)
        -> HsmResult<Self::Session>;
}

/// Find the single object matching `template`.
///
/// Zero matches and more than one match are both errors.
pub fn find_object<S: HsmSession + ?Sized>(
    session: &S,
    template: &[Attribute],
) -> HsmResult<ObjectHandle> {
    let handles = session.find_objects(template)?;
    match handles.as_slice() {
        [] => Err(HsmError::NoObject),
        [handle] => Ok(*handle),
        many => Err(HsmError::TooManyObjects(many.len())),
    }
}

fn take_bytes(attrs: &[Attribute], wanted: AttributeType) -> Result<Vec<u8>> {
    attrs
        .iter()
        .find_map(|a| match (a, wanted) {
            (Attribute::PublicExponent(v), AttributeType::PublicExponent)
            | (Attribute::Modulus(v), AttributeType::Modulus)
            | (Attribute::EcParams(v), AttributeType::EcParams)
            | (Attribute::EcPoint(v), AttributeType::EcPoint)
            | (Attribute::Id(v), AttributeType::Id) => Some(v.clone()),
            _ => None,
        })
        .ok_or_else(|| {
            HsmError::InvalidResponse(format!("attribute {:?} missing from response", wanted))
                .into()
        })
}

/// Read the CKA_ID of an object.
pub fn object_id<S: HsmSession + ?Sized>(session: &S, object: ObjectHandle) -> Result<Vec<u8>> {
    let attrs = session.get_attributes(object, &[AttributeType::Id])?;
    take_bytes(&attrs, AttributeType::Id)
}

/// Reconstruct an RSA public key from the modulus and exponent of `object`.
pub fn rsa_public_key<S: HsmSession + ?Sized>(
    session: &S,
    object: ObjectHandle,
) -> Result<PublicKey> {
    let attrs = session.get_attributes(
        object,
        &[AttributeType::PublicExponent, AttributeType::Modulus],
    )?;
    let exponent = take_bytes(&attrs, AttributeType::PublicExponent)?;
    let modulus = take_bytes(&attrs, AttributeType::Modulus)?;
    Ok(PublicKey::rsa(&modulus, &exponent))
}

/// Read the CKA_EC_PARAMS of an object.
pub fn ec_params<S: HsmSession + ?Sized>(session: &S, object: ObjectHandle) -> Result<Vec<u8>> {
    let attrs = session.get_attributes(object, &[AttributeType::EcParams])?;
    take_bytes(&attrs, AttributeType::EcParams)
}

/// Reconstruct an ECDSA public key from the curve parameters and point of `object`.
pub fn ec_public_key<S: HsmSession + ?Sized>(
    session: &S,
    object: ObjectHandle,
) -> Result<PublicKey> {
    let attrs = session.get_attributes(object, &[AttributeType::EcParams, AttributeType::EcPoint])?;
    let params = take_bytes(&attrs, AttributeType::EcParams)?;
    let point = take_bytes(&attrs, AttributeType::EcPoint)?;

    let curve = Curve::from_params_der(&params).ok_or_else(|| {
        CeremonyError::AttributeMismatch(format!(
            "unsupported curve parameters {}",
            hex::encode(&params)
        ))
    })?;
    let point = unwrap_ec_point(curve, &point)?;
    Ok(PublicKey::Ecdsa { curve, point })
}

/// Accept an EC point either raw or wrapped in a DER OCTET STRING.
///
/// PKCS#11 v2.20 mandates the wrapped form but many devices return the raw
/// uncompressed point. Both start with 0x04, so the raw form is recognised by
/// its exact length.
pub fn unwrap_ec_point(curve: Curve, point: &[u8]) -> Result<Vec<u8>> {
    let raw_len = 1 + 2 * curve.coordinate_len();
    if point.len() == raw_len && point[0] == 0x04 {
        return Ok(point.to_vec());
    }
    let inner = OctetString::from_der(point)
        .map_err(|e| HsmError::InvalidResponse(format!("failed to decode EC point: {}", e)))?;
    let inner = inner.as_bytes();
    if inner.len() != raw_len || inner[0] != 0x04 {
        return Err(HsmError::InvalidResponse(format!(
            "EC point is not an uncompressed {} point",
            curve
        ))
        .into());
    }
    Ok(inner.to_vec())
}
