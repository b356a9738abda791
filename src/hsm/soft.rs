//! In-memory token implementing [`HsmSession`].
//!
//! `SoftHsm` behaves like a single-slot PKCS#11 token closely enough to
//! rehearse every ceremony without hardware: objects carry attribute lists,
//! private keys never leave the token, and random bytes come from the
//! token's own RNG. It is also the device every test runs against.
//!
//! Clones share the same token, so a "session" opened through
//! [`HsmConnector`] sees objects created by any other clone.

use super::{
    Attribute, AttributeType, HsmConnector, HsmResult, HsmSession, KeyType, Mechanism,
    ObjectClass, ObjectHandle,
};
use crate::crypto::Curve;
use crate::error::HsmError;
use der::asn1::OctetString;
use der::Encode;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Sign, RsaPrivateKey};
use signature::hazmat::PrehashSigner;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::debug;

/// Misbehaviour a test can switch on to exercise the ceremony's checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Generated RSA public objects report exponent 3.
    WrongPublicExponent,
    /// Generated EC public objects report a different curve.
    WrongCurve,
    /// Every signature has one bit flipped.
    CorruptSignatures,
    /// EC public objects store the raw point instead of a DER OCTET STRING.
    RawEcPoint,
}

enum SoftPrivateKey {
    Rsa(Box<RsaPrivateKey>),
    P224(p224::ecdsa::SigningKey),
    P256(p256::ecdsa::SigningKey),
    P384(p384::ecdsa::SigningKey),
}

struct SoftObject {
    attributes: Vec<Attribute>,
    key: Option<SoftPrivateKey>,
}

impl SoftObject {
    fn matches(&self, template: &[Attribute]) -> bool {
        template.iter().all(|t| self.attributes.contains(t))
    }
}

#[derive(Default)]
struct SoftToken {
    objects: BTreeMap<ObjectHandle, SoftObject>,
    next_handle: ObjectHandle,
    faults: Vec<Fault>,
    pin: Option<String>,
}

impl SoftToken {
    fn insert(&mut self, object: SoftObject) -> ObjectHandle {
        self.next_handle += 1;
        self.objects.insert(self.next_handle, object);
        self.next_handle
    }

    fn has_fault(&self, fault: Fault) -> bool {
        self.faults.contains(&fault)
    }
}

/// An in-memory PKCS#11-like token.
#[derive(Clone, Default)]
pub struct SoftHsm {
    token: Rc<RefCell<SoftToken>>,
}

impl SoftHsm {
    /// A token with no PIN.
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that only opens sessions presenting `pin`.
    pub fn with_pin(pin: &str) -> Self {
        let hsm = Self::new();
        hsm.token.borrow_mut().pin = Some(pin.to_string());
        hsm
    }

    pub fn inject_fault(&self, fault: Fault) {
        self.token.borrow_mut().faults.push(fault);
    }

    /// Number of objects on the token.
    pub fn object_count(&self) -> usize {
        self.token.borrow().objects.len()
    }
}

fn set(attributes: &mut Vec<Attribute>, attribute: Attribute) {
    let kind = attribute.attribute_type();
    attributes.retain(|a| a.attribute_type() != kind);
    attributes.push(attribute);
}

fn template_bytes(template: &[Attribute], kind: AttributeType) -> Option<&[u8]> {
    template.iter().find_map(|a| match a {
        Attribute::PublicExponent(v) if kind == AttributeType::PublicExponent => Some(v.as_slice()),
        Attribute::EcParams(v) if kind == AttributeType::EcParams => Some(v.as_slice()),
        _ => None,
    })
}

fn wrap_point(point: &[u8]) -> HsmResult<Vec<u8>> {
    OctetString::new(point)
        .and_then(|o| o.to_der())
        .map_err(|e| HsmError::Device(format!("failed to encode EC point: {}", e)))
}

fn generate_ec(curve: Curve) -> HsmResult<(SoftPrivateKey, Vec<u8>)> {
    macro_rules! ec_key {
        ($curve:ident, $variant:ident) => {{
            let key = $curve::ecdsa::SigningKey::random(&mut OsRng);
            let point = key
                .verifying_key()
                .to_encoded_point(false)
                .as_bytes()
                .to_vec();
            (SoftPrivateKey::$variant(key), point)
        }};
    }
    Ok(match curve {
        Curve::P224 => ec_key!(p224, P224),
        Curve::P256 => ec_key!(p256, P256),
        Curve::P384 => ec_key!(p384, P384),
        Curve::P521 => {
            return Err(HsmError::Unsupported(
                "P-521 key generation on the in-memory token".to_string(),
            ))
        }
    })
}

impl HsmSession for SoftHsm {
    fn generate_key_pair(
        &self,
        mechanism: Mechanism,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> HsmResult<(ObjectHandle, ObjectHandle)> {
        let mut token = self.token.borrow_mut();
        let mut public = public_template.to_vec();
        let mut private = private_template.to_vec();
        set(&mut public, Attribute::Class(ObjectClass::PublicKey));
        set(&mut private, Attribute::Class(ObjectClass::PrivateKey));

        let key = match mechanism {
            Mechanism::RsaKeyPairGen => {
                let bits = public_template
                    .iter()
                    .find_map(|a| match a {
                        Attribute::ModulusBits(bits) => Some(*bits as usize),
                        _ => None,
                    })
                    .ok_or_else(|| HsmError::Device("CKA_MODULUS_BITS missing".to_string()))?;
                let exponent = template_bytes(public_template, AttributeType::PublicExponent)
                    .ok_or_else(|| HsmError::Device("CKA_PUBLIC_EXPONENT missing".to_string()))?;

                let key = RsaPrivateKey::new_with_exp(
                    &mut OsRng,
                    bits,
                    &BigUint::from_bytes_be(exponent),
                )
                .map_err(|e| HsmError::Device(format!("RSA key generation failed: {}", e)))?;

                let reported_exponent = if token.has_fault(Fault::WrongPublicExponent) {
                    vec![0x03]
                } else {
                    key.e().to_bytes_be()
                };
                set(&mut public, Attribute::KeyType(KeyType::Rsa));
                set(&mut public, Attribute::Modulus(key.n().to_bytes_be()));
                set(&mut public, Attribute::PublicExponent(reported_exponent));
                set(&mut private, Attribute::KeyType(KeyType::Rsa));
                SoftPrivateKey::Rsa(Box::new(key))
            }
            Mechanism::EcKeyPairGen => {
                let params = template_bytes(public_template, AttributeType::EcParams)
                    .ok_or_else(|| HsmError::Device("CKA_EC_PARAMS missing".to_string()))?;
                let curve = Curve::from_params_der(params).ok_or_else(|| {
                    HsmError::Unsupported(format!("curve parameters {}", hex::encode(params)))
                })?;
                let (key, point) = generate_ec(curve)?;

                let reported_curve = match (token.has_fault(Fault::WrongCurve), curve) {
                    (false, c) => c,
                    (true, Curve::P256) => Curve::P384,
                    (true, _) => Curve::P256,
                };
                let reported_params = reported_curve
                    .params_der()
                    .map_err(|e| HsmError::Device(e.to_string()))?;
                set(&mut public, Attribute::KeyType(KeyType::Ec));
                set(&mut public, Attribute::EcParams(reported_params));
                let stored_point = if token.has_fault(Fault::RawEcPoint) {
                    point
                } else {
                    wrap_point(&point)?
                };
                set(&mut public, Attribute::EcPoint(stored_point));
                set(&mut private, Attribute::KeyType(KeyType::Ec));
                key
            }
            other => {
                return Err(HsmError::Unsupported(format!(
                    "{:?} is not a key generation mechanism",
                    other
                )))
            }
        };

        let public_handle = token.insert(SoftObject {
            attributes: public,
            key: None,
        });
        let private_handle = token.insert(SoftObject {
            attributes: private,
            key: Some(key),
        });
        debug!(public_handle, private_handle, "soft token generated key pair");
        Ok((public_handle, private_handle))
    }

    fn get_attributes(
        &self,
        object: ObjectHandle,
        types: &[AttributeType],
    ) -> HsmResult<Vec<Attribute>> {
        let token = self.token.borrow();
        let object = token
            .objects
            .get(&object)
            .ok_or(HsmError::InvalidHandle(object))?;
        Ok(object
            .attributes
            .iter()
            .filter(|a| types.contains(&a.attribute_type()))
            .cloned()
            .collect())
    }

    fn sign(&self, mechanism: Mechanism, key: ObjectHandle, data: &[u8]) -> HsmResult<Vec<u8>> {
        let token = self.token.borrow();
        let private = token
            .objects
            .get(&key)
            .and_then(|o| o.key.as_ref())
            .ok_or(HsmError::InvalidHandle(key))?;

        let failed = |e: signature::Error| HsmError::Device(format!("signing failed: {}", e));
        let mut signature = match (mechanism, private) {
            (Mechanism::RsaPkcs, SoftPrivateKey::Rsa(k)) => k
                .sign(Pkcs1v15Sign::new_unprefixed(), data)
                .map_err(|e| HsmError::Device(format!("signing failed: {}", e)))?,
            (Mechanism::Ecdsa, SoftPrivateKey::P224(k)) => {
                let sig: p224::ecdsa::Signature = k.sign_prehash(data).map_err(failed)?;
                sig.to_bytes().to_vec()
            }
            (Mechanism::Ecdsa, SoftPrivateKey::P256(k)) => {
                let sig: p256::ecdsa::Signature = k.sign_prehash(data).map_err(failed)?;
                sig.to_bytes().to_vec()
            }
            (Mechanism::Ecdsa, SoftPrivateKey::P384(k)) => {
                let sig: p384::ecdsa::Signature = k.sign_prehash(data).map_err(failed)?;
                sig.to_bytes().to_vec()
            }
            (other, _) => {
                return Err(HsmError::Unsupported(format!(
                    "mechanism {:?} for this key",
                    other
                )))
            }
        };

        if token.has_fault(Fault::CorruptSignatures) {
            if let Some(last) = signature.last_mut() {
                *last ^= 0x01;
            }
        }
        Ok(signature)
    }

    fn generate_random(&self, len: usize) -> HsmResult<Vec<u8>> {
        let mut bytes = vec![0u8; len];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| HsmError::Device(format!("RNG failure: {}", e)))?;
        Ok(bytes)
    }

    fn find_objects(&self, template: &[Attribute]) -> HsmResult<Vec<ObjectHandle>> {
        let token = self.token.borrow();
        Ok(token
            .objects
            .iter()
            .filter(|(_, o)| o.matches(template))
            .map(|(h, _)| *h)
            .collect())
    }
}

impl HsmConnector for SoftHsm {
    type Session = SoftHsm;

    fn open_session(&self, module: &str, slot: u64, pin: Option<&str>) -> HsmResult<SoftHsm> {
        if slot != 0 {
            return Err(HsmError::SessionSetup {
                slot,
                reason: "the in-memory token only has slot 0".to_string(),
            });
        }
        if let Some(expected) = &self.token.borrow().pin {
            if pin != Some(expected.as_str()) {
                return Err(HsmError::SessionSetup {
                    slot,
                    reason: "incorrect PIN".to_string(),
                });
            }
        }
        debug!(module, slot, "opened in-memory token session");
        Ok(self.clone())
    }
}
