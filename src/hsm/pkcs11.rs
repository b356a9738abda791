//! [`HsmSession`] over a real PKCS#11 module, via `cryptoki`.

use super::{
    Attribute, AttributeType, HsmConnector, HsmResult, HsmSession, KeyType, Mechanism,
    ObjectClass, ObjectHandle,
};
use crate::error::HsmError;
use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::mechanism::Mechanism as CkMechanism;
use cryptoki::object::{
    Attribute as CkAttribute, AttributeType as CkAttributeType, KeyType as CkKeyType,
    ObjectClass as CkObjectClass, ObjectHandle as CkObjectHandle,
};
use cryptoki::session::{Session, UserType};
use cryptoki::types::AuthPin;
use std::cell::RefCell;
use tracing::info;

/// Opens sessions by loading a PKCS#11 shared library.
#[derive(Debug, Default, Clone, Copy)]
pub struct Pkcs11Connector;

/// A logged-in read-write session.
///
/// `cryptoki` keeps object handles opaque, so the session hands out indexes
/// into its own handle table.
pub struct Pkcs11Session {
    session: Session,
    handles: RefCell<Vec<CkObjectHandle>>,
}

fn device_error(context: &str) -> impl Fn(cryptoki::error::Error) -> HsmError + '_ {
    move |e| HsmError::Device(format!("{}: {}", context, e))
}

impl HsmConnector for Pkcs11Connector {
    type Session = Pkcs11Session;

    fn open_session(
        &self,
        module: &str,
        slot: u64,
        pin: Option<&str>,
    ) -> HsmResult<Pkcs11Session> {
        let setup = |reason: String| HsmError::SessionSetup { slot, reason };

        let ctx = Pkcs11::new(module).map_err(|e| setup(format!("loading {}: {}", module, e)))?;
        ctx.initialize(CInitializeArgs::OsThreads)
            .map_err(|e| setup(format!("initializing module: {}", e)))?;

        let ck_slot = ctx
            .get_slots_with_token()
            .map_err(|e| setup(format!("listing slots: {}", e)))?
            .into_iter()
            .find(|s| u64::from(s.id()) == slot)
            .ok_or_else(|| setup("no token present in slot".to_string()))?;

        let session = ctx
            .open_rw_session(ck_slot)
            .map_err(|e| setup(format!("opening session: {}", e)))?;
        if let Some(pin) = pin {
            session
                .login(UserType::User, Some(&AuthPin::new(pin.to_string())))
                .map_err(|e| setup(format!("login: {}", e)))?;
        }
        info!(module, slot, "opened PKCS#11 session");

        Ok(Pkcs11Session {
            session,
            handles: RefCell::new(Vec::new()),
        })
    }
}

impl Pkcs11Session {
    fn register(&self, handle: CkObjectHandle) -> ObjectHandle {
        let mut handles = self.handles.borrow_mut();
        let index = match handles.iter().position(|h| *h == handle) {
            Some(index) => index,
            None => {
                handles.push(handle);
                handles.len() - 1
            }
        };
        index as ObjectHandle
    }

    fn lookup(&self, handle: ObjectHandle) -> HsmResult<CkObjectHandle> {
        self.handles
            .borrow()
            .get(handle as usize)
            .copied()
            .ok_or(HsmError::InvalidHandle(handle))
    }
}

fn to_ck_attribute(attribute: &Attribute) -> CkAttribute {
    match attribute {
        Attribute::Class(ObjectClass::PublicKey) => CkAttribute::Class(CkObjectClass::PUBLIC_KEY),
        Attribute::Class(ObjectClass::PrivateKey) => {
            CkAttribute::Class(CkObjectClass::PRIVATE_KEY)
        }
        Attribute::KeyType(KeyType::Rsa) => CkAttribute::KeyType(CkKeyType::RSA),
        Attribute::KeyType(KeyType::Ec) => CkAttribute::KeyType(CkKeyType::EC),
        Attribute::Label(v) => CkAttribute::Label(v.clone()),
        Attribute::Id(v) => CkAttribute::Id(v.clone()),
        Attribute::Token(b) => CkAttribute::Token(*b),
        Attribute::Private(b) => CkAttribute::Private(*b),
        Attribute::Sensitive(b) => CkAttribute::Sensitive(*b),
        Attribute::Extractable(b) => CkAttribute::Extractable(*b),
        Attribute::Sign(b) => CkAttribute::Sign(*b),
        Attribute::Verify(b) => CkAttribute::Verify(*b),
        Attribute::ModulusBits(n) => CkAttribute::ModulusBits((*n).into()),
        Attribute::PublicExponent(v) => CkAttribute::PublicExponent(v.clone()),
        Attribute::Modulus(v) => CkAttribute::Modulus(v.clone()),
        Attribute::EcParams(v) => CkAttribute::EcParams(v.clone()),
        Attribute::EcPoint(v) => CkAttribute::EcPoint(v.clone()),
    }
}

fn from_ck_attribute(attribute: &CkAttribute) -> Option<Attribute> {
    Some(match attribute {
        CkAttribute::Class(c) if *c == CkObjectClass::PUBLIC_KEY => {
            Attribute::Class(ObjectClass::PublicKey)
        }
        CkAttribute::Class(c) if *c == CkObjectClass::PRIVATE_KEY => {
            Attribute::Class(ObjectClass::PrivateKey)
        }
        CkAttribute::KeyType(k) if *k == CkKeyType::RSA => Attribute::KeyType(KeyType::Rsa),
        CkAttribute::KeyType(k) if *k == CkKeyType::EC => Attribute::KeyType(KeyType::Ec),
        CkAttribute::Label(v) => Attribute::Label(v.clone()),
        CkAttribute::Id(v) => Attribute::Id(v.clone()),
        CkAttribute::Token(b) => Attribute::Token(*b),
        CkAttribute::Private(b) => Attribute::Private(*b),
        CkAttribute::Sensitive(b) => Attribute::Sensitive(*b),
        CkAttribute::Extractable(b) => Attribute::Extractable(*b),
        CkAttribute::Sign(b) => Attribute::Sign(*b),
        CkAttribute::Verify(b) => Attribute::Verify(*b),
        CkAttribute::ModulusBits(n) => Attribute::ModulusBits(u64::from(**n)),
        CkAttribute::PublicExponent(v) => Attribute::PublicExponent(v.clone()),
        CkAttribute::Modulus(v) => Attribute::Modulus(v.clone()),
        CkAttribute::EcParams(v) => Attribute::EcParams(v.clone()),
        CkAttribute::EcPoint(v) => Attribute::EcPoint(v.clone()),
        _ => return None,
    })
}

fn to_ck_attribute_type(kind: AttributeType) -> CkAttributeType {
    match kind {
        AttributeType::Class => CkAttributeType::Class,
        AttributeType::KeyType => CkAttributeType::KeyType,
        AttributeType::Label => CkAttributeType::Label,
        AttributeType::Id => CkAttributeType::Id,
        AttributeType::Token => CkAttributeType::Token,
        AttributeType::Private => CkAttributeType::Private,
        AttributeType::Sensitive => CkAttributeType::Sensitive,
        AttributeType::Extractable => CkAttributeType::Extractable,
        AttributeType::Sign => CkAttributeType::Sign,
        AttributeType::Verify => CkAttributeType::Verify,
        AttributeType::ModulusBits => CkAttributeType::ModulusBits,
        AttributeType::PublicExponent => CkAttributeType::PublicExponent,
        AttributeType::Modulus => CkAttributeType::Modulus,
        AttributeType::EcParams => CkAttributeType::EcParams,
        AttributeType::EcPoint => CkAttributeType::EcPoint,
    }
}

fn to_ck_mechanism(mechanism: Mechanism) -> CkMechanism<'static> {
    match mechanism {
        Mechanism::RsaKeyPairGen => CkMechanism::RsaPkcsKeyPairGen,
        Mechanism::EcKeyPairGen => CkMechanism::EccKeyPairGen,
        Mechanism::RsaPkcs => CkMechanism::RsaPkcs,
        Mechanism::Ecdsa => CkMechanism::Ecdsa,
    }
}

impl HsmSession for Pkcs11Session {
    fn generate_key_pair(
        &self,
        mechanism: Mechanism,
        public_template: &[Attribute],
        private_template: &[Attribute],
    ) -> HsmResult<(ObjectHandle, ObjectHandle)> {
        let public: Vec<CkAttribute> = public_template.iter().map(to_ck_attribute).collect();
        let private: Vec<CkAttribute> = private_template.iter().map(to_ck_attribute).collect();
        let (public_handle, private_handle) = self
            .session
            .generate_key_pair(&to_ck_mechanism(mechanism), &public, &private)
            .map_err(device_error("C_GenerateKeyPair"))?;
        Ok((self.register(public_handle), self.register(private_handle)))
    }

    fn get_attributes(
        &self,
        object: ObjectHandle,
        types: &[AttributeType],
    ) -> HsmResult<Vec<Attribute>> {
        let handle = self.lookup(object)?;
        let types: Vec<CkAttributeType> = types.iter().copied().map(to_ck_attribute_type).collect();
        let attributes = self
            .session
            .get_attributes(handle, &types)
            .map_err(device_error("C_GetAttributeValue"))?;
        Ok(attributes.iter().filter_map(from_ck_attribute).collect())
    }

    fn sign(&self, mechanism: Mechanism, key: ObjectHandle, data: &[u8]) -> HsmResult<Vec<u8>> {
        let handle = self.lookup(key)?;
        self.session
            .sign(&to_ck_mechanism(mechanism), handle, data)
            .map_err(device_error("C_Sign"))
    }

    fn generate_random(&self, len: usize) -> HsmResult<Vec<u8>> {
        let mut bytes = vec![0u8; len];
        self.session
            .generate_random_slice(&mut bytes)
            .map_err(device_error("C_GenerateRandom"))?;
        Ok(bytes)
    }

    fn find_objects(&self, template: &[Attribute]) -> HsmResult<Vec<ObjectHandle>> {
        let template: Vec<CkAttribute> = template.iter().map(to_ck_attribute).collect();
        let handles = self
            .session
            .find_objects(&template)
            .map_err(device_error("C_FindObjects"))?;
        Ok(handles.into_iter().map(|h| self.register(h)).collect())
    }
}
