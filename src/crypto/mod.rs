//! Cryptographic primitives for ceremonies.
//!
//! Private keys never exist in this process. What lives here is everything
//! the host does on its own side of the HSM boundary:
//!
//! - Naming key and signature algorithms, and mapping them to OIDs
//! - Reconstructing public keys from device attributes or SPKI structures
//! - Verifying signatures produced by the device
//!
//! # Example
//!
//! ```rust
//! use ceremony::crypto::{Curve, SignatureAlgorithm};
//!
//! let alg: SignatureAlgorithm = "ECDSAWithSHA384".parse().unwrap();
//! assert_eq!(alg.hash(), Curve::P384.hash());
//! ```

pub mod algorithm;
pub mod public_key;

pub use algorithm::{
    Curve, HashAlgorithm, KeyFamily, KeyGenSpec, SignatureAlgorithm, RSA_PUBLIC_EXPONENT,
};
pub use public_key::{ecdsa_raw_to_der, PublicKey};
