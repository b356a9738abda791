//! hsm-ceremony: offline certificate-authority ceremonies driven through an HSM.
//!
//! Each run performs exactly one ceremony: generating a CA key, issuing a
//! root, intermediate, cross or delegated signer certificate, producing a
//! cross-signing CSR, or signing an OCSP response or CRL. Every step that
//! touches the hierarchy is checked before anything is written:
//!
//! - profiles are validated for the ceremony type before the HSM is opened
//! - generated keys are read back and must pass a sign/verify self-test
//! - certificates are linted, signed on the HSM and verified against the issuer
//! - outputs are written create-only and never overwrite an existing file
//!
//! # Example
//!
//! ```rust,no_run
//! use ceremony::ceremony::run;
//! use ceremony::config::CeremonyConfig;
//! use ceremony::error::Result;
//! use ceremony::hsm::soft::SoftHsm;
//!
//! fn example() -> Result<()> {
//!     let config = CeremonyConfig::load("root-ceremony.json")?;
//!     run(&config, &SoftHsm::new())?;
//!     Ok(())
//! }
//! ```

pub mod ceremony;
pub mod cert;
pub mod config;
pub mod crypto;
pub mod error;
pub mod hsm;
pub mod issuance;
pub mod keygen;
pub mod oid;
pub mod storage;

// Re-export commonly used types
pub use error::{CeremonyError, Result};
