//! Certificate, CSR, CRL and OCSP construction.
//!
//! Profiles are validated in [`profile`], turned into unsigned templates in
//! [`template`], and signed by the HSM through the issuance pipeline or the
//! narrower [`csr`], [`crl`] and [`ocsp`] builders.

pub mod crl;
pub mod csr;
pub mod inspect;
pub mod loader;
pub mod ocsp;
pub mod profile;
pub mod template;
pub mod validity;

#[cfg(test)]
pub(crate) mod testutil;
