//! Randomness sources passed explicitly to the operations that need them.
//!
//! Serial numbers and key identifiers draw from the device through
//! [`HsmRandom`]. Signing calls receive [`FailingRandom`]: HSM-backed signers
//! bring their own entropy, so any attempt to read from it is a bug.
//!
//! Both are `rand` generators. Callers draw through [`random_bytes`], which
//! uses `try_fill_bytes` so a device failure surfaces as an error rather than
//! a panic.

use super::HsmSession;
use crate::error::{CeremonyError, HsmError, Result};
use rand::{CryptoRng, RngCore};

fn next_u32_via_fill<R: RngCore + ?Sized>(rng: &mut R) -> u32 {
    let mut bytes = [0u8; 4];
    rng.fill_bytes(&mut bytes);
    u32::from_le_bytes(bytes)
}

fn next_u64_via_fill<R: RngCore + ?Sized>(rng: &mut R) -> u64 {
    let mut bytes = [0u8; 8];
    rng.fill_bytes(&mut bytes);
    u64::from_le_bytes(bytes)
}

/// Randomness from the HSM's RNG.
///
/// # Panics
///
/// `fill_bytes`, `next_u32` and `next_u64` panic if the device fails, as
/// `rand::rngs::OsRng` does. Use [`random_bytes`] to get the error instead.
pub struct HsmRandom<'a, S: HsmSession + ?Sized> {
    session: &'a S,
}

impl<'a, S: HsmSession + ?Sized> HsmRandom<'a, S> {
    pub fn new(session: &'a S) -> Self {
        Self { session }
    }

    fn draw(&self, dest: &mut [u8]) -> Result<()> {
        let bytes = self.session.generate_random(dest.len())?;
        if bytes.len() != dest.len() {
            return Err(HsmError::InvalidResponse(format!(
                "requested {} random bytes, device returned {}",
                dest.len(),
                bytes.len()
            ))
            .into());
        }
        dest.copy_from_slice(&bytes);
        Ok(())
    }
}

impl<S: HsmSession + ?Sized> RngCore for HsmRandom<'_, S> {
    fn next_u32(&mut self) -> u32 {
        next_u32_via_fill(self)
    }

    fn next_u64(&mut self) -> u64 {
        next_u64_via_fill(self)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        if let Err(e) = self.try_fill_bytes(dest) {
            panic!("HSM random number generation failed: {}", e);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), rand::Error> {
        self.draw(dest).map_err(rand::Error::new)
    }
}

impl<S: HsmSession + ?Sized> CryptoRng for HsmRandom<'_, S> {}

/// A generator that always errors.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingRandom;

impl RngCore for FailingRandom {
    fn next_u32(&mut self) -> u32 {
        next_u32_via_fill(self)
    }

    fn next_u64(&mut self) -> u64 {
        next_u64_via_fill(self)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        if let Err(e) = self.try_fill_bytes(dest) {
            panic!("{}", e);
        }
    }

    fn try_fill_bytes(&mut self, _dest: &mut [u8]) -> std::result::Result<(), rand::Error> {
        Err(rand::Error::new(CeremonyError::CryptoError(
            "randomness requested from a signer that must use the HSM's own entropy".to_string(),
        )))
    }
}

impl CryptoRng for FailingRandom {}

/// Draw `len` bytes from `rng`, keeping the generator's own error.
pub fn random_bytes<R: RngCore + ?Sized>(rng: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    rng.try_fill_bytes(&mut buf).map_err(into_ceremony_error)?;
    Ok(buf)
}

fn into_ceremony_error(err: rand::Error) -> CeremonyError {
    match err.take_inner().downcast::<CeremonyError>() {
        Ok(inner) => *inner,
        Err(other) => {
            CeremonyError::CryptoError(format!("random number generation failed: {}", other))
        }
    }
}
