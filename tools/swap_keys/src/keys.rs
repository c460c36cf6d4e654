use std::fmt;

use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::types::{CryptoError, Result};

/// Per-swap private scalar, held reduced modulo the group order.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Secret([u8; 32]);

impl Secret {
    /// Draws a fresh non-zero scalar from the OS entropy source.
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; 32];
        loop {
            OsRng
                .try_fill_bytes(&mut bytes)
                .map_err(|err| CryptoError::Entropy(err.to_string()))?;
            let scalar = Scalar::from_bytes_mod_order(bytes);
            bytes.zeroize();
            if scalar != Scalar::ZERO {
                return Ok(Self(scalar.to_bytes()));
            }
        }
    }

    /// Reduces `bytes` modulo the group order.
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self> {
        let scalar = Scalar::from_bytes_mod_order(bytes);
        if scalar == Scalar::ZERO {
            return Err(CryptoError::ZeroScalar);
        }
        Ok(Self(scalar.to_bytes()))
    }

    /// Accepts only canonical encodings. Used for secrets read back from a peer or the chain.
    pub fn from_canonical_bytes(bytes: [u8; 32]) -> Result<Self> {
        let scalar: Option<Scalar> = Scalar::from_canonical_bytes(bytes).into();
        let scalar = scalar.ok_or(CryptoError::NonCanonicalScalar)?;
        if scalar == Scalar::ZERO {
            return Err(CryptoError::ZeroScalar);
        }
        Ok(Self(scalar.to_bytes()))
    }

    pub(crate) fn from_scalar(scalar: Scalar) -> Self {
        Self(scalar.to_bytes())
    }

    pub fn as_scalar(&self) -> Scalar {
        Scalar::from_bytes_mod_order(self.0)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0
    }

    pub fn commitment(&self) -> Commitment {
        commit(self)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// Public point `s * G` for a [`Secret`]. Never the identity or a small-order point.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "[u8; 32]", into = "[u8; 32]")]
pub struct Commitment(EdwardsPoint);

impl Commitment {
    pub fn from_compressed(bytes: [u8; 32]) -> Result<Self> {
        validate_point(&bytes).map(Self)
    }

    pub fn point(&self) -> &EdwardsPoint {
        &self.0
    }

    pub fn to_compressed(&self) -> [u8; 32] {
        self.0.compress().to_bytes()
    }
}

impl TryFrom<[u8; 32]> for Commitment {
    type Error = CryptoError;

    fn try_from(bytes: [u8; 32]) -> Result<Self> {
        Self::from_compressed(bytes)
    }
}

impl From<Commitment> for [u8; 32] {
    fn from(commitment: Commitment) -> Self {
        commitment.to_compressed()
    }
}

impl fmt::Debug for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Commitment({})", hex_encode(&self.to_compressed()))
    }
}

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex_encode(&self.to_compressed()))
    }
}

pub fn commit(secret: &Secret) -> Commitment {
    Commitment(EdwardsPoint::mul_base(&secret.as_scalar()))
}

pub fn verify_secret_matches_commitment(secret: &Secret, commitment: &Commitment) -> bool {
    commit(secret) == *commitment
}

/// Decompresses an Ed25519 point and rejects small-order points, including the identity.
pub fn validate_point(compressed: &[u8; 32]) -> Result<EdwardsPoint> {
    let point = CompressedEdwardsY(*compressed)
        .decompress()
        .ok_or(CryptoError::InvalidPoint)?;

    if point.is_small_order() {
        return Err(CryptoError::SmallOrderPoint);
    }

    Ok(point)
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_secret_is_reduced() {
        let secret = Secret::generate().unwrap();
        let reduced = Scalar::from_bytes_mod_order(secret.to_bytes());
        assert_eq!(reduced.to_bytes(), secret.to_bytes());
    }

    #[test]
    fn from_bytes_reduces_modulo_order() {
        let secret = Secret::from_bytes([0xff; 32]).unwrap();
        assert_eq!(
            secret.to_bytes(),
            Scalar::from_bytes_mod_order([0xff; 32]).to_bytes()
        );
        assert!(Secret::from_canonical_bytes([0xff; 32]).is_err());
    }

    #[test]
    fn zero_secret_is_rejected() {
        assert!(matches!(
            Secret::from_bytes([0u8; 32]),
            Err(CryptoError::ZeroScalar)
        ));
    }

    #[test]
    fn debug_does_not_leak_secret() {
        let secret = Secret::from_bytes([7u8; 32]).unwrap();
        assert_eq!(format!("{secret:?}"), "Secret(<redacted>)");
    }
}
