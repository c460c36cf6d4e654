use std::fmt;

use curve25519_dalek::edwards::EdwardsPoint;
use monero::cryptonote::hash::Hash;
use monero::util::key::{PrivateKey as MoneroPrivateKey, PublicKey as MoneroPublicKey};
use monero::{Address, Network};
use serde::{Deserialize, Serialize};

use crate::keys::{hex_encode, validate_point, Commitment, Secret};
use crate::types::{CryptoError, Result};

/// Public spend key of the shared XMR account: the sum of both parties' commitments.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "[u8; 32]", into = "[u8; 32]")]
pub struct JointKey(EdwardsPoint);

impl JointKey {
    pub fn from_compressed(bytes: [u8; 32]) -> Result<Self> {
        validate_point(&bytes).map(Self)
    }

    pub fn point(&self) -> &EdwardsPoint {
        &self.0
    }

    pub fn to_compressed(&self) -> [u8; 32] {
        self.0.compress().to_bytes()
    }

    /// True when `spend_key * G` is this joint key.
    pub fn is_spendable_by(&self, spend_key: &Secret) -> bool {
        EdwardsPoint::mul_base(&spend_key.as_scalar()) == self.0
    }

    /// Standard Monero address for the shared account.
    pub fn address(&self, network: Network, view_key: &Secret) -> Result<Address> {
        let public_spend = MoneroPublicKey::from_slice(&self.to_compressed())?;
        let private_view = MoneroPrivateKey::from_slice(&view_key.to_bytes())?;
        let public_view = MoneroPublicKey::from_private_key(&private_view);
        Ok(Address::standard(network, public_spend, public_view))
    }
}

impl TryFrom<[u8; 32]> for JointKey {
    type Error = CryptoError;

    fn try_from(bytes: [u8; 32]) -> Result<Self> {
        Self::from_compressed(bytes)
    }
}

impl From<JointKey> for [u8; 32] {
    fn from(key: JointKey) -> Self {
        key.to_compressed()
    }
}

impl fmt::Debug for JointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JointKey({})", hex_encode(&self.to_compressed()))
    }
}

/// Point addition of two commitments.
///
/// Fails when the sum collapses into the small-order subgroup, which happens
/// when one commitment is crafted as the negation of the other.
pub fn combine_commitments(a: &Commitment, b: &Commitment) -> Result<JointKey> {
    let sum = a.point() + b.point();
    if sum.is_small_order() {
        return Err(CryptoError::SmallOrderPoint);
    }
    Ok(JointKey(sum))
}

/// Same as [`combine_commitments`] for raw compressed encodings received off the wire.
pub fn combine_compressed(a: &[u8; 32], b: &[u8; 32]) -> Result<JointKey> {
    let a = Commitment::from_compressed(*a)?;
    let b = Commitment::from_compressed(*b)?;
    combine_commitments(&a, &b)
}

/// Derives the spend key of the shared account: s = s_a + s_b.
pub fn derive_joint_spend_key(a: &Secret, b: &Secret) -> Secret {
    Secret::from_scalar(a.as_scalar() + b.as_scalar())
}

/// Monero convention: the private view key is H_s(spend key).
pub fn derive_view_key(spend_key: &Secret) -> Secret {
    let view = Hash::hash_to_scalar(spend_key.to_bytes());
    Secret::from_scalar(curve25519_dalek::scalar::Scalar::from_bytes_mod_order(
        view.to_bytes(),
    ))
}
