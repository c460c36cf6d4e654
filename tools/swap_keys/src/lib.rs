//! Key material for ETH/XMR atomic swaps.
//!
//! Auditor notes:
//! - Uses curve25519-dalek only for scalar/point arithmetic.
//! - Every commitment built from bytes goes through point validation.
//! - Secrets are zeroized on drop and never printed.

mod joint;
mod keys;
mod types;

pub use joint::{
    combine_commitments, combine_compressed, derive_joint_spend_key, derive_view_key, JointKey,
};
pub use keys::{commit, validate_point, verify_secret_matches_commitment, Commitment, Secret};
pub use types::{CryptoError, Result};

pub use monero::Network;
