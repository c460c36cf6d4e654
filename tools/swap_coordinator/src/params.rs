use std::time::Duration;

use alloy::primitives::{keccak256, Address, B256, U256};
use alloy::sol_types::SolValue;
use serde::{Deserialize, Serialize};
use swap_keys::Commitment;

use crate::contract::abi::Swap;
use crate::timeout::Deadlines;

/// `keccak256(abi.encode(swap))`, the key the swap creator contract stores swaps under.
pub type SwapId = B256;

/// Constructor arguments of one on-chain swap. Immutable once the swap is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapParameters {
    /// Maker: funds the contract and may refund.
    pub owner: Address,
    /// Taker: may claim once ready.
    pub claimer: Address,
    pub claim_commitment: Commitment,
    pub refund_commitment: Commitment,
    pub timeout_0: u64,
    pub timeout_1: u64,
    /// Zero address for ETH.
    pub asset: Address,
    pub value: U256,
    pub nonce: U256,
}

impl SwapParameters {
    #[allow(clippy::too_many_arguments)]
    pub fn new_eth_swap(
        owner: Address,
        claimer: Address,
        refund_commitment: Commitment,
        claim_commitment: Commitment,
        value: U256,
        start: u64,
        timeout: Duration,
        nonce: U256,
    ) -> Self {
        let deadlines = Deadlines::from_start(start, timeout);
        Self {
            owner,
            claimer,
            claim_commitment,
            refund_commitment,
            timeout_0: deadlines.t0,
            timeout_1: deadlines.t1,
            asset: Address::ZERO,
            value,
            nonce,
        }
    }

    pub fn random_nonce() -> U256 {
        U256::from_be_bytes(rand::random::<[u8; 32]>())
    }

    pub fn deadlines(&self) -> Deadlines {
        Deadlines {
            t0: self.timeout_0,
            t1: self.timeout_1,
        }
    }

    pub fn is_eth(&self) -> bool {
        self.asset == Address::ZERO
    }

    pub fn to_sol(&self) -> Swap {
        Swap {
            owner: self.owner,
            claimer: self.claimer,
            pubKeyClaim: B256::from(self.claim_commitment.to_compressed()),
            pubKeyRefund: B256::from(self.refund_commitment.to_compressed()),
            timeout0: U256::from(self.timeout_0),
            timeout1: U256::from(self.timeout_1),
            asset: self.asset,
            value: self.value,
            nonce: self.nonce,
        }
    }

    pub fn abi_encode(&self) -> Vec<u8> {
        self.to_sol().abi_encode()
    }

    pub fn swap_id(&self) -> SwapId {
        keccak256(self.abi_encode())
    }
}
