//! Messages exchanged between the two swap peers.

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use swap_keys::JointKey;

use crate::params::{SwapId, SwapParameters};
use crate::relay::RelayClaimRequest;
use crate::state::Role;

/// Evidence that the counter-asset (XMR) was sent to the joint key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockProof {
    pub joint_key: JointKey,
    /// Piconero.
    pub amount: u64,
    pub tx_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    /// Proposes a swap. `role` is the sender's role.
    InitiateRequest {
        swap_id: SwapId,
        role: Role,
        params: SwapParameters,
    },
    NotifyContractDeployed {
        swap_id: SwapId,
        contract_address: Address,
    },
    NotifyCounterAssetLocked {
        swap_id: SwapId,
        lock_proof: LockProof,
    },
    NotifyReady {
        swap_id: SwapId,
    },
    RelayClaim(RelayClaimRequest),
}

impl PeerMessage {
    pub fn swap_id(&self) -> SwapId {
        match self {
            Self::InitiateRequest { swap_id, .. }
            | Self::NotifyContractDeployed { swap_id, .. }
            | Self::NotifyCounterAssetLocked { swap_id, .. }
            | Self::NotifyReady { swap_id } => *swap_id,
            Self::RelayClaim(request) => request.swap.swap_id(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::InitiateRequest { .. } => "initiate_request",
            Self::NotifyContractDeployed { .. } => "notify_contract_deployed",
            Self::NotifyCounterAssetLocked { .. } => "notify_counter_asset_locked",
            Self::NotifyReady { .. } => "notify_ready",
            Self::RelayClaim(_) => "relay_claim",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}
