//! Swap lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Funds the ETH contract (Alice).
    Maker,
    /// Locks XMR to the joint key (Bob).
    Taker,
}

impl Role {
    pub fn counterparty(self) -> Self {
        match self {
            Self::Maker => Self::Taker,
            Self::Taker => Self::Maker,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Maker => f.write_str("maker"),
            Self::Taker => f.write_str("taker"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapState {
    Created,
    ContractDeployed,
    CounterAssetLocked,
    Ready,
    Claimed,
    Refunded,
    Aborted,
}

impl SwapState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Claimed | Self::Refunded | Self::Aborted)
    }

    /// States in which ETH sits in the contract.
    pub fn is_funded(&self) -> bool {
        matches!(
            self,
            Self::ContractDeployed | Self::CounterAssetLocked | Self::Ready
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::ContractDeployed => "contract_deployed",
            Self::CounterAssetLocked => "counter_asset_locked",
            Self::Ready => "ready",
            Self::Claimed => "claimed",
            Self::Refunded => "refunded",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for SwapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_three_terminal_states() {
        let all = [
            SwapState::Created,
            SwapState::ContractDeployed,
            SwapState::CounterAssetLocked,
            SwapState::Ready,
            SwapState::Claimed,
            SwapState::Refunded,
            SwapState::Aborted,
        ];
        let terminal: Vec<_> = all.iter().filter(|state| state.is_terminal()).collect();
        assert_eq!(
            terminal,
            vec![&SwapState::Claimed, &SwapState::Refunded, &SwapState::Aborted]
        );
    }

    #[test]
    fn serializes_snake_case() {
        let json = serde_json::to_string(&SwapState::CounterAssetLocked).unwrap();
        assert_eq!(json, "\"counter_asset_locked\"");
        assert_eq!(Role::Maker.counterparty(), Role::Taker);
    }
}
