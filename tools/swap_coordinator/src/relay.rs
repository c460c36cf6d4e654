//! Gasless claims: the claimer signs, a relayer submits and keeps a fixed fee.

use std::collections::HashSet;
use std::sync::Mutex;

use alloy::primitives::{keccak256, Address, Bytes, Signature, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use swap_keys::{verify_secret_matches_commitment, CryptoError, Secret};
use thiserror::Error;
use tracing::{info, warn};

use crate::contract::{ContractError, ContractHandle, Receipt, SwapContract};
use crate::params::SwapParameters;

/// Fixed 0.009 ETH relayer fee.
pub const RELAY_FEE_WEI: u64 = 9_000_000_000_000_000;

pub fn relay_fee() -> U256 {
    U256::from(RELAY_FEE_WEI)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayClaimRequest {
    /// Only set when the request is forwarded to the counterparty instead of a public relayer.
    pub offer_id: Option<B256>,
    pub swap_creator_addr: Address,
    pub swap: SwapParameters,
    pub secret: B256,
    pub fee: U256,
    /// 65-byte secp256k1 signature by `swap.claimer`.
    pub signature: Bytes,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("signer {actual} is not the swap claimer {expected}")]
    WrongClaimer { expected: Address, actual: Address },
    #[error("malformed relay signature: {0}")]
    BadSignature(String),
    #[error("secret does not open the claim commitment")]
    SecretMismatch,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("relay request {0} already submitted")]
    Replay(B256),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("swap id does not match the swap parameters")]
    SwapIdMismatch,
    #[error("relay fee {fee} leaves nothing for the claimer out of {value}")]
    FeeTooHigh { fee: U256, value: U256 },
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error("relay transport: {0}")]
    Transport(String),
}

/// `keccak256(chain_id ‖ swap_creator ‖ swap_id ‖ secret ‖ fee)`; the swap id binds every
/// swap parameter.
pub fn relay_claim_digest(
    chain_id: u64,
    swap_creator_addr: Address,
    params: &SwapParameters,
    secret: B256,
    fee: U256,
) -> B256 {
    let mut encoded = Vec::with_capacity(32 * 4 + 20);
    encoded.extend_from_slice(&U256::from(chain_id).to_be_bytes::<32>());
    encoded.extend_from_slice(swap_creator_addr.as_slice());
    encoded.extend_from_slice(params.swap_id().as_slice());
    encoded.extend_from_slice(secret.as_slice());
    encoded.extend_from_slice(&fee.to_be_bytes::<32>());
    keccak256(encoded)
}

impl RelayClaimRequest {
    pub fn digest(&self, chain_id: u64) -> B256 {
        relay_claim_digest(
            chain_id,
            self.swap_creator_addr,
            &self.swap,
            self.secret,
            self.fee,
        )
    }

    pub fn with_offer_id(mut self, offer_id: B256) -> Self {
        self.offer_id = Some(offer_id);
        self
    }
}

/// Builds a signed relay claim. Never submits anything.
pub fn build_relay_claim(
    claimer_key: &PrivateKeySigner,
    handle: &ContractHandle,
    params: &SwapParameters,
    secret: &Secret,
    chain_id: u64,
) -> Result<RelayClaimRequest, RelayError> {
    if claimer_key.address() != params.claimer {
        return Err(RelayError::WrongClaimer {
            expected: params.claimer,
            actual: claimer_key.address(),
        });
    }
    if !verify_secret_matches_commitment(secret, &params.claim_commitment) {
        return Err(RelayError::SecretMismatch);
    }
    if handle.swap_id != params.swap_id() {
        return Err(RelayError::SwapIdMismatch);
    }

    let fee = relay_fee();
    if fee >= params.value {
        return Err(RelayError::FeeTooHigh {
            fee,
            value: params.value,
        });
    }

    let secret = B256::from(secret.to_bytes());
    let digest = relay_claim_digest(chain_id, handle.address, params, secret, fee);
    let signature = claimer_key
        .sign_hash_sync(&digest)
        .map_err(|err| RelayError::Signing(err.to_string()))?;

    Ok(RelayClaimRequest {
        offer_id: None,
        swap_creator_addr: handle.address,
        swap: params.clone(),
        secret,
        fee,
        signature: Bytes::from(signature.as_bytes().to_vec()),
    })
}

pub fn recover_relay_signer(
    request: &RelayClaimRequest,
    chain_id: u64,
) -> Result<Address, RelayError> {
    let signature = Signature::from_raw(&request.signature)
        .map_err(|err| RelayError::BadSignature(err.to_string()))?;
    signature
        .recover_address_from_prehash(&request.digest(chain_id))
        .map_err(|err| RelayError::BadSignature(err.to_string()))
}

/// Full check a relayer runs before spending gas on a request.
pub fn verify_relay_claim(request: &RelayClaimRequest, chain_id: u64) -> Result<(), RelayError> {
    let signer = recover_relay_signer(request, chain_id)?;
    if signer != request.swap.claimer {
        return Err(RelayError::WrongClaimer {
            expected: request.swap.claimer,
            actual: signer,
        });
    }

    let secret = Secret::from_canonical_bytes(request.secret.0)?;
    if !verify_secret_matches_commitment(&secret, &request.swap.claim_commitment) {
        return Err(RelayError::SecretMismatch);
    }

    if request.fee >= request.swap.value {
        return Err(RelayError::FeeTooHigh {
            fee: request.fee,
            value: request.swap.value,
        });
    }
    Ok(())
}

/// Remembers request digests so each signed claim is relayed at most once.
#[derive(Debug, Default)]
pub struct ReplayGuard {
    seen: Mutex<HashSet<B256>>,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check_and_record(
        &self,
        request: &RelayClaimRequest,
        chain_id: u64,
    ) -> Result<(), RelayError> {
        let digest = request.digest(chain_id);
        let mut seen = self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !seen.insert(digest) {
            warn!(%digest, "Rejected replayed relay claim");
            return Err(RelayError::Replay(digest));
        }
        Ok(())
    }

    /// Allows a digest to be submitted again after the submission itself failed.
    pub fn forget(&self, request: &RelayClaimRequest, chain_id: u64) {
        let digest = request.digest(chain_id);
        let mut seen = self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        seen.remove(&digest);
    }
}

/// Verifies, deduplicates and submits a relay claim through `contract`.
pub async fn submit_relay_claim(
    contract: &SwapContract,
    guard: &ReplayGuard,
    chain_id: u64,
    request: &RelayClaimRequest,
) -> Result<Receipt, RelayError> {
    verify_relay_claim(request, chain_id)?;
    guard.check_and_record(request, chain_id)?;

    match contract.claim_relayer(request).await {
        Ok(receipt) => {
            info!(
                swap_id = %request.swap.swap_id(),
                tx_hash = %receipt.tx_hash,
                fee = %request.fee,
                "Relayed claim"
            );
            Ok(receipt)
        }
        Err(err) => {
            if err.is_retryable() {
                guard.forget(request, chain_id);
            }
            Err(err.into())
        }
    }
}

/// Delivers a signed claim to whoever will submit it.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn submit(&self, request: RelayClaimRequest) -> Result<B256, RelayError>;
}

/// Relayer that submits directly through its own funded account.
pub struct ContractRelayer {
    contract: SwapContract,
    chain_id: u64,
    guard: ReplayGuard,
}

impl ContractRelayer {
    pub fn new(contract: SwapContract, chain_id: u64) -> Self {
        Self {
            contract,
            chain_id,
            guard: ReplayGuard::new(),
        }
    }

    pub fn address(&self) -> Address {
        self.contract.sender()
    }
}

#[async_trait]
impl RelayTransport for ContractRelayer {
    async fn submit(&self, request: RelayClaimRequest) -> Result<B256, RelayError> {
        let receipt = submit_relay_claim(&self.contract, &self.guard, self.chain_id, &request).await?;
        Ok(receipt.tx_hash)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use swap_keys::commit;

    const CHAIN_ID: u64 = 1337;

    fn fixture() -> (PrivateKeySigner, ContractHandle, SwapParameters, Secret) {
        let claimer_key = PrivateKeySigner::random();
        let maker_secret = Secret::from_bytes([3u8; 32]).unwrap();
        let taker_secret = Secret::from_bytes([4u8; 32]).unwrap();
        let params = SwapParameters::new_eth_swap(
            Address::repeat_byte(0xaa),
            claimer_key.address(),
            commit(&maker_secret),
            commit(&taker_secret),
            U256::from(1_000_000_000_000_000_000u128),
            1_700_000_000,
            Duration::from_secs(3600),
            U256::from(1u64),
        );
        let handle = ContractHandle {
            address: Address::repeat_byte(0x55),
            swap_id: params.swap_id(),
        };
        (claimer_key, handle, params, taker_secret)
    }

    #[test]
    fn signed_request_verifies() {
        let (key, handle, params, secret) = fixture();
        let request = build_relay_claim(&key, &handle, &params, &secret, CHAIN_ID).unwrap();
        assert_eq!(request.fee, relay_fee());
        assert_eq!(request.signature.len(), 65);
        assert!(request.offer_id.is_none());
        verify_relay_claim(&request, CHAIN_ID).unwrap();
        assert_eq!(recover_relay_signer(&request, CHAIN_ID).unwrap(), key.address());
    }

    #[test]
    fn any_altered_field_breaks_verification() {
        let (key, handle, params, secret) = fixture();
        let request = build_relay_claim(&key, &handle, &params, &secret, CHAIN_ID).unwrap();

        let mut altered = request.clone();
        altered.fee = U256::from(RELAY_FEE_WEI + 1);
        assert!(verify_relay_claim(&altered, CHAIN_ID).is_err());

        let mut altered = request.clone();
        altered.swap_creator_addr = Address::repeat_byte(0x56);
        assert!(verify_relay_claim(&altered, CHAIN_ID).is_err());

        let mut altered = request.clone();
        altered.swap.value += U256::from(1u64);
        assert!(verify_relay_claim(&altered, CHAIN_ID).is_err());

        assert!(verify_relay_claim(&request, CHAIN_ID + 1).is_err());
    }

    #[test]
    fn builder_rejects_wrong_key_and_secret() {
        let (_, handle, params, secret) = fixture();
        let stranger = PrivateKeySigner::random();
        assert!(matches!(
            build_relay_claim(&stranger, &handle, &params, &secret, CHAIN_ID),
            Err(RelayError::WrongClaimer { .. })
        ));

        let (key, handle, params, _) = fixture();
        let wrong = Secret::from_bytes([9u8; 32]).unwrap();
        assert!(matches!(
            build_relay_claim(&key, &handle, &params, &wrong, CHAIN_ID),
            Err(RelayError::SecretMismatch)
        ));
    }

    #[test]
    fn replay_guard_rejects_second_submission() {
        let (key, handle, params, secret) = fixture();
        let request = build_relay_claim(&key, &handle, &params, &secret, CHAIN_ID).unwrap();
        let guard = ReplayGuard::new();
        guard.check_and_record(&request, CHAIN_ID).unwrap();
        assert!(matches!(
            guard.check_and_record(&request, CHAIN_ID),
            Err(RelayError::Replay(_))
        ));
        guard.forget(&request, CHAIN_ID);
        guard.check_and_record(&request, CHAIN_ID).unwrap();
    }
}
