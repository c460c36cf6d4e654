use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::{Address, B256};
use tokio::sync::Mutex;
use tracing::debug;

use super::{ChainBackend, ContractError, SwapCall};

/// Serializes nonce allocation and submission per sending account.
///
/// Shared by every swap that signs with the same key, so two concurrent swaps
/// never race for the same account nonce.
#[derive(Default)]
pub struct NonceManager {
    accounts: Mutex<HashMap<Address, Arc<Mutex<Option<u64>>>>>,
}

impl NonceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn submit<B>(
        &self,
        backend: &B,
        contract: Address,
        call: SwapCall,
    ) -> Result<B256, ContractError>
    where
        B: ChainBackend + ?Sized,
    {
        let slot = {
            let mut accounts = self.accounts.lock().await;
            accounts.entry(backend.sender()).or_default().clone()
        };

        let mut next = slot.lock().await;
        let nonce = match *next {
            Some(nonce) => nonce,
            None => backend.pending_nonce().await?,
        };

        match backend.submit(contract, call, nonce).await {
            Ok(tx_hash) => {
                debug!(sender = %backend.sender(), nonce, %tx_hash, "Submitted transaction");
                *next = Some(nonce + 1);
                Ok(tx_hash)
            }
            Err(err) => {
                // Resync from the node on the next submission.
                *next = None;
                Err(err)
            }
        }
    }
}
