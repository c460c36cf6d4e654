use std::sync::Arc;
use std::time::Duration;

use swap_coordinator::config::{
    swap_timeout_for_env, validate_nonzero, validate_rpc_url, Environment, SwapConfig,
    MAINNET_CHAIN_ID, SEPOLIA_CHAIN_ID,
};
use swap_coordinator::contract::memory::MemoryChain;
use swap_coordinator::contract::nonce::NonceManager;
use swap_coordinator::contract::SwapContract;
use swap_coordinator::harness::expected_swap_creator;
use swap_coordinator::machine::SwapContext;
use swap_coordinator::retry::RetryConfig;
use swap_coordinator::timeout::ManualClock;

#[test]
fn rpc_url_requires_http() {
    assert!(validate_rpc_url("rpc", "http://127.0.0.1:8545").is_ok());
    assert!(validate_rpc_url("rpc", "https://rpc.sepolia.org").is_ok());
    assert!(validate_rpc_url("rpc", "ws://localhost").is_err());
    assert!(validate_rpc_url("rpc", "localhost").is_err());
}

#[test]
fn nonzero_validation() {
    assert!(validate_nonzero("swap timeout", 1).is_ok());
    assert!(validate_nonzero("swap timeout", 0).is_err());
}

#[test]
fn stagenet_defaults() {
    let config = SwapConfig::for_env(Environment::Stagenet);
    assert_eq!(config.chain_id, SEPOLIA_CHAIN_ID);
    assert_eq!(
        config.forwarder_addr.to_string().to_lowercase(),
        "0xa030e074b8398005a454cb7c51e9b7cdb966744a"
    );
    assert!(config.data_dir.ends_with(".atomicswap/stagenet"));
    assert!(config.eth_key_file().ends_with("stagenet/eth.key"));
}

#[test]
fn swap_timeouts_per_environment() {
    assert_eq!(swap_timeout_for_env(Environment::Mainnet), Duration::from_secs(3600));
    assert_eq!(swap_timeout_for_env(Environment::Development), Duration::from_secs(120));
}

#[test]
fn deadline_margin_covers_confirmation_depth() {
    let mut config = SwapConfig::development();
    assert_eq!(config.deadline_margin(), Duration::from_secs(12));
    config.confirmations = 3;
    assert_eq!(config.deadline_margin(), Duration::from_secs(36));
}

#[test]
fn retry_margin_follows_network_confirmations() {
    let mainnet = SwapConfig::mainnet();
    assert_eq!(
        RetryConfig::for_network(&mainnet).deadline_margin,
        Duration::from_secs(144)
    );
    assert_eq!(mainnet.confirmation().depth, 12);
    assert_eq!(
        RetryConfig::for_network(&SwapConfig::development()).deadline_margin,
        Duration::from_secs(12)
    );
}

#[test]
fn network_context_uses_scaled_margin() {
    let config = SwapConfig::mainnet();
    let clock = ManualClock::new(0);
    let chain = MemoryChain::new(MAINNET_CHAIN_ID, clock.clone());
    let contract = SwapContract::new(
        chain.connect(config.forwarder_addr),
        Arc::new(NonceManager::new()),
        config.confirmation(),
        config.swap_creator_addr,
    );
    let ctx = SwapContext::for_network(contract, clock, &config, expected_swap_creator());
    assert_eq!(ctx.chain_id, MAINNET_CHAIN_ID);
    assert_eq!(ctx.retry.deadline_margin, Duration::from_secs(144));
}
