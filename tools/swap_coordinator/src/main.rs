use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use swap_keys::Secret;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use swap_coordinator::config::{validate_rpc_url, Environment, SwapConfig};
use swap_coordinator::contract::ethereum::EthereumBackend;
use swap_coordinator::contract::verify::{check_swap_creator_code, ExpectedContract};
use swap_coordinator::contract::nonce::NonceManager;
use swap_coordinator::contract::{ChainBackend, ContractHandle, SwapContract};
use swap_coordinator::daemon::{DaemonService, RuntimeBackend};
use swap_coordinator::events::ChainEventPoller;
use swap_coordinator::harness::{lock_proof, HarnessConfig, SwapHarness};
use swap_coordinator::machine::{SwapContext, SwapEvent, SwapOptions, SwapSetup};
use swap_coordinator::params::{SwapId, SwapParameters};
use swap_coordinator::registry::{Outbound, SwapRegistry, SwapStatus};
use swap_coordinator::state::{Role, SwapState};
use swap_coordinator::timeout::{Clock, SystemClock};

const EVENT_POLL_INTERVAL: Duration = Duration::from_secs(6);

#[derive(Parser)]
#[command(name = "swap-coordinator", version, about = "ETH/XMR atomic swap coordinator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one swap end to end against an in-memory chain
    Demo(DemoArgs),
    /// Print version and network information for an environment
    Version(VersionArgs),
    /// Check that a deployed swap creator matches the expected bytecode
    VerifyContract(VerifyContractArgs),
    /// Pick up a swap from its record against a live node and drive it to the end
    Resume(ResumeArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Scenario {
    /// Both sides lock, the maker marks ready, the taker claims
    Happy,
    /// Taker claims through a relayer
    Relayed,
    /// Counter-asset never arrives; the maker refunds before t0
    MakerTimeout,
    /// Taker never claims; the maker refunds at t1
    TakerTimeout,
    /// Maker deploys to a contract that is not the swap creator
    MaliciousContract,
}

#[derive(Parser)]
struct DemoArgs {
    #[arg(long, value_enum, default_value_t = Scenario::Happy)]
    scenario: Scenario,
    /// Swap value in wei
    #[arg(long, default_value_t = 1_000_000_000_000_000_000)]
    value: u128,
    /// Counter-asset amount in piconero
    #[arg(long, default_value_t = 1_000_000_000_000)]
    xmr_amount: u64,
    /// Seconds between the two timelocks
    #[arg(long, default_value_t = 120)]
    swap_timeout: u64,
}

#[derive(Parser)]
struct VersionArgs {
    #[arg(long, value_enum, default_value_t = Environment::Development)]
    env: Environment,
}

#[derive(Parser)]
struct VerifyContractArgs {
    /// Ethereum RPC URL
    #[arg(long, default_value = "http://127.0.0.1:8545")]
    rpc: String,
    /// Swap creator address
    #[arg(long)]
    address: Address,
    /// JSON file with the expected masked bytecode and forwarder slots
    #[arg(long)]
    expected: PathBuf,
}

#[derive(Parser)]
struct ResumeArgs {
    #[arg(long, value_enum, default_value_t = Environment::Stagenet)]
    env: Environment,
    /// Ethereum RPC URL
    #[arg(long, default_value = "http://127.0.0.1:8545")]
    rpc: String,
    /// Hex private key; defaults to the environment's eth.key
    #[arg(long)]
    key_file: Option<PathBuf>,
    /// JSON swap record
    #[arg(long)]
    swap: PathBuf,
    /// JSON file with the expected masked bytecode and forwarder slots
    #[arg(long)]
    expected: PathBuf,
}

/// Everything one side needs to pick a swap back up.
#[derive(Deserialize)]
struct SwapRecord {
    role: Role,
    params: SwapParameters,
    /// This side's secret scalar, little-endian.
    secret: B256,
    counter_amount: u64,
    /// Swap creator holding the swap, if other than the environment default.
    contract_address: Option<Address>,
    #[serde(default)]
    options: SwapOptions,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Demo(args) => run_demo(args).await,
        Command::Version(args) => print_version(args),
        Command::VerifyContract(args) => verify_contract(args).await,
        Command::Resume(args) => resume_swap(args).await,
    }
}

async fn run_demo(args: DemoArgs) -> Result<()> {
    if args.swap_timeout <= 30 {
        bail!("--swap-timeout must exceed 30 seconds to leave room for the deadline margin");
    }
    let config = HarnessConfig {
        swap_timeout: Duration::from_secs(args.swap_timeout),
        taker_relayer: matches!(args.scenario, Scenario::Relayed),
        rogue_maker_contract: matches!(args.scenario, Scenario::MaliciousContract),
        ..HarnessConfig::default()
    };
    let margin = config.retry.deadline_margin.as_secs();
    let harness = SwapHarness::new(config);

    let (maker, mut taker) = harness.new_swap(U256::from(args.value), args.xmr_amount)?;
    if matches!(args.scenario, Scenario::TakerTimeout) {
        taker.options = SwapOptions {
            auto_claim: false,
            ..taker.options
        };
    }
    let params = maker.params.clone();
    let swap_id = harness.open(maker, taker).await?;
    info!(%swap_id, scenario = ?args.scenario, "Demo swap opened");

    harness
        .maker
        .registry
        .submit(swap_id, SwapEvent::Deploy)
        .await
        .context("maker failed to deploy the swap")?;

    match args.scenario {
        Scenario::Happy | Scenario::Relayed => {
            lock_counter_asset(&harness, swap_id, &params, args.xmr_amount).await?;
        }
        Scenario::MakerTimeout | Scenario::MaliciousContract => {
            // Give the taker time to inspect the announced contract first.
            tokio::time::sleep(Duration::from_millis(100)).await;
            harness.clock.set(params.timeout_0 - margin);
            harness.maker.registry.wait_for_terminal(swap_id).await?;
            harness.clock.set(params.timeout_0);
        }
        Scenario::TakerTimeout => {
            lock_counter_asset(&harness, swap_id, &params, args.xmr_amount).await?;
            harness
                .taker
                .registry
                .wait_for_state(swap_id, SwapState::Ready)
                .await?;
            harness.clock.set(params.timeout_1);
        }
    }

    let wait = Duration::from_secs(10);
    let maker_status = wait_terminal(&harness.maker.registry, swap_id, wait).await?;
    let taker_status = wait_terminal(&harness.taker.registry, swap_id, wait).await?;
    println!("clock: {}", harness.clock.now());
    println!("maker: {}", serde_json::to_string_pretty(&maker_status)?);
    println!("taker: {}", serde_json::to_string_pretty(&taker_status)?);
    println!("maker balance: {} wei", harness.chain.balance(harness.maker.address()));
    println!("taker balance: {} wei", harness.chain.balance(harness.taker.address()));
    if let Some(relayer) = harness.relayer {
        println!("relayer balance: {} wei", harness.chain.balance(relayer));
    }

    harness.shutdown().await;
    Ok(())
}

async fn lock_counter_asset(
    harness: &SwapHarness,
    swap_id: SwapId,
    params: &SwapParameters,
    amount: u64,
) -> Result<()> {
    harness
        .taker
        .registry
        .submit(swap_id, SwapEvent::CounterAssetLocked(lock_proof(params, amount)?))
        .await
        .context("taker failed to record the counter-asset lock")?;
    Ok(())
}

async fn wait_terminal(
    registry: &Arc<SwapRegistry>,
    swap_id: SwapId,
    wait: Duration,
) -> Result<SwapStatus> {
    tokio::time::timeout(wait, registry.wait_for_terminal(swap_id))
        .await
        .map_err(|_| anyhow!("swap {swap_id} did not finish within {wait:?}"))?
        .map_err(Into::into)
}

fn print_version(args: VersionArgs) -> Result<()> {
    let config = SwapConfig::for_env(args.env);
    let timeout = config.swap_timeout;
    let service = DaemonService::new(Arc::new(RuntimeBackend::new(config)), timeout);
    println!("{}", serde_json::to_string_pretty(&service.version())?);
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &PathBuf) -> Result<T> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

async fn verify_contract(args: VerifyContractArgs) -> Result<()> {
    validate_rpc_url("--rpc", &args.rpc)?;
    let expected: ExpectedContract = read_json(&args.expected)?;

    let backend = EthereumBackend::read_only(&args.rpc)?;
    let code = backend.code_at(args.address).await?;
    let forwarder = check_swap_creator_code(&code, &expected)
        .with_context(|| format!("contract at {} is not the swap creator", args.address))?;
    if forwarder != expected.trusted_forwarder {
        bail!(
            "contract at {} trusts forwarder {forwarder}, expected {}",
            args.address,
            expected.trusted_forwarder
        );
    }
    println!("swap creator at {} verified, forwarder {forwarder}", args.address);
    Ok(())
}

async fn resume_swap(args: ResumeArgs) -> Result<()> {
    validate_rpc_url("--rpc", &args.rpc)?;
    let config = SwapConfig::for_env(args.env);
    let key_file = args.key_file.unwrap_or_else(|| config.eth_key_file());
    let key = std::fs::read_to_string(&key_file)
        .with_context(|| format!("read {}", key_file.display()))?;
    let record: SwapRecord = read_json(&args.swap)?;
    let expected: ExpectedContract = read_json(&args.expected)?;

    let backend = EthereumBackend::connect(&args.rpc, &key)?;
    let chain_id = backend.chain_id().await?;
    if chain_id != config.chain_id {
        bail!("node is on chain {chain_id}, {} expects {}", config.env, config.chain_id);
    }
    let address = record.contract_address.unwrap_or(config.swap_creator_addr);
    if address.is_zero() {
        bail!("no swap creator deployed for {}; pass contract_address in the record", config.env);
    }
    let contract = SwapContract::new(
        Arc::new(backend),
        Arc::new(NonceManager::new()),
        config.confirmation(),
        address,
    );

    let mut ctx = SwapContext::for_network(contract.clone(), Arc::new(SystemClock), &config, expected);
    if record.role == Role::Taker {
        let signer: PrivateKeySigner = key.trim().parse().context("parse private key")?;
        ctx = ctx.with_claimer_key(signer);
    }
    let (registry, mut outbound) = SwapRegistry::new(Arc::new(ctx));

    let swap_id = record.params.swap_id();
    let secret = Secret::from_canonical_bytes(record.secret.0)?;
    let mut setup = SwapSetup::new(record.role, record.params, secret, record.counter_amount)
        .with_options(record.options);
    if let Some(address) = record.contract_address {
        setup = setup.with_handle(ContractHandle { address, swap_id });
    }
    registry.resume(setup).await?;
    info!(%swap_id, env = %config.env, "Swap resumed");

    let poller = ChainEventPoller::new(registry.clone(), contract, EVENT_POLL_INTERVAL);
    let poller = tokio::spawn(poller.run(registry.shutdown_signal()));

    let finished = registry.wait_for_terminal(swap_id);
    tokio::pin!(finished);
    loop {
        tokio::select! {
            Some(Outbound { message, .. }) = outbound.recv() => {
                // Forwarded to the counterparty by the operator.
                println!("{}", message.to_json()?);
            }
            status = &mut finished => {
                println!("{}", serde_json::to_string_pretty(&status?)?);
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!(%swap_id, "Interrupted; the swap can be resumed again");
                break;
            }
        }
    }

    registry.shutdown().await;
    if let Err(err) = poller.await {
        warn!(error = %err, "Event poller ended abnormally");
    }
    Ok(())
}
