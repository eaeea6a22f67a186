pub mod keys;
pub mod node;
pub mod tx;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::account::{Account, AccountConfig};
use crate::clock::SystemClock;
use crate::config::CdaConfig;
use crate::error::{AccountError, Result};
use crate::keyspace::Seed;
use crate::ledger::RpcLedgerClient;
use crate::oracle::TimeDecider;
use crate::store::SledStore;

#[derive(Parser)]
#[command(name = "cda-account")]
#[command(about = "Conditional deposit address account", long_about = None)]
pub struct Cli {
    /// Settings file
    #[arg(long, global = true, default_value = "cda.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a new seed and write it to the seed file
    Init {
        /// Overwrite an existing seed file
        #[arg(long)]
        force: bool,
    },
    /// Run background reconciliation until interrupted
    Run,
    /// Run one reconciliation and one confirmation pass
    Sync,
    /// Allocate a new conditional deposit address
    Allocate {
        /// Seconds from now until the address times out
        #[arg(long)]
        timeout_secs: Option<u64>,
        #[arg(long)]
        multi_use: bool,
        #[arg(long)]
        expected: Option<u64>,
    },
    /// List deposit addresses
    List {
        /// Only addresses still accepting deposits
        #[arg(long)]
        open: bool,
    },
    /// Show the available balance
    Balance,
    /// Ask the oracle whether a deposit address may be spent
    Decide { index: u64 },
    /// Manually approve a deposit address, bypassing the oracle
    Approve { index: u64 },
    /// Send funds
    Send {
        /// Destination address or cda:// link
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: u64,
        /// Deposit address index to spend from (repeatable)
        #[arg(long = "from")]
        inputs: Vec<u64>,
        #[arg(long)]
        tag: Option<String>,
    },
    /// Export the account state to a snapshot file
    Export {
        path: PathBuf,
        /// How the seed is stored in the snapshot
        #[arg(long, value_enum, default_value = "fingerprint")]
        seed: SeedMode,
        #[arg(long)]
        passphrase: Option<String>,
    },
    /// Replace the account state with a snapshot file
    Import {
        path: PathBuf,
        /// Passphrase for a snapshot carrying an encrypted seed
        #[arg(long)]
        passphrase: Option<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeedMode {
    Fingerprint,
    Plain,
    Encrypted,
}

pub async fn dispatch(command: Commands, config: &CdaConfig) -> Result<()> {
    match command {
        Commands::Init { force } => keys::init(config, force),
        Commands::Run => node::run(config).await,
        Commands::Sync => node::sync(config).await,
        Commands::Allocate {
            timeout_secs,
            multi_use,
            expected,
        } => tx::allocate(config, timeout_secs, multi_use, expected).await,
        Commands::List { open } => tx::list(config, open),
        Commands::Balance => tx::balance(config).await,
        Commands::Decide { index } => tx::decide(config, index),
        Commands::Approve { index } => tx::approve(config, index).await,
        Commands::Send {
            to,
            amount,
            inputs,
            tag,
        } => tx::send(config, &to, amount, inputs, tag).await,
        Commands::Export {
            path,
            seed,
            passphrase,
        } => keys::export(config, &path, seed, passphrase).await,
        Commands::Import { path, passphrase } => keys::import(config, &path, passphrase).await,
    }
}

pub(crate) fn load_seed(config: &CdaConfig) -> Result<Seed> {
    let path = &config.account.seed_file;
    let text = std::fs::read_to_string(path).map_err(|e| {
        AccountError::ResourceUnavailable(format!("seed file '{}': {} (run `init` first)", path, e))
    })?;
    Ok(Seed::parse(&text)?)
}

pub(crate) fn seed_file_exists(config: &CdaConfig) -> bool {
    Path::new(&config.account.seed_file).exists()
}

/// Wires the account to the sled store, the RPC ledger and the system clock.
pub(crate) fn open_account(config: &CdaConfig, seed: Seed) -> Result<Account> {
    let store = SledStore::open(&config.account.db_path)
        .map_err(|e| AccountError::ResourceUnavailable(e.to_string()))?;
    let ledger = RpcLedgerClient::new(config.node.rpc_url.clone(), config.rpc_timeout())
        .map_err(|e| AccountError::ResourceUnavailable(e.to_string()))?;
    let clock = Arc::new(SystemClock);

    Account::new(AccountConfig {
        ledger: Arc::new(ledger),
        store: Arc::new(store),
        seed,
        clock: clock.clone(),
        deciders: vec![Box::new(TimeDecider::new(clock, config.oracle_threshold()))],
        settings: config.settings(),
    })
}
