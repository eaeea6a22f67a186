use tracing::info;

use super::{load_seed, open_account};
use crate::config::CdaConfig;
use crate::error::{AccountError, Result};

/// Starts the account and keeps it running until Ctrl-C.
pub async fn run(config: &CdaConfig) -> Result<()> {
    let account = open_account(config, load_seed(config)?)?;
    account.start().await?;
    info!(
        "Reconciling every {}s against {}",
        config.reconcile.interval_secs, config.node.rpc_url
    );

    let signal = tokio::signal::ctrl_c().await;
    info!("🛑 Shutting down...");
    account.shutdown().await?;
    signal.map_err(|e| AccountError::ResourceUnavailable(format!("signal handler: {}", e)))
}

pub async fn sync(config: &CdaConfig) -> Result<()> {
    let account = open_account(config, load_seed(config)?)?;
    account.start().await?;

    let outcome = async {
        let reconciled = account.sync().await?;
        let confirmed = account.confirm().await?;
        Ok::<_, AccountError>((reconciled, confirmed))
    }
    .await;
    account.shutdown().await?;
    let (reconciled, confirmed) = outcome?;

    println!(
        "Checked {} deposit addresses, {} status changes",
        reconciled.checked, reconciled.transitions
    );
    println!(
        "Transfers: {} confirmed, {} rejected",
        confirmed.confirmed, confirmed.rejected
    );
    println!("Available balance: {}", account.available_balance());
    Ok(())
}
