use crate::clock::{format_timestamp, Clock, SystemClock};
use crate::config::CdaConfig;
use crate::deposit::{CdaRecord, Conditions, DepositLink};
use crate::error::Result;
use crate::keyspace::Address;
use crate::ledger::{Transfer, TransferOutput};

use super::{load_seed, open_account};

pub async fn allocate(
    config: &CdaConfig,
    timeout_secs: Option<u64>,
    multi_use: bool,
    expected: Option<u64>,
) -> Result<()> {
    let timeout_at = timeout_secs.map(|secs| SystemClock.now().saturating_add(secs.saturating_mul(1000)));
    let conditions = Conditions::new(timeout_at, multi_use, expected);

    let account = open_account(config, load_seed(config)?)?;
    account.start().await?;
    let allocated = account.allocate_deposit_address(conditions).await;
    account.shutdown().await?;
    let cda = allocated?;

    println!("Deposit address #{}: {}", cda.index, cda.address);
    println!("Link: {}", cda.to_link());
    Ok(())
}

fn describe(record: &CdaRecord) -> String {
    let conditions = record.conditions();
    let expected = conditions
        .expected_amount
        .map(|a| a.to_string())
        .unwrap_or_else(|| "-".into());
    let timeout = conditions
        .timeout_at
        .map(format_timestamp)
        .unwrap_or_else(|| "never".into());
    let mut line = format!(
        "#{:<4} {} {:<13} {}/{} timeout {}",
        record.index(),
        record.address(),
        record.status.to_string(),
        record.received,
        expected,
        timeout
    );
    if conditions.multi_use {
        line.push_str(" multi-use");
    }
    if record.override_approved {
        line.push_str(" approved");
    }
    line
}

pub fn list(config: &CdaConfig, open_only: bool) -> Result<()> {
    let account = open_account(config, load_seed(config)?)?;
    let records: Vec<CdaRecord> = account
        .deposit_addresses()?
        .into_iter()
        .filter(|r| !open_only || r.is_open())
        .collect();

    if records.is_empty() {
        println!("No deposit addresses.");
    }
    for record in &records {
        println!("{}", describe(record));
    }
    Ok(())
}

pub async fn balance(config: &CdaConfig) -> Result<()> {
    let account = open_account(config, load_seed(config)?)?;
    account.start().await?;
    let available = account.available_balance();
    account.shutdown().await?;
    println!("Available balance: {}", available);
    Ok(())
}

pub fn decide(config: &CdaConfig, index: u64) -> Result<()> {
    let account = open_account(config, load_seed(config)?)?;
    let decision = account.decide(index)?;
    if decision.ok {
        println!("#{}: ok to send", index);
    } else {
        println!("#{}: not yet ({})", index, decision.reason.unwrap_or_default());
    }
    Ok(())
}

pub async fn approve(config: &CdaConfig, index: u64) -> Result<()> {
    let account = open_account(config, load_seed(config)?)?;
    account.approve_override(index).await?;
    account.shutdown().await?;
    println!("#{} approved manually", index);
    Ok(())
}

/// Accepts a bare address or a `cda://` link.
fn parse_destination(to: &str) -> Result<Address> {
    if to.starts_with("cda://") {
        Ok(to.parse::<DepositLink>()?.address)
    } else {
        Ok(to.parse()?)
    }
}

pub async fn send(config: &CdaConfig, to: &str, amount: u64, inputs: Vec<u64>, tag: Option<String>) -> Result<()> {
    let transfer = Transfer {
        inputs,
        outputs: vec![TransferOutput {
            address: parse_destination(to)?,
            amount,
            tag,
        }],
    };

    let account = open_account(config, load_seed(config)?)?;
    account.start().await?;
    let sent = account.send(transfer).await;
    account.shutdown().await?;
    let tx_ref = sent?;

    println!("Submitted transfer {}", tx_ref);
    Ok(())
}
