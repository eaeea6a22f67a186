//! The ledger client collaborator.
//!
//! The account never talks to a ledger node directly; it goes through
//! [`LedgerClient`]. Queries are idempotent and may be retried with
//! [`with_retries`]. Submissions are never retried by the account, since a
//! retried submission can double-spend.

pub mod rpc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::keyspace::Address;

pub use rpc::RpcLedgerClient;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("Ledger node unreachable: {0}")]
    Unreachable(String),
    #[error("Ledger rejected request: {0}")]
    Rejected(String),
    #[error("Unexpected ledger response: {0}")]
    BadResponse(String),
}

/// Reference to a submitted transaction (bundle tail hash, tx hash, ...).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxRef(pub String);

impl fmt::Display for TxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TransferOutput {
    pub address: Address,
    pub amount: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// Value transfer requested by the caller.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Transfer {
    /// Indices of this account's deposit addresses funding the transfer.
    #[serde(default)]
    pub inputs: Vec<u64>,
    pub outputs: Vec<TransferOutput>,
}

impl Transfer {
    pub fn to(address: Address, amount: u64) -> Self {
        Self {
            inputs: Vec::new(),
            outputs: vec![TransferOutput {
                address,
                amount,
                tag: None,
            }],
        }
    }

    pub fn from_inputs(mut self, inputs: impl IntoIterator<Item = u64>) -> Self {
        self.inputs.extend(inputs);
        self
    }

    pub fn total(&self) -> u64 {
        self.outputs
            .iter()
            .fold(0u64, |acc, o| acc.saturating_add(o.amount))
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TransferState {
    Pending,
    Confirmed,
    /// The ledger dropped or invalidated the transfer.
    Rejected,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub app_name: String,
    #[serde(default)]
    pub app_version: String,
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn node_info(&self) -> Result<NodeInfo, LedgerError>;

    async fn submit_transfer(&self, transfer: &Transfer) -> Result<TxRef, LedgerError>;

    async fn query_balance(&self, address: &Address) -> Result<u64, LedgerError>;

    async fn query_deposits(&self, address: &Address) -> Result<Vec<u64>, LedgerError>;

    async fn transfer_status(&self, tx_ref: &TxRef) -> Result<TransferState, LedgerError>;
}

/// Retry schedule for idempotent ledger queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Runs an idempotent query, retrying with a fixed backoff. Rejections are
/// final; only transport-level failures are retried.
pub async fn with_retries<T, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> Result<T, LedgerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e @ LedgerError::Rejected(_)) => return Err(e),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                warn!("{} failed (attempt {}/{}): {}", what, attempt, attempts, e);
                attempt += 1;
                tokio::time::sleep(policy.backoff).await;
            }
        }
    }
}
