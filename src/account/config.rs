use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::error::{AccountError, Result};
use crate::keyspace::Seed;
use crate::ledger::{LedgerClient, RetryPolicy};
use crate::oracle::Decider;
use crate::store::Store;

/// Background task timing and ledger query retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountSettings {
    pub reconcile_interval: Duration,
    pub confirm_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for AccountSettings {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(30),
            confirm_interval: Duration::from_secs(15),
            retry: RetryPolicy::default(),
        }
    }
}

impl AccountSettings {
    pub fn validate(&self) -> Result<()> {
        if self.reconcile_interval.is_zero() {
            return Err(AccountError::InvalidConfig("reconcile interval must be positive".into()));
        }
        if self.confirm_interval.is_zero() {
            return Err(AccountError::InvalidConfig("confirm interval must be positive".into()));
        }
        if self.retry.attempts == 0 {
            return Err(AccountError::InvalidConfig("retry attempts must be at least 1".into()));
        }
        Ok(())
    }
}

/// Everything an [`Account`](super::Account) is built from.
pub struct AccountConfig {
    pub ledger: Arc<dyn LedgerClient>,
    pub store: Arc<dyn Store>,
    pub seed: Seed,
    pub clock: Arc<dyn Clock>,
    pub deciders: Vec<Box<dyn Decider>>,
    pub settings: AccountSettings,
}
