use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::tasks::BackgroundTask;
use super::AccountInner;
use crate::deposit::{CdaRecord, CdaStatus};
use crate::error::Result;
use crate::ledger::{with_retries, TxRef};

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// CDAs queried on the ledger.
    pub checked: usize,
    /// Status changes applied.
    pub transitions: usize,
    pub balance: u64,
}

impl AccountInner {
    /// Pulls deposits and balances from the ledger without holding the lock,
    /// then applies them under it. A failed query aborts the pass before
    /// anything is written.
    pub(crate) async fn reconcile(&self) -> Result<ReconcileReport> {
        let retry = self.settings.retry;
        let unconfirmed: HashSet<TxRef> = self
            .store
            .list_pending_transfers()?
            .into_iter()
            .map(|p| p.tx_ref)
            .collect();
        let candidates = self.funded_cdas(&unconfirmed)?;

        let mut observed = Vec::new();
        let mut balance = 0u64;
        for record in &candidates {
            let address = record.address();
            let held = with_retries(retry, "balance query", || self.ledger.query_balance(address)).await?;
            balance = balance.saturating_add(held);

            if record.is_open() {
                let deposits =
                    with_retries(retry, "deposit query", || self.ledger.query_deposits(address)).await?;
                let received = deposits.iter().fold(0u64, |acc, d| acc.saturating_add(*d));
                observed.push((record.index(), received));
            }
        }

        let _guard = self.write_lock.lock().await;
        let now = self.clock.now();
        let mut transitions = 0;
        for (index, received) in observed {
            let Some(mut record) = self.store.get_cda(index)? else {
                continue;
            };
            let before = (record.status, record.received);
            if record.observe_deposits(received, now) {
                transitions += 1;
                info!(
                    "Deposit address #{} {} -> {} (received {})",
                    index, before.0, record.status, record.received
                );
            }
            if (record.status, record.received) != before {
                self.store.put_cda(&record)?;
            }
        }
        self.store.set_cached_balance(balance)?;
        self.refresh_counters()?;

        let report = ReconcileReport {
            checked: candidates.len(),
            transitions,
            balance,
        };
        debug!("Reconciliation pass: {:?}", report);
        Ok(report)
    }

    /// Records whose funds still belong to the account: unspent ones that are
    /// open or were funded, plus inputs of sends listed in `unconfirmed`.
    fn funded_cdas(&self, unconfirmed: &HashSet<TxRef>) -> Result<Vec<CdaRecord>> {
        Ok(self
            .store
            .list_cdas()?
            .into_iter()
            .filter(|r| match r.status {
                CdaStatus::Spent => r.spend_ref.as_ref().is_some_and(|tx| unconfirmed.contains(tx)),
                _ => r.is_open() || r.received > 0,
            })
            .collect())
    }

    /// Ledger balance summed over [`Self::funded_cdas`].
    pub(crate) async fn held_balance(&self, unconfirmed: &HashSet<TxRef>) -> Result<u64> {
        let mut balance = 0u64;
        for record in self.funded_cdas(unconfirmed)? {
            let address = record.address();
            let held =
                with_retries(self.settings.retry, "balance query", || self.ledger.query_balance(address)).await?;
            balance = balance.saturating_add(held);
        }
        Ok(balance)
    }
}

/// Periodic reconciliation.
pub struct Reconciler {
    inner: Arc<AccountInner>,
}

impl Reconciler {
    pub(crate) fn new(inner: Arc<AccountInner>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl BackgroundTask for Reconciler {
    fn name(&self) -> &'static str {
        "reconcile"
    }

    fn interval(&self) -> Duration {
        self.inner.settings.reconcile_interval
    }

    async fn tick(&self) -> Result<()> {
        self.inner.reconcile().await.map(|_| ())
    }
}
