use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::tasks::BackgroundTask;
use super::AccountInner;
use crate::deposit::CdaStatus;
use crate::error::Result;
use crate::ledger::{with_retries, TransferState, TxRef};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfirmReport {
    pub confirmed: usize,
    pub rejected: usize,
}

impl AccountInner {
    /// Settles pending transfers the ledger has decided on. Transfers whose
    /// status cannot be read stay pending until a later pass.
    ///
    /// A confirmed transfer takes its inputs' funds out of the cached balance
    /// in the same critical section that drops it from the pending total.
    pub(crate) async fn confirm_pending(&self) -> Result<ConfirmReport> {
        let pending = self.store.list_pending_transfers()?;
        let mut settled = Vec::new();
        for transfer in &pending {
            let status = with_retries(self.settings.retry, "transfer status", || {
                self.ledger.transfer_status(&transfer.tx_ref)
            })
            .await;
            match status {
                Ok(TransferState::Pending) => {}
                Ok(state) => settled.push((transfer.clone(), state)),
                Err(e) => warn!("Could not check transfer {}: {}", transfer.tx_ref, e),
            }
        }

        let mut report = ConfirmReport::default();
        if settled.is_empty() {
            return Ok(report);
        }

        let mut balance = None;
        if settled.iter().any(|(_, state)| *state == TransferState::Confirmed) {
            let still_unconfirmed: HashSet<TxRef> = pending
                .iter()
                .filter(|p| {
                    !settled
                        .iter()
                        .any(|(t, state)| *state == TransferState::Confirmed && t.tx_ref == p.tx_ref)
                })
                .map(|p| p.tx_ref.clone())
                .collect();
            match self.held_balance(&still_unconfirmed).await {
                Ok(held) => balance = Some(held),
                Err(e) => {
                    warn!("Could not refresh balance, confirmations wait for the next pass: {}", e);
                    settled.retain(|(_, state)| *state == TransferState::Rejected);
                    if settled.is_empty() {
                        return Ok(report);
                    }
                }
            }
        }

        let _guard = self.write_lock.lock().await;
        for (transfer, state) in settled {
            if state == TransferState::Rejected {
                let mut restored = 0;
                for &(index, prior) in &transfer.inputs {
                    let Some(mut record) = self.store.get_cda(index)? else {
                        continue;
                    };
                    if record.status == CdaStatus::Spent && record.spend_ref.as_ref() == Some(&transfer.tx_ref) {
                        record.status = prior;
                        record.spend_ref = None;
                        self.store.put_cda(&record)?;
                        restored += 1;
                    }
                }
                warn!(
                    "Transfer {} was rejected by the ledger, {} inputs restored",
                    transfer.tx_ref, restored
                );
                report.rejected += 1;
            } else {
                info!("✅ Transfer {} confirmed", transfer.tx_ref);
                report.confirmed += 1;
            }
            self.store.remove_pending_transfer(&transfer.tx_ref)?;
        }
        if let Some(balance) = balance {
            self.store.set_cached_balance(balance)?;
        }
        self.refresh_counters()?;
        Ok(report)
    }
}

/// Periodic confirmation of submitted transfers.
pub struct ConfirmationWatcher {
    inner: Arc<AccountInner>,
}

impl ConfirmationWatcher {
    pub(crate) fn new(inner: Arc<AccountInner>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl BackgroundTask for ConfirmationWatcher {
    fn name(&self) -> &'static str {
        "confirm"
    }

    fn interval(&self) -> Duration {
        self.inner.settings.confirm_interval
    }

    async fn tick(&self) -> Result<()> {
        self.inner.confirm_pending().await.map(|_| ())
    }
}
