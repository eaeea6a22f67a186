//! Durable account state.
//!
//! The store keeps every CDA record ever issued, the next unused index, the
//! last reconciled balance and the transfers still waiting for confirmation.
//! [`Store::reserve_next_index`] commits on its own: a crash between
//! reservation and [`Store::put_cda`] leaves a gap, never a reused index.

pub mod memory;
pub mod sled_store;
pub mod snapshot;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ops::Range;
use thiserror::Error;

use crate::clock::Timestamp;
use crate::deposit::{CdaRecord, CdaStatus};
use crate::keyspace::{Address, SeedReference};
use crate::ledger::TxRef;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// A submitted transfer the ledger has not confirmed yet.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PendingTransfer {
    pub tx_ref: TxRef,
    pub amount: u64,
    /// Input CDAs with the status they had before the send.
    pub inputs: Vec<(u64, CdaStatus)>,
    pub submitted_at: Timestamp,
}

/// Everything the store holds, in one value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreState {
    pub next_index: u64,
    pub cached_balance: u64,
    /// Ordered by index.
    pub cdas: Vec<CdaRecord>,
    pub pending: Vec<PendingTransfer>,
}

impl StoreState {
    /// Checks internal consistency: unique indices and addresses, and a
    /// counter past every issued index.
    pub fn validate(&self) -> Result<(), String> {
        let mut indices = HashSet::new();
        let mut addresses = HashSet::new();
        for record in &self.cdas {
            if !indices.insert(record.index()) {
                return Err(format!("duplicate index {}", record.index()));
            }
            if !addresses.insert(record.address()) {
                return Err(format!("duplicate address {}", record.address()));
            }
        }
        if let Some(max) = self.cdas.iter().map(|r| r.index()).max() {
            if self.next_index <= max {
                return Err(format!(
                    "next index {} does not exceed highest issued index {}",
                    self.next_index, max
                ));
            }
        }
        Ok(())
    }

    /// Reserved indices with no record (left by failed allocations), as
    /// half-open runs. There is at most one run more than there are records.
    pub fn gaps(&self) -> Vec<Range<u64>> {
        let mut indices: Vec<u64> = self.cdas.iter().map(|r| r.index()).collect();
        indices.sort_unstable();

        let mut runs = Vec::new();
        let mut cursor = 0u64;
        for index in indices {
            if index > cursor {
                runs.push(cursor..index);
            }
            cursor = cursor.max(index.saturating_add(1));
        }
        if self.next_index > cursor {
            runs.push(cursor..self.next_index);
        }
        runs
    }

    pub fn pending_outgoing(&self) -> u64 {
        self.pending
            .iter()
            .fold(0u64, |acc, p| acc.saturating_add(p.amount))
    }
}

pub trait Store: Send + Sync {
    fn get_cda(&self, index: u64) -> Result<Option<CdaRecord>, StoreError>;

    fn find_by_address(&self, address: &Address) -> Result<Option<CdaRecord>, StoreError>;

    /// Inserts or replaces a record.
    fn put_cda(&self, record: &CdaRecord) -> Result<(), StoreError>;

    /// All records ordered by index.
    fn list_cdas(&self) -> Result<Vec<CdaRecord>, StoreError>;

    /// Records still accepting deposits.
    fn list_open_cdas(&self) -> Result<Vec<CdaRecord>, StoreError> {
        Ok(self
            .list_cdas()?
            .into_iter()
            .filter(|r| r.is_open())
            .collect())
    }

    fn next_index(&self) -> Result<u64, StoreError>;

    /// Atomically hands out the next index and advances the counter.
    fn reserve_next_index(&self) -> Result<u64, StoreError>;

    fn cached_balance(&self) -> Result<u64, StoreError>;

    fn set_cached_balance(&self, balance: u64) -> Result<(), StoreError>;

    fn list_pending_transfers(&self) -> Result<Vec<PendingTransfer>, StoreError>;

    fn put_pending_transfer(&self, pending: &PendingTransfer) -> Result<(), StoreError>;

    fn remove_pending_transfer(&self, tx_ref: &TxRef) -> Result<(), StoreError>;

    /// Writes the spent inputs of a send together with its pending transfer.
    fn commit_spend(&self, records: &[CdaRecord], pending: &PendingTransfer) -> Result<(), StoreError>;

    fn load_state(&self) -> Result<StoreState, StoreError>;

    /// Replaces everything with `state`, all or nothing.
    fn replace_state(&self, state: &StoreState) -> Result<(), StoreError>;

    fn flush(&self) -> Result<(), StoreError>;

    fn export_snapshot(&self, account_id: &str, seed: SeedReference) -> Result<Vec<u8>, StoreError> {
        snapshot::encode(account_id, seed, &self.load_state()?)
    }
}
