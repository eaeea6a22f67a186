use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::{PendingTransfer, Store, StoreError, StoreState};
use crate::deposit::CdaRecord;
use crate::keyspace::Address;
use crate::ledger::TxRef;

/// Ephemeral store. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_index: u64,
    cached_balance: u64,
    cdas: BTreeMap<u64, CdaRecord>,
    addresses: HashMap<Address, u64>,
    pending: BTreeMap<TxRef, PendingTransfer>,
}

impl Inner {
    fn put(&mut self, record: &CdaRecord) {
        self.addresses.insert(record.address().clone(), record.index());
        self.cdas.insert(record.index(), record.clone());
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }
}

impl Store for MemoryStore {
    fn get_cda(&self, index: u64) -> Result<Option<CdaRecord>, StoreError> {
        Ok(self.lock()?.cdas.get(&index).cloned())
    }

    fn find_by_address(&self, address: &Address) -> Result<Option<CdaRecord>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .addresses
            .get(address)
            .and_then(|index| inner.cdas.get(index))
            .cloned())
    }

    fn put_cda(&self, record: &CdaRecord) -> Result<(), StoreError> {
        self.lock()?.put(record);
        Ok(())
    }

    fn list_cdas(&self) -> Result<Vec<CdaRecord>, StoreError> {
        Ok(self.lock()?.cdas.values().cloned().collect())
    }

    fn next_index(&self) -> Result<u64, StoreError> {
        Ok(self.lock()?.next_index)
    }

    fn reserve_next_index(&self) -> Result<u64, StoreError> {
        let mut inner = self.lock()?;
        let index = inner.next_index;
        inner.next_index += 1;
        Ok(index)
    }

    fn cached_balance(&self) -> Result<u64, StoreError> {
        Ok(self.lock()?.cached_balance)
    }

    fn set_cached_balance(&self, balance: u64) -> Result<(), StoreError> {
        self.lock()?.cached_balance = balance;
        Ok(())
    }

    fn list_pending_transfers(&self) -> Result<Vec<PendingTransfer>, StoreError> {
        Ok(self.lock()?.pending.values().cloned().collect())
    }

    fn put_pending_transfer(&self, pending: &PendingTransfer) -> Result<(), StoreError> {
        self.lock()?.pending.insert(pending.tx_ref.clone(), pending.clone());
        Ok(())
    }

    fn remove_pending_transfer(&self, tx_ref: &TxRef) -> Result<(), StoreError> {
        self.lock()?.pending.remove(tx_ref);
        Ok(())
    }

    fn commit_spend(&self, records: &[CdaRecord], pending: &PendingTransfer) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        for record in records {
            inner.put(record);
        }
        inner.pending.insert(pending.tx_ref.clone(), pending.clone());
        Ok(())
    }

    fn load_state(&self) -> Result<StoreState, StoreError> {
        let inner = self.lock()?;
        Ok(StoreState {
            next_index: inner.next_index,
            cached_balance: inner.cached_balance,
            cdas: inner.cdas.values().cloned().collect(),
            pending: inner.pending.values().cloned().collect(),
        })
    }

    fn replace_state(&self, state: &StoreState) -> Result<(), StoreError> {
        let mut fresh = Inner {
            next_index: state.next_index,
            cached_balance: state.cached_balance,
            ..Default::default()
        };
        for record in &state.cdas {
            fresh.put(record);
        }
        for p in &state.pending {
            fresh.pending.insert(p.tx_ref.clone(), p.clone());
        }
        *self.lock()? = fresh;
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
