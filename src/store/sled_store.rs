use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::{Db, IVec, Tree};
use std::path::Path;
use tracing::info;

use super::{PendingTransfer, Store, StoreError, StoreState};
use crate::deposit::CdaRecord;
use crate::keyspace::Address;
use crate::ledger::TxRef;

const NEXT_INDEX: &[u8] = b"next_index";
const CACHED_BALANCE: &[u8] = b"cached_balance";

/// On-disk store backed by sled. One tree per kind of value; record values
/// are bincode encoded.
pub struct SledStore {
    db: Db,
    cdas: Tree,
    addresses: Tree,
    pending: Tree,
    meta: Tree,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let db = sled::open(path)
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", path.display(), e)))?;
        info!("Opened account store at {}", path.display());
        Self::from_db(db)
    }

    /// A throwaway database, removed when dropped.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self, StoreError> {
        Ok(Self {
            cdas: db.open_tree("cdas")?,
            addresses: db.open_tree("addresses")?,
            pending: db.open_tree("pending")?,
            meta: db.open_tree("meta")?,
            db,
        })
    }

    fn read_u64(&self, key: &[u8]) -> Result<u64, StoreError> {
        match self.meta.get(key)? {
            Some(v) => decode_u64(&v),
            None => Ok(0),
        }
    }

    fn values<T: DeserializeOwned>(tree: &Tree) -> Result<Vec<T>, StoreError> {
        let mut out = Vec::new();
        for item in tree.iter() {
            let (_, v) = item?;
            out.push(bincode::deserialize(&v)?);
        }
        Ok(out)
    }

    fn keys(tree: &Tree) -> Result<Vec<IVec>, StoreError> {
        tree.iter().keys().map(|k| k.map_err(StoreError::from)).collect()
    }
}

fn index_key(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

fn decode_u64(v: &[u8]) -> Result<u64, StoreError> {
    let bytes: [u8; 8] = v
        .try_into()
        .map_err(|_| StoreError::Serialization(format!("expected 8 bytes, got {}", v.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(bincode::serialize(value)?)
}

fn tx_err(e: TransactionError<StoreError>) -> StoreError {
    match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => e.into(),
    }
}

impl Store for SledStore {
    fn get_cda(&self, index: u64) -> Result<Option<CdaRecord>, StoreError> {
        match self.cdas.get(index_key(index))? {
            Some(v) => Ok(Some(bincode::deserialize(&v)?)),
            None => Ok(None),
        }
    }

    fn find_by_address(&self, address: &Address) -> Result<Option<CdaRecord>, StoreError> {
        match self.addresses.get(address.as_str().as_bytes())? {
            Some(v) => self.get_cda(decode_u64(&v)?),
            None => Ok(None),
        }
    }

    fn put_cda(&self, record: &CdaRecord) -> Result<(), StoreError> {
        let value = encode(record)?;
        let key = index_key(record.index());
        let addr = record.address().as_str().as_bytes().to_vec();

        (&self.cdas, &self.addresses)
            .transaction(|(cdas, addresses)| {
                cdas.insert(&key[..], value.clone())?;
                addresses.insert(addr.clone(), key.to_vec())?;
                Ok::<_, ConflictableTransactionError<StoreError>>(())
            })
            .map_err(tx_err)?;
        self.db.flush()?;
        Ok(())
    }

    fn list_cdas(&self) -> Result<Vec<CdaRecord>, StoreError> {
        // Big-endian keys iterate in index order.
        Self::values(&self.cdas)
    }

    fn next_index(&self) -> Result<u64, StoreError> {
        self.read_u64(NEXT_INDEX)
    }

    fn reserve_next_index(&self) -> Result<u64, StoreError> {
        let reserved = self
            .meta
            .transaction(|meta| {
                let current = match meta.get(NEXT_INDEX)? {
                    Some(v) => decode_u64(&v).map_err(ConflictableTransactionError::Abort)?,
                    None => 0,
                };
                meta.insert(NEXT_INDEX, (current + 1).to_be_bytes().to_vec())?;
                Ok(current)
            })
            .map_err(tx_err)?;
        self.db.flush()?;
        Ok(reserved)
    }

    fn cached_balance(&self) -> Result<u64, StoreError> {
        self.read_u64(CACHED_BALANCE)
    }

    fn set_cached_balance(&self, balance: u64) -> Result<(), StoreError> {
        self.meta.insert(CACHED_BALANCE, balance.to_be_bytes().to_vec())?;
        self.db.flush()?;
        Ok(())
    }

    fn list_pending_transfers(&self) -> Result<Vec<PendingTransfer>, StoreError> {
        Self::values(&self.pending)
    }

    fn put_pending_transfer(&self, pending: &PendingTransfer) -> Result<(), StoreError> {
        self.pending.insert(pending.tx_ref.0.as_bytes(), encode(pending)?)?;
        self.db.flush()?;
        Ok(())
    }

    fn remove_pending_transfer(&self, tx_ref: &TxRef) -> Result<(), StoreError> {
        self.pending.remove(tx_ref.0.as_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    fn commit_spend(&self, records: &[CdaRecord], pending: &PendingTransfer) -> Result<(), StoreError> {
        let encoded = records
            .iter()
            .map(|r| Ok((index_key(r.index()), encode(r)?)))
            .collect::<Result<Vec<_>, StoreError>>()?;
        let pending_value = encode(pending)?;
        let pending_key = pending.tx_ref.0.as_bytes().to_vec();

        (&self.cdas, &self.pending)
            .transaction(|(cdas, pending_tree)| {
                for (key, value) in &encoded {
                    cdas.insert(&key[..], value.clone())?;
                }
                pending_tree.insert(pending_key.clone(), pending_value.clone())?;
                Ok::<_, ConflictableTransactionError<StoreError>>(())
            })
            .map_err(tx_err)?;
        self.db.flush()?;
        Ok(())
    }

    fn load_state(&self) -> Result<StoreState, StoreError> {
        Ok(StoreState {
            next_index: self.next_index()?,
            cached_balance: self.cached_balance()?,
            cdas: self.list_cdas()?,
            pending: self.list_pending_transfers()?,
        })
    }

    fn replace_state(&self, state: &StoreState) -> Result<(), StoreError> {
        let old_cdas = Self::keys(&self.cdas)?;
        let old_addresses = Self::keys(&self.addresses)?;
        let old_pending = Self::keys(&self.pending)?;

        let new_cdas = state
            .cdas
            .iter()
            .map(|r| {
                Ok((
                    index_key(r.index()),
                    r.address().as_str().as_bytes().to_vec(),
                    encode(r)?,
                ))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        let new_pending = state
            .pending
            .iter()
            .map(|p| Ok((p.tx_ref.0.as_bytes().to_vec(), encode(p)?)))
            .collect::<Result<Vec<_>, StoreError>>()?;

        (&self.cdas, &self.addresses, &self.pending, &self.meta)
            .transaction(|(cdas, addresses, pending, meta)| {
                for key in &old_cdas {
                    cdas.remove(key.clone())?;
                }
                for key in &old_addresses {
                    addresses.remove(key.clone())?;
                }
                for key in &old_pending {
                    pending.remove(key.clone())?;
                }
                for (key, addr, value) in &new_cdas {
                    cdas.insert(&key[..], value.clone())?;
                    addresses.insert(addr.clone(), key.to_vec())?;
                }
                for (key, value) in &new_pending {
                    pending.insert(key.clone(), value.clone())?;
                }
                meta.insert(NEXT_INDEX, state.next_index.to_be_bytes().to_vec())?;
                meta.insert(CACHED_BALANCE, state.cached_balance.to_be_bytes().to_vec())?;
                Ok::<_, ConflictableTransactionError<StoreError>>(())
            })
            .map_err(tx_err)?;
        self.db.flush()?;
        Ok(())
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}
