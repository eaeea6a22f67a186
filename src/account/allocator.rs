use std::sync::Arc;

use crate::clock::Clock;
use crate::deposit::{Cda, Conditions};
use crate::error::Result;
use crate::keyspace::Keyspace;
use crate::store::Store;

/// Hands out fresh deposit addresses. The index is reserved in the store
/// before derivation, so a failure anywhere later leaves a gap rather than a
/// reused index.
pub struct DepositAllocator {
    keyspace: Keyspace,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl DepositAllocator {
    pub fn new(keyspace: Keyspace, store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self {
            keyspace,
            store,
            clock,
        }
    }

    pub fn allocate(&self, conditions: Conditions) -> Result<Cda> {
        let index = self.store.reserve_next_index()?;
        let address = self.keyspace.address(index)?;
        Ok(Cda {
            address,
            index,
            conditions,
            created_at: self.clock.now(),
        })
    }
}
