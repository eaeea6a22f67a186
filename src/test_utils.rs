//! Fixtures shared by unit tests.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::deposit::{Cda, CdaRecord, Conditions};
use crate::keyspace::Address;
use crate::ledger::{LedgerClient, LedgerError, NodeInfo, Transfer, TransferState, TxRef};

pub(crate) const FAR_FUTURE: u64 = 4_000_000_000_000;

/// A well-formed address that no seed will ever produce.
pub(crate) fn test_address(n: u64) -> Address {
    hex::encode(Sha256::digest(n.to_be_bytes()))
        .parse()
        .unwrap()
}

/// An open single-use record expecting 100.
pub(crate) fn record(index: u64) -> CdaRecord {
    CdaRecord::new(Cda {
        address: test_address(index),
        index,
        conditions: Conditions::new(Some(FAR_FUTURE), false, Some(100)),
        created_at: 1,
    })
}

#[derive(Default)]
struct MockState {
    deposits: HashMap<Address, Vec<u64>>,
    submitted: Vec<Transfer>,
    statuses: HashMap<TxRef, TransferState>,
    down: bool,
    fail_submit: bool,
    submit_delay: Duration,
}

/// In-memory ledger. Balances equal the sum of deposits.
#[derive(Default)]
pub(crate) struct MockLedger {
    state: Mutex<MockState>,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deposit(&self, address: &Address, amount: u64) {
        self.state
            .lock()
            .unwrap()
            .deposits
            .entry(address.clone())
            .or_default()
            .push(amount);
    }

    pub fn set_down(&self, down: bool) {
        self.state.lock().unwrap().down = down;
    }

    pub fn fail_submissions(&self, fail: bool) {
        self.state.lock().unwrap().fail_submit = fail;
    }

    pub fn set_submit_delay(&self, delay: Duration) {
        self.state.lock().unwrap().submit_delay = delay;
    }

    pub fn set_status(&self, tx_ref: &TxRef, state: TransferState) {
        self.state.lock().unwrap().statuses.insert(tx_ref.clone(), state);
    }

    pub fn submitted(&self) -> Vec<Transfer> {
        self.state.lock().unwrap().submitted.clone()
    }

    fn check_up(&self) -> Result<(), LedgerError> {
        if self.state.lock().unwrap().down {
            Err(LedgerError::Unreachable("mock ledger is down".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn node_info(&self) -> Result<NodeInfo, LedgerError> {
        self.check_up()?;
        Ok(NodeInfo {
            app_name: "mock".into(),
            app_version: "0.0.0".into(),
        })
    }

    async fn submit_transfer(&self, transfer: &Transfer) -> Result<TxRef, LedgerError> {
        self.check_up()?;
        let delay = self.state.lock().unwrap().submit_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        if state.fail_submit {
            return Err(LedgerError::Rejected("insufficient funds".into()));
        }
        state.submitted.push(transfer.clone());
        let tx_ref = TxRef(format!("tx-{}", state.submitted.len()));
        state.statuses.insert(tx_ref.clone(), TransferState::Pending);
        Ok(tx_ref)
    }

    async fn query_balance(&self, address: &Address) -> Result<u64, LedgerError> {
        Ok(self.query_deposits(address).await?.iter().sum())
    }

    async fn query_deposits(&self, address: &Address) -> Result<Vec<u64>, LedgerError> {
        self.check_up()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .deposits
            .get(address)
            .cloned()
            .unwrap_or_default())
    }

    async fn transfer_status(&self, tx_ref: &TxRef) -> Result<TransferState, LedgerError> {
        self.check_up()?;
        self.state
            .lock()
            .unwrap()
            .statuses
            .get(tx_ref)
            .copied()
            .ok_or_else(|| LedgerError::Rejected(format!("unknown transfer {}", tx_ref)))
    }
}
