//! The conditional deposit account.
//!
//! An [`Account`] owns a seed, hands out deposit addresses derived from it,
//! gates every send through the [`Oracle`], and keeps its view of the ledger
//! current with two background tasks:
//! - reconciliation, which observes deposits and balances
//! - confirmation, which settles or rolls back submitted transfers
//!
//! All mutations go through one async mutex. Its guarded value is the set
//! of input indices with a submission in flight, so the lock can be dropped
//! around the network call without letting a second send reuse an input.

pub mod allocator;
pub mod config;
pub mod confirm;
pub mod reconcile;
pub mod tasks;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::deposit::{Cda, CdaRecord, CdaStatus, Conditions};
use crate::error::{AccountError, Result};
use crate::keyspace::{AccountId, Keyspace, Seed, SeedExport, SeedReference};
use crate::ledger::{with_retries, LedgerClient, Transfer, TxRef};
use crate::oracle::{Decision, Oracle};
use crate::store::{snapshot, PendingTransfer, Store, StoreError, StoreState};

pub use allocator::DepositAllocator;
pub use config::{AccountConfig, AccountSettings};
pub use confirm::{ConfirmReport, ConfirmationWatcher};
pub use reconcile::{ReconcileReport, Reconciler};
pub use tasks::{BackgroundTask, TaskGroup};

const MAX_LOGGED_GAPS: usize = 8;

pub(crate) struct AccountInner {
    id: AccountId,
    keyspace: Keyspace,
    ledger: Arc<dyn LedgerClient>,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    oracle: Oracle,
    allocator: DepositAllocator,
    settings: AccountSettings,
    /// The mutation domain. Holds indices with a send in flight.
    write_lock: Mutex<HashSet<u64>>,
    balance: AtomicU64,
    pending_out: AtomicU64,
    running: AtomicBool,
}

impl AccountInner {
    fn apply_counters(&self, state: &StoreState) {
        self.balance.store(state.cached_balance, Ordering::SeqCst);
        self.pending_out.store(state.pending_outgoing(), Ordering::SeqCst);
    }

    /// Reloads the atomics from the store. Callers hold the write lock.
    fn refresh_counters(&self) -> Result<()> {
        let pending = self
            .store
            .list_pending_transfers()?
            .iter()
            .fold(0u64, |acc, p| acc.saturating_add(p.amount));
        self.balance.store(self.store.cached_balance()?, Ordering::SeqCst);
        self.pending_out.store(pending, Ordering::SeqCst);
        Ok(())
    }

    fn get_cda(&self, index: u64) -> Result<CdaRecord> {
        self.store.get_cda(index)?.ok_or(AccountError::UnknownCda(index))
    }
}

pub struct Account {
    inner: Arc<AccountInner>,
    tasks: Mutex<Option<TaskGroup>>,
}

impl Account {
    pub fn new(config: AccountConfig) -> Result<Self> {
        if config.deciders.is_empty() {
            return Err(AccountError::InvalidConfig(
                "at least one decider must be configured".into(),
            ));
        }
        config.settings.validate()?;

        let keyspace = Keyspace::new(config.seed);
        let allocator = DepositAllocator::new(keyspace.clone(), config.store.clone(), config.clock.clone());
        let inner = AccountInner {
            id: keyspace.account_id(),
            keyspace,
            ledger: config.ledger,
            store: config.store,
            clock: config.clock,
            oracle: Oracle::new(config.deciders),
            allocator,
            settings: config.settings,
            write_lock: Mutex::new(HashSet::new()),
            balance: AtomicU64::new(0),
            pending_out: AtomicU64::new(0),
            running: AtomicBool::new(false),
        };
        Ok(Self {
            inner: Arc::new(inner),
            tasks: Mutex::new(None),
        })
    }

    /// Builds an account and populates its store from an exported snapshot.
    pub async fn from_snapshot(config: AccountConfig, bytes: &[u8]) -> Result<Self> {
        let account = Self::new(config)?;
        account.import_snapshot(bytes).await?;
        Ok(account)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(AccountError::NotRunning)
        }
    }

    /// Checks the ledger and the store, then launches the background tasks.
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() {
            return Ok(());
        }
        let inner = &self.inner;

        let node = with_retries(inner.settings.retry, "node info", || inner.ledger.node_info())
            .await
            .map_err(|e| AccountError::ResourceUnavailable(format!("ledger: {}", e)))?;
        info!("Connected to ledger node {} {}", node.app_name, node.app_version);

        let state = {
            let _guard = inner.write_lock.lock().await;
            let state = inner.store.load_state().map_err(|e| match e {
                StoreError::Serialization(msg) => AccountError::StoreCorrupt(msg),
                other => AccountError::ResourceUnavailable(format!("store: {}", other)),
            })?;
            state.validate().map_err(AccountError::StoreCorrupt)?;
            let gaps = state.gaps();
            if !gaps.is_empty() {
                let missing = gaps.iter().fold(0u64, |acc, run| acc.saturating_add(run.end - run.start));
                warn!(
                    "{} reserved indices have no record, first runs: {:?}",
                    missing,
                    &gaps[..gaps.len().min(MAX_LOGGED_GAPS)]
                );
            }
            inner.apply_counters(&state);
            state
        };

        *tasks = Some(TaskGroup::start(vec![
            Arc::new(Reconciler::new(inner.clone())) as Arc<dyn BackgroundTask>,
            Arc::new(ConfirmationWatcher::new(inner.clone())),
        ]));
        inner.running.store(true, Ordering::SeqCst);
        info!(
            "🚀 Account {} started ({} deposit addresses, {} pending transfers)",
            inner.id,
            state.cdas.len(),
            state.pending.len()
        );
        Ok(())
    }

    /// Stops the background tasks and flushes the store. Safe to call more
    /// than once, and without a prior start.
    pub async fn shutdown(&self) -> Result<()> {
        let group = self.tasks.lock().await.take();
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(group) = group {
            group.stop().await;
            info!("Account {} stopped", self.inner.id);
        }
        self.inner.store.flush()?;
        Ok(())
    }

    /// Last reconciled balance minus unconfirmed outgoing transfers.
    pub fn available_balance(&self) -> u64 {
        self.inner
            .balance
            .load(Ordering::SeqCst)
            .saturating_sub(self.inner.pending_out.load(Ordering::SeqCst))
    }

    pub async fn allocate_deposit_address(&self, conditions: Conditions) -> Result<Cda> {
        self.ensure_running()?;
        conditions.validate(self.inner.clock.now())?;

        let _guard = self.inner.write_lock.lock().await;
        let cda = self.inner.allocator.allocate(conditions)?;
        self.inner.store.put_cda(&CdaRecord::new(cda.clone()))?;
        info!("Allocated deposit address #{} {}", cda.index, cda.address);
        Ok(cda)
    }

    /// Submits a transfer once every CDA it touches has been approved.
    pub async fn send(&self, transfer: Transfer) -> Result<TxRef> {
        self.ensure_running()?;
        if transfer.outputs.is_empty() || transfer.total() == 0 {
            return Err(AccountError::InvalidTransfer("transfer moves no value".into()));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = transfer.inputs.iter().find(|i| !seen.insert(**i)) {
            return Err(AccountError::InvalidTransfer(format!("input #{} listed twice", dup)));
        }
        let inner = &self.inner;

        let inputs = {
            let mut in_flight = inner.write_lock.lock().await;
            let mut inputs = Vec::with_capacity(transfer.inputs.len());
            for &index in &transfer.inputs {
                let record = inner.get_cda(index)?;
                if record.status == CdaStatus::Spent {
                    return Err(AccountError::AlreadySpent(index));
                }
                if in_flight.contains(&index) {
                    return Err(AccountError::SendInFlight(index));
                }
                inputs.push(record);
            }

            let mut referenced = inputs.clone();
            for output in &transfer.outputs {
                if let Some(record) = inner.store.find_by_address(&output.address)? {
                    if !referenced.iter().any(|r| r.index() == record.index()) {
                        referenced.push(record);
                    }
                }
            }
            for record in &referenced {
                let decision = inner.oracle.decide(record);
                if !decision.ok {
                    return Err(AccountError::OracleRejected {
                        index: record.index(),
                        reason: decision.reason.unwrap_or_default(),
                    });
                }
            }

            in_flight.extend(inputs.iter().map(CdaRecord::index));
            inputs
        };

        let submitted = inner.ledger.submit_transfer(&transfer).await;

        let mut in_flight = inner.write_lock.lock().await;
        for record in &inputs {
            in_flight.remove(&record.index());
        }
        let tx_ref = match submitted {
            Ok(tx_ref) => tx_ref,
            Err(e) => {
                warn!("Transfer submission failed: {}", e);
                return Err(AccountError::Submission(e));
            }
        };

        // Re-read: reconciliation may have updated the inputs meanwhile.
        let mut spent = Vec::with_capacity(inputs.len());
        let mut prior = Vec::with_capacity(inputs.len());
        for record in inputs {
            let mut current = inner.store.get_cda(record.index())?.unwrap_or(record);
            prior.push((current.index(), current.status));
            current.status = CdaStatus::Spent;
            current.spend_ref = Some(tx_ref.clone());
            spent.push(current);
        }
        let pending = PendingTransfer {
            tx_ref: tx_ref.clone(),
            amount: transfer.total(),
            inputs: prior,
            submitted_at: inner.clock.now(),
        };
        if let Err(e) = inner.store.commit_spend(&spent, &pending) {
            error!("Transfer {} was submitted but could not be recorded: {}", tx_ref, e);
            return Err(e.into());
        }
        inner.refresh_counters()?;
        info!("💸 Submitted transfer {} for {}", tx_ref, pending.amount);
        Ok(tx_ref)
    }

    /// The oracle's current view of one CDA.
    pub fn decide(&self, index: u64) -> Result<Decision> {
        Ok(self.inner.oracle.decide(&self.inner.get_cda(index)?))
    }

    /// Operator override: the CDA is approved regardless of the deciders.
    pub async fn approve_override(&self, index: u64) -> Result<()> {
        let _guard = self.inner.write_lock.lock().await;
        let mut record = self.inner.get_cda(index)?;
        if !record.override_approved {
            record.override_approved = true;
            self.inner.store.put_cda(&record)?;
            warn!("Deposit address #{} manually approved", index);
        }
        Ok(())
    }

    pub fn deposit_addresses(&self) -> Result<Vec<CdaRecord>> {
        Ok(self.inner.store.list_cdas()?)
    }

    pub fn cda(&self, index: u64) -> Result<CdaRecord> {
        self.inner.get_cda(index)
    }

    /// One reconciliation pass, now.
    pub async fn sync(&self) -> Result<ReconcileReport> {
        self.inner.reconcile().await
    }

    /// One confirmation pass, now.
    pub async fn confirm(&self) -> Result<ConfirmReport> {
        self.inner.confirm_pending().await
    }

    pub async fn export_snapshot(&self, export: &SeedExport) -> Result<Vec<u8>> {
        let seed = SeedReference::build(self.inner.keyspace.seed(), export)?;
        let _guard = self.inner.write_lock.lock().await;
        Ok(self.inner.store.export_snapshot(&self.inner.id, seed)?)
    }

    /// Replaces the whole store with a snapshot of this same account. Every
    /// check runs before anything is written.
    pub async fn import_snapshot(&self, bytes: &[u8]) -> Result<()> {
        let snapshot = snapshot::decode(bytes)?;
        if snapshot.account_id != self.inner.id {
            return Err(AccountError::SeedMismatch {
                expected: self.inner.id.clone(),
                found: snapshot.account_id,
            });
        }

        let in_flight = self.inner.write_lock.lock().await;
        if let Some(index) = in_flight.iter().next() {
            return Err(AccountError::SendInFlight(*index));
        }
        self.inner.store.replace_state(&snapshot.state)?;
        self.inner.apply_counters(&snapshot.state);
        info!(
            "Imported snapshot: {} deposit addresses, next index {}",
            snapshot.state.cdas.len(),
            snapshot.state.next_index
        );
        Ok(())
    }
}

/// Recovers the seed carried by a snapshot, if it carries one.
pub fn recover_seed(bytes: &[u8], passphrase: Option<&str>) -> Result<Option<Seed>> {
    let snapshot = snapshot::decode(bytes)?;
    let Some(seed) = snapshot.seed_reference.recover(passphrase)? else {
        return Ok(None);
    };
    if seed.account_id() != snapshot.account_id {
        return Err(AccountError::SeedMismatch {
            expected: snapshot.account_id,
            found: seed.account_id(),
        });
    }
    Ok(Some(seed))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::keyspace::{KeyspaceError, MAX_INDEX};
    use crate::ledger::{LedgerError, RetryPolicy, TransferState};
    use crate::oracle::time::REASON_NOT_TIMED_OUT;
    use crate::oracle::{Decider, TimeDecider};
    use crate::store::MemoryStore;
    use crate::test_utils::{record, test_address, MockLedger};
    use std::time::Duration;

    pub(crate) const PHRASE: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
    pub(crate) const T0: u64 = 1_700_000_000_000;
    const HOUR: u64 = 3_600_000;
    const MINUTE: u64 = 60_000;

    pub(crate) struct Harness {
        pub account: Account,
        pub ledger: Arc<MockLedger>,
        pub store: Arc<MemoryStore>,
        pub clock: Arc<ManualClock>,
    }

    pub(crate) fn quiet_settings() -> AccountSettings {
        AccountSettings {
            reconcile_interval: Duration::from_secs(3600),
            confirm_interval: Duration::from_secs(3600),
            retry: RetryPolicy {
                attempts: 2,
                backoff: Duration::from_millis(1),
            },
        }
    }

    pub(crate) fn harness_with(settings: AccountSettings, store: Arc<MemoryStore>) -> Harness {
        let ledger = Arc::new(MockLedger::new());
        let clock = Arc::new(ManualClock::new(T0));
        let account = Account::new(AccountConfig {
            ledger: ledger.clone(),
            store: store.clone(),
            seed: Seed::from_phrase(PHRASE).unwrap(),
            clock: clock.clone(),
            deciders: vec![Box::new(TimeDecider::new(clock.clone(), Duration::from_secs(30 * 60)))],
            settings,
        })
        .unwrap();
        Harness {
            account,
            ledger,
            store,
            clock,
        }
    }

    pub(crate) async fn started() -> Harness {
        let h = harness_with(quiet_settings(), Arc::new(MemoryStore::new()));
        h.account.start().await.unwrap();
        h
    }

    fn day_long(expected: u64) -> Conditions {
        Conditions::new(Some(T0 + 24 * HOUR), false, Some(expected))
    }

    fn payout(input: u64, amount: u64) -> Transfer {
        Transfer::to(test_address(999), amount).from_inputs([input])
    }

    #[test]
    fn test_new_rejects_bad_config() {
        let clock = Arc::new(ManualClock::new(T0));
        let config = |deciders: Vec<Box<dyn Decider>>, settings: AccountSettings| AccountConfig {
            ledger: Arc::new(MockLedger::new()),
            store: Arc::new(MemoryStore::new()),
            seed: Seed::from_phrase(PHRASE).unwrap(),
            clock: clock.clone(),
            deciders,
            settings,
        };

        let no_deciders = Account::new(config(Vec::new(), AccountSettings::default()));
        assert!(matches!(no_deciders, Err(AccountError::InvalidConfig(_))));

        let zero = AccountSettings {
            confirm_interval: Duration::ZERO,
            ..Default::default()
        };
        let decider: Box<dyn Decider> = Box::new(TimeDecider::new(clock.clone(), Duration::ZERO));
        assert!(matches!(
            Account::new(config(vec![decider], zero)),
            Err(AccountError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_operations_require_start() {
        let h = harness_with(quiet_settings(), Arc::new(MemoryStore::new()));
        assert!(matches!(
            h.account.allocate_deposit_address(day_long(10)).await,
            Err(AccountError::NotRunning)
        ));
        assert!(matches!(
            h.account.send(payout(0, 1)).await,
            Err(AccountError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_start_fails_when_ledger_down() {
        let h = harness_with(quiet_settings(), Arc::new(MemoryStore::new()));
        h.ledger.set_down(true);
        assert!(matches!(
            h.account.start().await,
            Err(AccountError::ResourceUnavailable(_))
        ));
        assert!(!h.account.is_running());
        h.account.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_rejects_corrupt_store() {
        let store = Arc::new(MemoryStore::new());
        store
            .replace_state(&StoreState {
                next_index: 1,
                cdas: vec![record(0), record(3)],
                ..Default::default()
            })
            .unwrap();
        let h = harness_with(quiet_settings(), store);
        assert!(matches!(
            h.account.start().await,
            Err(AccountError::StoreCorrupt(_))
        ));
    }

    #[tokio::test]
    async fn test_start_tolerates_index_gaps() {
        let store = Arc::new(MemoryStore::new());
        store
            .replace_state(&StoreState {
                next_index: 5,
                cached_balance: 40,
                cdas: vec![record(0), record(3)],
                ..Default::default()
            })
            .unwrap();
        let h = harness_with(quiet_settings(), store);
        h.account.start().await.unwrap();
        assert_eq!(h.account.available_balance(), 40);

        let cda = h.account.allocate_deposit_address(day_long(5)).await.unwrap();
        assert_eq!(cda.index, 5);
        h.account.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_with_exhausted_keyspace() {
        let store = Arc::new(MemoryStore::new());
        store
            .replace_state(&StoreState {
                next_index: MAX_INDEX + 1,
                cdas: vec![record(0)],
                ..Default::default()
            })
            .unwrap();
        let h = harness_with(quiet_settings(), store);
        h.account.start().await.unwrap();

        assert!(matches!(
            h.account.allocate_deposit_address(day_long(5)).await,
            Err(AccountError::Keyspace(KeyspaceError::KeyspaceExhausted(_)))
        ));
        h.account.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_allocation() {
        let h = started().await;
        let keyspace = Keyspace::new(Seed::from_phrase(PHRASE).unwrap());

        for expected_index in 0..3 {
            let cda = h.account.allocate_deposit_address(day_long(100)).await.unwrap();
            assert_eq!(cda.index, expected_index);
            assert_eq!(cda.address, keyspace.address(expected_index).unwrap());
            assert_eq!(cda.created_at, T0);
            assert_eq!(h.account.cda(expected_index).unwrap().status, CdaStatus::Open);
        }

        let past = Conditions::new(Some(T0), false, None);
        assert!(matches!(
            h.account.allocate_deposit_address(past).await,
            Err(AccountError::InvalidConditions(_))
        ));
        let zero = Conditions::new(None, true, Some(0));
        assert!(matches!(
            h.account.allocate_deposit_address(zero).await,
            Err(AccountError::InvalidConditions(_))
        ));
        assert_eq!(h.store.next_index().unwrap(), 3);
        h.account.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allocations_never_collide() {
        let h = started().await;
        let account = Arc::new(h.account);

        let mut handles = Vec::new();
        for _ in 0..40 {
            let account = account.clone();
            handles.push(tokio::spawn(async move {
                account.allocate_deposit_address(day_long(1)).await.unwrap()
            }));
        }
        let mut indices = Vec::new();
        let mut addresses = HashSet::new();
        for handle in handles {
            let cda = handle.await.unwrap();
            indices.push(cda.index);
            assert!(addresses.insert(cda.address));
        }
        indices.sort_unstable();
        assert_eq!(indices, (0..40).collect::<Vec<_>>());
        account.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_waits_for_oracle_approval() {
        let h = started().await;
        let cda = h.account.allocate_deposit_address(day_long(100)).await.unwrap();
        h.ledger.deposit(&cda.address, 60);
        h.account.sync().await.unwrap();
        assert_eq!(h.account.available_balance(), 60);

        h.clock.set(T0 + 23 * HOUR);
        let before = h.store.load_state().unwrap();
        match h.account.send(payout(cda.index, 60)).await {
            Err(AccountError::OracleRejected { index, reason }) => {
                assert_eq!(index, cda.index);
                assert_eq!(reason, REASON_NOT_TIMED_OUT);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(h.ledger.submitted().is_empty());
        assert_eq!(h.store.load_state().unwrap(), before);

        h.clock.set(T0 + 23 * HOUR + 40 * MINUTE);
        let tx_ref = h.account.send(payout(cda.index, 60)).await.unwrap();
        assert_eq!(h.ledger.submitted().len(), 1);

        let spent = h.account.cda(cda.index).unwrap();
        assert_eq!(spent.status, CdaStatus::Spent);
        assert_eq!(spent.spend_ref, Some(tx_ref.clone()));
        let pending = h.store.list_pending_transfers().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].inputs, vec![(cda.index, CdaStatus::Open)]);
        assert_eq!(h.account.available_balance(), 0);

        assert!(matches!(
            h.account.send(payout(cda.index, 1)).await,
            Err(AccountError::AlreadySpent(_))
        ));
        h.account.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_to_own_address_consults_oracle() {
        let h = started().await;
        let cda = h.account.allocate_deposit_address(day_long(100)).await.unwrap();
        let transfer = Transfer::to(cda.address.clone(), 100);
        assert!(matches!(
            h.account.send(transfer).await,
            Err(AccountError::OracleRejected { index: 0, .. })
        ));
        assert!(h.ledger.submitted().is_empty());
        h.account.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_submission_failure_rolls_back() {
        let h = started().await;
        let cda = h.account.allocate_deposit_address(day_long(100)).await.unwrap();
        h.ledger.deposit(&cda.address, 100);
        h.account.sync().await.unwrap();
        assert_eq!(h.account.cda(0).unwrap().status, CdaStatus::SpentPending);

        h.ledger.fail_submissions(true);
        let err = h.account.send(payout(0, 100)).await.unwrap_err();
        assert!(matches!(err, AccountError::Submission(LedgerError::Rejected(_))));
        let record = h.account.cda(0).unwrap();
        assert_eq!(record.status, CdaStatus::SpentPending);
        assert_eq!(record.spend_ref, None);
        assert!(h.store.list_pending_transfers().unwrap().is_empty());

        h.ledger.fail_submissions(false);
        h.account.send(payout(0, 100)).await.unwrap();
        h.account.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_preconditions() {
        let h = started().await;
        assert!(matches!(
            h.account.send(payout(7, 10)).await,
            Err(AccountError::UnknownCda(7))
        ));
        assert!(matches!(
            h.account.send(Transfer::default()).await,
            Err(AccountError::InvalidTransfer(_))
        ));
        let zero = Transfer::to(test_address(5), 0);
        assert!(matches!(
            h.account.send(zero).await,
            Err(AccountError::InvalidTransfer(_))
        ));

        h.account.allocate_deposit_address(day_long(10)).await.unwrap();
        let doubled = payout(0, 10).from_inputs([0]);
        assert!(matches!(
            h.account.send(doubled).await,
            Err(AccountError::InvalidTransfer(_))
        ));
        h.account.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_is_released_during_submission() {
        let h = started().await;
        h.account.allocate_deposit_address(day_long(100)).await.unwrap();
        h.account.approve_override(0).await.unwrap();
        h.ledger.set_submit_delay(Duration::from_millis(200));

        let account = Arc::new(h.account);
        let first = {
            let account = account.clone();
            let transfer = Transfer::to(test_address(999), 5).from_inputs([0]);
            tokio::spawn(async move { account.send(transfer).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let again = Transfer::to(test_address(999), 5).from_inputs([0]);
        assert!(matches!(
            account.send(again).await,
            Err(AccountError::SendInFlight(0))
        ));
        let other = account.allocate_deposit_address(day_long(1)).await.unwrap();
        assert_eq!(other.index, 1);

        first.await.unwrap().unwrap();
        assert_eq!(h.ledger.submitted().len(), 1);
        account.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_override_approval() {
        let h = started().await;
        let cda = h.account.allocate_deposit_address(day_long(100)).await.unwrap();
        assert!(!h.account.decide(cda.index).unwrap().ok);

        h.account.approve_override(cda.index).await.unwrap();
        assert!(h.account.decide(cda.index).unwrap().ok);
        assert!(h.account.cda(cda.index).unwrap().override_approved);
        h.account.send(payout(cda.index, 10)).await.unwrap();

        assert!(matches!(
            h.account.approve_override(42).await,
            Err(AccountError::UnknownCda(42))
        ));
        h.account.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_confirmation_settles_pending() {
        let h = started().await;
        let cda = h.account.allocate_deposit_address(day_long(100)).await.unwrap();
        h.ledger.deposit(&cda.address, 100);
        h.account.sync().await.unwrap();
        let tx_ref = h.account.send(payout(0, 70)).await.unwrap();
        assert_eq!(h.account.available_balance(), 30);
        // The input still holds its funds until the ledger confirms.
        h.account.sync().await.unwrap();
        assert_eq!(h.account.available_balance(), 30);

        let report = h.account.confirm().await.unwrap();
        assert_eq!(report, ConfirmReport::default());
        assert_eq!(h.store.list_pending_transfers().unwrap().len(), 1);

        h.ledger.set_status(&tx_ref, TransferState::Confirmed);
        let report = h.account.confirm().await.unwrap();
        assert_eq!(report.confirmed, 1);
        assert!(h.store.list_pending_transfers().unwrap().is_empty());
        assert_eq!(h.account.cda(0).unwrap().status, CdaStatus::Spent);
        assert_eq!(h.account.available_balance(), 0);

        h.account.sync().await.unwrap();
        assert_eq!(h.account.available_balance(), 0);
        h.account.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_transfer_restores_inputs() {
        let h = started().await;
        let cda = h.account.allocate_deposit_address(day_long(100)).await.unwrap();
        h.ledger.deposit(&cda.address, 100);
        h.account.sync().await.unwrap();
        let tx_ref = h.account.send(payout(0, 100)).await.unwrap();

        h.ledger.set_status(&tx_ref, TransferState::Rejected);
        let report = h.account.confirm().await.unwrap();
        assert_eq!(report.rejected, 1);

        let record = h.account.cda(0).unwrap();
        assert_eq!(record.status, CdaStatus::SpentPending);
        assert_eq!(record.spend_ref, None);
        assert!(h.store.list_pending_transfers().unwrap().is_empty());
        assert_eq!(h.account.available_balance(), 100);
        h.account.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_export_import_round_trip() {
        let h = started().await;
        h.account.allocate_deposit_address(day_long(100)).await.unwrap();
        let second = h.account.allocate_deposit_address(day_long(50)).await.unwrap();
        h.ledger.deposit(&second.address, 50);
        h.account.sync().await.unwrap();
        h.account.send(payout(1, 50)).await.unwrap();
        let bytes = h.account.export_snapshot(&SeedExport::Fingerprint).await.unwrap();
        let original = h.store.load_state().unwrap();

        let fresh = harness_with(quiet_settings(), Arc::new(MemoryStore::new()));
        fresh.account.import_snapshot(&bytes).await.unwrap();
        assert_eq!(fresh.store.load_state().unwrap(), original);
        assert_eq!(
            fresh.account.deposit_addresses().unwrap(),
            h.account.deposit_addresses().unwrap()
        );
        assert_eq!(fresh.account.available_balance(), h.account.available_balance());

        fresh.account.start().await.unwrap();
        let next = fresh.account.allocate_deposit_address(day_long(1)).await.unwrap();
        assert_eq!(next.index, 2);

        fresh.account.shutdown().await.unwrap();
        h.account.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_from_snapshot_with_embedded_seed() {
        let h = started().await;
        h.account.allocate_deposit_address(day_long(100)).await.unwrap();
        let export = SeedExport::Encrypted {
            passphrase: "hunter2".into(),
        };
        let bytes = h.account.export_snapshot(&export).await.unwrap();

        assert!(recover_seed(&bytes, Some("wrong")).is_err());
        let seed = recover_seed(&bytes, Some("hunter2")).unwrap().unwrap();
        assert_eq!(seed.account_id(), h.account.id());

        let clock = Arc::new(ManualClock::new(T0));
        let restored = Account::from_snapshot(
            AccountConfig {
                ledger: Arc::new(MockLedger::new()),
                store: Arc::new(MemoryStore::new()),
                seed,
                clock: clock.clone(),
                deciders: vec![Box::new(TimeDecider::new(clock, Duration::ZERO))],
                settings: quiet_settings(),
            },
            &bytes,
        )
        .await
        .unwrap();
        assert_eq!(restored.deposit_addresses().unwrap().len(), 1);
        h.account.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_import_rejects_foreign_or_broken_snapshots() {
        let h = started().await;
        h.account.allocate_deposit_address(day_long(100)).await.unwrap();
        let before = h.store.load_state().unwrap();

        let other_seed = Seed::from_hex(&"11".repeat(64)).unwrap();
        let foreign = snapshot::encode(&other_seed.account_id(), SeedReference::Fingerprint, &before).unwrap();
        assert!(matches!(
            h.account.import_snapshot(&foreign).await,
            Err(AccountError::SeedMismatch { .. })
        ));

        let good = h.account.export_snapshot(&SeedExport::Fingerprint).await.unwrap();
        let truncated = &good[..good.len() - 10];
        assert!(matches!(
            h.account.import_snapshot(truncated).await,
            Err(AccountError::MalformedSnapshot(_))
        ));
        assert_eq!(h.store.load_state().unwrap(), before);
        h.account.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let h = harness_with(quiet_settings(), Arc::new(MemoryStore::new()));
        h.account.shutdown().await.unwrap();
        h.account.start().await.unwrap();
        h.account.start().await.unwrap();
        h.account.shutdown().await.unwrap();
        h.account.shutdown().await.unwrap();
        assert!(matches!(
            h.account.allocate_deposit_address(day_long(1)).await,
            Err(AccountError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_background_reconciliation_runs() {
        let settings = AccountSettings {
            reconcile_interval: Duration::from_millis(20),
            ..quiet_settings()
        };
        let h = harness_with(settings, Arc::new(MemoryStore::new()));
        h.account.start().await.unwrap();
        let cda = h.account.allocate_deposit_address(day_long(100)).await.unwrap();
        h.ledger.deposit(&cda.address, 100);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.account.cda(0).unwrap().status, CdaStatus::SpentPending);
        assert_eq!(h.account.available_balance(), 100);
        h.account.shutdown().await.unwrap();
    }
}
