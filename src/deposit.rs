//! Conditional deposit addresses (CDAs) and their persisted records.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::clock::Timestamp;
use crate::error::AccountError;
use crate::keyspace::Address;
use crate::ledger::{Transfer, TransferOutput, TxRef};

const LINK_SCHEME: &str = "cda://";

/// Conditions attached to an address at allocation time. Immutable afterwards.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conditions {
    /// Deadline after which no further deposits are expected.
    pub timeout_at: Option<Timestamp>,
    /// If false the address is used up by its first qualifying deposit.
    pub multi_use: bool,
    pub expected_amount: Option<u64>,
}

impl Conditions {
    pub fn new(timeout_at: Option<Timestamp>, multi_use: bool, expected_amount: Option<u64>) -> Self {
        Self {
            timeout_at,
            multi_use,
            expected_amount,
        }
    }

    /// Checks the conditions against the current time.
    pub fn validate(&self, now: Timestamp) -> Result<(), AccountError> {
        if let Some(timeout_at) = self.timeout_at {
            if timeout_at <= now {
                return Err(AccountError::InvalidConditions(format!(
                    "timeout {} is not in the future (now {})",
                    timeout_at, now
                )));
            }
        }
        if self.expected_amount == Some(0) {
            return Err(AccountError::InvalidConditions(
                "expected amount must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether anything here can be evaluated by a decider.
    pub fn is_checkable(&self) -> bool {
        self.timeout_at.is_some() || self.expected_amount.is_some()
    }

    pub fn has_timed_out(&self, now: Timestamp) -> bool {
        self.timeout_at.is_some_and(|t| now >= t)
    }

    /// True once `received` covers the expected amount. Without an expected
    /// amount any deposit qualifies.
    pub fn is_funded(&self, received: u64) -> bool {
        match self.expected_amount {
            Some(expected) => received >= expected,
            None => received > 0,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Cda {
    pub address: Address,
    pub index: u64,
    pub conditions: Conditions,
    pub created_at: Timestamp,
}

impl Cda {
    /// A transfer paying this CDA its expected amount.
    pub fn as_transfer(&self) -> Transfer {
        Transfer {
            inputs: Vec::new(),
            outputs: vec![TransferOutput {
                address: self.address.clone(),
                amount: self.conditions.expected_amount.unwrap_or(0),
                tag: None,
            }],
        }
    }

    /// Shareable form of the address and its conditions.
    pub fn to_link(&self) -> DepositLink {
        DepositLink {
            address: self.address.clone(),
            conditions: self.conditions.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum CdaStatus {
    /// Accepting deposits.
    Open,
    /// Funded single-use address waiting for an approved send.
    SpentPending,
    /// A send drew from this address.
    Spent,
    /// Timed out.
    Expired,
}

impl fmt::Display for CdaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CdaStatus::Open => write!(f, "open"),
            CdaStatus::SpentPending => write!(f, "spent-pending"),
            CdaStatus::Spent => write!(f, "spent"),
            CdaStatus::Expired => write!(f, "expired"),
        }
    }
}

/// A CDA as the store keeps it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CdaRecord {
    pub cda: Cda,
    pub status: CdaStatus,
    /// Total of all deposits observed on the ledger.
    #[serde(default)]
    pub received: u64,
    #[serde(default)]
    pub spend_ref: Option<TxRef>,
    /// Manual operator approval, bypasses the deciders.
    #[serde(default)]
    pub override_approved: bool,
}

impl CdaRecord {
    pub fn new(cda: Cda) -> Self {
        Self {
            cda,
            status: CdaStatus::Open,
            received: 0,
            spend_ref: None,
            override_approved: false,
        }
    }

    pub fn index(&self) -> u64 {
        self.cda.index
    }

    pub fn address(&self) -> &Address {
        &self.cda.address
    }

    pub fn conditions(&self) -> &Conditions {
        &self.cda.conditions
    }

    pub fn is_open(&self) -> bool {
        self.status == CdaStatus::Open
    }

    pub fn is_fully_funded(&self) -> bool {
        self.cda
            .conditions
            .expected_amount
            .is_some_and(|expected| self.received >= expected)
    }

    /// Applies an observed deposit total. Returns true when the status changed.
    pub fn observe_deposits(&mut self, received: u64, now: Timestamp) -> bool {
        self.received = received;
        if self.status != CdaStatus::Open {
            return false;
        }
        let conditions = &self.cda.conditions;
        if !conditions.multi_use && conditions.is_funded(received) {
            self.status = CdaStatus::SpentPending;
            return true;
        }
        if conditions.has_timed_out(now) {
            self.status = CdaStatus::Expired;
            return true;
        }
        false
    }
}

/// `cda://<address>?timeout_at=<ms>&multi_use=<bool>&expected_amount=<n>`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DepositLink {
    pub address: Address,
    pub conditions: Conditions,
}

impl fmt::Display for DepositLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}?multi_use={}", LINK_SCHEME, self.address, self.conditions.multi_use)?;
        if let Some(t) = self.conditions.timeout_at {
            write!(f, "&timeout_at={}", t)?;
        }
        if let Some(amount) = self.conditions.expected_amount {
            write!(f, "&expected_amount={}", amount)?;
        }
        Ok(())
    }
}

impl FromStr for DepositLink {
    type Err = AccountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |msg: &str| AccountError::InvalidConditions(format!("bad deposit link: {}", msg));

        let rest = s
            .trim()
            .strip_prefix(LINK_SCHEME)
            .ok_or_else(|| invalid("missing cda:// scheme"))?;
        let (addr, query) = rest.split_once('?').unwrap_or((rest, ""));
        let address: Address = addr.parse()?;

        let mut conditions = Conditions::default();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| invalid(pair))?;
            match key {
                "timeout_at" => {
                    conditions.timeout_at = Some(value.parse().map_err(|_| invalid(pair))?)
                }
                "multi_use" => conditions.multi_use = value.parse().map_err(|_| invalid(pair))?,
                "expected_amount" => {
                    conditions.expected_amount = Some(value.parse().map_err(|_| invalid(pair))?)
                }
                _ => return Err(invalid(pair)),
            }
        }
        Ok(DepositLink { address, conditions })
    }
}
