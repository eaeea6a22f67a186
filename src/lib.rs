pub mod account;
pub mod cli;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod deposit;
pub mod error;
pub mod keyspace;
pub mod ledger;
pub mod oracle;
pub mod store;

#[cfg(test)]
mod test_utils;

pub use account::{Account, AccountConfig, AccountSettings};
pub use error::{AccountError, Result};
