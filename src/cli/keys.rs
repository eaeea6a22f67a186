use std::fs;
use std::path::Path;
use tracing::info;

use super::{load_seed, open_account, seed_file_exists, SeedMode};
use crate::account::recover_seed;
use crate::config::CdaConfig;
use crate::error::{AccountError, Result};
use crate::keyspace::{Seed, SeedExport};
use crate::store::snapshot;

fn write_seed_file(config: &CdaConfig, seed_text: &str) -> Result<()> {
    let path = Path::new(&config.account.seed_file);
    snapshot::write_file(path, seed_text.as_bytes())
        .map_err(|e| AccountError::ResourceUnavailable(format!("{}: {}", path.display(), e)))
}

pub fn init(config: &CdaConfig, force: bool) -> Result<()> {
    if seed_file_exists(config) && !force {
        println!(
            "Error: seed file '{}' already exists. Aborting to prevent overwrite.",
            config.account.seed_file
        );
        return Ok(());
    }

    let (seed, phrase) = Seed::generate()?;
    write_seed_file(config, &phrase)?;
    info!("New account {} initialised", seed.account_id());

    println!("Account id: {}", seed.account_id());
    println!("Seed written to {}", config.account.seed_file);
    println!();
    println!("Recovery phrase (write it down, it is shown only once):");
    println!("  {}", phrase);
    Ok(())
}

pub async fn export(config: &CdaConfig, path: &Path, mode: SeedMode, passphrase: Option<String>) -> Result<()> {
    let export = match (mode, passphrase) {
        (SeedMode::Fingerprint, _) => SeedExport::Fingerprint,
        (SeedMode::Plain, _) => SeedExport::Plain,
        (SeedMode::Encrypted, Some(passphrase)) => SeedExport::Encrypted { passphrase },
        (SeedMode::Encrypted, None) => {
            return Err(AccountError::InvalidConfig(
                "--passphrase is required for an encrypted export".into(),
            ))
        }
    };

    let account = open_account(config, load_seed(config)?)?;
    let bytes = account.export_snapshot(&export).await?;
    snapshot::write_file(path, &bytes)
        .map_err(|e| AccountError::ResourceUnavailable(format!("{}: {}", path.display(), e)))?;
    account.shutdown().await?;

    println!("Snapshot written to {} ({} bytes)", path.display(), bytes.len());
    if mode == SeedMode::Plain {
        println!("Warning: the snapshot contains the unencrypted seed.");
    }
    Ok(())
}

pub async fn import(config: &CdaConfig, path: &Path, passphrase: Option<String>) -> Result<()> {
    let bytes = fs::read(path)
        .map_err(|e| AccountError::ResourceUnavailable(format!("{}: {}", path.display(), e)))?;

    let seed = if seed_file_exists(config) {
        load_seed(config)?
    } else {
        let seed = recover_seed(&bytes, passphrase.as_deref())?.ok_or_else(|| {
            AccountError::ResourceUnavailable(
                "no seed file, and the snapshot does not carry the seed".into(),
            )
        })?;
        write_seed_file(config, &seed.to_hex())?;
        println!("Seed recovered from snapshot and written to {}", config.account.seed_file);
        seed
    };

    let account = open_account(config, seed)?;
    account.import_snapshot(&bytes).await?;
    let count = account.deposit_addresses()?.len();
    account.shutdown().await?;

    println!("Imported {} deposit addresses into account {}", count, account.id());
    Ok(())
}
