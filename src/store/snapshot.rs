//! Versioned, self-describing account snapshot.
//!
//! A snapshot is one JSON object. `integrityCheck` is the sha256 of the
//! canonical encoding (sorted keys, compact) of every other field, so a
//! truncated or edited file is rejected before any field is trusted.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use super::{PendingTransfer, StoreError, StoreState};
use crate::clock::Timestamp;
use crate::crypto::checksum_hex;
use crate::deposit::{Cda, CdaRecord, CdaStatus, Conditions};
use crate::error::AccountError;
use crate::keyspace::{AccountId, Address, SeedReference};
use crate::ledger::TxRef;

pub const FORMAT_VERSION: u32 = 1;

const INTEGRITY_FIELD: &str = "integrityCheck";
const VERSION_FIELD: &str = "formatVersion";

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotBody {
    format_version: u32,
    account_id: AccountId,
    seed_reference: SeedReference,
    next_index: u64,
    cached_balance: u64,
    cdas: Vec<SnapshotCda>,
    pending_transfers: Vec<PendingTransfer>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotCda {
    index: u64,
    address: Address,
    conditions: Conditions,
    status: CdaStatus,
    created_at: Timestamp,
    received: u64,
    spend_ref: Option<TxRef>,
    override_approved: bool,
}

impl From<&CdaRecord> for SnapshotCda {
    fn from(r: &CdaRecord) -> Self {
        Self {
            index: r.cda.index,
            address: r.cda.address.clone(),
            conditions: r.cda.conditions.clone(),
            status: r.status,
            created_at: r.cda.created_at,
            received: r.received,
            spend_ref: r.spend_ref.clone(),
            override_approved: r.override_approved,
        }
    }
}

impl From<SnapshotCda> for CdaRecord {
    fn from(s: SnapshotCda) -> Self {
        Self {
            cda: Cda {
                address: s.address,
                index: s.index,
                conditions: s.conditions,
                created_at: s.created_at,
            },
            status: s.status,
            received: s.received,
            spend_ref: s.spend_ref,
            override_approved: s.override_approved,
        }
    }
}

/// A decoded and fully validated snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub format_version: u32,
    pub account_id: AccountId,
    pub seed_reference: SeedReference,
    pub state: StoreState,
}

/// Rebuilds every object with its keys inserted in sorted order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn integrity_check(body: &Value) -> Result<String, serde_json::Error> {
    Ok(checksum_hex(&serde_json::to_vec(&canonicalize(body))?))
}

pub fn encode(account_id: &str, seed_reference: SeedReference, state: &StoreState) -> Result<Vec<u8>, StoreError> {
    let body = SnapshotBody {
        format_version: FORMAT_VERSION,
        account_id: account_id.to_string(),
        seed_reference,
        next_index: state.next_index,
        cached_balance: state.cached_balance,
        cdas: state.cdas.iter().map(SnapshotCda::from).collect(),
        pending_transfers: state.pending.clone(),
    };
    let ser = |e: serde_json::Error| StoreError::Serialization(e.to_string());

    let mut value = serde_json::to_value(&body).map_err(ser)?;
    let check = integrity_check(&value).map_err(ser)?;
    if let Value::Object(map) = &mut value {
        map.insert(INTEGRITY_FIELD.to_string(), Value::String(check));
    }
    serde_json::to_vec_pretty(&canonicalize(&value)).map_err(ser)
}

pub fn decode(bytes: &[u8]) -> Result<Snapshot, AccountError> {
    let malformed = |msg: String| AccountError::MalformedSnapshot(msg);

    let mut value: Value =
        serde_json::from_slice(bytes).map_err(|e| malformed(format!("not a JSON document: {}", e)))?;
    let map = value
        .as_object_mut()
        .ok_or_else(|| malformed("top-level value is not an object".to_string()))?;

    let expected = match map.remove(INTEGRITY_FIELD) {
        Some(Value::String(s)) => s,
        _ => return Err(malformed("missing integrity check".to_string())),
    };
    let actual = integrity_check(&value).map_err(|e| malformed(e.to_string()))?;
    if !actual.eq_ignore_ascii_case(&expected) {
        return Err(malformed("integrity check mismatch".to_string()));
    }

    let found = value
        .get(VERSION_FIELD)
        .and_then(Value::as_u64)
        .ok_or_else(|| malformed("missing format version".to_string()))?;
    if found > FORMAT_VERSION as u64 {
        return Err(AccountError::IncompatibleVersion {
            found: u32::try_from(found).unwrap_or(u32::MAX),
            supported: FORMAT_VERSION,
        });
    }
    if found == 0 {
        return Err(malformed("format version 0 is not valid".to_string()));
    }

    let body: SnapshotBody =
        serde_json::from_value(value).map_err(|e| malformed(format!("bad structure: {}", e)))?;

    let mut state = StoreState {
        next_index: body.next_index,
        cached_balance: body.cached_balance,
        cdas: body.cdas.into_iter().map(CdaRecord::from).collect(),
        pending: body.pending_transfers,
    };
    state.validate().map_err(malformed)?;
    state.cdas.sort_by_key(|r| r.index());

    Ok(Snapshot {
        format_version: body.format_version,
        account_id: body.account_id,
        seed_reference: body.seed_reference,
        state,
    })
}

/// Writes a snapshot file readable only by its owner. The data goes to a
/// temporary sibling first and is renamed into place once synced.
pub fn write_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyspace::MAX_INDEX;
    use crate::test_utils::record;

    fn sample_state() -> StoreState {
        let mut spent = record(1);
        spent.status = CdaStatus::Spent;
        spent.received = 100;
        spent.spend_ref = Some(TxRef("tail-hash".into()));
        StoreState {
            next_index: 4,
            cached_balance: 250,
            cdas: vec![record(0), spent, record(3)],
            pending: vec![PendingTransfer {
                tx_ref: TxRef("tail-hash".into()),
                amount: 100,
                inputs: vec![(1, CdaStatus::SpentPending)],
                submitted_at: 42,
            }],
        }
    }

    /// Re-signs an edited body so only the edit itself is under test.
    fn resign(mut value: Value) -> Vec<u8> {
        let map = value.as_object_mut().unwrap();
        map.remove(INTEGRITY_FIELD);
        let check = integrity_check(&value).unwrap();
        value
            .as_object_mut()
            .unwrap()
            .insert(INTEGRITY_FIELD.to_string(), Value::String(check));
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let state = sample_state();
        let bytes = encode("acct", SeedReference::Fingerprint, &state).unwrap();
        let snapshot = decode(&bytes).unwrap();

        assert_eq!(snapshot.format_version, FORMAT_VERSION);
        assert_eq!(snapshot.account_id, "acct");
        assert_eq!(snapshot.seed_reference, SeedReference::Fingerprint);
        assert_eq!(snapshot.state, state);
    }

    #[test]
    fn test_document_shape() {
        let bytes = encode("acct", SeedReference::Fingerprint, &sample_state()).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        for field in ["formatVersion", "seedReference", "nextIndex", "cdas", "integrityCheck"] {
            assert!(value.get(field).is_some(), "missing {}", field);
        }
        let cda = &value["cdas"][0];
        for field in ["index", "address", "conditions", "status", "createdAt"] {
            assert!(cda.get(field).is_some(), "missing cda.{}", field);
        }
    }

    #[test]
    fn test_tampered_check_is_rejected() {
        let bytes = encode("acct", SeedReference::Fingerprint, &sample_state()).unwrap();
        let mut value: Value = serde_json::from_slice(&bytes).unwrap();
        value[INTEGRITY_FIELD] = Value::String("00".repeat(32));
        let tampered = serde_json::to_vec(&value).unwrap();
        assert!(matches!(decode(&tampered), Err(AccountError::MalformedSnapshot(_))));
    }

    #[test]
    fn test_tampered_body_is_rejected() {
        let bytes = encode("acct", SeedReference::Fingerprint, &sample_state()).unwrap();
        let mut value: Value = serde_json::from_slice(&bytes).unwrap();
        value["nextIndex"] = Value::from(40);
        let tampered = serde_json::to_vec(&value).unwrap();
        assert!(matches!(decode(&tampered), Err(AccountError::MalformedSnapshot(_))));
    }

    #[test]
    fn test_truncated_file_is_rejected() {
        let bytes = encode("acct", SeedReference::Fingerprint, &sample_state()).unwrap();
        let truncated = &bytes[..bytes.len() / 2];
        assert!(matches!(decode(truncated), Err(AccountError::MalformedSnapshot(_))));
        assert!(matches!(decode(b""), Err(AccountError::MalformedSnapshot(_))));
    }

    #[test]
    fn test_newer_version_is_incompatible() {
        let bytes = encode("acct", SeedReference::Fingerprint, &sample_state()).unwrap();
        let mut value: Value = serde_json::from_slice(&bytes).unwrap();
        value[VERSION_FIELD] = Value::from(FORMAT_VERSION + 1);
        match decode(&resign(value)) {
            Err(AccountError::IncompatibleVersion { found, supported }) => {
                assert_eq!(found, FORMAT_VERSION + 1);
                assert_eq!(supported, FORMAT_VERSION);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_structural_violations_are_malformed() {
        let bytes = encode("acct", SeedReference::Fingerprint, &sample_state()).unwrap();
        let mut value: Value = serde_json::from_slice(&bytes).unwrap();
        value["nextIndex"] = Value::from(3);
        assert!(matches!(decode(&resign(value)), Err(AccountError::MalformedSnapshot(_))));

        let mut value: Value = serde_json::from_slice(&bytes).unwrap();
        value["cdas"][1]["index"] = Value::from(0);
        assert!(matches!(decode(&resign(value)), Err(AccountError::MalformedSnapshot(_))));
    }

    #[test]
    fn test_exhausted_counter_decodes() {
        let bytes = encode("acct", SeedReference::Fingerprint, &sample_state()).unwrap();
        let mut value: Value = serde_json::from_slice(&bytes).unwrap();
        value["nextIndex"] = Value::from(MAX_INDEX + 1);
        let snapshot = decode(&resign(value)).unwrap();
        assert_eq!(snapshot.state.next_index, MAX_INDEX + 1);
        assert_eq!(snapshot.state.cdas.len(), 3);
    }

    #[test]
    fn test_file_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exported-seed-state.json");
        let bytes = encode("acct", SeedReference::Fingerprint, &sample_state()).unwrap();

        write_file(&path, &bytes).unwrap();
        assert_eq!(fs::read(&path).unwrap(), bytes);
        assert!(!path.with_extension("tmp").exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
