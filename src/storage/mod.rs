//! Persistence layer.
//!
//! Saves and loads the bet ledger and the policy as JSON blobs, one per
//! cycle. Consensus never agrees on the blobs themselves — replicas
//! agree on the sha256 content hash of the persisted form, so two
//! replicas hold the same bets exactly when the hashes match.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::bets::BetLedger;
use crate::policy::EGreedyPolicy;

/// Default bets file name inside the data directory.
const BETS_FILE: &str = "bets.json";
/// Default policy file name inside the data directory.
const POLICY_FILE: &str = "policy.json";

/// Resolve the bets blob path for a data directory.
pub fn bets_path(data_dir: &str) -> PathBuf {
    Path::new(data_dir).join(BETS_FILE)
}

/// Resolve the policy blob path for a data directory.
pub fn policy_path(data_dir: &str) -> PathBuf {
    Path::new(data_dir).join(POLICY_FILE)
}

/// Hex sha256 of a persisted blob — the value that flows through
/// consensus in place of the blob.
pub fn content_hash(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// Serialize the ledger and return its content hash without touching disk.
pub fn ledger_hash(ledger: &BetLedger) -> Result<String> {
    let raw = ledger.serialize().context("Failed to serialize the ledger")?;
    Ok(content_hash(&raw))
}

/// Save the bet ledger to a JSON file.
pub fn save_bets(ledger: &BetLedger, path: &Path) -> Result<String> {
    let raw = ledger.serialize().context("Failed to serialize the ledger")?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create data dir {}", parent.display()))?;
    }
    std::fs::write(path, &raw)
        .with_context(|| format!("Failed to write bets to {}", path.display()))?;
    let hash = content_hash(&raw);
    debug!(path = %path.display(), bets = ledger.len(), hash = %hash, "Bets saved");
    Ok(hash)
}

/// Load the bet ledger from a JSON file.
/// Returns `None` if the file doesn't exist (fresh start).
pub fn load_bets(path: &Path) -> Result<Option<BetLedger>> {
    if !path.exists() {
        info!(path = %path.display(), "No saved bets found, starting fresh");
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read bets from {}", path.display()))?;
    let ledger = BetLedger::deserialize(&raw)
        .with_context(|| format!("Failed to parse bets from {}", path.display()))?;
    info!(path = %path.display(), bets = ledger.len(), "Bets loaded from disk");
    Ok(Some(ledger))
}

/// Save the policy to a JSON file.
pub fn save_policy(policy: &EGreedyPolicy, path: &Path) -> Result<()> {
    let raw = policy.serialize().context("Failed to serialize the policy")?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create data dir {}", parent.display()))?;
    }
    std::fs::write(path, &raw)
        .with_context(|| format!("Failed to write policy to {}", path.display()))?;
    debug!(path = %path.display(), "Policy saved");
    Ok(())
}

/// Load the policy from a JSON file.
/// Returns `None` if the file doesn't exist (fresh start).
pub fn load_policy(path: &Path) -> Result<Option<EGreedyPolicy>> {
    if !path.exists() {
        info!(path = %path.display(), "No saved policy found, starting fresh");
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read policy from {}", path.display()))?;
    let policy = EGreedyPolicy::deserialize(&raw)
        .with_context(|| format!("Failed to parse policy from {}", path.display()))?;
    info!(path = %path.display(), "Policy loaded from disk");
    Ok(Some(policy))
}

/// Delete a persisted blob (for testing or reset).
pub fn delete(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to delete {}", path.display()))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MarketSnapshot;

    fn temp_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("concord_test_{}_{}.json", name, uuid::Uuid::new_v4()));
        path
    }

    fn ledger() -> BetLedger {
        let mut ledger = BetLedger::new();
        ledger.upsert(vec![MarketSnapshot {
            id: "a".to_string(),
            title: "Market a".to_string(),
            condition_id: "0xcond".to_string(),
            collateral_token: "0xtoken".to_string(),
            fee: 0,
            opening_timestamp: 2_000_000_000,
            outcomes: Some(vec!["Yes".to_string(), "No".to_string()]),
            outcome_token_amounts: vec![100, 100],
            outcome_prices: vec![0.5, 0.5],
            scaled_liquidity: 10.0,
        }]);
        ledger
    }

    #[test]
    fn test_save_and_load_bets() {
        let path = temp_path("bets");
        let saved_hash = save_bets(&ledger(), &path).unwrap();

        let loaded = load_bets(&path).unwrap().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(ledger_hash(&loaded).unwrap(), saved_hash);

        delete(&path).unwrap();
    }

    #[test]
    fn test_load_nonexistent_is_fresh_start() {
        assert!(load_bets(Path::new("/tmp/concord_missing_bets.json"))
            .unwrap()
            .is_none());
        assert!(load_policy(Path::new("/tmp/concord_missing_policy.json"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_hash_changes_with_content() {
        let base = ledger();
        let mut changed = ledger();
        changed.get_mut(0).unwrap().append_investment(0, 1);

        assert_eq!(ledger_hash(&base).unwrap(), ledger_hash(&base).unwrap());
        assert_ne!(ledger_hash(&base).unwrap(), ledger_hash(&changed).unwrap());
    }

    #[test]
    fn test_save_and_load_policy() {
        let path = temp_path("policy");
        let mut policy =
            EGreedyPolicy::new(0.1, 3, 10_800, &["tool-a".to_string()]).unwrap();
        policy.record_response("tool-a", 1_700_000_000, false);
        save_policy(&policy, &path).unwrap();

        let loaded = load_policy(&path).unwrap().unwrap();
        assert_eq!(loaded.n_requests(), 1);
        delete(&path).unwrap();
    }

    #[test]
    fn test_delete_nonexistent_ok() {
        assert!(delete(Path::new("/tmp/concord_does_not_exist.json")).is_ok());
    }

    #[test]
    fn test_content_hash_is_hex_sha256() {
        let hash = content_hash("hello");
        assert_eq!(hash.len(), 64);
        assert_eq!(
            hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
