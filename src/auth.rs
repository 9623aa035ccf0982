//! # API key issuance and verification.
//!
//! Keys are presented as `<prefix>.<secret>`. The prefix is public and only
//! routes the lookup; the secret exists in memory at issuance time and never
//! again; the store keeps its SHA-256. Verification compares hashes in
//! constant time so a timing side channel cannot narrow the secret.

use std::sync::Arc;

use rand::distr::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::{Error, Result};
use crate::store::{ApiKeyRecord, Store};

const PREFIX_LEN: usize = 8;
const SECRET_LEN: usize = 32;

/// A freshly issued key. `token` is shown exactly once.
#[derive(Debug)]
pub struct IssuedKey {
    pub record: ApiKeyRecord,
    /// Full presentation form `<prefix>.<secret>`.
    pub token: String,
}

/// Manages API keys on top of the store gateway.
pub struct ApiKeys {
    store: Arc<Store>,
}

impl ApiKeys {
    pub fn new(store: Arc<Store>) -> Arc<Self> {
        Arc::new(Self { store })
    }

    /// Issues a new key with the given label and permission names.
    pub fn issue(&self, label: &str, permissions: &[String]) -> Result<IssuedKey> {
        if label.trim().is_empty() {
            return Err(Error::validation("label", "label cannot be empty"));
        }

        let prefix = random_token(PREFIX_LEN);
        let secret = random_token(SECRET_LEN);
        let record = self.store.with_scope(|scope| {
            scope.insert_api_key(label.trim(), &prefix, &hash_secret(&secret), permissions)
        })?;

        info!(label = %record.label, prefix = %record.prefix, "api key issued");
        Ok(IssuedKey {
            token: format!("{prefix}.{secret}"),
            record,
        })
    }

    /// Verifies a presented `<prefix>.<secret>` token, returning the key
    /// record on success and stamping its `last_used`.
    pub fn verify(&self, presented: &str) -> Result<ApiKeyRecord> {
        let (prefix, secret) = presented
            .split_once('.')
            .ok_or_else(|| Error::Security("malformed API key".into()))?;

        let presented_hash = hash_secret(secret);
        self.store.with_scope(|scope| {
            let candidates = scope.find_api_keys_by_prefix(prefix)?;
            for candidate in candidates {
                if constant_time_eq(candidate.key_hash.as_bytes(), presented_hash.as_bytes()) {
                    scope.touch_api_key(candidate.id)?;
                    return Ok(candidate);
                }
            }
            Err(Error::Security("invalid API key".into()))
        })
    }

    /// True when at least one active key exists; gates route authentication.
    pub fn any_active(&self) -> Result<bool> {
        self.store.with_scope(|scope| scope.any_active_api_keys())
    }

    pub fn list(&self) -> Result<Vec<ApiKeyRecord>> {
        self.store.with_scope(|scope| scope.list_api_keys())
    }

    pub fn revoke(&self, key_id: i64) -> Result<()> {
        self.store.with_scope(|scope| scope.revoke_api_key(key_id))?;
        info!(key = key_id, "api key revoked");
        Ok(())
    }
}

fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

fn random_token(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Length-safe constant-time byte comparison.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
