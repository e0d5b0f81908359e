//! Thread-safe custody of bearer secrets with bounded lifetime.
//!
//! No code outside this module reads a stored secret; callers hand a
//! presented secret back in for verification. Comparison runs in constant
//! time with respect to secret contents. Expired records are removed on
//! first post-expiry access, and a periodic sweep can be scheduled when a
//! cleanup interval is configured.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::Result;
use crate::ids::random_secret;

/// Kind of a stored bearer secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// Authenticates a live plugin connection; owner key is a `runtime_id`.
    Runtime,
    /// Authenticates calls on one capability grant; owner key is a `grant_id`.
    CapabilityGrant,
}

/// Outcome of validating a presented secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    /// The credential is currently accepted.
    Valid,
    /// A record existed but its lifetime has passed; it has been removed.
    Expired,
    /// No record, or the presented secret does not match.
    Unknown,
}

/// A secret freshly issued to a caller. The store keeps its own copy; this
/// one is handed to the plugin and zeroized on drop.
#[derive(Debug)]
pub struct IssuedToken {
    pub secret: Zeroizing<String>,
    pub expires_at: DateTime<Utc>,
}

struct TokenRecord {
    secret: Zeroizing<String>,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    kind: TokenKind,
    /// Runtime identity this record ultimately belongs to. For runtime
    /// tokens this equals the owner key; for grant tokens it names the
    /// granting runtime, so owner revocation can cascade.
    runtime_id: String,
}

impl TokenRecord {
    fn expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Thread-safe map from owner key to token record with TTL.
///
/// The validation path takes the read lock; expiry removal and issuance
/// take the write lock briefly. No lock is ever held across a suspension
/// point.
pub struct TokenStore {
    records: RwLock<HashMap<String, TokenRecord>>,
    /// Owner keys already warned about post-expiry use, so the expiry
    /// warning fires once per key.
    expiry_warned: Mutex<HashSet<String>>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            expiry_warned: Mutex::new(HashSet::new()),
        }
    }

    /// Issue a secret for `owner_key`.
    ///
    /// For [`TokenKind::Runtime`] the owner key is the runtime id itself.
    /// Fails with `Internal` when the CSPRNG is unavailable; a
    /// deterministic or zero secret is never produced.
    pub fn issue(&self, owner_key: &str, kind: TokenKind, ttl: Duration) -> Result<IssuedToken> {
        let runtime_id = owner_key.to_string();
        self.issue_bound(owner_key, kind, &runtime_id, ttl)
    }

    /// Issue a secret whose record is bound to a specific runtime
    /// identity, so [`TokenStore::revoke_by_runtime`] can cascade to it.
    /// Used for capability-grant tokens.
    pub fn issue_bound(
        &self,
        owner_key: &str,
        kind: TokenKind,
        runtime_id: &str,
        ttl: Duration,
    ) -> Result<IssuedToken> {
        let secret = random_secret()?;
        let now = Utc::now();
        let expires_at = now + ttl;

        let record = TokenRecord {
            secret: secret.clone(),
            issued_at: now,
            expires_at,
            kind,
            runtime_id: runtime_id.to_string(),
        };

        debug!(
            owner_key,
            ?kind,
            issued_at = %record.issued_at,
            expires_at = %record.expires_at,
            "[TokenStore] Issued token"
        );
        self.records.write().insert(owner_key.to_string(), record);

        Ok(IssuedToken { secret, expires_at })
    }

    /// Validate a presented secret against the record for `owner_key`.
    ///
    /// Lookup is O(1). An expired record is removed before `Expired` is
    /// returned. The byte comparison is constant-time; a length mismatch
    /// short-circuits, which is acceptable only because secret length is
    /// fixed per kind and public.
    pub fn validate(&self, owner_key: &str, presented: &str) -> Validation {
        self.validate_kind(owner_key, presented, None)
    }

    /// [`TokenStore::validate`], additionally requiring the record's kind
    /// to match. A kind mismatch is indistinguishable from an unknown
    /// credential.
    pub fn validate_kind(
        &self,
        owner_key: &str,
        presented: &str,
        expected_kind: Option<TokenKind>,
    ) -> Validation {
        let now = Utc::now();
        {
            let records = self.records.read();
            let Some(record) = records.get(owner_key) else {
                return Validation::Unknown;
            };
            if !record.expired_at(now) {
                if let Some(kind) = expected_kind {
                    if record.kind != kind {
                        return Validation::Unknown;
                    }
                }
                if record.secret.len() != presented.len() {
                    return Validation::Unknown;
                }
                return if bool::from(record.secret.as_bytes().ct_eq(presented.as_bytes())) {
                    Validation::Valid
                } else {
                    Validation::Unknown
                };
            }
        }

        // Lazy expiry: drop the read lock, remove under the write lock,
        // re-checking in case a concurrent caller re-issued.
        let mut records = self.records.write();
        if let Some(record) = records.get(owner_key) {
            if record.expired_at(now) {
                records.remove(owner_key);
                drop(records);
                self.warn_expired(owner_key);
                return Validation::Expired;
            }
        }
        drop(records);
        // Re-issued concurrently; evaluate against the fresh record.
        self.validate_kind(owner_key, presented, expected_kind)
    }

    /// Remove the record for `owner_key`. Returns whether one existed.
    pub fn revoke(&self, owner_key: &str) -> bool {
        let removed = self.records.write().remove(owner_key).is_some();
        if removed {
            debug!(owner_key, "[TokenStore] Revoked token");
        }
        removed
    }

    /// Remove every record belonging to `runtime_id`: its runtime token
    /// and all grant tokens it owns. Returns the removed owner keys.
    pub fn revoke_by_runtime(&self, runtime_id: &str) -> Vec<String> {
        let mut records = self.records.write();
        let owners: Vec<String> = records
            .iter()
            .filter(|(_, r)| r.runtime_id == runtime_id)
            .map(|(k, _)| k.clone())
            .collect();
        for owner in &owners {
            records.remove(owner);
        }
        drop(records);
        if !owners.is_empty() {
            debug!(runtime_id, count = owners.len(), "[TokenStore] Revoked by runtime");
        }
        owners
    }

    /// Remove every expired record. Returns the removed owner keys so the
    /// caller can cascade (e.g. drop grants and registry nodes).
    pub fn sweep(&self) -> Vec<String> {
        let now = Utc::now();
        let mut records = self.records.write();
        let expired: Vec<String> = records
            .iter()
            .filter(|(_, r)| r.expired_at(now))
            .map(|(k, _)| k.clone())
            .collect();
        for owner in &expired {
            records.remove(owner);
        }
        drop(records);
        if !expired.is_empty() {
            debug!(count = expired.len(), "[TokenStore] Swept expired tokens");
        }
        expired
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn warn_expired(&self, owner_key: &str) {
        let mut warned = self.expiry_warned.lock();
        if warned.insert(owner_key.to_string()) {
            warn!(owner_key, "[TokenStore] Expired token presented; record removed");
        }
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Run [`TokenStore::sweep`] every `interval` until the token is
/// cancelled, invoking `on_expired` with the removed owner keys.
pub fn spawn_sweeper<F>(
    store: std::sync::Arc<TokenStore>,
    interval: std::time::Duration,
    cancel: CancellationToken,
    on_expired: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn(Vec<String>) + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let expired = store.sweep();
                    if !expired.is_empty() {
                        on_expired(expired);
                    }
                }
            }
        }
    })
}
