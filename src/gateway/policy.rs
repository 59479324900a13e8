//! Access policy store: age verification records and per-conversation
//! feature toggles.
//!
//! Verification records live in memory and are mirrored to a JSON snapshot
//! on every change. Group toggles are read through a moka cache in front of
//! the external [`GroupSettingsStore`]; toggles are written through it under
//! one lock. Persistence failures are logged and the store keeps serving
//! from memory.

use crate::gateway::clock::Clock;
use crate::gateway::identity::{Identity, IdentityNormalizer, RawIdentity};
use crate::storage::{
    read_json_optional, write_json_atomic, FeatureSetting, GroupSettingsStore, StorageError,
};
use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Upper bound for cached group policies
const GROUP_CACHE_MAX_SIZE: u64 = 10_000;

/// Errors returned by policy operations
#[derive(Error, Debug)]
pub enum PolicyError {
    /// Asserted age is below the configured minimum
    #[error("asserted age {asserted} is below the minimum of {minimum}")]
    TooYoung {
        /// Age given by the requester
        asserted: u32,
        /// Configured minimum age
        minimum: u32,
    },
    /// Identity could not be normalized
    #[error("identity could not be normalized")]
    InvalidIdentity,
    /// Conversation id is empty
    #[error("conversation id is empty")]
    InvalidConversation,
    /// External settings write failed; nothing was changed
    #[error("settings update failed: {0}")]
    Settings(#[from] StorageError),
}

/// Proof that an identity asserted an acceptable age
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRecord {
    /// Canonical identity
    pub identity: Identity,
    /// When the verification happened
    pub verified_at: DateTime<Utc>,
    /// Age given at verification, absent for records from older snapshots
    pub asserted_age: Option<u32>,
}

/// Feature toggle state of one conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupPolicy {
    /// Conversation the toggle applies to
    pub conversation_id: String,
    /// Whether the feature is on
    pub enabled: bool,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

/// On-disk form of a verification record
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEntry {
    verified: bool,
    /// Epoch milliseconds
    timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    asserted_age: Option<u32>,
}

/// Static options of an [`AccessPolicyStore`]
#[derive(Debug, Clone)]
pub struct PolicyOptions {
    /// Snapshot file, `None` keeps verifications in memory only
    pub snapshot_path: Option<PathBuf>,
    /// Sub-key owned by the gateway in each conversation's settings
    pub feature_key: String,
    /// Domain for bare identities
    pub identity_domain: String,
    /// Minimum accepted age
    pub minimum_age: u32,
}

impl Default for PolicyOptions {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            feature_key: "media".to_string(),
            identity_domain: "telegram".to_string(),
            minimum_age: crate::config::MINIMUM_AGE,
        }
    }
}

/// Verification records plus per-conversation feature flags
pub struct AccessPolicyStore {
    records: RwLock<HashMap<Identity, VerificationRecord>>,
    snapshot_path: Option<PathBuf>,
    /// Serializes snapshot writes
    writer: Mutex<()>,
    groups: Cache<String, GroupPolicy>,
    /// Serializes toggles; counts them so a cache fill that raced a toggle
    /// is dropped instead of cached
    group_writes: Mutex<u64>,
    settings: Arc<dyn GroupSettingsStore>,
    feature_key: String,
    normalizer: IdentityNormalizer,
    minimum_age: u32,
    clock: Arc<dyn Clock>,
}

impl AccessPolicyStore {
    /// Create an empty store
    #[must_use]
    pub fn new(
        options: PolicyOptions,
        settings: Arc<dyn GroupSettingsStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            snapshot_path: options.snapshot_path,
            writer: Mutex::new(()),
            groups: Cache::builder().max_capacity(GROUP_CACHE_MAX_SIZE).build(),
            group_writes: Mutex::new(0),
            settings,
            feature_key: options.feature_key,
            normalizer: IdentityNormalizer::new(&options.identity_domain),
            minimum_age: options.minimum_age,
            clock,
        }
    }

    /// Create a store and fill it from the snapshot file.
    ///
    /// A missing snapshot is an empty store. An unreadable one is logged and
    /// also yields an empty store.
    pub async fn load(
        options: PolicyOptions,
        settings: Arc<dyn GroupSettingsStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = Self::new(options, settings, clock);
        let Some(path) = store.snapshot_path.clone() else {
            return store;
        };

        let entries = match read_json_optional::<HashMap<String, SnapshotEntry>>(&path).await {
            Ok(Some(entries)) => entries,
            Ok(None) => {
                info!(path = %path.display(), "No verification snapshot yet, starting empty");
                return store;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read verification snapshot, starting empty");
                return store;
            }
        };

        let now = store.clock.now();
        let mut records = store.records.write().await;
        for (key, entry) in entries {
            if !entry.verified {
                continue;
            }
            let Some(identity) = store.normalizer.normalize(key.as_str()) else {
                warn!(key = %key, "Skipping snapshot entry with unusable identity");
                continue;
            };
            let verified_at = DateTime::from_timestamp_millis(entry.timestamp).unwrap_or(now);
            records.insert(
                identity.clone(),
                VerificationRecord {
                    identity,
                    verified_at,
                    asserted_age: entry.asserted_age,
                },
            );
        }
        info!(count = records.len(), "Loaded verification snapshot");
        drop(records);
        store
    }

    /// Normalize a raw identity with this store's rules
    pub fn normalize(&self, identity: impl Into<RawIdentity>) -> Option<Identity> {
        self.normalizer.normalize(identity)
    }

    /// Record a successful age verification.
    ///
    /// # Errors
    ///
    /// Returns `PolicyError::TooYoung` below the minimum age (no record is
    /// created) and `PolicyError::InvalidIdentity` for unusable identities.
    pub async fn verify(
        &self,
        identity: impl Into<RawIdentity>,
        asserted_age: u32,
    ) -> Result<VerificationRecord, PolicyError> {
        let identity = self
            .normalizer
            .normalize(identity)
            .ok_or(PolicyError::InvalidIdentity)?;

        if asserted_age < self.minimum_age {
            debug!(identity = %identity, asserted_age, "Verification rejected");
            return Err(PolicyError::TooYoung {
                asserted: asserted_age,
                minimum: self.minimum_age,
            });
        }

        let record = VerificationRecord {
            identity: identity.clone(),
            verified_at: self.clock.now(),
            asserted_age: Some(asserted_age),
        };
        self.records
            .write()
            .await
            .insert(identity.clone(), record.clone());
        info!(identity = %identity, "Identity verified");

        self.persist_snapshot().await;
        Ok(record)
    }

    /// Whether the identity has a verification record
    pub async fn is_verified(&self, identity: impl Into<RawIdentity>) -> bool {
        match self.normalizer.normalize(identity) {
            Some(identity) => self.records.read().await.contains_key(&identity),
            None => false,
        }
    }

    /// The verification record of an identity, if any
    pub async fn record(&self, identity: impl Into<RawIdentity>) -> Option<VerificationRecord> {
        let identity = self.normalizer.normalize(identity)?;
        self.records.read().await.get(&identity).cloned()
    }

    /// Number of verified identities
    pub async fn verified_count(&self) -> usize {
        self.records.read().await.len()
    }

    /// Turn the feature on or off for a conversation.
    ///
    /// The cache only changes after the external settings write succeeded.
    ///
    /// # Errors
    ///
    /// Returns `PolicyError::Settings` if the collaborator write fails and
    /// `PolicyError::InvalidConversation` for an empty id.
    pub async fn set_group_feature(
        &self,
        conversation_id: &str,
        enabled: bool,
    ) -> Result<GroupPolicy, PolicyError> {
        let conversation_id = conversation_id.trim();
        if conversation_id.is_empty() {
            return Err(PolicyError::InvalidConversation);
        }

        let mut writes = self.group_writes.lock().await;
        let now = self.clock.now();
        let setting = FeatureSetting {
            enabled,
            updated_at: now.timestamp_millis(),
        };
        if let Err(e) = self
            .settings
            .set_feature(conversation_id, &self.feature_key, setting)
            .await
        {
            warn!(conversation_id, error = %e, "Group settings write failed, cache unchanged");
            return Err(e.into());
        }

        let policy = GroupPolicy {
            conversation_id: conversation_id.to_string(),
            enabled,
            updated_at: now,
        };
        *writes += 1;
        self.groups
            .insert(conversation_id.to_string(), policy.clone())
            .await;
        drop(writes);
        info!(conversation_id, enabled, "Group feature updated");
        Ok(policy)
    }

    /// Whether the feature is on for a conversation.
    ///
    /// Cache first, then the settings collaborator. Disabled on miss or
    /// failure; failures are not cached. A value read while a toggle was
    /// being written is returned but not cached.
    pub async fn is_group_feature_enabled(&self, conversation_id: &str) -> bool {
        let conversation_id = conversation_id.trim();
        if conversation_id.is_empty() {
            return false;
        }
        if let Some(policy) = self.groups.get(conversation_id).await {
            return policy.enabled;
        }

        let writes_before = *self.group_writes.lock().await;
        let policy = match self.load_group_policy(conversation_id).await {
            Ok(policy) => policy,
            Err(e) => {
                warn!(conversation_id, error = %e, "Group settings read failed, treating feature as disabled");
                return false;
            }
        };

        let writes = self.group_writes.lock().await;
        if *writes == writes_before {
            self.groups
                .insert(conversation_id.to_string(), policy.clone())
                .await;
        } else {
            debug!(conversation_id, "Group toggle raced the cache fill, not caching");
        }
        drop(writes);
        policy.enabled
    }

    async fn load_group_policy(&self, conversation_id: &str) -> Result<GroupPolicy, StorageError> {
        let stored = self
            .settings
            .get_feature(conversation_id, &self.feature_key)
            .await?;
        debug!(conversation_id, found = stored.is_some(), "Group policy cache fill");

        Ok(match stored {
            Some(setting) => GroupPolicy {
                conversation_id: conversation_id.to_string(),
                enabled: setting.enabled,
                updated_at: DateTime::from_timestamp_millis(setting.updated_at)
                    .unwrap_or_else(|| self.clock.now()),
            },
            None => GroupPolicy {
                conversation_id: conversation_id.to_string(),
                enabled: false,
                updated_at: self.clock.now(),
            },
        })
    }

    /// Write the full verification snapshot; failures are logged only
    async fn persist_snapshot(&self) {
        let Some(path) = &self.snapshot_path else {
            return;
        };

        let _guard = self.writer.lock().await;
        // Taken under the writer lock so the newest state is what lands on disk
        let snapshot: BTreeMap<String, SnapshotEntry> = self
            .records
            .read()
            .await
            .values()
            .map(|record| {
                (
                    record.identity.to_string(),
                    SnapshotEntry {
                        verified: true,
                        timestamp: record.verified_at.timestamp_millis(),
                        asserted_age: record.asserted_age,
                    },
                )
            })
            .collect();

        if let Err(e) = write_json_atomic(path, &snapshot).await {
            warn!(path = %path.display(), error = %e, "Failed to persist verification snapshot, continuing in memory");
        }
    }
}
