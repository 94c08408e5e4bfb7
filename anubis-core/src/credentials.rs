//! Durable storage for platform credentials, provider API keys and settings.
//!
//! The store loads eagerly at construction and rewrites the affected snapshot
//! file on every mutation. In-memory state stays authoritative for the
//! lifetime of the process: a failed write is reported to the caller but the
//! mutation is kept, so the operation can simply be retried.
//!
//! Layout under the sessions directory:
//! - `platforms.json`: platform name -> [`PlatformCredential`]
//! - `api_keys.json`: provider name -> [`ApiKeyRecord`]
//! - `settings.json`: flat key/value settings

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::CredentialError;
use crate::persistence::{atomic_write_json, load_json_or_default};

/// Opaque secret material for a platform (e.g. `token`).
pub type Credentials = BTreeMap<String, String>;

/// Free-form JSON attributes (settings, metadata).
pub type Attributes = BTreeMap<String, Value>;

/// Credentials plus bookkeeping for one messaging platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformCredential {
    pub platform: String,
    pub credentials: Credentials,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub settings: Attributes,
    #[serde(default)]
    pub metadata: Attributes,
}

/// An API key for an LLM provider, with usage counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub provider: String,
    pub key: String,
    pub added_at: DateTime<Utc>,
    #[serde(default)]
    pub tokens_used: u64,
    /// `-1` means unknown or unlimited.
    #[serde(default = "unknown_remaining")]
    pub tokens_remaining: i64,
    #[serde(default = "default_true")]
    pub active: bool,
    pub last_used: DateTime<Utc>,
}

fn unknown_remaining() -> i64 {
    -1
}

fn default_true() -> bool {
    true
}

/// API key listing entry that never carries the key itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiKeySummary {
    pub provider: String,
    pub added_at: DateTime<Utc>,
    pub tokens_used: u64,
    pub tokens_remaining: i64,
    pub active: bool,
    pub last_used: DateTime<Utc>,
}

impl From<&ApiKeyRecord> for ApiKeySummary {
    fn from(record: &ApiKeyRecord) -> Self {
        Self {
            provider: record.provider.clone(),
            added_at: record.added_at,
            tokens_used: record.tokens_used,
            tokens_remaining: record.tokens_remaining,
            active: record.active,
            last_used: record.last_used,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PlatformsFile {
    #[serde(default)]
    platforms: BTreeMap<String, PlatformCredential>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_saved: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ApiKeysFile {
    #[serde(default)]
    keys: BTreeMap<String, ApiKeyRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_saved: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct StoreState {
    platforms: BTreeMap<String, PlatformCredential>,
    api_keys: BTreeMap<String, ApiKeyRecord>,
    settings: BTreeMap<String, Value>,
}

/// File-backed credential store. Single writer per sessions directory.
pub struct CredentialStore {
    platforms_file: PathBuf,
    api_keys_file: PathBuf,
    settings_file: PathBuf,
    state: Mutex<StoreState>,
}

impl CredentialStore {
    /// Open the store rooted at `sessions_dir`, loading whatever snapshots
    /// exist. Missing or corrupt files yield an empty section.
    pub fn open(sessions_dir: impl Into<PathBuf>) -> Self {
        let dir = sessions_dir.into();
        let platforms_file = dir.join("platforms.json");
        let api_keys_file = dir.join("api_keys.json");
        let settings_file = dir.join("settings.json");

        let platforms: PlatformsFile = load_json_or_default(&platforms_file, "platforms");
        let api_keys: ApiKeysFile = load_json_or_default(&api_keys_file, "API keys");
        let settings: BTreeMap<String, Value> = load_json_or_default(&settings_file, "settings");

        debug!(
            platforms = platforms.platforms.len(),
            api_keys = api_keys.keys.len(),
            "Loaded credential store"
        );

        Self {
            platforms_file,
            api_keys_file,
            settings_file,
            state: Mutex::new(StoreState {
                platforms: platforms.platforms,
                api_keys: api_keys.keys,
                settings,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Platforms ──────────────────────────────────────────────────────────

    /// Insert or update the credential record for `platform`.
    ///
    /// Credentials are replaced wholesale; settings and metadata are merged
    /// key by key with the new values winning. The record is always marked
    /// active and its `last_used` refreshed.
    pub fn save_credential(
        &self,
        platform: &str,
        credentials: Credentials,
        settings: Option<Attributes>,
        metadata: Option<Attributes>,
    ) -> Result<PlatformCredential, CredentialError> {
        let now = Utc::now();
        let mut state = self.state();

        let record = state
            .platforms
            .entry(platform.to_string())
            .and_modify(|existing| {
                existing.credentials = credentials.clone();
                existing.last_used = now;
                existing.active = true;
            })
            .or_insert_with(|| PlatformCredential {
                platform: platform.to_string(),
                credentials: credentials.clone(),
                created_at: now,
                last_used: now,
                active: true,
                settings: Attributes::new(),
                metadata: Attributes::new(),
            });
        if let Some(settings) = settings {
            record.settings.extend(settings);
        }
        if let Some(metadata) = metadata {
            record.metadata.extend(metadata);
        }
        let saved = record.clone();

        self.write_platforms(&state)?;
        info!(platform, "Saved platform credentials");
        Ok(saved)
    }

    /// Get the record for `platform`, active or not.
    pub fn get_credential(&self, platform: &str) -> Option<PlatformCredential> {
        self.state().platforms.get(platform).cloned()
    }

    /// True only when a record exists and is active.
    pub fn has_active(&self, platform: &str) -> bool {
        self.state()
            .platforms
            .get(platform)
            .is_some_and(|r| r.active)
    }

    /// Names of all active platforms.
    pub fn list_active_platforms(&self) -> BTreeSet<String> {
        self.state()
            .platforms
            .values()
            .filter(|r| r.active)
            .map(|r| r.platform.clone())
            .collect()
    }

    /// Credentials of every active platform, keyed by platform.
    pub fn active_credentials(&self) -> BTreeMap<String, Credentials> {
        self.state()
            .platforms
            .values()
            .filter(|r| r.active)
            .map(|r| (r.platform.clone(), r.credentials.clone()))
            .collect()
    }

    /// Mark a platform inactive without discarding its data.
    pub fn deactivate(&self, platform: &str) -> Result<(), CredentialError> {
        let mut state = self.state();
        let record = state
            .platforms
            .get_mut(platform)
            .ok_or_else(|| CredentialError::NotFound {
                key: platform.to_string(),
            })?;
        record.active = false;
        self.write_platforms(&state)?;
        info!(platform, "Deactivated platform");
        Ok(())
    }

    /// Remove a platform record entirely.
    pub fn delete(&self, platform: &str) -> Result<(), CredentialError> {
        let mut state = self.state();
        if state.platforms.remove(platform).is_none() {
            return Err(CredentialError::NotFound {
                key: platform.to_string(),
            });
        }
        self.write_platforms(&state)?;
        info!(platform, "Deleted platform credentials");
        Ok(())
    }

    /// Human-readable description of the connected platforms.
    pub fn connection_context(&self) -> String {
        let state = self.state();
        let active: Vec<&PlatformCredential> =
            state.platforms.values().filter(|r| r.active).collect();
        if active.is_empty() {
            return "No platforms are currently set up.".to_string();
        }

        let mut lines = vec!["Connected platforms:".to_string()];
        for record in active {
            lines.push(format!("  - {}: Active", record.platform));
            if let Some(name) = record.metadata.get("bot_name").and_then(display_value) {
                lines.push(format!("    Bot: @{name}"));
            }
            if let Some(chat) = record.metadata.get("chat_id").and_then(display_value) {
                lines.push(format!("    Chat: {chat}"));
            }
        }
        lines.join("\n")
    }

    // ── API keys ───────────────────────────────────────────────────────────

    /// Store (or replace) the API key for `provider`, resetting its counters.
    pub fn save_api_key(&self, provider: &str, key: &str) -> Result<ApiKeyRecord, CredentialError> {
        let now = Utc::now();
        let record = ApiKeyRecord {
            provider: provider.to_string(),
            key: key.to_string(),
            added_at: now,
            tokens_used: 0,
            tokens_remaining: -1,
            active: true,
            last_used: now,
        };
        let mut state = self.state();
        state.api_keys.insert(provider.to_string(), record.clone());
        self.write_api_keys(&state)?;
        info!(provider, "Saved API key");
        Ok(record)
    }

    /// Return the key for `provider` if it exists and is active.
    ///
    /// Touches `last_used`. A failure to persist the touch is logged rather
    /// than returned: the read itself succeeded.
    pub fn get_api_key(&self, provider: &str) -> Option<String> {
        let mut state = self.state();
        let record = state.api_keys.get_mut(provider).filter(|r| r.active)?;
        record.last_used = Utc::now();
        let key = record.key.clone();
        if let Err(e) = self.write_api_keys(&state) {
            warn!(provider, error = %e, "Failed to persist API key usage timestamp");
        }
        Some(key)
    }

    /// True when an active key exists for `provider`.
    pub fn has_api_key(&self, provider: &str) -> bool {
        self.state()
            .api_keys
            .get(provider)
            .is_some_and(|r| r.active)
    }

    /// Add `tokens_used` to the running total and replace the remaining
    /// allowance.
    pub fn record_usage(
        &self,
        provider: &str,
        tokens_used: u64,
        tokens_remaining: i64,
    ) -> Result<(), CredentialError> {
        let mut state = self.state();
        let record = state
            .api_keys
            .get_mut(provider)
            .ok_or_else(|| CredentialError::NotFound {
                key: provider.to_string(),
            })?;
        record.tokens_used = record.tokens_used.saturating_add(tokens_used);
        record.tokens_remaining = tokens_remaining;
        debug!(
            provider,
            tokens_used = record.tokens_used,
            tokens_remaining,
            "Recorded token usage"
        );
        self.write_api_keys(&state)
    }

    /// List keys without revealing the key material.
    pub fn list_api_keys(&self) -> Vec<ApiKeySummary> {
        self.state().api_keys.values().map(Into::into).collect()
    }

    pub fn deactivate_api_key(&self, provider: &str) -> Result<(), CredentialError> {
        let mut state = self.state();
        let record = state
            .api_keys
            .get_mut(provider)
            .ok_or_else(|| CredentialError::NotFound {
                key: provider.to_string(),
            })?;
        record.active = false;
        self.write_api_keys(&state)
    }

    pub fn delete_api_key(&self, provider: &str) -> Result<(), CredentialError> {
        let mut state = self.state();
        if state.api_keys.remove(provider).is_none() {
            return Err(CredentialError::NotFound {
                key: provider.to_string(),
            });
        }
        self.write_api_keys(&state)?;
        info!(provider, "Deleted API key");
        Ok(())
    }

    // ── Settings ───────────────────────────────────────────────────────────

    pub fn save_setting(&self, key: &str, value: Value) -> Result<(), CredentialError> {
        let mut state = self.state();
        state.settings.insert(key.to_string(), value);
        write_snapshot(&self.settings_file, &state.settings)
    }

    pub fn get_setting(&self, key: &str) -> Option<Value> {
        self.state().settings.get(key).cloned()
    }

    // ── Persistence ────────────────────────────────────────────────────────

    fn write_platforms(&self, state: &StoreState) -> Result<(), CredentialError> {
        let file = PlatformsFile {
            platforms: state.platforms.clone(),
            last_saved: Some(Utc::now()),
        };
        write_snapshot(&self.platforms_file, &file)
    }

    fn write_api_keys(&self, state: &StoreState) -> Result<(), CredentialError> {
        let file = ApiKeysFile {
            keys: state.api_keys.clone(),
            last_saved: Some(Utc::now()),
        };
        write_snapshot(&self.api_keys_file, &file)
    }
}

fn write_snapshot<T: Serialize>(path: &Path, data: &T) -> Result<(), CredentialError> {
    atomic_write_json(path, data).map_err(|e| {
        warn!(path = %path.display(), error = %e, "Credential snapshot write failed");
        CredentialError::Persistence {
            path: path.to_path_buf(),
            message: e.to_string(),
        }
    })
}

fn display_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
