//! Cached comparison of installed component versions against the latest
//! known releases.
//!
//! The cache is a single schema-versioned JSON record refreshed at most
//! once per interval. It is consumed read-only by the reporting layer
//! (the `doctor` command); the validation path never touches it, and a
//! stale or missing cache never blocks anything.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{FlowlintError, Result};

/// Bump when the cache record shape changes; mismatched records are
/// discarded, not migrated.
pub const CACHE_SCHEMA_VERSION: u32 = 1;

/// How long a cache record stays fresh.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Installed and latest-known version of one component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentVersions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest: Option<String>,
}

impl ComponentVersions {
    /// Returns `true` when both versions are known and differ.
    #[must_use]
    pub fn update_available(&self) -> bool {
        match (&self.installed, &self.latest) {
            (Some(installed), Some(latest)) => installed != latest,
            _ => false,
        }
    }
}

/// The single cached freshness record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRecord {
    pub schema: u32,
    /// Unix seconds of the last successful refresh.
    pub checked_at: u64,
    pub components: BTreeMap<String, ComponentVersions>,
}

impl CacheRecord {
    /// Returns `true` when the record is older than the refresh interval.
    #[must_use]
    pub fn is_stale(&self, now: u64) -> bool {
        now.saturating_sub(self.checked_at) >= REFRESH_INTERVAL.as_secs()
    }
}

/// Source of latest-known component versions.
///
/// Injected so the reporting layer can be exercised without network
/// access; the shipped implementation queries public release feeds.
pub trait ReleaseFeed {
    /// Latest published version of a component, or `None` when the feed
    /// does not track it.
    fn latest(&self, component: &str) -> Result<Option<String>>;
}

/// Release feed backed by public registries.
pub struct HttpReleaseFeed;

impl ReleaseFeed for HttpReleaseFeed {
    fn latest(&self, component: &str) -> Result<Option<String>> {
        match component {
            "yaml-language-server" => {
                npm_latest("https://registry.npmjs.org/yaml-language-server")
            }
            "lemminx" => github_latest("https://api.github.com/repos/eclipse-lemminx/lemminx/releases/latest"),
            "flowlint" => github_latest("https://api.github.com/repos/flowlint/flowlint/releases/latest"),
            _ => Ok(None),
        }
    }
}

fn npm_latest(url: &str) -> Result<Option<String>> {
    let mut response = ureq::get(url).call().map_err(|e| FlowlintError::Feed {
        message: format!("npm registry request failed: {e}"),
    })?;
    let body: Value = response
        .body_mut()
        .read_json()
        .map_err(|e| FlowlintError::Feed {
            message: format!("npm registry response unreadable: {e}"),
        })?;
    Ok(body
        .pointer("/dist-tags/latest")
        .and_then(Value::as_str)
        .map(str::to_string))
}

fn github_latest(url: &str) -> Result<Option<String>> {
    let mut response = ureq::get(url)
        .header("user-agent", concat!("flowlint/", env!("CARGO_PKG_VERSION")))
        .call()
        .map_err(|e| FlowlintError::Feed {
            message: format!("release feed request failed: {e}"),
        })?;
    let body: Value = response
        .body_mut()
        .read_json()
        .map_err(|e| FlowlintError::Feed {
            message: format!("release feed response unreadable: {e}"),
        })?;
    Ok(body
        .get("tag_name")
        .and_then(Value::as_str)
        .map(|tag| tag.trim_start_matches('v').to_string()))
}

/// The on-disk freshness cache.
pub struct FreshnessCache {
    path: PathBuf,
}

impl FreshnessCache {
    /// Cache at an explicit path.
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Cache at the per-user default location.
    #[must_use]
    pub fn default_location() -> Option<Self> {
        let dir = dirs::cache_dir()?.join("flowlint");
        Some(Self::at(dir.join("freshness.json")))
    }

    /// Load the cached record. A missing file, unreadable JSON, or a
    /// schema mismatch all read as "no cache".
    #[must_use]
    pub fn load(&self) -> Option<CacheRecord> {
        let text = std::fs::read_to_string(&self.path).ok()?;
        let record: CacheRecord = serde_json::from_str(&text).ok()?;
        (record.schema == CACHE_SCHEMA_VERSION).then_some(record)
    }

    /// Persist a record.
    pub fn store(&self, record: &CacheRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(record)?)?;
        Ok(())
    }

    /// Return the current record, refreshing from the feed when the
    /// cache is missing or stale.
    ///
    /// `installed` carries the locally observed versions; they are
    /// recorded alongside the feed results. Feed errors for individual
    /// components leave that component's latest unknown; freshness
    /// informs, it never blocks.
    pub fn refresh_if_stale(
        &self,
        feed: &dyn ReleaseFeed,
        installed: &[(String, Option<String>)],
        now: u64,
    ) -> CacheRecord {
        if let Some(record) = self.load() {
            if !record.is_stale(now) {
                return record;
            }
        }
        self.refresh(feed, installed, now)
    }

    /// Refresh unconditionally, ignoring any cached record.
    pub fn refresh(
        &self,
        feed: &dyn ReleaseFeed,
        installed: &[(String, Option<String>)],
        now: u64,
    ) -> CacheRecord {
        let mut components = BTreeMap::new();
        for (name, installed_version) in installed {
            let latest = match feed.latest(name) {
                Ok(latest) => latest,
                Err(e) => {
                    log::debug!("freshness feed failed for {name}: {e}");
                    None
                }
            };
            components.insert(
                name.clone(),
                ComponentVersions {
                    installed: installed_version.clone(),
                    latest,
                },
            );
        }

        let record = CacheRecord {
            schema: CACHE_SCHEMA_VERSION,
            checked_at: now,
            components,
        };
        if let Err(e) = self.store(&record) {
            log::debug!("freshness cache not written: {e}");
        }
        record
    }
}

/// Current time as unix seconds.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Render a cache record as human-readable text.
#[must_use]
pub fn format_text(record: &CacheRecord, now: u64) -> String {
    let mut out = String::new();
    let age_days = now.saturating_sub(record.checked_at) / (24 * 60 * 60);
    out.push_str(&format!("Last checked: {age_days} day(s) ago\n"));
    for (name, versions) in &record.components {
        let installed = versions.installed.as_deref().unwrap_or("not installed");
        let latest = versions.latest.as_deref().unwrap_or("unknown");
        let marker = if versions.update_available() {
            "  (update available)"
        } else {
            ""
        };
        out.push_str(&format!("  {name}: {installed} -> latest {latest}{marker}\n"));
    }
    out
}
