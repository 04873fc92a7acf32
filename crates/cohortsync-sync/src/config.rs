use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use cohortsync_adapters::DEFAULT_GRAPH_BASE_URL;
use cohortsync_core::{NamespaceMarker, DEFAULT_NAMESPACE_MARKER};
use cohortsync_storage::{HttpClientConfig, TokenBucketConfig};
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "cohortsync.yaml";

/// Runtime settings: defaults, then an optional YAML file, then environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub namespace_marker: String,
    pub graph_base_url: String,
    pub graph_access_token: Option<String>,
    pub groups_fixture: Option<PathBuf>,
    pub cache_dir: PathBuf,
    pub reports_dir: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Client-side cap on Graph requests; `None` leaves throttling to `Retry-After`.
    pub graph_requests_per_second: Option<u32>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            namespace_marker: DEFAULT_NAMESPACE_MARKER.to_string(),
            graph_base_url: DEFAULT_GRAPH_BASE_URL.to_string(),
            graph_access_token: None,
            groups_fixture: None,
            cache_dir: PathBuf::from("./cache"),
            reports_dir: None,
            scheduler_enabled: false,
            sync_cron: "0 */6 * * *".to_string(),
            user_agent: "cohortsync/0.1".to_string(),
            http_timeout_secs: 30,
            graph_requests_per_second: None,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        let path = std::env::var("COHORTSYNC_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        let mut config = if path.exists() {
            Self::from_yaml_file(&path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Overlays environment values. Empty values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("DATABASE_URL") {
            self.database_url = Some(v);
        }
        if let Some(v) = get("COHORTSYNC_NAMESPACE") {
            self.namespace_marker = v;
        }
        if let Some(v) = get("GRAPH_BASE_URL") {
            self.graph_base_url = v;
        }
        if let Some(v) = get("GRAPH_ACCESS_TOKEN") {
            self.graph_access_token = Some(v);
        }
        if let Some(v) = get("COHORTSYNC_GROUPS_FIXTURE") {
            self.groups_fixture = Some(PathBuf::from(v));
        }
        if let Some(v) = get("COHORTSYNC_CACHE_DIR") {
            self.cache_dir = PathBuf::from(v);
        }
        if let Some(v) = get("COHORTSYNC_REPORTS_DIR") {
            self.reports_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get("COHORTSYNC_SCHEDULER_ENABLED") {
            self.scheduler_enabled = matches!(v.as_str(), "1" | "true" | "TRUE" | "True");
        }
        if let Some(v) = get("SYNC_CRON") {
            self.sync_cron = v;
        }
        if let Some(v) = get("COHORTSYNC_USER_AGENT") {
            self.user_agent = v;
        }
        if let Some(v) = get("COHORTSYNC_HTTP_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.http_timeout_secs = v;
        }
        if let Some(v) = get("COHORTSYNC_GRAPH_REQUESTS_PER_SECOND").and_then(|v| v.parse().ok()) {
            self.graph_requests_per_second = Some(v);
        }
    }

    pub fn namespace(&self) -> NamespaceMarker {
        NamespaceMarker::new(self.namespace_marker.clone())
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            token_bucket: self
                .graph_requests_per_second
                .filter(|rps| *rps > 0)
                .map(TokenBucketConfig::per_second),
            ..Default::default()
        }
    }

    pub fn group_cache_path(&self) -> PathBuf {
        self.cache_dir.join("directory_groups.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn yaml_fills_only_the_fields_it_names() {
        let config = SyncConfig::from_yaml_str(
            "namespace_marker: team-\nreports_dir: ./reports\nhttp_timeout_secs: 5\n",
        )
        .unwrap();
        assert_eq!(config.namespace_marker, "team-");
        assert_eq!(config.reports_dir, Some(PathBuf::from("./reports")));
        assert_eq!(config.http_timeout_secs, 5);
        assert_eq!(config.graph_base_url, DEFAULT_GRAPH_BASE_URL);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn empty_yaml_is_default() {
        assert_eq!(SyncConfig::from_yaml_str("  \n").unwrap(), SyncConfig::default());
    }

    #[test]
    fn unknown_yaml_type_is_an_error() {
        assert!(SyncConfig::from_yaml_str("http_timeout_secs: soon").is_err());
    }

    #[test]
    fn env_overrides_yaml_and_skips_blank_values() {
        let env: HashMap<&str, &str> = [
            ("DATABASE_URL", "postgres://localhost/cohorts"),
            ("COHORTSYNC_NAMESPACE", "crowd-"),
            ("GRAPH_ACCESS_TOKEN", "   "),
            ("COHORTSYNC_SCHEDULER_ENABLED", "true"),
            ("COHORTSYNC_HTTP_TIMEOUT_SECS", "not-a-number"),
            ("COHORTSYNC_GRAPH_REQUESTS_PER_SECOND", "8"),
        ]
        .into_iter()
        .collect();

        let mut config = SyncConfig::from_yaml_str("namespace_marker: team-\n").unwrap();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/cohorts"));
        assert_eq!(config.namespace().as_str(), "crowd-");
        assert!(config.graph_access_token.is_none());
        assert!(config.scheduler_enabled);
        assert_eq!(config.http_timeout_secs, 30);
        assert_eq!(config.graph_requests_per_second, Some(8));
    }

    #[test]
    fn request_rate_becomes_a_token_bucket() {
        let config = SyncConfig::from_yaml_str("graph_requests_per_second: 5
http_timeout_secs: 9
")
            .unwrap();
        let http = config.http_client_config();
        assert_eq!(http.timeout, Duration::from_secs(9));
        assert_eq!(http.user_agent.as_deref(), Some("cohortsync/0.1"));
        assert_eq!(http.token_bucket, Some(TokenBucketConfig::per_second(5)));

        assert!(SyncConfig::default().http_client_config().token_bucket.is_none());
        let zero = SyncConfig {
            graph_requests_per_second: Some(0),
            ..Default::default()
        };
        assert!(zero.http_client_config().token_bucket.is_none());
    }
}
