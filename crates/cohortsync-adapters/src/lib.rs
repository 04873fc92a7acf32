//! Directory group sources and membership synchronizer contracts.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use cohortsync_core::{CohortId, ExternalGroup};
use cohortsync_storage::{CacheRefresh, FetchError, GroupCache, HttpFetcher, StoreError};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "cohortsync-adapters";

pub const DEFAULT_GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("group cache: {0}")]
    Cache(#[from] StoreError),
    #[error("reading group fixture {path}: {source}")]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed group listing: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("paging aborted: {0}")]
    Paging(String),
}

/// Source of external groups. `list_groups` serves whatever the last successful refresh cached.
#[async_trait]
pub trait GroupDirectory: Send + Sync {
    async fn refresh_cache(&self) -> Result<CacheRefresh, DirectoryError>;

    async fn list_groups(&self) -> Vec<ExternalGroup>;
}

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("{0}")]
    Message(String),
}

/// Makes a cohort's membership match its directory group.
#[async_trait]
pub trait MembershipSynchronizer: Send + Sync {
    async fn sync_members(
        &self,
        external_group_id: &str,
        local_group_id: CohortId,
    ) -> Result<(), MembershipError>;
}

/// Records sync requests in the log and does nothing else.
#[derive(Debug, Default)]
pub struct LoggingMembershipSynchronizer;

#[async_trait]
impl MembershipSynchronizer for LoggingMembershipSynchronizer {
    async fn sync_members(
        &self,
        external_group_id: &str,
        local_group_id: CohortId,
    ) -> Result<(), MembershipError> {
        info!(external_group_id, local_group_id, "membership sync requested");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct GraphGroup {
    id: String,
    #[serde(rename = "displayName", default)]
    display_name: Option<String>,
}

impl From<GraphGroup> for ExternalGroup {
    fn from(group: GraphGroup) -> Self {
        ExternalGroup::new(group.id, group.display_name.unwrap_or_default())
    }
}

#[derive(Debug, Deserialize)]
struct GraphPage {
    #[serde(default)]
    value: Vec<GraphGroup>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

/// One page of a Graph `/groups` listing and the link to the next page, if any.
pub fn parse_group_page(
    body: JsonValue,
) -> Result<(Vec<ExternalGroup>, Option<String>), DirectoryError> {
    let page: GraphPage = serde_json::from_value(body)?;
    Ok((
        page.value.into_iter().map(ExternalGroup::from).collect(),
        page.next_link,
    ))
}

#[derive(Debug, Clone)]
pub struct GraphDirectoryConfig {
    pub base_url: String,
    pub access_token: String,
    pub page_size: u32,
    pub max_pages: usize,
}

impl GraphDirectoryConfig {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_GRAPH_BASE_URL.to_string(),
            access_token: access_token.into(),
            page_size: 999,
            max_pages: 1_000,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn first_page_url(&self) -> String {
        format!(
            "{}/groups?$select=id,displayName&$top={}",
            self.base_url.trim_end_matches('/'),
            self.page_size.max(1)
        )
    }
}

/// Microsoft Graph backed directory.
#[derive(Debug)]
pub struct GraphGroupDirectory {
    config: GraphDirectoryConfig,
    http: Arc<HttpFetcher>,
    cache: GroupCache,
}

impl GraphGroupDirectory {
    pub fn new(config: GraphDirectoryConfig, http: Arc<HttpFetcher>, cache: GroupCache) -> Self {
        Self {
            config,
            http,
            cache,
        }
    }

    async fn fetch_all_groups(&self) -> Result<Vec<ExternalGroup>, DirectoryError> {
        let mut groups = Vec::new();
        let mut next = Some(self.config.first_page_url());
        let mut pages = 0usize;

        while let Some(url) = next.take() {
            if pages >= self.config.max_pages {
                return Err(DirectoryError::Paging(format!(
                    "more than {} pages",
                    self.config.max_pages
                )));
            }
            let body = self
                .http
                .get_json(&url, Some(self.config.access_token.as_str()))
                .await?;
            let (page, next_link) = parse_group_page(body)?;
            pages += 1;
            debug!(page = pages, groups = page.len(), "fetched group page");
            groups.extend(page);

            if next_link.as_deref() == Some(url.as_str()) {
                return Err(DirectoryError::Paging(format!("next link repeats {url}")));
            }
            next = next_link;
        }

        Ok(groups)
    }
}

#[async_trait]
impl GroupDirectory for GraphGroupDirectory {
    async fn refresh_cache(&self) -> Result<CacheRefresh, DirectoryError> {
        let fetched_at = Utc::now();
        let groups = self.fetch_all_groups().await?;
        Ok(self.cache.replace(groups, fetched_at).await?)
    }

    async fn list_groups(&self) -> Vec<ExternalGroup> {
        self.cache.groups().await
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FixtureListing {
    Bare(Vec<GraphGroup>),
    Page(GraphPage),
}

/// Directory read from a JSON file: a bare array of groups or a Graph-style `{"value": [...]}` page.
#[derive(Debug)]
pub struct FixtureGroupDirectory {
    path: PathBuf,
    cache: GroupCache,
}

impl FixtureGroupDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: GroupCache::in_memory(),
        }
    }

    pub fn with_cache(mut self, cache: GroupCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl GroupDirectory for FixtureGroupDirectory {
    async fn refresh_cache(&self) -> Result<CacheRefresh, DirectoryError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| DirectoryError::Fixture {
                path: self.path.clone(),
                source,
            })?;
        let groups = match serde_json::from_str::<FixtureListing>(&text)? {
            FixtureListing::Page(page) => page.value,
            FixtureListing::Bare(groups) => groups,
        };
        let groups = groups.into_iter().map(ExternalGroup::from).collect();
        Ok(self.cache.replace(groups, Utc::now()).await?)
    }

    async fn list_groups(&self) -> Vec<ExternalGroup> {
        self.cache.groups().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohortsync_storage::{BackoffPolicy, HttpClientConfig};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::tempdir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher() -> Arc<HttpFetcher> {
        Arc::new(
            HttpFetcher::new(HttpClientConfig {
                backoff: BackoffPolicy {
                    max_retries: 2,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(5),
                },
                ..Default::default()
            })
            .unwrap(),
        )
    }

    fn graph_directory(server: &MockServer) -> GraphGroupDirectory {
        GraphGroupDirectory::new(
            GraphDirectoryConfig::new("t0ken").with_base_url(server.uri()),
            fetcher(),
            GroupCache::in_memory(),
        )
    }

    #[test]
    fn group_page_tolerates_missing_display_names() {
        let (groups, next) = parse_group_page(json!({
            "value": [
                {"id": "g1", "displayName": "ochin-crowd-A"},
                {"id": "g2", "displayName": null},
                {"id": "g3"}
            ],
            "@odata.nextLink": "https://graph.example/groups?$skiptoken=x"
        }))
        .unwrap();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[1], ExternalGroup::new("g2", ""));
        assert_eq!(next.as_deref(), Some("https://graph.example/groups?$skiptoken=x"));
    }

    #[test]
    fn group_page_without_ids_is_rejected() {
        assert!(parse_group_page(json!({"value": [{"displayName": "x"}]})).is_err());
    }

    #[tokio::test]
    async fn graph_directory_follows_next_links() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/groups"))
            .and(header("authorization", "Bearer t0ken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{"id": "g1", "displayName": "ochin-crowd-A"}],
                "@odata.nextLink": format!("{}/groups-page-2", server.uri())
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/groups-page-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{"id": "g2", "displayName": "staff"}]
            })))
            .mount(&server)
            .await;

        let directory = graph_directory(&server);
        assert!(directory.list_groups().await.is_empty());

        let refresh = directory.refresh_cache().await.unwrap();
        assert_eq!(refresh.group_count, 2);
        assert!(refresh.changed);
        let ids: Vec<_> = directory
            .list_groups()
            .await
            .into_iter()
            .map(|g| g.id)
            .collect();
        assert_eq!(ids, vec!["g1", "g2"]);
    }

    #[tokio::test]
    async fn graph_directory_stops_on_a_self_referencing_next_link() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/groups"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{"id": "g1", "displayName": "ochin-crowd-A"}],
                "@odata.nextLink": format!("{}/groups?$select=id,displayName&$top=999", server.uri())
            })))
            .mount(&server)
            .await;

        let directory = graph_directory(&server);
        let err = directory.refresh_cache().await.unwrap_err();
        assert!(matches!(err, DirectoryError::Paging(ref msg) if msg.contains("repeats")));
        assert!(directory.list_groups().await.is_empty());
    }

    #[tokio::test]
    async fn graph_directory_enforces_the_page_limit() {
        let server = MockServer::start().await;
        for (from, to) in [("/groups", "/groups-a"), ("/groups-a", "/groups-b")] {
            Mock::given(method("GET"))
                .and(path(from))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "value": [{"id": from, "displayName": "ochin-crowd-A"}],
                    "@odata.nextLink": format!("{}{}", server.uri(), to)
                })))
                .mount(&server)
                .await;
        }

        let mut config = GraphDirectoryConfig::new("t0ken").with_base_url(server.uri());
        config.max_pages = 2;
        let directory = GraphGroupDirectory::new(config, fetcher(), GroupCache::in_memory());
        let err = directory.refresh_cache().await.unwrap_err();
        assert!(matches!(err, DirectoryError::Paging(ref msg) if msg.contains("more than 2 pages")));
    }

    #[tokio::test]
    async fn graph_directory_retries_throttled_requests() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/groups"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/groups"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{"id": "g1", "displayName": "ochin-crowd-A"}]
            })))
            .mount(&server)
            .await;

        let refresh = graph_directory(&server).refresh_cache().await.unwrap();
        assert_eq!(refresh.group_count, 1);
    }

    #[tokio::test]
    async fn graph_directory_surfaces_auth_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/groups"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let directory = graph_directory(&server);
        let err = directory.refresh_cache().await.unwrap_err();
        assert!(matches!(
            err,
            DirectoryError::Fetch(FetchError::HttpStatus { status: 401, .. })
        ));
        assert!(directory.list_groups().await.is_empty());
    }

    #[tokio::test]
    async fn fixture_directory_reads_bare_and_paged_listings() {
        let dir = tempdir().expect("tempdir");
        let bare = dir.path().join("bare.json");
        std::fs::write(&bare, r#"[{"id":"g1","displayName":"ochin-crowd-A"}]"#).unwrap();
        let paged = dir.path().join("paged.json");
        std::fs::write(
            &paged,
            r#"{"value":[{"id":"g1","displayName":"ochin-crowd-A"},{"id":"g2","displayName":"ochin-crowd-B"}]}"#,
        )
        .unwrap();

        let directory = FixtureGroupDirectory::new(&bare);
        assert_eq!(directory.refresh_cache().await.unwrap().group_count, 1);

        let directory = FixtureGroupDirectory::new(&paged);
        directory.refresh_cache().await.unwrap();
        assert_eq!(
            directory.list_groups().await,
            vec![
                ExternalGroup::new("g1", "ochin-crowd-A"),
                ExternalGroup::new("g2", "ochin-crowd-B"),
            ]
        );
    }

    #[tokio::test]
    async fn missing_fixture_fails_refresh() {
        let directory = FixtureGroupDirectory::new("/nonexistent/groups.json");
        assert!(matches!(
            directory.refresh_cache().await,
            Err(DirectoryError::Fixture { .. })
        ));
    }

    #[tokio::test]
    async fn logging_synchronizer_accepts_every_pair() {
        LoggingMembershipSynchronizer
            .sync_members("g1", 1)
            .await
            .unwrap();
    }
}
