//! Keyword search providers.
//!
//! Turns a free-text query into a streamable locator by asking public video
//! API instances. Two provider families are bundled, each walking a list of
//! instances in order until one answers. Instance failures are logged and
//! skipped; a provider only errors when every instance failed.

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use crate::{
    config::Config,
    error::{Error, Result},
    http,
};

/// A single search result: something the acquirer can stream from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchHit {
    /// Canonical watch URL of the best match.
    pub locator: String,

    /// Title of the best match.
    pub title: String,
}

/// A keyword search backend.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Name used in log lines.
    fn name(&self) -> &str;

    /// Returns the best match for a query.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no instance produced a match and
    /// `Unavailable` when every instance failed to answer.
    async fn search(&self, query: &str) -> Result<SearchHit>;
}

/// Canonicalizes a video id into a watch URL.
fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

/// Extracts the `v` parameter from a watch path like `/watch?v=abc`.
fn video_id_from_path(instance: &Url, path: &str) -> Option<String> {
    let joined = instance.join(path).ok()?;
    joined
        .query_pairs()
        .find(|(key, _)| key == "v")
        .map(|(_, value)| value.into_owned())
}

#[derive(Deserialize)]
struct RelayResults {
    #[serde(default)]
    items: Vec<RelayItem>,
}

#[derive(Deserialize)]
struct RelayItem {
    url: String,
    title: String,
}

/// Search provider backed by relay API instances.
///
/// Queries `{instance}/search?q=..&filter=music_songs` and takes the first
/// item of the response.
pub struct RelaySearch {
    http: http::Client,
    instances: Vec<Url>,
}

impl RelaySearch {
    /// Creates a provider over the configured relay instances.
    ///
    /// # Errors
    ///
    /// Returns an error when HTTP client creation fails.
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            http: http::Client::new(config)?,
            instances: config.relay_instances.clone(),
        })
    }

    async fn search_instance(&self, instance: &Url, query: &str) -> Result<SearchHit> {
        let mut url = instance.join("search")?;
        url.query_pairs_mut()
            .append_pair("q", query)
            .append_pair("filter", "music_songs");

        let response = self.http.execute(self.http.get(url, "")).await?;
        if !response.status().is_success() {
            return Err(Error::unavailable(format!(
                "search failed with status {}",
                response.status()
            )));
        }

        let results: RelayResults = response.json().await?;
        let item = results
            .items
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found(format!("no results for {query:?}")))?;

        let video_id = video_id_from_path(instance, &item.url)
            .ok_or_else(|| Error::invalid_argument(format!("unusable result url {}", item.url)))?;

        Ok(SearchHit {
            locator: watch_url(&video_id),
            title: item.title,
        })
    }
}

#[async_trait]
impl SearchProvider for RelaySearch {
    fn name(&self) -> &str {
        "relay"
    }

    async fn search(&self, query: &str) -> Result<SearchHit> {
        for instance in &self.instances {
            match self.search_instance(instance, query).await {
                Ok(hit) => return Ok(hit),
                Err(e) => warn!("relay search on {instance} failed: {e}"),
            }
        }

        Err(Error::not_found(format!(
            "no relay instance matched {query:?}"
        )))
    }
}

#[derive(Deserialize)]
struct FallbackItem {
    #[serde(rename = "videoId")]
    video_id: String,
    title: String,
}

/// Search provider backed by the fallback instance family.
///
/// Queries `{instance}/api/v1/search?q=..&type=video` and takes the first
/// item of the response array.
pub struct FallbackSearch {
    http: http::Client,
    instances: Vec<Url>,
}

impl FallbackSearch {
    /// Creates a provider over the configured fallback instances.
    ///
    /// # Errors
    ///
    /// Returns an error when HTTP client creation fails.
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            http: http::Client::new(config)?,
            instances: config.fallback_instances.clone(),
        })
    }

    async fn search_instance(&self, instance: &Url, query: &str) -> Result<SearchHit> {
        let mut url = instance.join("api/v1/search")?;
        url.query_pairs_mut()
            .append_pair("q", query)
            .append_pair("type", "video");

        let response = self.http.execute(self.http.get(url, "")).await?;
        if !response.status().is_success() {
            return Err(Error::unavailable(format!(
                "search failed with status {}",
                response.status()
            )));
        }

        let results: Vec<FallbackItem> = response.json().await?;
        let item = results
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found(format!("no results for {query:?}")))?;

        Ok(SearchHit {
            locator: watch_url(&item.video_id),
            title: item.title,
        })
    }
}

#[async_trait]
impl SearchProvider for FallbackSearch {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn search(&self, query: &str) -> Result<SearchHit> {
        for instance in &self.instances {
            match self.search_instance(instance, query).await {
                Ok(hit) => return Ok(hit),
                Err(e) => warn!("fallback search on {instance} failed: {e}"),
            }
        }

        Err(Error::not_found(format!(
            "no fallback instance matched {query:?}"
        )))
    }
}
