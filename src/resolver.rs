//! Locator resolution.
//!
//! When a track reaches the front of the queue without a streamable
//! locator, the resolver runs a fixed chain of lookup strategies until one
//! produces a hit:
//!
//! 1. the primary provider, queried with a catalog-built phrase when the
//!    track carries cached catalog metadata;
//! 2. the primary provider with the plain query;
//! 3. the secondary provider with the plain query.
//!
//! Every strategy runs under its own deadline. Failures and timeouts are
//! logged and the chain moves on; only when all strategies miss does the
//! resolver error out, and the orchestrator then drops the track.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::time::timeout;

use crate::{
    catalog::{CatalogService, CatalogTrack},
    config::Config,
    error::{Error, Result},
    search::SearchProvider,
    track::Track,
};

/// Outcome of a successful resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedTrack {
    /// Streamable locator.
    pub locator: String,

    /// Title reported by the strategy that hit.
    pub title: String,
}

/// Resolution seam for the orchestrator.
#[async_trait]
pub trait TrackResolver: Send + Sync {
    /// Resolves a track without a usable locator into one with a locator.
    async fn resolve(&self, track: &Track) -> Result<ResolvedTrack>;

    /// Fetches the catalog metadata of a single playlist position.
    ///
    /// Returns `Ok(None)` when the position does not exist.
    async fn resolve_placeholder(
        &self,
        catalog_id: &str,
        index: usize,
    ) -> Result<Option<CatalogTrack>>;

    /// Returns the number of tracks in a catalog playlist.
    async fn playlist_total(&self, catalog_id: &str) -> Result<usize>;
}

/// Builds the search phrase for a track.
///
/// Prefers the cached catalog name with performers appended, falling back
/// to the bare title.
#[must_use]
pub fn search_query(track: &Track) -> Option<String> {
    if let Some(placeholder) = track.placeholder_payload() {
        if let Some(name) = placeholder.cached_name.as_deref() {
            if placeholder.cached_performers.is_empty() {
                return Some(name.to_owned());
            }
            return Some(format!("{name} {}", placeholder.cached_performers.join(" ")));
        }
    }

    track.title.clone()
}

/// Default resolver: a strategy chain over two search providers and a
/// catalog client.
pub struct Resolver {
    primary: Arc<dyn SearchProvider>,
    secondary: Arc<dyn SearchProvider>,
    catalog: Arc<dyn CatalogService>,
    search_timeout: Duration,
}

impl Resolver {
    /// Creates a resolver over the given collaborators.
    #[must_use]
    pub fn new(
        config: &Config,
        primary: Arc<dyn SearchProvider>,
        secondary: Arc<dyn SearchProvider>,
        catalog: Arc<dyn CatalogService>,
    ) -> Self {
        Self {
            primary,
            secondary,
            catalog,
            search_timeout: config.search_timeout,
        }
    }

    /// Runs one strategy under its deadline.
    async fn try_strategy(
        &self,
        provider: &Arc<dyn SearchProvider>,
        query: &str,
    ) -> Result<ResolvedTrack> {
        let hit = timeout(self.search_timeout, provider.search(query)).await??;
        Ok(ResolvedTrack {
            locator: hit.locator,
            title: hit.title,
        })
    }
}

#[async_trait]
impl TrackResolver for Resolver {
    async fn resolve(&self, track: &Track) -> Result<ResolvedTrack> {
        let plain = search_query(track)
            .ok_or_else(|| Error::invalid_argument(format!("track {track} has no query")))?;

        // The catalog-built phrase equals the plain one when no performers
        // are cached; skip the duplicate strategy then.
        let mut queries: Vec<&str> = Vec::with_capacity(2);
        queries.push(plain.as_str());

        let bare_title = track.title.clone();
        if let Some(title) = bare_title.as_deref() {
            if title != plain {
                queries.push(title);
            }
        }

        for query in &queries {
            match self.try_strategy(&self.primary, query).await {
                Ok(resolved) => return Ok(resolved),
                Err(e) => warn!(
                    "{} search for {query:?} failed: {e}",
                    self.primary.name()
                ),
            }
        }

        match self.try_strategy(&self.secondary, &plain).await {
            Ok(resolved) => return Ok(resolved),
            Err(e) => warn!(
                "{} search for {plain:?} failed: {e}",
                self.secondary.name()
            ),
        }

        Err(Error::not_found(format!(
            "no strategy resolved {plain:?}"
        )))
    }

    async fn resolve_placeholder(
        &self,
        catalog_id: &str,
        index: usize,
    ) -> Result<Option<CatalogTrack>> {
        self.catalog.fetch_one(catalog_id, index).await
    }

    async fn playlist_total(&self, catalog_id: &str) -> Result<usize> {
        self.catalog.playlist_total(catalog_id).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::search::SearchHit;

    struct ScriptedProvider {
        name: &'static str,
        hit: Option<SearchHit>,
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl ScriptedProvider {
        fn hit(name: &'static str, locator: &str) -> Self {
            Self {
                name,
                hit: Some(SearchHit {
                    locator: locator.to_owned(),
                    title: "found".to_owned(),
                }),
                calls: AtomicUsize::new(0),
                delay: None,
            }
        }

        fn miss(name: &'static str) -> Self {
            Self {
                name,
                hit: None,
                calls: AtomicUsize::new(0),
                delay: None,
            }
        }

        fn hang(name: &'static str) -> Self {
            Self {
                name,
                hit: None,
                calls: AtomicUsize::new(0),
                delay: Some(Duration::from_secs(3600)),
            }
        }
    }

    #[async_trait]
    impl SearchProvider for ScriptedProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn search(&self, _query: &str) -> Result<SearchHit> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.hit
                .clone()
                .ok_or_else(|| Error::not_found("scripted miss"))
        }
    }

    struct NoCatalog;

    #[async_trait]
    impl CatalogService for NoCatalog {
        async fn fetch_one(&self, _id: &str, _index: usize) -> Result<Option<CatalogTrack>> {
            Ok(None)
        }

        async fn playlist_total(&self, _id: &str) -> Result<usize> {
            Ok(0)
        }
    }

    fn resolver_with(
        primary: Arc<ScriptedProvider>,
        secondary: Arc<ScriptedProvider>,
    ) -> Resolver {
        Resolver::new(
            &Config::default(),
            primary,
            secondary,
            Arc::new(NoCatalog),
        )
    }

    #[test]
    fn query_prefers_catalog_metadata() {
        let mut track = Track::placeholder("listid", 0);
        {
            let crate::track::Source::CatalogPlaceholder(placeholder) = &mut track.source else {
                unreachable!()
            };
            placeholder.cached_name = Some("Song".to_owned());
            placeholder.cached_performers = vec!["A".to_owned(), "B".to_owned()];
        }
        assert_eq!(search_query(&track).as_deref(), Some("Song A B"));

        let plain = Track::direct("https://x").with_title("Just A Title");
        assert_eq!(search_query(&plain).as_deref(), Some("Just A Title"));
    }

    #[tokio::test]
    async fn first_hit_short_circuits() {
        let primary = Arc::new(ScriptedProvider::hit("primary", "https://hit/1"));
        let secondary = Arc::new(ScriptedProvider::hit("secondary", "https://hit/2"));
        let resolver = resolver_with(Arc::clone(&primary), Arc::clone(&secondary));

        let track = Track::direct("").with_title("query");
        let resolved = resolver.resolve(&track).await.unwrap();
        assert_eq!(resolved.locator, "https://hit/1");
        assert_eq!(secondary.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn chain_falls_through_to_secondary() {
        let primary = Arc::new(ScriptedProvider::miss("primary"));
        let secondary = Arc::new(ScriptedProvider::hit("secondary", "https://hit/2"));
        let resolver = resolver_with(primary, Arc::clone(&secondary));

        let track = Track::direct("").with_title("query");
        let resolved = resolver.resolve(&track).await.unwrap();
        assert_eq!(resolved.locator, "https://hit/2");
    }

    #[tokio::test]
    async fn all_misses_yield_not_found() {
        let resolver = resolver_with(
            Arc::new(ScriptedProvider::miss("primary")),
            Arc::new(ScriptedProvider::miss("secondary")),
        );

        let track = Track::direct("").with_title("query");
        let err = resolver.resolve(&track).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_strategy_times_out_and_chain_continues() {
        let primary = Arc::new(ScriptedProvider::hang("primary"));
        let secondary = Arc::new(ScriptedProvider::hit("secondary", "https://hit/2"));
        let resolver = resolver_with(primary, Arc::clone(&secondary));

        let track = Track::direct("").with_title("query");
        let resolved = resolver.resolve(&track).await.unwrap();
        assert_eq!(resolved.locator, "https://hit/2");
    }
}
