//! Catalog Web API client.
//!
//! Playlist placeholders are resolved against an external catalog service
//! that exposes a paged playlist endpoint behind a client-credentials token
//! flow. The client fetches exactly one position at a time so a large
//! playlist never gets materialized up front.

use std::{
    sync::OnceLock,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use regex_lite::Regex;
use serde::Deserialize;
use tokio::sync::Mutex;
use url::Url;

use crate::{
    config::{Config, Credentials},
    error::{Error, Result},
    http,
};

/// Metadata for one catalog playlist position.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CatalogTrack {
    /// Track name.
    pub name: String,

    /// Performing artists, in catalog order.
    pub performers: Vec<String>,

    /// Public web URL of the track, when the catalog exposes one.
    pub external_url: Option<String>,

    /// Album artwork URL, when available.
    pub album_art_url: Option<String>,
}

/// Read access to a catalog service.
///
/// The orchestrator and resolver only depend on this trait so tests can
/// substitute a scripted catalog.
#[async_trait]
pub trait CatalogService: Send + Sync {
    /// Fetches the metadata of a single playlist position.
    ///
    /// Returns `Ok(None)` when the position does not exist.
    async fn fetch_one(&self, playlist_id: &str, index: usize) -> Result<Option<CatalogTrack>>;

    /// Returns the number of tracks in a playlist.
    async fn playlist_total(&self, playlist_id: &str) -> Result<usize>;
}

/// Extracts a playlist id from a shared catalog URL.
///
/// Returns `None` when the input does not look like a playlist link.
#[must_use]
pub fn extract_playlist_id(input: &str) -> Option<String> {
    static PLAYLIST_ID: OnceLock<Regex> = OnceLock::new();
    let re = PLAYLIST_ID.get_or_init(|| {
        Regex::new(r"playlist/([A-Za-z0-9]+)").unwrap_or_else(|_| unreachable!())
    });

    re.captures(input)
        .and_then(|caps| caps.get(1))
        .map(|id| id.as_str().to_owned())
}

/// Returns whether the input looks like a shared playlist link.
#[must_use]
pub fn is_playlist_url(input: &str) -> bool {
    extract_playlist_id(input).is_some()
}

/// Catalog stand-in used when no credentials are configured.
///
/// Every lookup fails with `Unauthenticated`, so playlist links are
/// rejected while plain queries and URLs keep working.
pub struct Unconfigured;

#[async_trait]
impl CatalogService for Unconfigured {
    async fn fetch_one(&self, _playlist_id: &str, _index: usize) -> Result<Option<CatalogTrack>> {
        Err(Error::unauthenticated("no catalog credentials configured"))
    }

    async fn playlist_total(&self, _playlist_id: &str) -> Result<usize> {
        Err(Error::unauthenticated("no catalog credentials configured"))
    }
}

/// Bearer token with its expiry deadline.
#[derive(Clone, Debug)]
struct Token {
    access_token: String,
    expires_at: Instant,
}

impl Token {
    /// Margin subtracted from the advertised lifetime, so a token is
    /// refreshed before it can expire mid-request.
    const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

    fn new(access_token: String, expires_in: u64) -> Self {
        let lifetime = Duration::from_secs(expires_in).saturating_sub(Self::EXPIRY_MARGIN);
        Self {
            access_token,
            expires_at: Instant::now() + lifetime,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Deserialize)]
struct PlaylistPage {
    total: usize,
    #[serde(default)]
    items: Vec<PlaylistItem>,
}

#[derive(Deserialize)]
struct PlaylistItem {
    track: Option<ApiTrack>,
}

#[derive(Deserialize)]
struct ApiTrack {
    name: String,
    #[serde(default)]
    artists: Vec<ApiArtist>,
    #[serde(default)]
    external_urls: ApiExternalUrls,
    album: Option<ApiAlbum>,
}

#[derive(Deserialize)]
struct ApiArtist {
    name: String,
}

#[derive(Deserialize, Default)]
struct ApiExternalUrls {
    spotify: Option<String>,
}

#[derive(Deserialize)]
struct ApiAlbum {
    #[serde(default)]
    images: Vec<ApiImage>,
}

#[derive(Deserialize)]
struct ApiImage {
    url: String,
}

impl From<ApiTrack> for CatalogTrack {
    fn from(track: ApiTrack) -> Self {
        Self {
            name: track.name,
            performers: track.artists.into_iter().map(|artist| artist.name).collect(),
            external_url: track.external_urls.spotify,
            album_art_url: track
                .album
                .and_then(|album| album.images.into_iter().next().map(|image| image.url)),
        }
    }
}

/// HTTP client for the catalog Web API.
pub struct Catalog {
    http: http::Client,
    credentials: Credentials,
    api_url: Url,
    token_url: Url,
    token: Mutex<Option<Token>>,
}

impl Catalog {
    /// Creates a new catalog client.
    ///
    /// # Errors
    ///
    /// Returns `Unauthenticated` when no credentials are configured, or an
    /// error when HTTP client creation fails.
    pub fn new(config: &Config) -> Result<Self> {
        let credentials = config
            .credentials
            .clone()
            .ok_or_else(|| Error::unauthenticated("no catalog credentials configured"))?;

        Ok(Self {
            http: http::Client::new(config)?,
            credentials,
            api_url: config.catalog_api_url.clone(),
            token_url: config.catalog_token_url.clone(),
            token: Mutex::new(None),
        })
    }

    /// Returns a valid bearer token, refreshing it when it is within the
    /// expiry margin.
    async fn ensure_token(&self) -> Result<String> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            if !token.is_expired() {
                return Ok(token.access_token.clone());
            }
        }

        debug!("refreshing catalog access token");
        let request = self
            .http
            .unlimited
            .post(self.token_url.clone())
            .basic_auth(&self.credentials.client_id, Some(&self.credentials.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .build()?;

        let response = self.http.execute(request).await?;
        if !response.status().is_success() {
            return Err(Error::unauthenticated(format!(
                "token request failed with status {}",
                response.status()
            )));
        }

        let token_response: TokenResponse = response.json().await?;
        let token = Token::new(token_response.access_token, token_response.expires_in);
        let access_token = token.access_token.clone();
        *guard = Some(token);

        Ok(access_token)
    }

    /// Fetches one page of a playlist.
    async fn fetch_page(&self, playlist_id: &str, offset: usize, limit: usize) -> Result<PlaylistPage> {
        let access_token = self.ensure_token().await?;

        let mut url = self.api_url.join(&format!("playlists/{playlist_id}/tracks"))?;
        url.query_pairs_mut()
            .append_pair("offset", &offset.to_string())
            .append_pair("limit", &limit.to_string())
            .append_pair(
                "fields",
                "total,items(track(name,artists(name),external_urls,album(images)))",
            );

        let mut request = self.http.get(url, "");
        request.headers_mut().insert(
            reqwest::header::AUTHORIZATION,
            reqwest::header::HeaderValue::from_str(&format!("Bearer {access_token}"))
                .map_err(|e| Error::internal(e.to_string()))?,
        );

        let response = self.http.execute(request).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::not_found(format!("playlist {playlist_id} not found")));
        }
        if !response.status().is_success() {
            return Err(Error::unavailable(format!(
                "playlist request failed with status {}",
                response.status()
            )));
        }

        let page = response.json().await?;
        Ok(page)
    }
}

#[async_trait]
impl CatalogService for Catalog {
    async fn fetch_one(&self, playlist_id: &str, index: usize) -> Result<Option<CatalogTrack>> {
        let page = self.fetch_page(playlist_id, index, 1).await?;
        Ok(page
            .items
            .into_iter()
            .next()
            .and_then(|item| item.track)
            .map(CatalogTrack::from))
    }

    async fn playlist_total(&self, playlist_id: &str) -> Result<usize> {
        let page = self.fetch_page(playlist_id, 0, 1).await?;
        Ok(page.total)
    }
}
