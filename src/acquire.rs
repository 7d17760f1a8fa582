//! Stream acquisition.
//!
//! Turns a resolved locator into readable, seekable audio bytes. Three
//! extraction strategies are tried in order, each producing a direct media
//! URL; the shared streaming step then spools that URL to temporary
//! storage in the background so the decoder can read and seek while the
//! download is still in flight.
//!
//! Strategies:
//! 1. relay API extraction against the primary instance family;
//! 2. an external extractor process (`yt-dlp --get-url`);
//! 3. proxied media URLs from the fallback instance family.
//!
//! Each strategy gets a bounded number of attempts with a fixed pause
//! between them. A failure classified as non-retryable falls straight
//! through to the next strategy. Only when every strategy is exhausted
//! does acquisition error out.

use std::{
    io::{Read, Seek},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use exponential_backoff::Backoff;
use serde::Deserialize;
use stream_download::{
    http::HttpStream, source::SourceStream, storage::temp::TempStorageProvider, StreamDownload,
};
use tokio::process::Command;
use url::Url;

use crate::{
    config::Config,
    error::{Error, ErrorKind, Result},
    http,
    track::is_catalog_scheme,
};

/// Byte source for the decoder: readable and seekable while the download
/// continues in the background.
pub trait ReadSeek: Read + Seek + Send + Sync {}
impl<T: Read + Seek + Send + Sync> ReadSeek for T {}

/// Acquired audio bytes plus what little is known about them.
pub struct MediaStream {
    /// Spooled byte source.
    pub reader: Box<dyn ReadSeek>,

    /// Total byte length, when the server reported one.
    pub byte_len: Option<u64>,
}

/// Acquisition seam for the orchestrator.
#[async_trait]
pub trait StreamSource: Send + Sync {
    /// Acquires a readable stream for a locator.
    async fn acquire(&self, locator: &str) -> Result<MediaStream>;
}

/// A direct media URL produced by an extraction strategy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Extraction {
    /// URL the media bytes can be fetched from.
    pub media_url: Url,
}

/// One way of turning a locator into a direct media URL.
#[async_trait]
pub trait ExtractStrategy: Send + Sync {
    /// Name used in log lines.
    fn name(&self) -> &str;

    /// Extracts a direct media URL from a locator.
    async fn extract(&self, locator: &str) -> Result<Extraction>;
}

/// Checks that a locator is something the acquirer can work with.
///
/// # Errors
///
/// Returns `InvalidArgument` for empty, catalog-scheme and non-http(s)
/// locators.
pub fn validate_locator(locator: &str) -> Result<Url> {
    if locator.is_empty() {
        return Err(Error::invalid_argument("empty locator"));
    }
    if is_catalog_scheme(locator) {
        return Err(Error::invalid_argument(format!(
            "unresolved catalog locator {locator}"
        )));
    }

    let url = Url::parse(locator)?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(Error::invalid_argument(format!(
            "unsupported locator scheme {other}"
        ))),
    }
}

/// Extracts the video id from a watch URL.
///
/// Handles both `watch?v=..` query forms and short-link path forms.
#[must_use]
pub fn video_id(url: &Url) -> Option<String> {
    if let Some((_, id)) = url.query_pairs().find(|(key, _)| key == "v") {
        return Some(id.into_owned());
    }

    // Short links carry the id as the sole path segment.
    url.path_segments()
        .and_then(|mut segments| segments.next_back().map(ToOwned::to_owned))
        .filter(|segment| !segment.is_empty())
}

/// Whether a failed attempt is worth repeating against the same strategy.
///
/// Malformed input and definite misses will not get better with time;
/// everything else might.
#[must_use]
fn is_retryable(kind: ErrorKind) -> bool {
    !matches!(kind, ErrorKind::InvalidArgument | ErrorKind::NotFound)
}

#[derive(Deserialize)]
struct RelayStreams {
    #[serde(rename = "audioStreams", default)]
    audio_streams: Vec<RelayAudioStream>,
}

#[derive(Deserialize)]
struct RelayAudioStream {
    url: String,
    #[serde(default)]
    bitrate: u64,
}

/// Relay API extraction: `{instance}/streams/{id}`, best audio stream by
/// bitrate.
pub struct RelayExtract {
    http: Arc<http::Client>,
    instances: Vec<Url>,
}

impl RelayExtract {
    #[must_use]
    pub fn new(http: Arc<http::Client>, config: &Config) -> Self {
        Self {
            http,
            instances: config.relay_instances.clone(),
        }
    }

    async fn extract_instance(&self, instance: &Url, id: &str) -> Result<Extraction> {
        let url = instance.join(&format!("streams/{id}"))?;
        let response = self.http.execute(self.http.get(url, "")).await?;
        if !response.status().is_success() {
            return Err(Error::unavailable(format!(
                "stream lookup failed with status {}",
                response.status()
            )));
        }

        let streams: RelayStreams = response.json().await?;
        let best = streams
            .audio_streams
            .into_iter()
            .max_by_key(|stream| stream.bitrate)
            .ok_or_else(|| Error::not_found(format!("no audio streams for {id}")))?;

        Ok(Extraction {
            media_url: Url::parse(&best.url)?,
        })
    }
}

#[async_trait]
impl ExtractStrategy for RelayExtract {
    fn name(&self) -> &str {
        "relay"
    }

    async fn extract(&self, locator: &str) -> Result<Extraction> {
        let url = validate_locator(locator)?;
        let id = video_id(&url)
            .ok_or_else(|| Error::invalid_argument(format!("no video id in {locator}")))?;

        for instance in &self.instances {
            match self.extract_instance(instance, &id).await {
                Ok(extraction) => return Ok(extraction),
                Err(e) => warn!("relay extraction on {instance} failed: {e}"),
            }
        }

        Err(Error::unavailable(format!(
            "no relay instance extracted {locator}"
        )))
    }
}

/// External extractor process: asks the configured binary for a direct
/// media URL (`--get-url`, best audio only).
pub struct ProcessExtract {
    bin: String,
}

impl ProcessExtract {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            bin: config.extractor_bin.clone(),
        }
    }
}

#[async_trait]
impl ExtractStrategy for ProcessExtract {
    fn name(&self) -> &str {
        "extractor process"
    }

    async fn extract(&self, locator: &str) -> Result<Extraction> {
        validate_locator(locator)?;

        let output = Command::new(&self.bin)
            .arg("--get-url")
            .args(["-f", "bestaudio"])
            .arg("--no-playlist")
            .arg(locator)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::unavailable(format!(
                "{} exited with {}: {}",
                self.bin,
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| Error::not_found(format!("{} produced no URL", self.bin)))?;

        Ok(Extraction {
            media_url: Url::parse(line.trim())?,
        })
    }
}

/// Fallback extraction: proxied media URLs served by the fallback
/// instance family (`{instance}/latest_version?id=..&itag=140`).
pub struct FallbackExtract {
    instances: Vec<Url>,
}

impl FallbackExtract {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            instances: config.fallback_instances.clone(),
        }
    }
}

#[async_trait]
impl ExtractStrategy for FallbackExtract {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn extract(&self, locator: &str) -> Result<Extraction> {
        let url = validate_locator(locator)?;
        let id = video_id(&url)
            .ok_or_else(|| Error::invalid_argument(format!("no video id in {locator}")))?;

        let instance = self
            .instances
            .first()
            .ok_or_else(|| Error::unavailable("no fallback instances configured"))?;

        let mut media_url = instance.join("latest_version")?;
        media_url
            .query_pairs_mut()
            .append_pair("id", &id)
            .append_pair("itag", "140")
            .append_pair("local", "true");

        Ok(Extraction { media_url })
    }
}

/// Default acquirer: walks the extraction strategies, then spools the
/// winning media URL to temporary storage.
pub struct Acquirer {
    http: Arc<http::Client>,
    strategies: Vec<Box<dyn ExtractStrategy>>,
    attempts: u32,
    pause: Duration,
}

impl Acquirer {
    /// Bytes to buffer before the stream is considered readable.
    const PREFETCH_DEFAULT: u64 = 60 * 1024;

    /// Creates an acquirer with the bundled strategy chain.
    ///
    /// # Errors
    ///
    /// Returns an error when HTTP client creation fails.
    pub fn new(config: &Config) -> Result<Self> {
        let http = Arc::new(http::Client::new(config)?);
        let strategies: Vec<Box<dyn ExtractStrategy>> = vec![
            Box::new(RelayExtract::new(Arc::clone(&http), config)),
            Box::new(ProcessExtract::new(config)),
            Box::new(FallbackExtract::new(config)),
        ];

        Ok(Self::with_strategies(http, strategies, config))
    }

    /// Creates an acquirer over arbitrary strategies.
    #[must_use]
    pub fn with_strategies(
        http: Arc<http::Client>,
        strategies: Vec<Box<dyn ExtractStrategy>>,
        config: &Config,
    ) -> Self {
        Self {
            http,
            strategies,
            attempts: config.acquire_attempts,
            pause: config.acquire_backoff,
        }
    }

    /// Runs one strategy with bounded retries and a fixed pause.
    async fn extract_with_retries(
        &self,
        strategy: &dyn ExtractStrategy,
        locator: &str,
    ) -> Result<Extraction> {
        // min == max keeps the pause fixed across attempts.
        let backoff = Backoff::new(self.attempts, self.pause, self.pause);
        let mut last = None;
        for duration in &backoff {
            match strategy.extract(locator).await {
                Ok(extraction) => return Ok(extraction),
                Err(e) => {
                    if !is_retryable(e.kind) {
                        return Err(e);
                    }

                    warn!("{} extraction of {locator} failed: {e}", strategy.name());
                    last = Some(e);
                    if let Some(duration) = duration {
                        tokio::time::sleep(duration).await;
                    }
                }
            }
        }

        Err(last.unwrap_or_else(|| {
            Error::unavailable(format!("{} extraction never ran", strategy.name()))
        }))
    }

    /// Walks the strategy chain until one produces a media URL.
    async fn extract_any(&self, locator: &str) -> Result<Extraction> {
        for strategy in &self.strategies {
            match self.extract_with_retries(strategy.as_ref(), locator).await {
                Ok(extraction) => {
                    debug!("{} extracted media for {locator}", strategy.name());
                    return Ok(extraction);
                }
                Err(e) => warn!("{} gave up on {locator}: {e}", strategy.name()),
            }
        }

        Err(Error::unavailable(format!(
            "all extraction strategies exhausted for {locator}"
        )))
    }

    /// Spools a media URL to temporary storage.
    ///
    /// The `await` does not block until the download completes, only until
    /// enough bytes are buffered; the rest streams in the background.
    async fn spool(&self, extraction: Extraction) -> Result<MediaStream> {
        let stream = HttpStream::new(self.http.unlimited.clone(), extraction.media_url).await?;

        let byte_len = stream.content_length();
        match byte_len {
            Some(len) => debug!("spooling {len} bytes of media"),
            None => debug!("spooling media with unknown length"),
        }

        let download = StreamDownload::from_stream(
            stream,
            TempStorageProvider::default(),
            stream_download::Settings::default().prefetch_bytes(Self::PREFETCH_DEFAULT),
        )
        .await?;

        Ok(MediaStream {
            reader: Box::new(download),
            byte_len,
        })
    }
}

#[async_trait]
impl StreamSource for Acquirer {
    async fn acquire(&self, locator: &str) -> Result<MediaStream> {
        validate_locator(locator)?;
        let extraction = self.extract_any(locator).await?;
        self.spool(extraction).await
    }
}
