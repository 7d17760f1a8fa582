//! Runtime configuration for playback sessions.
//!
//! Holds the tunables that shape resolution, acquisition and playback
//! behavior, plus the catalog credentials loaded from a secrets file.
//! One `Config` is built at startup and shared by every session.

use std::{fs, time::Duration};

use serde::Deserialize;
use url::Url;
use veil::Redact;

use crate::error::{Error, Result};

/// Catalog API credentials for the client-credentials token flow.
///
/// Loaded from a TOML secrets file. The secret is redacted from debug
/// output so it never leaks into logs.
#[derive(Clone, Deserialize, Hash, PartialEq, Eq, PartialOrd, Ord, Redact)]
pub struct Credentials {
    /// Public identifier of the API application.
    pub client_id: String,

    /// Confidential key paired with the identifier.
    #[redact(fixed = 8)]
    pub client_secret: String,
}

impl Credentials {
    /// Loads credentials from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the file does not exist and
    /// `InvalidArgument` when it does not parse.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(Error::from)?;
        let credentials = toml::from_str(&contents)?;
        Ok(credentials)
    }
}

/// Configuration for a playback orchestrator and its collaborators.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Application name, used in the `User-Agent` string.
    pub app_name: String,

    /// Application version, used in the `User-Agent` string.
    pub app_version: String,

    /// `User-Agent` string sent with every outbound HTTP request.
    pub user_agent: String,

    /// How long a session may sit idle with an empty queue before it is
    /// torn down and removed from the registry.
    pub inactivity_timeout: Duration,

    /// How long to wait for the sink to become ready before starting
    /// playback anyway.
    pub ready_timeout: Duration,

    /// Per-strategy deadline for keyword search providers.
    pub search_timeout: Duration,

    /// Attempts per extraction strategy before falling through to the next.
    pub acquire_attempts: u32,

    /// Pause between extraction attempts.
    pub acquire_backoff: Duration,

    /// Target queue depth maintained from a playlist cursor.
    pub queue_window: usize,

    /// Playback gain applied to every resource.
    pub volume: f32,

    /// Base endpoint of the catalog Web API.
    pub catalog_api_url: Url,

    /// Token endpoint of the catalog accounts service.
    pub catalog_token_url: Url,

    /// Public API instances tried in order by the primary search provider
    /// and the relay extraction strategy.
    pub relay_instances: Vec<Url>,

    /// Public API instances tried in order by the secondary search provider
    /// and the fallback extraction strategy.
    pub fallback_instances: Vec<Url>,

    /// External extractor executable invoked when relay extraction fails.
    pub extractor_bin: String,

    /// Credentials for the catalog API, if configured.
    pub credentials: Option<Credentials>,
}

impl Default for Config {
    fn default() -> Self {
        let app_name = env!("CARGO_PKG_NAME").to_owned();
        let app_version = env!("CARGO_PKG_VERSION").to_owned();
        let os_name = std::env::consts::OS;
        let user_agent = format!("{app_name}/{app_version} (Rust; {os_name})");

        Self {
            app_name,
            app_version,
            user_agent,

            inactivity_timeout: Duration::from_secs(5 * 60),
            ready_timeout: Duration::from_secs(15),
            search_timeout: Duration::from_secs(10),

            acquire_attempts: 3,
            acquire_backoff: Duration::from_secs(2),

            queue_window: 10,
            volume: 0.8,

            catalog_api_url: Url::parse("https://api.spotify.com/v1/")
                .unwrap_or_else(|_| unreachable!()),
            catalog_token_url: Url::parse("https://accounts.spotify.com/api/token")
                .unwrap_or_else(|_| unreachable!()),

            relay_instances: [
                "https://pipedapi.kavin.rocks/",
                "https://api.piped.projectsegfau.lt/",
                "https://pipedapi.adminforge.de/",
            ]
            .iter()
            .filter_map(|instance| Url::parse(instance).ok())
            .collect(),

            fallback_instances: [
                "https://invidious.projectsegfau.lt/",
                "https://inv.nadeko.net/",
                "https://yewtu.be/",
            ]
            .iter()
            .filter_map(|instance| Url::parse(instance).ok())
            .collect(),

            extractor_bin: String::from("yt-dlp"),

            credentials: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_are_redacted_in_debug_output() {
        let credentials = Credentials {
            client_id: "public-id".to_owned(),
            client_secret: "super-secret-value".to_owned(),
        };

        let debugged = format!("{credentials:?}");
        assert!(debugged.contains("public-id"));
        assert!(!debugged.contains("super-secret-value"));
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.inactivity_timeout, Duration::from_secs(300));
        assert_eq!(config.ready_timeout, Duration::from_secs(15));
        assert_eq!(config.acquire_attempts, 3);
        assert_eq!(config.queue_window, 10);
        assert!((config.volume - 0.8).abs() < f32::EPSILON);
        assert!(!config.relay_instances.is_empty());
    }

    #[test]
    fn credentials_parse_from_toml() {
        let parsed: Credentials =
            toml::from_str("client_id = \"abc\"\nclient_secret = \"def\"\n")
                .unwrap();
        assert_eq!(parsed.client_id, "abc");
        assert_eq!(parsed.client_secret, "def");
    }
}
