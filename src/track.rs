//! Track model and queue entries.
//!
//! A [`Track`] is one queue entry in a playback session. It either carries a
//! direct locator (a URL that the acquirer can stream from, possibly after
//! extraction) or stands in for a catalog playlist position whose metadata
//! has not been fetched yet. Placeholders are resolved lazily, one at a
//! time, when they reach the front of the queue.

use std::fmt;

/// URI scheme marking a catalog placeholder locator.
///
/// Locators of this shape are internal bookkeeping and must never reach
/// the acquirer.
pub const CATALOG_SCHEME: &str = "catalog:";

/// Returns whether a locator uses the internal catalog placeholder scheme.
#[must_use]
pub fn is_catalog_scheme(locator: &str) -> bool {
    locator.starts_with(CATALOG_SCHEME)
}

/// Cached catalog metadata for a not-yet-resolved playlist position.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Placeholder {
    /// Catalog playlist this position belongs to.
    pub catalog_id: String,

    /// Zero-based position within the playlist.
    pub catalog_index: usize,

    /// Track name as reported by the catalog, when already fetched.
    pub cached_name: Option<String>,

    /// Performing artists as reported by the catalog.
    pub cached_performers: Vec<String>,
}

/// Where a track came from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Source {
    /// Enqueued with a locator already in hand.
    Direct,

    /// Stands in for a catalog playlist position.
    CatalogPlaceholder(Placeholder),
}

/// One queue entry in a playback session.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Track {
    /// Streamable locator, once known. Empty or `catalog:`-scheme locators
    /// are not playable.
    pub locator: Option<String>,

    /// Human-readable title, once known.
    pub title: Option<String>,

    /// Who asked for this track, for display purposes.
    pub requester: Option<String>,

    /// Artwork URL, for display purposes.
    pub art_url: Option<String>,

    /// Origin of this entry.
    pub source: Source,

    /// Whether a transient playback failure already requeued this track.
    /// A track is retried at most once.
    pub retried: bool,
}

impl Track {
    /// Creates a track from a locator obtained outside the catalog.
    #[must_use]
    pub fn direct(locator: impl Into<String>) -> Self {
        Self {
            locator: Some(locator.into()),
            title: None,
            requester: None,
            art_url: None,
            source: Source::Direct,
            retried: false,
        }
    }

    /// Creates a track from a free-text query, to be resolved when it
    /// reaches the front of the queue.
    #[must_use]
    pub fn query(text: impl Into<String>) -> Self {
        Self {
            locator: None,
            title: Some(text.into()),
            requester: None,
            art_url: None,
            source: Source::Direct,
            retried: false,
        }
    }

    /// Creates a placeholder for a catalog playlist position.
    ///
    /// The locator is set to the internal `catalog:` form so the entry is
    /// recognizably not playable until resolved.
    #[must_use]
    pub fn placeholder(catalog_id: impl Into<String>, catalog_index: usize) -> Self {
        let catalog_id = catalog_id.into();
        Self {
            locator: Some(format!("{CATALOG_SCHEME}{catalog_id}/{catalog_index}")),
            title: None,
            requester: None,
            art_url: None,
            source: Source::CatalogPlaceholder(Placeholder {
                catalog_id,
                catalog_index,
                cached_name: None,
                cached_performers: Vec::new(),
            }),
            retried: false,
        }
    }

    /// Sets the title.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Sets the requester.
    #[must_use]
    pub fn with_requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = Some(requester.into());
        self
    }

    /// Returns the placeholder payload, when this track is one.
    #[must_use]
    pub fn placeholder_payload(&self) -> Option<&Placeholder> {
        match &self.source {
            Source::CatalogPlaceholder(placeholder) => Some(placeholder),
            Source::Direct => None,
        }
    }

    /// Returns whether this track can be handed to the acquirer as-is.
    ///
    /// A track is playable when its locator is present, non-empty and not
    /// an internal catalog placeholder.
    #[must_use]
    pub fn is_playable(&self) -> bool {
        self.locator
            .as_deref()
            .is_some_and(|locator| !locator.is_empty() && !is_catalog_scheme(locator))
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let title = self.title.as_deref().unwrap_or("(untitled)");
        match self.requester.as_deref() {
            Some(requester) => write!(f, "\"{title}\" - {requester}"),
            None => write!(f, "\"{title}\""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_track_is_playable() {
        let track = Track::direct("https://media.example.com/watch?v=abc");
        assert!(track.is_playable());
    }

    #[test]
    fn placeholder_is_not_playable() {
        let track = Track::placeholder("37i9dQZF1DXcBWIGoYBM5M", 3);
        assert!(!track.is_playable());
        assert!(is_catalog_scheme(track.locator.as_deref().unwrap()));
    }

    #[test]
    fn empty_locator_is_not_playable() {
        let mut track = Track::direct("");
        assert!(!track.is_playable());

        track.locator = None;
        assert!(!track.is_playable());
    }

    #[test]
    fn placeholder_payload_carries_position() {
        let track = Track::placeholder("listid", 7);
        let payload = track.placeholder_payload().unwrap();
        assert_eq!(payload.catalog_id, "listid");
        assert_eq!(payload.catalog_index, 7);
    }

    #[test]
    fn display_includes_requester_when_set() {
        let track = Track::direct("https://x")
            .with_title("Song")
            .with_requester("alice");
        assert_eq!(track.to_string(), "\"Song\" - alice");

        let untitled = Track::direct("https://x");
        assert_eq!(untitled.to_string(), "\"(untitled)\"");
    }
}
