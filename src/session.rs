//! Session registry.
//!
//! Maps session keys to their players. The registry is created once at
//! bootstrap with the shared collaborators and handed around by `Arc`;
//! players hold a weak reference back so a stopping player can remove
//! itself without keeping the registry alive.
//!
//! A stopped player never serves again: `get_or_create` replaces destroyed
//! entries with a fresh player holding an empty queue.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use crate::{
    acquire::StreamSource,
    config::Config,
    error::Result,
    player::Player,
    resolver::TrackResolver,
    sink::SinkFactory,
};

/// Live players by session key.
pub struct Registry {
    config: Config,
    resolver: Arc<dyn TrackResolver>,
    source: Arc<dyn StreamSource>,
    sinks: Arc<dyn SinkFactory>,
    players: Mutex<HashMap<u64, Arc<Player>>>,
}

impl Registry {
    /// Creates a registry over the shared collaborators.
    #[must_use]
    pub fn new(
        config: Config,
        resolver: Arc<dyn TrackResolver>,
        source: Arc<dyn StreamSource>,
        sinks: Arc<dyn SinkFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            resolver,
            source,
            sinks,
            players: Mutex::new(HashMap::new()),
        })
    }

    /// Looks up the live player for a key.
    #[must_use]
    pub fn get(&self, key: u64) -> Option<Arc<Player>> {
        self.players
            .lock()
            .ok()?
            .get(&key)
            .filter(|player| !player.is_destroyed())
            .map(Arc::clone)
    }

    /// Returns the live player for a key, creating one when none exists.
    ///
    /// A destroyed leftover entry is replaced, so callers always get a
    /// usable player with an empty queue after a `stop`.
    ///
    /// # Errors
    ///
    /// Returns an error when sink creation fails.
    pub fn get_or_create(self: &Arc<Self>, key: u64) -> Result<Arc<Player>> {
        let mut players = self.players.lock()?;
        if let Some(player) = players.get(&key) {
            if !player.is_destroyed() {
                return Ok(Arc::clone(player));
            }
        }

        debug!("creating player for session {key}");
        let sink = self.sinks.create()?;
        let player = Player::new(
            key,
            self.config.clone(),
            Arc::clone(&self.resolver),
            Arc::clone(&self.source),
            sink,
            Arc::downgrade(self),
        );
        players.insert(key, Arc::clone(&player));
        Ok(player)
    }

    /// Removes a session entry, if present.
    pub fn remove(&self, key: u64) {
        if let Ok(mut players) = self.players.lock() {
            players.remove(&key);
        }
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.players.lock().map_or(0, |players| players.len())
    }

    /// Whether no sessions are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops every session, for graceful shutdown.
    pub async fn shutdown(&self) {
        let players: Vec<_> = self
            .players
            .lock()
            .map(|players| players.values().map(Arc::clone).collect())
            .unwrap_or_default();

        for player in players {
            player.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::broadcast;

    use super::*;
    use crate::{
        acquire::MediaStream,
        catalog::CatalogTrack,
        error::Error,
        resolver::ResolvedTrack,
        sink::{Resource, Sink, SinkEvent, SinkState},
        track::Track,
    };

    struct NullResolver;

    #[async_trait]
    impl TrackResolver for NullResolver {
        async fn resolve(&self, _track: &Track) -> Result<ResolvedTrack> {
            Err(Error::not_found("null"))
        }

        async fn resolve_placeholder(
            &self,
            _catalog_id: &str,
            _index: usize,
        ) -> Result<Option<CatalogTrack>> {
            Ok(None)
        }

        async fn playlist_total(&self, _catalog_id: &str) -> Result<usize> {
            Ok(0)
        }
    }

    struct NullSource;

    #[async_trait]
    impl StreamSource for NullSource {
        async fn acquire(&self, _locator: &str) -> Result<MediaStream> {
            Err(Error::unavailable("null"))
        }
    }

    struct NullSink {
        events: broadcast::Sender<SinkEvent>,
    }

    #[async_trait]
    impl Sink for NullSink {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn play(&self, _resource: Resource) -> Result<()> {
            Ok(())
        }

        fn stop(&self, _force: bool) {}

        fn destroy(&self) {}

        fn state(&self) -> SinkState {
            SinkState::Ready
        }

        fn subscribe(&self) -> broadcast::Receiver<SinkEvent> {
            self.events.subscribe()
        }
    }

    struct NullSinkFactory;

    impl SinkFactory for NullSinkFactory {
        fn create(&self) -> Result<Arc<dyn Sink>> {
            let (events, _) = broadcast::channel(16);
            Ok(Arc::new(NullSink { events }))
        }
    }

    fn registry() -> Arc<Registry> {
        Registry::new(
            Config::default(),
            Arc::new(NullResolver),
            Arc::new(NullSource),
            Arc::new(NullSinkFactory),
        )
    }

    #[tokio::test]
    async fn same_key_yields_same_player() {
        let registry = registry();
        let a = registry.get_or_create(1).unwrap();
        let b = registry.get_or_create(1).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);

        let other = registry.get_or_create(2).unwrap();
        assert!(!Arc::ptr_eq(&a, &other));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn stop_removes_the_session_and_recreate_is_fresh_and_empty() {
        let registry = registry();
        let player = registry.get_or_create(1).unwrap();
        player
            .enqueue(Track::direct("https://media.example.com/a"), false)
            .await
            .unwrap();

        player.stop().await;
        assert!(registry.get(1).is_none());
        assert_eq!(registry.len(), 0);

        let fresh = registry.get_or_create(1).unwrap();
        assert!(!Arc::ptr_eq(&player, &fresh));
        assert!(!fresh.is_destroyed());
        assert_eq!(fresh.queue_len().await, 0);
    }

    #[tokio::test]
    async fn get_does_not_create() {
        let registry = registry();
        assert!(registry.get(9).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn shutdown_stops_every_session() {
        let registry = registry();
        let a = registry.get_or_create(1).unwrap();
        let b = registry.get_or_create(2).unwrap();

        registry.shutdown().await;

        assert!(a.is_destroyed());
        assert!(b.is_destroyed());
        assert!(registry.is_empty());
    }
}
