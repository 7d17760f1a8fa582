//! Playback orchestration for one session.
//!
//! A [`Player`] owns the queue of one session and everything that decides
//! what plays next: lazy placeholder resolution, the resolver and
//! acquisition chains, the sink lifecycle, the rolling playlist window and
//! the inactivity timer.
//!
//! All queue mutations go through a single async mutex, so concurrent
//! operations on one session serialize while different sessions run fully
//! independently. The sink handle lives outside that lock: `skip` and
//! `stop` interrupt playback even while an advance is in flight. An
//! advance drains the queue iteratively and drops every track it cannot
//! get playing, so a queue of unplayable tracks empties in one bounded
//! pass instead of wedging the session.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
};

use tokio::sync::{broadcast, Mutex};

use crate::{
    acquire::StreamSource,
    catalog,
    config::Config,
    error::{Error, ErrorKind, Result},
    resolver::TrackResolver,
    session::Registry,
    sink::{Resource, Sink, SinkEvent, SinkState},
    track::{Source, Track},
};

/// Rolling window over an upstream playlist.
///
/// `order` is a permutation of upstream indices; reshuffling the playlist
/// permutes this vector instead of materializing any track metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlaylistCursor {
    /// Catalog playlist being walked.
    pub catalog_id: String,

    /// Upstream indices in play order.
    pub order: Vec<usize>,

    /// Position of the next upstream item to materialize.
    pub next: usize,
}

impl PlaylistCursor {
    fn new(catalog_id: String, total: usize) -> Self {
        Self {
            catalog_id,
            order: (0..total).collect(),
            next: 0,
        }
    }

    /// Remaining upstream items.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.order.len().saturating_sub(self.next)
    }
}

/// Mutable session state behind the single owner lock.
struct State {
    queue: VecDeque<Track>,
    current: Option<Track>,
    cursor: Option<PlaylistCursor>,
    last_requester: Option<String>,
}

/// Playback orchestrator for one session.
pub struct Player {
    key: u64,
    config: Config,
    resolver: Arc<dyn TrackResolver>,
    source: Arc<dyn StreamSource>,
    sink: Arc<dyn Sink>,
    state: Mutex<State>,

    /// Re-entrancy guard: only one advance loop at a time.
    advancing: AtomicBool,

    /// Bumped on every user action; a pending inactivity timer compares
    /// it so a late-firing timer cannot tear down a live session.
    generation: AtomicU64,

    destroyed: AtomicBool,

    registry: Weak<Registry>,
}

impl Player {
    pub(crate) fn new(
        key: u64,
        config: Config,
        resolver: Arc<dyn TrackResolver>,
        source: Arc<dyn StreamSource>,
        sink: Arc<dyn Sink>,
        registry: Weak<Registry>,
    ) -> Arc<Self> {
        let player = Arc::new(Self {
            key,
            config,
            resolver,
            source,
            sink,
            state: Mutex::new(State {
                queue: VecDeque::new(),
                current: None,
                cursor: None,
                last_requester: None,
            }),
            advancing: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
            registry,
        });

        Self::spawn_event_pump(&player);
        player
    }

    /// Session key this player serves.
    #[must_use]
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Whether `stop` has run.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn check_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::failed_precondition(format!(
                "session {} is destroyed",
                self.key
            )));
        }
        Ok(())
    }

    fn touch(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Plays a playlist link, a direct URL or a free-text query.
    ///
    /// Playlist links install a rolling-window cursor and materialize the
    /// first window; everything else becomes a single queue entry.
    /// Playback starts when nothing is playing yet.
    ///
    /// # Errors
    ///
    /// Returns `FailedPrecondition` on a destroyed session and `NotFound`
    /// when a playlist link points at an unknown playlist. Resolution and
    /// acquisition failures of individual tracks never surface here.
    pub async fn play(self: &Arc<Self>, input: &str, requester: Option<&str>) -> Result<()> {
        self.check_alive()?;
        self.touch();

        if let Some(catalog_id) = catalog::extract_playlist_id(input) {
            let total = self.resolver.playlist_total(&catalog_id).await?;
            if total == 0 {
                return Err(Error::not_found(format!("playlist {catalog_id} is empty")));
            }

            info!("session {}: playing playlist {catalog_id} ({total} tracks)", self.key);
            let mut state = self.state.lock().await;
            state.last_requester = requester.map(ToOwned::to_owned);
            state.cursor = Some(PlaylistCursor::new(catalog_id, total));
            self.fill_window(&mut state).await;
            drop(state);
        } else {
            let mut track = if input.starts_with("http://") || input.starts_with("https://") {
                Track::direct(input)
            } else {
                Track::query(input)
            };
            track.requester = requester.map(ToOwned::to_owned);

            self.enqueue(track, false).await?;
        }

        self.advance().await;
        Ok(())
    }

    /// Appends a track to the queue.
    ///
    /// Duplicates (same locator, or same title ignoring case) are
    /// suppressed. Returns whether the track was actually appended.
    ///
    /// # Errors
    ///
    /// Returns `FailedPrecondition` on a destroyed session.
    pub async fn enqueue(self: &Arc<Self>, track: Track, autoplay: bool) -> Result<bool> {
        self.check_alive()?;
        self.touch();

        let appended = {
            let mut state = self.state.lock().await;
            if Self::is_duplicate(&state, &track) {
                debug!("session {}: suppressing duplicate {track}", self.key);
                false
            } else {
                state.queue.push_back(track);
                true
            }
        };

        if autoplay {
            self.advance().await;
        }

        Ok(appended)
    }

    fn is_duplicate(state: &State, track: &Track) -> bool {
        let same = |other: &Track| {
            if let (Some(a), Some(b)) = (track.locator.as_deref(), other.locator.as_deref()) {
                if !a.is_empty() && a == b {
                    return true;
                }
            }
            if let (Some(a), Some(b)) = (track.title.as_deref(), other.title.as_deref()) {
                if a.eq_ignore_ascii_case(b) {
                    return true;
                }
            }
            false
        };

        state.queue.iter().any(same) || state.current.as_ref().is_some_and(same)
    }

    /// Skips the current track.
    ///
    /// Forcibly stops the sink, which surfaces as an idle event and drives
    /// the next advance. Returns the upcoming queue head, or `None` when
    /// the queue is empty. Idempotent; callable while nothing plays.
    ///
    /// # Errors
    ///
    /// Returns `FailedPrecondition` on a destroyed session.
    pub async fn skip(self: &Arc<Self>) -> Result<Option<Track>> {
        self.check_alive()?;
        self.touch();

        let (playing, next) = {
            let state = self.state.lock().await;
            (state.current.is_some(), state.queue.front().cloned())
        };

        if playing {
            // The forced stop unblocks the sink, whose idle event advances.
            self.sink.stop(true);
        } else {
            self.advance().await;
        }

        Ok(next)
    }

    /// Shuffles upcoming playback.
    ///
    /// Simple mode permutes the materialized queue in place, leaving the
    /// current track alone. When a playlist cursor is active and simple
    /// mode is not forced, the entire upstream ordering is reshuffled
    /// instead: the cursor resets and the queue is rebuilt up to the
    /// window from the new order.
    ///
    /// # Errors
    ///
    /// Returns `FailedPrecondition` on a destroyed session.
    pub async fn shuffle(&self, force_simple: bool) -> Result<()> {
        self.check_alive()?;
        self.touch();

        let mut state = self.state.lock().await;
        if !force_simple && state.cursor.is_some() {
            if let Some(cursor) = state.cursor.as_mut() {
                fastrand::shuffle(&mut cursor.order);
                cursor.next = 0;
            }
            state.queue.clear();
            self.fill_window(&mut state).await;
        } else {
            fastrand::shuffle(state.queue.make_contiguous());
        }

        Ok(())
    }

    /// Stops playback and destroys the session.
    ///
    /// Clears the queue, tears down the sink and removes this player from
    /// the registry. Terminal: any later operation on this player is
    /// caller misuse, and callers get a fresh player from the registry.
    pub async fn stop(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.touch();

        info!("session {}: stopping", self.key);
        {
            let mut state = self.state.lock().await;
            state.queue.clear();
            state.current = None;
            state.cursor = None;
        }

        self.sink.destroy();

        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.key);
        }
    }

    /// Ordered view of the upcoming queue, playable entries only.
    pub async fn queue_view(&self) -> Vec<Track> {
        let state = self.state.lock().await;
        state
            .queue
            .iter()
            .filter(|track| track.is_playable())
            .cloned()
            .collect()
    }

    /// The currently playing track, if any.
    pub async fn current(&self) -> Option<Track> {
        self.state.lock().await.current.clone()
    }

    /// Number of queued entries, playable or not.
    pub async fn queue_len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Active playlist cursor, if any.
    pub async fn cursor(&self) -> Option<PlaylistCursor> {
        self.state.lock().await.cursor.clone()
    }

    /// Drains the queue until something plays or nothing is left.
    ///
    /// Every track that cannot be brought to playback is dropped and the
    /// loop continues, so one pass is bounded by the queue length. When
    /// the queue empties, the inactivity timer is armed.
    async fn advance(self: &Arc<Self>) {
        if self.is_destroyed() {
            return;
        }
        if self
            .advancing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let mut state = self.state.lock().await;
        if state.current.is_none() {
            loop {
                if self.is_destroyed() {
                    break;
                }

                let Some(mut track) = state.queue.pop_front() else {
                    state.current = None;
                    self.arm_inactivity();
                    break;
                };

                let resource = match self.prepare(&mut track).await {
                    Ok(resource) => resource,
                    Err(e) => {
                        warn!("session {}: skipping {track}: {e}", self.key);
                        continue;
                    }
                };

                if self.sink.state() != SinkState::Ready {
                    match tokio::time::timeout(self.config.ready_timeout, self.sink.connect())
                        .await
                    {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            warn!("session {}: sink connect failed: {e}", self.key);
                            continue;
                        }
                        Err(_) => {
                            warn!("session {}: sink not ready in time", self.key);
                            continue;
                        }
                    }
                }

                if let Err(e) = self.sink.play(resource).await {
                    warn!("session {}: failed to start {track}: {e}", self.key);
                    continue;
                }

                info!("session {}: playing {track}", self.key);
                state.current = Some(track);
                self.touch();
                self.fill_window(&mut state).await;
                break;
            }
        }
        // Cleared while still holding the lock: a concurrent enqueue either
        // pushed before this loop examined the queue, or acquires the lock
        // after the flag is clear and its own advance proceeds.
        self.advancing.store(false, Ordering::SeqCst);
        drop(state);
    }

    /// Takes one track from popped state to a playable resource.
    ///
    /// Placeholder metadata fetch, locator resolution and stream
    /// acquisition all happen here; any failure skips the track.
    async fn prepare(&self, track: &mut Track) -> Result<Resource> {
        if let Source::CatalogPlaceholder(placeholder) = &track.source {
            if placeholder.cached_name.is_none() {
                let meta = self
                    .resolver
                    .resolve_placeholder(&placeholder.catalog_id, placeholder.catalog_index)
                    .await?
                    .ok_or_else(|| {
                        Error::not_found(format!(
                            "playlist {} has no position {}",
                            placeholder.catalog_id, placeholder.catalog_index
                        ))
                    })?;

                if let Source::CatalogPlaceholder(placeholder) = &mut track.source {
                    placeholder.cached_name = Some(meta.name.clone());
                    placeholder.cached_performers = meta.performers;
                }
                if track.title.is_none() {
                    track.title = Some(meta.name);
                }
                track.art_url = meta.album_art_url;
            }
        }

        if !track.is_playable() {
            let resolved = self.resolver.resolve(track).await?;
            track.locator = Some(resolved.locator);
            if track.title.is_none() {
                track.title = Some(resolved.title);
            }
        }

        let locator = track
            .locator
            .as_deref()
            .filter(|_| track.is_playable())
            .ok_or_else(|| Error::invalid_argument(format!("{track} has no usable locator")))?;

        let media = self.source.acquire(locator).await?;
        Ok(Resource {
            media,
            gain: self.config.volume,
        })
    }

    /// Tops the queue up from the playlist cursor.
    ///
    /// Each upstream position is attempted exactly once: the cursor
    /// advances whether or not the position resolves, so an unresolvable
    /// position is skipped permanently rather than retried.
    async fn fill_window(&self, state: &mut State) {
        loop {
            if state.queue.len() >= self.config.queue_window {
                break;
            }

            let Some((catalog_id, index)) = (match state.cursor.as_mut() {
                Some(cursor) if cursor.next < cursor.order.len() => {
                    let index = cursor.order[cursor.next];
                    cursor.next += 1;
                    Some((cursor.catalog_id.clone(), index))
                }
                _ => None,
            }) else {
                break;
            };

            let mut track = Track::placeholder(&catalog_id, index);
            track.requester = state.last_requester.clone();

            match self.materialize(&mut track).await {
                Ok(()) => {
                    if Self::is_duplicate(state, &track) {
                        debug!("session {}: window duplicate {track}", self.key);
                    } else {
                        state.queue.push_back(track);
                    }
                }
                Err(e) => {
                    warn!(
                        "session {}: skipping playlist position {index}: {e}",
                        self.key
                    );
                }
            }
        }
    }

    /// Resolves a window placeholder into a playable entry.
    async fn materialize(&self, track: &mut Track) -> Result<()> {
        let Some(placeholder) = track.placeholder_payload() else {
            return Err(Error::invalid_argument("not a placeholder"));
        };

        let meta = self
            .resolver
            .resolve_placeholder(&placeholder.catalog_id, placeholder.catalog_index)
            .await?
            .ok_or_else(|| Error::not_found("position out of range"))?;

        if let Source::CatalogPlaceholder(placeholder) = &mut track.source {
            placeholder.cached_name = Some(meta.name.clone());
            placeholder.cached_performers = meta.performers;
        }
        track.title = Some(meta.name);
        track.art_url = meta.album_art_url;

        let resolved = self.resolver.resolve(track).await?;
        track.locator = Some(resolved.locator);
        Ok(())
    }

    /// Arms the inactivity timer for the current generation.
    ///
    /// The callback re-checks liveness and the generation counter, so a
    /// timer that lost the race against new activity is a no-op.
    fn arm_inactivity(self: &Arc<Self>) {
        let epoch = self.generation.load(Ordering::SeqCst);
        let timeout = self.config.inactivity_timeout;
        let weak = Arc::downgrade(self);

        debug!("session {}: arming inactivity timer", self.key);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            let Some(player) = weak.upgrade() else {
                return;
            };
            if player.is_destroyed() || player.generation.load(Ordering::SeqCst) != epoch {
                return;
            }

            let idle = {
                let state = player.state.lock().await;
                state.current.is_none() && state.queue.is_empty()
            };
            if idle {
                info!("session {}: idle for {timeout:?}, tearing down", player.key);
                player.stop().await;
            }
        });
    }

    /// Routes sink lifecycle events back into the orchestrator.
    fn spawn_event_pump(player: &Arc<Self>) {
        let mut events = player.sink.subscribe();
        let weak = Arc::downgrade(player);

        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("sink event pump lagged by {skipped}");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let Some(player) = weak.upgrade() else {
                    break;
                };

                match event {
                    SinkEvent::Idle => player.on_idle().await,
                    SinkEvent::Errored(kind) => player.on_sink_error(kind).await,
                    SinkEvent::StateChanged(SinkState::Destroyed) => break,
                    SinkEvent::StateChanged(state) => {
                        debug!("session {}: sink is {state:?}", player.key);
                    }
                }
            }
        });
    }

    async fn on_idle(self: &Arc<Self>) {
        if self.is_destroyed() {
            return;
        }

        {
            let mut state = self.state.lock().await;
            state.current = None;
        }
        self.advance().await;
    }

    /// Handles a playback failure reported by the sink.
    ///
    /// A transient failure requeues the current track at the front, once;
    /// anything else drops it. Either way the queue advances.
    async fn on_sink_error(self: &Arc<Self>, kind: ErrorKind) {
        if self.is_destroyed() {
            return;
        }

        let transient = matches!(kind, ErrorKind::Aborted | ErrorKind::DataLoss);
        {
            let mut state = self.state.lock().await;
            if let Some(mut current) = state.current.take() {
                if transient && !current.retried {
                    warn!(
                        "session {}: transient failure on {current}, requeueing once",
                        self.key
                    );
                    current.retried = true;
                    state.queue.push_front(current);
                } else {
                    warn!("session {}: dropping {current} after {kind}", self.key);
                }
            }
        }
        self.advance().await;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        io::Cursor,
        sync::atomic::AtomicUsize,
        sync::Mutex as StdMutex,
        time::Duration,
    };

    use async_trait::async_trait;

    use super::*;
    use crate::{
        acquire::MediaStream,
        catalog::CatalogTrack,
        resolver::ResolvedTrack,
    };

    struct MockResolver {
        /// Playlist contents by id; `None` positions are unresolvable.
        playlists: HashMap<String, Vec<Option<CatalogTrack>>>,
        /// Queries (or cached names) that resolve; everything else misses.
        resolvable: bool,
        resolve_calls: AtomicUsize,
        placeholder_calls: AtomicUsize,
    }

    impl MockResolver {
        fn resolving() -> Self {
            Self {
                playlists: HashMap::new(),
                resolvable: true,
                resolve_calls: AtomicUsize::new(0),
                placeholder_calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                playlists: HashMap::new(),
                resolvable: false,
                resolve_calls: AtomicUsize::new(0),
                placeholder_calls: AtomicUsize::new(0),
            }
        }

        fn with_playlist(mut self, id: &str, tracks: Vec<Option<CatalogTrack>>) -> Self {
            self.playlists.insert(id.to_owned(), tracks);
            self
        }
    }

    fn meta(name: &str) -> Option<CatalogTrack> {
        Some(CatalogTrack {
            name: name.to_owned(),
            performers: vec!["artist".to_owned()],
            external_url: None,
            album_art_url: None,
        })
    }

    #[async_trait]
    impl TrackResolver for MockResolver {
        async fn resolve(&self, track: &Track) -> Result<ResolvedTrack> {
            self.resolve_calls.fetch_add(1, Ordering::SeqCst);
            if self.resolvable {
                let title = track.title.clone().unwrap_or_else(|| "hit".to_owned());
                Ok(ResolvedTrack {
                    locator: format!("https://media.example.com/{title}"),
                    title,
                })
            } else {
                Err(Error::not_found("scripted miss"))
            }
        }

        async fn resolve_placeholder(
            &self,
            catalog_id: &str,
            index: usize,
        ) -> Result<Option<CatalogTrack>> {
            self.placeholder_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .playlists
                .get(catalog_id)
                .and_then(|tracks| tracks.get(index).cloned())
                .flatten())
        }

        async fn playlist_total(&self, catalog_id: &str) -> Result<usize> {
            self.playlists
                .get(catalog_id)
                .map(Vec::len)
                .ok_or_else(|| Error::not_found("unknown playlist"))
        }
    }

    struct MockSource {
        ok: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StreamSource for MockSource {
        async fn acquire(&self, locator: &str) -> Result<MediaStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            crate::acquire::validate_locator(locator)?;
            if self.ok {
                Ok(MediaStream {
                    reader: Box::new(Cursor::new(vec![0u8; 16])),
                    byte_len: Some(16),
                })
            } else {
                Err(Error::unavailable("scripted acquisition failure"))
            }
        }
    }

    struct MockSink {
        events: broadcast::Sender<SinkEvent>,
        state: StdMutex<SinkState>,
        played: StdMutex<Vec<f32>>,
    }

    impl MockSink {
        fn new() -> Arc<Self> {
            let (events, _) = broadcast::channel(16);
            Arc::new(Self {
                events,
                state: StdMutex::new(SinkState::Connecting),
                played: StdMutex::new(Vec::new()),
            })
        }

        fn emit(&self, event: SinkEvent) {
            drop(self.events.send(event));
        }

        fn played_count(&self) -> usize {
            self.played.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Sink for MockSink {
        async fn connect(&self) -> Result<()> {
            *self.state.lock().unwrap() = SinkState::Ready;
            Ok(())
        }

        async fn play(&self, resource: Resource) -> Result<()> {
            self.played.lock().unwrap().push(resource.gain);
            Ok(())
        }

        fn stop(&self, _force: bool) {
            // A forced stop surfaces as idle, like the real sink.
            self.emit(SinkEvent::Idle);
        }

        fn destroy(&self) {
            *self.state.lock().unwrap() = SinkState::Destroyed;
        }

        fn state(&self) -> SinkState {
            *self.state.lock().unwrap()
        }

        fn subscribe(&self) -> broadcast::Receiver<SinkEvent> {
            self.events.subscribe()
        }
    }

    /// Sink that never reaches the ready state: `connect` either hangs or
    /// errors, depending on `hang`.
    struct UnreadySink {
        events: broadcast::Sender<SinkEvent>,
        hang: bool,
        connect_calls: AtomicUsize,
    }

    impl UnreadySink {
        fn new(hang: bool) -> Arc<Self> {
            let (events, _) = broadcast::channel(16);
            Arc::new(Self {
                events,
                hang,
                connect_calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Sink for UnreadySink {
        async fn connect(&self) -> Result<()> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            Err(Error::unavailable("scripted connect failure"))
        }

        async fn play(&self, _resource: Resource) -> Result<()> {
            panic!("an unready sink must never play");
        }

        fn stop(&self, _force: bool) {}

        fn destroy(&self) {}

        fn state(&self) -> SinkState {
            SinkState::Connecting
        }

        fn subscribe(&self) -> broadcast::Receiver<SinkEvent> {
            self.events.subscribe()
        }
    }

    fn player_with_sink(sink: Arc<dyn Sink>) -> Arc<Player> {
        Player::new(
            7,
            Config::default(),
            Arc::new(MockResolver::resolving()),
            Arc::new(MockSource {
                ok: true,
                calls: AtomicUsize::new(0),
            }),
            sink,
            Weak::new(),
        )
    }

    fn player_with(
        resolver: MockResolver,
        source_ok: bool,
    ) -> (Arc<Player>, Arc<MockSink>, Arc<MockResolver>) {
        let resolver = Arc::new(resolver);
        let sink = MockSink::new();
        let player = Player::new(
            7,
            Config::default(),
            Arc::clone(&resolver) as Arc<dyn TrackResolver>,
            Arc::new(MockSource {
                ok: source_ok,
                calls: AtomicUsize::new(0),
            }),
            Arc::clone(&sink) as Arc<dyn Sink>,
            Weak::new(),
        );
        (player, sink, resolver)
    }

    #[tokio::test]
    async fn duplicate_locator_is_suppressed() {
        let (player, _sink, _) = player_with(MockResolver::resolving(), true);

        let a = Track::direct("u1").with_title("Song A");
        let b = Track::direct("u1").with_title("Song B");
        assert!(player.enqueue(a, false).await.unwrap());
        assert!(!player.enqueue(b, false).await.unwrap());
        assert_eq!(player.queue_len().await, 1);
    }

    #[tokio::test]
    async fn duplicate_title_is_suppressed_case_insensitively() {
        let (player, _sink, _) = player_with(MockResolver::resolving(), true);

        let a = Track::query("Song A");
        let b = Track::query("song a");
        assert!(player.enqueue(a, false).await.unwrap());
        assert!(!player.enqueue(b, false).await.unwrap());
        assert_eq!(player.queue_len().await, 1);
    }

    #[tokio::test]
    async fn queue_view_contains_only_playable_tracks() {
        let (player, _sink, _) = player_with(MockResolver::resolving(), true);

        player
            .enqueue(Track::direct("https://a").with_title("a"), false)
            .await
            .unwrap();
        player.enqueue(Track::query("not yet resolved"), false).await.unwrap();
        player
            .enqueue(Track::placeholder("listid", 0), false)
            .await
            .unwrap();

        let view = player.queue_view().await;
        assert_eq!(view.len(), 1);
        assert!(view.iter().all(Track::is_playable));
        assert_eq!(player.queue_len().await, 3);
    }

    #[tokio::test]
    async fn all_failing_queue_terminates_within_queue_length() {
        let (player, sink, resolver) = player_with(MockResolver::failing(), true);

        for i in 0..5 {
            player
                .enqueue(Track::query(format!("track {i}")), false)
                .await
                .unwrap();
        }

        player.advance().await;

        assert_eq!(player.queue_len().await, 0);
        assert!(player.current().await.is_none());
        assert_eq!(sink.played_count(), 0);
        assert_eq!(resolver.resolve_calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn unresolvable_track_is_skipped_and_next_plays() {
        let (player, sink, _) = player_with(
            MockResolver::resolving().with_playlist("listid", vec![None, meta("Good")]),
            true,
        );

        player.enqueue(Track::placeholder("listid", 0), false).await.unwrap();
        player
            .enqueue(Track::direct("https://media.example.com/good").with_title("Good"), false)
            .await
            .unwrap();

        player.advance().await;

        assert_eq!(sink.played_count(), 1);
        let current = player.current().await.unwrap();
        assert_eq!(current.title.as_deref(), Some("Good"));
    }

    #[tokio::test(start_paused = true)]
    async fn sink_readiness_timeout_drops_track_and_continues() {
        let sink = UnreadySink::new(true);
        let player = player_with_sink(Arc::clone(&sink) as Arc<dyn Sink>);

        player
            .enqueue(Track::direct("https://media.example.com/a").with_title("a"), false)
            .await
            .unwrap();
        player
            .enqueue(Track::direct("https://media.example.com/b").with_title("b"), false)
            .await
            .unwrap();

        player.advance().await;

        // Both tracks timed out waiting for readiness and were dropped.
        assert_eq!(sink.connect_calls.load(Ordering::SeqCst), 2);
        assert!(player.current().await.is_none());
        assert_eq!(player.queue_len().await, 0);
    }

    #[tokio::test]
    async fn sink_connect_failure_drops_track_and_continues() {
        let sink = UnreadySink::new(false);
        let player = player_with_sink(Arc::clone(&sink) as Arc<dyn Sink>);

        player
            .enqueue(Track::direct("https://media.example.com/a").with_title("a"), false)
            .await
            .unwrap();
        player
            .enqueue(Track::direct("https://media.example.com/b").with_title("b"), false)
            .await
            .unwrap();

        player.advance().await;

        assert_eq!(sink.connect_calls.load(Ordering::SeqCst), 2);
        assert!(player.current().await.is_none());
        assert_eq!(player.queue_len().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_autoplay_enqueues_always_start_playback() {
        let (player, _sink, _) = player_with(MockResolver::resolving(), true);

        // Two racing autoplay enqueues: whichever advance loses the guard
        // exchange must still have its track picked up by the winner.
        let first = tokio::spawn({
            let player = Arc::clone(&player);
            async move {
                player
                    .enqueue(
                        Track::direct("https://media.example.com/a").with_title("a"),
                        true,
                    )
                    .await
            }
        });
        let second = tokio::spawn({
            let player = Arc::clone(&player);
            async move {
                player
                    .enqueue(
                        Track::direct("https://media.example.com/b").with_title("b"),
                        true,
                    )
                    .await
            }
        });

        assert!(first.await.unwrap().unwrap());
        assert!(second.await.unwrap().unwrap());

        assert!(player.current().await.is_some());
    }

    #[tokio::test]
    async fn acquisition_failure_drains_queue() {
        let (player, sink, _) = player_with(MockResolver::resolving(), false);

        player
            .enqueue(Track::direct("https://media.example.com/a").with_title("a"), false)
            .await
            .unwrap();
        player
            .enqueue(Track::direct("https://media.example.com/b").with_title("b"), false)
            .await
            .unwrap();

        player.advance().await;

        assert_eq!(sink.played_count(), 0);
        assert!(player.current().await.is_none());
        assert_eq!(player.queue_len().await, 0);
    }

    #[tokio::test]
    async fn playback_uses_configured_gain() {
        let (player, sink, _) = player_with(MockResolver::resolving(), true);

        player
            .play("https://media.example.com/song", Some("alice"))
            .await
            .unwrap();

        let gains = sink.played.lock().unwrap().clone();
        assert_eq!(gains, vec![0.8]);
        assert_eq!(
            player.current().await.unwrap().requester.as_deref(),
            Some("alice")
        );
    }

    #[tokio::test]
    async fn transient_error_requeues_current_once() {
        let (player, sink, _) = player_with(MockResolver::resolving(), true);

        player
            .play("https://media.example.com/song", None)
            .await
            .unwrap();
        assert_eq!(sink.played_count(), 1);

        // First transient failure: requeued at the front and replayed.
        let current = player.current().await.unwrap();
        player.on_sink_error(ErrorKind::Aborted).await;
        assert_eq!(sink.played_count(), 2);
        let replayed = player.current().await.unwrap();
        assert_eq!(replayed.locator, current.locator);
        assert!(replayed.retried);

        // Second failure on the same track: dropped for good.
        player.on_sink_error(ErrorKind::Aborted).await;
        assert_eq!(sink.played_count(), 2);
        assert!(player.current().await.is_none());
    }

    #[tokio::test]
    async fn non_transient_error_drops_current() {
        let (player, sink, _) = player_with(MockResolver::resolving(), true);

        player
            .play("https://media.example.com/song", None)
            .await
            .unwrap();
        player.on_sink_error(ErrorKind::Unavailable).await;

        assert_eq!(sink.played_count(), 1);
        assert!(player.current().await.is_none());
    }

    #[tokio::test]
    async fn skip_returns_upcoming_head_and_is_idempotent() {
        let (player, _sink, _) = player_with(MockResolver::resolving(), true);

        player
            .play("https://media.example.com/one", None)
            .await
            .unwrap();
        player
            .enqueue(
                Track::direct("https://media.example.com/two").with_title("two"),
                false,
            )
            .await
            .unwrap();

        let next = player.skip().await.unwrap().unwrap();
        assert_eq!(next.locator.as_deref(), Some("https://media.example.com/two"));

        // Let the idle event from the forced stop advance playback.
        for _ in 0..50 {
            tokio::task::yield_now().await;
            if player.current().await.as_ref() == Some(&next) {
                break;
            }
        }
        assert_eq!(player.current().await, Some(next));

        // Skipping with an empty queue is a no-op that reports nothing next.
        let empty = player.skip().await.unwrap();
        assert!(empty.is_none());
    }

    #[tokio::test]
    async fn operations_on_destroyed_player_are_misuse() {
        let (player, _sink, _) = player_with(MockResolver::resolving(), true);
        player.stop().await;

        let err = player.skip().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::FailedPrecondition);
        let err = player
            .enqueue(Track::direct("https://x"), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::FailedPrecondition);

        // Stop itself stays idempotent.
        player.stop().await;
    }

    #[tokio::test]
    async fn simple_shuffle_preserves_set_and_current() {
        let (player, _sink, _) = player_with(MockResolver::resolving(), true);

        player
            .play("https://media.example.com/current", None)
            .await
            .unwrap();
        for name in ["a", "b", "c", "d"] {
            player
                .enqueue(
                    Track::direct(format!("https://media.example.com/{name}"))
                        .with_title(name),
                    false,
                )
                .await
                .unwrap();
        }

        let before_current = player.current().await.unwrap();
        let mut before: Vec<_> = player
            .queue_view()
            .await
            .into_iter()
            .map(|track| track.locator.unwrap())
            .collect();

        player.shuffle(true).await.unwrap();

        let after_current = player.current().await.unwrap();
        let mut after: Vec<_> = player
            .queue_view()
            .await
            .into_iter()
            .map(|track| track.locator.unwrap())
            .collect();

        assert_eq!(before_current, after_current);
        before.sort();
        after.sort();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn simple_shuffle_distribution_is_roughly_uniform() {
        let (player, _sink, _) = player_with(MockResolver::resolving(), true);

        for name in ["a", "b", "c"] {
            player
                .enqueue(
                    Track::direct(format!("https://media.example.com/{name}"))
                        .with_title(name),
                    false,
                )
                .await
                .unwrap();
        }

        fastrand::seed(42);
        let mut counts: HashMap<Vec<String>, usize> = HashMap::new();
        for _ in 0..600 {
            player.shuffle(true).await.unwrap();
            let order: Vec<String> = player
                .queue_view()
                .await
                .into_iter()
                .map(|track| track.locator.unwrap())
                .collect();
            *counts.entry(order).or_default() += 1;
        }

        assert_eq!(counts.len(), 6);
        for (_, count) in counts {
            // Expectation is 100 per permutation; allow generous slack.
            assert!(count > 40, "permutation seen only {count} times");
        }
    }

    #[tokio::test]
    async fn playlist_fills_window_and_advances_cursor_once_per_position() {
        let tracks: Vec<_> = (0..20).map(|i| meta(&format!("track {i}"))).collect();
        let (player, sink, resolver) = player_with(
            MockResolver::resolving().with_playlist("37i9dQZF1DXcBWIGoYBM5M", tracks),
            true,
        );

        player
            .play(
                "https://open.spotify.com/playlist/37i9dQZF1DXcBWIGoYBM5M",
                Some("alice"),
            )
            .await
            .unwrap();

        // One window of positions materialized, plus one consumed by playback
        // and replenished after it started.
        assert_eq!(sink.played_count(), 1);
        assert_eq!(player.queue_len().await, 10);
        let cursor = player.cursor().await.unwrap();
        assert_eq!(cursor.next, 11);
        assert_eq!(
            resolver.placeholder_calls.load(Ordering::SeqCst),
            11
        );
    }

    #[tokio::test]
    async fn window_skips_unresolvable_positions_permanently() {
        // Position 1 does not resolve; the cursor moves past it anyway.
        let tracks = vec![meta("zero"), None, meta("two"), meta("three")];
        let (player, _sink, _) = player_with(
            MockResolver::resolving().with_playlist("37i9dQZF1DXcBWIGoYBM5M", tracks),
            true,
        );

        player
            .play("https://open.spotify.com/playlist/37i9dQZF1DXcBWIGoYBM5M", None)
            .await
            .unwrap();

        let cursor = player.cursor().await.unwrap();
        assert_eq!(cursor.remaining(), 0);
        // Three resolvable positions: one playing, two queued.
        assert_eq!(player.queue_len().await, 2);
        let titles: Vec<_> = player
            .queue_view()
            .await
            .into_iter()
            .map(|track| track.title.unwrap())
            .collect();
        assert_eq!(titles, vec!["two".to_owned(), "three".to_owned()]);
    }

    #[tokio::test]
    async fn full_shuffle_resets_cursor_and_rebuilds_queue() {
        let tracks: Vec<_> = (0..6).map(|i| meta(&format!("track {i}"))).collect();
        let (player, _sink, _) = player_with(
            MockResolver::resolving().with_playlist("37i9dQZF1DXcBWIGoYBM5M", tracks),
            true,
        );

        player
            .play("https://open.spotify.com/playlist/37i9dQZF1DXcBWIGoYBM5M", None)
            .await
            .unwrap();
        let before = player.cursor().await.unwrap();
        assert_eq!(before.remaining(), 0);

        player.shuffle(false).await.unwrap();

        let after = player.cursor().await.unwrap();
        assert_eq!(after.order.len(), 6);
        assert_eq!(after.remaining(), 0);
        // The whole playlist rematerialized from the new order, minus the
        // currently playing track, which is suppressed as a duplicate.
        assert_eq!(player.queue_len().await, 5);

        let mut order = after.order;
        order.sort_unstable();
        assert_eq!(order, (0..6).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn inactivity_timer_tears_the_session_down() {
        let (player, _sink, _) = player_with(MockResolver::resolving(), true);

        player
            .play("https://media.example.com/song", None)
            .await
            .unwrap();

        // Track finishes; queue is empty, so the timer arms.
        player.on_idle().await;
        assert!(!player.is_destroyed());

        tokio::time::sleep(Duration::from_secs(5 * 60 + 1)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert!(player.is_destroyed());
    }

    #[tokio::test(start_paused = true)]
    async fn new_activity_cancels_a_pending_inactivity_timer() {
        let (player, _sink, _) = player_with(MockResolver::resolving(), true);

        player
            .play("https://media.example.com/song", None)
            .await
            .unwrap();
        player.on_idle().await;

        // Fresh activity before the deadline bumps the generation.
        tokio::time::sleep(Duration::from_secs(4 * 60)).await;
        player
            .play("https://media.example.com/other", None)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(2 * 60)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert!(!player.is_destroyed());
    }
}
