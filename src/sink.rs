//! Playback sinks.
//!
//! A sink is the outward boundary of a session: it receives acquired audio
//! and reports its lifecycle back through a broadcast channel. The
//! orchestrator only depends on the [`Sink`] trait; the bundled
//! [`AudioSink`] plays through the local audio device with `rodio`.
//!
//! The local output stream is not `Send`, so a dedicated thread owns it
//! for the lifetime of the sink. Playback commands cross over on a
//! channel; `stop` reaches the current `rodio` sink directly so it takes
//! effect while the audio thread is blocked on playback. A forced stop
//! unblocks the thread and surfaces as [`SinkEvent::Idle`], which is what
//! drives the orchestrator to advance.

use std::sync::{
    mpsc,
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use rodio::{Decoder, OutputStream};
use tokio::sync::{broadcast, oneshot};

use crate::{
    acquire::MediaStream,
    error::{Error, ErrorKind, Result},
};

/// Connection lifecycle of a sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SinkState {
    /// Connection is being established.
    Connecting,

    /// Ready to accept resources.
    Ready,

    /// Connection lost; may become ready again.
    Disconnected,

    /// Torn down for good.
    Destroyed,
}

/// Lifecycle notifications emitted by a sink.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkEvent {
    /// The current resource finished or was stopped.
    Idle,

    /// Playback of the current resource failed.
    Errored(ErrorKind),

    /// The connection changed state.
    StateChanged(SinkState),
}

/// One playable unit handed to a sink.
pub struct Resource {
    /// Acquired audio bytes.
    pub media: MediaStream,

    /// Linear gain to play at.
    pub gain: f32,
}

/// Playback boundary of a session.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Establishes the connection. Idempotent.
    async fn connect(&self) -> Result<()>;

    /// Starts playing a resource. Returns once playback has started;
    /// completion is signalled through [`SinkEvent::Idle`].
    async fn play(&self, resource: Resource) -> Result<()>;

    /// Stops the current resource. A forced stop interrupts mid-play.
    fn stop(&self, force: bool);

    /// Tears the sink down for good.
    fn destroy(&self);

    /// Current connection state.
    fn state(&self) -> SinkState;

    /// Subscribes to lifecycle events.
    fn subscribe(&self) -> broadcast::Receiver<SinkEvent>;
}

/// Mints one sink per session.
pub trait SinkFactory: Send + Sync {
    /// Creates a fresh, unconnected sink.
    fn create(&self) -> Result<Arc<dyn Sink>>;
}

/// Capacity of the event channel. Events are small and consumed promptly;
/// a lagging receiver only misses stale lifecycle notifications.
const EVENT_CAPACITY: usize = 16;

enum Command {
    Play(Resource),
    Shutdown,
}

struct Shared {
    state: Mutex<SinkState>,
    events: broadcast::Sender<SinkEvent>,
    /// Sink of the resource currently playing, for out-of-band stop.
    current: Mutex<Option<Arc<rodio::Sink>>>,
    destroyed: AtomicBool,
}

impl Shared {
    fn set_state(&self, state: SinkState) {
        if let Ok(mut guard) = self.state.lock() {
            if *guard == state {
                return;
            }
            *guard = state;
        }
        drop(self.events.send(SinkEvent::StateChanged(state)));
    }
}

/// Local audio device sink.
pub struct AudioSink {
    shared: Arc<Shared>,
    commands: Mutex<Option<mpsc::Sender<Command>>>,
}

impl AudioSink {
    /// Creates an unconnected sink.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SinkState::Connecting),
                events,
                current: Mutex::new(None),
                destroyed: AtomicBool::new(false),
            }),
            commands: Mutex::new(None),
        }
    }

    /// Playback loop run on the audio thread.
    ///
    /// Owns the output stream, which must not cross threads.
    fn run(
        shared: &Arc<Shared>,
        ready: oneshot::Sender<Result<()>>,
        commands: &mpsc::Receiver<Command>,
    ) {
        let (stream, handle) = match OutputStream::try_default() {
            Ok(output) => output,
            Err(e) => {
                drop(ready.send(Err(e.into())));
                return;
            }
        };
        // Keep the stream alive for as long as we play.
        let _stream = stream;

        shared.set_state(SinkState::Ready);
        drop(ready.send(Ok(())));

        while let Ok(command) = commands.recv() {
            match command {
                Command::Play(resource) => {
                    let source = match Decoder::new(resource.media.reader) {
                        Ok(source) => source,
                        Err(e) => {
                            warn!("failed to decode media: {e}");
                            drop(shared.events.send(SinkEvent::Errored(ErrorKind::DataLoss)));
                            continue;
                        }
                    };

                    let sink = match rodio::Sink::try_new(&handle) {
                        Ok(sink) => Arc::new(sink),
                        Err(e) => {
                            warn!("failed to open playback sink: {e}");
                            drop(
                                shared
                                    .events
                                    .send(SinkEvent::Errored(ErrorKind::Unavailable)),
                            );
                            continue;
                        }
                    };

                    sink.set_volume(resource.gain);
                    sink.append(source);

                    if let Ok(mut current) = shared.current.lock() {
                        *current = Some(Arc::clone(&sink));
                    }

                    // Blocks until the source drains or `stop` interrupts.
                    sink.sleep_until_end();

                    if let Ok(mut current) = shared.current.lock() {
                        *current = None;
                    }
                    drop(shared.events.send(SinkEvent::Idle));
                }
                Command::Shutdown => break,
            }
        }

        shared.set_state(SinkState::Destroyed);
    }
}

impl Default for AudioSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sink for AudioSink {
    async fn connect(&self) -> Result<()> {
        if self.shared.destroyed.load(Ordering::SeqCst) {
            return Err(Error::failed_precondition("sink is destroyed"));
        }

        {
            let commands = self.commands.lock()?;
            if commands.is_some() {
                return Ok(());
            }
        }

        let (tx, rx) = mpsc::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let shared = Arc::clone(&self.shared);
        std::thread::Builder::new()
            .name("audio sink".to_owned())
            .spawn(move || Self::run(&shared, ready_tx, &rx))
            .map_err(|e| Error::internal(e.to_string()))?;

        ready_rx
            .await
            .map_err(|_| Error::unavailable("audio thread exited before becoming ready"))??;

        *self.commands.lock()? = Some(tx);
        Ok(())
    }

    async fn play(&self, resource: Resource) -> Result<()> {
        let commands = self.commands.lock()?;
        let sender = commands
            .as_ref()
            .ok_or_else(|| Error::failed_precondition("sink is not connected"))?;
        sender
            .send(Command::Play(resource))
            .map_err(|_| Error::unavailable("audio thread is gone"))
    }

    fn stop(&self, force: bool) {
        if let Ok(current) = self.shared.current.lock() {
            if let Some(sink) = current.as_ref() {
                if force {
                    sink.stop();
                } else {
                    sink.clear();
                }
            }
        }
    }

    fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.stop(true);
        if let Ok(mut commands) = self.commands.lock() {
            if let Some(sender) = commands.take() {
                // The audio thread reports the destroyed state when its
                // loop winds down.
                drop(sender.send(Command::Shutdown));
                return;
            }
        }

        // Never connected, so no audio thread will report for us.
        self.shared.set_state(SinkState::Destroyed);
    }

    fn state(&self) -> SinkState {
        self.shared
            .state
            .lock()
            .map_or(SinkState::Destroyed, |state| *state)
    }

    fn subscribe(&self) -> broadcast::Receiver<SinkEvent> {
        self.shared.events.subscribe()
    }
}

/// Factory for local audio device sinks.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalSinkFactory;

impl SinkFactory for LocalSinkFactory {
    fn create(&self) -> Result<Arc<dyn Sink>> {
        Ok(Arc::new(AudioSink::new()))
    }
}
