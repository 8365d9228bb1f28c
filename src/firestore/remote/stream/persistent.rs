use std::sync::Arc;
use std::time::Duration;

use async_channel::{Receiver, Sender, TrySendError};

use crate::firestore::core::{DelayedOperation, TimerId};
use crate::firestore::error::{unavailable, unknown, FirestoreError, FirestoreErrorCode};
use crate::firestore::remote::datastore::{
    ClientMessage, Connection, StreamCredentials, StreamHandle, StreamKind, TokenProviderArc,
};
use crate::firestore::remote::scheduler::{RemoteStoreEvent, SchedulerArc};
use crate::platform::runtime;
use crate::util::{hard_assert, BackoffSettings, ExponentialBackoff};

/// Lifecycle of a persistent stream.
///
/// ```text
/// Initial -> Starting -> Open -> Healthy
///    ^          |          |        |
///    |          +----------+--------+--> Error -> Backoff -> Initial
///    +-------------- stop / idle ------+
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Initial,
    /// Fetching tokens and opening the underlying stream.
    Starting,
    Open,
    /// Stayed open long enough that a later failure is not blamed on the
    /// credentials.
    Healthy,
    Error,
    Backoff,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StreamSettings {
    pub backoff: BackoffSettings,
    pub idle_timeout: Duration,
    pub healthy_timeout: Duration,
    pub send_buffer: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffSettings::default(),
            idle_timeout: Duration::from_secs(60),
            healthy_timeout: Duration::from_secs(10),
            send_buffer: 256,
        }
    }
}

/// Shared collaborators every stream needs to (re)connect.
#[derive(Clone)]
pub struct StreamEnvironment {
    pub connection: Arc<dyn Connection>,
    pub auth: TokenProviderArc,
    pub app_check: TokenProviderArc,
    pub scheduler: SchedulerArc,
    pub settings: StreamSettings,
}

/// Connection state machine shared by the listen and write streams.
///
/// All methods run on the async queue. Network work happens on spawned tasks
/// that report back through the scheduler, tagged with the generation that
/// was current when they were spawned. Every start and close bumps the
/// generation, which makes events from abandoned connections stale.
pub struct PersistentStream {
    kind: StreamKind,
    state: StreamState,
    generation: u64,
    backoff: ExponentialBackoff,
    outbound: Option<Sender<ClientMessage>>,
    idle_timer: Option<DelayedOperation>,
    health_timer: Option<DelayedOperation>,
    backoff_timer: Option<DelayedOperation>,
}

impl PersistentStream {
    pub fn new(kind: StreamKind, settings: &StreamSettings) -> Self {
        Self {
            kind,
            state: StreamState::Initial,
            generation: 0,
            backoff: ExponentialBackoff::new(settings.backoff),
            outbound: None,
            idle_timer: None,
            health_timer: None,
            backoff_timer: None,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    /// Starting, backing off or open.
    pub fn is_started(&self) -> bool {
        matches!(self.state, StreamState::Starting | StreamState::Backoff) || self.is_open()
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::Healthy)
    }

    /// Connects, or schedules a reconnect when the last attempt failed.
    pub fn start(&mut self, env: &StreamEnvironment) {
        if self.state == StreamState::Error {
            self.perform_backoff(env);
            return;
        }
        hard_assert(self.state == StreamState::Initial, "stream already started");
        self.state = StreamState::Starting;
        self.generation += 1;

        let kind = self.kind;
        let generation = self.generation;
        let connection = Arc::clone(&env.connection);
        let auth = Arc::clone(&env.auth);
        let app_check = Arc::clone(&env.app_check);
        let scheduler = Arc::clone(&env.scheduler);
        runtime::spawn_detached(async move {
            let credentials = async {
                Ok::<_, FirestoreError>(StreamCredentials {
                    auth_token: auth.get_token().await?,
                    app_check_token: app_check.get_token().await?,
                })
            };
            let event = match credentials.await {
                Err(err) => RemoteStoreEvent::StreamClosed {
                    kind,
                    generation,
                    error: unknown(format!("Fetching auth token failed: {}", err.message())),
                },
                Ok(credentials) => match connection.open_stream(kind, credentials).await {
                    Ok(handle) => RemoteStoreEvent::StreamOpened {
                        kind,
                        generation,
                        handle,
                    },
                    Err(error) => RemoteStoreEvent::StreamClosed {
                        kind,
                        generation,
                        error,
                    },
                },
            };
            scheduler.deliver(event);
        });
    }

    /// The connection attempt for the current generation succeeded.
    pub fn on_opened(&mut self, env: &StreamEnvironment, handle: Arc<dyn StreamHandle>) {
        hard_assert(self.state == StreamState::Starting, "stream opened while not starting");
        log::debug!("{} stream opened", self.kind);
        self.state = StreamState::Open;

        let (sender, receiver) = async_channel::bounded(env.settings.send_buffer.max(1));
        self.outbound = Some(sender);
        runtime::spawn_detached(run_writer(
            Arc::clone(&handle),
            receiver,
            Arc::clone(&env.scheduler),
            self.kind,
            self.generation,
        ));
        runtime::spawn_detached(run_reader(
            handle,
            Arc::clone(&env.scheduler),
            self.kind,
            self.generation,
        ));

        self.health_timer = Some(env.scheduler.deliver_after(
            TimerId::HealthCheckTimeout,
            env.settings.healthy_timeout,
            RemoteStoreEvent::HealthCheck {
                kind: self.kind,
                generation: self.generation,
            },
        ));
    }

    pub fn on_health_check(&mut self) {
        self.health_timer = None;
        if self.is_open() {
            self.state = StreamState::Healthy;
        }
    }

    /// A message arrived, so reconnects may start from the initial delay
    /// again.
    pub fn reset_backoff(&mut self) {
        self.backoff.reset();
    }

    /// Queues `message` for the writer task.
    pub fn send(&mut self, env: &StreamEnvironment, message: ClientMessage) {
        self.cancel_idle_timer();
        let Some(outbound) = &self.outbound else {
            log::debug!("dropping message for {} stream that is not open", self.kind);
            return;
        };
        if let Err(err) = outbound.try_send(message) {
            let reason = match err {
                TrySendError::Full(_) => "send buffer is full",
                TrySendError::Closed(_) => "writer stopped",
            };
            log::warn!("{} stream {reason}; reconnecting", self.kind);
            env.scheduler.deliver(RemoteStoreEvent::StreamClosed {
                kind: self.kind,
                generation: self.generation,
                error: unavailable(format!("The {} stream {reason}", self.kind)),
            });
        }
    }

    /// Closes the stream after the idle timeout unless something is sent
    /// first.
    pub fn mark_idle(&mut self, env: &StreamEnvironment) {
        if !self.is_open() || self.idle_timer.is_some() {
            return;
        }
        let timer_id = match self.kind {
            StreamKind::Listen => TimerId::ListenStreamIdle,
            StreamKind::Write => TimerId::WriteStreamIdle,
        };
        self.idle_timer = Some(env.scheduler.deliver_after(
            timer_id,
            env.settings.idle_timeout,
            RemoteStoreEvent::IdleTimeout {
                kind: self.kind,
                generation: self.generation,
            },
        ));
    }

    /// Returns whether the idle close happened.
    pub fn on_idle_timeout(&mut self, env: &StreamEnvironment) -> bool {
        self.idle_timer = None;
        if !self.is_open() {
            return false;
        }
        log::debug!("closing idle {} stream", self.kind);
        self.close(StreamState::Initial, None, env);
        true
    }

    /// Closes the stream cleanly. The next start connects without backoff.
    pub fn stop(&mut self, env: &StreamEnvironment) {
        if self.is_started() {
            self.close(StreamState::Initial, None, env);
        }
    }

    /// After a permanent error the request itself was bad, so the next
    /// attempt should not be delayed.
    pub fn inhibit_backoff(&mut self) {
        hard_assert(!self.is_started(), "can only inhibit backoff on a stopped stream");
        self.state = StreamState::Initial;
        self.backoff.reset();
    }

    /// The underlying stream failed or was closed by the server.
    pub fn handle_stream_close(&mut self, error: &FirestoreError, env: &StreamEnvironment) {
        log::debug!("{} stream closed with error: {error}", self.kind);
        self.close(StreamState::Error, Some(error), env);
    }

    /// Returns whether a reconnect was started.
    pub fn on_backoff_elapsed(&mut self, env: &StreamEnvironment) -> bool {
        self.backoff_timer = None;
        if self.state != StreamState::Backoff {
            return false;
        }
        self.backoff.record_attempt();
        self.state = StreamState::Initial;
        self.start(env);
        true
    }

    fn perform_backoff(&mut self, env: &StreamEnvironment) {
        self.state = StreamState::Backoff;
        let delay = self.backoff.next_delay();
        let timer_id = match self.kind {
            StreamKind::Listen => TimerId::ListenStreamConnectionBackoff,
            StreamKind::Write => TimerId::WriteStreamConnectionBackoff,
        };
        log::debug!("backing off {} stream for {delay:?}", self.kind);
        self.backoff_timer = Some(env.scheduler.deliver_after(
            timer_id,
            delay,
            RemoteStoreEvent::BackoffElapsed {
                kind: self.kind,
                generation: self.generation,
            },
        ));
    }

    fn close(&mut self, final_state: StreamState, error: Option<&FirestoreError>, env: &StreamEnvironment) {
        hard_assert(
            final_state == StreamState::Error || error.is_none(),
            "only errored streams carry an error",
        );
        self.cancel_idle_timer();
        if let Some(timer) = self.health_timer.take() {
            timer.cancel();
        }
        if let Some(timer) = self.backoff_timer.take() {
            timer.cancel();
        }
        self.generation += 1;

        match error {
            None => self.backoff.reset(),
            Some(error) if error.code == FirestoreErrorCode::ResourceExhausted => {
                log::warn!("{} stream hit a resource limit: {error}", self.kind);
                self.backoff.reset_to_max();
            }
            Some(error)
                if error.code == FirestoreErrorCode::Unauthenticated
                    && self.state != StreamState::Healthy =>
            {
                // A stream that never became healthy most likely failed on a
                // stale token.
                env.auth.invalidate_token();
                env.app_check.invalidate_token();
            }
            Some(_) => {}
        }

        // Dropping the sender stops the writer, which closes the handle.
        self.outbound = None;
        self.state = final_state;
    }

    fn cancel_idle_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.cancel();
        }
    }
}

async fn run_writer(
    handle: Arc<dyn StreamHandle>,
    receiver: Receiver<ClientMessage>,
    scheduler: SchedulerArc,
    kind: StreamKind,
    generation: u64,
) {
    while let Ok(message) = receiver.recv().await {
        if let Err(error) = handle.send(message).await {
            scheduler.deliver(RemoteStoreEvent::StreamClosed {
                kind,
                generation,
                error,
            });
            break;
        }
    }
    if let Err(err) = handle.close().await {
        log::debug!("failed to close {kind} stream: {err}");
    }
}

async fn run_reader(
    handle: Arc<dyn StreamHandle>,
    scheduler: SchedulerArc,
    kind: StreamKind,
    generation: u64,
) {
    loop {
        match handle.next().await {
            Some(Ok(message)) => scheduler.deliver(RemoteStoreEvent::StreamMessage {
                kind,
                generation,
                message,
            }),
            Some(Err(error)) => {
                scheduler.deliver(RemoteStoreEvent::StreamClosed {
                    kind,
                    generation,
                    error,
                });
                break;
            }
            None => {
                scheduler.deliver(RemoteStoreEvent::StreamClosed {
                    kind,
                    generation,
                    error: unavailable(format!("The {kind} stream was closed by the server")),
                });
                break;
            }
        }
    }
}

/// Closes a handle that arrived for a connection attempt that was abandoned.
pub fn discard_stale_handle(handle: Arc<dyn StreamHandle>) {
    runtime::spawn_detached(async move {
        if let Err(err) = handle.close().await {
            log::debug!("failed to close stale stream: {err}");
        }
    });
}
