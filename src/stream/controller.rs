//! Stream lifecycle: open, close, reconnect requests, and observer registration.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::JsonLines;
use crate::connector::{ConnectError, Connector, NetConnector};
use crate::frame::ResponseParser;
use crate::observer::{always, FnObserver, Observer, ObserverRegistry};
use crate::request::Request;
use crate::stream::options::StreamOptions;
use crate::stream::read_loop::ReadLoop;
use crate::stream::status::{StreamEvent, StreamState};

/// Errors returned by [`Stream::open`].
#[derive(Debug, Error)]
pub enum StreamError {
    /// `open()` is only valid while the stream is idle.
    #[error("stream is already {state}")]
    AlreadyOpen { state: StreamState },

    /// The initial connect failed. The stream is idle again.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// `close()` was called before the initial connect finished.
    #[error("stream closed while connecting")]
    Closed,
}

#[derive(Clone)]
pub(crate) struct Session {
    pub(crate) id: u64,
    pub(crate) cancel: CancellationToken,
    done: CancellationToken,
}

enum Lifecycle {
    Idle,
    Connecting(Session),
    Open(Session),
    Closing(Session),
}

impl Lifecycle {
    fn session(&self) -> Option<&Session> {
        match self {
            Lifecycle::Idle => None,
            Lifecycle::Connecting(session)
            | Lifecycle::Open(session)
            | Lifecycle::Closing(session) => Some(session),
        }
    }
}

/// State shared between the stream handle and its read loop.
pub(crate) struct Shared<R> {
    lifecycle: Mutex<Lifecycle>,
    pub(crate) observers: ObserverRegistry<R>,
    pub(crate) reconnect_requested: AtomicBool,
    pub(crate) wake: Notify,
    pub(crate) reconnecting: AtomicBool,
    events: broadcast::Sender<StreamEvent>,
    next_session: AtomicU64,
}

impl<R> Shared<R> {
    fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            lifecycle: Mutex::new(Lifecycle::Idle),
            observers: ObserverRegistry::new(),
            reconnect_requested: AtomicBool::new(false),
            wake: Notify::new(),
            reconnecting: AtomicBool::new(false),
            events,
            next_session: AtomicU64::new(1),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn emit(&self, event: StreamEvent) {
        let _ = self.events.send(event);
    }

    /// Returns the stream to `Idle` if `session` is still the current one.
    fn finish(&self, session: u64) {
        let mut lifecycle = self.lifecycle();
        if lifecycle.session().is_some_and(|current| current.id == session) {
            *lifecycle = Lifecycle::Idle;
            self.reconnecting.store(false, Ordering::Release);
        }
    }
}

/// Owned by whoever currently drives a session: `open()` while connecting,
/// then the read loop. Dropping it returns the stream to `Idle` and releases
/// every `close()` waiting on the session.
pub(crate) struct SessionGuard<R> {
    shared: Arc<Shared<R>>,
    id: u64,
    done: CancellationToken,
}

impl<R> Drop for SessionGuard<R> {
    fn drop(&mut self) {
        self.shared.finish(self.id);
        self.done.cancel();
    }
}

/// A long-lived, reconnecting stream.
///
/// Construction performs no I/O. [`Stream::open`] connects and starts a read
/// loop on the current tokio runtime; every response parsed by `P` is handed
/// to the registered observers in parse order. Once open, the stream heals
/// itself across transient failures until [`Stream::close`] is called or a
/// fatal error ends the loop.
pub struct Stream<P: ResponseParser = JsonLines, C = NetConnector> {
    request: Arc<Request>,
    parser: P,
    connector: Arc<C>,
    options: StreamOptions,
    shared: Arc<Shared<P::Response>>,
}

impl Stream {
    /// Creates a newline-delimited JSON stream over TCP/TLS.
    pub fn new(request: Request) -> Self {
        Self::with_parts(request, JsonLines::new(), NetConnector::new())
    }
}

impl<P, C> Stream<P, C>
where
    P: ResponseParser + Clone + Send + Sync + 'static,
    P::Response: Send + 'static,
    C: Connector,
{
    /// Creates a stream with a custom parser and connector and default options.
    pub fn with_parts(request: Request, parser: P, connector: C) -> Self {
        Self::with_options(request, parser, connector, StreamOptions::default())
    }

    /// Creates a stream with every part supplied by the caller.
    pub fn with_options(request: Request, parser: P, connector: C, options: StreamOptions) -> Self {
        Self {
            shared: Arc::new(Shared::new(options.event_capacity)),
            request: Arc::new(request),
            parser,
            connector: Arc::new(connector),
            options,
        }
    }

    /// The request every connect is made with.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Options the read loop runs with.
    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    /// Registers a callback invoked for every response.
    pub fn register_function<F>(&self, callback: F)
    where
        F: Fn(&P::Response) + Send + Sync + 'static,
    {
        self.register_observer(FnObserver::new(callback, always::<P::Response>));
    }

    /// Registers a callback invoked for responses accepted by `predicate`.
    pub fn register_function_if<F, Q>(&self, callback: F, predicate: Q)
    where
        F: Fn(&P::Response) + Send + Sync + 'static,
        Q: Fn(&P::Response) -> bool + Send + Sync + 'static,
    {
        self.register_observer(FnObserver::new(callback, predicate));
    }

    /// Registers an observer. Allowed in any state; never waits on the read loop.
    pub fn register_observer<O>(&self, observer: O)
    where
        O: Observer<P::Response> + 'static,
    {
        let id = self.shared.observers.register(observer);
        debug!(event = "observer_registered", observer = %id);
    }

    /// Current lifecycle state. `Reconnecting` is reported while an open
    /// stream is replacing its connection.
    pub fn state(&self) -> StreamState {
        match &*self.shared.lifecycle() {
            Lifecycle::Idle => StreamState::Idle,
            Lifecycle::Connecting(_) => StreamState::Connecting,
            Lifecycle::Open(_) if self.shared.reconnecting.load(Ordering::Acquire) => {
                StreamState::Reconnecting
            }
            Lifecycle::Open(_) => StreamState::Open,
            Lifecycle::Closing(_) => StreamState::Closing,
        }
    }

    /// Whether a read loop is running, connected or reconnecting.
    pub fn is_open(&self) -> bool {
        matches!(self.state(), StreamState::Open | StreamState::Reconnecting)
    }

    /// Subscribes to connection diagnostics.
    pub fn events(&self) -> broadcast::Receiver<StreamEvent> {
        self.shared.events.subscribe()
    }

    /// Connects and starts the read loop.
    ///
    /// Only valid from `Idle`. The connector runs exactly once: a failure is
    /// returned to the caller and leaves the stream idle.
    pub async fn open(&self) -> Result<(), StreamError> {
        let session = {
            let mut lifecycle = self.shared.lifecycle();
            if lifecycle.session().is_some() {
                drop(lifecycle);
                let state = self.state();
                warn!(event = "stream_open_rejected", state = %state);
                return Err(StreamError::AlreadyOpen { state });
            }
            let session = Session {
                id: self.shared.next_session.fetch_add(1, Ordering::Relaxed),
                cancel: CancellationToken::new(),
                done: CancellationToken::new(),
            };
            *lifecycle = Lifecycle::Connecting(session.clone());
            session
        };
        let guard = SessionGuard {
            shared: Arc::clone(&self.shared),
            id: session.id,
            done: session.done.clone(),
        };
        self.shared.reconnect_requested.store(false, Ordering::Release);
        info!(
            event = "stream_connecting",
            session = session.id,
            endpoint = %self.request.endpoint()
        );

        let connected = tokio::select! {
            biased;
            _ = session.cancel.cancelled() => None,
            result = self.connector.connect(&self.request) => Some(result),
        };
        let io = match connected {
            Some(Ok(io)) => io,
            Some(Err(err)) => {
                warn!(event = "stream_connect_failed", session = session.id, error = %err);
                return Err(StreamError::Connect(err));
            }
            None => return Err(StreamError::Closed),
        };

        {
            let mut lifecycle = self.shared.lifecycle();
            let still_connecting = matches!(
                &*lifecycle,
                Lifecycle::Connecting(current) if current.id == session.id
            );
            if !still_connecting {
                drop(lifecycle);
                drop(io);
                return Err(StreamError::Closed);
            }
            *lifecycle = Lifecycle::Open(session.clone());
        }

        info!(event = "stream_connected", session = session.id, generation = 1u64);
        self.shared.emit(StreamEvent::Connected {
            session: session.id,
            generation: 1,
        });

        let read_loop = ReadLoop {
            shared: Arc::clone(&self.shared),
            connector: Arc::clone(&self.connector),
            request: Arc::clone(&self.request),
            parser: self.parser.clone(),
            options: self.options.clone(),
            session: session.id,
            cancel: session.cancel.clone(),
        };
        tokio::spawn(read_loop.run(io, guard));
        Ok(())
    }

    /// Stops the read loop and releases the connection.
    ///
    /// Returns once the stream is idle. Calling it on an idle stream is a no-op;
    /// concurrent calls all wait for the same shutdown.
    pub async fn close(&self) {
        let done = {
            let mut lifecycle = self.shared.lifecycle();
            let Some(session) = lifecycle.session().cloned() else {
                return;
            };
            session.cancel.cancel();
            let done = session.done.clone();
            info!(event = "stream_closing", session = session.id);
            *lifecycle = Lifecycle::Closing(session);
            done
        };
        done.cancelled().await;
    }

    /// Asks the read loop to replace its connection.
    ///
    /// The loop checks the request before its next read and wakes up from a
    /// pending read to do so. Requests made while a reconnect is already
    /// running are satisfied by that reconnect.
    pub fn request_reconnect(&self) {
        self.shared.reconnect_requested.store(true, Ordering::Release);
        self.shared.wake.notify_one();
    }
}

impl<P: ResponseParser, C> Drop for Stream<P, C> {
    fn drop(&mut self) {
        if let Some(session) = self.shared.lifecycle().session() {
            session.cancel.cancel();
        }
    }
}
