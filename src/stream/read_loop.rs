//! The per-session read loop.
//!
//! The loop task is the only owner of the live connection and its frame
//! buffer. Teardown happens by dropping the [`Connection`] value, so a
//! connection is released exactly once whether the loop is reconnecting,
//! failing, or shutting down after `close()`.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::connector::{ConnectError, Connector};
use crate::frame::{FrameReader, ResponseParser};
use crate::request::Request;
use crate::retry::retry_async;
use crate::stream::controller::{SessionGuard, Shared};
use crate::stream::options::StreamOptions;
use crate::stream::status::{CloseReason, DisconnectCause, StreamEvent};

struct Connection<Io, P> {
    io: Io,
    frames: FrameReader<P>,
    generation: u64,
    last_activity: Instant,
}

enum ReadOutcome {
    Bytes(usize),
    Woken,
    Cancelled,
    Lost(DisconnectCause),
    Fatal(io::Error),
}

enum LoopExit {
    Closed,
    ReconnectFailed(ConnectError),
    Fatal(io::Error),
}

pub(crate) struct ReadLoop<P: ResponseParser, C> {
    pub(crate) shared: Arc<Shared<P::Response>>,
    pub(crate) connector: Arc<C>,
    pub(crate) request: Arc<Request>,
    pub(crate) parser: P,
    pub(crate) options: StreamOptions,
    pub(crate) session: u64,
    pub(crate) cancel: CancellationToken,
}

impl<P, C> ReadLoop<P, C>
where
    P: ResponseParser + Clone + Send + Sync + 'static,
    P::Response: Send + 'static,
    C: Connector,
{
    pub(crate) async fn run(self, io: C::Io, guard: SessionGuard<P::Response>) {
        let reason = match self.drive(io).await {
            LoopExit::Closed => {
                info!(event = "stream_closed", session = self.session);
                CloseReason::Requested
            }
            LoopExit::ReconnectFailed(err) => {
                error!(event = "stream_reconnect_failed", session = self.session, error = %err);
                CloseReason::ReconnectFailed(err.to_string())
            }
            LoopExit::Fatal(err) => {
                error!(event = "stream_fatal_io", session = self.session, error = %err);
                CloseReason::Fatal(err.to_string())
            }
        };

        drop(guard);
        self.shared.emit(StreamEvent::Closed {
            session: self.session,
            reason,
        });
    }

    async fn drive(&self, io: C::Io) -> LoopExit {
        let mut connection = self.connection(io, 1);
        let mut scratch = vec![0u8; self.options.read_buffer_size.max(1)];

        loop {
            if self.shared.reconnect_requested.swap(false, Ordering::AcqRel) {
                connection = match self.reconnect(connection, DisconnectCause::Requested).await {
                    Ok(next) => next,
                    Err(exit) => return exit,
                };
                continue;
            }

            let cause = match self.read(&mut connection, &mut scratch).await {
                ReadOutcome::Bytes(read) => match self.deliver(&mut connection, &scratch[..read]) {
                    Ok(()) => continue,
                    Err(cause) => cause,
                },
                ReadOutcome::Woken => continue,
                ReadOutcome::Cancelled => return LoopExit::Closed,
                ReadOutcome::Lost(cause) => cause,
                ReadOutcome::Fatal(err) => return LoopExit::Fatal(err),
            };

            connection = match self.reconnect(connection, cause).await {
                Ok(next) => next,
                Err(exit) => return exit,
            };
        }
    }

    fn connection(&self, io: C::Io, generation: u64) -> Connection<C::Io, P> {
        Connection {
            io,
            frames: FrameReader::with_limit(self.parser.clone(), self.options.max_frame_bytes),
            generation,
            last_activity: Instant::now(),
        }
    }

    async fn read(&self, connection: &mut Connection<C::Io, P>, scratch: &mut [u8]) -> ReadOutcome {
        let idle_deadline = self
            .options
            .idle_timeout
            .and_then(|timeout| connection.last_activity.checked_add(timeout));

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => ReadOutcome::Cancelled,
            _ = self.shared.wake.notified() => ReadOutcome::Woken,
            _ = idle_expired(idle_deadline) => ReadOutcome::Lost(DisconnectCause::IdleTimeout),
            result = connection.io.read(scratch) => match result {
                Ok(0) => ReadOutcome::Lost(DisconnectCause::RemoteClosed),
                Ok(read) => {
                    connection.last_activity = Instant::now();
                    ReadOutcome::Bytes(read)
                }
                Err(err) if is_transient(&err) => {
                    ReadOutcome::Lost(DisconnectCause::Transient(err.to_string()))
                }
                Err(err) => ReadOutcome::Fatal(err),
            },
        }
    }

    /// Parses `bytes` and dispatches every completed response in order.
    fn deliver(
        &self,
        connection: &mut Connection<C::Io, P>,
        bytes: &[u8],
    ) -> Result<(), DisconnectCause> {
        let generation = connection.generation;
        for frame in connection.frames.feed(bytes) {
            match frame {
                Ok(response) => self.dispatch(&response),
                Err(err) if err.is_recoverable() => {
                    warn!(
                        event = "frame_parse_failed",
                        session = self.session,
                        generation,
                        discarded = err.discard(),
                        error = %err
                    );
                    self.shared.emit(StreamEvent::ParseFailed {
                        session: self.session,
                        generation,
                        reason: err.reason().to_string(),
                    });
                }
                Err(err) => return Err(DisconnectCause::Framing(err.reason().to_string())),
            }
        }
        Ok(())
    }

    fn dispatch(&self, response: &P::Response) {
        let started = std::time::Instant::now();
        let report = self.shared.observers.dispatch(response);
        let elapsed = started.elapsed();
        if elapsed > self.options.slow_dispatch {
            warn!(
                event = "slow_dispatch",
                session = self.session,
                elapsed_ms = saturating_millis(elapsed),
                notified = report.notified
            );
        }
        for (observer, error) in report.failures {
            self.shared
                .emit(StreamEvent::ObserverFailed { observer, error });
        }
    }

    /// Drops `previous` and connects again under the reconnect policy.
    async fn reconnect(
        &self,
        previous: Connection<C::Io, P>,
        cause: DisconnectCause,
    ) -> Result<Connection<C::Io, P>, LoopExit> {
        let generation = previous.generation;
        drop(previous);

        self.shared.reconnecting.store(true, Ordering::Release);
        warn!(
            event = "stream_disconnected",
            session = self.session,
            generation,
            cause = %cause
        );
        self.shared.emit(StreamEvent::Disconnected {
            session: self.session,
            generation,
            cause,
        });

        let session = self.session;
        let connector = &*self.connector;
        let request = &*self.request;
        let attempts = retry_async(
            &self.options.reconnect,
            move |attempt| {
                info!(event = "reconnect_attempt", session, attempt);
                connector.connect(request)
            },
            |err: &ConnectError| {
                warn!(event = "reconnect_attempt_failed", session, error = %err);
                err.is_retryable()
            },
        );

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = attempts => Some(result),
        };
        self.shared.reconnecting.store(false, Ordering::Release);

        match result {
            None => Err(LoopExit::Closed),
            Some(Err(err)) => Err(LoopExit::ReconnectFailed(err)),
            Some(Ok(io)) => {
                self.shared.reconnect_requested.store(false, Ordering::Release);
                let generation = generation + 1;
                info!(event = "stream_connected", session = self.session, generation);
                self.shared.emit(StreamEvent::Connected {
                    session: self.session,
                    generation,
                });
                Ok(self.connection(io, generation))
            }
        }
    }
}

async fn idle_expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::time::Duration;

    use super::{is_transient, saturating_millis};

    #[test]
    fn dispatch_millis_saturate_instead_of_wrapping() {
        assert_eq!(saturating_millis(Duration::from_millis(1_500)), 1_500);
        assert_eq!(saturating_millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn resets_and_timeouts_are_transient() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::UnexpectedEof,
            io::ErrorKind::TimedOut,
        ] {
            assert!(is_transient(&io::Error::from(kind)), "{kind:?}");
        }
    }

    #[test]
    fn permission_and_data_errors_are_fatal() {
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::InvalidData)));
    }
}
