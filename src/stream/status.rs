use std::fmt;

use crate::observer::{ObserverError, ObserverId};

/// Externally visible lifecycle state of a [`Stream`](crate::stream::Stream).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamState {
    Idle,
    Connecting,
    Open,
    /// Open, with the read loop replacing its connection.
    Reconnecting,
    Closing,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Idle => "idle",
            StreamState::Connecting => "connecting",
            StreamState::Open => "open",
            StreamState::Reconnecting => "reconnecting",
            StreamState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Why the read loop dropped a connection and went looking for another.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DisconnectCause {
    /// `request_reconnect` was called.
    Requested,
    /// The remote end closed the connection.
    RemoteClosed,
    /// No bytes arrived within the idle timeout.
    IdleTimeout,
    /// A transient I/O error interrupted the read.
    Transient(String),
    /// Framing could not be resynchronised on this connection.
    Framing(String),
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectCause::Requested => f.write_str("reconnect requested"),
            DisconnectCause::RemoteClosed => f.write_str("remote closed the connection"),
            DisconnectCause::IdleTimeout => f.write_str("idle timeout"),
            DisconnectCause::Transient(err) => write!(f, "transient io error: {err}"),
            DisconnectCause::Framing(err) => write!(f, "framing lost: {err}"),
        }
    }
}

/// Why the read loop stopped for good.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CloseReason {
    /// `close()` was called or the stream was dropped.
    Requested,
    /// The reconnect policy gave up or hit a non-retryable connect error.
    ReconnectFailed(String),
    /// An unrecoverable I/O error.
    Fatal(String),
}

/// Out-of-band diagnostics published by a stream.
///
/// Events are broadcast; a receiver that falls behind loses the oldest ones.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StreamEvent {
    /// A connection is live. `generation` is 1 for the connection made by
    /// `open()` and increases with every reconnect.
    Connected { session: u64, generation: u64 },
    /// The connection of `generation` was torn down.
    Disconnected {
        session: u64,
        generation: u64,
        cause: DisconnectCause,
    },
    /// A malformed frame was skipped.
    ParseFailed {
        session: u64,
        generation: u64,
        reason: String,
    },
    /// An observer failed while handling a response.
    ObserverFailed {
        observer: ObserverId,
        error: ObserverError,
    },
    /// The read loop ended and the stream is idle again.
    Closed { session: u64, reason: CloseReason },
}
