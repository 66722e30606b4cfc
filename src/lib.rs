//! Long-lived, reconnecting stream client.
//!
//! A [`Stream`] connects to a single endpoint, reads framed bytes off the
//! connection, parses them into responses, and fans every response out to
//! registered observers. Transient failures are healed by reconnecting in the
//! background; only the initial connect failure is reported to the caller.
//!
//! The crate is organized by concern:
//! - `request`: endpoint, transport, and authenticated handshake.
//! - `connector`: TCP/TLS establishment behind the [`Connector`] trait.
//! - `frame`: incremental framing via [`FrameReader`] and [`ResponseParser`].
//! - `codec`: ready-made parsers for JSON lines and length-prefixed frames.
//! - `observer`: the ordered, thread-safe observer registry.
//! - `stream`: the lifecycle state machine and read loop.
//! - `retry`: backoff and timeout helpers.

/// Newline-delimited JSON and length-prefixed parsers.
pub mod codec;
/// Connection establishment.
pub mod connector;
/// Frame buffering and the parser contract.
pub mod frame;
/// Observer registry and dispatch.
pub mod observer;
/// Endpoint and credentials.
pub mod request;
/// Retry and timeout helpers used by the connector and reconnect path.
pub mod retry;
/// Stream lifecycle and read loop.
pub mod stream;

pub use codec::{JsonLines, LengthDelimited};
pub use connector::{ConnectError, Connector, NetConnector, NetStream};
pub use frame::{FrameReader, ParseError, Parsed, ResponseParser};
pub use observer::{FnObserver, Observer, ObserverError, ObserverId, ObserverRegistry};
pub use request::{Request, Transport};
pub use retry::RetryPolicy;
pub use stream::{
    CloseReason, DisconnectCause, Stream, StreamError, StreamEvent, StreamOptions, StreamState,
};
