//! Stream controller modules.
//!
//! - `controller`: the [`Stream`] handle, its lifecycle state machine, and
//!   observer registration.
//! - `read_loop`: the per-session task that owns the connection, reads,
//!   parses, dispatches, and reconnects.
//! - `options`: tuning knobs and their defaults.
//! - `status`: lifecycle states and diagnostic events.

/// Stream handle and lifecycle.
pub mod controller;
/// Tuning knobs for streams.
pub mod options;
mod read_loop;
/// Lifecycle states and diagnostic events.
pub mod status;

pub use controller::{Stream, StreamError};
pub use options::{StreamDefaults, StreamOptions};
pub use status::{CloseReason, DisconnectCause, StreamEvent, StreamState};
