use std::time::Duration;

use crate::frame::DEFAULT_MAX_FRAME_BYTES;
use crate::retry::RetryPolicy;

/// Default values used by [`StreamOptions::default`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamDefaults;

impl StreamDefaults {
    pub const READ_BUFFER_SIZE: usize = 8 * 1024;
    pub const MAX_FRAME_BYTES: usize = DEFAULT_MAX_FRAME_BYTES;
    pub const IDLE_TIMEOUT: Duration = Duration::from_secs(90);
    pub const SLOW_DISPATCH: Duration = Duration::from_millis(250);
    pub const EVENT_CAPACITY: usize = 64;
}

/// Tuning knobs for a [`Stream`](crate::stream::Stream).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamOptions {
    /// Bytes requested from the connection per read.
    pub read_buffer_size: usize,
    /// Largest frame payload the reader will buffer, on top of the parser's
    /// framing overhead.
    pub max_frame_bytes: usize,
    /// Reconnect when no bytes arrive for this long. `None` disables the timer.
    pub idle_timeout: Option<Duration>,
    /// Backoff and attempt limit for reconnects after the stream is open.
    pub reconnect: RetryPolicy,
    /// Dispatches slower than this are logged.
    pub slow_dispatch: Duration,
    /// Capacity of the diagnostics broadcast channel.
    pub event_capacity: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            read_buffer_size: StreamDefaults::READ_BUFFER_SIZE,
            max_frame_bytes: StreamDefaults::MAX_FRAME_BYTES,
            idle_timeout: Some(StreamDefaults::IDLE_TIMEOUT),
            reconnect: RetryPolicy::persistent(),
            slow_dispatch: StreamDefaults::SLOW_DISPATCH,
            event_capacity: StreamDefaults::EVENT_CAPACITY,
        }
    }
}

impl StreamOptions {
    /// Sets or disables the idle timer.
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Replaces the reconnect policy.
    pub fn with_reconnect(mut self, policy: RetryPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Sets the per-read buffer size.
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Sets the largest frame payload the reader will buffer.
    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{StreamDefaults, StreamOptions};
    use crate::retry::RetryPolicy;

    #[test]
    fn defaults_keep_reconnecting_forever() {
        let options = StreamOptions::default();
        assert_eq!(options.reconnect.max_attempts, usize::MAX);
        assert_eq!(options.idle_timeout, Some(StreamDefaults::IDLE_TIMEOUT));
    }

    #[test]
    fn builders_override_fields() {
        let options = StreamOptions::default()
            .with_idle_timeout(None)
            .with_reconnect(RetryPolicy::bounded(3))
            .with_read_buffer_size(16)
            .with_max_frame_bytes(64);
        assert_eq!(options.idle_timeout, None);
        assert_eq!(options.reconnect.max_attempts, 3);
        assert_eq!(options.read_buffer_size, 16);
        assert_eq!(options.max_frame_bytes, 64);
        assert_eq!(options.slow_dispatch, Duration::from_millis(250));
    }
}
