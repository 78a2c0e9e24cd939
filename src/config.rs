//! Tunables for the store, repositories, and dispatcher.

use std::time::Duration;

/// Configuration consumed by the core components.
///
/// All fields have sensible defaults accessible via [`StoreConfig::default()`];
/// override individual knobs with struct-update syntax.
///
/// # Examples
///
/// ```
/// use streamstore_es::StoreConfig;
///
/// let config = StoreConfig {
///     parallelism: 8,
///     ..StoreConfig::default()
/// };
/// assert_eq!(config.parallelism, 8);
/// assert_eq!(config.read_page_size, 200);
/// ```
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Number of dispatcher worker tasks.
    ///
    /// Default: 4.
    pub parallelism: usize,

    /// Maximum queued plus in-flight events before
    /// [`Dispatcher::dispatch`](crate::dispatch::Dispatcher::dispatch)
    /// rejects submissions with a queue-overflow error.
    ///
    /// Default: 1024.
    pub max_processing_queue_size: usize,

    /// Retry budget for both handler-level retries and the outer
    /// event-level retry. `-1` means unlimited.
    ///
    /// Default: 5.
    pub max_retries: i32,

    /// Processing attempts slower than this flag the event type for verbose
    /// logging until one completes quickly again.
    ///
    /// Default: 500 ms.
    pub slow_alert_threshold: Duration,

    /// When `true`, exhausting the retry budget tears the dispatcher down
    /// instead of dropping the event and continuing.
    ///
    /// Default: `false`.
    pub event_drop_is_fatal: bool,

    /// When `true`, all handlers for one event run concurrently; otherwise
    /// they run sequentially in registration order.
    ///
    /// Default: `true`.
    pub parallel_handlers: bool,

    /// Page size for forward/backward stream reads.
    ///
    /// Default: 200.
    pub read_page_size: usize,

    /// When `true`, loaded streams are kept in the process-wide
    /// [`StreamCache`](crate::cache::StreamCache) and served from it until
    /// evicted by a write.
    ///
    /// Default: `false`.
    pub cache_entities: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            max_processing_queue_size: 1024,
            max_retries: 5,
            slow_alert_threshold: Duration::from_millis(500),
            event_drop_is_fatal: false,
            parallel_handlers: true,
            read_page_size: 200,
            cache_entities: false,
        }
    }
}

/// Reconnection and pacing tunables for the subscription feed loop.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use streamstore_es::FeedConfig;
///
/// let config = FeedConfig {
///     reconnect_base_delay: Duration::from_millis(250),
///     ..FeedConfig::default()
/// };
/// assert_eq!(config.reconnect_base_delay, Duration::from_millis(250));
/// assert_eq!(config.reconnect_max_delay, Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Base delay for exponential backoff on subscription reconnection.
    ///
    /// After a stream error, the loop waits `reconnect_base_delay`, then
    /// twice that, doubling up to [`reconnect_max_delay`](FeedConfig::reconnect_max_delay).
    /// A successful catch-up resets the backoff.
    ///
    /// Default: 1 second.
    pub reconnect_base_delay: Duration,

    /// Maximum delay between reconnection attempts.
    ///
    /// Default: 30 seconds.
    pub reconnect_max_delay: Duration,

    /// How long to wait before re-offering an event that was rejected by the
    /// dispatcher with a queue overflow. This is the feed's reaction to
    /// backpressure: stop reading until the queue drains.
    ///
    /// Default: 100 ms.
    pub overflow_retry_delay: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            overflow_retry_delay: Duration::from_millis(100),
        }
    }
}
