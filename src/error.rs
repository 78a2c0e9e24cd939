//! Crate-level error types, one enum per layer.
//!
//! The split mirrors how failures propagate: [`StoreError`] from the log
//! client, [`CommitError`] from a stream commit, [`RepositoryError`] /
//! [`WorkError`] from batched commits, and [`HandlerError`] /
//! [`DispatchError`] on the dispatch path. Stream- and repository-level
//! errors bubble unchanged to the unit of work; only the dispatcher decides
//! between "retry the whole event" and "give up".

/// Error returned by an [`EventLog`](crate::client::EventLog) operation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The conditional append lost an optimistic-concurrency race.
    ///
    /// Another writer appended to the stream since it was read. The caller
    /// must reload and reapply; blind retry would stamp stale versions.
    #[error("version conflict on stream '{stream}': expected version {expected}")]
    VersionConflict {
        /// The stream the append targeted.
        stream: String,
        /// The expected version sent with the append (-1 = no stream).
        expected: i64,
    },

    /// Transport-level failure reaching the store. Possibly transient.
    #[error("event store connection error: {0}")]
    Connection(String),

    /// The store did not answer within the deadline. Possibly transient.
    #[error("event store operation timed out")]
    Timeout,

    /// A recorded event could not be decoded during hydration.
    ///
    /// Raised when an event's descriptor bytes are not valid JSON, which
    /// means the stream was written by something other than this crate.
    #[error("undecodable event on stream '{stream}': {detail}")]
    Corrupt {
        /// The stream the event was read from.
        stream: String,
        /// What failed to parse.
        detail: String,
    },
}

/// Error returned by [`EventStream::commit`](crate::stream::EventStream).
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    /// Optimistic-concurrency loss: another writer won the race.
    ///
    /// The staged events have been discarded; the in-memory state is stale.
    /// This layer never retries -- the dispatcher reprocesses the whole
    /// event with a fresh hydration.
    #[error("conflicting commit on stream '{stream}'")]
    Conflict {
        /// The stream whose append was rejected.
        stream: String,
    },

    /// Store connectivity or timeout failure. Staged events are retained;
    /// the caller may treat this as retryable.
    #[error(transparent)]
    Persistence(#[from] StoreError),
}

/// Error returned by [`Repository::commit`](crate::repository::Repository)
/// when one or more stream commits fail.
///
/// Commits are per-stream and best-effort: some streams may already be
/// durable when a later one fails. Every outcome is enumerated so the caller
/// can see exactly what landed.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// At least one stream commit failed.
    #[error("{} of {} stream commits failed (first: {})",
        failures.len(),
        failures.len() + succeeded.len(),
        failures.first().map(|(s, e)| format!("'{s}': {e}")).unwrap_or_default())]
    CommitFailed {
        /// Streams whose commits completed before (or despite) the failure.
        succeeded: Vec<String>,
        /// Each failed stream with its commit error.
        failures: Vec<(String, CommitError)>,
    },
}

/// Error returned by [`UnitOfWork::end`](crate::uow::UnitOfWork) when the
/// final commit fails.
#[derive(Debug, thiserror::Error)]
pub enum WorkError {
    /// A repository's batched stream commit failed.
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// Flushing pending snapshots failed. Events are already durable;
    /// the snapshots will simply be retaken later.
    #[error("snapshot flush failed: {0}")]
    Snapshots(#[from] StoreError),
}

/// Error returned from an [`EventHandler`](crate::dispatch::EventHandler).
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The handler asks to be re-invoked for this event.
    ///
    /// Retried up to the configured maximum with no delay between attempts,
    /// distinct from the outer event-level retry which backs off.
    #[error("handler requested retry: {0}")]
    Retry(String),

    /// Any other handler failure. Triggers the outer event-level retry.
    #[error("{0}")]
    Other(String),
}

/// Error returned by [`Dispatcher::dispatch`](crate::dispatch::Dispatcher).
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The processing queue is full. Explicit backpressure: the submitter
    /// should pause its source until the queue drains, not block or spin.
    #[error("processing queue overflow ({depth}/{max})")]
    QueueOverflow {
        /// Queued plus in-flight events at the time of rejection.
        depth: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The dispatcher was torn down after a fatal event drop.
    #[error("dispatcher canceled after fatal event drop")]
    Canceled,
}
