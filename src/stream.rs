//! In-memory representation of one logical event stream.
//!
//! An [`EventStream`] tracks the committed prefix of a remote stream plus
//! events staged during the current unit of work. Staging is pure in-memory;
//! [`EventStream::commit`] flushes staged events with a conditional append,
//! recursing into child streams (entities nested under an aggregate) first
//! so a parent is never durable while a child it depends on failed to
//! persist.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::cache::CachedStream;
use crate::error::{CommitError, StoreError};
use crate::event::{EventDescriptor, WritableEvent};
use crate::store::StoreClient;
use crate::uow::COMMIT_ID_HEADER;

/// An event stream shared between its repository, its hydrated root, and
/// (for entity streams) its parent's child list.
pub type SharedStream = Arc<Mutex<EventStream>>;

/// One logical stream: committed events, staged events, child streams, and
/// version counters.
///
/// Invariant: `stream_version() == max(committed_version, 0) + staged count`.
/// A committed version of `-1` means the stream does not exist remotely yet.
pub struct EventStream {
    store: Arc<StoreClient>,
    bucket: String,
    stream_id: String,
    stream_name: String,
    committed_version: i64,
    committed: Vec<WritableEvent>,
    uncommitted: Vec<WritableEvent>,
    children: Vec<SharedStream>,
    /// Stamp of the most recently staged event; the next `add` stamps
    /// `version + 1`.
    version: i64,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("stream_name", &self.stream_name)
            .field("committed_version", &self.committed_version)
            .field("uncommitted", &self.uncommitted.len())
            .field("children", &self.children.len())
            .finish()
    }
}

impl EventStream {
    /// Build a stream from a read (or a fresh one if `committed_version` is
    /// `-1` and `committed` is empty). Called by the store client.
    pub(crate) fn open(
        store: Arc<StoreClient>,
        bucket: &str,
        stream_id: &str,
        stream_name: String,
        committed_version: i64,
        committed: Vec<WritableEvent>,
    ) -> Self {
        Self {
            store,
            bucket: bucket.to_string(),
            stream_id: stream_id.to_string(),
            stream_name,
            committed_version,
            committed,
            uncommitted: Vec::new(),
            children: Vec::new(),
            version: committed_version.max(0),
        }
    }

    /// Namespace partition this stream lives in.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Identifier of the stream within its bucket.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Full remote stream name.
    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Version confirmed durable on the remote log, `-1` if the stream does
    /// not exist yet.
    pub fn committed_version(&self) -> i64 {
        self.committed_version
    }

    /// Committed version plus the number of staged events.
    pub fn stream_version(&self) -> i64 {
        self.committed_version.max(0) + self.uncommitted.len() as i64
    }

    /// Whether the stream exists remotely.
    pub fn exists(&self) -> bool {
        self.committed_version >= 0
    }

    /// Committed events followed by staged events, in version order.
    pub fn events(&self) -> impl Iterator<Item = &WritableEvent> {
        self.committed.iter().chain(self.uncommitted.iter())
    }

    /// Number of staged (not yet durable) events.
    pub fn uncommitted_count(&self) -> usize {
        self.uncommitted.len()
    }

    /// Whether this stream or any of its children has staged events.
    pub fn has_changes(&self) -> bool {
        !self.uncommitted.is_empty()
    }

    /// Stage an event: stamp it with the next local version and a UTC
    /// timestamp, and append it to the staged list. Never touches the
    /// remote log.
    pub fn add(
        &mut self,
        entity_type: &str,
        event_type: String,
        payload: serde_json::Value,
        headers: HashMap<String, String>,
    ) {
        self.version += 1;
        self.uncommitted.push(WritableEvent {
            event_id: Uuid::new_v4(),
            event_type,
            descriptor: EventDescriptor {
                entity_type: entity_type.to_string(),
                timestamp: Utc::now(),
                version: self.version,
                headers,
            },
            payload,
        });
    }

    /// Compose a nested stream so a single top-level commit cascades to it.
    pub fn add_child(&mut self, child: SharedStream) {
        self.children.push(child);
    }

    /// Discard staged events and reset the local version counter.
    pub fn clear_changes(&mut self) {
        self.uncommitted.clear();
        self.version = self.committed_version.max(0);
    }

    /// Wrap in the shared handle used across repository and root.
    pub fn into_shared(self) -> SharedStream {
        Arc::new(Mutex::new(self))
    }

    /// Detached copy of the committed state, for the stream cache.
    pub(crate) fn detached(&self) -> CachedStream {
        CachedStream {
            committed_version: self.committed_version,
            events: self.committed.clone(),
        }
    }

    /// Commit this stream and its children, children first (depth-first).
    ///
    /// If this stream has staged events, the commit id is merged into the
    /// commit headers and a conditional append is issued with the stream's
    /// committed version as the expectation. On success, staged events move
    /// to the committed list and the committed version advances.
    ///
    /// # Errors
    ///
    /// * [`CommitError::Conflict`] -- another writer won the race. Staged
    ///   events are discarded; the in-memory state is stale and must be
    ///   rehydrated before retrying. Children committed before the failure
    ///   stay committed.
    /// * [`CommitError::Persistence`] -- connectivity or timeout failure.
    ///   Staged events are retained; the caller may treat this as
    ///   retryable.
    pub fn commit<'a>(
        stream: &'a SharedStream,
        commit_id: Uuid,
        commit_headers: &'a HashMap<String, String>,
    ) -> Pin<Box<dyn Future<Output = Result<(), CommitError>> + Send + 'a>> {
        Box::pin(async move {
            let children = {
                let guard = stream.lock().await;
                guard.children.clone()
            };
            for child in &children {
                Self::commit(child, commit_id, commit_headers).await?;
            }

            let mut guard = stream.lock().await;
            if guard.uncommitted.is_empty() {
                return Ok(());
            }

            let mut headers = commit_headers.clone();
            headers.insert(COMMIT_ID_HEADER.to_string(), commit_id.to_string());

            let staged = guard.uncommitted.clone();
            let count = staged.len();
            let expected = guard.committed_version;
            let store = Arc::clone(&guard.store);
            let stream_name = guard.stream_name.clone();

            tracing::debug!(
                stream = %stream_name,
                expected,
                count,
                "committing staged events"
            );

            match store.write_events(&stream_name, expected, staged, &headers).await {
                Ok(last_version) => {
                    let this = &mut *guard;
                    this.committed.append(&mut this.uncommitted);
                    this.committed_version = last_version;
                    this.version = last_version;
                    Ok(())
                }
                Err(StoreError::VersionConflict { .. }) => {
                    guard.clear_changes();
                    Err(CommitError::Conflict { stream: stream_name })
                }
                Err(e) => Err(CommitError::Persistence(e)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::StreamCache;
    use crate::config::StoreConfig;
    use crate::event::default_stream_name;
    use crate::testing::MemoryEventLog;

    fn store_over(log: &MemoryEventLog) -> Arc<StoreClient> {
        Arc::new(StoreClient::new(
            Arc::new(log.clone()),
            StreamCache::new(),
            default_stream_name,
            Arc::new(StoreConfig::default()),
        ))
    }

    fn fresh_stream(store: &Arc<StoreClient>, id: &str) -> EventStream {
        EventStream::open(
            Arc::clone(store),
            "default",
            id,
            default_stream_name("order", "default", id),
            -1,
            Vec::new(),
        )
    }

    fn add(stream: &mut EventStream, event_type: &str) {
        stream.add(
            "order",
            event_type.to_string(),
            serde_json::json!({}),
            HashMap::new(),
        );
    }

    #[test]
    fn new_stream_reports_nonexistent() {
        let log = MemoryEventLog::new();
        let stream = fresh_stream(&store_over(&log), "42");
        assert_eq!(stream.committed_version(), -1);
        assert!(!stream.exists());
        assert_eq!(stream.stream_version(), 0);
    }

    #[test]
    fn add_stamps_sequential_versions() {
        let log = MemoryEventLog::new();
        let mut stream = fresh_stream(&store_over(&log), "42");
        add(&mut stream, "Created");
        add(&mut stream, "Renamed");

        let versions: Vec<i64> = stream.events().map(|e| e.descriptor.version).collect();
        assert_eq!(versions, vec![1, 2]);
        assert_eq!(stream.stream_version(), 2);
        assert_eq!(stream.uncommitted_count(), 2);
    }

    #[test]
    fn stream_version_is_committed_plus_staged() {
        let log = MemoryEventLog::new();
        let store = store_over(&log);
        let mut stream = EventStream::open(
            store,
            "default",
            "42",
            "default-order-42".to_string(),
            5,
            Vec::new(),
        );
        add(&mut stream, "Renamed");
        add(&mut stream, "Renamed");
        assert_eq!(stream.stream_version(), 7);
        // New stamps continue after the committed version.
        let versions: Vec<i64> = stream.events().map(|e| e.descriptor.version).collect();
        assert_eq!(versions, vec![6, 7]);
    }

    #[test]
    fn clear_changes_resets_counter() {
        let log = MemoryEventLog::new();
        let mut stream = fresh_stream(&store_over(&log), "42");
        add(&mut stream, "Created");
        stream.clear_changes();
        assert_eq!(stream.stream_version(), 0);

        add(&mut stream, "Created");
        assert_eq!(
            stream.events().next().unwrap().descriptor.version,
            1,
            "counter should restart after clear"
        );
    }

    #[tokio::test]
    async fn commit_flushes_staged_and_advances_version() {
        let log = MemoryEventLog::new();
        let store = store_over(&log);
        let mut stream = fresh_stream(&store, "42");
        add(&mut stream, "Created");
        add(&mut stream, "Renamed");
        let shared = stream.into_shared();

        EventStream::commit(&shared, Uuid::new_v4(), &HashMap::new())
            .await
            .expect("commit should succeed");

        let guard = shared.lock().await;
        assert_eq!(guard.committed_version(), 2);
        assert_eq!(guard.uncommitted_count(), 0);
        assert_eq!(guard.stream_version(), 2);
        assert_eq!(log.records("default-order-42").len(), 2);
    }

    #[tokio::test]
    async fn commit_merges_commit_id_into_headers() {
        let log = MemoryEventLog::new();
        let store = store_over(&log);
        let mut stream = fresh_stream(&store, "42");
        add(&mut stream, "Created");
        let shared = stream.into_shared();

        let commit_id = Uuid::new_v4();
        let mut headers = HashMap::new();
        headers.insert("Originating.MessageId".to_string(), "m-1".to_string());
        EventStream::commit(&shared, commit_id, &headers)
            .await
            .expect("commit should succeed");

        let records = log.records("default-order-42");
        let descriptor: crate::event::EventDescriptor =
            serde_json::from_slice(&records[0].descriptor).unwrap();
        assert_eq!(descriptor.headers[COMMIT_ID_HEADER], commit_id.to_string());
        assert_eq!(descriptor.headers["Originating.MessageId"], "m-1");
    }

    #[tokio::test]
    async fn commit_with_nothing_staged_is_noop() {
        let log = MemoryEventLog::new();
        let store = store_over(&log);
        let shared = fresh_stream(&store, "42").into_shared();

        EventStream::commit(&shared, Uuid::new_v4(), &HashMap::new())
            .await
            .expect("empty commit should succeed");
        assert_eq!(log.records("default-order-42").len(), 0);
    }

    #[tokio::test]
    async fn conflicting_commit_discards_staged_events() {
        let log = MemoryEventLog::new();
        let store = store_over(&log);

        // Writer A and writer B both open the nonexistent stream.
        let mut a = fresh_stream(&store, "42");
        let mut b = fresh_stream(&store, "42");
        add(&mut a, "Created");
        add(&mut b, "Created");
        let a = a.into_shared();
        let b = b.into_shared();

        EventStream::commit(&a, Uuid::new_v4(), &HashMap::new())
            .await
            .expect("first commit should win");

        let err = EventStream::commit(&b, Uuid::new_v4(), &HashMap::new())
            .await
            .expect_err("second commit should conflict");
        assert!(matches!(err, CommitError::Conflict { .. }), "got: {err:?}");

        // Loser's staged events are gone; only the winner's event is durable.
        let guard = b.lock().await;
        assert_eq!(guard.uncommitted_count(), 0);
        assert_eq!(log.records("default-order-42").len(), 1);
    }

    #[tokio::test]
    async fn connectivity_failure_is_persistence_and_keeps_staged() {
        let log = MemoryEventLog::new();
        let store = store_over(&log);
        let mut stream = fresh_stream(&store, "42");
        add(&mut stream, "Created");
        let shared = stream.into_shared();

        log.fail_next_append(StoreError::Timeout);
        let err = EventStream::commit(&shared, Uuid::new_v4(), &HashMap::new())
            .await
            .expect_err("commit should fail");
        assert!(matches!(err, CommitError::Persistence(_)), "got: {err:?}");

        // Staged events survive a transient failure; a retry succeeds.
        assert_eq!(shared.lock().await.uncommitted_count(), 1);
        EventStream::commit(&shared, Uuid::new_v4(), &HashMap::new())
            .await
            .expect("retry should succeed");
        assert_eq!(log.records("default-order-42").len(), 1);
    }

    #[tokio::test]
    async fn children_commit_before_parent() {
        let log = MemoryEventLog::new();
        let store = store_over(&log);

        let mut parent = fresh_stream(&store, "42");
        add(&mut parent, "Created");

        let mut child = EventStream::open(
            Arc::clone(&store),
            "default",
            "42.line-1",
            default_stream_name("order_line", "default", "42.line-1"),
            -1,
            Vec::new(),
        );
        child.add(
            "order_line",
            "LineAdded".to_string(),
            serde_json::json!({"sku": "s-1"}),
            HashMap::new(),
        );
        let child = child.into_shared();
        parent.add_child(Arc::clone(&child));
        let parent = parent.into_shared();

        EventStream::commit(&parent, Uuid::new_v4(), &HashMap::new())
            .await
            .expect("cascading commit should succeed");

        let child_records = log.records("default-order_line-42.line-1");
        let parent_records = log.records("default-order-42");
        assert_eq!(child_records.len(), 1);
        assert_eq!(parent_records.len(), 1);
        assert!(
            child_records[0].global_position < parent_records[0].global_position,
            "child must be appended before parent"
        );
    }

    #[tokio::test]
    async fn child_failure_leaves_parent_uncommitted() {
        let log = MemoryEventLog::new();
        let store = store_over(&log);

        let mut parent = fresh_stream(&store, "42");
        add(&mut parent, "Created");

        let mut child = fresh_stream(&store, "42-child");
        add(&mut child, "ChildCreated");
        let child = child.into_shared();
        parent.add_child(Arc::clone(&child));
        let parent = parent.into_shared();

        // The child's append (the first one attempted) fails.
        log.fail_next_append(StoreError::Timeout);
        let err = EventStream::commit(&parent, Uuid::new_v4(), &HashMap::new())
            .await
            .expect_err("commit should fail at the child");
        assert!(matches!(err, CommitError::Persistence(_)));

        // Parent must not be durable and must still hold its staged event.
        assert_eq!(log.records("default-order-42").len(), 0);
        assert_eq!(parent.lock().await.uncommitted_count(), 1);
    }
}
