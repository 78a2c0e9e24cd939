//! Snapshot persistence: point-in-time mementos that shortcut replay.
//!
//! Snapshots are an optimization, so absence is never an error -- callers
//! always fall back to full replay. Staged snapshots are flushed together
//! with the owning unit of work, never written immediately, so a crash
//! cannot produce a snapshot newer than its events.
//!
//! The log service is only queryable by stream identity, so each committed
//! memento is written twice: the full payload to a per-identity stream (the
//! load path) and a light `{id, version}` ref to a per-type index stream
//! (the query path).

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::event::{EventDescriptor, WritableEvent};
use crate::store::StoreClient;

/// A point-in-time memento of an entity's state at a specific version.
///
/// The version records how many events are folded into the memento, so
/// hydration can resume reading from `version + 1`. It is always at or
/// below the stream's committed version at the time it was taken.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Stream id of the entity the memento belongs to.
    pub id: String,
    /// Stream version the memento was taken at.
    pub version: i64,
    /// Opaque serialized state.
    pub memento: serde_json::Value,
}

/// A ref written to the per-type index stream for each committed memento.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRef {
    id: String,
    version: i64,
}

/// Name of the per-identity snapshot stream.
pub fn snapshot_stream_name(bucket: &str, entity_type: &str, id: &str) -> String {
    format!("{bucket}.snap.{entity_type}-{id}")
}

/// Name of the per-type snapshot index stream.
pub fn snapshot_index_stream_name(bucket: &str, entity_type: &str) -> String {
    format!("{bucket}.snapidx.{entity_type}")
}

struct Pending {
    entity_type: String,
    bucket: String,
    snapshot: Snapshot,
}

/// Persists, loads, and queries mementos keyed by (entity type, id).
///
/// Commits independently from the event streams: events first, snapshots
/// after, both driven by the unit of work.
pub struct SnapshotStore {
    store: Arc<StoreClient>,
    pending: Mutex<Vec<Pending>>,
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl SnapshotStore {
    /// Create a snapshot store over the given store client.
    pub fn new(store: Arc<StoreClient>) -> Self {
        Self {
            store,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Load the most recent memento for an identity, or `None`.
    ///
    /// A missing stream, an undecodable record, or a malformed memento all
    /// read as "no snapshot" (with a warning for the latter two) -- replay
    /// from the beginning is always a valid fallback.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] only for transport-level failures.
    pub async fn load(
        &self,
        entity_type: &str,
        bucket: &str,
        id: &str,
    ) -> Result<Option<Snapshot>, StoreError> {
        let stream_name = snapshot_stream_name(bucket, entity_type, id);
        let events = match self.store.get_events_backwards(&stream_name, 1).await {
            Ok(events) => events,
            Err(StoreError::Corrupt { stream, detail }) => {
                tracing::warn!(
                    stream = %stream,
                    detail = %detail,
                    "undecodable snapshot record; treating as no snapshot"
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let Some(record) = events.into_iter().next() else {
            return Ok(None);
        };
        match serde_json::from_value::<Snapshot>(record.payload) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                tracing::warn!(
                    stream = %stream_name,
                    error = %e,
                    "malformed snapshot payload; treating as no snapshot"
                );
                Ok(None)
            }
        }
    }

    /// Stage a memento for the next [`commit`](Self::commit). Nothing is
    /// written until then.
    pub fn add(&self, entity_type: &str, bucket: &str, snapshot: Snapshot) {
        tracing::debug!(
            entity_type,
            bucket,
            id = %snapshot.id,
            version = snapshot.version,
            "staging snapshot"
        );
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .push(Pending {
                entity_type: entity_type.to_string(),
                bucket: bucket.to_string(),
                snapshot,
            });
    }

    /// Number of staged mementos.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending lock poisoned").len()
    }

    /// Flush all staged mementos: full payload to the per-identity stream,
    /// `{id, version}` ref to the per-type index stream.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on transport failure. Mementos not yet flushed
    /// (including the failing one) are restored to the pending list so a
    /// later commit can retry them.
    pub async fn commit(&self) -> Result<(), StoreError> {
        let drained: Vec<Pending> = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .drain(..)
            .collect();
        if drained.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = drained.len(), "flushing snapshots");

        let mut remaining = drained.into_iter();
        while let Some(pending) = remaining.next() {
            if let Err(e) = self.flush_one(&pending).await {
                let mut staged = self.pending.lock().expect("pending lock poisoned");
                staged.push(pending);
                staged.extend(remaining);
                return Err(e);
            }
        }
        Ok(())
    }

    async fn flush_one(&self, pending: &Pending) -> Result<(), StoreError> {
        let Pending {
            entity_type,
            bucket,
            snapshot,
        } = pending;

        let memento_event = snapshot_event(entity_type, snapshot.version, serde_json::to_value(snapshot).expect("snapshot serialization is infallible"));
        let stream = snapshot_stream_name(bucket, entity_type, &snapshot.id);
        self.store
            .append_events(&stream, vec![memento_event], &Default::default())
            .await?;

        let index_event = snapshot_event(
            entity_type,
            snapshot.version,
            serde_json::json!({ "id": snapshot.id, "version": snapshot.version }),
        );
        let index = snapshot_index_stream_name(bucket, entity_type);
        self.store
            .append_events(&index, vec![index_event], &Default::default())
            .await?;
        Ok(())
    }

    /// Evaluate a predicate over the latest memento of every identity that
    /// has ever been snapshotted.
    ///
    /// Only snapshotted identities are visible: an entity created but never
    /// snapshotted will not appear here even though its events exist. This
    /// is a documented limitation of content queries over an identity-keyed
    /// log, not an oversight.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on transport failure while replaying the
    /// index.
    pub async fn query<P>(
        &self,
        entity_type: &str,
        bucket: &str,
        predicate: P,
    ) -> Result<Vec<Snapshot>, StoreError>
    where
        P: Fn(&serde_json::Value) -> bool,
    {
        let index = snapshot_index_stream_name(bucket, entity_type);
        let refs = self.store.get_events(&index, 1, None).await?;

        // First-seen order; later refs for the same id do not re-add it.
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for record in refs {
            if let Ok(r) = serde_json::from_value::<SnapshotRef>(record.payload)
                && seen.insert(r.id.clone())
            {
                ids.push(r.id);
            }
        }

        let mut matches = Vec::new();
        for id in ids {
            if let Some(snapshot) = self.load(entity_type, bucket, &id).await?
                && predicate(&snapshot.memento)
            {
                matches.push(snapshot);
            }
        }
        Ok(matches)
    }
}

fn snapshot_event(entity_type: &str, version: i64, payload: serde_json::Value) -> WritableEvent {
    WritableEvent {
        event_id: Uuid::new_v4(),
        event_type: "Snapshot".to_string(),
        descriptor: EventDescriptor {
            entity_type: entity_type.to_string(),
            timestamp: Utc::now(),
            version,
            headers: Default::default(),
        },
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::StreamCache;
    use crate::client::{EventLog, ExpectedVersion, ProposedRecord};
    use crate::config::StoreConfig;
    use crate::event::default_stream_name;
    use crate::testing::MemoryEventLog;

    fn snapshot_store(log: &MemoryEventLog) -> SnapshotStore {
        SnapshotStore::new(Arc::new(StoreClient::new(
            Arc::new(log.clone()),
            StreamCache::new(),
            default_stream_name,
            Arc::new(StoreConfig::default()),
        )))
    }

    fn snap(id: &str, version: i64, balance: i64) -> Snapshot {
        Snapshot {
            id: id.to_string(),
            version,
            memento: serde_json::json!({ "balance": balance }),
        }
    }

    #[tokio::test]
    async fn load_missing_returns_none() {
        let log = MemoryEventLog::new();
        let store = snapshot_store(&log);
        let loaded = store.load("account", "default", "a-1").await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn add_stages_without_writing() {
        let log = MemoryEventLog::new();
        let store = snapshot_store(&log);
        store.add("account", "default", snap("a-1", 3, 100));

        assert_eq!(store.pending_count(), 1);
        assert_eq!(log.global_len(), 0, "nothing durable before commit");
        assert!(store.load("account", "default", "a-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn commit_then_load_roundtrips_latest() {
        let log = MemoryEventLog::new();
        let store = snapshot_store(&log);
        store.add("account", "default", snap("a-1", 3, 100));
        store.add("account", "default", snap("a-1", 7, 250));
        store.commit().await.unwrap();
        assert_eq!(store.pending_count(), 0);

        let loaded = store
            .load("account", "default", "a-1")
            .await
            .unwrap()
            .expect("snapshot should exist");
        assert_eq!(loaded.version, 7);
        assert_eq!(loaded.memento["balance"], 250);
    }

    #[tokio::test]
    async fn commit_failure_restores_pending() {
        let log = MemoryEventLog::new();
        let store = snapshot_store(&log);
        store.add("account", "default", snap("a-1", 3, 100));

        log.fail_next_append(StoreError::Timeout);
        let err = store.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout));
        assert_eq!(store.pending_count(), 1, "failed memento stays staged");

        // A later commit flushes it.
        store.commit().await.unwrap();
        assert!(store.load("account", "default", "a-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn query_filters_by_predicate_over_latest_memento() {
        let log = MemoryEventLog::new();
        let store = snapshot_store(&log);
        store.add("account", "default", snap("a-1", 2, 50));
        store.add("account", "default", snap("a-2", 2, 500));
        store.add("account", "default", snap("a-1", 5, 700));
        store.commit().await.unwrap();

        let rich = store
            .query("account", "default", |m| {
                m["balance"].as_i64().unwrap_or(0) > 300
            })
            .await
            .unwrap();

        let ids: Vec<&str> = rich.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a-1", "a-2"]);
        // a-1 matches on its LATEST memento, not the stale one.
        assert_eq!(rich[0].version, 5);
    }

    #[tokio::test]
    async fn query_sees_only_snapshotted_identities() {
        let log = MemoryEventLog::new();
        let store = snapshot_store(&log);
        store.add("account", "default", snap("a-1", 2, 50));
        store.commit().await.unwrap();

        // "a-2" has events somewhere but no snapshot: invisible to query.
        let all = store.query("account", "default", |_| true).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "a-1");
    }

    #[tokio::test]
    async fn buckets_partition_snapshots() {
        let log = MemoryEventLog::new();
        let store = snapshot_store(&log);
        store.add("account", "tenant-a", snap("a-1", 1, 10));
        store.commit().await.unwrap();

        assert!(store.load("account", "tenant-b", "a-1").await.unwrap().is_none());
        assert!(store.query("account", "tenant-b", |_| true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_snapshot_record_reads_as_none() {
        let log = MemoryEventLog::new();
        let store = snapshot_store(&log);

        // Write a record whose payload is valid JSON but not a Snapshot.
        let stream = snapshot_stream_name("default", "account", "a-1");
        log.append(
            &stream,
            ExpectedVersion::Any,
            vec![ProposedRecord {
                event_id: Uuid::new_v4(),
                event_type: "Snapshot".to_string(),
                payload: br#"{"unexpected": true}"#.to_vec(),
                descriptor: br#"{"entity_type":"account","timestamp":"2024-01-01T00:00:00Z","version":1,"headers":{}}"#.to_vec(),
            }],
        )
        .await
        .unwrap();

        let loaded = store.load("account", "default", "a-1").await.unwrap();
        assert!(loaded.is_none(), "malformed memento must read as no snapshot");
    }

    #[tokio::test]
    async fn corrupt_descriptor_reads_as_none() {
        let log = MemoryEventLog::new();
        let store = snapshot_store(&log);

        let stream = snapshot_stream_name("default", "account", "a-1");
        log.append(
            &stream,
            ExpectedVersion::Any,
            vec![ProposedRecord {
                event_id: Uuid::new_v4(),
                event_type: "Snapshot".to_string(),
                payload: b"{}".to_vec(),
                descriptor: b"\xff\xfe not json".to_vec(),
            }],
        )
        .await
        .unwrap();

        let loaded = store.load("account", "default", "a-1").await.unwrap();
        assert!(loaded.is_none());
    }
}
