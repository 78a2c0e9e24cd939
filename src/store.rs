//! Store client: typed access to the append-only log.
//!
//! [`StoreClient`] sits between the in-memory [`EventStream`] world and the
//! raw [`EventLog`] transport. It pages reads, serializes events and their
//! descriptors, merges commit headers, generates stream names, and keeps the
//! process-wide [`StreamCache`] coherent by evicting on every write.

use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::StreamCache;
use crate::client::{EventLog, ExpectedVersion, ProposedRecord};
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::event::{EventDescriptor, StreamNameGenerator, WritableEvent, decode_writable_event};
use crate::stream::EventStream;

/// Append-only log accessor with read-forward/read-backward paging,
/// conditional append, and stream-name generation.
pub struct StoreClient {
    log: Arc<dyn EventLog>,
    cache: StreamCache,
    names: StreamNameGenerator,
    config: Arc<StoreConfig>,
}

impl std::fmt::Debug for StoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreClient")
            .field("cache_entities", &self.config.cache_entities)
            .field("read_page_size", &self.config.read_page_size)
            .finish()
    }
}

impl StoreClient {
    /// Create a store client over an event log.
    pub fn new(
        log: Arc<dyn EventLog>,
        cache: StreamCache,
        names: StreamNameGenerator,
        config: Arc<StoreConfig>,
    ) -> Self {
        Self {
            log,
            cache,
            names,
            config,
        }
    }

    /// The remote stream name for an entity identity.
    pub fn stream_name(&self, entity_type: &str, bucket: &str, stream_id: &str) -> String {
        (self.names)(entity_type, bucket, stream_id)
    }

    /// The shared stream cache.
    pub fn cache(&self) -> &StreamCache {
        &self.cache
    }

    /// The active configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Open a stream, reading all committed events from `from` (1-based;
    /// `None` reads from the beginning).
    ///
    /// When `cache_entities` is on and the read starts at the beginning, the
    /// cache is consulted first and populated after a full read. Reads that
    /// start mid-stream (the snapshot path) bypass the cache, since a cached
    /// copy always holds the full prefix.
    ///
    /// A stream that does not exist yet is returned with committed version
    /// `-1` rather than an error.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on transport failure or undecodable events.
    pub async fn get_stream(
        self: &Arc<Self>,
        entity_type: &str,
        bucket: &str,
        stream_id: &str,
        from: Option<i64>,
    ) -> Result<EventStream, StoreError> {
        let stream_name = self.stream_name(entity_type, bucket, stream_id);

        if self.config.cache_entities
            && from.is_none()
            && let Some(cached) = self.cache.retrieve(&stream_name)
        {
            return Ok(EventStream::open(
                Arc::clone(self),
                bucket,
                stream_id,
                stream_name,
                cached.committed_version,
                cached.events,
            ));
        }

        let mut events = Vec::new();
        let mut slice_start = from.unwrap_or(1);
        let mut last_version = -1;
        tracing::debug!(
            stream = %stream_name,
            from = slice_start,
            "reading stream forward"
        );
        loop {
            let page = self
                .log
                .read_page(&stream_name, slice_start, self.config.read_page_size, false)
                .await?;
            for record in &page.events {
                events.push(decode_writable_event(record)?);
            }
            last_version = page.last_version;
            slice_start = page.next_version;
            if page.end_of_stream {
                break;
            }
        }
        tracing::debug!(
            stream = %stream_name,
            count = events.len(),
            last_version,
            "finished reading stream"
        );

        let stream = EventStream::open(
            Arc::clone(self),
            bucket,
            stream_id,
            stream_name.clone(),
            last_version,
            events,
        );
        if self.config.cache_entities && from.is_none() && stream.exists() {
            self.cache.insert(&stream_name, stream.detached());
        }
        Ok(stream)
    }

    /// Open a stream without reading prior events. Used for first-time
    /// creation; the stream reports committed version `-1` and a commit will
    /// conflict if the stream already exists remotely.
    pub fn new_stream(
        self: &Arc<Self>,
        entity_type: &str,
        bucket: &str,
        stream_id: &str,
    ) -> EventStream {
        let stream_name = self.stream_name(entity_type, bucket, stream_id);
        EventStream::open(
            Arc::clone(self),
            bucket,
            stream_id,
            stream_name,
            -1,
            Vec::new(),
        )
    }

    /// Read up to `count` events forward from `from` (1-based) on a raw
    /// stream name. Used for replaying index streams.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on transport failure or undecodable events.
    pub async fn get_events(
        &self,
        stream_name: &str,
        from: i64,
        count: Option<usize>,
    ) -> Result<Vec<WritableEvent>, StoreError> {
        let mut events = Vec::new();
        let mut slice_start = from;
        loop {
            let remaining = count.map(|c| c - events.len()).unwrap_or(usize::MAX);
            if remaining == 0 {
                break;
            }
            let take = remaining.min(self.config.read_page_size);
            let page = self.log.read_page(stream_name, slice_start, take, false).await?;
            for record in &page.events {
                events.push(decode_writable_event(record)?);
            }
            slice_start = page.next_version;
            if page.end_of_stream {
                break;
            }
        }
        Ok(events)
    }

    /// Read up to `count` events backward from the end of a stream.
    /// The newest event comes first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on transport failure or undecodable events.
    pub async fn get_events_backwards(
        &self,
        stream_name: &str,
        count: usize,
    ) -> Result<Vec<WritableEvent>, StoreError> {
        let mut events = Vec::new();
        let mut slice_start = -1;
        loop {
            let take = (count - events.len()).min(self.config.read_page_size);
            if take == 0 {
                break;
            }
            let page = self.log.read_page(stream_name, slice_start, take, true).await?;
            for record in &page.events {
                events.push(decode_writable_event(record)?);
            }
            slice_start = page.next_version;
            if page.end_of_stream {
                break;
            }
        }
        Ok(events)
    }

    /// Conditionally append staged events at the given committed version.
    ///
    /// Commit headers are merged beneath each event's own headers (the
    /// event's keys win), the cache entry for the stream is evicted, and the
    /// append carries `Exact(committed)` -- or `NoStream` for a stream that
    /// does not exist yet.
    ///
    /// Returns the version of the last appended event.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::VersionConflict`] when another writer won the
    /// race, or other [`StoreError`] variants on transport failure.
    pub async fn write_events(
        &self,
        stream_name: &str,
        committed_version: i64,
        events: Vec<WritableEvent>,
        commit_headers: &HashMap<String, String>,
    ) -> Result<i64, StoreError> {
        tracing::debug!(
            stream = %stream_name,
            expected = committed_version,
            count = events.len(),
            "writing events"
        );
        self.cache.evict(stream_name);
        let records = encode_records(stream_name, events, commit_headers)?;
        self.log
            .append(
                stream_name,
                ExpectedVersion::from_committed(committed_version),
                records,
            )
            .await
    }

    /// Append events with no concurrency check (`ExpectedVersion::Any`).
    /// Used by the snapshot store, where records are plain appends.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on transport failure.
    pub async fn append_events(
        &self,
        stream_name: &str,
        events: Vec<WritableEvent>,
        commit_headers: &HashMap<String, String>,
    ) -> Result<i64, StoreError> {
        tracing::debug!(stream = %stream_name, count = events.len(), "appending events");
        self.cache.evict(stream_name);
        let records = encode_records(stream_name, events, commit_headers)?;
        self.log
            .append(stream_name, ExpectedVersion::Any, records)
            .await
    }
}

/// Serialize staged events to wire records, merging commit headers beneath
/// each event's own headers.
fn encode_records(
    stream_name: &str,
    events: Vec<WritableEvent>,
    commit_headers: &HashMap<String, String>,
) -> Result<Vec<ProposedRecord>, StoreError> {
    let corrupt = |detail: String| StoreError::Corrupt {
        stream: stream_name.to_string(),
        detail,
    };
    events
        .into_iter()
        .map(|event| {
            let mut headers = commit_headers.clone();
            headers.extend(event.descriptor.headers.clone());
            let descriptor = EventDescriptor {
                headers,
                ..event.descriptor
            };
            Ok(ProposedRecord {
                event_id: event.event_id,
                event_type: event.event_type,
                payload: serde_json::to_vec(&event.payload)
                    .map_err(|e| corrupt(format!("payload: {e}")))?,
                descriptor: serde_json::to_vec(&descriptor)
                    .map_err(|e| corrupt(format!("descriptor: {e}")))?,
            })
        })
        .collect()
}
