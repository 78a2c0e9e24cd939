//! In-process [`EventLog`] backend for tests.
//!
//! [`MemoryEventLog`] enforces the same expected-version contract as the
//! real service, so stream, repository, unit-of-work, and dispatcher tests
//! run without a `streamstore-db` server. Downstream crates may also use it
//! in their own test suites.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_stream::wrappers::ReceiverStream;

use crate::client::{EventLog, ExpectedVersion, FeedItem, FeedStream, ProposedRecord, ReadPage, StoredRecord};
use crate::error::StoreError;

struct State {
    /// Per-stream event lists, in version order.
    streams: HashMap<String, Vec<StoredRecord>>,
    /// Global log: every event in append order. Index = global position.
    global: Vec<StoredRecord>,
    /// Error to return from the next append, for failure-path tests.
    fail_next_append: Option<StoreError>,
}

/// In-memory append-only log with expected-version enforcement.
///
/// Clone is cheap; all clones share the same state.
#[derive(Clone)]
pub struct MemoryEventLog {
    state: Arc<Mutex<State>>,
    live_tx: tokio::sync::broadcast::Sender<StoredRecord>,
}

impl Default for MemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEventLog {
    /// Create an empty log.
    pub fn new() -> Self {
        let (live_tx, _) = tokio::sync::broadcast::channel(256);
        Self {
            state: Arc::new(Mutex::new(State {
                streams: HashMap::new(),
                global: Vec::new(),
                fail_next_append: None,
            })),
            live_tx,
        }
    }

    /// Make the next `append` call fail with the given error, once.
    pub fn fail_next_append(&self, err: StoreError) {
        self.state.lock().expect("state lock poisoned").fail_next_append = Some(err);
    }

    /// All recorded events on a stream, in version order.
    pub fn records(&self, stream_name: &str) -> Vec<StoredRecord> {
        self.state
            .lock()
            .expect("state lock poisoned")
            .streams
            .get(stream_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of events in the global log.
    pub fn global_len(&self) -> usize {
        self.state.lock().expect("state lock poisoned").global.len()
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn read_page(
        &self,
        stream_name: &str,
        from_version: i64,
        max_count: usize,
        backward: bool,
    ) -> Result<ReadPage, StoreError> {
        let state = self.state.lock().expect("state lock poisoned");
        let Some(events) = state.streams.get(stream_name) else {
            return Ok(ReadPage {
                events: Vec::new(),
                last_version: -1,
                next_version: from_version,
                end_of_stream: true,
            });
        };
        let last = events.len() as i64;

        if backward {
            let start = if from_version < 0 {
                last
            } else {
                from_version.min(last)
            };
            let lowest = (start - max_count as i64 + 1).max(1);
            // Versions are 1-based and dense, so version v lives at index v-1.
            let page: Vec<StoredRecord> = (lowest..=start)
                .rev()
                .filter_map(|v| events.get((v - 1) as usize).cloned())
                .collect();
            let next_version = lowest - 1;
            Ok(ReadPage {
                events: page,
                last_version: last,
                next_version,
                end_of_stream: next_version < 1,
            })
        } else {
            let from = from_version.max(1);
            let page: Vec<StoredRecord> = events
                .iter()
                .skip((from - 1) as usize)
                .take(max_count)
                .cloned()
                .collect();
            let next_version = page.last().map(|e| e.version + 1).unwrap_or(from);
            Ok(ReadPage {
                events: page,
                last_version: last,
                next_version,
                end_of_stream: next_version > last,
            })
        }
    }

    async fn append(
        &self,
        stream_name: &str,
        expected: ExpectedVersion,
        events: Vec<ProposedRecord>,
    ) -> Result<i64, StoreError> {
        let recorded = {
            let mut state = self.state.lock().expect("state lock poisoned");
            if let Some(err) = state.fail_next_append.take() {
                return Err(err);
            }

            let current = state
                .streams
                .get(stream_name)
                .map(|s| s.len() as i64)
                .unwrap_or(-1);
            let conflict = || StoreError::VersionConflict {
                stream: stream_name.to_string(),
                expected: expected.report_value(),
            };
            match expected {
                ExpectedVersion::Any => {}
                ExpectedVersion::NoStream if current >= 0 => return Err(conflict()),
                ExpectedVersion::Exact(v) if current != v => return Err(conflict()),
                _ => {}
            }

            let base = current.max(0);
            let recorded_at = chrono::Utc::now().timestamp_millis() as u64;
            let mut recorded = Vec::with_capacity(events.len());
            for (i, event) in events.into_iter().enumerate() {
                let record = StoredRecord {
                    event_id: event.event_id.to_string(),
                    stream_name: stream_name.to_string(),
                    version: base + i as i64 + 1,
                    global_position: state.global.len() as u64 + i as u64,
                    event_type: event.event_type,
                    payload: event.payload,
                    descriptor: event.descriptor,
                    recorded_at,
                };
                recorded.push(record);
            }
            state.global.extend(recorded.iter().cloned());
            state
                .streams
                .entry(stream_name.to_string())
                .or_default()
                .extend(recorded.iter().cloned());
            recorded
        };

        let last_version = recorded.last().map(|r| r.version).unwrap_or(0);
        for record in recorded {
            // No subscribers is fine; broadcast send only fails then.
            let _ = self.live_tx.send(record);
        }
        Ok(last_version)
    }

    async fn subscribe_all_from(&self, from_position: u64) -> Result<FeedStream, StoreError> {
        // Subscribe to live events BEFORE snapshotting history so nothing
        // falls between replay and tail. Duplicates are filtered by position.
        let mut live_rx = self.live_tx.subscribe();
        let history: Vec<StoredRecord> = {
            let state = self.state.lock().expect("state lock poisoned");
            state
                .global
                .iter()
                .filter(|e| e.global_position >= from_position)
                .cloned()
                .collect()
        };
        let mut next_position = history
            .last()
            .map(|e| e.global_position + 1)
            .unwrap_or(from_position);

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        tokio::spawn(async move {
            for event in history {
                if tx.send(Ok(FeedItem::Event(event))).await.is_err() {
                    return;
                }
            }
            if tx.send(Ok(FeedItem::CaughtUp)).await.is_err() {
                return;
            }
            loop {
                match live_rx.recv().await {
                    Ok(event) => {
                        if event.global_position < next_position {
                            continue;
                        }
                        next_position = event.global_position + 1;
                        if tx.send(Ok(FeedItem::Event(event))).await.is_err() {
                            return;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        let err = StoreError::Connection(format!("subscription lagged by {n}"));
                        if tx.send(Err(err)).await.is_err() {
                            return;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;
    use uuid::Uuid;

    fn proposed(event_type: &str) -> ProposedRecord {
        ProposedRecord {
            event_id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            payload: b"{}".to_vec(),
            descriptor: b"{}".to_vec(),
        }
    }

    #[tokio::test]
    async fn append_assigns_one_based_versions() {
        let log = MemoryEventLog::new();
        let last = log
            .append("s", ExpectedVersion::NoStream, vec![proposed("A"), proposed("B")])
            .await
            .unwrap();
        assert_eq!(last, 2);

        let records = log.records("s");
        assert_eq!(records[0].version, 1);
        assert_eq!(records[1].version, 2);
    }

    #[tokio::test]
    async fn no_stream_expectation_rejects_existing_stream() {
        let log = MemoryEventLog::new();
        log.append("s", ExpectedVersion::NoStream, vec![proposed("A")])
            .await
            .unwrap();
        let err = log
            .append("s", ExpectedVersion::NoStream, vec![proposed("B")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn exact_expectation_enforced() {
        let log = MemoryEventLog::new();
        log.append("s", ExpectedVersion::NoStream, vec![proposed("A")])
            .await
            .unwrap();

        // Correct expectation succeeds.
        log.append("s", ExpectedVersion::Exact(1), vec![proposed("B")])
            .await
            .unwrap();

        // Stale expectation conflicts.
        let err = log
            .append("s", ExpectedVersion::Exact(1), vec![proposed("C")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { expected: 1, .. }));
    }

    #[tokio::test]
    async fn read_forward_pages_through_stream() {
        let log = MemoryEventLog::new();
        log.append(
            "s",
            ExpectedVersion::Any,
            (0..5).map(|i| proposed(&format!("E{i}"))).collect(),
        )
        .await
        .unwrap();

        let first = log.read_page("s", 1, 2, false).await.unwrap();
        assert_eq!(first.events.len(), 2);
        assert_eq!(first.next_version, 3);
        assert!(!first.end_of_stream);
        assert_eq!(first.last_version, 5);

        let rest = log.read_page("s", first.next_version, 10, false).await.unwrap();
        assert_eq!(rest.events.len(), 3);
        assert!(rest.end_of_stream);
    }

    #[tokio::test]
    async fn read_backward_from_end() {
        let log = MemoryEventLog::new();
        log.append(
            "s",
            ExpectedVersion::Any,
            (0..3).map(|i| proposed(&format!("E{i}"))).collect(),
        )
        .await
        .unwrap();

        let page = log.read_page("s", -1, 2, true).await.unwrap();
        assert_eq!(page.events.len(), 2);
        assert_eq!(page.events[0].version, 3);
        assert_eq!(page.events[1].version, 2);
        assert!(!page.end_of_stream);

        let rest = log.read_page("s", page.next_version, 2, true).await.unwrap();
        assert_eq!(rest.events.len(), 1);
        assert_eq!(rest.events[0].version, 1);
        assert!(rest.end_of_stream);
    }

    #[tokio::test]
    async fn missing_stream_reads_as_empty_not_error() {
        let log = MemoryEventLog::new();
        let page = log.read_page("nope", 1, 10, false).await.unwrap();
        assert!(page.events.is_empty());
        assert_eq!(page.last_version, -1);
        assert!(page.end_of_stream);
    }

    #[tokio::test]
    async fn fail_next_append_fires_once() {
        let log = MemoryEventLog::new();
        log.fail_next_append(StoreError::Timeout);
        let err = log
            .append("s", ExpectedVersion::Any, vec![proposed("A")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Timeout));

        // Second append succeeds.
        log.append("s", ExpectedVersion::Any, vec![proposed("A")])
            .await
            .unwrap();
        assert_eq!(log.records("s").len(), 1);
    }

    #[tokio::test]
    async fn subscribe_replays_history_then_goes_live() {
        let log = MemoryEventLog::new();
        log.append("a", ExpectedVersion::Any, vec![proposed("A1")])
            .await
            .unwrap();

        let mut feed = log.subscribe_all_from(0).await.unwrap();

        // History.
        let item = feed.next().await.unwrap().unwrap();
        assert!(matches!(item, FeedItem::Event(ref e) if e.event_type == "A1"));

        // Caught-up sentinel.
        let item = feed.next().await.unwrap().unwrap();
        assert!(matches!(item, FeedItem::CaughtUp));

        // Live tail.
        log.append("b", ExpectedVersion::Any, vec![proposed("B1")])
            .await
            .unwrap();
        let item = feed.next().await.unwrap().unwrap();
        assert!(matches!(item, FeedItem::Event(ref e) if e.event_type == "B1"));
    }

    #[tokio::test]
    async fn subscribe_from_position_skips_earlier_events() {
        let log = MemoryEventLog::new();
        log.append("a", ExpectedVersion::Any, vec![proposed("A1"), proposed("A2")])
            .await
            .unwrap();

        let mut feed = log.subscribe_all_from(1).await.unwrap();
        let item = feed.next().await.unwrap().unwrap();
        assert!(
            matches!(item, FeedItem::Event(ref e) if e.global_position == 1),
            "first item should be position 1"
        );
    }
}
