//! Subscription feed: reads the global log and pushes events into the
//! dispatcher.
//!
//! The feed loop holds a `SubscribeAll` stream open, decodes each recorded
//! event, and offers it to the [`Dispatcher`]. A queue-overflow rejection is
//! the dispatcher's backpressure signal: the feed stops reading and
//! re-offers the same event until it is admitted. Stream errors reconnect
//! with exponential backoff; a fatal dispatcher cancellation tears the feed
//! down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio_stream::StreamExt;

use crate::client::{EventLog, FeedItem};
use crate::config::FeedConfig;
use crate::dispatch::Dispatcher;
use crate::error::DispatchError;
use crate::event::decode_stored_event;

/// Handle for controlling a running feed loop.
///
/// Dropping the handle does **not** stop the loop -- call
/// [`shutdown`](FeedHandle::shutdown) for graceful termination.
///
/// `Clone` is cheap: all fields are `Arc`-wrapped.
#[derive(Clone)]
pub struct FeedHandle {
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    caught_up: Arc<AtomicBool>,
    position: Arc<AtomicU64>,
    /// The spawned background task. Wrapped in `Option` so it can be taken
    /// and awaited exactly once by [`shutdown`](FeedHandle::shutdown).
    task: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<Result<(), DispatchError>>>>>,
}

impl FeedHandle {
    /// Whether historical replay has completed at least once.
    pub fn is_caught_up(&self) -> bool {
        self.caught_up.load(Ordering::Acquire)
    }

    /// The next global position the feed will read from.
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    /// Signal the loop to stop and wait for it to finish.
    ///
    /// Calling `shutdown` more than once is safe -- subsequent calls return
    /// `Ok(())` immediately.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Canceled`] if the loop ended because the
    /// dispatcher was torn down by a fatal event drop.
    pub async fn shutdown(&self) -> Result<(), DispatchError> {
        // Ignore send errors: the task may already have exited.
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().await.take();
        match task {
            Some(join_handle) => join_handle.await.unwrap_or(Ok(())),
            None => Ok(()),
        }
    }
}

/// Start the feed loop from a global position.
///
/// Returns immediately; the loop runs as a background task controlled by
/// the returned handle.
pub fn start_feed(
    log: Arc<dyn EventLog>,
    dispatcher: Arc<Dispatcher>,
    config: FeedConfig,
    from_position: u64,
) -> FeedHandle {
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let caught_up = Arc::new(AtomicBool::new(false));
    let position = Arc::new(AtomicU64::new(from_position));

    let task = tokio::spawn(run_feed_loop(
        log,
        dispatcher,
        config,
        Arc::clone(&caught_up),
        Arc::clone(&position),
        shutdown_rx,
    ));

    FeedHandle {
        shutdown_tx,
        caught_up,
        position,
        task: Arc::new(tokio::sync::Mutex::new(Some(task))),
    }
}

async fn run_feed_loop(
    log: Arc<dyn EventLog>,
    dispatcher: Arc<Dispatcher>,
    config: FeedConfig,
    caught_up: Arc<AtomicBool>,
    position: Arc<AtomicU64>,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> Result<(), DispatchError> {
    let mut backoff = config.reconnect_base_delay;

    loop {
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        let from = position.load(Ordering::Acquire);
        tracing::info!(from, "feed: subscribing");
        let mut stream = match log.subscribe_all_from(from).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(%error, "feed: subscribe failed, will retry");
                if sleep_or_shutdown(&mut shutdown_rx, backoff).await {
                    return Ok(());
                }
                backoff = (backoff * 2).min(config.reconnect_max_delay);
                continue;
            }
        };

        // Drive this subscription until it ends, errors, or shutdown.
        let outcome = loop {
            let item = tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return Ok(());
                    }
                    continue;
                }
                item = stream.next() => item,
            };

            match item {
                None => break Ok(()),
                Some(Err(error)) => break Err(error),
                Some(Ok(FeedItem::CaughtUp)) => {
                    tracing::info!("feed: caught up with historical log");
                    caught_up.store(true, Ordering::Release);
                    backoff = config.reconnect_base_delay;
                }
                Some(Ok(FeedItem::Event(record))) => {
                    let next_position = record.global_position + 1;
                    let Some(event) = decode_stored_event(&record) else {
                        tracing::debug!(
                            position = record.global_position,
                            event_type = %record.event_type,
                            "feed: skipping undecodable event"
                        );
                        position.store(next_position, Ordering::Release);
                        continue;
                    };

                    // Offer until admitted; overflow pauses the read side.
                    loop {
                        match dispatcher.dispatch(event.clone()).await {
                            Ok(()) => break,
                            Err(DispatchError::QueueOverflow { depth, max }) => {
                                tracing::warn!(
                                    depth,
                                    max,
                                    "feed: dispatcher queue full, pausing reads"
                                );
                                if sleep_or_shutdown(&mut shutdown_rx, config.overflow_retry_delay)
                                    .await
                                {
                                    return Ok(());
                                }
                            }
                            Err(DispatchError::Canceled) => {
                                tracing::error!("feed: dispatcher canceled, stopping subscription");
                                return Err(DispatchError::Canceled);
                            }
                        }
                    }
                    position.store(next_position, Ordering::Release);
                }
            }
        };

        match outcome {
            Ok(()) => {
                tracing::info!("feed: subscription ended, resubscribing");
            }
            Err(error) => {
                tracing::error!(%error, "feed: subscription error, reconnecting");
                if sleep_or_shutdown(&mut shutdown_rx, backoff).await {
                    return Ok(());
                }
                backoff = (backoff * 2).min(config.reconnect_max_delay);
            }
        }
    }
}

/// Sleep for `delay`, returning `true` if shutdown was signaled meanwhile.
async fn sleep_or_shutdown(
    shutdown_rx: &mut tokio::sync::watch::Receiver<bool>,
    delay: std::time::Duration,
) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => *shutdown_rx.borrow(),
        _ = shutdown_rx.changed() => *shutdown_rx.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ExpectedVersion, ProposedRecord};
    use crate::config::StoreConfig;
    use crate::dispatch::{EventHandler, HandleContext, HandlerRegistry};
    use crate::error::HandlerError;
    use crate::event::{EventDescriptor, StoredEvent};
    use crate::testing::MemoryEventLog;
    use crate::uow::Services;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Counting {
        invocations: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for Counting {
        async fn handle(&self, _: &StoredEvent, _: &HandleContext<'_>) -> Result<(), HandlerError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventHandler for Failing {
        async fn handle(&self, _: &StoredEvent, _: &HandleContext<'_>) -> Result<(), HandlerError> {
            Err(HandlerError::Other("boom".to_string()))
        }
    }

    fn proposed(event_type: &str) -> ProposedRecord {
        let descriptor = EventDescriptor {
            entity_type: "account".to_string(),
            timestamp: chrono::Utc::now(),
            version: 1,
            headers: HashMap::new(),
        };
        ProposedRecord {
            event_id: uuid::Uuid::new_v4(),
            event_type: event_type.to_string(),
            payload: b"{}".to_vec(),
            descriptor: serde_json::to_vec(&descriptor).unwrap(),
        }
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, predicate: F) {
        for _ in 0..500 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn feed_replays_history_then_follows_live_tail() {
        let log = MemoryEventLog::new();
        log.append("s", ExpectedVersion::Any, vec![proposed("Seen")])
            .await
            .unwrap();

        let handler = Arc::new(Counting {
            invocations: AtomicUsize::new(0),
        });
        let mut registry = HandlerRegistry::new();
        registry.register("Seen", Arc::clone(&handler) as Arc<dyn EventHandler>);
        let services = Services::new(Arc::new(log.clone()), StoreConfig::default());
        let dispatcher = Arc::new(Dispatcher::start(services, registry));

        let feed = start_feed(
            Arc::new(log.clone()),
            Arc::clone(&dispatcher),
            FeedConfig::default(),
            0,
        );

        wait_for("historical event", || {
            handler.invocations.load(Ordering::SeqCst) == 1
        })
        .await;
        wait_for("caught-up flag", || feed.is_caught_up()).await;

        // Live tail.
        log.append("s", ExpectedVersion::Any, vec![proposed("Seen")])
            .await
            .unwrap();
        wait_for("live event", || {
            handler.invocations.load(Ordering::SeqCst) == 2
        })
        .await;
        assert_eq!(feed.position(), 2);

        feed.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn feed_paces_itself_under_queue_pressure() {
        let log = MemoryEventLog::new();
        log.append(
            "s",
            ExpectedVersion::Any,
            (0..10).map(|_| proposed("Seen")).collect(),
        )
        .await
        .unwrap();

        let handler = Arc::new(Counting {
            invocations: AtomicUsize::new(0),
        });
        let mut registry = HandlerRegistry::new();
        registry.register("Seen", Arc::clone(&handler) as Arc<dyn EventHandler>);
        // A tiny queue forces overflow rejections along the way.
        let config = StoreConfig {
            parallelism: 1,
            max_processing_queue_size: 2,
            ..StoreConfig::default()
        };
        let services = Services::new(Arc::new(log.clone()), config);
        let dispatcher = Arc::new(Dispatcher::start(services, registry));

        let feed = start_feed(
            Arc::new(log.clone()),
            Arc::clone(&dispatcher),
            FeedConfig {
                overflow_retry_delay: Duration::from_millis(10),
                ..FeedConfig::default()
            },
            0,
        );

        wait_for("all events processed", || {
            handler.invocations.load(Ordering::SeqCst) == 10
        })
        .await;
        feed.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fatal_dispatcher_cancellation_tears_feed_down() {
        let log = MemoryEventLog::new();
        log.append("s", ExpectedVersion::Any, vec![proposed("Doomed")])
            .await
            .unwrap();

        let mut registry = HandlerRegistry::new();
        registry.register("Doomed", Arc::new(Failing));
        let config = StoreConfig {
            max_retries: 0,
            event_drop_is_fatal: true,
            ..StoreConfig::default()
        };
        let services = Services::new(Arc::new(log.clone()), config);
        let dispatcher = Arc::new(Dispatcher::start(services, registry));

        let feed = start_feed(
            Arc::new(log.clone()),
            Arc::clone(&dispatcher),
            FeedConfig::default(),
            0,
        );

        wait_for("dispatcher cancellation", || dispatcher.is_canceled()).await;

        // The next live event makes the feed observe the cancellation and
        // stop; shutdown then surfaces the canceled error.
        log.append("s", ExpectedVersion::Any, vec![proposed("Doomed")])
            .await
            .unwrap();
        for _ in 0..500 {
            let finished = feed
                .task
                .lock()
                .await
                .as_ref()
                .map(|task| task.is_finished())
                .unwrap_or(true);
            if finished {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let result = feed.shutdown().await;
        assert!(matches!(result, Err(DispatchError::Canceled)), "got: {result:?}");
    }
}
