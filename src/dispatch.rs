//! Dispatcher: delivers stored events to in-process handlers under a
//! bounded-queue, worker-pool, retry/backoff discipline.
//!
//! Admission is explicit backpressure: past the configured queue size,
//! [`Dispatcher::dispatch`] rejects immediately with a queue-overflow error
//! for the upstream consumer to act on; past half capacity, submitters are
//! progressively slowed instead. Each event is processed inside a fresh
//! [`UnitOfWork`] per attempt, so an optimistic-concurrency conflict during
//! commit triggers full reprocessing with fresh hydration rather than a
//! blind retry of stale staged state.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::StoreConfig;
use crate::error::{DispatchError, HandlerError, WorkError};
use crate::event::{EventDescriptor, StoredEvent};
use crate::uow::{Services, UnitOfWork};

/// How long the half-capacity warning stays armed before it may fire again.
const BACKPRESSURE_WARN_REARM: Duration = Duration::from_secs(30);

/// Maximum characters of serialized payload included in diagnostics.
const PAYLOAD_LOG_LIMIT: usize = 512;

/// Context handed to each handler invocation.
pub struct HandleContext<'a> {
    descriptor: &'a EventDescriptor,
    uow: &'a UnitOfWork,
}

impl<'a> HandleContext<'a> {
    /// The descriptor of the event being handled.
    pub fn descriptor(&self) -> &EventDescriptor {
        self.descriptor
    }

    /// The unit of work scoping this event's processing. Repositories
    /// obtained here commit (or abstain) together at attempt end.
    pub fn unit_of_work(&self) -> &'a UnitOfWork {
        self.uow
    }
}

/// An in-process event handler.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one stored event.
    ///
    /// Return [`HandlerError::Retry`] to be re-invoked (bounded, no delay);
    /// any other error fails the whole processing attempt and enters the
    /// outer event-level retry.
    async fn handle(&self, event: &StoredEvent, ctx: &HandleContext<'_>) -> Result<(), HandlerError>;
}

/// Static registration of handlers by event type tag.
///
/// Registration is per process and happens before the dispatcher starts;
/// there is no runtime probing.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Vec<Arc<dyn EventHandler>>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an event type tag (e.g. `"Renamed"`).
    /// Multiple handlers per tag are allowed.
    pub fn register(&mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.handlers.entry(event_type.into()).or_default().push(handler);
    }

    /// All handlers for an event type, empty if none are registered.
    pub fn resolve(&self, event_type: &str) -> Vec<Arc<dyn EventHandler>> {
        self.handlers.get(event_type).cloned().unwrap_or_default()
    }

    /// Number of event types with at least one handler.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handlers are registered at all.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// A failed processing attempt, private to the retry loop.
#[derive(Debug, thiserror::Error)]
enum AttemptError {
    /// A handler exhausted its retry budget. Not re-entered into the outer
    /// retry: the handler already had its chances.
    #[error("handler retries exhausted: {0}")]
    HandlerExhausted(String),

    /// A handler failed outright.
    #[error("handler failed: {0}")]
    Handler(String),

    /// The unit-of-work commit failed (conflict, persistence, snapshots).
    #[error(transparent)]
    Work(WorkError),
}

struct Inner {
    services: Services,
    registry: HandlerRegistry,
    config: Arc<StoreConfig>,
    /// Queued plus in-flight events.
    depth: AtomicUsize,
    paused_tx: watch::Sender<bool>,
    canceled_tx: watch::Sender<bool>,
    /// When the half-capacity warning last fired, if still armed.
    warned: StdMutex<Option<Instant>>,
    /// Event types with zero registered handlers; skipped without
    /// resolution. Cleared only by [`Dispatcher::clear_no_handler_cache`]
    /// or process restart.
    no_handlers: StdRwLock<HashSet<String>>,
    /// Event types whose last attempt exceeded the slow threshold; logged
    /// verbosely until one completes quickly again.
    slow_events: StdRwLock<HashSet<String>>,
}

/// Bounded, backpressured, retrying concurrent dispatch engine.
pub struct Dispatcher {
    inner: Arc<Inner>,
    queue_tx: mpsc::Sender<StoredEvent>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("depth", &self.depth())
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl Dispatcher {
    /// Start the worker pool and return the dispatch handle.
    ///
    /// Worker count, queue bounds, retry budgets, and the slow threshold
    /// all come from `services.config`.
    pub fn start(services: Services, registry: HandlerRegistry) -> Self {
        let config = Arc::clone(&services.config);
        let (queue_tx, queue_rx) = mpsc::channel(config.max_processing_queue_size.max(1));
        let (paused_tx, _) = watch::channel(false);
        let (canceled_tx, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            services,
            registry,
            config: Arc::clone(&config),
            depth: AtomicUsize::new(0),
            paused_tx,
            canceled_tx,
            warned: StdMutex::new(None),
            no_handlers: StdRwLock::new(HashSet::new()),
            slow_events: StdRwLock::new(HashSet::new()),
        });

        let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));
        let workers = (0..config.parallelism.max(1))
            .map(|worker| {
                let inner = Arc::clone(&inner);
                let queue_rx = Arc::clone(&queue_rx);
                tokio::spawn(worker_loop(worker, inner, queue_rx))
            })
            .collect();

        Self {
            inner,
            queue_tx,
            workers,
        }
    }

    /// Submit a stored event for processing.
    ///
    /// At or above the configured queue size the submission is rejected
    /// immediately -- this is the backpressure signal for the upstream
    /// consumer to pause its source, never a blocking wait. Above half
    /// capacity, the call sleeps proportionally to queue depth before
    /// enqueueing, smoothing bursts.
    ///
    /// # Errors
    ///
    /// * [`DispatchError::QueueOverflow`] -- queue at capacity.
    /// * [`DispatchError::Canceled`] -- the dispatcher was torn down after
    ///   a fatal event drop.
    pub async fn dispatch(&self, event: StoredEvent) -> Result<(), DispatchError> {
        if *self.inner.canceled_tx.borrow() {
            return Err(DispatchError::Canceled);
        }

        let max = self.inner.config.max_processing_queue_size;
        let depth = self.inner.depth.load(Ordering::SeqCst);
        if depth >= max {
            return Err(DispatchError::QueueOverflow { depth, max });
        }

        if depth > max / 2 {
            let first = {
                let mut warned = self.inner.warned.lock().expect("warned lock poisoned");
                if warned.is_none() {
                    *warned = Some(Instant::now());
                    true
                } else {
                    false
                }
            };
            if first {
                tracing::warn!(
                    depth,
                    max,
                    "processing queue growing large; slowing submissions"
                );
            }
            // Progressively wait longer as the queue grows.
            tokio::time::sleep(Duration::from_millis((depth / 2) as u64)).await;
        } else {
            let mut warned = self.inner.warned.lock().expect("warned lock poisoned");
            if let Some(at) = *warned
                && at.elapsed() > BACKPRESSURE_WARN_REARM
            {
                *warned = None;
            }
        }

        tracing::debug!(
            event_type = %event.event_type,
            position = event.global_position,
            depth,
            max,
            "queueing event"
        );
        self.inner.depth.fetch_add(1, Ordering::SeqCst);
        match self.queue_tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.inner.depth.fetch_sub(1, Ordering::SeqCst);
                Err(DispatchError::QueueOverflow {
                    depth: self.inner.depth.load(Ordering::SeqCst),
                    max,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.inner.depth.fetch_sub(1, Ordering::SeqCst);
                Err(DispatchError::Canceled)
            }
        }
    }

    /// Stop (or restart) workers pulling new queue entries. In-flight work
    /// always completes; there is no mid-flight cancellation.
    pub fn pause(&self, paused: bool) {
        tracing::info!(paused, "dispatcher pause switch");
        self.inner.paused_tx.send_replace(paused);
    }

    /// Whether the dispatcher was torn down after a fatal event drop.
    pub fn is_canceled(&self) -> bool {
        *self.inner.canceled_tx.borrow()
    }

    /// Queued plus in-flight events.
    pub fn depth(&self) -> usize {
        self.inner.depth.load(Ordering::SeqCst)
    }

    /// Forget remembered no-handler event types, forcing re-resolution.
    /// Only needed if handler registration can change at runtime.
    pub fn clear_no_handler_cache(&self) {
        self.inner
            .no_handlers
            .write()
            .expect("no-handlers lock poisoned")
            .clear();
    }

    /// Wait until no events are queued or in flight.
    pub async fn wait_idle(&self) {
        while self.depth() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Drain the queue and stop the workers.
    pub async fn shutdown(self) {
        let Self {
            inner,
            queue_tx,
            workers,
        } = self;
        // Workers exit when the closed channel runs dry; unpause so a
        // paused pool can drain.
        inner.paused_tx.send_replace(false);
        drop(queue_tx);
        for worker in workers {
            let _ = worker.await;
        }
    }
}

async fn worker_loop(
    worker: usize,
    inner: Arc<Inner>,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<StoredEvent>>>,
) {
    let mut paused_rx = inner.paused_tx.subscribe();
    let mut canceled_rx = inner.canceled_tx.subscribe();

    loop {
        if *canceled_rx.borrow() {
            break;
        }
        while *paused_rx.borrow() {
            if paused_rx.changed().await.is_err() {
                return;
            }
        }

        let event = {
            let mut rx = queue.lock().await;
            tokio::select! {
                event = rx.recv() => event,
                _ = canceled_rx.changed() => continue,
                _ = paused_rx.changed() => continue,
            }
        };
        let Some(event) = event else { break };

        process(&inner, event).await;
        inner.depth.fetch_sub(1, Ordering::SeqCst);
    }
    tracing::debug!(worker, "dispatcher worker exiting");
}

/// Process one event to completion: resolve handlers, run attempts under
/// fresh units of work, retry with backoff, and apply the exhaustion
/// policy.
async fn process(inner: &Arc<Inner>, event: StoredEvent) {
    let event_type = event.event_type.clone();

    if inner
        .no_handlers
        .read()
        .expect("no-handlers lock poisoned")
        .contains(&event_type)
    {
        tracing::debug!(%event_type, "skipping event type with no handlers");
        return;
    }

    if inner
        .slow_events
        .read()
        .expect("slow-events lock poisoned")
        .contains(&event_type)
    {
        tracing::info!(
            %event_type,
            payload = %truncate_payload(&event.payload),
            "event type previously detected as slow; logging verbosely"
        );
    }

    let handlers = inner.registry.resolve(&event_type);
    if handlers.is_empty() {
        tracing::debug!(%event_type, "no handlers registered; remembering event type");
        inner
            .no_handlers
            .write()
            .expect("no-handlers lock poisoned")
            .insert(event_type);
        return;
    }

    let config = &inner.config;
    let max_retries = config.max_retries;
    let mut retries: i32 = 0;
    let outcome = loop {
        let uow = UnitOfWork::begin(inner.services.clone(), &event.descriptor.headers);
        let started = Instant::now();
        let handled = run_handlers(&handlers, &event, &uow, config).await;
        let handler_elapsed = started.elapsed();

        if handler_elapsed > config.slow_alert_threshold {
            tracing::warn!(
                %event_type,
                elapsed_ms = handler_elapsed.as_millis() as u64,
                payload = %truncate_payload(&event.payload),
                "slow event processing"
            );
            inner
                .slow_events
                .write()
                .expect("slow-events lock poisoned")
                .insert(event_type.clone());
        } else if inner
            .slow_events
            .read()
            .expect("slow-events lock poisoned")
            .contains(&event_type)
        {
            inner
                .slow_events
                .write()
                .expect("slow-events lock poisoned")
                .remove(&event_type);
            tracing::info!(%event_type, "event completed quickly; resetting verbose logging");
        }

        let attempt = match handled {
            Ok(()) => {
                let commit_started = Instant::now();
                let result = uow.end(None).await.map_err(AttemptError::Work);
                let commit_elapsed = commit_started.elapsed();
                if commit_elapsed > config.slow_alert_threshold {
                    tracing::warn!(
                        %event_type,
                        elapsed_ms = commit_elapsed.as_millis() as u64,
                        "slow unit-of-work commit"
                    );
                }
                result
            }
            Err(error) => {
                if let Err(end_error) = uow.end(Some(&error)).await {
                    tracing::warn!(%end_error, "unit of work end failed after handler error");
                }
                Err(error)
            }
        };

        match attempt {
            Ok(()) => break Ok(()),
            Err(error @ AttemptError::HandlerExhausted(_)) => break Err(error),
            Err(error) => {
                retries += 1;
                if max_retries != -1 && retries > max_retries {
                    break Err(error);
                }
                tracing::debug!(
                    %event_type,
                    retry = retries,
                    max_retries,
                    %error,
                    payload = %truncate_payload(&event.payload),
                    "error while processing event; retrying"
                );
                tokio::time::sleep(Duration::from_millis(75 * (retries as u64 / 2))).await;
            }
        }
    };

    if let Err(error) = outcome {
        tracing::error!(
            %event_type,
            %error,
            payload = %truncate_payload(&event.payload),
            "ran out of retries; dropping event"
        );
        if config.event_drop_is_fatal {
            tracing::error!(%event_type, "event drop is fatal; canceling dispatcher");
            inner.canceled_tx.send_replace(true);
        }
    }
}

/// Run every handler for one event, concurrently or sequentially per
/// configuration.
async fn run_handlers(
    handlers: &[Arc<dyn EventHandler>],
    event: &StoredEvent,
    uow: &UnitOfWork,
    config: &StoreConfig,
) -> Result<(), AttemptError> {
    let ctx = HandleContext {
        descriptor: &event.descriptor,
        uow,
    };

    if config.parallel_handlers {
        let results = futures_util::future::join_all(
            handlers.iter().map(|handler| run_one(handler, event, &ctx, config)),
        )
        .await;
        for result in results {
            result?;
        }
        Ok(())
    } else {
        for handler in handlers {
            run_one(handler, event, &ctx, config).await?;
        }
        Ok(())
    }
}

/// Run one handler with its bounded, delay-free retry loop.
async fn run_one(
    handler: &Arc<dyn EventHandler>,
    event: &StoredEvent,
    ctx: &HandleContext<'_>,
    config: &StoreConfig,
) -> Result<(), AttemptError> {
    let max_retries = config.max_retries;
    let mut handler_retries: i32 = 0;
    loop {
        let started = Instant::now();
        match handler.handle(event, ctx).await {
            Ok(()) => {
                let elapsed = started.elapsed();
                if elapsed > config.slow_alert_threshold {
                    tracing::warn!(
                        event_type = %event.event_type,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "slow handler execution"
                    );
                }
                return Ok(());
            }
            Err(HandlerError::Retry(reason)) => {
                tracing::info!(
                    event_type = %event.event_type,
                    retry = handler_retries,
                    max_retries,
                    %reason,
                    "handler requested retry"
                );
                if max_retries != -1 && handler_retries >= max_retries {
                    return Err(AttemptError::HandlerExhausted(reason));
                }
                handler_retries += 1;
            }
            Err(HandlerError::Other(message)) => return Err(AttemptError::Handler(message)),
        }
    }
}

/// Serialized payload capped for log output.
fn truncate_payload(payload: &serde_json::Value) -> String {
    let mut text = payload.to_string();
    if let Some((index, _)) = text.char_indices().nth(PAYLOAD_LOG_LIMIT) {
        text.truncate(index);
        text.push('…');
    }
    text
}
