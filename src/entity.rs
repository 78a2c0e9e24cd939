//! Aggregates and entities: the [`Sourced`] trait and the hydrated
//! [`Root`] wrapper.
//!
//! A domain type implements [`Sourced`] to describe how events fold into
//! state; the framework wraps it in a [`Root`] that carries the identity,
//! the backing stream, and the service handles. Roots never talk to storage
//! directly -- `apply` stages events on the attached stream, and commits
//! happen at unit-of-work end.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use crate::event::{decode_domain_event, encode_domain_event};
use crate::repository::EntityRepository;
use crate::snapshot::Snapshot;
use crate::stream::{EventStream, SharedStream};
use crate::uow::Services;

/// A domain object whose state is derived from an event stream.
///
/// The implementing type itself is the state; it is built by folding domain
/// events through [`apply`](Sourced::apply), starting from `Default` (or a
/// restored snapshot).
///
/// # Contract
///
/// - [`apply`](Sourced::apply) must be pure and total: no I/O, no failure.
///   The match over the event enum is the static event-routing table.
/// - The snapshot methods default to "never snapshots". Override all three
///   to opt in; `restore` must invert `snapshot`.
pub trait Sourced: Default + Send + Sync + 'static {
    /// Identifies this entity type (e.g. "order"). Part of every stream
    /// name and event descriptor.
    const ENTITY_TYPE: &'static str;

    /// The set of events this type produces and applies. Must use
    /// adjacently tagged serde (`#[serde(tag = "type", content = "data")]`).
    type DomainEvent: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Fold a single event into the state.
    fn apply(&mut self, event: &Self::DomainEvent);

    /// Whether a snapshot should be taken at the given stream version.
    fn should_snapshot(&self, version: i64) -> bool {
        let _ = version;
        false
    }

    /// Serialize the current state as a memento, or `None` for types that
    /// do not snapshot.
    fn snapshot(&self) -> Option<serde_json::Value> {
        None
    }

    /// Restore state from a memento taken by [`snapshot`](Sourced::snapshot).
    fn restore(&mut self, memento: &serde_json::Value) {
        let _ = memento;
    }
}

/// A hydrated instance behind the shared handle used by repositories and
/// handlers.
pub type SharedRoot<S> = Arc<Mutex<Root<S>>>;

/// A hydrated domain object: identity, state, backing stream, and service
/// handles.
///
/// Constructed only by repositories. All context arrives here as explicit
/// fields at construction; there is no capability probing.
pub struct Root<S: Sourced> {
    id: String,
    bucket: String,
    /// Owning aggregate id for entity roots, `None` for aggregates.
    aggregate_id: Option<String>,
    state: S,
    stream: SharedStream,
    services: Services,
    /// Entity repositories opened through this root, one per entity type.
    entity_repos: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl<S: Sourced> std::fmt::Debug for Root<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Root")
            .field("entity_type", &S::ENTITY_TYPE)
            .field("id", &self.id)
            .field("bucket", &self.bucket)
            .field("aggregate_id", &self.aggregate_id)
            .finish()
    }
}

impl<S: Sourced> Root<S> {
    pub(crate) fn new(
        id: String,
        bucket: String,
        aggregate_id: Option<String>,
        state: S,
        stream: SharedStream,
        services: Services,
    ) -> Self {
        Self {
            id,
            bucket,
            aggregate_id,
            state,
            stream,
            services,
            entity_repos: HashMap::new(),
        }
    }

    /// The instance identifier within its entity type.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The namespace partition the backing stream lives in.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// The owning aggregate id, for entity roots.
    pub fn aggregate_id(&self) -> Option<&str> {
        self.aggregate_id.as_deref()
    }

    /// The current state.
    pub fn state(&self) -> &S {
        &self.state
    }

    /// The backing stream.
    pub fn stream(&self) -> &SharedStream {
        &self.stream
    }

    /// Committed version plus staged events.
    pub async fn version(&self) -> i64 {
        self.stream.lock().await.stream_version()
    }

    /// Version confirmed durable on the remote log.
    pub async fn committed_version(&self) -> i64 {
        self.stream.lock().await.committed_version()
    }

    /// Execute a state transition and stage the corresponding event.
    ///
    /// Folds the event into the local state via [`Sourced::apply`] and
    /// stages it on the backing stream with the next local version. Nothing
    /// touches the remote log until the unit of work commits.
    ///
    /// Entity roots additionally stage a snapshot here when their policy
    /// fires; aggregate snapshots are staged at repository commit instead.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the event cannot be serialized.
    pub async fn apply(&mut self, event: S::DomainEvent) -> serde_json::Result<()> {
        let (event_type, payload) = encode_domain_event(&event)?;
        self.state.apply(&event);

        let version = {
            let mut stream = self.stream.lock().await;
            stream.add(S::ENTITY_TYPE, event_type, payload, HashMap::new());
            stream.stream_version()
        };

        if self.aggregate_id.is_some()
            && self.state.should_snapshot(version)
            && let Some(memento) = self.state.snapshot()
        {
            self.services.snapshots.add(
                S::ENTITY_TYPE,
                &self.bucket,
                Snapshot {
                    id: self.id.clone(),
                    version,
                    memento,
                },
            );
        }
        Ok(())
    }

    /// The repository for entities of type `E` nested under this aggregate.
    ///
    /// Cached per entity type for the root's lifetime, so the same
    /// aggregate+entity pair always resolves to the same opened streams
    /// within one unit of work.
    pub fn entity<E: Sourced>(&mut self) -> Arc<EntityRepository<E>> {
        let key = TypeId::of::<E>();
        if let Some(existing) = self.entity_repos.get(&key)
            && let Ok(repo) = Arc::clone(existing).downcast::<EntityRepository<E>>()
        {
            return repo;
        }

        let repo = Arc::new(EntityRepository::<E>::new(
            self.id.clone(),
            self.bucket.clone(),
            Arc::clone(&self.stream),
            self.services.clone(),
        ));
        self.entity_repos.insert(key, Arc::clone(&repo) as Arc<dyn Any + Send + Sync>);
        repo
    }
}

/// Construct a root by restoring an optional snapshot and replaying the
/// stream's committed events in order.
///
/// Unknown event types are skipped with a warning for forward
/// compatibility.
pub(crate) fn hydrate<S: Sourced>(
    id: String,
    bucket: String,
    aggregate_id: Option<String>,
    stream: EventStream,
    snapshot: Option<Snapshot>,
    services: Services,
) -> Root<S> {
    let mut state = S::default();
    if let Some(snapshot) = &snapshot {
        state.restore(&snapshot.memento);
    }

    for event in stream.events() {
        match decode_domain_event::<S::DomainEvent>(&event.event_type, &event.payload) {
            Some(domain_event) => state.apply(&domain_event),
            None => tracing::warn!(
                entity_type = S::ENTITY_TYPE,
                event_type = %event.event_type,
                version = event.descriptor.version,
                "skipping unknown event during replay"
            ),
        }
    }

    Root::new(id, bucket, aggregate_id, state, stream.into_shared(), services)
}
