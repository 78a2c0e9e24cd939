//! Repositories: per-unit-of-work hydration and batched commit.
//!
//! A [`Repository`] opens streams, hydrates roots (consulting the snapshot
//! store first), caches everything it touches for the unit of work's
//! lifetime, and commits it all in one pass. An [`EntityRepository`] does
//! the same for entities nested under an aggregate, registering each opened
//! stream as a child of the aggregate's stream so the top-level commit
//! cascades.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::entity::{Root, SharedRoot, Sourced, hydrate};
use crate::error::{RepositoryError, StoreError};
use crate::event::DEFAULT_BUCKET;
use crate::snapshot::Snapshot;
use crate::stream::EventStream;
use crate::uow::Services;

/// Per-aggregate-type repository, scoped to one unit of work.
///
/// Never shared across concurrent message handlers; the interior lock only
/// guards handlers of the same event running in parallel.
pub struct Repository<S: Sourced> {
    services: Services,
    roots: Mutex<HashMap<String, SharedRoot<S>>>,
}

impl<S: Sourced> std::fmt::Debug for Repository<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("entity_type", &S::ENTITY_TYPE)
            .finish()
    }
}

impl<S: Sourced> Repository<S> {
    pub(crate) fn new(services: Services) -> Self {
        Self {
            services,
            roots: Mutex::new(HashMap::new()),
        }
    }

    /// [`get_in`](Self::get_in) on the default bucket.
    pub async fn get(&self, id: &str) -> Result<Option<SharedRoot<S>>, StoreError> {
        self.get_in(DEFAULT_BUCKET, id).await
    }

    /// Hydrate the instance with the given id, or `None` if no stream
    /// exists for it.
    ///
    /// Consults the repository's own cache first (the same id is never
    /// opened twice within one unit of work), then the snapshot store, then
    /// replays committed events from just past the snapshot -- or from the
    /// beginning when there is none.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on transport failure or undecodable history.
    pub async fn get_in(&self, bucket: &str, id: &str) -> Result<Option<SharedRoot<S>>, StoreError> {
        let key = self.services.store.stream_name(S::ENTITY_TYPE, bucket, id);
        {
            let roots = self.roots.lock().await;
            if let Some(cached) = roots.get(&key) {
                return Ok(Some(Arc::clone(cached)));
            }
        }

        tracing::debug!(entity_type = S::ENTITY_TYPE, bucket, id, "hydrating");
        let snapshot = self.services.snapshots.load(S::ENTITY_TYPE, bucket, id).await?;
        let from = snapshot.as_ref().map(|s| s.version + 1);
        let stream = self
            .services
            .store
            .get_stream(S::ENTITY_TYPE, bucket, id, from)
            .await?;
        if !stream.exists() {
            return Ok(None);
        }

        let root = hydrate::<S>(
            id.to_string(),
            bucket.to_string(),
            None,
            stream,
            snapshot,
            self.services.clone(),
        );
        let shared = Arc::new(Mutex::new(root));
        self.roots.lock().await.insert(key, Arc::clone(&shared));
        Ok(Some(shared))
    }

    /// [`create_in`](Self::create_in) on the default bucket.
    pub async fn create(&self, id: &str) -> SharedRoot<S> {
        self.create_in(DEFAULT_BUCKET, id).await
    }

    /// Open a fresh instance with no read of prior events.
    ///
    /// Duplicate creation is not checked eagerly: if the id already has
    /// committed events, the commit at unit-of-work end fails with a
    /// conflict rather than this call failing.
    pub async fn create_in(&self, bucket: &str, id: &str) -> SharedRoot<S> {
        let key = self.services.store.stream_name(S::ENTITY_TYPE, bucket, id);
        let stream = self.services.store.new_stream(S::ENTITY_TYPE, bucket, id);
        let root = Root::new(
            id.to_string(),
            bucket.to_string(),
            None,
            S::default(),
            stream.into_shared(),
            self.services.clone(),
        );
        let shared = Arc::new(Mutex::new(root));
        self.roots.lock().await.insert(key, Arc::clone(&shared));
        shared
    }

    /// [`query_in`](Self::query_in) on the default bucket.
    pub async fn query<P>(&self, predicate: P) -> Result<Vec<SharedRoot<S>>, StoreError>
    where
        P: Fn(&serde_json::Value) -> bool,
    {
        self.query_in(DEFAULT_BUCKET, predicate).await
    }

    /// Hydrate every instance whose latest memento matches the predicate.
    ///
    /// The log itself is only queryable by stream identity, so this is a
    /// snapshot-index query: instances created but never snapshotted are
    /// invisible here even though their events exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on transport failure.
    pub async fn query_in<P>(&self, bucket: &str, predicate: P) -> Result<Vec<SharedRoot<S>>, StoreError>
    where
        P: Fn(&serde_json::Value) -> bool,
    {
        let snapshots = self
            .services
            .snapshots
            .query(S::ENTITY_TYPE, bucket, predicate)
            .await?;
        let mut matches = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            if let Some(root) = self.get_in(bucket, &snapshot.id).await? {
                matches.push(root);
            }
        }
        Ok(matches)
    }

    /// Commit every stream opened through this repository, staging
    /// snapshots for roots whose policy fires.
    ///
    /// All streams are attempted even after a failure; the aggregate error
    /// enumerates each failed stream alongside the ones that landed.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::CommitFailed`] if any stream commit
    /// failed.
    pub(crate) async fn commit(
        &self,
        commit_id: Uuid,
        headers: &HashMap<String, String>,
    ) -> Result<(), RepositoryError> {
        let roots: Vec<(String, SharedRoot<S>)> = {
            let map = self.roots.lock().await;
            map.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect()
        };

        let mut succeeded = Vec::new();
        let mut failures = Vec::new();
        for (key, root) in roots {
            let stream = Arc::clone(root.lock().await.stream());
            match EventStream::commit(&stream, commit_id, headers).await {
                Ok(()) => {
                    succeeded.push(key);
                    let guard = root.lock().await;
                    let version = stream.lock().await.committed_version();
                    if guard.aggregate_id().is_none()
                        && guard.state().should_snapshot(version)
                        && let Some(memento) = guard.state().snapshot()
                    {
                        self.services.snapshots.add(
                            S::ENTITY_TYPE,
                            guard.bucket(),
                            Snapshot {
                                id: guard.id().to_string(),
                                version,
                                memento,
                            },
                        );
                    }
                }
                Err(e) => failures.push((key, e)),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(RepositoryError::CommitFailed { succeeded, failures })
        }
    }
}

/// Repository for entities nested under one aggregate instance.
///
/// Entity stream identity is derived deterministically from the owning
/// aggregate's id, the entity type, and the entity's own id, so the same
/// pair always maps to the same stream regardless of who opens it. Opened
/// streams become children of the aggregate's stream: a single top-level
/// commit cascades to all of them, children first.
pub struct EntityRepository<E: Sourced> {
    aggregate_id: String,
    bucket: String,
    aggregate_stream: crate::stream::SharedStream,
    services: Services,
    roots: Mutex<HashMap<String, SharedRoot<E>>>,
}

impl<E: Sourced> std::fmt::Debug for EntityRepository<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRepository")
            .field("entity_type", &E::ENTITY_TYPE)
            .field("aggregate_id", &self.aggregate_id)
            .finish()
    }
}

impl<E: Sourced> EntityRepository<E> {
    pub(crate) fn new(
        aggregate_id: String,
        bucket: String,
        aggregate_stream: crate::stream::SharedStream,
        services: Services,
    ) -> Self {
        Self {
            aggregate_id,
            bucket,
            aggregate_stream,
            services,
            roots: Mutex::new(HashMap::new()),
        }
    }

    /// The derived stream id for an entity: `"{aggregate_id}.{entity_id}"`.
    fn derived_id(&self, id: &str) -> String {
        format!("{}.{id}", self.aggregate_id)
    }

    /// Hydrate the entity with the given id, or `None` if no stream exists.
    ///
    /// The opened stream is registered as a child of the aggregate's
    /// stream.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on transport failure or undecodable history.
    pub async fn get(&self, id: &str) -> Result<Option<SharedRoot<E>>, StoreError> {
        let derived = self.derived_id(id);
        let key = self
            .services
            .store
            .stream_name(E::ENTITY_TYPE, &self.bucket, &derived);
        {
            let roots = self.roots.lock().await;
            if let Some(cached) = roots.get(&key) {
                return Ok(Some(Arc::clone(cached)));
            }
        }

        tracing::debug!(
            entity_type = E::ENTITY_TYPE,
            aggregate_id = %self.aggregate_id,
            id,
            "hydrating entity"
        );
        let snapshot = self
            .services
            .snapshots
            .load(E::ENTITY_TYPE, &self.bucket, &derived)
            .await?;
        let from = snapshot.as_ref().map(|s| s.version + 1);
        let stream = self
            .services
            .store
            .get_stream(E::ENTITY_TYPE, &self.bucket, &derived, from)
            .await?;
        if !stream.exists() {
            return Ok(None);
        }

        let root = hydrate::<E>(
            derived,
            self.bucket.clone(),
            Some(self.aggregate_id.clone()),
            stream,
            snapshot,
            self.services.clone(),
        );
        let shared = Arc::new(Mutex::new(root));
        self.aggregate_stream
            .lock()
            .await
            .add_child(Arc::clone(shared.lock().await.stream()));
        self.roots.lock().await.insert(key, Arc::clone(&shared));
        Ok(Some(shared))
    }

    /// Open a fresh entity with no read of prior events, registered as a
    /// child of the aggregate's stream. Duplicates surface as commit
    /// conflicts, as with [`Repository::create`].
    pub async fn create(&self, id: &str) -> SharedRoot<E> {
        let derived = self.derived_id(id);
        let key = self
            .services
            .store
            .stream_name(E::ENTITY_TYPE, &self.bucket, &derived);
        let stream = self
            .services
            .store
            .new_stream(E::ENTITY_TYPE, &self.bucket, &derived)
            .into_shared();
        self.aggregate_stream.lock().await.add_child(Arc::clone(&stream));

        let root = Root::new(
            derived,
            self.bucket.clone(),
            Some(self.aggregate_id.clone()),
            E::default(),
            stream,
            self.services.clone(),
        );
        let shared = Arc::new(Mutex::new(root));
        self.roots.lock().await.insert(key, Arc::clone(&shared));
        shared
    }

    /// Hydrate this aggregate's entities whose latest memento matches the
    /// predicate. Same snapshot-index visibility rules as
    /// [`Repository::query`]; mementos belonging to other aggregates are
    /// filtered out by the derived-id prefix.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on transport failure.
    pub async fn query<P>(&self, predicate: P) -> Result<Vec<SharedRoot<E>>, StoreError>
    where
        P: Fn(&serde_json::Value) -> bool,
    {
        let snapshots = self
            .services
            .snapshots
            .query(E::ENTITY_TYPE, &self.bucket, predicate)
            .await?;
        let prefix = format!("{}.", self.aggregate_id);
        let mut matches = Vec::new();
        for snapshot in snapshots {
            if let Some(entity_id) = snapshot.id.strip_prefix(&prefix)
                && let Some(root) = self.get(entity_id).await?
            {
                matches.push(root);
            }
        }
        Ok(matches)
    }
}
