//! Unit of work: the transactional scope of one inbound message.
//!
//! A [`UnitOfWork`] captures provenance headers from the inbound message,
//! hands out lazily-created per-type repositories, and finalizes at message
//! boundary: commit on success, abstention on failure. There is no
//! compensating rollback against the remote log -- staged events that were
//! never written are simply dropped.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::client::EventLog;
use crate::cache::StreamCache;
use crate::config::StoreConfig;
use crate::entity::Sourced;
use crate::error::{RepositoryError, WorkError};
use crate::event::{StreamNameGenerator, default_stream_name};
use crate::repository::Repository;
use crate::snapshot::SnapshotStore;
use crate::store::StoreClient;

/// Prefix under which carry-over headers from the inbound message are
/// re-keyed.
pub const PREFIX_HEADER: &str = "Originating";

/// Work-header key holding the inbound message id.
pub const MESSAGE_ID_HEADER: &str = "Originating.MessageId";

/// Header naming the commit identifier, both on inbound messages (explicit
/// idempotency across redelivery) and on every committed event.
pub const COMMIT_ID_HEADER: &str = "CommitId";

/// Placeholder recorded for a carry-over header the inbound message lacked.
pub const NOT_FOUND: &str = "<NOT FOUND>";

/// Inbound headers copied forward under the [`PREFIX_HEADER`] namespace so
/// events produced downstream carry full provenance.
pub const CARRY_OVER_HEADERS: [&str; 5] = [
    "MessageId",
    "CorrelationId",
    "CausationId",
    "TimeSent",
    "ConversationId",
];

/// The fixed dependency bundle handed to repositories and roots.
///
/// Clone is cheap; all fields are `Arc`-wrapped.
#[derive(Clone)]
pub struct Services {
    /// Typed access to the append-only log.
    pub store: Arc<StoreClient>,
    /// Memento persistence.
    pub snapshots: Arc<SnapshotStore>,
    /// Shared configuration.
    pub config: Arc<StoreConfig>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services").finish()
    }
}

impl Services {
    /// Wire up the bundle over an event log with the default stream naming.
    pub fn new(log: Arc<dyn EventLog>, config: StoreConfig) -> Self {
        Self::with_names(log, config, default_stream_name)
    }

    /// Wire up the bundle with a custom stream-name generator.
    pub fn with_names(
        log: Arc<dyn EventLog>,
        config: StoreConfig,
        names: StreamNameGenerator,
    ) -> Self {
        let config = Arc::new(config);
        let store = Arc::new(StoreClient::new(
            log,
            StreamCache::new(),
            names,
            Arc::clone(&config),
        ));
        Self {
            snapshots: Arc::new(SnapshotStore::new(Arc::clone(&store))),
            store,
            config,
        }
    }
}

/// Type-erased commit hook, one per repository the unit of work created.
#[async_trait]
trait CommitRepository: Send + Sync {
    async fn commit(
        &self,
        commit_id: Uuid,
        headers: HashMap<String, String>,
    ) -> Result<(), RepositoryError>;
}

#[async_trait]
impl<S: Sourced> CommitRepository for Repository<S> {
    async fn commit(
        &self,
        commit_id: Uuid,
        headers: HashMap<String, String>,
    ) -> Result<(), RepositoryError> {
        Repository::commit(self, commit_id, &headers).await
    }
}

/// A repository entry: the typed handle for downcasting plus the erased
/// commit hook, both pointing at the same instance.
struct RepoEntry {
    typed: Arc<dyn Any + Send + Sync>,
    committer: Arc<dyn CommitRepository>,
}

/// Exactly one inbound message's worth of work.
///
/// Created per message; never shared across concurrent message handlers.
/// The interior lock on the repository map only exists so handlers of the
/// same event may run in parallel.
pub struct UnitOfWork {
    services: Services,
    work_headers: HashMap<String, String>,
    repositories: Mutex<HashMap<TypeId, RepoEntry>>,
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("work_headers", &self.work_headers)
            .finish()
    }
}

impl UnitOfWork {
    /// Begin a unit of work, capturing provenance from the inbound
    /// message's headers.
    ///
    /// Each [`CARRY_OVER_HEADERS`] key is re-keyed under the
    /// `Originating.` prefix (with [`NOT_FOUND`] when absent); remaining
    /// user headers are copied verbatim, minus internal ones (`$`-prefixed
    /// and already-prefixed keys).
    pub fn begin(services: Services, incoming_headers: &HashMap<String, String>) -> Self {
        let mut work_headers = HashMap::new();
        for header in CARRY_OVER_HEADERS {
            let value = incoming_headers
                .get(header)
                .filter(|v| !v.is_empty())
                .map(String::as_str)
                .unwrap_or(NOT_FOUND);
            work_headers.insert(format!("{PREFIX_HEADER}.{header}"), value.to_string());
        }

        for (key, value) in incoming_headers {
            if CARRY_OVER_HEADERS.contains(&key.as_str())
                || key.starts_with('$')
                || key.starts_with(PREFIX_HEADER)
            {
                continue;
            }
            work_headers.insert(key.clone(), value.clone());
        }

        Self {
            services,
            work_headers,
            repositories: Mutex::new(HashMap::new()),
        }
    }

    /// The headers every commit in this unit of work will carry.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.work_headers
    }

    /// The service bundle this unit of work operates on.
    pub fn services(&self) -> &Services {
        &self.services
    }

    /// The repository for aggregate type `S`, created lazily and cached by
    /// type for the life of the unit of work.
    pub async fn repository<S: Sourced>(&self) -> Arc<Repository<S>> {
        let mut repositories = self.repositories.lock().await;
        if let Some(entry) = repositories.get(&TypeId::of::<S>())
            && let Ok(repo) = Arc::clone(&entry.typed).downcast::<Repository<S>>()
        {
            return repo;
        }

        tracing::debug!(entity_type = S::ENTITY_TYPE, "creating repository");
        let repo = Arc::new(Repository::<S>::new(self.services.clone()));
        repositories.insert(
            TypeId::of::<S>(),
            RepoEntry {
                typed: Arc::clone(&repo) as Arc<dyn Any + Send + Sync>,
                committer: Arc::clone(&repo) as Arc<dyn CommitRepository>,
            },
        );
        repo
    }

    /// Finalize at message boundary.
    ///
    /// With no error, [`commit`](Self::commit) runs; with an error, the
    /// commit is skipped and staged-but-uncommitted events are dropped with
    /// this unit of work.
    ///
    /// # Errors
    ///
    /// Returns [`WorkError`] if the commit itself fails.
    pub async fn end(
        self,
        failure: Option<&(dyn std::error::Error + Send + Sync)>,
    ) -> Result<(), WorkError> {
        match failure {
            Some(error) => {
                tracing::debug!(%error, "unit of work ended with error; skipping commit");
                Ok(())
            }
            None => self.commit().await,
        }
    }

    /// Commit every repository, then flush pending snapshots.
    ///
    /// A single commit identifier is chosen for all of them: an explicit
    /// `CommitId` header wins (idempotency across redelivery), else the
    /// inbound message id, else a fresh v4.
    ///
    /// # Errors
    ///
    /// Returns [`WorkError`] on the first repository whose commit fails, or
    /// if the snapshot flush fails. Repositories committed before the
    /// failure stay committed.
    pub async fn commit(&self) -> Result<(), WorkError> {
        let commit_id = self.pick_commit_id();
        let committers: Vec<Arc<dyn CommitRepository>> = {
            let repositories = self.repositories.lock().await;
            repositories
                .values()
                .map(|entry| Arc::clone(&entry.committer))
                .collect()
        };

        tracing::debug!(
            %commit_id,
            repositories = committers.len(),
            "committing unit of work"
        );
        for committer in committers {
            committer.commit(commit_id, self.work_headers.clone()).await?;
        }
        self.services.snapshots.commit().await?;
        Ok(())
    }

    fn pick_commit_id(&self) -> Uuid {
        if let Some(raw) = self.work_headers.get(COMMIT_ID_HEADER)
            && let Ok(id) = Uuid::parse_str(raw)
        {
            return id;
        }
        if let Some(raw) = self.work_headers.get(MESSAGE_ID_HEADER)
            && let Ok(id) = Uuid::parse_str(raw)
        {
            return id;
        }
        Uuid::new_v4()
    }
}
