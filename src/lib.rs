//! Event-sourcing persistence over a `streamstore-db` append-only log.
//!
//! Domain objects are never stored as current-state rows: they are
//! reconstructed by replaying an ordered event stream, optionally
//! accelerated by snapshots. The crate provides the event-stream and
//! store-client layers ([`EventStream`], [`StoreClient`]), the
//! repository/unit-of-work layer ([`Repository`], [`UnitOfWork`]), the
//! snapshot store ([`SnapshotStore`]), a bounded backpressured
//! [`Dispatcher`] that delivers stored events to registered handlers, and a
//! subscription [feed](start_feed) that connects the global log to the
//! dispatcher.

mod auth;
mod cache;
mod client;
mod config;
mod dispatch;
mod entity;
mod error;
mod event;
mod feed;
mod repository;
mod snapshot;
mod store;
mod stream;
pub mod testing;
mod uow;

/// Generated gRPC bindings for the `streamstore-db` service.
pub mod proto {
    tonic::include_proto!("streamstore");
}

pub use cache::{CachedStream, StreamCache};
pub use client::{
    EventLog, ExpectedVersion, FeedItem, FeedStream, GrpcEventLog, ProposedRecord, ReadPage,
    StoredRecord,
};
pub use config::{FeedConfig, StoreConfig};
pub use dispatch::{Dispatcher, EventHandler, HandleContext, HandlerRegistry};
pub use entity::{Root, SharedRoot, Sourced};
pub use error::{
    CommitError, DispatchError, HandlerError, RepositoryError, StoreError, WorkError,
};
pub use event::{
    DEFAULT_BUCKET, EventDescriptor, StoredEvent, StreamNameGenerator, WritableEvent,
    decode_domain_event, decode_stored_event, default_stream_name, encode_domain_event,
};
pub use feed::{FeedHandle, start_feed};
pub use repository::{EntityRepository, Repository};
pub use snapshot::{Snapshot, SnapshotStore, snapshot_index_stream_name, snapshot_stream_name};
pub use store::StoreClient;
pub use stream::{EventStream, SharedStream};
pub use uow::{
    CARRY_OVER_HEADERS, COMMIT_ID_HEADER, MESSAGE_ID_HEADER, NOT_FOUND, PREFIX_HEADER, Services,
    UnitOfWork,
};
