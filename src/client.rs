//! Log-service access: the [`EventLog`] trait and its gRPC implementation.
//!
//! [`GrpcEventLog`] is a thin, typed wrapper around the tonic-generated
//! `StreamStoreClient`. It accepts and returns Rust-native types so that the
//! store, snapshot, and feed modules never import tonic internals directly.
//! Tests (and embedders that want one) can substitute
//! [`MemoryEventLog`](crate::testing::MemoryEventLog) behind the same trait.

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures_util::Stream;
use tonic::transport::Channel;
use uuid::Uuid;

use crate::auth::BearerInterceptor;
use crate::error::StoreError;
use crate::proto;
use crate::proto::stream_store_client::StreamStoreClient;

/// Expected stream version for optimistic concurrency on append.
///
/// Converted to the proto oneof before being sent over the wire, insulating
/// callers from the proto encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Accept any current stream version (no concurrency check).
    Any,
    /// The stream must not exist yet (first write).
    NoStream,
    /// The stream's last version must be exactly this value.
    Exact(i64),
}

impl ExpectedVersion {
    /// Map a stream's committed version to the matching append precondition:
    /// `-1` (does not exist) becomes [`NoStream`](Self::NoStream), anything
    /// else becomes [`Exact`](Self::Exact).
    pub fn from_committed(committed_version: i64) -> Self {
        if committed_version < 0 {
            Self::NoStream
        } else {
            Self::Exact(committed_version)
        }
    }

    /// The version value carried in error reports: `-1` for
    /// [`NoStream`](Self::NoStream)/[`Any`](Self::Any), the exact value
    /// otherwise.
    pub(crate) fn report_value(self) -> i64 {
        match self {
            Self::Exact(v) => v,
            _ => -1,
        }
    }

    fn to_proto(self) -> proto::ExpectedVersion {
        let kind = match self {
            Self::Any => proto::expected_version::Kind::Any(proto::Empty {}),
            Self::NoStream => proto::expected_version::Kind::NoStream(proto::Empty {}),
            Self::Exact(v) => proto::expected_version::Kind::Exact(v),
        };
        proto::ExpectedVersion { kind: Some(kind) }
    }
}

/// A client-proposed event in wire form: payload and descriptor already
/// serialized to JSON bytes.
#[derive(Debug, Clone)]
pub struct ProposedRecord {
    /// Client-assigned UUID v4, used by the store for idempotent appends.
    pub event_id: Uuid,
    /// Event type tag.
    pub event_type: String,
    /// Serialized JSON payload.
    pub payload: Vec<u8>,
    /// Serialized JSON descriptor.
    pub descriptor: Vec<u8>,
}

/// An event as recorded by the server, wire-neutral.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    /// Client-assigned event id string.
    pub event_id: String,
    /// Name of the stream the event was recorded on.
    pub stream_name: String,
    /// 1-based version within the stream.
    pub version: i64,
    /// Zero-based position in the global log.
    pub global_position: u64,
    /// Event type tag.
    pub event_type: String,
    /// Serialized JSON payload.
    pub payload: Vec<u8>,
    /// Serialized JSON descriptor.
    pub descriptor: Vec<u8>,
    /// Server-assigned timestamp (Unix epoch milliseconds).
    pub recorded_at: u64,
}

/// One page of a stream read.
#[derive(Debug, Clone)]
pub struct ReadPage {
    /// Events in the requested direction.
    pub events: Vec<StoredRecord>,
    /// The stream's last committed version (-1 if the stream does not
    /// exist), regardless of the requested window.
    pub last_version: i64,
    /// Cursor for the next page in the requested direction.
    pub next_version: i64,
    /// Whether the read reached the end of the stream (or the beginning,
    /// for backward reads).
    pub end_of_stream: bool,
}

/// One item from a global-log subscription.
#[derive(Debug, Clone)]
pub enum FeedItem {
    /// A recorded event.
    Event(StoredRecord),
    /// Historical replay is complete; everything after this is live.
    CaughtUp,
}

/// Stream of subscription items, boxed so [`EventLog`] stays object-safe.
pub type FeedStream = Pin<Box<dyn Stream<Item = Result<FeedItem, StoreError>> + Send>>;

/// Append-only log accessor: paged reads, conditional append, global
/// subscription.
///
/// Implemented by [`GrpcEventLog`] for the real `streamstore-db` service and
/// by [`MemoryEventLog`](crate::testing::MemoryEventLog) for tests.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Read one page of events from a stream.
    ///
    /// A stream that has never been written to yields an empty page with
    /// `last_version == -1` rather than an error, since callers routinely
    /// open streams that may not exist yet.
    async fn read_page(
        &self,
        stream_name: &str,
        from_version: i64,
        max_count: usize,
        backward: bool,
    ) -> Result<ReadPage, StoreError>;

    /// Conditionally append events to a stream.
    ///
    /// Returns the version of the last appended event.
    async fn append(
        &self,
        stream_name: &str,
        expected: ExpectedVersion,
        events: Vec<ProposedRecord>,
    ) -> Result<i64, StoreError>;

    /// Subscribe to the global log from a position.
    async fn subscribe_all_from(&self, from_position: u64) -> Result<FeedStream, StoreError>;
}

/// Plain (unauthenticated) gRPC client type alias.
type PlainClient = StreamStoreClient<Channel>;

/// Authenticated gRPC client with Bearer token interceptor.
type AuthClient =
    StreamStoreClient<tonic::service::interceptor::InterceptedService<Channel, BearerInterceptor>>;

/// Internal transport enum supporting both plain and authenticated channels.
enum GrpcInner {
    /// Unauthenticated channel.
    Plain(PlainClient),
    /// Channel with a [`BearerInterceptor`] injecting an `Authorization` header.
    Auth(AuthClient),
}

/// Typed gRPC client for the `streamstore-db` event log.
///
/// Clone is cheap because the inner transport is wrapped in an [`Arc`].
#[derive(Clone)]
pub struct GrpcEventLog {
    inner: Arc<GrpcInner>,
}

impl fmt::Debug for GrpcEventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let variant = match *self.inner {
            GrpcInner::Plain(_) => "Plain",
            GrpcInner::Auth(_) => "Auth",
        };
        f.debug_struct("GrpcEventLog")
            .field("transport", &variant)
            .finish()
    }
}

/// Map a tonic status to the crate's error taxonomy.
///
/// `FailedPrecondition` is the server's expected-version rejection and
/// becomes a conflict; deadline/cancellation become [`StoreError::Timeout`];
/// everything else is a connection-level failure.
fn map_status(stream_name: &str, expected: Option<ExpectedVersion>, status: tonic::Status) -> StoreError {
    match status.code() {
        tonic::Code::FailedPrecondition => StoreError::VersionConflict {
            stream: stream_name.to_string(),
            expected: expected.map(ExpectedVersion::report_value).unwrap_or(-1),
        },
        tonic::Code::DeadlineExceeded | tonic::Code::Cancelled => StoreError::Timeout,
        _ => StoreError::Connection(status.to_string()),
    }
}

fn to_proto_event(record: &ProposedRecord) -> proto::ProposedEvent {
    proto::ProposedEvent {
        event_id: record.event_id.to_string(),
        event_type: record.event_type.clone(),
        payload: record.payload.clone(),
        descriptor: record.descriptor.clone(),
    }
}

fn from_proto_event(event: proto::RecordedEvent) -> StoredRecord {
    StoredRecord {
        event_id: event.event_id,
        stream_name: event.stream_name,
        version: event.version,
        global_position: event.global_position,
        event_type: event.event_type,
        payload: event.payload,
        descriptor: event.descriptor,
        recorded_at: event.recorded_at,
    }
}

impl GrpcEventLog {
    /// Connect to a `streamstore-db` gRPC server at the given endpoint.
    ///
    /// Creates an unauthenticated (plain) connection. For authenticated
    /// connections, use [`connect_with_token`](Self::connect_with_token).
    ///
    /// # Errors
    ///
    /// Returns [`tonic::transport::Error`] if the channel cannot be
    /// established.
    pub async fn connect(endpoint: &str) -> Result<Self, tonic::transport::Error> {
        let client = StreamStoreClient::connect(endpoint.to_string()).await?;
        Ok(Self {
            inner: Arc::new(GrpcInner::Plain(client)),
        })
    }

    /// Connect with Bearer token authentication.
    ///
    /// The token is read from the shared [`RwLock`] on every outgoing RPC,
    /// so writing a new value into the lock refreshes it at runtime. An
    /// empty token string sends no `Authorization` header.
    ///
    /// # Errors
    ///
    /// Returns [`tonic::transport::Error`] if the channel cannot be
    /// established.
    pub async fn connect_with_token(
        endpoint: &str,
        token: Arc<RwLock<String>>,
    ) -> Result<Self, tonic::transport::Error> {
        let channel = tonic::transport::Endpoint::from_shared(endpoint.to_string())?
            .connect()
            .await?;
        let interceptor = BearerInterceptor { token };
        let client = StreamStoreClient::with_interceptor(channel, interceptor);
        Ok(Self {
            inner: Arc::new(GrpcInner::Auth(client)),
        })
    }

    /// Construct a `GrpcEventLog` from a pre-built client.
    ///
    /// Used in tests to create clients with lazy channels.
    #[cfg(test)]
    pub(crate) fn from_inner(inner: StreamStoreClient<Channel>) -> Self {
        Self {
            inner: Arc::new(GrpcInner::Plain(inner)),
        }
    }

    /// Whether this client uses an authenticated (Bearer token) transport.
    #[cfg(test)]
    pub(crate) fn is_auth(&self) -> bool {
        matches!(*self.inner, GrpcInner::Auth(_))
    }
}

#[async_trait]
impl EventLog for GrpcEventLog {
    async fn read_page(
        &self,
        stream_name: &str,
        from_version: i64,
        max_count: usize,
        backward: bool,
    ) -> Result<ReadPage, StoreError> {
        let request = proto::ReadStreamRequest {
            stream_name: stream_name.to_string(),
            from_version,
            max_count: max_count as u64,
            backward,
        };

        // Clone the inner tonic client per RPC. This is cheap: the client
        // wraps the channel, an Arc'd hyper connection pool.
        let result = match self.inner.as_ref() {
            GrpcInner::Plain(c) => c.clone().read_stream(request).await,
            GrpcInner::Auth(c) => c.clone().read_stream(request).await,
        };

        match result {
            Ok(response) => {
                let response = response.into_inner();
                Ok(ReadPage {
                    events: response.events.into_iter().map(from_proto_event).collect(),
                    last_version: response.last_version,
                    next_version: response.next_version,
                    end_of_stream: response.end_of_stream,
                })
            }
            // A stream that has never been written to returns NotFound.
            // Treat this as an empty page rather than an error, since
            // repositories open streams that may not exist yet.
            Err(status) if status.code() == tonic::Code::NotFound => Ok(ReadPage {
                events: Vec::new(),
                last_version: -1,
                next_version: from_version,
                end_of_stream: true,
            }),
            Err(status) => Err(map_status(stream_name, None, status)),
        }
    }

    async fn append(
        &self,
        stream_name: &str,
        expected: ExpectedVersion,
        events: Vec<ProposedRecord>,
    ) -> Result<i64, StoreError> {
        let request = proto::AppendRequest {
            stream_name: stream_name.to_string(),
            expected_version: Some(expected.to_proto()),
            events: events.iter().map(to_proto_event).collect(),
        };

        let result = match self.inner.as_ref() {
            GrpcInner::Plain(c) => c.clone().append(request).await,
            GrpcInner::Auth(c) => c.clone().append(request).await,
        };

        match result {
            Ok(response) => Ok(response.into_inner().last_version),
            Err(status) => Err(map_status(stream_name, Some(expected), status)),
        }
    }

    async fn subscribe_all_from(&self, from_position: u64) -> Result<FeedStream, StoreError> {
        let request = proto::SubscribeAllRequest { from_position };
        let result = match self.inner.as_ref() {
            GrpcInner::Plain(c) => c.clone().subscribe_all(request).await,
            GrpcInner::Auth(c) => c.clone().subscribe_all(request).await,
        };

        let streaming = result
            .map_err(|status| map_status("$all", None, status))?
            .into_inner();

        let mapped = futures_util::StreamExt::map(streaming, |item| match item {
            Ok(response) => match response.kind {
                Some(proto::subscribe_response::Kind::Event(event)) => {
                    Ok(FeedItem::Event(from_proto_event(event)))
                }
                Some(proto::subscribe_response::Kind::CaughtUp(_)) | None => Ok(FeedItem::CaughtUp),
            },
            Err(status) => Err(map_status("$all", None, status)),
        });

        Ok(Box::pin(mapped))
    }
}
