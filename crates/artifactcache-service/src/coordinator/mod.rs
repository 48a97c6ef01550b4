//! Coordinates concurrent requests for compiled artifacts.
//!
//! All state lives in a single [`Coordinator`] task. The public [`ArtifactCacheService`] handle
//! and all background operations talk to it exclusively through messages, so no state is ever
//! shared between threads.
//!
//! The lifecycle of a request:
//!
//! 1. The cache lookup and the creation of a delivery file are started concurrently.
//! 2. Once both completed, a hit is written into the delivery file and handed to the client.
//!    On a miss, the client gets the empty file to compile into, unless another client is
//!    already compiling the same artifact. In that case the request is parked until the
//!    compiled artifact is stored and the cache is queried again.
//! 3. After compiling, the client reports back via
//!    [`finish_artifact`](ArtifactCacheService::finish_artifact), and the compiled artifact is
//!    read back and stored in the cache.
//!
//! The cache backend is opened lazily and released again once nothing references it anymore.

use std::collections::VecDeque;
use std::error::Error;
use std::fs::File;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use futures::future::{self, BoxFuture, FutureExt};
use sentry::{Hub, SentryFutureExt};
use tokio::sync::{mpsc, oneshot};

use crate::caching::{BackendError, BackendFactory, CacheBackend, CacheKey};
use crate::config::CacheConfig;
use crate::files::{FileWriter, TempFileProvider};
use crate::metric;
use crate::types::{ArtifactError, ArtifactFile, ClientId, ModuleMetadata, RequestId};

mod state;

use state::{BackendOp, CacheState, JoinState, PendingRequest, RequestTable, Responder, Ticket};

/// Resolves with the requested artifact, see [`ArtifactCacheService::request_artifact`].
pub type ArtifactFuture = BoxFuture<'static, Result<ArtifactFile, ArtifactError>>;

/// Resolves with the number of removed cache entries.
pub type ClearFuture = BoxFuture<'static, Result<usize, ArtifactError>>;

/// The lifecycle state of the cache backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheStatus {
    #[default]
    Uninitialized,
    Initializing,
    Ready,
}

/// A snapshot of the coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoordinatorStats {
    /// Requests in the request table.
    pub pending: usize,
    /// Requests waiting for another client compiling the same artifact.
    pub parked: usize,
    /// Calls waiting for the cache backend to become ready.
    pub waiting: usize,
    /// Calls into the cache backend that did not complete yet.
    pub outstanding_ops: usize,
    pub cache: CacheStatus,
}

/// What happened to the cache backend on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The backend was idle and has been released.
    Released,
    /// Operations were still running on the backend, so it was leaked instead of released.
    Leaked,
    /// No backend was open.
    NoBackend,
}

struct NewRequest {
    id: RequestId,
    cache_key: CacheKey,
    is_cacheable: bool,
    responder: Responder,
}

struct ClearRequest {
    start: SystemTime,
    end: SystemTime,
    responder: oneshot::Sender<Result<usize, ArtifactError>>,
}

/// A call waiting for the cache backend to become ready.
enum Waiting {
    Request(NewRequest),
    Clear(ClearRequest),
}

enum Message {
    Request(NewRequest),
    Finish {
        id: RequestId,
        success: bool,
    },
    Disconnect(ClientId),
    Clear(ClearRequest),
    Stats(oneshot::Sender<CoordinatorStats>),
    IsPending {
        id: RequestId,
        responder: oneshot::Sender<bool>,
    },
    Shutdown(oneshot::Sender<ShutdownOutcome>),
    RetryWaiting,
    InitComplete(Result<Arc<dyn CacheBackend>, BackendError>),
    LookupComplete {
        ticket: Ticket,
        op: BackendOp,
        result: Result<Option<Bytes>, BackendError>,
    },
    TempFileReady {
        ticket: Ticket,
        result: io::Result<File>,
    },
    WriteComplete {
        ticket: Ticket,
        cached: Bytes,
        result: io::Result<File>,
    },
    ReadBackComplete {
        ticket: Ticket,
        result: io::Result<Bytes>,
    },
    StoreComplete {
        ticket: Ticket,
        op: BackendOp,
        result: Result<(), BackendError>,
    },
    ClearComplete {
        op: BackendOp,
        result: Result<usize, BackendError>,
        responder: oneshot::Sender<Result<usize, ArtifactError>>,
    },
}

/// A handle to the artifact cache.
///
/// Handles are cheap to clone. The coordinator shuts down once [`shutdown`](Self::shutdown) is
/// called or the last handle is dropped.
#[derive(Debug, Clone)]
pub struct ArtifactCacheService {
    tx: mpsc::UnboundedSender<Message>,
}

impl ArtifactCacheService {
    /// Creates the service, opening the backend configured in `config` on demand.
    pub fn new(config: CacheConfig, runtime: tokio::runtime::Handle) -> Self {
        let factory = Arc::new(config.backend.clone());
        Self::with_factory(config, factory, runtime)
    }

    /// Creates the service, opening backends through `factory`.
    pub fn with_factory(
        config: CacheConfig,
        factory: Arc<dyn BackendFactory>,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator::new(config, factory, tx.downgrade());
        runtime.spawn(
            coordinator
                .run(rx)
                .bind_hub(Hub::new_from_top(Hub::current())),
        );
        Self { tx }
    }

    /// Requests the artifact compiled from the module described by `metadata`.
    ///
    /// The request is registered right away, the returned future only waits for its
    /// resolution. On a hit, the artifact is delivered in a file. On a miss, the caller gets an
    /// empty file to compile the artifact into, and has to call
    /// [`finish_artifact`](Self::finish_artifact) once done.
    ///
    /// Artifacts of requests that are not cacheable, or whose module forbids storing, are never
    /// stored. Concurrent cacheable requests for the same artifact are only compiled once.
    pub fn request_artifact(
        &self,
        id: RequestId,
        is_cacheable: bool,
        metadata: &ModuleMetadata,
    ) -> ArtifactFuture {
        metric!(counter("artifacts.requests") += 1);

        let cache_key = match CacheKey::for_module(metadata) {
            Ok(cache_key) => cache_key,
            Err(err) => {
                tracing::warn!(%id, error = &err as &dyn Error, "Invalid module metadata");
                return future::ready(Err(err.into())).boxed();
            }
        };

        let (responder, rx) = oneshot::channel();
        let request = NewRequest {
            id,
            cache_key,
            is_cacheable: is_cacheable && !metadata.no_store,
            responder,
        };
        self.send(Message::Request(request));

        rx.map(|result| result.unwrap_or(Err(ArtifactError::Cancelled)))
            .boxed()
    }

    /// Reports that the client finished compiling the artifact for request `id`.
    ///
    /// A successfully compiled artifact of a cacheable request is stored in the cache.
    /// Finishing a request that was not handed out as a miss abandons it.
    pub fn finish_artifact(&self, id: RequestId, success: bool) {
        self.send(Message::Finish { id, success });
    }

    /// Cancels all requests of `client_id`.
    pub fn client_disconnected(&self, client_id: ClientId) {
        self.send(Message::Disconnect(client_id));
    }

    /// Removes all cache entries stored in the `[start, end)` time range.
    pub fn clear_entries_between(&self, start: SystemTime, end: SystemTime) -> ClearFuture {
        let (responder, rx) = oneshot::channel();
        self.send(Message::Clear(ClearRequest {
            start,
            end,
            responder,
        }));

        rx.map(|result| result.unwrap_or(Err(ArtifactError::Cancelled)))
            .boxed()
    }

    /// Returns a snapshot of the coordinator state.
    pub async fn stats(&self) -> CoordinatorStats {
        let (responder, rx) = oneshot::channel();
        self.send(Message::Stats(responder));
        rx.await.unwrap_or_default()
    }

    /// Returns whether request `id` is still known to the coordinator.
    ///
    /// A finished request stays pending until its artifact is stored.
    pub async fn is_pending(&self, id: RequestId) -> bool {
        let (responder, rx) = oneshot::channel();
        self.send(Message::IsPending { id, responder });
        rx.await.unwrap_or(false)
    }

    /// Shuts the coordinator down, cancelling all pending requests.
    ///
    /// The cache backend is released if no operations are running on it. Otherwise it is
    /// leaked, as releasing it would pull it from under the running operations.
    pub async fn shutdown(&self) -> ShutdownOutcome {
        let (responder, rx) = oneshot::channel();
        self.send(Message::Shutdown(responder));
        rx.await.unwrap_or(ShutdownOutcome::NoBackend)
    }

    fn send(&self, message: Message) {
        if self.tx.send(message).is_err() {
            tracing::debug!("Artifact cache service is shut down");
        }
    }
}

struct Coordinator {
    factory: Arc<dyn BackendFactory>,
    sender: mpsc::WeakUnboundedSender<Message>,
    temp_files: TempFileProvider,
    writer: FileWriter,
    init_retry_delay: Duration,
    max_hit_write_attempts: usize,

    cache: CacheState,
    requests: RequestTable,
    waiting: VecDeque<Waiting>,
    retry_scheduled: bool,
    generation: u64,
    outstanding: Arc<AtomicUsize>,
}

impl Coordinator {
    fn new(
        config: CacheConfig,
        factory: Arc<dyn BackendFactory>,
        sender: mpsc::WeakUnboundedSender<Message>,
    ) -> Self {
        Self {
            factory,
            sender,
            temp_files: TempFileProvider::new(config.temp_dir),
            writer: FileWriter::new(config.max_artifact_size),
            init_retry_delay: config.init_retry_delay,
            max_hit_write_attempts: config.max_hit_write_attempts,

            cache: CacheState::Uninitialized,
            requests: RequestTable::default(),
            waiting: VecDeque::new(),
            retry_scheduled: false,
            generation: 0,
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Message>) {
        while let Some(message) = rx.recv().await {
            if let Message::Shutdown(responder) = message {
                let outcome = self.shutdown();
                let _ = responder.send(outcome);
                return;
            }

            self.handle(message);
            metric!(gauge("artifacts.pending") = self.requests.len() as u64);
        }

        let outcome = self.shutdown();
        tracing::debug!(?outcome, "All artifact cache service handles dropped");
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::Request(request) => self.handle_request(request),
            Message::Finish { id, success } => self.finish(id, success),
            Message::Disconnect(client_id) => self.disconnect(client_id),
            Message::Clear(clear) => self.handle_clear(clear),
            Message::Stats(responder) => {
                let _ = responder.send(self.stats());
            }
            Message::IsPending { id, responder } => {
                let _ = responder.send(self.is_pending(id));
            }
            // handled by the run loop
            Message::Shutdown(_) => {}
            Message::RetryWaiting => self.retry_waiting(),
            Message::InitComplete(result) => self.on_init_complete(result),
            Message::LookupComplete { ticket, op, result } => {
                self.on_lookup_complete(ticket, op, result)
            }
            Message::TempFileReady { ticket, result } => self.on_temp_file_ready(ticket, result),
            Message::WriteComplete {
                ticket,
                cached,
                result,
            } => self.on_write_complete(ticket, cached, result),
            Message::ReadBackComplete { ticket, result } => {
                self.on_read_back_complete(ticket, result)
            }
            Message::StoreComplete { ticket, op, result } => {
                self.on_store_complete(ticket, op, result)
            }
            Message::ClearComplete {
                op,
                result,
                responder,
            } => self.on_clear_complete(op, result, responder),
        }
    }

    fn handle_request(&mut self, request: NewRequest) {
        if !matches!(self.cache, CacheState::Ready(_)) {
            self.ensure_initialized();
            self.wait(Waiting::Request(request));
            return;
        }

        let NewRequest {
            id,
            cache_key,
            is_cacheable,
            responder,
        } = request;
        self.drop_waiting_request(id);

        self.generation += 1;
        let ticket = Ticket {
            id,
            generation: self.generation,
        };
        let request =
            PendingRequest::new(cache_key.clone(), is_cacheable, ticket.generation, responder);
        if let Some(previous) = self.requests.insert(id, request) {
            tracing::warn!(%id, "Replacing pending artifact request with the same id");
            metric!(counter("artifacts.preempted") += 1);
            let previous_key = previous.cache_key.clone();
            self.discard(previous.join.into_file());
            if previous.is_cacheable {
                self.requery(&previous_key);
            }
        }

        tracing::trace!(%id, key = %cache_key, "Looking up artifact");
        self.start_lookup(ticket, cache_key);
        self.start_temp_file(ticket);
    }

    fn on_lookup_complete(
        &mut self,
        ticket: Ticket,
        op: BackendOp,
        result: Result<Option<Bytes>, BackendError>,
    ) {
        drop(op);
        let lookup = match result {
            Ok(lookup) => lookup,
            Err(err) => {
                tracing::error!(error = &err as &dyn Error, "Failed to look up artifact");
                None
            }
        };

        let Some(mut request) = self.requests.take_live(ticket) else {
            tracing::trace!(id = %ticket.id, "Dropping cache lookup of gone request");
            self.maybe_teardown_backend();
            return;
        };

        match std::mem::replace(&mut request.join, JoinState::AwaitingBoth) {
            JoinState::AwaitingBoth => {
                request.join = JoinState::AwaitingFile { lookup };
                self.requests.insert(ticket.id, request);
            }
            JoinState::AwaitingLookup { temp_file } => {
                self.resolve_join(ticket, request, temp_file, lookup)
            }
            join => {
                tracing::warn!(id = %ticket.id, state = join.name(), "Unexpected cache lookup");
                request.join = join;
                self.requests.insert(ticket.id, request);
            }
        }
    }

    fn on_temp_file_ready(&mut self, ticket: Ticket, result: io::Result<File>) {
        let Some(mut request) = self.requests.take_live(ticket) else {
            self.discard(result.ok());
            return;
        };

        let temp_file = match result {
            Ok(temp_file) => temp_file,
            Err(err) => {
                tracing::error!(error = &err as &dyn Error, "Failed to create delivery file");
                let _ = request.respond(Err(ArtifactError::TempFile(err.to_string())));
                if request.is_cacheable {
                    self.requery(&request.cache_key);
                }
                self.maybe_teardown_backend();
                return;
            }
        };

        match std::mem::replace(&mut request.join, JoinState::AwaitingBoth) {
            JoinState::AwaitingBoth => {
                request.join = JoinState::AwaitingLookup { temp_file };
                self.requests.insert(ticket.id, request);
            }
            JoinState::AwaitingFile { lookup } => {
                self.resolve_join(ticket, request, temp_file, lookup)
            }
            join => {
                tracing::warn!(id = %ticket.id, state = join.name(), "Unexpected delivery file");
                request.join = join;
                self.requests.insert(ticket.id, request);
                self.discard(Some(temp_file));
            }
        }
    }

    /// Resolves a request whose cache lookup and delivery file are both available.
    fn resolve_join(
        &mut self,
        ticket: Ticket,
        mut request: PendingRequest,
        temp_file: File,
        lookup: Option<Bytes>,
    ) {
        match lookup {
            Some(cached) => self.write_cached(ticket, request, temp_file, cached),
            None if request.is_cacheable && self.requests.is_compiling(&request.cache_key) => {
                tracing::debug!(
                    id = %ticket.id,
                    key = %request.cache_key,
                    "Waiting for concurrent compilation of artifact"
                );
                metric!(counter("artifacts.deduplicated") += 1);
                request.join = JoinState::Parked { temp_file };
                self.requests.insert(ticket.id, request);
            }
            None => self.deliver_miss(ticket, request, temp_file),
        }
    }

    fn deliver_miss(&mut self, ticket: Ticket, mut request: PendingRequest, temp_file: File) {
        let client_file = match temp_file.try_clone() {
            Ok(client_file) => client_file,
            Err(err) => {
                tracing::error!(error = &err as &dyn Error, "Failed to duplicate delivery file");
                let _ = request.respond(Err(ArtifactError::TempFile(err.to_string())));
                self.discard(Some(temp_file));
                if request.is_cacheable {
                    self.requery(&request.cache_key);
                }
                self.maybe_teardown_backend();
                return;
            }
        };

        let artifact = ArtifactFile {
            file: client_file,
            is_hit: false,
        };
        match request.respond(Ok(artifact)) {
            Ok(()) => {
                metric!(counter("artifacts.miss") += 1);
                request.join = JoinState::Delivered { temp_file };
                self.requests.insert(ticket.id, request);
            }
            Err(result) => {
                tracing::debug!(id = %ticket.id, "Artifact requester went away before delivery");
                self.discard(result.ok().map(|artifact| artifact.file));
                self.discard(Some(temp_file));
                if request.is_cacheable {
                    self.requery(&request.cache_key);
                }
                self.maybe_teardown_backend();
            }
        }
    }

    fn write_cached(
        &mut self,
        ticket: Ticket,
        mut request: PendingRequest,
        temp_file: File,
        cached: Bytes,
    ) {
        request.write_attempts += 1;
        request.join = JoinState::Writing;
        self.requests.insert(ticket.id, request);

        let writer = self.writer;
        self.spawn_blocking(move || {
            let result = writer.write(temp_file, &cached);
            Message::WriteComplete {
                ticket,
                cached,
                result,
            }
        });
    }

    fn on_write_complete(&mut self, ticket: Ticket, cached: Bytes, result: io::Result<File>) {
        let Some(mut request) = self.requests.take_live(ticket) else {
            self.discard(result.ok());
            return;
        };

        match result {
            Ok(file) => {
                metric!(counter("artifacts.hit") += 1);
                let artifact = ArtifactFile { file, is_hit: true };
                if let Err(Ok(artifact)) = request.respond(Ok(artifact)) {
                    self.discard(Some(artifact.file));
                }
            }
            Err(err) if request.write_attempts < self.max_hit_write_attempts => {
                tracing::warn!(
                    id = %ticket.id,
                    attempt = request.write_attempts,
                    error = &err as &dyn Error,
                    "Failed to write cached artifact, retrying with a new file"
                );
                request.join = JoinState::AwaitingFile {
                    lookup: Some(cached),
                };
                self.requests.insert(ticket.id, request);
                self.start_temp_file(ticket);
            }
            Err(err) => {
                tracing::error!(error = &err as &dyn Error, "Failed to write cached artifact");
                let _ = request.respond(Err(ArtifactError::Write(err.to_string())));
            }
        }
        self.maybe_teardown_backend();
    }

    fn finish(&mut self, id: RequestId, success: bool) {
        let Some(mut request) = self.requests.remove(&id) else {
            if self.abandon_waiting_request(id) {
                self.maybe_teardown_backend();
            } else {
                tracing::debug!(%id, "Finishing unknown artifact request");
            }
            return;
        };

        match std::mem::replace(&mut request.join, JoinState::Storing) {
            JoinState::Delivered { temp_file } if success && request.is_cacheable => {
                let ticket = Ticket {
                    id,
                    generation: request.generation,
                };
                self.requests.insert(id, request);

                let writer = self.writer;
                self.spawn_blocking(move || Message::ReadBackComplete {
                    ticket,
                    result: writer.read_back(temp_file),
                });
            }
            join => {
                tracing::trace!(%id, success, state = join.name(), "Dropping finished request");
                self.discard(join.into_file());
                let _ = request.respond(Err(ArtifactError::Abandoned));
                if request.is_cacheable {
                    self.requery(&request.cache_key);
                }
                self.maybe_teardown_backend();
            }
        }
    }

    fn on_read_back_complete(&mut self, ticket: Ticket, result: io::Result<Bytes>) {
        let contents = match result {
            Ok(contents) => contents,
            Err(err) => {
                tracing::error!(error = &err as &dyn Error, "Failed to read compiled artifact");
                metric!(counter("artifacts.store") += 1, "status" => "read_failed");
                if let Some(request) = self.requests.take_live(ticket) {
                    self.requery(&request.cache_key);
                }
                self.maybe_teardown_backend();
                return;
            }
        };

        let Some(request) = self.requests.get_live(ticket) else {
            tracing::trace!(id = %ticket.id, "Dropping compiled artifact of gone request");
            self.maybe_teardown_backend();
            return;
        };
        let cache_key = request.cache_key.clone();

        let op = BackendOp::acquire(&self.outstanding);
        match self.cache {
            CacheState::Ready(ref backend) => {
                let backend = Arc::clone(backend);
                self.spawn(async move {
                    let result = backend.put(&cache_key, contents).await;
                    Message::StoreComplete { ticket, op, result }
                });
            }
            _ => self.post(Message::StoreComplete {
                ticket,
                op,
                result: Err(BackendError::Other("cache backend is not ready".into())),
            }),
        }
    }

    fn on_store_complete(
        &mut self,
        ticket: Ticket,
        op: BackendOp,
        result: Result<(), BackendError>,
    ) {
        drop(op);
        match result {
            Ok(()) => metric!(counter("artifacts.store") += 1, "status" => "success"),
            Err(err) => {
                tracing::error!(error = &err as &dyn Error, "Failed to store compiled artifact");
                metric!(counter("artifacts.store") += 1, "status" => "failure");
            }
        }

        if let Some(request) = self.requests.take_live(ticket) {
            self.requery(&request.cache_key);
        }
        self.maybe_teardown_backend();
    }

    /// Looks up the cache again for requests of `cache_key` that are not delivered yet.
    ///
    /// Requests with a lookup in flight are left alone, as are delivered requests.
    fn requery(&mut self, cache_key: &CacheKey) {
        let tickets = self.requests.requeryable(cache_key);
        if tickets.is_empty() {
            return;
        }

        tracing::debug!(key = %cache_key, requests = tickets.len(), "Requerying artifact");
        metric!(counter("artifacts.requery") += tickets.len() as i64);
        for ticket in tickets {
            let Some(request) = self.requests.get_mut(&ticket.id) else {
                continue;
            };
            request.join = match std::mem::replace(&mut request.join, JoinState::AwaitingBoth) {
                JoinState::Parked { temp_file } => JoinState::AwaitingLookup { temp_file },
                JoinState::AwaitingFile { .. } => JoinState::AwaitingBoth,
                join => join,
            };
            self.start_lookup(ticket, cache_key.clone());
        }
    }

    fn disconnect(&mut self, client_id: ClientId) {
        let mut keys = Vec::new();
        for id in self.requests.ids_for_client(client_id) {
            if let Some(request) = self.requests.remove(&id) {
                if request.is_cacheable && !keys.contains(&request.cache_key) {
                    keys.push(request.cache_key.clone());
                }
                self.discard(request.join.into_file());
            }
        }
        self.waiting.retain(|waiting| {
            !matches!(waiting, Waiting::Request(request) if request.id.client_id == client_id)
        });
        tracing::debug!(client = %client_id, "Client disconnected");

        for key in &keys {
            self.requery(key);
        }
        self.maybe_teardown_backend();
    }

    fn ensure_initialized(&mut self) {
        if !matches!(self.cache, CacheState::Uninitialized) {
            return;
        }

        tracing::debug!("Opening cache backend");
        self.cache = CacheState::Initializing;
        let factory = Arc::clone(&self.factory);
        self.spawn(async move {
            let start = Instant::now();
            let result = factory.open().await;
            metric!(timer("backend.init.duration") = start.elapsed());
            Message::InitComplete(result)
        });
    }

    fn on_init_complete(&mut self, result: Result<Arc<dyn CacheBackend>, BackendError>) {
        if matches!(self.cache, CacheState::Ready(_)) {
            tracing::debug!("Ignoring cache backend opened while another one is ready");
            return;
        }

        match result {
            Ok(backend) => {
                tracing::info!(backend = backend.name(), "Cache backend ready");
                metric!(counter("backend.init") += 1, "status" => "success");
                self.cache = CacheState::Ready(backend);
                // everyone who asked for it may have left in the meantime
                self.maybe_teardown_backend();
            }
            Err(err) => {
                tracing::error!(error = &err as &dyn Error, "Failed to open cache backend");
                metric!(counter("backend.init") += 1, "status" => "failure");
                self.cache = CacheState::Uninitialized;
            }
        }
    }

    fn handle_clear(&mut self, clear: ClearRequest) {
        let backend = match self.cache {
            CacheState::Ready(ref backend) => Arc::clone(backend),
            _ => {
                self.ensure_initialized();
                self.wait(Waiting::Clear(clear));
                return;
            }
        };

        let ClearRequest {
            start,
            end,
            responder,
        } = clear;
        let op = BackendOp::acquire(&self.outstanding);
        self.spawn(async move {
            let result = backend.doom_between(start, end).await;
            Message::ClearComplete {
                op,
                result,
                responder,
            }
        });
    }

    fn on_clear_complete(
        &mut self,
        op: BackendOp,
        result: Result<usize, BackendError>,
        responder: oneshot::Sender<Result<usize, ArtifactError>>,
    ) {
        drop(op);
        let result = match result {
            Ok(removed) => {
                tracing::info!(removed, "Cleared cache entries");
                Ok(removed)
            }
            Err(err) => {
                tracing::error!(error = &err as &dyn Error, "Failed to clear cache entries");
                Err(ArtifactError::Backend(err.to_string()))
            }
        };
        let _ = responder.send(result);
        self.maybe_teardown_backend();
    }

    /// Releases the cache backend if nothing references it anymore.
    fn maybe_teardown_backend(&mut self) {
        if !self.requests.is_empty()
            || !self.waiting.is_empty()
            || self.outstanding.load(Ordering::Relaxed) != 0
        {
            return;
        }

        if let CacheState::Ready(ref backend) = self.cache {
            tracing::debug!(backend = backend.name(), "Releasing idle cache backend");
            metric!(counter("backend.teardown") += 1);
            self.cache = CacheState::Uninitialized;
        }
    }

    /// Parks a call until the cache backend is ready, polling every `init_retry_delay`.
    fn wait(&mut self, waiting: Waiting) {
        if let Waiting::Request(ref request) = waiting {
            self.drop_waiting_request(request.id);
        }
        self.waiting.push_back(waiting);

        if !self.retry_scheduled {
            self.retry_scheduled = true;
            let delay = self.init_retry_delay;
            self.spawn(async move {
                tokio::time::sleep(delay).await;
                Message::RetryWaiting
            });
        }
    }

    fn retry_waiting(&mut self) {
        self.retry_scheduled = false;
        for waiting in std::mem::take(&mut self.waiting) {
            match waiting {
                Waiting::Request(request) => self.handle_request(request),
                Waiting::Clear(clear) => self.handle_clear(clear),
            }
        }
    }

    /// Drops a waiting request that is replaced by a newer one with the same id.
    fn drop_waiting_request(&mut self, id: RequestId) {
        let before = self.waiting.len();
        self.waiting
            .retain(|waiting| !matches!(waiting, Waiting::Request(request) if request.id == id));
        if self.waiting.len() < before {
            tracing::warn!(%id, "Replacing waiting artifact request with the same id");
            metric!(counter("artifacts.preempted") += 1);
        }
    }

    /// Resolves a waiting request with [`ArtifactError::Abandoned`].
    fn abandon_waiting_request(&mut self, id: RequestId) -> bool {
        let position = self
            .waiting
            .iter()
            .position(|waiting| matches!(waiting, Waiting::Request(request) if request.id == id));
        match position.and_then(|position| self.waiting.remove(position)) {
            Some(Waiting::Request(request)) => {
                let _ = request.responder.send(Err(ArtifactError::Abandoned));
                true
            }
            _ => false,
        }
    }

    fn start_lookup(&self, ticket: Ticket, cache_key: CacheKey) {
        let op = BackendOp::acquire(&self.outstanding);
        match self.cache {
            CacheState::Ready(ref backend) => {
                let backend = Arc::clone(backend);
                self.spawn(async move {
                    let result = backend.get(&cache_key).await;
                    Message::LookupComplete { ticket, op, result }
                });
            }
            // requests only exist while the backend is ready
            _ => self.post(Message::LookupComplete {
                ticket,
                op,
                result: Ok(None),
            }),
        }
    }

    fn start_temp_file(&self, ticket: Ticket) {
        let temp_files = self.temp_files.clone();
        self.spawn_blocking(move || Message::TempFileReady {
            ticket,
            result: temp_files.create(),
        });
    }

    /// Closes a file on the blocking pool.
    fn discard(&self, file: Option<File>) {
        if let Some(file) = file {
            tokio::task::spawn_blocking(move || drop(file));
        }
    }

    fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            pending: self.requests.len(),
            parked: self.requests.count_parked(),
            waiting: self.waiting.len(),
            outstanding_ops: self.outstanding.load(Ordering::Relaxed),
            cache: match self.cache {
                CacheState::Uninitialized => CacheStatus::Uninitialized,
                CacheState::Initializing => CacheStatus::Initializing,
                CacheState::Ready(_) => CacheStatus::Ready,
            },
        }
    }

    fn is_pending(&self, id: RequestId) -> bool {
        self.requests.contains(&id)
            || self
                .waiting
                .iter()
                .any(|waiting| matches!(waiting, Waiting::Request(request) if request.id == id))
    }

    /// Cancels everything and disposes of the cache backend.
    fn shutdown(&mut self) -> ShutdownOutcome {
        self.requests.clear();
        self.waiting.clear();

        match std::mem::take(&mut self.cache) {
            CacheState::Ready(backend) => {
                let outstanding = self.outstanding.load(Ordering::Relaxed);
                if outstanding == 0 {
                    tracing::debug!(backend = backend.name(), "Releasing cache backend");
                    drop(backend);
                    ShutdownOutcome::Released
                } else {
                    // The running operations hold on to the backend. Forgetting our reference
                    // keeps it alive past their completion as well.
                    tracing::warn!(
                        backend = backend.name(),
                        outstanding,
                        "Leaking cache backend with operations in flight"
                    );
                    metric!(counter("backend.leaked") += 1);
                    std::mem::forget(backend);
                    ShutdownOutcome::Leaked
                }
            }
            CacheState::Uninitialized | CacheState::Initializing => ShutdownOutcome::NoBackend,
        }
    }

    /// Runs `future` on the runtime and feeds its result back to the coordinator.
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = Message> + Send + 'static,
    {
        let sender = self.sender.clone();
        tokio::spawn(
            async move {
                let message = future.await;
                if let Some(sender) = sender.upgrade() {
                    let _ = sender.send(message);
                }
            }
            .bind_hub(Hub::new_from_top(Hub::current())),
        );
    }

    /// Runs `f` on the blocking pool and feeds its result back to the coordinator.
    fn spawn_blocking<F>(&self, f: F)
    where
        F: FnOnce() -> Message + Send + 'static,
    {
        let sender = self.sender.clone();
        tokio::task::spawn_blocking(move || {
            let message = f();
            if let Some(sender) = sender.upgrade() {
                let _ = sender.send(message);
            }
        });
    }

    fn post(&self, message: Message) {
        if let Some(sender) = self.sender.upgrade() {
            let _ = sender.send(message);
        }
    }
}
