use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fs::File;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::caching::{CacheBackend, CacheKey};
use crate::types::{ArtifactError, ArtifactFile, ClientId, RequestId};

pub(super) type Responder = oneshot::Sender<Result<ArtifactFile, ArtifactError>>;

/// Identifies one incarnation of a request.
///
/// A request id can be reused after the previous request with that id is gone. Every
/// background operation carries the ticket of the entry that started it, so that its result
/// is never applied to a newer entry with the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Ticket {
    pub id: RequestId,
    pub generation: u64,
}

/// Tracks a call into the cache backend.
///
/// The backend cannot be released while any of these are alive. The guard travels with the
/// operation's result back to the coordinator and is dropped once the result was handled.
#[derive(Debug)]
pub(super) struct BackendOp {
    outstanding: Arc<AtomicUsize>,
}

impl BackendOp {
    pub fn acquire(outstanding: &Arc<AtomicUsize>) -> Self {
        outstanding.fetch_add(1, Ordering::Relaxed);
        Self {
            outstanding: Arc::clone(outstanding),
        }
    }
}

impl Drop for BackendOp {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Where a request stands on its way to delivery.
#[derive(Debug)]
pub(super) enum JoinState {
    /// Both the cache lookup and the delivery file are outstanding.
    AwaitingBoth,
    /// The delivery file is ready, the cache lookup is outstanding.
    AwaitingLookup { temp_file: File },
    /// The cache lookup returned, the delivery file is outstanding.
    AwaitingFile { lookup: Option<Bytes> },
    /// The request missed the cache while another request is compiling the same artifact.
    Parked { temp_file: File },
    /// The cached artifact is being written into the delivery file.
    Writing,
    /// The client was told to compile into its copy of `temp_file`.
    Delivered { temp_file: File },
    /// The compiled artifact is being stored in the cache.
    Storing,
}

impl JoinState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AwaitingBoth => "awaiting_both",
            Self::AwaitingLookup { .. } => "awaiting_lookup",
            Self::AwaitingFile { .. } => "awaiting_file",
            Self::Parked { .. } => "parked",
            Self::Writing => "writing",
            Self::Delivered { .. } => "delivered",
            Self::Storing => "storing",
        }
    }

    /// Whether a request in this state is compiling, or has just compiled, its artifact.
    pub fn is_compiling(&self) -> bool {
        matches!(self, Self::Delivered { .. } | Self::Storing)
    }

    /// Whether a new cache lookup may be started for a request in this state.
    ///
    /// This is the case when its previous lookup returned but nothing was delivered yet.
    pub fn can_requery(&self) -> bool {
        matches!(self, Self::Parked { .. } | Self::AwaitingFile { .. })
    }

    /// Returns the delivery file owned in this state, if any.
    pub fn into_file(self) -> Option<File> {
        match self {
            Self::AwaitingLookup { temp_file }
            | Self::Parked { temp_file }
            | Self::Delivered { temp_file } => Some(temp_file),
            Self::AwaitingBoth | Self::AwaitingFile { .. } | Self::Writing | Self::Storing => None,
        }
    }
}

#[derive(Debug)]
pub(super) struct PendingRequest {
    pub cache_key: CacheKey,
    pub is_cacheable: bool,
    pub generation: u64,
    pub join: JoinState,
    /// How often the cached artifact was written into a delivery file.
    pub write_attempts: usize,
    responder: Option<Responder>,
}

impl PendingRequest {
    pub fn new(
        cache_key: CacheKey,
        is_cacheable: bool,
        generation: u64,
        responder: Responder,
    ) -> Self {
        Self {
            cache_key,
            is_cacheable,
            generation,
            join: JoinState::AwaitingBoth,
            write_attempts: 0,
            responder: Some(responder),
        }
    }

    /// Resolves the caller's future.
    ///
    /// Returns the result back if nothing was delivered, either because the request was resolved
    /// before, or because the caller is no longer waiting for it.
    pub fn respond(
        &mut self,
        result: Result<ArtifactFile, ArtifactError>,
    ) -> Result<(), Result<ArtifactFile, ArtifactError>> {
        match self.responder.take() {
            Some(responder) => responder.send(result),
            None => Err(result),
        }
    }
}

/// The pending requests, indexed by their id.
#[derive(Debug, Default)]
pub(super) struct RequestTable {
    requests: HashMap<RequestId, PendingRequest>,
}

impl RequestTable {
    /// Inserts `request`, returning the request it replaces.
    pub fn insert(&mut self, id: RequestId, request: PendingRequest) -> Option<PendingRequest> {
        self.requests.insert(id, request)
    }

    pub fn remove(&mut self, id: &RequestId) -> Option<PendingRequest> {
        self.requests.remove(id)
    }

    /// Removes the request `ticket` was issued for, if it is still pending.
    pub fn take_live(&mut self, ticket: Ticket) -> Option<PendingRequest> {
        match self.requests.entry(ticket.id) {
            Entry::Occupied(entry) if entry.get().generation == ticket.generation => {
                Some(entry.remove())
            }
            _ => None,
        }
    }

    pub fn get_live(&self, ticket: Ticket) -> Option<&PendingRequest> {
        self.requests
            .get(&ticket.id)
            .filter(|request| request.generation == ticket.generation)
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.requests.contains_key(id)
    }

    pub fn get_mut(&mut self, id: &RequestId) -> Option<&mut PendingRequest> {
        self.requests.get_mut(id)
    }

    /// Whether another cacheable request is compiling the artifact for `key`.
    pub fn is_compiling(&self, key: &CacheKey) -> bool {
        self.requests.values().any(|request| {
            request.is_cacheable && request.join.is_compiling() && request.cache_key == *key
        })
    }

    /// Returns the cacheable requests for `key` that are ready for a new cache lookup.
    pub fn requeryable(&self, key: &CacheKey) -> Vec<Ticket> {
        self.requests
            .iter()
            .filter(|(_, request)| {
                request.is_cacheable && request.join.can_requery() && request.cache_key == *key
            })
            .map(|(id, request)| Ticket {
                id: *id,
                generation: request.generation,
            })
            .collect()
    }

    pub fn ids_for_client(&self, client_id: ClientId) -> Vec<RequestId> {
        self.requests
            .keys()
            .filter(|id| id.client_id == client_id)
            .copied()
            .collect()
    }

    pub fn count_parked(&self) -> usize {
        self.requests
            .values()
            .filter(|request| matches!(request.join, JoinState::Parked { .. }))
            .count()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Removes all requests, dropping their responders.
    pub fn clear(&mut self) {
        self.requests.clear();
    }
}

/// The lifecycle of the cache backend.
#[derive(Debug, Default)]
pub(super) enum CacheState {
    #[default]
    Uninitialized,
    Initializing,
    Ready(Arc<dyn CacheBackend>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_op_guard() {
        let outstanding = Arc::new(AtomicUsize::new(0));
        let first = BackendOp::acquire(&outstanding);
        let second = BackendOp::acquire(&outstanding);
        assert_eq!(outstanding.load(Ordering::Relaxed), 2);

        drop(first);
        assert_eq!(outstanding.load(Ordering::Relaxed), 1);
        drop(second);
        assert_eq!(outstanding.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_stale_tickets() {
        let mut table = RequestTable::default();
        let id = RequestId::new(1, 1);
        let key = CacheKey::for_testing("foo");

        let (responder, _rx) = oneshot::channel();
        table.insert(id, PendingRequest::new(key.clone(), true, 1, responder));
        let (responder, _rx) = oneshot::channel();
        let replaced = table.insert(id, PendingRequest::new(key, true, 2, responder));
        assert_eq!(replaced.map(|request| request.generation), Some(1));

        let stale = Ticket { id, generation: 1 };
        let live = Ticket { id, generation: 2 };
        assert!(table.get_live(stale).is_none());
        assert!(table.take_live(stale).is_none());
        assert_eq!(table.len(), 1);
        assert!(table.take_live(live).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_respond_once() {
        let (responder, mut rx) = oneshot::channel();
        let mut request = PendingRequest::new(CacheKey::for_testing("foo"), true, 1, responder);

        assert!(request.respond(Err(ArtifactError::Abandoned)).is_ok());
        assert!(matches!(
            request.respond(Err(ArtifactError::Cancelled)),
            Err(Err(ArtifactError::Cancelled))
        ));
        assert!(matches!(rx.try_recv(), Ok(Err(ArtifactError::Abandoned))));
    }
}
