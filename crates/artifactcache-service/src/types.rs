//! Types making up the public API of the artifact cache service.

use std::fmt;
use std::fs::File;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::caching::CacheKeyError;

/// Identifies a connected client process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ClientId(pub u32);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifies one artifact request.
///
/// A client may have multiple requests in flight, distinguished by their `scope_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct RequestId {
    pub client_id: ClientId,
    pub scope_id: u32,
}

impl RequestId {
    pub fn new(client_id: u32, scope_id: u32) -> Self {
        Self {
            client_id: ClientId(client_id),
            scope_id,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client_id, self.scope_id)
    }
}

/// Describes the portable module an artifact is compiled from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ModuleMetadata {
    /// The URL the module was loaded from.
    pub url: String,
    /// The bitcode ABI version of the module.
    pub abi_version: i32,
    /// The requested optimization level.
    pub opt_level: i32,
    /// Whether the fast code generator is used.
    pub use_subzero: bool,
    /// The `Last-Modified` time of the module, if known.
    #[serde(with = "humantime_serde")]
    pub last_modified: Option<SystemTime>,
    /// The `ETag` of the module.
    pub etag: String,
    /// The instruction set the artifact is compiled for.
    pub sandbox_isa: String,
    /// Additional compiler flags.
    pub extra_flags: String,
    /// Set when the HTTP caching headers of the module forbid storing it.
    pub no_store: bool,
}

/// A compiled artifact handed to a client.
#[derive(Debug)]
pub struct ArtifactFile {
    /// The file to read the artifact from, or to compile it into on a miss.
    pub file: File,
    /// Whether `file` already contains the cached artifact.
    ///
    /// On a miss, the client is expected to compile into `file` and then call
    /// [`finish_artifact`](crate::ArtifactCacheService::finish_artifact).
    pub is_hit: bool,
}

/// The ways a request for an artifact can fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArtifactError {
    /// No cache key could be derived from the module metadata.
    #[error("invalid module metadata")]
    InvalidMetadata(#[from] CacheKeyError),
    /// Creating or duplicating the delivery file failed.
    #[error("failed to create temp file: {0}")]
    TempFile(String),
    /// Writing the cached artifact into the delivery file failed.
    #[error("failed to write cached artifact: {0}")]
    Write(String),
    /// The request was finished before anything was delivered.
    #[error("request finished before delivery")]
    Abandoned,
    /// The request was dropped, either by its client going away, by a newer request with the
    /// same id, or by the service shutting down.
    #[error("request cancelled")]
    Cancelled,
    /// The cache backend failed.
    #[error("cache backend failed: {0}")]
    Backend(String),
}
