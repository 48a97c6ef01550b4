use std::io;

use thiserror::Error;

/// An error deriving a [`CacheKey`](super::CacheKey) from module metadata.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheKeyError {
    /// The module URL could not be parsed.
    #[error("invalid module url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The module URL has no hierarchical structure, like `data:` URLs.
    #[error("module url cannot be a base")]
    CannotBeABase,
    #[error("negative abi version: {0}")]
    NegativeAbiVersion(i32),
    #[error("negative optimization level: {0}")]
    NegativeOptLevel(i32),
    #[error("extra compiler flags too long: {0} bytes")]
    ExtraFlagsTooLong(usize),
}

/// An error produced by a [`CacheBackend`](super::CacheBackend).
#[derive(Debug, Error)]
pub enum BackendError {
    /// Accessing the underlying storage failed.
    #[error("cache backend i/o error")]
    Io(#[from] io::Error),
    /// The backend could not be opened.
    #[error("failed to open cache backend: {0}")]
    Open(String),
    /// Any other failure, described by the backend.
    #[error("cache backend error: {0}")]
    Other(String),
}
