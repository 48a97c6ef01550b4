//! Cache keys and the backends storing compiled artifacts.

mod backend;
mod cache_error;
mod cache_key;
mod config;
mod fs;
mod memory;

pub use backend::{BackendFactory, CacheBackend};
pub use cache_error::{BackendError, CacheKeyError};
pub use cache_key::{CacheKey, CacheKeyBuilder, MAX_EXTRA_FLAGS_LEN};
pub use config::{BackendConfig, FilesystemBackendConfig, InMemoryBackendConfig};
pub use fs::FilesystemBackend;
pub use memory::InMemoryBackend;
