use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemBackendConfig {
    /// The directory holding the cache entries. It is created when the backend is opened.
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InMemoryBackendConfig {
    /// The capacity of the cache in bytes.
    #[serde(default = "default_in_memory_capacity")]
    pub capacity: u64,
}

impl Default for InMemoryBackendConfig {
    fn default() -> Self {
        Self {
            capacity: default_in_memory_capacity(),
        }
    }
}

/// The backend storing compiled artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendConfig {
    Filesystem(FilesystemBackendConfig),
    InMemory(InMemoryBackendConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::InMemory(InMemoryBackendConfig::default())
    }
}

fn default_in_memory_capacity() -> u64 {
    // 256 MiB
    256 * 1024 * 1024
}
