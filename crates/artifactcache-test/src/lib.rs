//! Helpers for testing the artifact cache service.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the filesystem backend will lazily
//!    create it again and the directory leaks. Assign it to a variable in the test function
//!    (e.g. `let cache_dir = test::tempdir()`).
//!
//!  - Wrap futures that resolve through the coordinator in [`timeout`], so that a lost
//!    completion fails the test instead of hanging it.

use std::future::Future;
use std::time::Duration;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// How long [`timeout`] waits before failing a test.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `artifactcache_service` crate and
///    mutes all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("artifactcache_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`keep`](TempDir::keep) is called. Use it as a guard to automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Awaits `future`, panicking if it does not resolve within [`TEST_TIMEOUT`].
///
/// # Panics
///
/// Panics when the timeout elapses.
pub async fn timeout<F: Future>(future: F) -> F::Output {
    match tokio::time::timeout(TEST_TIMEOUT, future).await {
        Ok(output) => output,
        Err(_) => panic!("future did not resolve within {TEST_TIMEOUT:?}"),
    }
}
