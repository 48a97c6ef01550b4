//! Artifactcache.
//!
//! A command line host for the artifact cache service. It requests compiled artifacts from the
//! configured cache backend, stores freshly compiled artifacts on a miss, and clears cache
//! entries by the time they were stored.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
