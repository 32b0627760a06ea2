#![deny(missing_docs)]
//! # nscage front-ends
//!
//! Command-line surfaces over the `nscage-core` namespace engine:
//!
//! - **nsmnt**: run a command in its own mount namespace built from
//!   `-m`/`-o` mount and overlay specs.
//! - **nscage**: isolate a program in a pivoted-root container, create a
//!   joinable namespace reference, or join an existing one.
//!
//! This crate only parses and validates arguments; all heavy lifting is
//! delegated to `nscage-core`.

pub mod adapter;
pub mod parser;
pub mod runner;

use tracing_subscriber::EnvFilter;

/// Install the stderr tracing subscriber, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}
