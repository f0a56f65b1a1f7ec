//! File-backed instance group database for host-side device orchestration.
//!
//! Tracks virtual-device instance groups across concurrent, uncoordinated
//! CLI invocations. The canonical state is a single serialized record in a
//! backing file; every operation is a transaction under a whole-file
//! advisory lock (shared for queries, exclusive for mutations), with the
//! rewrite phase protected from INT/HUP/TERM by a scoped signal mask.
//! Long-running callers can push interrupt listeners to clean up
//! deterministically when one of those signals arrives.

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

pub mod db;
pub mod errors;
pub mod signals;
pub mod viewer;

pub use db::{Filter, Instance, InstanceDatabase, InstanceGroup, PersistentData};
pub use errors::{DbError, DbResult};
pub use signals::{InterruptListenerHandle, SignalMasker, push_interrupt_listener};
pub use viewer::DataViewer;

static LOG_INIT: OnceLock<()> = OnceLock::new();

/// Initialize tracing output to stderr for embedders that don't configure
/// their own subscriber.
///
/// Uses the `RUST_LOG` environment variable for filtering (defaults to
/// `info`). Idempotent: subsequent calls return immediately once
/// initialized, and a subscriber already registered by the host wins.
pub fn init_logging() {
    LOG_INIT.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new("info"))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .try_init();
    });
}
