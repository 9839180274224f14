//! CLI command implementations. Each command opens the store against the
//! queue root, does its work, and returns the process exit code.

pub mod add;
pub mod build_image;
pub mod cleanup;
pub mod review;
pub mod run;
pub mod status;
pub mod transitions;

use anyhow::{Context, Result};

use crate::paths::QueuePaths;
use crate::store::QueueStore;

/// Bootstrap the queue tree and open the record store.
fn open_store(paths: &QueuePaths) -> Result<QueueStore> {
    paths.ensure_dirs()?;
    QueueStore::open(paths.tasks_file())
        .with_context(|| format!("failed to open {}", paths.tasks_file().display()))
}
