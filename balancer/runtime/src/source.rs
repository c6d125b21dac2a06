//! Reads service updates as newline-delimited JSON.
//!
//! ```text
//! {"op":"apply","name":"web","address":"10.0.0.5","port":80,"instances":[{"name":"web-0","address":"10.0.1.1","port":8080}]}
//! {"op":"delete","name":"web"}
//! ```
//!
//! Blank lines and lines starting with `#` are ignored.

use crate::core::ServiceUpdate;
use anyhow::{Context, Result};
use std::path::Path;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    sync::mpsc,
};

/// Opens the update stream at `path`, where `-` denotes stdin.
pub async fn open(path: &Path) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
    if path == Path::new("-") {
        return Ok(Box::new(tokio::io::stdin()));
    }

    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    Ok(Box::new(file))
}

/// Forwards every well-formed update read from `reader` to `tx`.
///
/// Returns once the reader is exhausted or the receiver has been dropped.
pub async fn read_updates<R>(reader: R, tx: mpsc::Sender<ServiceUpdate>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut lineno = 0usize;
    while let Some(line) = lines.next_line().await.context("failed to read updates")? {
        lineno += 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let update = match serde_json::from_str::<ServiceUpdate>(line) {
            Ok(update) => update,
            Err(error) => {
                tracing::warn!(line = lineno, %error, "Skipping malformed update");
                continue;
            }
        };
        tracing::trace!(line = lineno, service = %update.name(), "Read update");
        if tx.send(update).await.is_err() {
            tracing::debug!("Update receiver dropped");
            return Ok(());
        }
    }

    tracing::info!(updates = lineno, "Update stream complete");
    Ok(())
}
