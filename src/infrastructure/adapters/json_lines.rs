//! Newline-delimited JSON sink.
//!
//! Each metric becomes one JSON object on its own line:
//!
//! ```text
//! {"attributes":{..},"kind":"gauge","name":"db.query.duration","resource":{..},"timestamp_unix_nano":1700000000000000000,"unit":"ms","value":12.5}
//! ```
//!
//! Keys are sorted, so the output is stable across runs. A batch is encoded
//! completely before anything is written and the sink lock is held for the
//! whole write, so lines from concurrent batches never interleave.
//!
//! The write itself runs on a detached task that owns the sink lock. If the
//! caller's future is dropped mid-write (an export timeout), the task still
//! finishes the buffer, and the next batch waits for it. A torn line never
//! reaches the sink.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::application::ports::{ExportAdapter, ExportOutcome};
use crate::domain::metric::{ExportBatch, UnifiedMetric};
use crate::error::ExportError;

type Sink = Box<dyn AsyncWrite + Send + Unpin>;

/// Writes metrics as JSON lines to stdout or an append-only file.
pub struct JsonLinesAdapter {
    sink: Arc<Mutex<Sink>>,
    path: Option<PathBuf>,
}

impl fmt::Debug for JsonLinesAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonLinesAdapter")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl JsonLinesAdapter {
    /// Write to the process's standard output.
    pub fn stdout() -> Self {
        Self {
            sink: Arc::new(Mutex::new(Box::new(tokio::io::stdout()))),
            path: None,
        }
    }

    /// Append to `path`, creating it if needed.
    ///
    /// # Errors
    /// Returns the error from opening the file.
    pub fn append_to(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            sink: Arc::new(Mutex::new(Box::new(tokio::fs::File::from_std(file)))),
            path: Some(path.to_path_buf()),
        })
    }

    /// Write to an arbitrary sink.
    pub fn with_writer<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            sink: Arc::new(Mutex::new(Box::new(writer))),
            path: None,
        }
    }

    /// File being appended to, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Encode one metric as a single JSON line, without the trailing newline.
pub fn encode_line(metric: &UnifiedMetric) -> Result<String, ExportError> {
    let line = json!({
        "name": metric.name,
        "kind": metric.kind,
        "unit": metric.unit,
        "value": metric.value,
        "timestamp_unix_nano": metric.timestamp_unix_nanos(),
        "resource": metric.resource.attributes(),
        "attributes": metric.attributes,
    });
    serde_json::to_string(&line).map_err(|e| ExportError::Encode(e.to_string()))
}

#[async_trait]
impl ExportAdapter for JsonLinesAdapter {
    fn kind(&self) -> &'static str {
        "json_lines"
    }

    async fn export(&self, batch: &ExportBatch) -> Result<ExportOutcome, ExportError> {
        let mut buf = String::new();
        for metric in batch.metrics() {
            buf.push_str(&encode_line(metric)?);
            buf.push('\n');
        }

        let sink = Arc::clone(&self.sink);
        let write = tokio::spawn(async move {
            let mut sink = sink.lock_owned().await;
            sink.write_all(buf.as_bytes()).await?;
            sink.flush().await
        });
        write
            .await
            .map_err(|e| ExportError::Aborted(e.to_string()))??;

        Ok(ExportOutcome::delivered(batch.len() as u64))
    }
}
