use crate::cache::TreeCache;
use crate::error::{ProcessError, ProcessResult};
use crate::index::build_tree;
use crate::options::UploaderOptions;
use crate::sink::TableSink;
use carbonhouse_clickhouse::InsertPayload;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const INDEX_READ_BUFFER: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    /// Zero-length file, nothing sent.
    Empty,
    /// Raw data and, when enabled, tree rows accepted by the store.
    Uploaded { tree_rows: usize },
}

/// Uploads one file: raw data first, then its tree rows, then commits the
/// new tree keys to the shared cache.
///
/// Any error leaves the file fully retryable: the cache is only touched
/// after the tree insert succeeded.
pub struct FileProcessor {
    sink: Arc<dyn TableSink>,
    cache: Arc<TreeCache>,
    data_table: String,
    data_timeout: Duration,
    tree_table: Option<String>,
    tree_timeout: Duration,
}

impl FileProcessor {
    pub fn new(options: &UploaderOptions, sink: Arc<dyn TableSink>, cache: Arc<TreeCache>) -> Self {
        Self {
            sink,
            cache,
            data_table: options.data_table.clone(),
            data_timeout: options.data_timeout,
            tree_table: options.tree_table.clone(),
            tree_timeout: options.tree_timeout,
        }
    }

    pub async fn process(&self, path: &Path) -> ProcessResult<FileOutcome> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(ProcessError::Open)?;
        let len = file.metadata().await.map_err(ProcessError::Stat)?.len();

        if len == 0 {
            info!("{} is empty", path.display());
            return Ok(FileOutcome::Empty);
        }

        self.sink
            .insert_tab_separated(
                &self.data_table,
                self.data_timeout,
                InsertPayload::File { file, len },
            )
            .await
            .map_err(|source| ProcessError::Upload {
                table: self.data_table.clone(),
                source,
            })?;

        let Some(tree_table) = self.tree_table.as_deref() else {
            return Ok(FileOutcome::Uploaded { tree_rows: 0 });
        };

        let file = std::fs::File::open(path).map_err(ProcessError::Reopen)?;
        let batch = build_tree(
            BufReader::with_capacity(INDEX_READ_BUFFER, file),
            &self.cache,
        )?;
        debug!(
            "{}: {} lines, {} new tree rows",
            path.display(),
            batch.lines,
            batch.rows
        );

        let tree_rows = batch.rows;
        self.sink
            .insert_tab_separated(
                tree_table,
                self.tree_timeout,
                InsertPayload::Bytes(batch.payload),
            )
            .await
            .map_err(|source| ProcessError::Upload {
                table: tree_table.to_string(),
                source,
            })?;

        self.cache.extend(batch.keys);

        Ok(FileOutcome::Uploaded { tree_rows })
    }
}
