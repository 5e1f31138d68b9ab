use carbonhouse_clickhouse::InsertError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("read failed at line {line_no}: {source}")]
    Read {
        line_no: u64,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed line {line_no}: {reason}")]
    Malformed { line_no: u64, reason: String },
}

impl IndexError {
    pub(crate) fn malformed(line_no: u64, reason: impl Into<String>) -> Self {
        Self::Malformed {
            line_no,
            reason: reason.into(),
        }
    }
}

/// Failure of a single file. The file stays on disk and is picked up again
/// by a later scan.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("open failed: {0}")]
    Open(#[source] std::io::Error),
    #[error("stat failed: {0}")]
    Stat(#[source] std::io::Error),
    #[error("reopen for index failed: {0}")]
    Reopen(#[source] std::io::Error),
    #[error("upload to {table} failed: {source}")]
    Upload {
        table: String,
        #[source]
        source: InsertError,
    },
    #[error("tree index build failed: {0}")]
    Index(#[from] IndexError),
}

pub type ProcessResult<T> = Result<T, ProcessError>;
