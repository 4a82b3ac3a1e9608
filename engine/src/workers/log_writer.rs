//! Execution log writer worker
//!
//! Appends [`ExecutionLogEntry`] records as JSON lines to a session's
//! execution log. Producers hand entries over through a bounded queue and wait
//! when it is full, so no line is ever dropped.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::errors::EngineError;
use crate::models::report::ExecutionLogEntry;

/// Log writer options
#[derive(Debug, Clone)]
pub struct Options {
    /// Entries buffered before producers wait
    pub queue_capacity: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
        }
    }
}

/// Producer side of the writer
#[derive(Clone)]
pub struct LogWriter {
    tx: mpsc::Sender<ExecutionLogEntry>,
}

/// Running writer task
pub struct LogWriterHandle {
    handle: JoinHandle<Result<(), EngineError>>,
}

impl LogWriter {
    /// Open `path` for appending and start the writer task
    pub async fn spawn(
        path: PathBuf,
        options: &Options,
    ) -> Result<(LogWriter, LogWriterHandle), EngineError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        if ends_torn(&path).await? {
            warn!("Execution log {:?} ends with a torn line", path);
            file.write_all(b"\n").await?;
        }

        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
        let handle = tokio::spawn(run(path, BufWriter::new(file), rx));
        Ok((LogWriter { tx }, LogWriterHandle { handle }))
    }

    /// Queue an entry, waiting while the queue is full
    pub async fn append(&self, entry: ExecutionLogEntry) -> Result<(), EngineError> {
        self.tx
            .send(entry)
            .await
            .map_err(|_| EngineError::StorageError("execution log writer stopped".to_string()))
    }
}

/// Whether a non-empty log lacks its final newline
async fn ends_torn(path: &Path) -> Result<bool, EngineError> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] != b'\n')
}

impl LogWriterHandle {
    /// Wait for the task to drain its queue; every [`LogWriter`] must be dropped first
    pub async fn join(self) -> Result<(), EngineError> {
        self.handle
            .await
            .map_err(|e| EngineError::Internal(format!("log writer task failed: {}", e)))?
    }
}

async fn run(
    path: PathBuf,
    mut out: BufWriter<tokio::fs::File>,
    mut rx: mpsc::Receiver<ExecutionLogEntry>,
) -> Result<(), EngineError> {
    debug!("Execution log writer started for {:?}", path);
    let mut written: u64 = 0;

    while let Some(entry) = rx.recv().await {
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        if let Err(e) = out.write_all(&line).await {
            error!("Unable to append to {:?}: {}", path, e);
            return Err(e.into());
        }
        written += 1;
    }

    out.flush().await?;
    out.get_ref().sync_data().await?;
    info!("Execution log closed after {} entries", written);
    Ok(())
}

/// Read back the entries of an execution log
pub async fn read_entries(path: &Path) -> Result<Vec<ExecutionLogEntry>, EngineError> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    // A crash can leave a torn final line behind
    Ok(contents
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}
