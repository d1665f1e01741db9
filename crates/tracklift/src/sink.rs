//! Destinations for decrypted track data.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

/// Receives plaintext in track order.
///
/// Nothing becomes visible under the final name until [`finish`] succeeds;
/// [`abort`] discards everything written so far.
///
/// [`finish`]: OutputSink::finish
/// [`abort`]: OutputSink::abort
#[async_trait]
pub trait OutputSink: Send {
    async fn write(&mut self, chunk: &[u8]) -> std::io::Result<()>;

    async fn finish(&mut self) -> std::io::Result<()>;

    async fn abort(&mut self) -> std::io::Result<()>;
}

/// Writes to `<path>.part` and renames to `<path>` on finish.
pub struct FileSink {
    path: PathBuf,
    part_path: PathBuf,
    writer: Option<BufWriter<File>>,
    written: u64,
}

impl FileSink {
    pub async fn create(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part_path = part_path(&path);
        let file = File::create(&part_path).await?;
        debug!(path = %part_path.display(), "Opened output");
        Ok(Self {
            path,
            part_path,
            writer: Some(BufWriter::new(file)),
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn part_path(&self) -> &Path {
        &self.part_path
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

fn closed() -> std::io::Error {
    std::io::Error::other("output already finished or aborted")
}

#[async_trait]
impl OutputSink for FileSink {
    async fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        let writer = self.writer.as_mut().ok_or_else(closed)?;
        writer.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    async fn finish(&mut self) -> std::io::Result<()> {
        let mut writer = self.writer.take().ok_or_else(closed)?;
        writer.flush().await?;
        writer.get_ref().sync_all().await?;
        drop(writer);
        tokio::fs::rename(&self.part_path, &self.path).await?;
        debug!(path = %self.path.display(), bytes = self.written, "Output finished");
        Ok(())
    }

    async fn abort(&mut self) -> std::io::Result<()> {
        self.writer.take();
        match tokio::fs::remove_file(&self.part_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(path = %self.part_path.display(), error = %e, "Failed to remove partial output");
                Err(e)
            }
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub enum MemoryOutputState {
    #[default]
    Open,
    Finished,
    Aborted,
}

#[derive(Debug, Default)]
struct MemoryOutput {
    data: Vec<u8>,
    state: MemoryOutputState,
}

/// In-memory sink. Clones share the same buffer, so one handle can be given
/// to the pipeline and another kept for reading.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<MemoryOutput>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inner.lock().data.clone()
    }

    pub fn state(&self) -> MemoryOutputState {
        self.inner.lock().state.clone()
    }
}

#[async_trait]
impl OutputSink for MemorySink {
    async fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != MemoryOutputState::Open {
            return Err(closed());
        }
        inner.data.extend_from_slice(chunk);
        Ok(())
    }

    async fn finish(&mut self) -> std::io::Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != MemoryOutputState::Open {
            return Err(closed());
        }
        inner.state = MemoryOutputState::Finished;
        Ok(())
    }

    async fn abort(&mut self) -> std::io::Result<()> {
        let mut inner = self.inner.lock();
        inner.data.clear();
        inner.state = MemoryOutputState::Aborted;
        Ok(())
    }
}
