//! Indexed job message log.

use crate::error::Result;
use crate::store::index::{IndexFile, MessageIndexRecord};
use crate::store::layout;
use crate::store::message::Message;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

struct OpenChunk {
    dir: PathBuf,
    file: File,
    size: u64,
    index: IndexFile<MessageIndexRecord>,
}

/// Appends messages to `job<N>/messages/chunk<T>/`.
///
/// The message chunk is created by the first message after construction or
/// after [`MessageLog::close`], named by that message's time.
pub struct MessageLog {
    job_dir: PathBuf,
    open: Option<OpenChunk>,
}

impl MessageLog {
    /// Creates a log for the job directory `job_dir`.
    pub fn new(job_dir: impl Into<PathBuf>) -> Self {
        Self {
            job_dir: job_dir.into(),
            open: None,
        }
    }

    /// Appends `message`, starting a message chunk if none is open.
    pub fn append(&mut self, message: &Message) -> Result<()> {
        if self.open.is_none() {
            self.open = Some(self.begin_chunk(message)?);
        }
        let Some(chunk) = self.open.as_mut() else {
            return Ok(());
        };

        let line = message.render();
        let position = chunk.size;
        chunk.file.write_all(line.as_bytes())?;
        chunk.size += line.len() as u64;
        chunk.index.append(&MessageIndexRecord {
            time: message.time,
            position,
        })?;
        Ok(())
    }

    /// Ends the current message chunk.
    pub fn close(&mut self) {
        if let Some(chunk) = self.open.take() {
            debug!("Closed message chunk {}", chunk.dir.display());
        }
    }

    /// Directory of the open message chunk.
    pub fn chunk_dir(&self) -> Option<&Path> {
        self.open.as_ref().map(|c| c.dir.as_path())
    }

    fn begin_chunk(&self, first: &Message) -> Result<OpenChunk> {
        let dir = layout::message_chunk_dir(&self.job_dir, first.time);
        fs::create_dir_all(&dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(layout::MESSAGES_FILE))?;
        let size = file.metadata()?.len();
        let index = IndexFile::open_rw(dir.join(layout::MESSAGES_INDEX))?;
        debug!("Began message chunk {}", dir.display());
        Ok(OpenChunk {
            dir,
            file,
            size,
            index,
        })
    }
}
