//! Data directories and the jobs in them.

use crate::error::{DlsError, Result};
use crate::reader::channel::{CatalogConfig, Channel};
use crate::reader::remote::RemoteClient;
use crate::store::index::{IndexFile, MessageIndexRecord};
use crate::store::layout;
use crate::store::message::Message;
use crate::store::record::{RecordReader, DEFAULT_READ_CHUNK_SIZE};
use crate::store::Time;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
enum Source {
    Local(PathBuf),
    Remote(RemoteClient),
}

/// A local data directory or a remote directory server.
#[derive(Debug, Clone)]
pub struct Directory {
    source: Source,
    config: CatalogConfig,
}

impl Directory {
    /// Opens the local data directory `path`.
    pub fn open(path: impl Into<PathBuf>, config: CatalogConfig) -> Result<Self> {
        let path = path.into();
        if !path.is_dir() {
            return Err(DlsError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not a directory", path.display()),
            )));
        }
        Ok(Self {
            source: Source::Local(path),
            config,
        })
    }

    /// Uses the directory served by `client`.
    pub fn connect(client: RemoteClient, config: CatalogConfig) -> Self {
        Self {
            source: Source::Remote(client),
            config,
        }
    }

    /// Returns `true` for a remote directory.
    pub fn is_remote(&self) -> bool {
        matches!(self.source, Source::Remote(_))
    }

    /// Local path of the directory.
    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            Source::Local(path) => Some(path),
            Source::Remote(_) => None,
        }
    }

    /// Ids of the jobs in ascending order.
    pub fn job_ids(&self) -> Result<Vec<u32>> {
        match &self.source {
            Source::Local(path) => Ok(layout::list_numbered(path, "job")?
                .into_iter()
                .filter(|(_, dir)| dir.is_dir())
                .filter_map(|(id, _)| u32::try_from(id).ok())
                .collect()),
            Source::Remote(client) => client.list_jobs(),
        }
    }

    /// The job `id`. Its channels are not read until
    /// [`JobDir::fetch_channels`].
    pub fn job(&self, id: u32) -> Result<JobDir> {
        let source = match &self.source {
            Source::Local(path) => {
                let dir = layout::job_dir(path, id);
                if !dir.is_dir() {
                    return Err(DlsError::Io(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("{} does not exist", dir.display()),
                    )));
                }
                Source::Local(dir)
            }
            Source::Remote(client) => Source::Remote(client.clone()),
        };
        Ok(JobDir {
            id,
            source,
            config: self.config,
            channels: BTreeMap::new(),
        })
    }

    /// All jobs.
    pub fn jobs(&self) -> Result<Vec<JobDir>> {
        self.job_ids()?.into_iter().map(|id| self.job(id)).collect()
    }
}

impl fmt::Display for Directory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Source::Local(path) => write!(f, "{}", path.display()),
            Source::Remote(client) => write!(f, "dls://{}", client.addr()),
        }
    }
}

/// One job of a [`Directory`].
#[derive(Debug)]
pub struct JobDir {
    id: u32,
    source: Source,
    config: CatalogConfig,
    channels: BTreeMap<u32, Channel>,
}

impl JobDir {
    /// Job id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Local job directory.
    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            Source::Local(path) => Some(path),
            Source::Remote(_) => None,
        }
    }

    /// Reads the channel list. Channels already known keep their chunk
    /// catalog; channels that fail to import are logged and skipped.
    pub fn fetch_channels(&mut self) -> Result<()> {
        match &self.source {
            Source::Local(path) => {
                let entries = layout::list_numbered(path, "channel")?;
                let mut channels = BTreeMap::new();
                for (index, dir) in entries {
                    let Ok(index) = u32::try_from(index) else {
                        continue;
                    };
                    if let Some(channel) = self.channels.remove(&index) {
                        channels.insert(index, channel);
                        continue;
                    }
                    match Channel::import(&dir, self.config) {
                        Ok(channel) => {
                            channels.insert(index, channel);
                        }
                        Err(e) => warn!("Skipping channel {}: {}", dir.display(), e),
                    }
                }
                self.channels = channels;
            }
            Source::Remote(client) => {
                let listed = client.list_channels(self.id)?;
                let mut channels = BTreeMap::new();
                for info in listed {
                    let index = info.index;
                    let channel = match self.channels.remove(&index) {
                        Some(channel) if channel.info() == &info => channel,
                        _ => Channel::remote(client.clone(), self.id, info, self.config),
                    };
                    channels.insert(index, channel);
                }
                self.channels = channels;
            }
        }
        debug!("Job {}: {} channels", self.id, self.channels.len());
        Ok(())
    }

    /// Channels in index order.
    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    /// Channels in index order, for chunk discovery.
    pub fn channels_mut(&mut self) -> impl Iterator<Item = &mut Channel> {
        self.channels.values_mut()
    }

    /// Channel `channel<index>`.
    pub fn channel(&self, index: u32) -> Option<&Channel> {
        self.channels.get(&index)
    }

    /// Channel `channel<index>`, for chunk discovery.
    pub fn channel_mut(&mut self, index: u32) -> Option<&mut Channel> {
        self.channels.get_mut(&index)
    }

    /// First channel named `name`.
    pub fn find_channel(&self, name: &str) -> Option<&Channel> {
        self.channels.values().find(|c| c.name() == name)
    }

    /// Messages with `start <= time < end`, in time order.
    pub fn load_messages(&self, start: Time, end: Time) -> Result<Vec<Message>> {
        let path = match &self.source {
            Source::Local(path) => path,
            Source::Remote(client) => return client.load_messages(self.id, start, end),
        };
        let messages_dir = path.join(layout::MESSAGES_DIR);
        if start >= end || !messages_dir.is_dir() {
            return Ok(Vec::new());
        }

        let chunks: Vec<(u64, PathBuf)> = layout::list_numbered(&messages_dir, "chunk")?
            .into_iter()
            .take_while(|(time, _)| *time < end)
            .collect();
        // A chunk ends where its successor begins.
        let first = chunks
            .windows(2)
            .take_while(|pair| pair[1].0 <= start)
            .count();

        let mut messages = Vec::new();
        for (_, dir) in &chunks[first..] {
            if let Err(e) = read_message_chunk(dir, start, end, &mut messages) {
                warn!("Failed to read messages in {}: {}", dir.display(), e);
            }
        }
        Ok(messages)
    }
}

/// Appends the messages of one message chunk that fall into `[start, end)`.
fn read_message_chunk(
    dir: &Path,
    start: Time,
    end: Time,
    messages: &mut Vec<Message>,
) -> Result<()> {
    let data_path = dir.join(layout::MESSAGES_FILE);
    let mut reader = RecordReader::open(&data_path, DEFAULT_READ_CHUNK_SIZE)?;

    match IndexFile::<MessageIndexRecord>::open(dir.join(layout::MESSAGES_INDEX))
        .and_then(|mut index| index.read_all())
    {
        Ok(rows) => match rows.iter().find(|row| row.time >= start) {
            Some(row) => reader.seek(row.position)?,
            None => return Ok(()),
        },
        Err(e) => debug!("Scanning {} without index: {}", data_path.display(), e),
    }

    while let Some(tag) = reader.next_tag()? {
        let message = Message::from_tag(&tag, &data_path)?;
        if message.time >= end {
            break;
        }
        if message.time >= start {
            messages.push(message);
        }
    }
    Ok(())
}
