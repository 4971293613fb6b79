//! Channel catalog: chunk discovery and range queries over all chunks.

use crate::error::{DlsError, Result};
use crate::reader::chunk::{Chunk, ChunkInfo, FetchSummary};
use crate::reader::data::DataSink;
use crate::reader::remote::RemoteClient;
use crate::store::index::{self, ChannelIndexRecord, IndexFile, OPEN_END};
use crate::store::layout;
use crate::store::meta::ChannelXml;
use crate::store::record::DEFAULT_READ_CHUNK_SIZE;
use crate::store::{ScalarType, Time};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Read-side tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogConfig {
    /// Seed [`Channel::fetch_chunks`] from `channel.idx`, so closed chunks
    /// are not re-read from their indices.
    pub use_index_cache: bool,
    /// Bytes read per step while parsing block records.
    pub read_chunk_size: usize,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            use_index_cache: true,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}

/// A channel as listed by a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// `M` of `channel<M>`.
    pub index: u32,
    /// Contents of `channel.xml`.
    pub channel: ChannelXml,
}

/// Changes found by one [`Channel::fetch_chunks`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkUpdate {
    /// Chunks that are new or whose range was re-read.
    pub touched: Vec<Time>,
    /// Chunks that disappeared.
    pub removed: Vec<Time>,
}

impl ChunkUpdate {
    /// Returns `true` if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.touched.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug)]
enum Backend {
    Local {
        dir: PathBuf,
        chunks: BTreeMap<Time, Chunk>,
    },
    Remote {
        client: RemoteClient,
        job: u32,
        chunks: BTreeMap<Time, ChunkInfo>,
    },
}

/// One channel of a job and the chunks discovered so far.
///
/// Not synchronized: callers sharing a channel serialize access themselves.
#[derive(Debug)]
pub struct Channel {
    info: ChannelInfo,
    config: CatalogConfig,
    backend: Backend,
    range: Option<(Time, Time)>,
}

impl Channel {
    /// Reads `channel.xml` of the channel directory `dir`.
    pub fn import(dir: impl Into<PathBuf>, config: CatalogConfig) -> Result<Self> {
        let dir = dir.into();
        let index = dir
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| layout::parse_numbered(name, "channel"))
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| DlsError::corrupt(&dir, "not a channel directory"))?;
        let channel = ChannelXml::read(&dir.join(layout::CHANNEL_XML))?;
        Ok(Self {
            info: ChannelInfo { index, channel },
            config,
            backend: Backend::Local {
                dir,
                chunks: BTreeMap::new(),
            },
            range: None,
        })
    }

    /// A channel served by a remote directory.
    pub fn remote(client: RemoteClient, job: u32, info: ChannelInfo, config: CatalogConfig) -> Self {
        Self {
            info,
            config,
            backend: Backend::Remote {
                client,
                job,
                chunks: BTreeMap::new(),
            },
            range: None,
        }
    }

    /// `M` of `channel<M>`.
    pub fn index(&self) -> u32 {
        self.info.index
    }

    /// Channel name.
    pub fn name(&self) -> &str {
        &self.info.channel.name
    }

    /// Physical unit.
    pub fn unit(&self) -> &str {
        &self.info.channel.unit
    }

    /// Sample type.
    pub fn scalar(&self) -> ScalarType {
        self.info.channel.scalar
    }

    /// Directory entry describing the channel.
    pub fn info(&self) -> &ChannelInfo {
        &self.info
    }

    /// Returns `true` if the channel is read through a remote directory.
    pub fn is_remote(&self) -> bool {
        matches!(self.backend, Backend::Remote { .. })
    }

    /// Local channel directory.
    pub fn dir(&self) -> Option<&Path> {
        match &self.backend {
            Backend::Local { dir, .. } => Some(dir),
            Backend::Remote { .. } => None,
        }
    }

    /// Earliest start and latest end over all chunks.
    pub fn range(&self) -> Option<(Time, Time)> {
        self.range
    }

    /// Number of known chunks.
    pub fn chunk_count(&self) -> usize {
        match &self.backend {
            Backend::Local { chunks, .. } => chunks.len(),
            Backend::Remote { chunks, .. } => chunks.len(),
        }
    }

    /// Catalog entries of all known chunks, ordered by start time.
    pub fn chunk_infos(&self) -> Vec<ChunkInfo> {
        match &self.backend {
            Backend::Local { chunks, .. } => chunks.values().map(Chunk::info).collect(),
            Backend::Remote { chunks, .. } => chunks.values().cloned().collect(),
        }
    }

    /// Local chunk named by `start`.
    pub fn chunk(&self, start: Time) -> Option<&Chunk> {
        match &self.backend {
            Backend::Local { chunks, .. } => chunks.get(&start),
            Backend::Remote { .. } => None,
        }
    }

    /// Discovers new and removed chunks and re-reads the end of chunks that
    /// are still being written.
    ///
    /// Chunks that fail to import are logged and left out.
    pub fn fetch_chunks(&mut self) -> Result<ChunkUpdate> {
        let update = match &mut self.backend {
            Backend::Local { dir, chunks } => {
                fetch_local(dir, chunks, self.info.channel.scalar, &self.config)?
            }
            Backend::Remote {
                client,
                job,
                chunks,
            } => {
                let listed: BTreeMap<Time, ChunkInfo> = client
                    .list_chunks(*job, self.info.index)?
                    .into_iter()
                    .map(|c| (c.start, c))
                    .collect();
                let mut update = ChunkUpdate::default();
                for (time, chunk) in &listed {
                    if chunks.get(time) != Some(chunk) {
                        update.touched.push(*time);
                    }
                }
                update.removed = chunks
                    .keys()
                    .filter(|t| !listed.contains_key(t))
                    .copied()
                    .collect();
                *chunks = listed;
                update
            }
        };

        self.range = self.chunk_infos().iter().fold(None, |range, c| match range {
            None => Some((c.start, c.end)),
            Some((start, end)) => Some((start.min(c.start), end.max(c.end))),
        });
        debug!(
            "Channel {}: {} chunks, {} touched, {} removed",
            self.info.index,
            self.chunk_count(),
            update.touched.len(),
            update.removed.len()
        );
        Ok(update)
    }

    /// Delivers the values in `[start, end)` of all chunks to `sink`, in
    /// chunk order.
    ///
    /// A chunk that fails to read is logged and skipped; blocks it delivered
    /// before the failure stay with the sink.
    pub fn fetch_data(
        &self,
        start: Time,
        end: Time,
        min_values: u32,
        decimation: u32,
        sink: &mut dyn DataSink,
    ) -> Result<FetchSummary> {
        let mut summary = FetchSummary::default();
        if start >= end {
            return Ok(summary);
        }
        match &self.backend {
            Backend::Local { chunks, .. } => {
                for chunk in chunks.values() {
                    match chunk.fetch_data(start, end, min_values, decimation, sink) {
                        Ok(s) => summary.absorb(s),
                        Err(e) => error!("Chunk {}: fetch aborted: {}", chunk.dir().display(), e),
                    }
                }
            }
            Backend::Remote { client, job, .. } => {
                summary = client.fetch_data(
                    *job,
                    self.info.index,
                    start,
                    end,
                    min_values,
                    decimation,
                    sink,
                )?;
            }
        }
        Ok(summary)
    }

    /// Rewrites `channel.idx` from the known chunks. Chunks still being
    /// written are stored with an open end.
    pub fn update_index(&self) -> Result<()> {
        let Backend::Local { dir, chunks } = &self.backend else {
            return Err(DlsError::Remote(
                "index maintenance needs a local directory".to_string(),
            ));
        };
        let records: Vec<ChannelIndexRecord> = chunks
            .iter()
            .map(|(time, chunk)| ChannelIndexRecord {
                start_time: *time,
                end_time: if chunk.is_incomplete() {
                    OPEN_END
                } else {
                    chunk.end()
                },
            })
            .collect();
        index::rewrite_atomic(&dir.join(layout::CHANNEL_INDEX), &records)?;
        info!(
            "Channel {}: wrote index with {} chunks",
            self.info.index,
            records.len()
        );
        Ok(())
    }
}

fn load_chunk(path: &Path, scalar: ScalarType, config: &CatalogConfig) -> Result<Chunk> {
    let mut chunk = Chunk::import(path, scalar)?.with_read_chunk_size(config.read_chunk_size);
    chunk.fetch_range()?;
    Ok(chunk)
}

/// Imports the chunks listed in `channel.idx`. Returns the listed times.
fn seed_from_cache(
    dir: &Path,
    chunks: &mut BTreeMap<Time, Chunk>,
    scalar: ScalarType,
    config: &CatalogConfig,
) -> BTreeSet<Time> {
    let path = dir.join(layout::CHANNEL_INDEX);
    let records = match IndexFile::<ChannelIndexRecord>::open(&path).and_then(|mut f| f.read_all())
    {
        Ok(records) => records,
        Err(DlsError::MissingIndex(_)) => return BTreeSet::new(),
        Err(e) => {
            warn!("Ignoring chunk cache {}: {}", path.display(), e);
            return BTreeSet::new();
        }
    };

    let mut listed = BTreeSet::new();
    for record in records {
        listed.insert(record.start_time);
        let chunk_dir = layout::chunk_dir(dir, record.start_time);
        match Chunk::import(&chunk_dir, scalar) {
            Ok(chunk) => {
                let mut chunk = chunk.with_read_chunk_size(config.read_chunk_size);
                chunk.set_range(record.end_time, record.end_time == OPEN_END);
                chunks.insert(record.start_time, chunk);
            }
            Err(e) => debug!("Cached chunk {} not usable: {}", chunk_dir.display(), e),
        }
    }
    listed
}

fn fetch_local(
    dir: &Path,
    chunks: &mut BTreeMap<Time, Chunk>,
    scalar: ScalarType,
    config: &CatalogConfig,
) -> Result<ChunkUpdate> {
    let known: BTreeSet<Time> = chunks.keys().copied().collect();
    let cached = if config.use_index_cache && chunks.is_empty() {
        seed_from_cache(dir, chunks, scalar, config)
    } else {
        BTreeSet::new()
    };

    let entries = layout::list_numbered(dir, "chunk")?;
    let live: BTreeSet<Time> = entries.iter().map(|(time, _)| *time).collect();
    let mut update = ChunkUpdate::default();

    for (time, path) in entries {
        match chunks.entry(time) {
            Entry::Occupied(mut entry) => {
                let chunk = entry.get_mut();
                if chunk.is_incomplete() {
                    match chunk.fetch_range() {
                        Ok(()) => update.touched.push(time),
                        Err(e) => warn!("Failed to fetch range of {}: {}", path.display(), e),
                    }
                } else if !known.contains(&time) {
                    update.touched.push(time);
                }
            }
            Entry::Vacant(entry) => match load_chunk(&path, scalar, config) {
                Ok(chunk) => {
                    entry.insert(chunk);
                    update.touched.push(time);
                }
                Err(e) => warn!("Failed to import chunk {}: {}", path.display(), e),
            },
        }
    }

    let gone: BTreeSet<Time> = chunks
        .keys()
        .chain(cached.iter())
        .filter(|time| !live.contains(time))
        .copied()
        .collect();
    for time in &gone {
        chunks.remove(time);
    }
    update.removed = gone.into_iter().collect();
    Ok(update)
}
