//! Chunk reader: level selection and block decoding.
//!
//! # Fetch Path
//!
//! ```text
//! fetch_data(start, end, min_values)
//!   │
//!   ├─ optimal_level ──► level 0: gen          level L > 0: min, then max
//!   │
//!   └─ per meta type:
//!        data_<meta>.idx        skip files ending before start,
//!          │                    stop at the first file starting at or after end
//!          └─ data<F>_<meta>.idx   same for blocks
//!               └─ data<F>_<meta>  seek, parse one record, decode, deliver
//! ```
//!
//! Lapped formats withhold the last hop of every record until the next
//! record is decoded. After the last block in range the reader keeps
//! parsing (first in the same file, then in the next data file) to complete
//! it. [`TailState`] reports how that ended.

use crate::error::{DlsError, Result};
use crate::reader::data::{Data, DataSink};
use crate::store::codec::{self, Codec};
use crate::store::index::{GlobalIndexRecord, IndexFile, LocalIndexRecord};
use crate::store::layout;
use crate::store::meta::{ChunkXml, Format};
use crate::store::record::{Record, RecordReader, DEFAULT_READ_CHUNK_SIZE};
use crate::store::{MetaType, Sample, ScalarType, Time, MICROS_PER_SEC};
use crate::with_sample_type;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// How the look-ahead for the withheld tail of a lapped stream ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TailState {
    /// The format has no look-ahead, or nothing was read.
    #[default]
    NotApplicable,
    /// The tail was completed from the next record.
    Completed,
    /// End of data while the chunk is still being written. The tail does
    /// not exist yet.
    Pending,
    /// End of data in a closed chunk. The tail is lost.
    Truncated,
}

/// What one [`Chunk::fetch_data`] call read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchSummary {
    /// Level the values came from.
    pub level: u32,
    /// Records decoded.
    pub blocks: usize,
    /// Values delivered.
    pub values: usize,
    /// Look-ahead outcome.
    pub tail: TailState,
}

impl FetchSummary {
    /// Adds the counts of another fetch.
    pub fn absorb(&mut self, other: FetchSummary) {
        self.level = self.level.max(other.level);
        self.blocks += other.blocks;
        self.values += other.values;
        self.merge_tail(other.tail);
    }

    fn merge_tail(&mut self, tail: TailState) {
        // The worst outcome of the meta types wins.
        let rank = |t: TailState| match t {
            TailState::NotApplicable => 0,
            TailState::Completed => 1,
            TailState::Pending => 2,
            TailState::Truncated => 3,
        };
        if rank(tail) > rank(self.tail) {
            self.tail = tail;
        }
    }
}

/// Metadata and time range of a chunk, as listed by a catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// Time of the first value.
    pub start: Time,
    /// Time of the last value.
    pub end: Time,
    /// `true` while the chunk is being written.
    pub incomplete: bool,
    /// Parameters from `chunk.xml`.
    pub meta: ChunkXml,
}

/// Level whose value spacing best matches `min_values` values over
/// `duration_us`.
///
/// This is the largest `L` with `meta_reduction^L <= f * duration / min_values`,
/// or 0 if `min_values` is 0.
pub fn optimal_level(
    sample_frequency: f64,
    duration_us: u64,
    meta_reduction: u32,
    min_values: u32,
) -> u32 {
    if min_values == 0 || meta_reduction < 2 {
        return 0;
    }
    let ratio = sample_frequency * (duration_us as f64 / MICROS_PER_SEC) / f64::from(min_values);
    let reduction = f64::from(meta_reduction);
    if ratio.is_nan() || ratio < reduction {
        return 0;
    }
    let mut level = (ratio.log10() / reduction.log10()).floor() as u32;
    // The logarithms may round across an exact power.
    while reduction.powi(level as i32 + 1) <= ratio {
        level += 1;
    }
    while level > 0 && reduction.powi(level as i32) > ratio {
        level -= 1;
    }
    level
}

/// One chunk directory.
#[derive(Debug, Clone)]
pub struct Chunk {
    dir: PathBuf,
    scalar: ScalarType,
    meta: ChunkXml,
    start: Time,
    end: Time,
    incomplete: bool,
    read_chunk_size: usize,
}

impl Chunk {
    /// Reads `chunk.xml` of the chunk in `dir`. Until [`Chunk::fetch_range`]
    /// is called the range is taken from the directory name and is empty.
    pub fn import(dir: impl Into<PathBuf>, scalar: ScalarType) -> Result<Self> {
        let dir = dir.into();
        let meta = ChunkXml::read(&dir.join(layout::CHUNK_XML))?;
        let start = dir
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| layout::parse_numbered(name, "chunk"))
            .unwrap_or(0);
        Ok(Self {
            dir,
            scalar,
            meta,
            start,
            end: start,
            incomplete: true,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        })
    }

    /// Sets the read step used while parsing records.
    pub fn with_read_chunk_size(mut self, read_chunk_size: usize) -> Self {
        self.read_chunk_size = read_chunk_size;
        self
    }

    /// Determines the time range from the level 0 indices.
    ///
    /// For a chunk still being written, the end is the end of the last
    /// block in the local index of the open data file.
    pub fn fetch_range(&mut self) -> Result<()> {
        let level_dir = layout::level_dir(&self.dir, 0);
        let global_path = layout::global_index_path(&level_dir, MetaType::Gen);
        let mut global = IndexFile::<GlobalIndexRecord>::open(&global_path)?;
        let (Some(first), Some(last)) = (global.first()?, global.last()?) else {
            return Err(DlsError::corrupt(&global_path, "global index has no records"));
        };

        let (end, incomplete) = if last.is_open() {
            let local_path = layout::local_index_path(&level_dir, last.start_time, MetaType::Gen);
            let last_block = IndexFile::<LocalIndexRecord>::open(&local_path)?
                .last()?
                .ok_or_else(|| DlsError::corrupt(&local_path, "index has no records"))?;
            (last_block.end_time, true)
        } else {
            (last.end_time, false)
        };

        self.start = first.start_time;
        self.end = end;
        self.incomplete = incomplete;
        Ok(())
    }

    /// Takes the range from a cached catalog entry instead of the indices.
    pub(crate) fn set_range(&mut self, end: Time, incomplete: bool) {
        self.end = end.max(self.start);
        self.incomplete = incomplete;
    }

    /// Level [`Chunk::fetch_data`] reads for this query, capped at the
    /// deepest level present on disk.
    pub fn level_for(&self, start: Time, end: Time, min_values: u32) -> u32 {
        let wanted = optimal_level(
            self.meta.sample_frequency,
            end.saturating_sub(start),
            self.meta.meta_reduction,
            min_values,
        );
        if wanted == 0 {
            return 0;
        }
        wanted.min(self.max_level())
    }

    /// Deepest level with min or max data.
    pub fn max_level(&self) -> u32 {
        let Ok(levels) = layout::list_numbered(&self.dir, "level") else {
            return 0;
        };
        levels
            .iter()
            .rev()
            .find(|(_, dir)| {
                [MetaType::Min, MetaType::Max]
                    .iter()
                    .any(|m| layout::global_index_path(dir, *m).exists())
            })
            .map(|(level, _)| *level as u32)
            .unwrap_or(0)
    }

    /// Microseconds between two values of `level`.
    pub fn time_per_value(&self, level: u32) -> f64 {
        f64::from(self.meta.meta_reduction).powi(level as i32) * MICROS_PER_SEC
            / self.meta.sample_frequency
    }

    /// Delivers the values in `[start, end)` to `sink`.
    ///
    /// `min_values` selects the level (0 reads raw values). `decimation`
    /// keeps every n-th value; its counter runs across blocks and, above
    /// level 0, across the min and max passes.
    ///
    /// # Errors
    ///
    /// A decode or I/O failure aborts the call. Blocks delivered before the
    /// failure stay valid.
    pub fn fetch_data(
        &self,
        start: Time,
        end: Time,
        min_values: u32,
        decimation: u32,
        sink: &mut dyn DataSink,
    ) -> Result<FetchSummary> {
        if end <= start || end <= self.start || start > self.end {
            return Ok(FetchSummary::default());
        }

        let level = self.level_for(start, end, min_values);
        let mut pass = Pass {
            range: (start, end),
            level,
            time_per_value: self.time_per_value(level),
            decimation: decimation.max(1),
            counter: 0,
            spare: None,
            summary: FetchSummary {
                level,
                ..FetchSummary::default()
            },
        };

        let metas: &[MetaType] = if level == 0 {
            &[MetaType::Gen]
        } else {
            &[MetaType::Min, MetaType::Max]
        };
        for meta in metas {
            with_sample_type!(self.scalar, T => self.fetch_level::<T>(*meta, &mut pass, sink)?);
        }
        Ok(pass.summary)
    }

    fn fetch_level<T: Sample>(
        &self,
        meta: MetaType,
        pass: &mut Pass,
        sink: &mut dyn DataSink,
    ) -> Result<()> {
        let mut codec = codec::create::<T>(&self.meta.format, self.meta.architecture)?;
        let level_dir = layout::level_dir(&self.dir, pass.level);
        let mut global =
            match IndexFile::<GlobalIndexRecord>::open(layout::global_index_path(&level_dir, meta)) {
                Ok(global) => global,
                Err(DlsError::MissingIndex(path)) => {
                    debug!("No {} data: {}", meta, path.display());
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
        let files = global.read_all()?;
        let (start, end) = pass.range;

        let mut stream = Stream::<T>::new(pass.level, meta);
        let mut last: Option<(usize, RecordReader)> = None;
        for (i, file) in files.iter().enumerate() {
            if file.end_time < start && !file.is_open() {
                continue;
            }
            if file.start_time >= end {
                break;
            }

            let local_path = layout::local_index_path(&level_dir, file.start_time, meta);
            let blocks = IndexFile::<LocalIndexRecord>::open(&local_path)?.read_all()?;
            let mut reader = RecordReader::open(
                layout::data_file_path(&level_dir, file.start_time, meta),
                self.read_chunk_size,
            )?;
            let mut used = false;
            for block in &blocks {
                if block.end_time < start {
                    continue;
                }
                if block.start_time >= end {
                    break;
                }
                reader.seek(block.position)?;
                let record = reader.next_record()?.ok_or_else(|| {
                    DlsError::corrupt(
                        reader.path(),
                        format!("no record at indexed position {}", block.position),
                    )
                })?;
                stream.decode(&mut *codec, &record, pass, sink)?;
                used = true;
            }
            if used {
                last = Some((i, reader));
            }
        }

        let Some((file_index, reader)) = last else {
            return Ok(());
        };
        if codec.has_pending() {
            let tail = self.look_ahead(
                &mut *codec,
                &mut stream,
                reader,
                &files[file_index + 1..],
                &level_dir,
                meta,
                pass,
                sink,
            )?;
            pass.summary.merge_tail(tail);
        }
        Ok(())
    }

    /// Reads past the last block in range until the withheld tail is
    /// complete.
    #[allow(clippy::too_many_arguments)]
    fn look_ahead<T: Sample>(
        &self,
        codec: &mut dyn Codec<T>,
        stream: &mut Stream<T>,
        mut reader: RecordReader,
        following: &[GlobalIndexRecord],
        level_dir: &Path,
        meta: MetaType,
        pass: &mut Pass,
        sink: &mut dyn DataSink,
    ) -> Result<TailState> {
        let mut next_files = following.iter();
        loop {
            match reader.next_record() {
                Ok(Some(record)) => {
                    stream.decode_tail(codec, &record, pass, sink)?;
                    return Ok(TailState::Completed);
                }
                Ok(None) => {}
                // A writer may still be appending the next record.
                Err(DlsError::PartialRecord { position, .. }) => {
                    debug!(
                        "Chunk {}: {} record at {} is incomplete",
                        self.dir.display(),
                        meta,
                        position
                    );
                    break;
                }
                Err(e) => return Err(e),
            }
            let Some(file) = next_files.next() else {
                break;
            };
            reader = match RecordReader::open(
                layout::data_file_path(level_dir, file.start_time, meta),
                self.read_chunk_size,
            ) {
                Ok(reader) => reader,
                Err(DlsError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => break,
                Err(e) => return Err(e),
            };
        }

        if self.incomplete {
            Ok(TailState::Pending)
        } else {
            warn!(
                "Chunk {}: {} stream ends without the record completing its last block",
                self.dir.display(),
                meta
            );
            Ok(TailState::Truncated)
        }
    }

    /// Directory of the chunk.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Time of the first value.
    pub fn start(&self) -> Time {
        self.start
    }

    /// Time of the last value.
    pub fn end(&self) -> Time {
        self.end
    }

    /// `true` while the chunk is being written.
    pub fn is_incomplete(&self) -> bool {
        self.incomplete
    }

    /// Parameters from `chunk.xml`.
    pub fn meta(&self) -> &ChunkXml {
        &self.meta
    }

    /// Compression format.
    pub fn format(&self) -> &Format {
        &self.meta.format
    }

    /// Sample type of the channel.
    pub fn scalar(&self) -> ScalarType {
        self.scalar
    }

    /// Catalog entry for this chunk.
    pub fn info(&self) -> ChunkInfo {
        ChunkInfo {
            start: self.start,
            end: self.end,
            incomplete: self.incomplete,
            meta: self.meta.clone(),
        }
    }
}

/// State shared by the meta type passes of one fetch.
struct Pass {
    range: (Time, Time),
    level: u32,
    time_per_value: f64,
    decimation: u32,
    counter: u64,
    spare: Option<Data>,
    summary: FetchSummary,
}

impl Pass {
    fn emit<T: Sample>(
        &mut self,
        meta: MetaType,
        block_start: f64,
        values: &[T],
        sink: &mut dyn DataSink,
    ) {
        if values.is_empty() {
            return;
        }
        let mut data = self.spare.take().unwrap_or_default();
        let kept = data.import(
            block_start,
            self.time_per_value,
            meta,
            self.level,
            values,
            self.range,
            self.decimation,
            &mut self.counter,
        );
        if kept == 0 {
            self.spare = Some(data);
            return;
        }
        self.summary.values += kept;
        self.spare = sink.deliver(data);
    }
}

/// Tracks where withheld values of a lapped stream belong.
struct Stream<T> {
    level: u32,
    meta: MetaType,
    /// Time of the first withheld value of the last decoded record.
    pending_time: f64,
    _sample: std::marker::PhantomData<T>,
}

impl<T: Sample> Stream<T> {
    fn new(level: u32, meta: MetaType) -> Self {
        Self {
            level,
            meta,
            pending_time: 0.0,
            _sample: std::marker::PhantomData,
        }
    }

    fn decode(
        &mut self,
        codec: &mut dyn Codec<T>,
        record: &Record,
        pass: &mut Pass,
        sink: &mut dyn DataSink,
    ) -> Result<()> {
        if record.is_flush() {
            let tail = codec.flush_decompress(&record.payload)?;
            pass.emit(self.meta, self.pending_time, &tail, sink);
            return Ok(());
        }
        let decoded = codec.decompress(&record.payload, record.count as usize)?;
        pass.summary.blocks += 1;
        pass.emit(self.meta, self.pending_time, &decoded.carried, sink);
        pass.emit(self.meta, record.start_time as f64, &decoded.values, sink);
        self.pending_time =
            record.start_time as f64 + decoded.values.len() as f64 * pass.time_per_value;
        debug!(
            "Level {} {}: record at {} with {} values",
            self.level, self.meta, record.start_time, record.count
        );
        Ok(())
    }

    /// Decodes the record after the range and delivers only the values that
    /// complete the previous record.
    fn decode_tail(
        &mut self,
        codec: &mut dyn Codec<T>,
        record: &Record,
        pass: &mut Pass,
        sink: &mut dyn DataSink,
    ) -> Result<()> {
        let tail = if record.is_flush() {
            codec.flush_decompress(&record.payload)?
        } else {
            codec.decompress(&record.payload, record.count as usize)?.carried
        };
        pass.emit(self.meta, self.pending_time, &tail, sink);
        Ok(())
    }
}
