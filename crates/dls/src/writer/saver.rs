//! Default encoder: turns raw sample bytes into level files.
//!
//! # Architecture
//!
//! ```text
//! process_data ─► GenSaver<T> ──► BlockStream (level 0, gen)
//!                     │
//!                     └─ every meta_reduction values
//!                        ├─► MetaSaver(min, level 1) ─► MetaSaver(min, level 2) ─► ...
//!                        └─► MetaSaver(max, level 1) ─► MetaSaver(max, level 2) ─► ...
//! ```
//!
//! Each [`BlockStream`] buffers `block_size` values, compresses them into
//! one record and appends it to the current data file of its level. Data
//! files rotate once they would exceed [`SaverConfig::max_file_size`].
//! Deeper meta levels are created lazily when the first aggregate for them
//! is produced.

use crate::error::{DlsError, Result};
use crate::store::codec::{self, Codec};
use crate::store::index::{
    GlobalIndexRecord, IndexFile, LocalIndexRecord, OPEN_END,
};
use crate::store::layout;
use crate::store::meta::Format;
use crate::store::record::Record;
use crate::store::{decode_samples, ByteOrder, MetaType, Sample, Time, MICROS_PER_SEC};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Default maximum size of one data file (10 MiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Default allowed deviation of the gap between two sample blocks from one
/// sample period, in percent.
pub const DEFAULT_TIME_TOLERANCE_PERCENT: f64 = 500.0;

/// Configuration for the default encoder.
#[derive(Debug, Clone)]
pub struct SaverConfig {
    /// Data files are rotated before they exceed this size.
    pub max_file_size: u64,
    /// Allowed relative error of the gap between consecutive sample blocks.
    pub time_tolerance_percent: f64,
}

impl Default for SaverConfig {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            time_tolerance_percent: DEFAULT_TIME_TOLERANCE_PERCENT,
        }
    }
}

impl SaverConfig {
    /// Creates a configuration with custom settings.
    pub fn new(max_file_size: u64, time_tolerance_percent: f64) -> Self {
        Self {
            max_file_size,
            time_tolerance_percent,
        }
    }
}

/// Where an encoder puts its files.
///
/// The chunk directory is created on first use, named after the time of the
/// first value that is written.
pub trait ChunkTarget {
    /// Returns the current chunk directory, creating the chunk if needed.
    fn chunk_dir(&mut self, time_of_first: Time) -> Result<PathBuf>;
}

/// Turns raw sample bytes into stored blocks.
pub trait Encoder: Send {
    /// Accepts a buffer of raw native-endian samples whose last value was
    /// sampled at `time_of_last`.
    fn process_data(
        &mut self,
        bytes: &[u8],
        time_of_last: Time,
        target: &mut dyn ChunkTarget,
    ) -> Result<()>;

    /// Writes all buffered values and closes the open files.
    fn flush(&mut self, target: &mut dyn ChunkTarget) -> Result<()>;

    /// Returns `true` if no values are buffered.
    fn is_idle(&self) -> bool;
}

/// Parameters shared by all streams of one encoder.
#[derive(Debug, Clone)]
pub struct StreamParams {
    /// Channel name, for messages.
    pub channel: String,
    /// Samples per second at level 0.
    pub sample_frequency: f64,
    /// Values per block.
    pub block_size: usize,
    /// Values per aggregate.
    pub meta_reduction: usize,
    /// Aggregates to produce.
    pub meta_mask: u32,
    /// Compression format.
    pub format: Format,
    /// Byte order of payloads.
    pub order: ByteOrder,
    /// File limits and tolerances.
    pub config: SaverConfig,
}

struct OpenFiles {
    level_dir: PathBuf,
    data: File,
    size: u64,
    local: IndexFile<LocalIndexRecord>,
    last_time: Time,
}

/// Data and index files of one (level, meta type) stream.
struct LevelWriter {
    level: u32,
    meta: MetaType,
    max_file_size: u64,
    open: Option<OpenFiles>,
}

impl LevelWriter {
    fn new(level: u32, meta: MetaType, max_file_size: u64) -> Self {
        Self {
            level,
            meta,
            max_file_size,
            open: None,
        }
    }

    fn write_block(
        &mut self,
        target: &mut dyn ChunkTarget,
        start: Time,
        end: Time,
        line: &str,
    ) -> Result<()> {
        let len = line.len() as u64;
        if len >= self.max_file_size {
            return Err(DlsError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("block of {} bytes exceeds the maximum file size", len),
            )));
        }
        let rotate = match &self.open {
            Some(files) => files.size + len >= self.max_file_size,
            None => true,
        };
        if rotate {
            self.begin_files(target, start)?;
        }
        let Some(files) = self.open.as_mut() else {
            return Err(DlsError::Io(io::Error::other("data file not open")));
        };

        let position = files.size;
        files.data.write_all(line.as_bytes())?;
        files.size += len;
        files.last_time = end;
        files.local.append(&LocalIndexRecord {
            start_time: start,
            end_time: end,
            position,
        })?;
        Ok(())
    }

    /// Appends an unindexed record (the flush record) to the open file.
    fn write_unindexed(&mut self, line: &str) -> Result<()> {
        if let Some(files) = self.open.as_mut() {
            files.data.write_all(line.as_bytes())?;
            files.size += line.len() as u64;
        }
        Ok(())
    }

    fn begin_files(&mut self, target: &mut dyn ChunkTarget, time_of_first: Time) -> Result<()> {
        let chunk_dir = target.chunk_dir(time_of_first)?;
        let level_dir = layout::level_dir(&chunk_dir, self.level);
        fs::create_dir_all(&level_dir)?;

        self.finish_files()?;

        let data_path = layout::data_file_path(&level_dir, time_of_first, self.meta);
        let data = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&data_path)?;
        let size = data.metadata()?.len();
        let local = IndexFile::open_rw(layout::local_index_path(
            &level_dir,
            time_of_first,
            self.meta,
        ))?;

        let mut global = IndexFile::<GlobalIndexRecord>::open_rw(layout::global_index_path(
            &level_dir, self.meta,
        ))?;
        global.append(&GlobalIndexRecord {
            start_time: time_of_first,
            end_time: OPEN_END,
        })?;

        debug!("Began data file {}", data_path.display());
        self.open = Some(OpenFiles {
            level_dir,
            data,
            size,
            local,
            last_time: time_of_first,
        });
        Ok(())
    }

    /// Closes the open data file and records its end time in the global index.
    fn finish_files(&mut self) -> Result<()> {
        let Some(files) = self.open.take() else {
            return Ok(());
        };
        files.data.sync_data()?;
        let mut global = IndexFile::<GlobalIndexRecord>::open_rw(layout::global_index_path(
            &files.level_dir,
            self.meta,
        ))?;
        if let Some(mut last) = global.last()? {
            last.end_time = files.last_time;
            global.set(global.len() - 1, &last)?;
        }
        Ok(())
    }
}

/// Block buffer, codec and files of one value stream.
struct BlockStream<T: Sample> {
    codec: Box<dyn Codec<T>>,
    writer: LevelWriter,
    block: Vec<T>,
    block_size: usize,
    block_time: Time,
    last_time: Time,
}

impl<T: Sample> BlockStream<T> {
    fn new(params: &StreamParams, level: u32, meta: MetaType) -> Result<Self> {
        Ok(Self {
            codec: codec::create::<T>(&params.format, params.order)?,
            writer: LevelWriter::new(level, meta, params.config.max_file_size),
            block: Vec::with_capacity(params.block_size),
            block_size: params.block_size,
            block_time: 0,
            last_time: 0,
        })
    }

    fn push(&mut self, value: T, time: Time, target: &mut dyn ChunkTarget) -> Result<()> {
        if self.block.is_empty() {
            self.block_time = time;
        }
        self.block.push(value);
        self.last_time = time;
        if self.block.len() >= self.block_size {
            self.save_block(target)?;
        }
        Ok(())
    }

    fn save_block(&mut self, target: &mut dyn ChunkTarget) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        let record = Record {
            start_time: self.block_time,
            count: self.block.len() as u32,
            payload: self.codec.compress(&self.block)?,
        };
        self.writer
            .write_block(target, self.block_time, self.last_time, &record.render())?;
        self.block.clear();
        Ok(())
    }

    fn flush(&mut self, target: &mut dyn ChunkTarget) -> Result<()> {
        self.save_block(target)?;
        if let Some(payload) = self.codec.flush_compress()? {
            let record = Record {
                start_time: self.last_time,
                count: 0,
                payload,
            };
            self.writer.write_unindexed(&record.render())?;
        }
        self.writer.finish_files()?;
        self.codec.clear();
        Ok(())
    }
}

fn aggregate<T: Sample>(meta: MetaType, values: &[T]) -> T {
    let mut iter = values.iter().copied();
    let first = iter.next().unwrap_or_default();
    match meta {
        MetaType::Min => iter.fold(first, |acc, v| if v < acc { v } else { acc }),
        MetaType::Max => iter.fold(first, |acc, v| if v > acc { v } else { acc }),
        MetaType::Mean | MetaType::Gen => {
            let sum: f64 = values.iter().map(|v| v.to_f64()).sum();
            T::from_f64(sum / values.len().max(1) as f64)
        }
    }
}

/// Aggregates of one meta type at one level, feeding the next level.
struct MetaSaver<T: Sample> {
    meta: MetaType,
    level: u32,
    stream: BlockStream<T>,
    buf: Vec<T>,
    buf_time: Time,
    next: Option<Box<MetaSaver<T>>>,
}

impl<T: Sample> MetaSaver<T> {
    fn new(params: &StreamParams, meta: MetaType, level: u32) -> Result<Self> {
        Ok(Self {
            meta,
            level,
            stream: BlockStream::new(params, level, meta)?,
            buf: Vec::with_capacity(params.meta_reduction),
            buf_time: 0,
            next: None,
        })
    }

    /// Consumes one group of finer values starting at `time`.
    fn generate(
        &mut self,
        params: &StreamParams,
        time: Time,
        values: &[T],
        target: &mut dyn ChunkTarget,
    ) -> Result<()> {
        let value = aggregate(self.meta, values);
        self.stream.push(value, time, target)?;

        if self.buf.is_empty() {
            self.buf_time = time;
        }
        self.buf.push(value);
        if self.buf.len() >= params.meta_reduction {
            if self.next.is_none() {
                self.next = Some(Box::new(MetaSaver::new(params, self.meta, self.level + 1)?));
            }
            if let Some(next) = self.next.as_mut() {
                next.generate(params, self.buf_time, &self.buf, target)?;
            }
            self.buf.clear();
        }
        Ok(())
    }

    fn flush(&mut self, target: &mut dyn ChunkTarget) -> Result<()> {
        self.stream.flush(target)?;
        self.buf.clear();
        if let Some(next) = self.next.as_mut() {
            next.flush(target)?;
        }
        Ok(())
    }
}

/// Encoder for level 0 plus the configured meta levels.
pub struct GenSaver<T: Sample> {
    params: StreamParams,
    stream: BlockStream<T>,
    meta_buf: Vec<T>,
    meta_time: Time,
    savers: Vec<MetaSaver<T>>,
    /// Time of the last buffered value; `None` when nothing is buffered.
    time_of_last: Option<Time>,
}

impl<T: Sample> GenSaver<T> {
    /// Creates an encoder.
    ///
    /// # Errors
    ///
    /// [`DlsError::UnsupportedFormat`] if the format cannot store `T`.
    pub fn new(params: StreamParams) -> Result<Self> {
        let stream = BlockStream::new(&params, 0, MetaType::Gen)?;
        let savers = MetaType::from_mask(params.meta_mask)
            .into_iter()
            .map(|meta| MetaSaver::new(&params, meta, 1))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            meta_buf: Vec::with_capacity(params.meta_reduction),
            params,
            stream,
            meta_time: 0,
            savers,
            time_of_last: None,
        })
    }

    fn period_us(&self) -> f64 {
        MICROS_PER_SEC / self.params.sample_frequency
    }

    fn check_tolerance(&self, time_of_first: Time) -> Result<()> {
        let Some(last) = self.time_of_last else {
            return Ok(());
        };
        let expected = self.period_us();
        let actual = time_of_first as f64 - last as f64;
        let error_percent = ((actual - expected) / expected * 100.0).abs();
        if error_percent > self.params.config.time_tolerance_percent {
            return Err(DlsError::TimeTolerance {
                channel: self.params.channel.clone(),
                actual_us: actual as i64,
                expected_us: expected.round() as i64,
                error_percent,
            });
        }
        Ok(())
    }

    fn generate_meta(&mut self, target: &mut dyn ChunkTarget) -> Result<()> {
        for saver in &mut self.savers {
            saver.generate(&self.params, self.meta_time, &self.meta_buf, target)?;
        }
        self.meta_buf.clear();
        Ok(())
    }
}

impl<T: Sample> Encoder for GenSaver<T> {
    fn process_data(
        &mut self,
        bytes: &[u8],
        time_of_last: Time,
        target: &mut dyn ChunkTarget,
    ) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        if bytes.len() % T::SIZE != 0 {
            return Err(DlsError::invalid(
                &self.params.channel,
                format!("{} bytes is not a multiple of {}", bytes.len(), T::SIZE),
            ));
        }
        let values: Vec<T> = decode_samples(bytes, ByteOrder::native());
        let period = self.period_us();
        let span = ((values.len() - 1) as f64 * period).round() as Time;
        let time_of_first = time_of_last.saturating_sub(span);
        self.check_tolerance(time_of_first)?;

        for (i, value) in values.into_iter().enumerate() {
            let time = time_of_first + (i as f64 * period).round() as Time;
            self.time_of_last = Some(time);
            self.stream.push(value, time, target)?;

            if self.meta_buf.is_empty() {
                self.meta_time = time;
            }
            self.meta_buf.push(value);
            if self.meta_buf.len() >= self.params.meta_reduction {
                self.generate_meta(target)?;
            }
        }
        Ok(())
    }

    fn flush(&mut self, target: &mut dyn ChunkTarget) -> Result<()> {
        self.stream.flush(target)?;
        for saver in &mut self.savers {
            saver.flush(target)?;
        }
        if !self.meta_buf.is_empty() {
            warn!(
                "Dropping {} values of an incomplete aggregate on channel {}",
                self.meta_buf.len(),
                self.params.channel
            );
        }
        self.meta_buf.clear();
        self.time_of_last = None;
        Ok(())
    }

    fn is_idle(&self) -> bool {
        self.time_of_last.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::encode_samples;
    use crate::store::record::RecordReader;
    use std::path::Path;
    use tempfile::TempDir;

    struct DirTarget {
        root: PathBuf,
        created: Option<PathBuf>,
    }

    impl ChunkTarget for DirTarget {
        fn chunk_dir(&mut self, time_of_first: Time) -> Result<PathBuf> {
            if let Some(dir) = &self.created {
                return Ok(dir.clone());
            }
            let dir = layout::chunk_dir(&self.root, time_of_first);
            fs::create_dir_all(&dir)?;
            self.created = Some(dir.clone());
            Ok(dir)
        }
    }

    fn params(format: Format, max_file_size: u64) -> StreamParams {
        StreamParams {
            channel: "test".to_string(),
            sample_frequency: 10.0,
            block_size: 10,
            meta_reduction: 10,
            meta_mask: MetaType::Min.mask_bit() | MetaType::Max.mask_bit(),
            format,
            order: ByteOrder::native(),
            config: SaverConfig::new(max_file_size, DEFAULT_TIME_TOLERANCE_PERCENT),
        }
    }

    fn global_rows(dir: &Path, level: u32, meta: MetaType) -> Vec<GlobalIndexRecord> {
        let level_dir = layout::level_dir(dir, level);
        IndexFile::<GlobalIndexRecord>::open(layout::global_index_path(&level_dir, meta))
            .unwrap()
            .read_all()
            .unwrap()
    }

    #[test]
    fn test_gen_saver_writes_levels() {
        let temp_dir = TempDir::new().unwrap();
        let mut target = DirTarget {
            root: temp_dir.path().to_path_buf(),
            created: None,
        };
        let mut saver = GenSaver::<f64>::new(params(Format::Zlib, DEFAULT_MAX_FILE_SIZE)).unwrap();
        assert!(saver.is_idle());

        // 10 Hz, 100 samples per call, 10 s per call.
        let start: Time = 1_000_000_000;
        for call in 0..10u64 {
            let values: Vec<f64> = (0..100).map(|i| (call * 100 + i) as f64).collect();
            let last = start + (call * 100 + 99) * 100_000;
            saver
                .process_data(&encode_samples(&values, ByteOrder::native()), last, &mut target)
                .unwrap();
        }
        assert!(!saver.is_idle());
        saver.flush(&mut target).unwrap();
        assert!(saver.is_idle());

        let chunk = target.created.clone().unwrap();
        assert_eq!(chunk, layout::chunk_dir(temp_dir.path(), start));

        let gen = global_rows(&chunk, 0, MetaType::Gen);
        assert_eq!(gen.len(), 1);
        assert_eq!(gen[0].start_time, start);
        assert_eq!(gen[0].end_time, start + 999 * 100_000);

        // 1000 values: 100 aggregates at level 1, 10 at level 2, 1 at level 3.
        let level_dir = layout::level_dir(&chunk, 1);
        let local = IndexFile::<LocalIndexRecord>::open(layout::local_index_path(
            &level_dir,
            start,
            MetaType::Max,
        ))
        .unwrap()
        .read_all()
        .unwrap();
        assert_eq!(local.len(), 10);
        assert!(local.windows(2).all(|w| w[0].end_time < w[1].start_time));
        assert_eq!(global_rows(&chunk, 3, MetaType::Min).len(), 1);
        assert!(!layout::level_dir(&chunk, 4).exists());

        let mut reader = RecordReader::open(
            layout::data_file_path(&level_dir, start, MetaType::Max),
            1024,
        )
        .unwrap();
        let first = reader.next_record().unwrap().unwrap();
        assert_eq!(first.start_time, start);
        assert_eq!(first.count, 10);
    }

    #[test]
    fn test_gen_saver_rotates_files() {
        let temp_dir = TempDir::new().unwrap();
        let mut target = DirTarget {
            root: temp_dir.path().to_path_buf(),
            created: None,
        };
        let mut saver = GenSaver::<i32>::new(params(Format::Zlib, 400)).unwrap();
        let values: Vec<i32> = (0..200).collect();
        saver
            .process_data(
                &encode_samples(&values, ByteOrder::native()),
                199 * 100_000,
                &mut target,
            )
            .unwrap();
        saver.flush(&mut target).unwrap();

        let chunk = target.created.clone().unwrap();
        let rows = global_rows(&chunk, 0, MetaType::Gen);
        assert!(rows.len() > 1);
        assert!(rows.iter().all(|r| !r.is_open()));
        assert!(rows.windows(2).all(|w| w[0].end_time < w[1].start_time));
    }

    #[test]
    fn test_time_tolerance_violation() {
        let temp_dir = TempDir::new().unwrap();
        let mut target = DirTarget {
            root: temp_dir.path().to_path_buf(),
            created: None,
        };
        let mut saver = GenSaver::<f32>::new(params(Format::Zlib, DEFAULT_MAX_FILE_SIZE)).unwrap();
        let block = encode_samples(&[1.0f32; 5], ByteOrder::native());
        saver.process_data(&block, 400_000, &mut target).unwrap();
        // Next block should start at 500_000; it starts ten seconds later.
        let err = saver
            .process_data(&block, 10_900_000, &mut target)
            .unwrap_err();
        assert!(matches!(err, DlsError::TimeTolerance { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_mdct_flush_record_unindexed() {
        let temp_dir = TempDir::new().unwrap();
        let mut target = DirTarget {
            root: temp_dir.path().to_path_buf(),
            created: None,
        };
        let format = Format::Mdct {
            block_size: 16,
            accuracy: 0.01,
        };
        let mut saver = GenSaver::<f64>::new(params(format, DEFAULT_MAX_FILE_SIZE)).unwrap();
        let values: Vec<f64> = (0..25).map(|i| i as f64 * 0.5).collect();
        saver
            .process_data(
                &encode_samples(&values, ByteOrder::native()),
                24 * 100_000,
                &mut target,
            )
            .unwrap();
        saver.flush(&mut target).unwrap();

        let level_dir = layout::level_dir(target.created.as_ref().unwrap(), 0);
        let local = IndexFile::<LocalIndexRecord>::open(layout::local_index_path(
            &level_dir,
            0,
            MetaType::Gen,
        ))
        .unwrap()
        .read_all()
        .unwrap();
        assert_eq!(local.len(), 3);

        let mut reader =
            RecordReader::open(layout::data_file_path(&level_dir, 0, MetaType::Gen), 1024)
                .unwrap();
        let mut records = Vec::new();
        while let Some(record) = reader.next_record().unwrap() {
            records.push(record);
        }
        assert_eq!(records.len(), 4);
        assert!(records[3].is_flush());
    }

    #[test]
    fn test_aggregate() {
        let values = [3i16, -2, 7, 0];
        assert_eq!(aggregate(MetaType::Min, &values), -2);
        assert_eq!(aggregate(MetaType::Max, &values), 7);
        assert_eq!(aggregate(MetaType::Mean, &values), 2);
    }
}
