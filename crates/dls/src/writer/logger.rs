//! Chunk writer for one channel.
//!
//! A [`Logger`] owns the currently open chunk of one channel. It validates
//! the channel parameters against the hardware, finds or allocates the
//! `channel<M>` directory, creates `chunk<T>` directories lazily on the first
//! written block and forwards raw sample bytes to its [`Encoder`].
//!
//! Parameter changes are two-phase: [`Logger::set_change`] records a pending
//! change tagged with an id, [`Logger::do_change`] applies it once the
//! acquisition source acknowledged that id. Samples arriving in between are
//! still written under the old parameters.

use crate::error::{DlsError, Result};
use crate::store::layout;
use crate::store::meta::{ChannelXml, ChunkXml, Format};
use crate::store::{ByteOrder, MetaType, ScalarType, Time};
use crate::with_sample_type;
use crate::writer::saver::{ChunkTarget, Encoder, GenSaver, SaverConfig, StreamParams};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Largest acquisition block size the source accepts.
pub const MAX_ACQUISITION_BLOCK_SIZE: u32 = 1024;

/// Default aggregate mask: min and max.
pub const DEFAULT_META_MASK: u32 = 6;

/// Default number of values per aggregate.
pub const DEFAULT_META_REDUCTION: u32 = 10;

/// Default number of values per stored block.
pub const DEFAULT_BLOCK_SIZE: u32 = 64;

/// Desired recording parameters of one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelPreset {
    /// Channel name, as enumerated by the hardware.
    pub name: String,
    /// Samples per second to record.
    pub sample_frequency: f64,
    /// Values per stored block.
    pub block_size: u32,
    /// Aggregates to store, see [`MetaType::mask_bit`].
    pub meta_mask: u32,
    /// Values per aggregate between two levels.
    pub meta_reduction: u32,
    /// Compression format.
    pub format: Format,
}

impl ChannelPreset {
    /// Creates a preset with default storage settings.
    pub fn new(name: impl Into<String>, sample_frequency: f64) -> Self {
        Self {
            name: name.into(),
            sample_frequency,
            block_size: DEFAULT_BLOCK_SIZE,
            meta_mask: DEFAULT_META_MASK,
            meta_reduction: DEFAULT_META_REDUCTION,
            format: Format::Zlib,
        }
    }

    /// Sets the compression format.
    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    /// Sets the block size.
    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    /// Sets the aggregate mask and reduction.
    pub fn with_meta(mut self, meta_mask: u32, meta_reduction: u32) -> Self {
        self.meta_mask = meta_mask;
        self.meta_reduction = meta_reduction;
        self
    }
}

/// A channel as enumerated by the acquisition hardware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareChannel {
    /// Channel name.
    pub name: String,
    /// Physical unit.
    pub unit: String,
    /// Index used by the acquisition protocol.
    pub index: u32,
    /// Sample type delivered by the hardware.
    pub scalar: ScalarType,
    /// Hardware sampling frequency.
    pub max_frequency: f64,
    /// Hardware buffer size in values.
    pub buffer_size: u32,
}

/// Acquisition settings derived from a validated preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquisition {
    /// Hardware samples per recorded sample.
    pub reduction: u32,
    /// Recorded samples per transfer.
    pub block_size: u32,
}

/// Command sent to the acquisition source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Start (or restart with new settings) a channel.
    Start {
        /// Channel name.
        channel: String,
        /// Hardware channel index.
        index: u32,
        /// Hardware samples per recorded sample.
        reduction: u32,
        /// Recorded samples per transfer.
        block_size: u32,
        /// Correlation id echoed back in the acknowledgement. `None` for an
        /// unconditional start.
        id: Option<String>,
    },
    /// Stop a channel.
    Stop {
        /// Channel name.
        channel: String,
        /// Hardware channel index.
        index: u32,
    },
}

/// A change waiting for its acknowledgement.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    /// Parameters to install.
    pub preset: ChannelPreset,
    /// Correlation id sent with the change command.
    pub id: String,
}

/// Open chunk of a logger. Handed to the encoder as [`ChunkTarget`].
struct ChunkState {
    job_dir: PathBuf,
    identity: Option<ChannelXml>,
    chunk_xml: Option<ChunkXml>,
    channel_dir: Option<PathBuf>,
    chunk_dir: Option<PathBuf>,
}

impl ChunkState {
    fn new(job_dir: PathBuf) -> Self {
        Self {
            job_dir,
            identity: None,
            chunk_xml: None,
            channel_dir: None,
            chunk_dir: None,
        }
    }

    fn close(&mut self) {
        if let Some(dir) = self.chunk_dir.take() {
            debug!("Closed chunk {}", dir.display());
        }
    }
}

impl ChunkTarget for ChunkState {
    fn chunk_dir(&mut self, time_of_first: Time) -> Result<PathBuf> {
        if let Some(dir) = &self.chunk_dir {
            return Ok(dir.clone());
        }
        let (Some(identity), Some(chunk_xml)) = (&self.identity, &self.chunk_xml) else {
            return Err(DlsError::invalid("", "logger not started"));
        };
        let channel_dir = match &self.channel_dir {
            Some(dir) => dir.clone(),
            None => acquire_channel_dir(&self.job_dir, identity)?,
        };
        self.channel_dir = Some(channel_dir.clone());
        let dir = layout::chunk_dir(&channel_dir, time_of_first);
        fs::create_dir(&dir)?;
        chunk_xml.write(&dir.join(layout::CHUNK_XML))?;
        info!("Created chunk {}", dir.display());
        self.chunk_dir = Some(dir.clone());
        Ok(dir)
    }
}

/// Finds the `channel<M>` directory whose `channel.xml` matches `identity`,
/// or allocates the next free index and writes a fresh `channel.xml`.
pub fn acquire_channel_dir(job_dir: &Path, identity: &ChannelXml) -> Result<PathBuf> {
    fs::create_dir_all(job_dir)?;
    let entries = layout::list_numbered(job_dir, "channel")?;
    for (_, dir) in &entries {
        match ChannelXml::read(&dir.join(layout::CHANNEL_XML)) {
            Ok(existing) if existing == *identity => {
                debug!("Reusing channel directory {}", dir.display());
                return Ok(dir.clone());
            }
            Ok(_) => {}
            Err(e) => debug!("Ignoring {}: {}", dir.display(), e),
        }
    }

    let next = entries.last().map(|(n, _)| n + 1).unwrap_or(0);
    let dir = layout::channel_dir(job_dir, next as u32);
    fs::create_dir(&dir)?;
    identity.write(&dir.join(layout::CHANNEL_XML))?;
    info!("Created channel directory {}", dir.display());
    Ok(dir)
}

/// Writer for one channel of a job.
pub struct Logger {
    preset: ChannelPreset,
    config: SaverConfig,
    hardware: Option<HardwareChannel>,
    encoder: Option<Box<dyn Encoder>>,
    chunk: ChunkState,
    pending: Option<PendingChange>,
    data_size: u64,
    finished: bool,
}

impl Logger {
    /// Creates a logger writing below `job_dir`.
    pub fn new(job_dir: impl Into<PathBuf>, preset: ChannelPreset, config: SaverConfig) -> Self {
        Self {
            preset,
            config,
            hardware: None,
            encoder: None,
            chunk: ChunkState::new(job_dir.into()),
            pending: None,
            data_size: 0,
            finished: true,
        }
    }

    /// Creates a logger, binds it to the hardware, validates its preset and
    /// creates its encoder.
    pub fn start(
        job_dir: impl Into<PathBuf>,
        preset: ChannelPreset,
        hardware: &[HardwareChannel],
        config: SaverConfig,
    ) -> Result<Self> {
        let mut logger = Self::new(job_dir, preset, config);
        logger.bind_hardware(hardware)?;
        logger.validate(&logger.preset)?;
        logger.create_encoder()?;
        Ok(logger)
    }

    /// Looks up the channel in the hardware enumeration.
    ///
    /// # Errors
    ///
    /// [`DlsError::ChannelNotFound`] if no hardware channel has this name.
    pub fn bind_hardware(&mut self, channels: &[HardwareChannel]) -> Result<()> {
        let hardware = channels
            .iter()
            .find(|c| c.name == self.preset.name)
            .ok_or_else(|| DlsError::ChannelNotFound(self.preset.name.clone()))?;
        self.chunk.identity = Some(ChannelXml {
            name: hardware.name.clone(),
            unit: hardware.unit.clone(),
            scalar: hardware.scalar,
        });
        self.chunk.channel_dir = None;
        self.hardware = Some(hardware.clone());
        Ok(())
    }

    /// Checks `preset` against the bound hardware channel and returns the
    /// derived acquisition settings.
    ///
    /// # Errors
    ///
    /// [`DlsError::InvalidParams`] for a bad frequency, a buffer overrun, bad
    /// storage settings or a lossy format on an integer channel.
    pub fn validate(&self, preset: &ChannelPreset) -> Result<Acquisition> {
        let hardware = self.hardware()?;
        let name = &preset.name;
        if !(preset.sample_frequency > 0.0) {
            return Err(DlsError::invalid(
                name,
                format!("invalid sample frequency {}", preset.sample_frequency),
            ));
        }
        if preset.sample_frequency > hardware.max_frequency {
            return Err(DlsError::invalid(
                name,
                format!(
                    "sample frequency exceeds channel maximum ({} / {} Hz)",
                    preset.sample_frequency, hardware.max_frequency
                ),
            ));
        }

        let reduction = (hardware.max_frequency / preset.sample_frequency + 0.5) as u32;
        let block_size = ((preset.sample_frequency + 0.5) as u32).max(1);
        let needed = u64::from(block_size) * u64::from(reduction);
        if needed > u64::from(hardware.buffer_size / 2) {
            return Err(DlsError::invalid(
                name,
                format!(
                    "buffer limit exceeded: {} > {}",
                    needed,
                    hardware.buffer_size / 2
                ),
            ));
        }

        if preset.block_size == 0 {
            return Err(DlsError::invalid(name, "block size must be positive"));
        }
        if preset.meta_reduction < 2 {
            return Err(DlsError::invalid(name, "meta reduction must be at least 2"));
        }
        preset
            .format
            .check(hardware.scalar)
            .map_err(|reason| DlsError::invalid(name, reason))?;

        Ok(Acquisition {
            reduction,
            block_size,
        })
    }

    /// Creates a fresh encoder for the current preset, dropping the old one
    /// with any unflushed values.
    pub fn create_encoder(&mut self) -> Result<()> {
        let hardware = self.hardware()?;
        let params = StreamParams {
            channel: self.preset.name.clone(),
            sample_frequency: self.preset.sample_frequency,
            block_size: self.preset.block_size as usize,
            meta_reduction: self.preset.meta_reduction as usize,
            meta_mask: self.preset.meta_mask,
            format: self.preset.format,
            order: ByteOrder::native(),
            config: self.config.clone(),
        };
        let encoder: Box<dyn Encoder> =
            with_sample_type!(hardware.scalar, T => Box::new(GenSaver::<T>::new(params)?));
        self.chunk.chunk_xml = Some(ChunkXml {
            sample_frequency: self.preset.sample_frequency,
            block_size: self.preset.block_size,
            meta_mask: self.preset.meta_mask,
            meta_reduction: self.preset.meta_reduction,
            format: self.preset.format,
            architecture: ByteOrder::native(),
        });
        self.encoder = Some(encoder);
        Ok(())
    }

    /// Forwards raw native-endian sample bytes whose last value was sampled
    /// at `time_of_last`.
    pub fn process_data(&mut self, bytes: &[u8], time_of_last: Time) -> Result<()> {
        let Some(encoder) = self.encoder.as_mut() else {
            return Err(DlsError::invalid(&self.preset.name, "no encoder"));
        };
        self.finished = false;
        encoder.process_data(bytes, time_of_last, &mut self.chunk)?;
        self.data_size += bytes.len() as u64;
        Ok(())
    }

    /// Flushes all buffered values and closes the current chunk.
    ///
    /// # Errors
    ///
    /// [`DlsError::FlushFailed`]: buffered values are lost. The chunk is
    /// closed anyway.
    pub fn finish(&mut self) -> Result<()> {
        let result = match self.encoder.as_mut() {
            Some(encoder) => encoder.flush(&mut self.chunk),
            None => Ok(()),
        };
        self.chunk.close();
        self.data_size = 0;
        result.map_err(|e| DlsError::FlushFailed {
            channel: self.preset.name.clone(),
            source: Box::new(e),
        })?;
        self.finished = true;
        Ok(())
    }

    /// Drops buffered values and starts over with a fresh encoder and no
    /// open chunk.
    pub fn discard_chunk(&mut self) -> Result<()> {
        self.data_size = 0;
        self.chunk.close();
        self.create_encoder()
    }

    /// Records `preset` as pending until `id` is acknowledged.
    ///
    /// A change that is already pending is replaced; its id becomes stale.
    pub fn set_change(&mut self, preset: ChannelPreset, id: impl Into<String>) {
        let id = id.into();
        if let Some(old) = &self.pending {
            warn!(
                "Channel {}: change {} still pending, replaced by {}",
                self.preset.name, old.id, id
            );
        }
        self.pending = Some(PendingChange { preset, id });
    }

    /// Returns the pending change, if any.
    pub fn pending_change(&self) -> Option<&PendingChange> {
        self.pending.as_ref()
    }

    /// Returns `true` if a change with `id` is pending.
    pub fn change_is(&self, id: &str) -> bool {
        self.pending.as_ref().is_some_and(|p| p.id == id)
    }

    /// Applies the pending change: finishes the open chunk under the old
    /// parameters, installs the new ones and creates a fresh encoder.
    pub fn do_change(&mut self) -> Result<()> {
        let Some(change) = self.pending.take() else {
            return Ok(());
        };
        self.finish()?;
        info!("Channel {}: applied change {}", self.preset.name, change.id);
        self.preset = change.preset;
        self.create_encoder()
    }

    /// Builds the start command for `preset`.
    pub fn start_command(&self, preset: &ChannelPreset, id: Option<String>) -> Result<Command> {
        let hardware = self.hardware()?;
        let acquisition = self.validate(preset)?;
        Ok(Command::Start {
            channel: preset.name.clone(),
            index: hardware.index,
            reduction: acquisition.reduction,
            block_size: acquisition.block_size.min(MAX_ACQUISITION_BLOCK_SIZE),
            id,
        })
    }

    /// Builds the stop command.
    pub fn stop_command(&self) -> Result<Command> {
        Ok(Command::Stop {
            channel: self.preset.name.clone(),
            index: self.hardware()?.index,
        })
    }

    /// Current parameters.
    pub fn preset(&self) -> &ChannelPreset {
        &self.preset
    }

    /// Bound hardware channel.
    pub fn hardware(&self) -> Result<&HardwareChannel> {
        self.hardware
            .as_ref()
            .ok_or_else(|| DlsError::ChannelNotFound(self.preset.name.clone()))
    }

    /// Directory of the open chunk, if one was created.
    pub fn chunk_dir(&self) -> Option<&Path> {
        self.chunk.chunk_dir.as_deref()
    }

    /// Channel directory, once acquired.
    pub fn channel_dir(&self) -> Option<&Path> {
        self.chunk.channel_dir.as_deref()
    }

    /// Raw bytes processed since the chunk was opened.
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    /// Returns `true` when no values are waiting to be flushed.
    pub fn is_finished(&self) -> bool {
        self.finished || self.encoder.as_ref().map_or(true, |e| e.is_idle())
    }

    /// Aggregates stored for this channel.
    pub fn meta_types(&self) -> Vec<MetaType> {
        MetaType::from_mask(self.preset.meta_mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::encode_samples;
    use tempfile::TempDir;

    fn hardware() -> Vec<HardwareChannel> {
        vec![
            HardwareChannel {
                name: "temp".to_string(),
                unit: "degC".to_string(),
                index: 3,
                scalar: ScalarType::Double,
                max_frequency: 1000.0,
                buffer_size: 100_000,
            },
            HardwareChannel {
                name: "count".to_string(),
                unit: "".to_string(),
                index: 4,
                scalar: ScalarType::Int,
                max_frequency: 100.0,
                buffer_size: 1000,
            },
        ]
    }

    #[test]
    fn test_bind_unknown_channel() {
        let temp_dir = TempDir::new().unwrap();
        let mut logger = Logger::new(
            temp_dir.path(),
            ChannelPreset::new("missing", 1.0),
            SaverConfig::default(),
        );
        assert!(matches!(
            logger.bind_hardware(&hardware()),
            Err(DlsError::ChannelNotFound(_))
        ));
    }

    #[test]
    fn test_validate() {
        let temp_dir = TempDir::new().unwrap();
        let mut logger = Logger::new(
            temp_dir.path(),
            ChannelPreset::new("count", 10.0),
            SaverConfig::default(),
        );
        logger.bind_hardware(&hardware()).unwrap();

        let acquisition = logger.validate(&ChannelPreset::new("count", 10.0)).unwrap();
        assert_eq!(acquisition, Acquisition { reduction: 10, block_size: 10 });
        let acquisition = logger.validate(&ChannelPreset::new("count", 0.3)).unwrap();
        assert_eq!(acquisition.block_size, 1);

        for preset in [
            ChannelPreset::new("count", 0.0),
            ChannelPreset::new("count", 200.0),
            ChannelPreset::new("count", 10.0).with_meta(6, 1),
            ChannelPreset::new("count", 10.0).with_block_size(0),
            ChannelPreset::new("count", 10.0).with_format(Format::Quant { accuracy: 0.1 }),
            ChannelPreset::new("count", 10.0).with_format(Format::Mdct {
                block_size: 64,
                accuracy: 0.1,
            }),
        ] {
            let err = logger.validate(&preset).unwrap_err();
            assert!(matches!(err, DlsError::InvalidParams { .. }), "{:?}", preset);
        }

        let mut small = hardware();
        small[1].buffer_size = 10;
        logger.bind_hardware(&small).unwrap();
        assert!(logger.validate(&ChannelPreset::new("count", 10.0)).is_err());
    }

    #[test]
    fn test_chunk_created_lazily() {
        let temp_dir = TempDir::new().unwrap();
        let job_dir = temp_dir.path().join("job1");
        let preset = ChannelPreset::new("temp", 10.0).with_block_size(5);
        let mut logger =
            Logger::start(&job_dir, preset, &hardware(), SaverConfig::default()).unwrap();
        assert!(logger.chunk_dir().is_none());
        assert!(logger.is_finished());

        let values: Vec<f64> = (0..3).map(f64::from).collect();
        logger
            .process_data(&encode_samples(&values, ByteOrder::native()), 2_200_000)
            .unwrap();
        // Fewer values than one block: nothing written yet.
        assert!(logger.chunk_dir().is_none());
        assert!(!logger.is_finished());

        logger
            .process_data(&encode_samples(&values, ByteOrder::native()), 2_500_000)
            .unwrap();
        let chunk_dir = logger.chunk_dir().unwrap().to_path_buf();
        assert_eq!(chunk_dir, job_dir.join("channel0").join("chunk2000000"));
        let chunk_xml = ChunkXml::read(&chunk_dir.join(layout::CHUNK_XML)).unwrap();
        assert_eq!(chunk_xml.block_size, 5);
        assert_eq!(chunk_xml.architecture, ByteOrder::native());

        logger.finish().unwrap();
        assert!(logger.chunk_dir().is_none());
        assert!(logger.is_finished());
    }

    #[test]
    fn test_channel_dir_reuse() {
        let temp_dir = TempDir::new().unwrap();
        let job_dir = temp_dir.path();
        let temp = ChannelXml {
            name: "temp".to_string(),
            unit: "degC".to_string(),
            scalar: ScalarType::Double,
        };
        let other_unit = ChannelXml {
            unit: "K".to_string(),
            ..temp.clone()
        };

        assert_eq!(acquire_channel_dir(job_dir, &temp).unwrap(), job_dir.join("channel0"));
        assert_eq!(acquire_channel_dir(job_dir, &other_unit).unwrap(), job_dir.join("channel1"));
        assert_eq!(acquire_channel_dir(job_dir, &temp).unwrap(), job_dir.join("channel0"));

        // Gaps are not filled: the next index is one past the highest.
        fs::create_dir(job_dir.join("channel7")).unwrap();
        let third = ChannelXml {
            name: "third".to_string(),
            ..temp
        };
        assert_eq!(acquire_channel_dir(job_dir, &third).unwrap(), job_dir.join("channel8"));
    }

    #[test]
    fn test_change_applies_on_ack_only() {
        let temp_dir = TempDir::new().unwrap();
        let preset = ChannelPreset::new("temp", 10.0).with_block_size(2);
        let mut logger =
            Logger::start(temp_dir.path(), preset, &hardware(), SaverConfig::default()).unwrap();
        let block = encode_samples(&[1.0f64, 2.0], ByteOrder::native());
        logger.process_data(&block, 100_000).unwrap();
        let first_chunk = logger.chunk_dir().unwrap().to_path_buf();

        logger.set_change(ChannelPreset::new("temp", 20.0), "a");
        assert!(logger.change_is("a"));
        assert!(!logger.change_is("b"));

        // Still the old chunk and the old frequency.
        logger.process_data(&block, 300_000).unwrap();
        assert_eq!(logger.chunk_dir().unwrap(), first_chunk);
        assert_eq!(logger.preset().sample_frequency, 10.0);

        logger.do_change().unwrap();
        assert_eq!(logger.preset().sample_frequency, 20.0);
        assert!(logger.pending_change().is_none());
        assert!(logger.chunk_dir().is_none());

        logger.process_data(&block, 1_000_000).unwrap();
        assert_ne!(logger.chunk_dir().unwrap(), first_chunk);
    }

    #[test]
    fn test_start_command_caps_block_size() {
        let temp_dir = TempDir::new().unwrap();
        let preset = ChannelPreset::new("temp", 1000.0);
        let logger =
            Logger::start(temp_dir.path(), preset.clone(), &hardware(), SaverConfig::default())
                .unwrap();
        let command = logger.start_command(&preset, Some("x".to_string())).unwrap();
        assert_eq!(
            command,
            Command::Start {
                channel: "temp".to_string(),
                index: 3,
                reduction: 1,
                block_size: 1000,
                id: Some("x".to_string()),
            }
        );
    }

    #[test]
    fn test_discard_chunk() {
        let temp_dir = TempDir::new().unwrap();
        let preset = ChannelPreset::new("temp", 10.0).with_block_size(100);
        let mut logger =
            Logger::start(temp_dir.path(), preset, &hardware(), SaverConfig::default()).unwrap();
        let block = encode_samples(&[1.0f64; 10], ByteOrder::native());
        logger.process_data(&block, 900_000).unwrap();
        assert_eq!(logger.data_size(), 80);
        logger.discard_chunk().unwrap();
        assert_eq!(logger.data_size(), 0);
        logger.finish().unwrap();
        // Nothing was ever written.
        assert!(layout::list_numbered(temp_dir.path(), "channel")
            .unwrap()
            .is_empty());
    }
}
