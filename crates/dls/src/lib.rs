//! DLS - Data Logging Service Storage Engine
//!
//! This crate stores sampled channel data in chunked, multi-resolution
//! directories and reads it back at the resolution a query needs.
//!
//! # Components
//!
//! - [`store`]: on-disk format shared by both sides (indices, records, codecs)
//! - [`Job`] / [`Logger`]: write side, one logger per acquired channel
//! - [`Directory`] / [`Channel`] / [`Chunk`]: read side with level selection
//! - [`reader::remote`]: blocking directory protocol over TCP
//!
//! # Example
//!
//! ```rust,ignore
//! use dls::{CatalogConfig, Collect, Directory};
//!
//! let directory = Directory::open("/var/lib/dls", CatalogConfig::default())?;
//! let mut job = directory.job(1)?;
//! job.fetch_channels()?;
//!
//! let channel = job.channel_mut(0).unwrap();
//! channel.fetch_chunks()?;
//!
//! // At least 1000 values per min/max stream for the last hour
//! let mut blocks = Collect::default();
//! channel.fetch_data(now - 3_600_000_000, now, 1000, 1, &mut blocks)?;
//! ```

#![deny(missing_docs)]

pub mod error;
pub mod reader;
pub mod store;
pub mod writer;

pub use error::{DlsError, ErrorClass, Result};
pub use reader::{
    CatalogConfig, Channel, Chunk, ChunkUpdate, Collect, Data, DataSink, Directory, FetchSummary,
    JobDir, TailState,
};
pub use store::meta::Format;
pub use store::{MetaType, ScalarType, Time};
pub use writer::{ChannelPreset, HardwareChannel, Job, Logger, SaverConfig};
