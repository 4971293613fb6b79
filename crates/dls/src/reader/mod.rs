//! Read side: directory and channel catalogs, chunk decoding and the remote
//! protocol.
//!
//! A read starts at a [`Directory`], goes through [`JobDir`] to a
//! [`Channel`], and ends in [`Chunk::fetch_data`], which hands decoded
//! [`Data`] blocks to a [`DataSink`].

pub mod channel;
pub mod chunk;
pub mod data;
pub mod dir;
pub mod remote;

pub use channel::{CatalogConfig, Channel, ChannelInfo, ChunkUpdate};
pub use chunk::{optimal_level, Chunk, ChunkInfo, FetchSummary, TailState};
pub use data::{Collect, Data, DataSink};
pub use dir::{Directory, JobDir};
pub use remote::{RemoteClient, RemoteConfig};
