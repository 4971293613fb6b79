//! Write side: jobs, channel loggers and the default encoder.

pub mod event;
pub mod job;
pub mod logger;
pub mod message;
pub mod saver;

pub use event::{EventQueue, EventSender, JobEvent};
pub use job::{AcquisitionSource, ChangePolicy, Job, SyncCounts};
pub use logger::{Acquisition, ChannelPreset, Command, HardwareChannel, Logger, PendingChange};
pub use message::MessageLog;
pub use saver::{ChunkTarget, Encoder, GenSaver, SaverConfig};
