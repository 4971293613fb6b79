//! Job synchronizer.
//!
//! A [`Job`] owns one [`Logger`] per recorded channel, keyed by channel
//! name. [`Job::sync`] diffs a desired channel list against the running
//! loggers:
//!
//! | Situation                          | Action                                   |
//! |------------------------------------|------------------------------------------|
//! | no logger for a desired channel    | start logger, send start without id      |
//! | logger parameters differ           | [`Job::request_change`], start with id   |
//! | logger for an undesired channel    | send stop, finish, drop                  |
//!
//! A change only takes effect when [`Job::ack_received`] sees its id, so
//! samples that were in flight when the change command was sent are still
//! stored under the parameters they were produced with.

use crate::error::{DlsError, ErrorClass, Result};
use crate::store::layout;
use crate::store::message::Message;
use crate::store::Time;
use crate::writer::event::{EventQueue, JobEvent};
use crate::writer::logger::{ChannelPreset, Command, HardwareChannel, Logger};
use crate::writer::message::MessageLog;
use crate::writer::saver::SaverConfig;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, info, warn};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Receives commands for the acquisition hardware.
pub trait AcquisitionSource {
    /// Sends `command`.
    fn send(&mut self, command: Command) -> Result<()>;
}

impl AcquisitionSource for Vec<Command> {
    fn send(&mut self, command: Command) -> Result<()> {
        self.push(command);
        Ok(())
    }
}

/// What to do when a change is requested while another one is pending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChangePolicy {
    /// Replace the pending change. Its id becomes stale.
    #[default]
    Overwrite,
    /// Refuse the new request with [`DlsError::InvalidParams`].
    Reject,
}

/// Result of one [`Job::sync`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncCounts {
    /// Loggers started.
    pub added: usize,
    /// Changes requested.
    pub changed: usize,
    /// Loggers stopped.
    pub removed: usize,
}

/// A recording job.
pub struct Job<S: AcquisitionSource> {
    id: u32,
    job_dir: PathBuf,
    source: S,
    hardware: Vec<HardwareChannel>,
    loggers: BTreeMap<String, Logger>,
    config: SaverConfig,
    policy: ChangePolicy,
    messages: MessageLog,
    instance: u64,
    change_seq: u64,
}

impl<S: AcquisitionSource> Job<S> {
    /// Creates job `id` below the data directory `dls_dir`.
    pub fn new(
        dls_dir: &Path,
        id: u32,
        source: S,
        hardware: Vec<HardwareChannel>,
        config: SaverConfig,
    ) -> Self {
        let job_dir = layout::job_dir(dls_dir, id);
        Self {
            id,
            messages: MessageLog::new(&job_dir),
            job_dir,
            source,
            hardware,
            loggers: BTreeMap::new(),
            config,
            policy: ChangePolicy::default(),
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            change_seq: 0,
        }
    }

    /// Sets the pending-change policy.
    pub fn with_policy(mut self, policy: ChangePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replaces the hardware enumeration used for new loggers.
    pub fn set_hardware(&mut self, hardware: Vec<HardwareChannel>) {
        self.hardware = hardware;
    }

    /// Brings the running loggers in line with `desired`.
    ///
    /// Failures of a single channel are logged and skip that channel only.
    /// A fatal failure is returned after all channels were handled.
    pub fn sync(&mut self, desired: &[ChannelPreset]) -> Result<SyncCounts> {
        let mut counts = SyncCounts::default();
        let mut fatal = None;

        for preset in desired {
            // Compare against the pending preset, if any, so a change is
            // requested only once.
            let differs = self.loggers.get(&preset.name).map(|logger| {
                let target = logger
                    .pending_change()
                    .map(|p| &p.preset)
                    .unwrap_or(logger.preset());
                target != preset
            });
            let result = match differs {
                None => self.add_logger(preset).map(|()| counts.added += 1),
                Some(false) => continue,
                Some(true) => self.request_change(preset).map(|_| counts.changed += 1),
            };
            if let Err(e) = result {
                self.channel_failed(&preset.name, e, &mut fatal);
            }
        }

        let undesired: Vec<String> = self
            .loggers
            .keys()
            .filter(|name| !desired.iter().any(|p| &p.name == *name))
            .cloned()
            .collect();
        for name in undesired {
            if let Some(logger) = self.loggers.remove(&name) {
                counts.removed += 1;
                if let Err(e) = self.remove_logger(logger) {
                    self.channel_failed(&name, e, &mut fatal);
                }
            }
        }

        if counts == SyncCounts::default() {
            info!("Job {}: sync found nothing to do", self.id);
        } else {
            info!(
                "Job {}: added {}, changed {}, removed {} channels",
                self.id, counts.added, counts.changed, counts.removed
            );
        }
        match fatal {
            Some(e) => Err(e),
            None => Ok(counts),
        }
    }

    fn channel_failed(&self, channel: &str, e: DlsError, fatal: &mut Option<DlsError>) {
        error!("Job {}: channel {}: {}", self.id, channel, e);
        if e.class() == ErrorClass::Fatal && fatal.is_none() {
            *fatal = Some(e);
        }
    }

    fn add_logger(&mut self, preset: &ChannelPreset) -> Result<()> {
        let logger = Logger::start(
            &self.job_dir,
            preset.clone(),
            &self.hardware,
            self.config.clone(),
        )?;
        self.source.send(logger.start_command(preset, None)?)?;
        info!("Job {}: added channel {}", self.id, preset.name);
        self.loggers.insert(preset.name.clone(), logger);
        Ok(())
    }

    fn remove_logger(&mut self, mut logger: Logger) -> Result<()> {
        let name = logger.preset().name.clone();
        let stopped = logger.stop_command().and_then(|c| self.source.send(c));
        logger.finish()?;
        info!("Job {}: removed channel {}", self.id, name);
        stopped
    }

    fn generate_id(&mut self) -> String {
        self.change_seq += 1;
        format!("{}_{}", self.instance, self.change_seq)
    }

    /// Requests new parameters for a running channel and returns the
    /// correlation id sent with the change command.
    ///
    /// The change is applied by [`Job::ack_received`] with that id.
    pub fn request_change(&mut self, preset: &ChannelPreset) -> Result<String> {
        let logger = self
            .loggers
            .get(&preset.name)
            .ok_or_else(|| DlsError::ChannelNotFound(preset.name.clone()))?;
        logger.validate(preset)?;
        if let (ChangePolicy::Reject, Some(pending)) = (self.policy, logger.pending_change()) {
            return Err(DlsError::invalid(
                &preset.name,
                format!("change {} still pending", pending.id),
            ));
        }

        let id = self.generate_id();
        let logger = self
            .loggers
            .get_mut(&preset.name)
            .ok_or_else(|| DlsError::ChannelNotFound(preset.name.clone()))?;
        self.source
            .send(logger.start_command(preset, Some(id.clone()))?)?;
        logger.set_change(preset.clone(), id.clone());
        info!("Job {}: requested change {} for {}", self.id, id, preset.name);
        Ok(id)
    }

    /// Applies the change with `id`, if a logger is waiting for it.
    ///
    /// Returns `false` for unknown or stale ids.
    pub fn ack_received(&mut self, id: &str) -> Result<bool> {
        info!("Job {}: acknowledge received: {}", self.id, id);
        match self.loggers.values_mut().find(|l| l.change_is(id)) {
            Some(logger) => {
                logger.do_change()?;
                Ok(true)
            }
            None => {
                warn!("Job {}: change id {} does not exist", self.id, id);
                Ok(false)
            }
        }
    }

    /// Forwards samples of hardware channel `channel_index` to its logger.
    /// Samples for channels without a logger are dropped.
    pub fn process_data(
        &mut self,
        channel_index: u32,
        bytes: &[u8],
        time_of_last: Time,
    ) -> Result<()> {
        let logger = self
            .loggers
            .values_mut()
            .find(|l| l.hardware().is_ok_and(|h| h.index == channel_index));
        match logger {
            Some(logger) => logger.process_data(bytes, time_of_last),
            None => {
                warn!("Job {}: channel {} not required", self.id, channel_index);
                Ok(())
            }
        }
    }

    /// Drops all buffered data and ends the open chunks without writing.
    pub fn discard_data(&mut self) -> Result<()> {
        self.messages.close();
        for logger in self.loggers.values_mut() {
            logger.discard_chunk()?;
        }
        Ok(())
    }

    /// Flushes every logger.
    ///
    /// All loggers are flushed even if one fails; the first failure is
    /// returned.
    pub fn finish(&mut self) -> Result<()> {
        info!("Job {}: finishing", self.id);
        self.messages.close();
        let mut first = None;
        for logger in self.loggers.values_mut() {
            if let Err(e) = logger.finish() {
                error!("Job {}: {}", self.id, e);
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e),
            None => {
                info!("Job {}: finished without errors", self.id);
                Ok(())
            }
        }
    }

    /// Appends `message` to the job's message log.
    pub fn message(&mut self, message: &Message) {
        if let Err(e) = self.messages.append(message) {
            error!("Job {}: could not store message {:?}: {}", self.id, message.text, e);
        }
    }

    /// Applies one event.
    pub fn handle(&mut self, event: JobEvent) -> Result<()> {
        match event {
            JobEvent::Sync(desired) => self.sync(&desired).map(|_| ()),
            JobEvent::Ack(id) => self.ack_received(&id).map(|_| ()),
            JobEvent::Data {
                channel_index,
                bytes,
                time_of_last,
            } => self.process_data(channel_index, &bytes, time_of_last),
            JobEvent::Message(message) => {
                self.message(&message);
                Ok(())
            }
            JobEvent::Discard => self.discard_data(),
            JobEvent::Finish => self.finish(),
        }
    }

    /// Applies all queued events and returns how many were handled.
    ///
    /// Stops at the first fatal error. Other errors are logged.
    pub fn poll(&mut self, queue: &EventQueue) -> Result<usize> {
        let mut handled = 0;
        while let Some(event) = queue.poll() {
            handled += 1;
            if let Err(e) = self.handle(event) {
                if e.is_fatal() {
                    return Err(e);
                }
                error!("Job {}: {}", self.id, e);
            }
        }
        Ok(handled)
    }

    /// Job id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Job directory.
    pub fn job_dir(&self) -> &Path {
        &self.job_dir
    }

    /// Logger of the named channel.
    pub fn logger(&self, name: &str) -> Option<&Logger> {
        self.loggers.get(name)
    }

    /// Number of running loggers.
    pub fn logger_count(&self) -> usize {
        self.loggers.len()
    }

    /// Raw bytes buffered or written since the open chunks began.
    pub fn data_size(&self) -> u64 {
        self.loggers.values().map(Logger::data_size).sum()
    }

    /// The acquisition source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// The acquisition source, mutably.
    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }
}
