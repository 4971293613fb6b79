//! Events driving a [`Job`](crate::writer::Job).
//!
//! The acquisition loop, or a signal handler, pushes events through an
//! [`EventSender`]; the loop applies them with
//! [`Job::poll`](crate::writer::Job::poll) once per iteration.

use crate::store::message::Message;
use crate::store::Time;
use crate::writer::logger::ChannelPreset;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use tracing::warn;

/// One thing that happened to a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// The desired channel list changed.
    Sync(Vec<ChannelPreset>),
    /// The acquisition source acknowledged a change.
    Ack(String),
    /// Raw samples arrived for a hardware channel.
    Data {
        /// Hardware channel index.
        channel_index: u32,
        /// Native-endian sample bytes.
        bytes: Vec<u8>,
        /// Time of the last sample.
        time_of_last: Time,
    },
    /// A job message to log.
    Message(Message),
    /// Drop buffered data, e.g. in a forked copy of the process.
    Discard,
    /// Flush everything.
    Finish,
}

/// Cloneable producer side of an [`EventQueue`].
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<JobEvent>,
}

impl EventSender {
    /// Queues `event`. Returns `false` if the queue is gone.
    pub fn push(&self, event: JobEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Queue of pending job events.
#[derive(Debug)]
pub struct EventQueue {
    tx: Sender<JobEvent>,
    rx: Receiver<JobEvent>,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self { tx, rx }
    }

    /// Returns a producer handle.
    pub fn sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
        }
    }

    /// Queues `event`.
    pub fn push(&self, event: JobEvent) {
        if self.tx.send(event).is_err() {
            warn!("Event queue closed");
        }
    }

    /// Takes the next queued event without blocking.
    pub fn poll(&self) -> Option<JobEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_events_keep_order_across_threads() {
        let queue = EventQueue::new();
        let sender = queue.sender();
        thread::spawn(move || {
            assert!(sender.push(JobEvent::Ack("1".to_string())));
            assert!(sender.push(JobEvent::Finish));
        })
        .join()
        .unwrap();
        queue.push(JobEvent::Discard);

        assert_eq!(queue.poll(), Some(JobEvent::Ack("1".to_string())));
        assert_eq!(queue.poll(), Some(JobEvent::Finish));
        assert_eq!(queue.poll(), Some(JobEvent::Discard));
        assert_eq!(queue.poll(), None);
    }
}
