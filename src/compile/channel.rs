//! Supervisor side of the result channel.
//!
//! A collector thread blocks on the worker's stdout and forwards decoded
//! frames over an in-process channel. The poll loop never blocks on the pipe:
//! it drains whatever the collector has already decoded.

use super::ipc::{Frame, LineReader};
use super::protocol::WorkerMessage;
use crate::build::BuildDirectoryResult;
use crate::error::Result;
use std::io::Read;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, unbounded};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One non-blocking read from the channel.
#[derive(Debug, PartialEq, Eq)]
pub enum Received {
    /// A well-formed frame.
    Message(WorkerMessage),
    /// A frame that could not be decoded (torn write, garbage, bad entry).
    Corrupt(String),
    /// Nothing available right now.
    Empty,
    /// The writer is gone and everything has been read.
    Closed,
}

/// Channel state after a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    Empty,
    Closed,
}

type Event = std::result::Result<WorkerMessage, String>;

/// Reader half of the worker result channel.
pub struct ResultChannel {
    receiver: Receiver<Event>,
    collector: Option<JoinHandle<()>>,
}

impl ResultChannel {
    /// Start a collector thread reading frames from `source`.
    pub fn spawn<R: Read + Send + 'static>(source: R) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let collector = thread::Builder::new()
            .name("ghcc-collector".to_string())
            .spawn(move || collect(LineReader::new(source), sender))?;
        Ok(Self {
            receiver,
            collector: Some(collector),
        })
    }

    /// Non-blocking receive.
    pub fn try_next(&self) -> Received {
        match self.receiver.try_recv() {
            Ok(event) => to_received(event),
            Err(TryRecvError::Empty) => Received::Empty,
            Err(TryRecvError::Disconnected) => Received::Closed,
        }
    }

    /// Move every result available now into `results`.
    pub fn drain_into(&mut self, results: &mut Vec<BuildDirectoryResult>) -> Drain {
        loop {
            match self.try_next() {
                Received::Empty => return Drain::Empty,
                Received::Closed => {
                    self.join_collector();
                    return Drain::Closed;
                }
                received => accept(received, results),
            }
        }
    }

    /// Drain until the writer side closes, giving up after `timeout`.
    ///
    /// Giving up leaves the collector thread detached; it exits on its own
    /// once the last writer of the pipe dies.
    pub fn drain_until_closed(
        &mut self,
        results: &mut Vec<BuildDirectoryResult>,
        timeout: Duration,
    ) -> Drain {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.receiver.recv_timeout(remaining) {
                Ok(event) => accept(to_received(event), results),
                Err(RecvTimeoutError::Disconnected) => {
                    self.join_collector();
                    return Drain::Closed;
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!("Result channel still open after worker exit; abandoning collector");
                    self.collector.take();
                    return Drain::Empty;
                }
            }
        }
    }

    fn join_collector(&mut self) {
        if let Some(handle) = self.collector.take() {
            let _ = handle.join();
        }
    }
}

fn to_received(event: Event) -> Received {
    match event {
        Ok(message) => Received::Message(message),
        Err(reason) => Received::Corrupt(reason),
    }
}

fn accept(received: Received, results: &mut Vec<BuildDirectoryResult>) {
    match received {
        Received::Message(WorkerMessage::Result { entry }) => results.push(entry),
        Received::Message(WorkerMessage::Finished {
            attempted,
            produced,
        }) => {
            debug!(attempted, produced, "Worker finished all directories");
        }
        Received::Corrupt(reason) => {
            warn!(reason = %reason, "Discarding corrupt frame from result channel");
        }
        Received::Empty | Received::Closed => {}
    }
}

/// Collector thread body: decode frames until EOF or a read error.
fn collect<R: Read>(mut reader: LineReader<R>, sender: Sender<Event>) {
    loop {
        let event = match reader.read_frame() {
            Ok(Some(Frame::Complete(bytes))) => decode(bytes),
            Ok(Some(Frame::Truncated(bytes))) => {
                Err(format!("truncated frame of {} bytes", bytes.len()))
            }
            Ok(None) => return,
            Err(e) => {
                // A broken pipe means the writer is gone; report once and stop.
                let _ = sender.send(Err(format!("read error: {}", e)));
                return;
            }
        };
        if sender.send(event).is_err() {
            return;
        }
    }
}

fn decode(bytes: &[u8]) -> Event {
    match WorkerMessage::from_line(bytes) {
        Ok(WorkerMessage::Result { entry }) if !entry.is_well_formed() => Err(format!(
            "entry for {} has {} binaries but {} digests",
            entry.directory.display(),
            entry.binaries.len(),
            entry.digests.len()
        )),
        Ok(message) => Ok(message),
        Err(e) => Err(format!("invalid frame: {}", e)),
    }
}
