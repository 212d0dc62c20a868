//! Channels between background tasks and the UI loop, scoped to one session.
//!
//! Progress travels over a lossy channel: when the loop has not drained it, new
//! samples are dropped instead of blocking the reader, the next sample supersedes
//! them anyway. Everything else, the completion result included, travels over a
//! second channel whose sends wait for room and are never dropped.

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::session::Event;
use crate::types::{CompletionResult, ProgressEvent, ProgressUpdate};

pub const PROGRESS_CAPACITY: usize = 100;
pub const MESSAGE_CAPACITY: usize = 16;

#[derive(Clone)]
pub struct Bridge {
    progress_tx: mpsc::Sender<ProgressUpdate>,
    message_tx: mpsc::Sender<Event>,
}

pub struct Inbox {
    progress_rx: mpsc::Receiver<ProgressUpdate>,
    message_rx: mpsc::Receiver<Event>,
}

pub fn channel() -> (Bridge, Inbox) {
    channel_with_capacity(PROGRESS_CAPACITY, MESSAGE_CAPACITY)
}

pub fn channel_with_capacity(progress: usize, messages: usize) -> (Bridge, Inbox) {
    let (progress_tx, progress_rx) = mpsc::channel(progress);
    let (message_tx, message_rx) = mpsc::channel(messages);
    (
        Bridge {
            progress_tx,
            message_tx,
        },
        Inbox {
            progress_rx,
            message_rx,
        },
    )
}

impl Bridge {
    /// Returns false when the sample was dropped.
    pub fn offer_progress(&self, update: ProgressUpdate) -> bool {
        match self.progress_tx.try_send(update) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Waits for room; only fails once the loop is gone.
    pub async fn post(&self, event: Event) {
        let _ = self.message_tx.send(event).await;
    }

    pub async fn complete(&self, result: CompletionResult) {
        self.post(Event::Completed(result)).await;
    }

    /// A sink that stamps every event with the attempt that produced it.
    pub fn progress_sink(&self, attempt: u32, used_fallback: bool) -> ProgressSink {
        ProgressSink {
            bridge: self.clone(),
            attempt,
            used_fallback,
        }
    }
}

#[derive(Clone)]
pub struct ProgressSink {
    bridge: Bridge,
    attempt: u32,
    used_fallback: bool,
}

impl ProgressSink {
    pub fn send(&self, event: ProgressEvent) -> bool {
        self.bridge.offer_progress(ProgressUpdate {
            attempt: self.attempt,
            used_fallback: self.used_fallback,
            event,
        })
    }
}

impl Inbox {
    /// Everything currently queued: progress first, then messages, so a
    /// completion is never followed by stale progress within one drain.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(update) = self.progress_rx.try_recv() {
            events.push(Event::Progress(update));
        }
        while let Ok(event) = self.message_rx.try_recv() {
            events.push(event);
        }
        events
    }
}
