use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::peer::{DataChannel, LinkError};

/// Capacity of the inbound message queue. A full queue blocks the producing
/// channel handler instead of dropping data.
pub const INBOUND_QUEUE_CAPACITY: usize = 1024;

struct ActiveChannel {
    id: u64,
    generation: u64,
    channel: Arc<dyn DataChannel>,
    closed: watch::Sender<bool>,
}

/// The active data channel of a session plus its inbound queue.
pub struct ChannelState {
    active: Mutex<Option<ActiveChannel>>,
    connected: Notify,
    inbound: AsyncMutex<mpsc::Receiver<Bytes>>,
}

impl ChannelState {
    pub fn new() -> (Arc<Self>, mpsc::Sender<Bytes>) {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let state = Arc::new(Self {
            active: Mutex::new(None),
            connected: Notify::new(),
            inbound: AsyncMutex::new(rx),
        });
        (state, tx)
    }

    pub fn is_open(&self) -> bool {
        self.active.lock().is_some()
    }

    pub fn label(&self) -> Option<String> {
        self.active.lock().as_ref().map(|active| active.channel.label())
    }

    /// Records an opened channel as active and wakes everyone waiting for one.
    pub(crate) fn attach(&self, generation: u64, id: u64, channel: Arc<dyn DataChannel>) {
        let label = channel.label();
        {
            let mut active = self.active.lock();
            // Readers parked on the previous channel stay parked on its successor.
            let closed = match active.take() {
                Some(previous) => {
                    debug!(previous = previous.id, id, "replacing active data channel");
                    previous.closed
                }
                None => watch::channel(false).0,
            };
            *active = Some(ActiveChannel {
                id,
                generation,
                channel,
                closed,
            });
        }
        info!(label = %label, id, generation, "data channel opened");
        self.connected.notify_waiters();
    }

    /// Clears the active channel if it is `id`, returning its generation.
    pub(crate) fn detach(&self, id: u64) -> Option<u64> {
        let mut active = self.active.lock();
        if active.as_ref().map(|current| current.id) != Some(id) {
            return None;
        }
        active.take().map(|previous| {
            previous.closed.send_replace(true);
            previous.generation
        })
    }

    /// Clears the active channel if it belongs to `generation`.
    pub(crate) fn detach_generation(&self, generation: u64) -> bool {
        let mut active = self.active.lock();
        if active.as_ref().map(|current| current.generation) != Some(generation) {
            return false;
        }
        if let Some(previous) = active.take() {
            previous.closed.send_replace(true);
        }
        true
    }

    pub(crate) fn take(&self) -> Option<Arc<dyn DataChannel>> {
        self.active.lock().take().map(|previous| {
            previous.closed.send_replace(true);
            previous.channel
        })
    }

    /// Waits until a channel is open. Returns `false` if `stop` fires first.
    pub async fn wait_connected(&self, stop: &CancellationToken) -> bool {
        loop {
            let notified = self.connected.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_open() {
                return true;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = stop.cancelled() => return false,
            }
        }
    }

    /// Next inbound payload, or `None` once the session is stopped or the
    /// channel that was active when the read began has closed. Queued
    /// payloads are always drained first.
    pub async fn read(&self, stop: &CancellationToken) -> Option<Bytes> {
        let closed = self
            .active
            .lock()
            .as_ref()
            .map(|active| active.closed.subscribe());
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            biased;
            payload = inbound.recv() => payload,
            _ = stop.cancelled() => None,
            _ = channel_closed(closed) => None,
        }
    }

    /// Sends on the active channel. Returns `Ok(false)` when no channel is
    /// open and the payload was discarded.
    pub async fn write(&self, payload: Bytes) -> Result<bool, LinkError> {
        let channel = self
            .active
            .lock()
            .as_ref()
            .map(|active| Arc::clone(&active.channel));
        let Some(channel) = channel else {
            debug!(len = payload.len(), "no open data channel; discarding write");
            return Ok(false);
        };
        channel.send(payload).await?;
        Ok(true)
    }
}

async fn channel_closed(closed: Option<watch::Receiver<bool>>) {
    match closed {
        Some(mut closed) => {
            let _ = closed.wait_for(|closed| *closed).await.map(|_| ());
        }
        None => std::future::pending::<()>().await,
    }
}
