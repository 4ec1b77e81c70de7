//! Debounced reconciliation.
//!
//! Normalized batches are buffered per device. Every batch re-arms the
//! device's single-shot timer, so the buffer is flushed once the device has
//! been quiet for a whole window. On flush the buffer is swapped out, merged
//! into the store, and the device is notified at most once.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use tracing::warn;

use super::device::ChannelId;
use super::device::DeviceInfo;
use super::function::FunctionKey;
use super::function::Value;
use super::notifier::DeviceChanged;
use super::notifier::Notifier;
use super::payload::DeviceBatch;
use super::store::DeviceStore;
use super::store::MergeResult;

/// Production debounce window
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(20);

/// Updates accumulated for one device.
#[derive(Debug, Default)]
struct PendingBuffer {
    friendly_id: Option<String>,
    info: DeviceInfo,
    functions: BTreeMap<(ChannelId, FunctionKey), (Value, Option<String>)>,
    deadline: Option<Instant>,
    timer: Option<JoinHandle<()>>,
}

impl PendingBuffer {
    fn absorb(&mut self, batch: DeviceBatch) {
        if batch.friendly_id.is_some() {
            self.friendly_id = batch.friendly_id;
        }
        self.info.merge(batch.info);
        for update in batch.functions {
            self.functions.insert(
                (update.channel, update.key),
                (update.value, batch.source_timestamp.clone()),
            );
        }
    }
}

/// What a woken timer finds for its device.
enum Due {
    Ready(PendingBuffer),
    Later(Instant),
    Gone,
}

struct Shared {
    store: Arc<DeviceStore>,
    notifier: Notifier,
    window: Duration,
    pending: Mutex<HashMap<String, PendingBuffer>>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<String, PendingBuffer>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep until the device's deadline stops moving, then flush.
    async fn run_timer(&self, device_id: String, mut deadline: Instant) {
        loop {
            tokio::time::sleep_until(deadline).await;
            match self.take_due(&device_id) {
                Due::Ready(buffer) => return self.flush(&device_id, buffer),
                Due::Later(next) => deadline = next,
                Due::Gone => return,
            }
        }
    }

    /// Swap out the buffer of `device_id` if its deadline has passed.
    fn take_due(&self, device_id: &str) -> Due {
        let mut pending = self.pending();
        let Some(buffer) = pending.get(device_id) else {
            return Due::Gone;
        };
        match buffer.deadline {
            Some(deadline) if deadline > Instant::now() => Due::Later(deadline),
            _ => pending.remove(device_id).map_or(Due::Gone, Due::Ready),
        }
    }

    /// Merge a swapped-out buffer and notify once.
    fn flush(&self, device_id: &str, buffer: PendingBuffer) {
        let mut result = MergeResult::default();
        match self
            .store
            .merge_info(device_id, buffer.friendly_id.as_deref(), buffer.info)
        {
            Ok(r) => result.absorb(r),
            Err(e) => {
                warn!("Dropping updates for {:?}: {}", device_id, e);
                return;
            }
        }

        let count = buffer.functions.len();
        for ((channel, key), (value, source_timestamp)) in buffer.functions {
            match self.store.merge(
                device_id,
                None,
                channel,
                key,
                value,
                source_timestamp.as_deref(),
            ) {
                Ok(r) => result.absorb(r),
                Err(e) => warn!("Dropping update for {:?}: {}", device_id, e),
            }
        }

        debug!(
            "Flushed {} updates for {} (changed={})",
            count, device_id, result.changed
        );

        if result.changed {
            let key = self
                .store
                .key_of(device_id)
                .unwrap_or_else(|| device_id.to_string());
            self.notifier.notify(DeviceChanged {
                key,
                device_id: device_id.to_string(),
                created: result.created,
            });
        }
    }
}

/// Per-device debouncer in front of the store.
///
/// Cheap to clone; clones share buffers and timers.
#[derive(Clone)]
pub struct Reconciler {
    shared: Arc<Shared>,
}

impl Reconciler {
    pub fn new(store: Arc<DeviceStore>, notifier: Notifier, window: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                notifier,
                window,
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Buffer a batch and (re)arm the device's timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, batch: DeviceBatch) {
        // Buffer under the hardware id so the friendly and hardware spellings
        // of one device share a window.
        let device_id = self
            .shared
            .store
            .hardware_id(&batch.device_id)
            .unwrap_or_else(|| batch.device_id.clone());

        let mut pending = self.shared.pending();
        let buffer = pending.entry(device_id.clone()).or_default();
        buffer.absorb(batch);

        let deadline = Instant::now() + self.shared.window;
        buffer.deadline = Some(deadline);
        if buffer.timer.is_none() {
            let shared = Arc::clone(&self.shared);
            buffer.timer = Some(tokio::spawn(async move {
                shared.run_timer(device_id, deadline).await;
            }));
        }
    }

    /// Discard a device's buffer and cancel its timer.
    pub fn forget(&self, device_id: &str) {
        if let Some(buffer) = self.shared.pending().remove(device_id) {
            if let Some(timer) = buffer.timer {
                timer.abort();
            }
        }
    }

    /// Devices with a pending flush
    pub fn pending_devices(&self) -> usize {
        self.shared.pending().len()
    }

    /// Cancel every timer and discard unflushed buffers.
    pub fn shutdown(&self) {
        let mut pending = self.shared.pending();
        if !pending.is_empty() {
            debug!("Discarding {} pending buffers", pending.len());
        }
        for (_, buffer) in pending.drain() {
            if let Some(timer) = buffer.timer {
                timer.abort();
            }
        }
    }
}
