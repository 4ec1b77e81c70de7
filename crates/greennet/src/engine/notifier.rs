//! Change notification fan-out.
//!
//! Observers get a signal naming the device; they re-read state from the
//! store. Nothing in a notification is authoritative beyond "look again".

use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the notification broadcast. Slow observers lag rather than
/// block the reconciler.
pub const NOTIFY_CHANNEL_SIZE: usize = 256;

/// "Device changed" signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceChanged {
    /// Canonical store key at the time of the change
    pub key: String,
    /// Hardware id, stable across re-keys
    pub device_id: String,
    /// First sighting of the device
    pub created: bool,
}

#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<DeviceChanged>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFY_CHANNEL_SIZE);
        Self { tx }
    }

    /// Publish a change. Having no observers is not an error.
    pub fn notify(&self, event: DeviceChanged) {
        debug!("Device changed: {} ({})", event.key, event.device_id);
        let _ = self.tx.send(event);
    }

    /// Receive every change.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceChanged> {
        self.tx.subscribe()
    }

    /// Follow a single device by hardware id.
    pub fn watch(&self, device_id: impl Into<String>) -> DeviceWatcher {
        let device_id = device_id.into();
        DeviceWatcher {
            key: device_id.clone(),
            device_id,
            rx: self.tx.subscribe(),
        }
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Changes of one device, surviving re-keys.
#[derive(Debug)]
pub struct DeviceWatcher {
    device_id: String,
    key: String,
    rx: broadcast::Receiver<DeviceChanged>,
}

impl DeviceWatcher {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Last known canonical key of the device
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Wait for the next change of the device and return its current key.
    ///
    /// Missed notifications count as a change since the device may have been
    /// among them. Returns `None` once the notifier is gone.
    pub async fn changed(&mut self) -> Option<&str> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.device_id == self.device_id => {
                    self.key = event.key;
                    return Some(&self.key);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(
                        "Watcher for {} missed {} notifications",
                        self.device_id, missed
                    );
                    return Some(&self.key);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changed(key: &str, device_id: &str) -> DeviceChanged {
        DeviceChanged {
            key: key.to_string(),
            device_id: device_id.to_string(),
            created: false,
        }
    }

    #[tokio::test]
    async fn test_subscribers_receive_changes() {
        let notifier = Notifier::new();
        let mut a = notifier.subscribe();
        let mut b = notifier.subscribe();
        assert_eq!(notifier.observer_count(), 2);

        notifier.notify(changed("A", "A"));
        assert_eq!(a.recv().await.unwrap().key, "A");
        assert_eq!(b.recv().await.unwrap().key, "A");
    }

    #[test]
    fn test_notify_without_observers() {
        let notifier = Notifier::new();
        notifier.notify(changed("A", "A"));
    }

    #[tokio::test]
    async fn test_watcher_follows_rekey() {
        let notifier = Notifier::new();
        let mut watcher = notifier.watch("01A02F6C");

        notifier.notify(changed("other", "0510B2C4"));
        notifier.notify(changed("KG_Vorrat-1K-1", "01A02F6C"));

        assert_eq!(watcher.changed().await, Some("KG_Vorrat-1K-1"));
        assert_eq!(watcher.key(), "KG_Vorrat-1K-1");
    }

    #[tokio::test]
    async fn test_watcher_treats_lag_as_change() {
        let notifier = Notifier::new();
        let mut watcher = notifier.watch("A");

        for i in 0..NOTIFY_CHANNEL_SIZE + 1 {
            notifier.notify(changed(&format!("k{}", i), "B"));
        }

        assert_eq!(watcher.changed().await, Some("A"));
    }

    #[tokio::test]
    async fn test_watcher_ends_when_notifier_dropped() {
        let notifier = Notifier::new();
        let mut watcher = notifier.watch("A");
        drop(notifier);
        assert_eq!(watcher.changed().await, None);
    }
}
