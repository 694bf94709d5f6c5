use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::pairing::device::DeviceId;
use crate::pairing::device::DeviceStateChanged;
use crate::pairing::device::DeviceSubscription;

/// Fan-out of device state changes to scoped subscribers.
///
/// Each subscriber names the devices it cares about and only hears about
/// those. Senders whose receiver is gone are pruned on the next delivery.
#[derive(Debug, Default)]
pub struct Subscribers {
    by_device: HashMap<DeviceId, Vec<mpsc::UnboundedSender<DeviceStateChanged>>>,
}

impl Subscribers {
    pub fn subscribe(&mut self, devices: &[DeviceId]) -> DeviceSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        for device in devices {
            self.by_device
                .entry(device.clone())
                .or_default()
                .push(tx.clone());
        }
        rx
    }

    pub fn notify(&mut self, event: &DeviceStateChanged) {
        let Some(senders) = self.by_device.get_mut(&event.device) else {
            return;
        };
        senders.retain(|tx| tx.send(event.clone()).is_ok());
        if senders.is_empty() {
            self.by_device.remove(&event.device);
        }
    }

    /// Number of live subscriptions on `device`.
    pub fn count(&self, device: &DeviceId) -> usize {
        self.by_device
            .get(device)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::device::DevicePower;
    use crate::pairing::device::DeviceState;

    fn changed(id: &str) -> DeviceStateChanged {
        DeviceStateChanged {
            device: DeviceId::from(id),
            state: DeviceState::with_power(DevicePower::On),
        }
    }

    #[test]
    fn test_only_subscribed_devices_are_delivered() {
        let mut subscribers = Subscribers::default();
        let mut rx = subscribers.subscribe(&[DeviceId::from("switch.a"), DeviceId::from("light.a")]);

        subscribers.notify(&changed("light.b"));
        subscribers.notify(&changed("light.a"));

        assert_eq!(rx.try_recv().unwrap().device, DeviceId::from("light.a"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let mut subscribers = Subscribers::default();
        let rx = subscribers.subscribe(&[DeviceId::from("light.a")]);
        assert_eq!(subscribers.count(&DeviceId::from("light.a")), 1);

        drop(rx);
        subscribers.notify(&changed("light.a"));
        assert_eq!(subscribers.count(&DeviceId::from("light.a")), 0);
        assert!(subscribers.by_device.is_empty());
    }
}
