//! Registry of devices seen behind the gateway.
//! Entries are created on first sighting and never modified afterwards.

use crate::error::{GatewayError, Result};
use log::info;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;

/// A device attached to the gateway (or the gateway itself).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub sid: String,
    pub model: String,
}

/// Maps device sid to model.
///
/// Inserts come from the receive loop only; readers always see a consistent
/// snapshot of the map.
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, String>>,
    discovered_tx: broadcast::Sender<DeviceRecord>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let (discovered_tx, _) = broadcast::channel(32);
        Self {
            devices: RwLock::new(HashMap::new()),
            discovered_tx,
        }
    }

    /// Records a device. Returns `true` if the sid was not known before.
    ///
    /// Only a first sighting is logged and announced to subscribers.
    pub fn register(&self, sid: &str, model: &str) -> Result<bool> {
        let mut guard = self
            .devices
            .write()
            .map_err(|e| GatewayError::Io(format!("Registry lock poisoned: {}", e)))?;

        if guard.contains_key(sid) {
            return Ok(false);
        }

        guard.insert(sid.to_string(), model.to_string());
        drop(guard);

        info!(
            "Detected a new Xiaomi smart device - sid: {} model: {}",
            sid, model
        );
        let _ = self.discovered_tx.send(DeviceRecord {
            sid: sid.to_string(),
            model: model.to_string(),
        });
        Ok(true)
    }

    /// Every known sid. Order is unspecified.
    pub fn all_known_ids(&self) -> Vec<String> {
        self.devices
            .read()
            .map(|g| g.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Model of a known device.
    pub fn model_of(&self, sid: &str) -> Option<String> {
        self.devices.read().ok().and_then(|g| g.get(sid).cloned())
    }

    pub fn len(&self) -> usize {
        self.devices.read().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forgets every device.
    pub fn clear(&self) {
        if let Ok(mut guard) = self.devices.write() {
            guard.clear();
        }
    }

    /// Receiver for first-sighting notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceRecord> {
        self.discovered_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    #[test]
    fn register_is_idempotent() {
        let registry = DeviceRegistry::new();
        let mut rx = registry.subscribe();

        assert!(registry.register("x", "plug").unwrap());
        assert!(!registry.register("x", "plug").unwrap());
        assert_eq!(registry.len(), 1);

        let first = rx.try_recv().unwrap();
        assert_eq!(first, DeviceRecord {
            sid: "x".into(),
            model: "plug".into()
        });
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn first_model_wins() {
        let registry = DeviceRegistry::new();
        registry.register("x", "plug").unwrap();
        registry.register("x", "86plug").unwrap();
        assert_eq!(registry.model_of("x").as_deref(), Some("plug"));
    }

    #[test]
    fn lists_and_clears() {
        let registry = DeviceRegistry::new();
        registry.register("a", "gateway").unwrap();
        registry.register("b", "motion").unwrap();

        let mut ids = registry.all_known_ids();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);

        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.all_known_ids().is_empty());
    }
}
