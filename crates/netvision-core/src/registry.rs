//! In-memory device registry.
//!
//! The relay hub and the viewer sync engine both keep one of these. Devices
//! are only ever added or updated; disconnection flips the `connected` flag
//! and nothing short of [`DeviceRegistry::clear`] removes a record.

use std::collections::HashMap;

use crate::types::{now_millis, DevicePlatform, DeviceRecord, LogEnvelope};

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, DeviceRecord>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert from a log envelope that carries a device id. First sighting
    /// creates the record; later sightings refresh name, platform and
    /// `last_seen` in place and mark the device connected. Envelopes without
    /// a device id leave the registry untouched.
    ///
    /// Returns `true` when the registry changed.
    pub fn upsert_from_log(&mut self, envelope: &LogEnvelope) -> bool {
        let Some(id) = envelope.device_id.as_deref() else {
            return false;
        };
        self.upsert(
            id,
            envelope.device_name.as_deref(),
            envelope.device_platform,
        );
        true
    }

    /// Mark a device connected, creating the record on first sighting.
    pub fn mark_connected(
        &mut self,
        id: &str,
        name: Option<&str>,
        platform: Option<DevicePlatform>,
    ) {
        self.upsert(id, name, platform);
    }

    /// Flip a known device to disconnected. Unknown ids are ignored; an
    /// explicit detach for a device we never saw is not a sighting.
    ///
    /// Returns `true` when a record changed.
    pub fn mark_disconnected(&mut self, id: &str) -> bool {
        match self.devices.get_mut(id) {
            Some(record) => {
                record.connected = false;
                record.last_seen = now_millis();
                true
            }
            None => false,
        }
    }

    /// Additive bulk merge of a registry snapshot: every record in the
    /// payload is added or replaced, devices absent from it are kept as-is.
    pub fn merge(&mut self, devices: Vec<DeviceRecord>) {
        for record in devices {
            self.devices.insert(record.id.clone(), record);
        }
    }

    pub fn get(&self, id: &str) -> Option<&DeviceRecord> {
        self.devices.get(id)
    }

    /// Snapshot of every known device, ordered by id so repeated snapshots
    /// of the same state compare equal.
    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        let mut records: Vec<DeviceRecord> = self.devices.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }

    fn upsert(&mut self, id: &str, name: Option<&str>, platform: Option<DevicePlatform>) {
        let now = now_millis();
        match self.devices.get_mut(id) {
            Some(record) => {
                if let Some(name) = name {
                    record.name = name.to_string();
                }
                if platform.is_some() {
                    record.platform = platform;
                }
                record.connected = true;
                record.last_seen = now;
            }
            None => {
                self.devices.insert(
                    id.to_string(),
                    DeviceRecord {
                        id: id.to_string(),
                        // Devices that never report a display name show up
                        // under their id.
                        name: name.unwrap_or(id).to_string(),
                        platform,
                        connected: true,
                        last_seen: now,
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope_from(device_id: &str, device_name: Option<&str>) -> LogEnvelope {
        LogEnvelope {
            method: "GET".to_string(),
            url: "https://x.test/a".to_string(),
            duration: 1.0,
            status: 200,
            request_headers: Default::default(),
            response_headers: Default::default(),
            request_body: None,
            response_body: None,
            cookies: None,
            timestamp: 1,
            device_id: Some(device_id.to_string()),
            device_name: device_name.map(str::to_string),
            device_platform: None,
        }
    }

    #[test]
    fn test_upsert_from_log_creates_then_refreshes() {
        let mut registry = DeviceRegistry::new();
        assert!(registry.upsert_from_log(&envelope_from("d1", None)));
        assert_eq!(registry.get("d1").unwrap().name, "d1");

        assert!(registry.upsert_from_log(&envelope_from("d1", Some("Pixel 7"))));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("d1").unwrap().name, "Pixel 7");
        assert!(registry.get("d1").unwrap().connected);
    }

    #[test]
    fn test_upsert_from_log_without_device_id_is_noop() {
        let mut registry = DeviceRegistry::new();
        let mut envelope = envelope_from("d1", None);
        envelope.device_id = None;
        assert!(!registry.upsert_from_log(&envelope));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_disconnect_flips_flag_but_keeps_record() {
        let mut registry = DeviceRegistry::new();
        registry.mark_connected("d1", Some("Pixel 7"), Some(DevicePlatform::Android));
        assert!(registry.mark_disconnected("d1"));

        let record = registry.get("d1").unwrap();
        assert!(!record.connected);
        assert_eq!(record.name, "Pixel 7");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_disconnect_unknown_id_is_noop() {
        let mut registry = DeviceRegistry::new();
        assert!(!registry.mark_disconnected("ghost"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reconnect_updates_in_place_without_duplicates() {
        let mut registry = DeviceRegistry::new();
        registry.mark_connected("d1", Some("Pixel 7"), None);
        registry.mark_disconnected("d1");
        registry.mark_connected("d1", Some("Pixel 7 Pro"), Some(DevicePlatform::Android));

        assert_eq!(registry.len(), 1);
        let record = registry.get("d1").unwrap();
        assert!(record.connected);
        assert_eq!(record.name, "Pixel 7 Pro");
        assert_eq!(record.platform, Some(DevicePlatform::Android));
    }

    #[test]
    fn test_merge_is_additive() {
        let mut registry = DeviceRegistry::new();
        registry.mark_connected("local", Some("Local Device"), None);

        registry.merge(vec![
            DeviceRecord {
                id: "remote".to_string(),
                name: "Remote Device".to_string(),
                platform: Some(DevicePlatform::Ios),
                connected: true,
                last_seen: 99,
            },
            DeviceRecord {
                id: "local".to_string(),
                name: "Local Device Renamed".to_string(),
                platform: None,
                connected: false,
                last_seen: 100,
            },
        ]);

        // Union semantics: incoming records land, nothing is removed.
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("local").unwrap().name, "Local Device Renamed");
        assert_eq!(registry.get("remote").unwrap().platform, Some(DevicePlatform::Ios));

        // A later snapshot missing "remote" must not drop it.
        registry.merge(vec![DeviceRecord {
            id: "local".to_string(),
            name: "Local Device".to_string(),
            platform: None,
            connected: true,
            last_seen: 101,
        }]);
        assert_eq!(registry.len(), 2);
        assert!(registry.get("remote").is_some());
    }

    #[test]
    fn test_snapshot_is_sorted_by_id() {
        let mut registry = DeviceRegistry::new();
        registry.mark_connected("zeta", None, None);
        registry.mark_connected("alpha", None, None);
        registry.mark_connected("mid", None, None);

        let ids: Vec<String> = registry.snapshot().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_clear_empties_registry() {
        let mut registry = DeviceRegistry::new();
        registry.mark_connected("d1", None, None);
        registry.clear();
        assert!(registry.is_empty());
    }
}
