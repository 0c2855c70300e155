//! Tiered device-health statistics
//!
//! A `StatsEvent` is a sparse record: every field is independently present
//! or absent, and absent fields are omitted from the wire entirely. The
//! server keeps the latest merged event per gear; `merge_with` folds an
//! incoming event into it and produces a `StatsChanges` delta describing
//! exactly what changed.
//!
//! Fields carrying their own `update_at` (volume, brightness, light_mode,
//! system_version, wifi_store, pair_status) merge under per-field
//! last-writer-wins; the rest merge on structural equality.
//! `last_reset_at` is monotone forward-only.

use serde::{Deserialize, Serialize};

use super::time::EpochMillis;

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => s.serialize_str(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let text: Option<String> = Option::deserialize(d)?;
        match text {
            Some(t) => STANDARD
                .decode(t)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Battery status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Battery {
    pub percentage: i32,
    pub is_charging: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub current_capacity: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cycle_count: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub original_capacity: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub voltage: Option<f32>,
}

/// Firmware version and upgrade progress
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SystemVersion {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub current_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub installing_percentage: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub installing_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub components: Option<Vec<ComponentVersion>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub update_at: Option<EpochMillis>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentVersion {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub current_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub percentage: i32,
    pub update_at: EpochMillis,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Brightness {
    pub percentage: i32,
    pub update_at: EpochMillis,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightMode {
    pub mode: String,
    pub update_at: EpochMillis,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CellularNetwork {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub dns: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub gateway: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mask: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rssi: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ping: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WifiNetwork {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub bssid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub dns: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub gateway: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mask: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mac: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rssi: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub security: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ssid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ping: Option<i32>,
}

/// Remembered Wi-Fi networks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiStore {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub list: Option<Vec<WifiStoreEntry>>,
    pub update_at: EpochMillis,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiStoreEntry {
    pub last_connect_at: EpochMillis,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub security: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ssid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NfcTag {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub uid: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none", default)]
    pub tag_type: Option<String>,
    #[serde(with = "b64", skip_serializing_if = "Option::is_none", default)]
    pub raw_data: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rssi: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub update_at: Option<EpochMillis>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PairStatus {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pair_with: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub update_at: Option<EpochMillis>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shaking {
    pub level: i32,
}

/// A sparse stats report, one JSON object per message on the stats topic
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatsEvent {
    pub time: EpochMillis,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_reset_at: Option<EpochMillis>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub battery: Option<Battery>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub system_version: Option<SystemVersion>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub volume: Option<Volume>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub brightness: Option<Brightness>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub light_mode: Option<LightMode>,
    #[serde(
        rename = "cellular_network",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub cellular: Option<CellularNetwork>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub wifi_network: Option<WifiNetwork>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub wifi_store: Option<WifiStore>,
    // Serialized as a bare array of tags, not wrapped in an object
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub read_nfc_tag: Option<Vec<NfcTag>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pair_status: Option<PairStatus>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub shaking: Option<Shaking>,
}

/// The delta produced by folding one stats event into another
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StatsChanges {
    pub last_reset_at: Option<EpochMillis>,
    pub battery: Option<Battery>,
    pub system_version: Option<SystemVersion>,
    pub volume: Option<Volume>,
    pub brightness: Option<Brightness>,
    pub light_mode: Option<LightMode>,
    pub cellular: Option<CellularNetwork>,
    pub wifi_network: Option<WifiNetwork>,
    pub wifi_store: Option<WifiStore>,
    pub read_nfc_tag: Option<Vec<NfcTag>>,
    pub pair_status: Option<PairStatus>,
    pub shaking: Option<Shaking>,
}

impl StatsChanges {
    pub fn is_empty(&self) -> bool {
        self.last_reset_at.is_none()
            && self.battery.is_none()
            && self.system_version.is_none()
            && self.volume.is_none()
            && self.brightness.is_none()
            && self.light_mode.is_none()
            && self.cellular.is_none()
            && self.wifi_network.is_none()
            && self.wifi_store.is_none()
            && self.read_nfc_tag.is_none()
            && self.pair_status.is_none()
            && self.shaking.is_none()
    }
}

/// Per-field update timestamp for last-writer-wins merging
trait Stamped {
    fn stamp(&self) -> EpochMillis;
}

impl Stamped for Volume {
    fn stamp(&self) -> EpochMillis {
        self.update_at
    }
}

impl Stamped for Brightness {
    fn stamp(&self) -> EpochMillis {
        self.update_at
    }
}

impl Stamped for LightMode {
    fn stamp(&self) -> EpochMillis {
        self.update_at
    }
}

impl Stamped for WifiStore {
    fn stamp(&self) -> EpochMillis {
        self.update_at
    }
}

impl Stamped for SystemVersion {
    fn stamp(&self) -> EpochMillis {
        self.update_at.unwrap_or(EpochMillis::ZERO)
    }
}

impl Stamped for PairStatus {
    fn stamp(&self) -> EpochMillis {
        self.update_at.unwrap_or(EpochMillis::ZERO)
    }
}

/// Merge on structural equality: any present, different value wins
fn merge_plain<T: PartialEq + Clone>(current: &mut Option<T>, incoming: &Option<T>) -> Option<T> {
    match incoming {
        Some(new) if current.as_ref() != Some(new) => {
            *current = Some(new.clone());
            Some(new.clone())
        }
        _ => None,
    }
}

/// Merge under per-field last-writer-wins on `update_at`
fn merge_stamped<T: Stamped + PartialEq + Clone>(
    current: &mut Option<T>,
    incoming: &Option<T>,
) -> Option<T> {
    let new = incoming.as_ref()?;
    if let Some(cur) = current.as_ref() {
        if new.stamp() < cur.stamp() || cur == new {
            return None;
        }
    }
    *current = Some(new.clone());
    Some(new.clone())
}

impl StatsEvent {
    /// An empty report stamped at `time`
    pub fn at(time: EpochMillis) -> Self {
        Self {
            time,
            ..Self::default()
        }
    }

    /// Whether every field other than the timestamp is absent
    pub fn is_sparse_empty(&self) -> bool {
        self.last_reset_at.is_none()
            && self.battery.is_none()
            && self.system_version.is_none()
            && self.volume.is_none()
            && self.brightness.is_none()
            && self.light_mode.is_none()
            && self.cellular.is_none()
            && self.wifi_network.is_none()
            && self.wifi_store.is_none()
            && self.read_nfc_tag.is_none()
            && self.pair_status.is_none()
            && self.shaking.is_none()
    }

    /// Fold an incoming event into this one
    ///
    /// Returns `None` without touching `self` when the incoming event is
    /// older than the current one; otherwise returns the delta of fields
    /// that actually changed, or `None` when nothing did.
    pub fn merge_with(&mut self, other: &StatsEvent) -> Option<StatsChanges> {
        if other.time < self.time {
            return None;
        }
        self.time = other.time;

        let mut changes = StatsChanges::default();

        // Forward-only reset marker
        if let Some(new) = other.last_reset_at {
            if self.last_reset_at.map_or(true, |cur| new > cur) {
                self.last_reset_at = Some(new);
                changes.last_reset_at = Some(new);
            }
        }

        changes.battery = merge_plain(&mut self.battery, &other.battery);
        changes.cellular = merge_plain(&mut self.cellular, &other.cellular);
        changes.wifi_network = merge_plain(&mut self.wifi_network, &other.wifi_network);
        changes.read_nfc_tag = merge_plain(&mut self.read_nfc_tag, &other.read_nfc_tag);
        changes.shaking = merge_plain(&mut self.shaking, &other.shaking);

        changes.volume = merge_stamped(&mut self.volume, &other.volume);
        changes.brightness = merge_stamped(&mut self.brightness, &other.brightness);
        changes.light_mode = merge_stamped(&mut self.light_mode, &other.light_mode);
        changes.system_version = merge_stamped(&mut self.system_version, &other.system_version);
        changes.wifi_store = merge_stamped(&mut self.wifi_store, &other.wifi_store);
        changes.pair_status = merge_stamped(&mut self.pair_status, &other.pair_status);

        if changes.is_empty() {
            None
        } else {
            Some(changes)
        }
    }
}
