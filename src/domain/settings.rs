use crate::domain::models::{Passcode, PeripheralAddress};
use crate::infrastructure::bluetooth::protocol;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "bluedoor".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Chosen lock
    #[serde(default)]
    pub default_device_address: Option<PeripheralAddress>,
    #[serde(default)]
    pub default_device_name: Option<String>,
    #[serde(default = "default_passcode")]
    pub passcode: String,

    #[serde(default)]
    pub log_settings: LogSettings,

    // Advanced BLE Settings
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_serial_uuid")]
    pub ble_serial_char_uuid: String,
    #[serde(default = "default_key_delay_ms")]
    pub key_delay_ms: u64,
    #[serde(default = "default_picker_scan_window_ms")]
    pub picker_scan_window_ms: u64,

    /// Move the door state to `Error` when the lock reports an error byte.
    #[serde(default = "default_false")]
    pub error_status_sets_door_state: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_device_address: None,
            default_device_name: None,
            passcode: default_passcode(),
            log_settings: LogSettings::default(),
            ble_service_uuid: default_service_uuid(),
            ble_serial_char_uuid: default_serial_uuid(),
            key_delay_ms: default_key_delay_ms(),
            picker_scan_window_ms: default_picker_scan_window_ms(),
            error_status_sets_door_state: false,
        }
    }
}

impl Settings {
    pub fn service_uuid(&self) -> anyhow::Result<Uuid> {
        parse_uuid(&self.ble_service_uuid)
    }

    pub fn serial_char_uuid(&self) -> anyhow::Result<Uuid> {
        parse_uuid(&self.ble_serial_char_uuid)
    }

    pub fn key_delay(&self) -> Duration {
        Duration::from_millis(self.key_delay_ms)
    }

    pub fn picker_scan_window(&self) -> Duration {
        Duration::from_millis(self.picker_scan_window_ms)
    }

    /// Stored passcode, falling back to the factory code when the file holds garbage.
    pub fn passcode(&self) -> Passcode {
        self.passcode.parse().unwrap_or_else(|e| {
            warn!("Ignoring stored passcode: {}", e);
            Passcode::default()
        })
    }
}

fn parse_uuid(s: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| anyhow::anyhow!("Invalid UUID {:?}: {}", s, e))
}

fn default_passcode() -> String {
    String::from(&Passcode::default())
}
fn default_service_uuid() -> String {
    protocol::SERIAL_SERVICE_UUID.to_string()
}
fn default_serial_uuid() -> String {
    protocol::SERIAL_PORT_CHAR_UUID.to_string()
}
fn default_key_delay_ms() -> u64 {
    protocol::KEY_DELAY_MS
}
fn default_picker_scan_window_ms() -> u64 {
    10_000
}

/// Read side of the configuration as seen by the connection manager.
pub trait ConfigStore: Send + Sync {
    fn default_address(&self) -> Option<PeripheralAddress>;
    fn default_name(&self) -> Option<String>;
    fn passcode(&self) -> Passcode;
    fn settings(&self) -> Settings;
    /// Change hook: yields every new default device address.
    fn subscribe(&self) -> watch::Receiver<Option<PeripheralAddress>>;
}

pub struct SettingsService {
    settings: Settings,
    settings_path: Option<PathBuf>,
    address_tx: watch::Sender<Option<PeripheralAddress>>,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::load(settings_path))
    }

    /// Load from `path`, starting from defaults when the file is missing or unreadable.
    pub fn load(path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&path) {
            Ok(settings) => settings,
            Err(e) => {
                info!("Using default settings ({}): {}", path.display(), e);
                Settings::default()
            }
        };
        Self::build(settings, Some(path))
    }

    /// Settings that are never written to disk.
    pub fn in_memory(settings: Settings) -> Self {
        Self::build(settings, None)
    }

    fn build(settings: Settings, settings_path: Option<PathBuf>) -> Self {
        let (address_tx, _) = watch::channel(settings.default_device_address.clone());
        Self {
            settings,
            settings_path,
            address_tx,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BlueDoor");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let Some(path) = &self.settings_path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn path(&self) -> Option<&Path> {
        self.settings_path.as_deref()
    }

    /// Pick a new lock. Subscribers are notified even if the address is unchanged.
    pub fn set_default_device(
        &mut self,
        address: Option<PeripheralAddress>,
        name: Option<String>,
    ) -> anyhow::Result<()> {
        self.settings.default_device_address = address.clone();
        self.settings.default_device_name = name;
        self.save()?;
        self.address_tx.send_replace(address);
        Ok(())
    }

    pub fn set_passcode(&mut self, passcode: &Passcode) -> anyhow::Result<()> {
        self.settings.passcode = String::from(passcode);
        self.save()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<PeripheralAddress>> {
        self.address_tx.subscribe()
    }
}

impl ConfigStore for Mutex<SettingsService> {
    fn default_address(&self) -> Option<PeripheralAddress> {
        self.settings().default_device_address
    }

    fn default_name(&self) -> Option<String> {
        self.settings().default_device_name
    }

    fn passcode(&self) -> Passcode {
        self.settings().passcode()
    }

    fn settings(&self) -> Settings {
        let guard = self.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.get().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Option<PeripheralAddress>> {
        let guard = self.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert!(settings.default_device_address.is_none());
        assert_eq!(settings.passcode().digits(), &[1, 2, 3, 4]);
        assert_eq!(settings.key_delay(), Duration::from_millis(protocol::KEY_DELAY_MS));
        assert_eq!(settings.picker_scan_window(), Duration::from_secs(10));
        assert_eq!(
            settings.service_uuid().unwrap(),
            protocol::SERIAL_SERVICE_UUID
        );
        assert!(!settings.error_status_sets_door_state);
    }

    #[test]
    fn test_bad_stored_passcode_falls_back() {
        let settings = Settings {
            passcode: "12x".to_string(),
            ..Default::default()
        };
        assert_eq!(settings.passcode(), Passcode::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut service = SettingsService::load(path.clone());
        let address = PeripheralAddress::new("c8:a0:30:f1:22:10").unwrap();
        service
            .set_default_device(Some(address.clone()), Some("Front door".to_string()))
            .unwrap();
        service.set_passcode(&"9876".parse().unwrap()).unwrap();

        let reloaded = SettingsService::load(path);
        assert_eq!(reloaded.get().default_device_address, Some(address));
        assert_eq!(
            reloaded.get().default_device_name.as_deref(),
            Some("Front door")
        );
        assert_eq!(reloaded.get().passcode().digits(), &[9, 8, 7, 6]);
    }

    #[test]
    fn test_change_hook_sees_new_address() {
        let store = Mutex::new(SettingsService::in_memory(Settings::default()));
        let mut rx = ConfigStore::subscribe(&store);
        assert!(rx.borrow_and_update().is_none());

        let address = PeripheralAddress::new("AA:BB:CC:DD:EE:FF").unwrap();
        store
            .lock()
            .unwrap()
            .set_default_device(Some(address.clone()), None)
            .unwrap();

        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().clone(), Some(address.clone()));
        assert_eq!(store.default_address(), Some(address));
    }
}
