use crate::domain::frame_buffer::FrameNumberOverflow;
use crate::infrastructure::bluetooth::protocol;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

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

/// How a brightness request reaches the light
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BrightnessStrategy {
    /// Send a DIY settings frame carrying the brightness
    #[default]
    DiySettings,
    /// Pre-scale pixel colors, as the vendor app does on older firmware
    ScalePixels,
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
    "hello_fairy".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub known_bluetooth_addresses: Vec<String>,
    #[serde(default)]
    pub last_connected_address: Option<String>,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Advanced BLE Settings
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: String,
    #[serde(default = "default_write_uuid")]
    pub ble_write_char_uuid: String,
    #[serde(default = "default_notify_uuid")]
    pub ble_notify_char_uuid: String,
    #[serde(default = "default_connect_attempts")]
    pub connect_max_attempts: u32,
    #[serde(default = "default_connect_retry_delay_ms")]
    pub connect_retry_delay_ms: u64,

    // Device Settings
    /// Used until the advertised name tells us otherwise
    #[serde(default = "default_pixel_count")]
    pub default_pixel_count: u16,
    /// Force an ATT MTU instead of trusting the transport
    #[serde(default)]
    pub mtu_override: Option<u16>,
    /// Pixels per frame when no MTU was negotiated
    #[serde(default = "default_chunk_pixels")]
    pub default_chunk_pixels: usize,
    #[serde(default)]
    pub brightness_strategy: BrightnessStrategy,
    #[serde(default = "default_effect_speed")]
    pub effect_speed: u8,
    #[serde(default)]
    pub effect_direction: u8,

    // Scheduler Settings
    #[serde(default = "default_mode_delay_ms")]
    pub mode_delay_ms: u64,
    #[serde(default = "default_pixel_delay_ms")]
    pub pixel_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    // Frame numbering
    #[serde(default = "default_frame_number_limit")]
    pub frame_number_limit: u8,
    #[serde(default)]
    pub frame_number_overflow: FrameNumberOverflow,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            known_bluetooth_addresses: Vec::new(),
            last_connected_address: None,
            log_settings: LogSettings::default(),

            // Advanced BLE Settings
            ble_service_uuid: default_service_uuid(),
            ble_write_char_uuid: default_write_uuid(),
            ble_notify_char_uuid: default_notify_uuid(),
            connect_max_attempts: default_connect_attempts(),
            connect_retry_delay_ms: default_connect_retry_delay_ms(),

            // Device Settings
            default_pixel_count: default_pixel_count(),
            mtu_override: None,
            default_chunk_pixels: default_chunk_pixels(),
            brightness_strategy: BrightnessStrategy::default(),
            effect_speed: default_effect_speed(),
            effect_direction: 0,

            // Scheduler Settings
            mode_delay_ms: default_mode_delay_ms(),
            pixel_delay_ms: default_pixel_delay_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            write_timeout_ms: default_write_timeout_ms(),

            frame_number_limit: default_frame_number_limit(),
            frame_number_overflow: FrameNumberOverflow::default(),
        }
    }
}

fn default_service_uuid() -> String {
    protocol::SERVICE_UUID.to_string()
}
fn default_write_uuid() -> String {
    protocol::WRITE_CHAR_UUID.to_string()
}
fn default_notify_uuid() -> String {
    protocol::NOTIFY_CHAR_UUID.to_string()
}
fn default_connect_attempts() -> u32 {
    4
}
fn default_connect_retry_delay_ms() -> u64 {
    1000
}
fn default_pixel_count() -> u16 {
    protocol::DEFAULT_PIXEL_COUNT
}
fn default_chunk_pixels() -> usize {
    protocol::DEFAULT_CHUNK_PIXELS
}
fn default_effect_speed() -> u8 {
    protocol::DEFAULT_SPEED
}
fn default_mode_delay_ms() -> u64 {
    protocol::MODE_DELAY_MS
}
fn default_pixel_delay_ms() -> u64 {
    protocol::PIXEL_DELAY_MS
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    100
}
fn default_write_timeout_ms() -> u64 {
    2000
}
fn default_frame_number_limit() -> u8 {
    255
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Load from an explicit file, falling back to defaults when it is missing or invalid
    pub fn from_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("HelloFairy");
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
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn add_known_address(&mut self, address: &str) -> anyhow::Result<()> {
        let mut changed = false;
        if !self.settings.known_bluetooth_addresses.iter().any(|a| a == address) {
            self.settings.known_bluetooth_addresses.push(address.to_string());
            changed = true;
        }
        if self.settings.last_connected_address.as_deref() != Some(address) {
            self.settings.last_connected_address = Some(address.to_string());
            changed = true;
        }
        if changed {
            self.save()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_settings_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("hello_fairy_test_{}_{}", name, std::process::id()))
            .join("settings.json")
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings: Settings = serde_json::from_str(
            r#"{ "max_retries": 7, "frame_number_overflow": "hold", "brightness_strategy": "scale_pixels" }"#,
        )
        .unwrap();
        assert_eq!(settings.max_retries, 7);
        assert_eq!(settings.frame_number_overflow, FrameNumberOverflow::Hold);
        assert_eq!(settings.brightness_strategy, BrightnessStrategy::ScalePixels);
        assert_eq!(settings.default_pixel_count, 256);
        assert_eq!(settings.default_chunk_pixels, 85);
        assert_eq!(settings.ble_write_char_uuid, protocol::WRITE_CHAR_UUID);
        assert_eq!(settings.log_settings.level, "info");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let service = SettingsService::from_path(temp_settings_path("missing"));
        assert_eq!(service.get().frame_number_limit, 255);
    }

    #[test]
    fn test_known_address_round_trip() {
        let path = temp_settings_path("known");
        let mut service = SettingsService::from_path(path.clone());
        service.add_known_address("AA:BB:CC:DD:EE:FF").unwrap();
        service.add_known_address("AA:BB:CC:DD:EE:FF").unwrap();

        let reloaded = SettingsService::from_path(path.clone());
        assert_eq!(reloaded.get().known_bluetooth_addresses, vec!["AA:BB:CC:DD:EE:FF"]);
        assert_eq!(
            reloaded.get().last_connected_address.as_deref(),
            Some("AA:BB:CC:DD:EE:FF")
        );
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}
