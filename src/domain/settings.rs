use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

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
    "slate_notes".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Timeouts and thresholds used by the protocol engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolSettings {
    /// Default wait for a command reply
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
    /// Wait for replies that some devices never send
    #[serde(default = "default_optional_reply_timeout_ms")]
    pub optional_reply_timeout_ms: u64,
    /// Wait for the user to press the device button during registration
    #[serde(default = "default_button_timeout_ms")]
    pub button_timeout_ms: u64,
    /// Wait for the end-of-transfer marker
    #[serde(default = "default_transfer_timeout_ms")]
    pub transfer_timeout_ms: u64,
    /// Drain time for trailing bulk notifications after the end marker
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Files smaller than this are treated as empty
    #[serde(default = "default_min_file_size")]
    pub min_file_size: usize,
}

impl ProtocolSettings {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
    pub fn optional_reply_timeout(&self) -> Duration {
        Duration::from_millis(self.optional_reply_timeout_ms)
    }
    pub fn button_timeout(&self) -> Duration {
        Duration::from_millis(self.button_timeout_ms)
    }
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            reply_timeout_ms: default_reply_timeout_ms(),
            optional_reply_timeout_ms: default_optional_reply_timeout_ms(),
            button_timeout_ms: default_button_timeout_ms(),
            transfer_timeout_ms: default_transfer_timeout_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            min_file_size: default_min_file_size(),
        }
    }
}

fn default_reply_timeout_ms() -> u64 {
    5000
}
fn default_optional_reply_timeout_ms() -> u64 {
    1000
}
fn default_button_timeout_ms() -> u64 {
    15000
}
fn default_transfer_timeout_ms() -> u64 {
    30000
}
fn default_settle_delay_ms() -> u64 {
    200
}
fn default_min_file_size() -> usize {
    8
}

/// Pen width model for the vector renderer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderSettings {
    /// Width at half pressure, in output units
    #[serde(default = "default_base_pen_width")]
    pub base_pen_width: f64,
    /// Width added at full pressure (and removed at zero pressure)
    #[serde(default = "default_pressure_width_factor")]
    pub pressure_width_factor: f64,
    #[serde(default = "default_width_precision")]
    pub width_precision: f64,
    /// Micrometers to output units
    #[serde(default = "default_output_scale")]
    pub output_scale: f64,
    #[serde(default = "default_stroke_color")]
    pub stroke_color: String,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            base_pen_width: default_base_pen_width(),
            pressure_width_factor: default_pressure_width_factor(),
            width_precision: default_width_precision(),
            output_scale: default_output_scale(),
            stroke_color: default_stroke_color(),
        }
    }
}

fn default_base_pen_width() -> f64 {
    0.4
}
fn default_pressure_width_factor() -> f64 {
    0.2
}
fn default_width_precision() -> f64 {
    0.1
}
fn default_output_scale() -> f64 {
    0.001 // micrometers to millimeters
}
fn default_stroke_color() -> String {
    "black".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub protocol: ProtocolSettings,
    #[serde(default)]
    pub render: RenderSettings,
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

    /// Use an explicit settings file; missing or invalid files yield defaults
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
        path.push("SlateNotes");
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
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}
