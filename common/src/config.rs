use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_url")]
    pub url: String,
    /// `mjpeg`, `polling` or `test-pattern`.
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_quality")]
    pub quality: u32,
    #[serde(default = "default_fps")]
    pub fps: f64,
    /// Preferred camera orientation, forwarded to the camera endpoint.
    #[serde(default = "default_facing")]
    pub facing: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_first_frame_timeout")]
    pub first_frame_timeout_secs: u64,
    #[serde(default = "default_pattern_width")]
    pub pattern_width: u32,
    #[serde(default = "default_pattern_height")]
    pub pattern_height: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DisplayConfig {
    #[serde(default = "default_refresh_hz")]
    pub refresh_hz: f64,
    /// Output surfaces; every one receives the same transformed frame.
    #[serde(default = "default_surfaces")]
    pub surfaces: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterConfig {
    #[serde(default = "default_filter_initial")]
    pub initial: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_autostart")]
    pub autostart: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            mode: default_mode(),
            quality: default_quality(),
            fps: default_fps(),
            facing: default_facing(),
            connect_timeout_secs: default_connect_timeout(),
            first_frame_timeout_secs: default_first_frame_timeout(),
            pattern_width: default_pattern_width(),
            pattern_height: default_pattern_height(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            refresh_hz: default_refresh_hz(),
            surfaces: default_surfaces(),
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            initial: default_filter_initial(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            jpeg_quality: default_jpeg_quality(),
            autostart: default_autostart(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        let config = Self::parse(&content)?;
        debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        check_rate("display.refresh_hz", self.display.refresh_hz)?;
        check_rate("stream.fps", self.stream.fps)?;
        if !(1..=100).contains(&self.control.jpeg_quality) {
            return Err(ConfigError::Invalid(format!(
                "control.jpeg_quality must be within 1..=100, got {}",
                self.control.jpeg_quality
            )));
        }
        if self.display.surfaces.is_empty() {
            return Err(ConfigError::Invalid(
                "display.surfaces must name at least one surface".into(),
            ));
        }
        let mut seen = HashSet::new();
        for name in &self.display.surfaces {
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate surface name '{name}'"
                )));
            }
        }
        Ok(())
    }
}

/// Fastest accepted `refresh_hz` / `fps`.
pub const MAX_RATE_HZ: f64 = 1000.0;
/// Slowest accepted `refresh_hz` / `fps`: one frame a minute.
pub const MIN_RATE_HZ: f64 = 1.0 / 60.0;

/// Period of one tick at `hz`, or `None` when `hz` is outside
/// `MIN_RATE_HZ..=MAX_RATE_HZ` (including NaN and infinity).
pub fn rate_period(hz: f64) -> Option<Duration> {
    if !(hz.is_finite() && (MIN_RATE_HZ..=MAX_RATE_HZ).contains(&hz)) {
        return None;
    }
    Duration::try_from_secs_f64(1.0 / hz)
        .ok()
        .filter(|period| !period.is_zero())
}

fn check_rate(key: &str, hz: f64) -> Result<(), ConfigError> {
    match rate_period(hz) {
        Some(_) => Ok(()),
        None => Err(ConfigError::Invalid(format!(
            "{key} must be between {MIN_RATE_HZ:.4} and {MAX_RATE_HZ}, got {hz}"
        ))),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_url() -> String {
    "http://127.0.0.1:8080/stream".into()
}
fn default_mode() -> String {
    "mjpeg".into()
}
fn default_quality() -> u32 {
    80
}
fn default_fps() -> f64 {
    30.0
}
fn default_facing() -> String {
    "environment".into()
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_first_frame_timeout() -> u64 {
    10
}
fn default_pattern_width() -> u32 {
    640
}
fn default_pattern_height() -> u32 {
    480
}
fn default_refresh_hz() -> f64 {
    60.0
}
fn default_surfaces() -> Vec<String> {
    vec!["filtered".into(), "mirror".into()]
}
fn default_filter_initial() -> String {
    "normal".into()
}
fn default_bind() -> String {
    "127.0.0.1:8090".into()
}
fn default_jpeg_quality() -> u8 {
    85
}
fn default_autostart() -> bool {
    true
}
fn default_log_level() -> String {
    "info".into()
}
