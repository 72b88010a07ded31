//! Encoder configuration loaded from TOML.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::{BackendKind, Profile, MIN_BITRATE_BPS};
use crate::frame::ContentType;
use crate::pipeline::{EncoderSettings, PipelineOptions};
use crate::rate::{DEFAULT_HIGH_FACTOR, DEFAULT_LOW_FACTOR};

/// Default config directory under `$XDG_CONFIG_HOME`.
const CONFIG_DIR: &str = "hwenc";
/// Default config file name.
const CONFIG_FILE: &str = "config.toml";

/// Smallest accepted side of a custom resolution.
const MIN_SIDE: u32 = 16;

/// Resolve the default config file path.
///
/// Returns `$XDG_CONFIG_HOME/hwenc/config.toml` or
/// `~/.config/hwenc/config.toml`.
#[must_use]
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join(CONFIG_DIR)
        .join(CONFIG_FILE)
}

/// Load the encoder configuration from a TOML file.
///
/// If `path` is `None`, reads from the default location.
/// Returns the default configuration if the file does not exist.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load(path: Option<&Path>) -> Result<EncoderConfig> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => config_path(),
    };

    if !path.exists() {
        tracing::debug!(?path, "Config file not found, using defaults");
        return Ok(EncoderConfig::default());
    }

    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;

    let config: EncoderConfig = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config: {}", path.display()))?;

    tracing::info!(?path, "Configuration loaded");
    Ok(config)
}

/// Target picture size, written as a preset name or `WIDTHxHEIGHT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const QVGA: Self = Self::new(320, 240);
    pub const VGA: Self = Self::new(640, 480);
    pub const HD: Self = Self::new(1280, 720);
    pub const FHD: Self = Self::new(1920, 1080);
    pub const UHD_4K: Self = Self::new(3840, 2160);

    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Self::VGA
    }
}

/// Error from parsing a [`Resolution`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid resolution {0:?}: expected QVGA, VGA, HD, FHD, 4K or WxH with sides of at least 16")]
pub struct ResolutionError(String);

impl FromStr for Resolution {
    type Err = ResolutionError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let preset = match s.trim().to_ascii_uppercase().as_str() {
            "QVGA" => Some(Self::QVGA),
            "VGA" => Some(Self::VGA),
            "HD" => Some(Self::HD),
            "FHD" => Some(Self::FHD),
            "4K" => Some(Self::UHD_4K),
            _ => None,
        };
        if let Some(preset) = preset {
            return Ok(preset);
        }
        let err = || ResolutionError(s.to_string());
        let (w, h) = s.trim().split_once(['x', 'X']).ok_or_else(err)?;
        let width: u32 = w.trim().parse().map_err(|_| err())?;
        let height: u32 = h.trim().parse().map_err(|_| err())?;
        if width < MIN_SIDE || height < MIN_SIDE {
            return Err(err());
        }
        Ok(Self { width, height })
    }
}

impl TryFrom<String> for Resolution {
    type Error = ResolutionError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Resolution> for String {
    fn from(r: Resolution) -> Self {
        r.to_string()
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Rate adjuster tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    /// Lower bound of the adjusted bitrate, as a fraction of target.
    pub low_factor: f64,
    /// Upper bound of the adjusted bitrate, as a fraction of target.
    pub high_factor: f64,
    /// Bitrate pushes below this are ignored.
    pub min_bitrate_bps: u32,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            low_factor: DEFAULT_LOW_FACTOR,
            high_factor: DEFAULT_HIGH_FACTOR,
            min_bitrate_bps: MIN_BITRATE_BPS,
        }
    }
}

/// Top-level encoder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Which encoder backend to drive.
    pub backend: BackendKind,
    /// Target resolution.
    pub resolution: Resolution,
    /// Target framerate (fps).
    pub framerate: u32,
    /// Target bitrate in bits per second.
    pub bitrate_bps: u32,
    /// Frames between IDRs.
    pub key_frame_interval: u32,
    /// Camera video or screen content.
    pub content_type: ContentType,
    /// Override the backend's default profile.
    pub profile: Option<Profile>,
    /// Feed device-native capture buffers instead of I420.
    pub use_native: bool,
    /// How long release waits for the device to flush (milliseconds).
    pub drain_timeout_ms: u64,
    /// Capacity of the completion channel between device and delivery.
    pub completion_queue_depth: usize,
    pub rate: RateConfig,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            resolution: Resolution::default(),
            framerate: 30,
            bitrate_bps: 1_000_000,
            key_frame_interval: 3000,
            content_type: ContentType::default(),
            profile: None,
            use_native: false,
            drain_timeout_ms: 2000,
            completion_queue_depth: 16,
            rate: RateConfig::default(),
        }
    }
}

impl EncoderConfig {
    /// Session settings for `Pipeline::configure`.
    #[must_use]
    pub fn settings(&self) -> EncoderSettings {
        EncoderSettings {
            width: self.resolution.width,
            height: self.resolution.height,
            bitrate_bps: self.bitrate_bps,
            framerate: self.framerate,
            key_frame_interval: self.key_frame_interval,
            content_type: self.content_type,
            profile: self.profile,
        }
    }

    /// Construction options for `Pipeline::new`.
    #[must_use]
    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
            completion_queue_depth: self.completion_queue_depth,
            low_factor: self.rate.low_factor,
            high_factor: self.rate.high_factor,
            min_bitrate_bps: self.rate.min_bitrate_bps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_presets_and_custom_sizes() {
        assert_eq!("VGA".parse(), Ok(Resolution::VGA));
        assert_eq!("fhd".parse(), Ok(Resolution::FHD));
        assert_eq!("4K".parse(), Ok(Resolution::UHD_4K));
        assert_eq!("800x600".parse(), Ok(Resolution::new(800, 600)));
        assert!("15x600".parse::<Resolution>().is_err());
        assert!("wide".parse::<Resolution>().is_err());
        assert!("800x".parse::<Resolution>().is_err());
    }

    #[test]
    fn default_config_values() {
        let config = EncoderConfig::default();
        assert_eq!(config.resolution, Resolution::VGA);
        assert_eq!(config.framerate, 30);
        assert_eq!(config.drain_timeout_ms, 2000);
        assert_eq!(config.backend, BackendKind::Loopback);
        assert!((config.rate.high_factor - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let config: EncoderConfig = toml::from_str(
            r#"
            backend = "videocore"
            resolution = "HD"
            content_type = "screenshare"

            [rate]
            low_factor = 0.6
            "#,
        )
        .unwrap();
        assert_eq!(config.backend, BackendKind::Videocore);
        assert_eq!(config.resolution, Resolution::HD);
        assert_eq!(config.content_type, ContentType::Screenshare);
        assert!((config.rate.low_factor - 0.6).abs() < f64::EPSILON);
        assert_eq!(config.rate.min_bitrate_bps, 300_000);
        assert_eq!(config.bitrate_bps, 1_000_000);
    }

    #[test]
    fn bad_resolution_is_a_parse_error() {
        assert!(toml::from_str::<EncoderConfig>("resolution = \"tiny\"").is_err());
    }

    #[test]
    fn config_roundtrip() {
        let mut config = EncoderConfig::default();
        config.resolution = Resolution::new(1024, 768);
        config.profile = Some(Profile::Main);
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: EncoderConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.resolution, Resolution::new(1024, 768));
        assert_eq!(parsed.profile, Some(Profile::Main));
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let config = load(Some(Path::new("/nonexistent/hwenc/config.toml"))).unwrap();
        assert_eq!(config.key_frame_interval, 3000);
    }

    #[test]
    fn settings_follow_config() {
        let config = EncoderConfig {
            resolution: Resolution::QVGA,
            bitrate_bps: 500_000,
            ..EncoderConfig::default()
        };
        let settings = config.settings();
        assert_eq!((settings.width, settings.height), (320, 240));
        assert_eq!(settings.bitrate_bps, 500_000);
        assert_eq!(
            config.pipeline_options().drain_timeout,
            Duration::from_millis(2000)
        );
    }
}
