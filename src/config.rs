use serde::Deserialize;
use std::fs;
use tracing::warn;

/// User configuration, read from `~/.config/speech-dispatch/config.toml`.
/// Everything is optional; command-line flags win over the file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpeechConfig {
    /// Driver to use: "auto", "espeak" or "dummy".
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub defaults: VoiceDefaults,
}

/// Default voice properties applied before every command.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VoiceDefaults {
    #[serde(default)]
    pub voice: Option<String>,
    /// Speaking rate in words per minute.
    #[serde(default)]
    pub rate: Option<f64>,
    /// Volume, 0.0 to 1.0.
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub pitch: Option<f64>,
}

pub fn load_config() -> SpeechConfig {
    let Some(config_dir) = dirs::config_dir() else {
        warn!("no config directory available, using defaults");
        return SpeechConfig::default();
    };
    let path = config_dir.join("speech-dispatch/config.toml");

    let raw = match fs::read_to_string(&path) {
        Ok(s) => s,
        // a missing config file is the normal case
        Err(_) => return SpeechConfig::default(),
    };

    match toml::from_str::<SpeechConfig>(&raw) {
        Ok(config) => {
            tracing::info!("Loaded config from {}", path.display());
            config
        }
        Err(e) => {
            warn!("Failed to parse {}: {}, using defaults", path.display(), e);
            SpeechConfig::default()
        }
    }
}
