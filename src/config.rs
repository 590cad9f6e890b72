//! Configuration management for platelens
//!
//! Stores settings in ~/.config/platelens/config.json. The vision API key
//! never lives in the file: it comes from the OPENROUTER_API_KEY
//! environment variable.

use crate::engine::EngineSettings;
use crate::synthesis::SynthesisSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Multimodal model id used for all vision stages
    #[serde(default = "default_vision_model")]
    pub vision_model: String,
    /// Base URL of the external product database
    #[serde(default = "default_product_db_url")]
    pub product_db_url: String,
    /// Records below this confidence need user confirmation
    #[serde(default = "default_low_confidence_threshold")]
    pub low_confidence_threshold: f64,
    /// Candidate confidence gaps below this trigger clarification
    #[serde(default = "default_ambiguity_gap")]
    pub ambiguity_gap: f64,
    /// Clarification turn budget
    #[serde(default = "default_max_clarification_turns")]
    pub max_clarification_turns: usize,
    /// Overall per-session deadline in seconds
    #[serde(default = "default_session_deadline_secs")]
    pub session_deadline_secs: u64,
    /// TTL for cached vision-stage results, in hours
    #[serde(default = "default_vision_cache_ttl_hours")]
    pub vision_cache_ttl_hours: u64,
    /// TTL for the local barcode cache, in days
    #[serde(default = "default_barcode_cache_ttl_days")]
    pub barcode_cache_ttl_days: i64,
    /// Maximum dish candidates requested from identification
    #[serde(default = "default_max_dish_candidates")]
    pub max_dish_candidates: usize,
}

fn default_vision_model() -> String {
    "openai/gpt-4o".to_string()
}

fn default_product_db_url() -> String {
    "https://world.openfoodfacts.org".to_string()
}

fn default_low_confidence_threshold() -> f64 {
    0.75
}

fn default_ambiguity_gap() -> f64 {
    0.15
}

fn default_max_clarification_turns() -> usize {
    4
}

fn default_session_deadline_secs() -> u64 {
    10
}

fn default_vision_cache_ttl_hours() -> u64 {
    24
}

fn default_barcode_cache_ttl_days() -> i64 {
    30
}

fn default_max_dish_candidates() -> usize {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vision_model: default_vision_model(),
            product_db_url: default_product_db_url(),
            low_confidence_threshold: default_low_confidence_threshold(),
            ambiguity_gap: default_ambiguity_gap(),
            max_clarification_turns: default_max_clarification_turns(),
            session_deadline_secs: default_session_deadline_secs(),
            vision_cache_ttl_hours: default_vision_cache_ttl_hours(),
            barcode_cache_ttl_days: default_barcode_cache_ttl_days(),
            max_dish_candidates: default_max_dish_candidates(),
        }
    }
}

impl Config {
    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("platelens"))
    }

    /// Get the config file path
    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load config from disk, or return defaults
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            if let Ok(content) = fs::read_to_string(&path) {
                match serde_json::from_str(&content) {
                    Ok(config) => return config,
                    Err(err) => {
                        preserve_corrupt_config(&path, &content);
                        eprintln!(
                            "  Warning: Config file was corrupted ({}). A backup was saved and defaults were loaded.",
                            err
                        );
                    }
                }
            }
        }
        Self::default()
    }

    /// Save config to disk
    pub fn save(&self) -> anyhow::Result<()> {
        let dir = Self::config_dir()
            .ok_or_else(|| anyhow::anyhow!("could not determine config directory"))?;
        fs::create_dir_all(&dir)?;

        let path = dir.join("config.json");
        let content = serde_json::to_string_pretty(self)?;
        write_config_atomic(&path, &content)
    }

    /// Get the vision API key from the environment
    pub fn api_key() -> Option<String> {
        std::env::var("OPENROUTER_API_KEY").ok().filter(|k| !k.is_empty())
    }

    /// Directory for the barcode cache and the JSONL record log
    pub fn cache_dir() -> PathBuf {
        dirs::cache_dir()
            .map(|p| p.join("platelens"))
            .unwrap_or_else(|| PathBuf::from(".platelens"))
    }

    /// Engine settings derived from the configured thresholds
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            max_candidates: self.max_dish_candidates.max(1),
            session_deadline: Duration::from_secs(self.session_deadline_secs.max(1)),
            vision_ttl: Duration::from_secs(self.vision_cache_ttl_hours.max(1) * 60 * 60),
            max_clarification_turns: self.max_clarification_turns.max(1),
            synthesis: SynthesisSettings {
                low_confidence_threshold: self.low_confidence_threshold.clamp(0.0, 1.0),
                ambiguity_gap: self.ambiguity_gap.clamp(0.0, 1.0),
            },
        }
    }

    /// Get the config file location for display
    pub fn config_location() -> String {
        Self::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.config/platelens/config.json".to_string())
    }
}

fn preserve_corrupt_config(path: &std::path::Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

fn write_config_atomic(path: &std::path::Path, content: &str) -> anyhow::Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600));
    }

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_thresholds() {
        let config = Config::default();
        assert_eq!(config.low_confidence_threshold, 0.75);
        assert_eq!(config.ambiguity_gap, 0.15);
        assert_eq!(config.max_clarification_turns, 4);
        assert_eq!(config.session_deadline_secs, 10);
        assert_eq!(config.barcode_cache_ttl_days, 30);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: Config = serde_json::from_str(r#"{"ambiguity_gap": 0.2}"#).unwrap();
        assert_eq!(config.ambiguity_gap, 0.2);
        assert_eq!(config.low_confidence_threshold, 0.75);
        assert_eq!(config.vision_model, "openai/gpt-4o");
    }

    #[test]
    fn test_engine_settings_derivation() {
        let config = Config {
            session_deadline_secs: 7,
            low_confidence_threshold: 1.4,
            ..Config::default()
        };
        let settings = config.engine_settings();
        assert_eq!(settings.session_deadline, Duration::from_secs(7));
        // Out-of-range thresholds are clamped into the unit interval
        assert_eq!(settings.synthesis.low_confidence_threshold, 1.0);
    }

    #[test]
    fn test_config_round_trip() {
        let config = Config {
            ambiguity_gap: 0.1,
            ..Config::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let loaded: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.ambiguity_gap, 0.1);
    }
}
