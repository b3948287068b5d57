//! Engine configuration, supplied by the content script at startup.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TuneError};

pub const DEFAULT_WORKLET_PATH: &str = "soundtouch-worklet.js";
pub const DEFAULT_PROCESSOR_NAME: &str = "soundtouch-processor";
pub const DEFAULT_PITCH_PARAM: &str = "pitch";
pub const DEFAULT_MEDIA_SELECTOR: &str = "video, audio";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Path of the pitch-shift worklet module, resolved by the host.
    pub worklet_path: String,
    /// Name the worklet registers its processor under.
    pub processor_name: String,
    /// Runtime parameter carrying the pitch factor.
    pub pitch_param: String,
    /// CSS selector for media elements that qualify for tuning.
    pub media_selector: String,
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            worklet_path: DEFAULT_WORKLET_PATH.to_string(),
            processor_name: DEFAULT_PROCESSOR_NAME.to_string(),
            pitch_param: DEFAULT_PITCH_PARAM.to_string(),
            media_selector: DEFAULT_MEDIA_SELECTOR.to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_json::from_str(json).map_err(|e| TuneError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let required = [
            ("workletPath", &self.worklet_path),
            ("processorName", &self.processor_name),
            ("pitchParam", &self.pitch_param),
            ("mediaSelector", &self.media_selector),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(TuneError::InvalidConfig(format!("{name} must not be empty")));
            }
        }
        if !LOG_LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            return Err(TuneError::InvalidConfig(format!(
                "unknown log level '{}'",
                self.log_level
            )));
        }
        Ok(())
    }
}
