pub mod config;
pub mod error;
pub mod frequency;
pub mod graph;
pub mod host;
pub mod service;
pub mod state;
pub mod tracker;
pub mod tuner;
#[cfg(feature = "web")]
pub mod web;

#[cfg(test)]
mod testing;

use crate::frequency::{Frequency, Mode};
use wasm_bindgen::prelude::*;

pub use crate::config::EngineConfig;
pub use crate::error::{Result, TuneError};
pub use crate::service::{EngineStatus, Retuner};
pub use crate::state::TuningState;

/// The crate version, read from Cargo.toml at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// WASM-exposed: return the retune-core version string.
#[wasm_bindgen(js_name = coreVersion)]
pub fn core_version() -> String {
    VERSION.to_string()
}

/// WASM-exposed: the physical reference a preset is measured against.
#[wasm_bindgen(js_name = referenceFrequency)]
pub fn reference_frequency(hz: u32) -> std::result::Result<f64, JsValue> {
    let target = Frequency::try_from(hz).map_err(|e| JsValue::from_str(&format!("{e}")))?;
    Ok(frequency::reference_frequency(target))
}

/// WASM-exposed: `{ currentPitch, currentPlaybackRate }` for a preset and mode.
#[wasm_bindgen(js_name = computeFactors)]
pub fn compute_factors(hz: u32, mode: &str) -> std::result::Result<JsValue, JsValue> {
    let target = Frequency::try_from(hz).map_err(|e| JsValue::from_str(&format!("{e}")))?;
    let mode: Mode = mode.parse().map_err(|e| JsValue::from_str(&format!("{e}")))?;
    let factors = frequency::compute_factors(target, mode);
    serde_wasm_bindgen::to_value(&factors).map_err(|e| JsValue::from_str(&format!("{e}")))
}
