//! Tuning state as replicated from the extension's persisted settings.

use std::cell::Cell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TuneError};
use crate::frequency::{DerivedFactors, Frequency, Mode, compute_factors};

/// Snapshot of the user's tuning choice. Replaced wholesale on every
/// change notification, never patched field by field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TuningState {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub mode: Mode,
    /// Stored as `frequency` by the extension's storage layer.
    #[serde(default, rename = "frequency", alias = "targetFrequency")]
    pub target_frequency: Frequency,
}

impl TuningState {
    pub fn new(enabled: bool, mode: Mode, target_frequency: Frequency) -> Self {
        TuningState {
            enabled,
            mode,
            target_frequency,
        }
    }

    /// Parse a persisted snapshot, e.g. `{"enabled":true,"mode":"pitch","frequency":432}`.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| TuneError::InvalidState(e.to_string()))
    }

    pub fn factors(&self) -> DerivedFactors {
        compute_factors(self.target_frequency, self.mode)
    }

    /// Whether applying this state changes anything audible.
    pub fn is_neutral(&self) -> bool {
        !self.enabled || self.target_frequency.is_standard()
    }
}

/// The live tuning state shared by every component of one engine.
///
/// Readers always take a fresh snapshot at the point of application so a
/// tuning attempt that was suspended mid-flight picks up the latest state.
#[derive(Debug, Clone, Default)]
pub struct SharedState(Rc<Cell<TuningState>>);

impl SharedState {
    pub fn new(initial: TuningState) -> Self {
        SharedState(Rc::new(Cell::new(initial)))
    }

    pub fn snapshot(&self) -> TuningState {
        self.0.get()
    }

    pub fn replace(&self, next: TuningState) -> TuningState {
        self.0.replace(next)
    }

    /// Factors recomputed from the current snapshot; never cached.
    pub fn factors(&self) -> DerivedFactors {
        self.snapshot().factors()
    }
}
