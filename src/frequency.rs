//! Reference-frequency math — maps a target tuning preset and mode to
//! the pitch factor and playback-rate factor applied to media.
//!
//! Every preset is expressed relative to the physical reference it
//! approximates. Most presets retune A4 and are measured against the
//! 440 Hz concert pitch; 528 Hz is marketed as a frequency but is really
//! a sharpened C5, so it is measured against C5 at A4 = 440.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TuneError;

/// A4 in standard concert pitch.
pub const A4_STANDARD_FREQUENCY: f64 = 440.0;

/// C5 in 12-TET at A4 = 440 (rounded the way tuning charts print it).
pub const C5_STANDARD_FREQUENCY: f64 = 523.25;

/// Supported target frequency presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Frequency {
    Hz300,
    Hz432,
    #[default]
    Hz440,
    Hz528,
    Hz680,
}

impl Frequency {
    pub const ALL: [Frequency; 5] = [
        Frequency::Hz300,
        Frequency::Hz432,
        Frequency::Hz440,
        Frequency::Hz528,
        Frequency::Hz680,
    ];

    pub fn hz(self) -> u32 {
        match self {
            Frequency::Hz300 => 300,
            Frequency::Hz432 => 432,
            Frequency::Hz440 => 440,
            Frequency::Hz528 => 528,
            Frequency::Hz680 => 680,
        }
    }

    /// Is this the neutral preset that leaves media untouched?
    pub fn is_standard(self) -> bool {
        self == Frequency::Hz440
    }
}

impl TryFrom<u32> for Frequency {
    type Error = TuneError;

    fn try_from(hz: u32) -> Result<Self, Self::Error> {
        Frequency::ALL
            .into_iter()
            .find(|f| f.hz() == hz)
            .ok_or(TuneError::InvalidFrequency(hz))
    }
}

impl From<Frequency> for u32 {
    fn from(f: Frequency) -> u32 {
        f.hz()
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Hz", self.hz())
    }
}

/// How a retune is realised on a media element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Change playback speed; pitch follows.
    Rate,
    /// Shift pitch through the audio graph; speed stays natural.
    #[default]
    Pitch,
}

impl FromStr for Mode {
    type Err = TuneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rate" => Ok(Mode::Rate),
            "pitch" => Ok(Mode::Pitch),
            other => Err(TuneError::InvalidMode(other.to_string())),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Rate => f.write_str("rate"),
            Mode::Pitch => f.write_str("pitch"),
        }
    }
}

/// Factors derived from a tuning state. Exactly one of the two differs
/// from 1 unless the target is the standard reference.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedFactors {
    pub current_pitch: f64,
    pub current_playback_rate: f64,
}

impl DerivedFactors {
    pub const NEUTRAL: DerivedFactors = DerivedFactors {
        current_pitch: 1.0,
        current_playback_rate: 1.0,
    };

    /// The active shift expressed in cents (positive = sharper).
    pub fn cents(&self) -> f64 {
        ratio_to_cents(self.current_pitch * self.current_playback_rate)
    }
}

/// The physical reference a preset approximates.
///
/// Presets without a dedicated acoustic reference use concert A4.
pub fn reference_frequency(target: Frequency) -> f64 {
    match target {
        Frequency::Hz528 => C5_STANDARD_FREQUENCY,
        _ => A4_STANDARD_FREQUENCY,
    }
}

/// Retune ratio for a preset, e.g. 432 → 0.9818…
pub fn tuning_factor(target: Frequency) -> f64 {
    if target.is_standard() {
        return 1.0;
    }
    target.hz() as f64 / reference_frequency(target)
}

/// Split the retune ratio between pitch and playback rate for `mode`.
pub fn compute_factors(target: Frequency, mode: Mode) -> DerivedFactors {
    let factor = tuning_factor(target);
    match mode {
        Mode::Rate => DerivedFactors {
            current_pitch: 1.0,
            current_playback_rate: factor,
        },
        Mode::Pitch => DerivedFactors {
            current_pitch: factor,
            current_playback_rate: 1.0,
        },
    }
}

/// Convert a frequency ratio to cents.
pub fn ratio_to_cents(ratio: f64) -> f64 {
    if ratio <= 0.0 {
        return 0.0;
    }
    1200.0 * ratio.log2()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_for_presets() {
        assert_eq!(reference_frequency(Frequency::Hz440), 440.0);
        assert_eq!(reference_frequency(Frequency::Hz432), 440.0);
        assert!((reference_frequency(Frequency::Hz528) - 523.25).abs() < 1e-9);
        assert_eq!(reference_frequency(Frequency::Hz300), 440.0);
        assert_eq!(reference_frequency(Frequency::Hz680), 440.0);
    }

    #[test]
    fn exactly_one_factor_moves() {
        for target in Frequency::ALL {
            for mode in [Mode::Pitch, Mode::Rate] {
                let f = compute_factors(target, mode);
                if target.is_standard() {
                    assert_eq!(f, DerivedFactors::NEUTRAL, "{target} {mode}");
                    continue;
                }
                let (moved, fixed) = match mode {
                    Mode::Pitch => (f.current_pitch, f.current_playback_rate),
                    Mode::Rate => (f.current_playback_rate, f.current_pitch),
                };
                assert_eq!(fixed, 1.0, "{target} {mode}");
                assert_ne!(moved, 1.0, "{target} {mode}");
            }
        }
    }

    #[test]
    fn pitch_432() {
        let f = compute_factors(Frequency::Hz432, Mode::Pitch);
        assert!((f.current_pitch - 0.981_818).abs() < 1e-6, "got {}", f.current_pitch);
        assert_eq!(f.current_playback_rate, 1.0);
    }

    #[test]
    fn rate_432() {
        let f = compute_factors(Frequency::Hz432, Mode::Rate);
        assert!((f.current_playback_rate - 432.0 / 440.0).abs() < 1e-12);
        assert_eq!(f.current_pitch, 1.0);
    }

    #[test]
    fn pitch_528_against_c5() {
        let f = compute_factors(Frequency::Hz528, Mode::Pitch);
        assert!((f.current_pitch - 1.009_078).abs() < 1e-5, "got {}", f.current_pitch);
    }

    #[test]
    fn cents_432() {
        // 432 Hz is about 31.8 cents flat of A4
        let f = compute_factors(Frequency::Hz432, Mode::Pitch);
        assert!((f.cents() - (-31.77)).abs() < 0.1, "got {}", f.cents());
        assert_eq!(DerivedFactors::NEUTRAL.cents(), 0.0);
    }

    #[test]
    fn frequency_from_hz() {
        assert_eq!(Frequency::try_from(528).unwrap(), Frequency::Hz528);
        assert_eq!(
            Frequency::try_from(441).unwrap_err(),
            TuneError::InvalidFrequency(441)
        );
    }

    #[test]
    fn frequency_serializes_as_number() {
        let json = serde_json::to_string(&Frequency::Hz432).unwrap();
        assert_eq!(json, "432");
        let back: Frequency = serde_json::from_str("680").unwrap();
        assert_eq!(back, Frequency::Hz680);
        assert!(serde_json::from_str::<Frequency>("123").is_err());
    }

    #[test]
    fn mode_parse() {
        assert_eq!("rate".parse::<Mode>().unwrap(), Mode::Rate);
        assert_eq!("pitch".parse::<Mode>().unwrap(), Mode::Pitch);
        assert!("speed".parse::<Mode>().is_err());
        assert_eq!(Mode::default(), Mode::Pitch);
    }

    #[test]
    fn default_frequency_is_neutral() {
        assert_eq!(Frequency::default(), Frequency::Hz440);
        assert!(Frequency::default().is_standard());
    }
}
