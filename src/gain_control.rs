//! Gain normalisation of the modulated symbol stream.
//!
//! The OFDM modulator produces frames whose power depends on the multiplex
//! content. Before predistortion and transmission the stream is normalised
//! to a target level, using one of three modes:
//!
//! - **Fix** multiplies by the configured digital gain alone. Transparent,
//!   but offers no protection against clipping; not meant for on-air use.
//! - **Max** scales the frame so its peak magnitude maps to the full-scale
//!   target. No overshoot, but the average power varies per frame.
//! - **Var** scales by the sample standard deviation, accepting a handful
//!   of samples per hundred thousand outside the ±1 range in exchange for
//!   maximum average power. This is the mode the DAB standard describes.

use std::str::FromStr;
use std::sync::Mutex;

use crate::remote::{ParameterError, ParameterInfo, RemoteControllable};
use crate::types::IQSample;

/// Full-scale target used by the peak-normalising mode.
const MAX_MODE_FULL_SCALE: f32 = 32768.0;

/// Gain computation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GainMode {
    Fix,
    Max,
    Var,
}

impl FromStr for GainMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fix" => Ok(GainMode::Fix),
            "max" => Ok(GainMode::Max),
            "var" => Ok(GainMode::Var),
            other => Err(format!("unknown gain mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct GainSettings {
    mode: GainMode,
    digital_gain: f32,
    /// Multiplier on the standard deviation in Var mode, default 4.
    deviation_factor: f32,
}

/// Per-frame gain normalisation stage.
///
/// The settings are adjustable at runtime through the remote-control
/// surface; processing itself is serialised by the caller.
#[derive(Debug)]
pub struct GainControl {
    settings: Mutex<GainSettings>,
}

const PARAMETERS: &[ParameterInfo] = &[
    ParameterInfo {
        name: "digitalgain",
        description: "Digital gain applied after normalisation",
    },
    ParameterInfo {
        name: "mode",
        description: "Gain mode: fix, max or var",
    },
    ParameterInfo {
        name: "varfactor",
        description: "Standard-deviation multiplier used by the var mode",
    },
];

impl GainControl {
    pub fn new(mode: GainMode, digital_gain: f32) -> Self {
        Self {
            settings: Mutex::new(GainSettings {
                mode,
                digital_gain,
                deviation_factor: 4.0,
            }),
        }
    }

    /// Normalise one frame. The output has exactly the input length.
    pub fn process(&self, input: &[IQSample]) -> Vec<IQSample> {
        let settings = *self.settings.lock().unwrap();
        let gain = match settings.mode {
            GainMode::Fix => settings.digital_gain,
            GainMode::Max => compute_gain_max(settings.digital_gain, input),
            GainMode::Var => {
                compute_gain_var(settings.digital_gain, settings.deviation_factor, input)
            }
        };
        input.iter().map(|&x| x * gain).collect()
    }

    pub fn set_digital_gain(&self, gain: f32) {
        self.settings.lock().unwrap().digital_gain = gain;
    }

    pub fn set_mode(&self, mode: GainMode) {
        self.settings.lock().unwrap().mode = mode;
    }

    pub fn set_deviation_factor(&self, factor: f32) {
        self.settings.lock().unwrap().deviation_factor = factor;
    }
}

fn compute_gain_max(digital_gain: f32, frame: &[IQSample]) -> f32 {
    let peak = frame.iter().map(|s| s.norm()).fold(0.0_f32, f32::max);
    if peak > 0.0 {
        digital_gain * MAX_MODE_FULL_SCALE / peak
    } else {
        0.0
    }
}

fn compute_gain_var(digital_gain: f32, deviation_factor: f32, frame: &[IQSample]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let n = frame.len() as f32;
    let mean = frame.iter().sum::<IQSample>() / n;
    let variance = frame.iter().map(|s| (s - mean).norm_sqr()).sum::<f32>() / n;
    let sigma = variance.sqrt();
    if sigma > 0.0 {
        digital_gain / (deviation_factor * sigma)
    } else {
        0.0
    }
}

impl RemoteControllable for GainControl {
    fn rc_name(&self) -> &'static str {
        "gain"
    }

    fn parameters(&self) -> &'static [ParameterInfo] {
        PARAMETERS
    }

    fn set_parameter(&self, parameter: &str, value: &str) -> Result<(), ParameterError> {
        match parameter {
            "digitalgain" => {
                let gain: f32 = value
                    .trim()
                    .parse()
                    .map_err(|e| ParameterError::invalid(parameter, e))?;
                self.set_digital_gain(gain);
                Ok(())
            }
            "mode" => {
                let mode = GainMode::from_str(value)
                    .map_err(|e| ParameterError::invalid(parameter, e))?;
                self.set_mode(mode);
                Ok(())
            }
            "varfactor" => {
                let factor: f32 = value
                    .trim()
                    .parse()
                    .map_err(|e| ParameterError::invalid(parameter, e))?;
                self.set_deviation_factor(factor);
                Ok(())
            }
            other => Err(ParameterError::Unknown(other.to_string())),
        }
    }

    fn get_parameter(&self, parameter: &str) -> Result<String, ParameterError> {
        let settings = *self.settings.lock().unwrap();
        match parameter {
            "digitalgain" => Ok(settings.digital_gain.to_string()),
            "mode" => Ok(match settings.mode {
                GainMode::Fix => "fix",
                GainMode::Max => "max",
                GainMode::Var => "var",
            }
            .to_string()),
            "varfactor" => Ok(settings.deviation_factor.to_string()),
            other => Err(ParameterError::Unknown(other.to_string())),
        }
    }
}
