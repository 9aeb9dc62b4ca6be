//! Stimulation unit waveform parameters and their hardware constraints.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, ViperError};

/// One waveform parameter of a stimulation unit.
///
/// [`StimParam::ALL`] lists the parameters in the order they are validated, so the first
/// offending parameter of a record is the one reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StimParam {
    Polarity,
    Pulses,
    Amplitude1,
    Amplitude2,
    Duration,
    Prephase,
    Width1,
    Interphase,
    Width2,
    Discharge,
    Aftertrain,
}

impl StimParam {
    /// All parameters in validation order.
    pub const ALL: [StimParam; 11] = [
        StimParam::Polarity,
        StimParam::Pulses,
        StimParam::Amplitude1,
        StimParam::Amplitude2,
        StimParam::Duration,
        StimParam::Prephase,
        StimParam::Width1,
        StimParam::Interphase,
        StimParam::Width2,
        StimParam::Discharge,
        StimParam::Aftertrain,
    ];

    /// Attribute name used in settings documents and journals.
    pub fn name(self) -> &'static str {
        match self {
            StimParam::Polarity => "polarity",
            StimParam::Pulses => "pulses",
            StimParam::Amplitude1 => "amplitude1",
            StimParam::Amplitude2 => "amplitude2",
            StimParam::Duration => "duration",
            StimParam::Prephase => "prephase",
            StimParam::Width1 => "width1",
            StimParam::Interphase => "interphase",
            StimParam::Width2 => "width2",
            StimParam::Discharge => "discharge",
            StimParam::Aftertrain => "aftertrain",
        }
    }

    /// Label shown to the operator.
    pub fn screen_name(self) -> &'static str {
        match self {
            StimParam::Polarity => "Polarity",
            StimParam::Pulses => "Number of pulses",
            StimParam::Amplitude1 => "Pulse amplitude anode",
            StimParam::Amplitude2 => "Pulse amplitude cathode",
            StimParam::Duration => "Pulse duration",
            StimParam::Prephase => "Prephase",
            StimParam::Width1 => "1st pulse phase width",
            StimParam::Interphase => "Pulse interphase interval",
            StimParam::Width2 => "2nd pulse phase width",
            StimParam::Discharge => "Interpulse interval (discharge)",
            StimParam::Aftertrain => "Train interval (discharge)",
        }
    }

    /// `(step, min, max)` accepted by the hardware.
    pub fn limits(self) -> (i64, i64, i64) {
        match self {
            StimParam::Polarity => (1, 0, 1),
            StimParam::Pulses | StimParam::Amplitude1 | StimParam::Amplitude2 => (1, 0, 255),
            StimParam::Duration => (100, 100, 25500),
            StimParam::Prephase | StimParam::Discharge | StimParam::Aftertrain => (100, 0, 25500),
            StimParam::Width1 | StimParam::Width2 => (10, 0, 2550),
            StimParam::Interphase => (10, 10, 2550),
        }
    }

    /// Look a parameter up by its attribute name.
    pub fn from_name(name: &str) -> Option<StimParam> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }

    /// Check `value` against this parameter's range and step.
    pub fn verify(self, value: i64) -> AppResult<()> {
        let (step, min, max) = self.limits();
        if value < min || value > max || (value - min) % step != 0 {
            return Err(ViperError::ParameterOutOfRange {
                screen_name: self.screen_name().to_string(),
                min,
                max,
                step,
                value,
            });
        }
        Ok(())
    }
}

impl fmt::Display for StimParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Waveform configuration of one stimulation unit.
///
/// Times are in microseconds, amplitudes in device units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StimUnitSettings {
    pub polarity: i64,
    pub pulses: i64,
    pub prephase: i64,
    pub amplitude1: i64,
    pub width1: i64,
    pub interphase: i64,
    pub amplitude2: i64,
    pub width2: i64,
    pub discharge: i64,
    pub duration: i64,
    pub aftertrain: i64,
}

impl Default for StimUnitSettings {
    fn default() -> Self {
        Self {
            polarity: 0,
            pulses: 20,
            prephase: 0,
            amplitude1: 1,
            width1: 170,
            interphase: 60,
            amplitude2: 1,
            width2: 170,
            discharge: 200,
            duration: 600,
            aftertrain: 0,
        }
    }
}

impl StimUnitSettings {
    pub fn get(&self, param: StimParam) -> i64 {
        match param {
            StimParam::Polarity => self.polarity,
            StimParam::Pulses => self.pulses,
            StimParam::Amplitude1 => self.amplitude1,
            StimParam::Amplitude2 => self.amplitude2,
            StimParam::Duration => self.duration,
            StimParam::Prephase => self.prephase,
            StimParam::Width1 => self.width1,
            StimParam::Interphase => self.interphase,
            StimParam::Width2 => self.width2,
            StimParam::Discharge => self.discharge,
            StimParam::Aftertrain => self.aftertrain,
        }
    }

    pub fn set(&mut self, param: StimParam, value: i64) {
        let slot = match param {
            StimParam::Polarity => &mut self.polarity,
            StimParam::Pulses => &mut self.pulses,
            StimParam::Amplitude1 => &mut self.amplitude1,
            StimParam::Amplitude2 => &mut self.amplitude2,
            StimParam::Duration => &mut self.duration,
            StimParam::Prephase => &mut self.prephase,
            StimParam::Width1 => &mut self.width1,
            StimParam::Interphase => &mut self.interphase,
            StimParam::Width2 => &mut self.width2,
            StimParam::Discharge => &mut self.discharge,
            StimParam::Aftertrain => &mut self.aftertrain,
        };
        *slot = value;
    }

    /// Build settings from `(param, value)` pairs, verifying each in validation order.
    pub fn from_values(values: &[(StimParam, i64)]) -> AppResult<Self> {
        let mut settings = Self::default();
        for param in StimParam::ALL {
            if let Some((_, value)) = values.iter().find(|(p, _)| *p == param) {
                param.verify(*value)?;
                settings.set(param, *value);
            }
        }
        Ok(settings)
    }
}

/// Pack stimulation unit ids into the trigger bitmask: unit `i` sets bit `7 - i`.
pub fn stim_units_to_bitmask(units: &[usize]) -> u8 {
    units
        .iter()
        .filter(|unit| **unit < 8)
        .fold(0u8, |mask, unit| mask | (0x80u8 >> *unit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_satisfy_constraints() {
        let defaults = StimUnitSettings::default();
        for param in StimParam::ALL {
            param.verify(defaults.get(param)).unwrap();
        }
    }

    #[test]
    fn step_is_relative_to_minimum() {
        assert!(StimParam::Interphase.verify(10).is_ok());
        assert!(StimParam::Interphase.verify(20).is_ok());
        assert!(StimParam::Interphase.verify(0).is_err());
        assert!(StimParam::Duration.verify(100).is_ok());
        assert!(StimParam::Duration.verify(150).is_err());
        assert!(StimParam::Width1.verify(2560).is_err());
    }

    #[test]
    fn first_violation_in_table_order_is_reported() {
        let result = StimUnitSettings::from_values(&[
            (StimParam::Width2, 5),
            (StimParam::Amplitude1, 300),
        ]);
        match result {
            Err(ViperError::ParameterOutOfRange { screen_name, .. }) => {
                assert_eq!(screen_name, "Pulse amplitude anode")
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn names_round_trip() {
        for param in StimParam::ALL {
            assert_eq!(StimParam::from_name(param.name()), Some(param));
        }
        assert_eq!(StimParam::from_name("voltage"), None);
    }

    #[test]
    fn bitmask_maps_unit_zero_to_msb() {
        assert_eq!(stim_units_to_bitmask(&[0, 2]), 160);
        assert_eq!(stim_units_to_bitmask(&[7]), 1);
        assert_eq!(stim_units_to_bitmask(&(0..8).collect::<Vec<_>>()), 0xff);
        assert_eq!(stim_units_to_bitmask(&[]), 0);
    }
}
