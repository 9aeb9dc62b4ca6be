//! Recording channel configuration.

use serde::{Deserialize, Serialize};

use crate::range::REFERENCE_COUNT;

/// Highest selectable gain or input index.
pub const MAX_GAIN_OR_INPUT: u8 = 3;

/// Configuration of one recording channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSettings {
    /// Selected references; position 0 is the bulk reference `b`.
    pub references: [bool; REFERENCE_COUNT],
    /// Amplifier gain index, 0-3.
    pub gain: u8,
    /// Electrode input index, 0-3.
    pub input: u8,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        let mut references = [false; REFERENCE_COUNT];
        references[0] = true;
        Self {
            references,
            gain: 0,
            input: 0,
        }
    }
}

impl ChannelSettings {
    /// Reference selection as the integer bitmask the device expects.
    ///
    /// Bit `i` is set when reference `i` is selected, so the bulk reference is the least
    /// significant bit.
    pub fn reference_mask(&self) -> u16 {
        self.references
            .iter()
            .enumerate()
            .filter(|(_, selected)| **selected)
            .fold(0u16, |mask, (i, _)| mask | (1 << i))
    }
}
