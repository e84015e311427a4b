//! Subsystem capability table.
//!
//! Every schedule subsystem shares the same engine. What differs is captured
//! here: data direction, channel counts, rate bounds, register block, and
//! whether acquired samples can carry timetags.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::rate::RateBounds;
use crate::registers::ScheduleBlock;

/// Closed set of schedule subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubsystemKind {
    /// Analog outputs
    Dac,
    /// Analog inputs
    Adc,
    /// Digital outputs
    Dout,
    /// Digital inputs
    Din,
    /// Audio output
    AudioOut,
    /// Auxiliary audio output
    AudioAux,
    /// Microphone input
    Mic,
}

/// Direction of data relative to device RAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Produces samples into RAM; the cursor is a write address
    Source,
    /// Consumes samples from RAM; the cursor is a read address
    Sink,
}

impl SubsystemKind {
    /// Every subsystem, in register block order.
    pub const ALL: [SubsystemKind; 7] = [
        Self::Dac,
        Self::Adc,
        Self::Dout,
        Self::Din,
        Self::AudioOut,
        Self::AudioAux,
        Self::Mic,
    ];

    /// Short name used in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            Self::Dac => "DAC",
            Self::Adc => "ADC",
            Self::Dout => "DOUT",
            Self::Din => "DIN",
            Self::AudioOut => "AUD",
            Self::AudioAux => "AUX",
            Self::Mic => "MIC",
        }
    }

    /// Capability descriptor.
    pub fn descriptor(self) -> Subsystem {
        let (direction, channels, buffered_channels, timetags, block) = match self {
            Self::Dac => (Direction::Sink, 16, 16, false, 0),
            Self::Adc => (Direction::Source, 18, 16, true, 1),
            Self::Dout => (Direction::Sink, 24, 0, false, 2),
            Self::Din => (Direction::Source, 24, 0, true, 3),
            Self::AudioOut => (Direction::Sink, 2, 0, false, 4),
            Self::AudioAux => (Direction::Sink, 2, 0, false, 5),
            Self::Mic => (Direction::Source, 2, 0, true, 6),
        };

        Subsystem {
            kind: self,
            direction,
            channels,
            buffered_channels,
            supports_timetags: timetags,
            block: ScheduleBlock::nth(block),
            bounds: RateBounds::for_subsystem(self),
        }
    }
}

impl fmt::Display for SubsystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Capabilities of one subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subsystem {
    /// Which subsystem
    pub kind: SubsystemKind,
    /// Data direction
    pub direction: Direction,
    /// Channels addressable for instantaneous values (bits for DIN/DOUT)
    pub channels: u32,
    /// Channels that can be RAM-buffered; zero means no channel mask
    pub buffered_channels: u32,
    /// Whether acquired samples can be prefixed with a timetag
    pub supports_timetags: bool,
    /// Register block
    pub block: ScheduleBlock,
    /// Rate domains
    pub bounds: RateBounds,
}

impl Subsystem {
    /// Check if the subsystem has a buffered channel mask.
    pub fn has_channel_mask(&self) -> bool {
        self.buffered_channels > 0
    }

    /// Bytes moved per schedule tick.
    ///
    /// Masked subsystems move one 16-bit sample per enabled channel; the
    /// others move one 16-bit word. Timetagged samples carry 8 extra bytes.
    pub fn bytes_per_tick(&self, enabled_channels: u32, timetags: bool) -> u32 {
        let samples = if self.has_channel_mask() {
            enabled_channels
        } else {
            1
        };
        samples * 2 + if timetags { 8 } else { 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_are_distinct() {
        let mut bases: Vec<u16> = SubsystemKind::ALL
            .iter()
            .map(|k| k.descriptor().block.base())
            .collect();
        bases.sort_unstable();
        bases.dedup();
        assert_eq!(bases.len(), SubsystemKind::ALL.len());
    }

    #[test]
    fn test_adc_channel_ranges() {
        let adc = SubsystemKind::Adc.descriptor();
        assert_eq!(adc.channels, 18);
        assert_eq!(adc.buffered_channels, 16);
        assert_eq!(adc.direction, Direction::Source);
        assert!(adc.supports_timetags);
    }

    #[test]
    fn test_bytes_per_tick() {
        let dac = SubsystemKind::Dac.descriptor();
        assert_eq!(dac.bytes_per_tick(4, false), 8);
        assert_eq!(dac.bytes_per_tick(0, false), 0);

        let din = SubsystemKind::Din.descriptor();
        assert_eq!(din.bytes_per_tick(0, false), 2);
        assert_eq!(din.bytes_per_tick(0, true), 10);
    }
}
