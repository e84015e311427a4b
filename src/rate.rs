//! Schedule rate units and per-subsystem rate domains.
//!
//! A schedule rate is a `(value, unit)` pair. The unit is never converted by
//! the engine: whatever was set is what the device is programmed with and
//! what [`get_rate`](crate::schedule::ScheduleController::get_rate) returns.
//!
//! # Domains
//!
//! | Subsystem | Hz / per video frame | Period (ns) |
//! |-----------|----------------------|-------------|
//! | DAC       | ≤ 1 MHz              | ≥ 1000      |
//! | ADC       | ≤ 200 kHz            | ≥ 5000      |
//! | DIN       | ≤ 1 MHz              | ≥ 1000      |
//! | DOUT      | ≤ 10 MHz             | ≥ 100       |
//! | AUD / AUX | ≤ 96 kHz             | ≥ 10417     |
//! | MIC       | ≤ 102.4 kHz          | ≥ 9750      |

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PixxError, Result};
use crate::registers::SchedCtrl;
use crate::subsystem::SubsystemKind;

/// Unit of a schedule rate value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateUnit {
    /// Updates per second
    #[default]
    Hz,
    /// Updates per displayed video frame
    PerVideoFrame,
    /// Update period in nanoseconds
    Nanoseconds,
}

impl RateUnit {
    /// Every unit.
    pub const ALL: [RateUnit; 3] = [Self::Hz, Self::PerVideoFrame, Self::Nanoseconds];

    /// Rate unit bits of the schedule control word.
    pub(crate) fn ctrl_bits(self) -> SchedCtrl {
        match self {
            Self::Hz => SchedCtrl::empty(),
            Self::PerVideoFrame => SchedCtrl::RATE_VIDEO,
            Self::Nanoseconds => SchedCtrl::RATE_NANO,
        }
    }

    /// Decode the rate unit bits of a control word.
    pub(crate) fn from_ctrl(ctrl: SchedCtrl) -> Option<Self> {
        let bits = ctrl & SchedCtrl::RATE_MASK;
        if bits == SchedCtrl::empty() {
            Some(Self::Hz)
        } else if bits == SchedCtrl::RATE_VIDEO {
            Some(Self::PerVideoFrame)
        } else if bits == SchedCtrl::RATE_NANO {
            Some(Self::Nanoseconds)
        } else {
            None
        }
    }

    /// Short unit label.
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Hz => "Hz",
            Self::PerVideoFrame => "/frame",
            Self::Nanoseconds => "ns",
        }
    }
}

impl fmt::Display for RateUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Closed interval of accepted rate values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDomain {
    /// Smallest accepted value
    pub min: u32,
    /// Largest accepted value
    pub max: u32,
}

impl RateDomain {
    /// Check if `value` lies in the domain.
    pub fn contains(&self, value: u32) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

/// Rate domains of one subsystem, per unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBounds {
    /// Updates per second
    pub hz: RateDomain,
    /// Updates per video frame
    pub per_video_frame: RateDomain,
    /// Update period
    pub nanoseconds: RateDomain,
}

impl RateBounds {
    /// Bounds for a subsystem whose fastest update is `max_rate` per second
    /// (and per frame) or one every `min_period_ns`.
    pub const fn new(max_rate: u32, min_period_ns: u32) -> Self {
        Self {
            hz: RateDomain {
                min: 1,
                max: max_rate,
            },
            per_video_frame: RateDomain {
                min: 1,
                max: max_rate,
            },
            nanoseconds: RateDomain {
                min: min_period_ns,
                max: u32::MAX,
            },
        }
    }

    /// Hardware limits of a subsystem.
    pub fn for_subsystem(kind: SubsystemKind) -> Self {
        match kind {
            SubsystemKind::Dac => Self::new(1_000_000, 1_000),
            SubsystemKind::Adc => Self::new(200_000, 5_000),
            SubsystemKind::Din => Self::new(1_000_000, 1_000),
            SubsystemKind::Dout => Self::new(10_000_000, 100),
            SubsystemKind::AudioOut | SubsystemKind::AudioAux => Self::new(96_000, 10_417),
            SubsystemKind::Mic => Self::new(102_400, 9_750),
        }
    }

    /// Domain for one unit.
    pub fn domain(&self, unit: RateUnit) -> RateDomain {
        match unit {
            RateUnit::Hz => self.hz,
            RateUnit::PerVideoFrame => self.per_video_frame,
            RateUnit::Nanoseconds => self.nanoseconds,
        }
    }

    /// Check a rate against the domain of its unit.
    pub fn validate(&self, value: u32, unit: RateUnit) -> Result<()> {
        let domain = self.domain(unit);
        if !domain.contains(value) {
            return Err(PixxError::out_of_range(
                format!("rate ({})", unit),
                u64::from(value),
                u64::from(domain.min),
                u64::from(domain.max),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_edges() {
        let bounds = RateBounds::for_subsystem(SubsystemKind::Dac);
        assert!(bounds.validate(1_000_000, RateUnit::Hz).is_ok());
        assert!(bounds.validate(1_000_001, RateUnit::Hz).is_err());
        assert!(bounds.validate(0, RateUnit::Hz).is_err());
        assert!(bounds.validate(1_000, RateUnit::Nanoseconds).is_ok());
        assert!(bounds.validate(999, RateUnit::Nanoseconds).is_err());
        assert!(bounds.validate(u32::MAX, RateUnit::Nanoseconds).is_ok());
    }

    #[test]
    fn test_subsystem_limits() {
        let cases = [
            (SubsystemKind::AudioOut, 96_000, 10_417),
            (SubsystemKind::AudioAux, 96_000, 10_417),
            (SubsystemKind::Mic, 102_400, 9_750),
            (SubsystemKind::Adc, 200_000, 5_000),
            (SubsystemKind::Dout, 10_000_000, 100),
            (SubsystemKind::Din, 1_000_000, 1_000),
        ];
        for (kind, max_hz, min_ns) in cases {
            let bounds = RateBounds::for_subsystem(kind);
            assert_eq!(bounds.hz.max, max_hz, "{kind}");
            assert_eq!(bounds.per_video_frame.max, max_hz, "{kind}");
            assert_eq!(bounds.nanoseconds.min, min_ns, "{kind}");
        }
    }

    #[test]
    fn test_out_of_range_error_fields() {
        let err = RateBounds::for_subsystem(SubsystemKind::AudioOut)
            .validate(5_000, RateUnit::Nanoseconds)
            .unwrap_err();
        match err {
            PixxError::OutOfRange { value, min, .. } => {
                assert_eq!(value, 5_000);
                assert_eq!(min, 10_417);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_ctrl_bits_round_trip() {
        for unit in RateUnit::ALL {
            assert_eq!(RateUnit::from_ctrl(unit.ctrl_bits()), Some(unit));
            let ctrl = unit.ctrl_bits() | SchedCtrl::RUNNING | SchedCtrl::COUNTDOWN;
            assert_eq!(RateUnit::from_ctrl(ctrl), Some(unit));
        }
        assert_eq!(RateUnit::from_ctrl(SchedCtrl::RATE_MASK), None);
    }
}
