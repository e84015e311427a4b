//! Typed schedules, one per subsystem.
//!
//! [`Schedule<S>`] wraps a [`ScheduleController`] and dereferences to it, so
//! every subsystem gets the full lifecycle API. Marker types pick the
//! subsystem at compile time and unlock what only some subsystems have:
//!
//! - channel masks on [`Dac`] and [`Adc`] ([`BufferedChannels`])
//! - channel references on [`Adc`]
//! - timetag logging on [`Adc`], [`Din`] and [`Mic`] ([`TimetagCapable`])
//! - loopback from the matching outputs on [`Adc`], [`Din`] and [`Mic`]
//!   ([`LoopbackCapable`])
//! - instantaneous channel values on [`Dac`], [`Adc`], [`Dout`] and [`Din`]
//!
//! # Example
//!
//! ```
//! use pixx_sched::mock::MockLink;
//! use pixx_sched::persona::{Persona, PersonaKind};
//! use pixx_sched::rate::RateUnit;
//! use pixx_sched::schedule::ScheduleConfig;
//! use pixx_sched::selector::DeviceSelector;
//! use pixx_sched::device::Device;
//!
//! # fn main() -> pixx_sched::error::Result<()> {
//! let link = MockLink::new().with_persona(PersonaKind::DataPixx, 0x10000);
//! let selector = DeviceSelector::new(link);
//! let persona = Persona::with_all_subsystems(PersonaKind::DataPixx, 0x10000)?;
//! let device = Device::open(&selector, persona)?;
//!
//! let mut adc = device.adc()?;
//! adc.set_buffer(0x4000, 0x1000)?;
//! adc.enable_channel(0)?;
//! adc.enable_channel(1)?;
//! adc.configure(ScheduleConfig::new(10_000, RateUnit::Hz).countdown(100))?;
//! adc.start()?;
//! assert!(adc.is_running()?);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::error::{PixxError, Result};
use crate::registers::{IoCtrl, SystemRegisters};
use crate::schedule::ScheduleController;
use crate::subsystem::SubsystemKind;

mod sealed {
    pub trait Sealed {}
}

/// Compile-time subsystem selector.
pub trait SubsystemMarker: sealed::Sealed {
    /// Subsystem this marker stands for.
    const KIND: SubsystemKind;
}

/// Subsystems with a RAM-buffered channel mask.
pub trait BufferedChannels: SubsystemMarker {}

/// Subsystems whose samples can carry device timetags.
pub trait TimetagCapable: SubsystemMarker {}

/// Inputs that can be wired internally to the matching outputs.
pub trait LoopbackCapable: SubsystemMarker {}

macro_rules! subsystem_marker {
    ($(#[$doc:meta])* $name:ident => $kind:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name;

        impl sealed::Sealed for $name {}

        impl SubsystemMarker for $name {
            const KIND: SubsystemKind = SubsystemKind::$kind;
        }
    };
}

subsystem_marker!(
    /// Analog outputs
    Dac => Dac
);
subsystem_marker!(
    /// Analog inputs
    Adc => Adc
);
subsystem_marker!(
    /// Digital outputs
    Dout => Dout
);
subsystem_marker!(
    /// Digital inputs
    Din => Din
);
subsystem_marker!(
    /// Audio output
    AudioOut => AudioOut
);
subsystem_marker!(
    /// Auxiliary audio output
    AudioAux => AudioAux
);
subsystem_marker!(
    /// Microphone input
    Mic => Mic
);

impl BufferedChannels for Dac {}
impl BufferedChannels for Adc {}

impl TimetagCapable for Adc {}
impl TimetagCapable for Din {}
impl TimetagCapable for Mic {}

impl LoopbackCapable for Adc {}
impl LoopbackCapable for Din {}
impl LoopbackCapable for Mic {}

/// Width mask of the digital value registers.
const DIGITAL_MASK: u32 = 0x00FF_FFFF;

/// Analog output schedule.
pub type DacSchedule = Schedule<Dac>;
/// Analog input schedule.
pub type AdcSchedule = Schedule<Adc>;
/// Digital output schedule.
pub type DoutSchedule = Schedule<Dout>;
/// Digital input schedule.
pub type DinSchedule = Schedule<Din>;
/// Audio output schedule.
pub type AudioOutSchedule = Schedule<AudioOut>;
/// Auxiliary audio output schedule.
pub type AudioAuxSchedule = Schedule<AudioAux>;
/// Microphone input schedule.
pub type MicSchedule = Schedule<Mic>;

/// Schedule of the subsystem named by `S`.
pub struct Schedule<S: SubsystemMarker> {
    controller: ScheduleController,
    _marker: PhantomData<S>,
}

impl<S: SubsystemMarker> Schedule<S> {
    /// Claim the subsystem on `device`.
    pub fn open(device: Device) -> Result<Self> {
        Ok(Self {
            controller: ScheduleController::new(device, S::KIND)?,
            _marker: PhantomData,
        })
    }

    /// Untyped controller.
    pub fn into_inner(self) -> ScheduleController {
        self.controller
    }
}

impl<S: SubsystemMarker> Deref for Schedule<S> {
    type Target = ScheduleController;

    fn deref(&self) -> &Self::Target {
        &self.controller
    }
}

impl<S: SubsystemMarker> DerefMut for Schedule<S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.controller
    }
}

impl<S: SubsystemMarker> fmt::Debug for Schedule<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.controller, f)
    }
}

impl<S: BufferedChannels> Schedule<S> {
    fn mask(&self) -> Result<u32> {
        let reg = self.subsystem().block.channel_select();
        self.device().with_cache(|cache| cache.get(reg))
    }

    fn write_mask(&self, mask: u32) -> Result<()> {
        let reg = self.subsystem().block.channel_select();
        self.stage_live(|cache| cache.set(reg, mask))
    }

    fn full_mask(&self) -> u32 {
        let n = self.subsystem().buffered_channels;
        if n >= 32 {
            u32::MAX
        } else {
            (1 << n) - 1
        }
    }

    /// Include a channel in buffered transfers.
    ///
    /// Accepted while running; a running schedule picks it up at its next
    /// tick.
    pub fn enable_channel(&mut self, channel: u32) -> Result<()> {
        self.check_channel(channel)?;
        let mask = self.mask()? | (1 << channel);
        self.write_mask(mask)
    }

    /// Exclude a channel from buffered transfers.
    pub fn disable_channel(&mut self, channel: u32) -> Result<()> {
        self.check_channel(channel)?;
        let mask = self.mask()? & !(1 << channel);
        self.write_mask(mask)
    }

    /// Enable every buffered channel.
    pub fn enable_all(&mut self) -> Result<()> {
        let mask = self.full_mask();
        self.write_mask(mask)
    }

    /// Disable every buffered channel.
    pub fn disable_all(&mut self) -> Result<()> {
        self.write_mask(0)
    }

    /// Check if a channel is included in buffered transfers.
    pub fn is_channel_enabled(&self, channel: u32) -> Result<bool> {
        self.check_channel(channel)?;
        Ok(self.mask()? & (1 << channel) != 0)
    }

    /// Enabled channels, ascending.
    pub fn enabled_channels(&self) -> Result<Vec<u32>> {
        let mask = self.mask()? & self.full_mask();
        Ok((0..self.subsystem().buffered_channels)
            .filter(|ch| mask & (1 << ch) != 0)
            .collect())
    }
}

impl<S: TimetagCapable> Schedule<S> {
    /// Prefix each acquired sample with a 64-bit device timetag.
    ///
    /// Only input subsystems have this method; the untyped controller
    /// reports `NotSupported` for the others at run time.
    pub fn set_log_timetags(&mut self, enabled: bool) -> Result<()> {
        self.controller.set_log_timetags(enabled)
    }
}

impl<S: LoopbackCapable> Schedule<S> {
    /// Feed the input from the matching outputs instead of its connector:
    /// analog inputs from the DAC, digital inputs from the digital outputs,
    /// the microphone from the audio output.
    ///
    /// Written to the device at once, also while running.
    pub fn set_loopback(&mut self, enabled: bool) -> Result<()> {
        self.set_io_flag(IoCtrl::LOOPBACK, enabled)
    }

    /// Check if the input is looped back.
    pub fn is_loopback(&self) -> Result<bool> {
        Ok(self.io_flags()?.contains(IoCtrl::LOOPBACK))
    }
}

/// Reference an analog input channel is measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelReference {
    /// Single-ended against ground
    #[default]
    Ground,
    /// Differential against the adjacent channel
    Differential,
    /// Against reference input 0
    Ref0,
    /// Against reference input 1
    Ref1,
}

impl ChannelReference {
    const BITS: u32 = 2;
    const FIELD: u32 = 0b11;

    fn code(self) -> u32 {
        match self {
            Self::Ground => 0,
            Self::Differential => 1,
            Self::Ref0 => 2,
            Self::Ref1 => 3,
        }
    }

    fn from_code(code: u32) -> Self {
        match code & Self::FIELD {
            0 => Self::Ground,
            1 => Self::Differential,
            2 => Self::Ref0,
            _ => Self::Ref1,
        }
    }

    /// Channel a differential input is paired with: even channels pair with
    /// the next odd one and vice versa.
    pub fn differential_partner(channel: u32) -> u32 {
        channel ^ 1
    }
}

impl Schedule<Adc> {
    /// Select what an analog input channel is measured against.
    ///
    /// # Errors
    ///
    /// [`PixxError::InvalidChannel`](crate::error::PixxError::InvalidChannel)
    /// outside the buffered range.
    pub fn set_channel_reference(&mut self, channel: u32, reference: ChannelReference) -> Result<()> {
        self.check_channel(channel)?;
        let reg = self.subsystem().block.channel_reference();
        let shift = channel * ChannelReference::BITS;
        let current = self.device().with_cache(|cache| cache.get(reg))?;
        let next = (current & !(ChannelReference::FIELD << shift)) | (reference.code() << shift);
        self.stage_live(|cache| cache.set(reg, next))
    }

    /// Current reference of an analog input channel.
    pub fn channel_reference(&self, channel: u32) -> Result<ChannelReference> {
        self.check_channel(channel)?;
        let reg = self.subsystem().block.channel_reference();
        let word = self.device().with_cache(|cache| cache.get(reg))?;
        Ok(ChannelReference::from_code(
            word >> (channel * ChannelReference::BITS),
        ))
    }
}

impl Schedule<Adc> {
    /// Let the converters run continuously instead of converting only on
    /// schedule ticks, so [`channel_value`](Self::channel_value) stays fresh.
    pub fn set_free_run(&mut self, enabled: bool) -> Result<()> {
        self.set_io_flag(IoCtrl::FREE_RUN, enabled)
    }

    /// Check if the converters run continuously.
    pub fn is_free_run(&self) -> Result<bool> {
        Ok(self.io_flags()?.contains(IoCtrl::FREE_RUN))
    }

    /// Latest conversion of an analog input, including the two channels
    /// that are never buffered.
    pub fn channel_value(&self, channel: u32) -> Result<u16> {
        self.check_value_channel(channel)?;
        Ok(self.device().read_live(SystemRegisters::adc_value(channel))? as u16)
    }
}

impl Schedule<Dac> {
    /// Drive an analog output directly, outside any schedule.
    pub fn set_channel_value(&mut self, channel: u32, value: u16) -> Result<()> {
        self.check_value_channel(channel)?;
        self.device()
            .write_live(SystemRegisters::dac_value(channel), u32::from(value))
    }

    /// Value an analog output is currently driven to.
    pub fn channel_value(&self, channel: u32) -> Result<u16> {
        self.check_value_channel(channel)?;
        Ok(self.device().read_live(SystemRegisters::dac_value(channel))? as u16)
    }
}

impl Schedule<Dout> {
    /// Drive all digital outputs at once.
    ///
    /// # Errors
    ///
    /// [`PixxError::OutOfRange`] if `value` has bits above the output count.
    pub fn set_value(&mut self, value: u32) -> Result<()> {
        if value > DIGITAL_MASK {
            return Err(PixxError::out_of_range(
                "digital output value",
                u64::from(value),
                0,
                u64::from(DIGITAL_MASK),
            ));
        }
        self.device().write_live(SystemRegisters::DOUT_VALUE, value)
    }

    /// Drive one digital output.
    pub fn set_bit_value(&mut self, bit: u32, high: bool) -> Result<()> {
        self.check_value_channel(bit)?;
        let mut value = self.value()?;
        if high {
            value |= 1 << bit;
        } else {
            value &= !(1 << bit);
        }
        self.set_value(value)
    }

    /// Levels the digital outputs are driven to.
    pub fn value(&self) -> Result<u32> {
        Ok(self.device().read_live(SystemRegisters::DOUT_VALUE)? & DIGITAL_MASK)
    }
}

impl Schedule<Din> {
    /// Levels currently seen on the digital inputs.
    pub fn value(&self) -> Result<u32> {
        Ok(self.device().read_live(SystemRegisters::DIN_VALUE)? & DIGITAL_MASK)
    }

    /// Level of one digital input.
    pub fn bit_value(&self, bit: u32) -> Result<bool> {
        self.check_value_channel(bit)?;
        Ok(self.value()? & (1 << bit) != 0)
    }

    /// Record every input transition in the buffer with its timetag, instead
    /// of sampling on schedule ticks.
    pub fn set_log_events(&mut self, enabled: bool) -> Result<()> {
        self.set_io_flag(IoCtrl::LOG_EVENTS, enabled)
    }

    /// Check if transitions are logged.
    pub fn is_log_events(&self) -> Result<bool> {
        Ok(self.io_flags()?.contains(IoCtrl::LOG_EVENTS))
    }

    /// Ignore transitions shorter than the device's debounce interval.
    pub fn set_debounce(&mut self, enabled: bool) -> Result<()> {
        self.set_io_flag(IoCtrl::DEBOUNCE, enabled)
    }

    /// Check if inputs are debounced.
    pub fn is_debounce(&self) -> Result<bool> {
        Ok(self.io_flags()?.contains(IoCtrl::DEBOUNCE))
    }

    /// Log a transition only once the input has settled.
    pub fn set_stabilize(&mut self, enabled: bool) -> Result<()> {
        self.set_io_flag(IoCtrl::STABILIZE, enabled)
    }

    /// Check if inputs must settle before a transition is logged.
    pub fn is_stabilize(&self) -> Result<bool> {
        Ok(self.io_flags()?.contains(IoCtrl::STABILIZE))
    }
}

impl fmt::Display for ChannelReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ground => "GND",
            Self::Differential => "DIFF",
            Self::Ref0 => "REF0",
            Self::Ref1 => "REF1",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockHandle, MockLink};
    use crate::persona::{Persona, PersonaKind};
    use crate::selector::DeviceSelector;

    fn device() -> Device {
        device_with_handle().0
    }

    fn device_with_handle() -> (Device, MockHandle) {
        let link = MockLink::new().with_persona(PersonaKind::ViewPixx, 0x10000);
        let handle = link.handle();
        let selector = DeviceSelector::new(link);
        let device = Device::open(
            &selector,
            Persona::with_all_subsystems(PersonaKind::ViewPixx, 0x10000).unwrap(),
        )
        .unwrap();
        (device, handle)
    }

    #[test]
    fn test_channel_mask() {
        let device = device();
        let mut dac = device.dac().unwrap();
        dac.enable_channel(3).unwrap();
        dac.enable_channel(0).unwrap();
        assert!(dac.is_channel_enabled(3).unwrap());
        assert!(!dac.is_channel_enabled(1).unwrap());
        assert_eq!(dac.enabled_channels().unwrap(), vec![0, 3]);

        dac.disable_channel(3).unwrap();
        assert_eq!(dac.enabled_channels().unwrap(), vec![0]);

        dac.enable_all().unwrap();
        assert_eq!(dac.enabled_channels().unwrap().len(), 16);
        dac.disable_all().unwrap();
        assert!(dac.enabled_channels().unwrap().is_empty());
    }

    #[test]
    fn test_channel_out_of_range() {
        let device = device();
        let mut dac = device.dac().unwrap();
        assert!(matches!(
            dac.enable_channel(16),
            Err(PixxError::InvalidChannel {
                channel: 16,
                max: 16,
                ..
            })
        ));
    }

    #[test]
    fn test_channel_reference_fields_are_independent() {
        let device = device();
        let mut adc = device.adc().unwrap();
        adc.set_channel_reference(0, ChannelReference::Differential)
            .unwrap();
        adc.set_channel_reference(15, ChannelReference::Ref1).unwrap();
        adc.set_channel_reference(1, ChannelReference::Ref0).unwrap();

        assert_eq!(
            adc.channel_reference(0).unwrap(),
            ChannelReference::Differential
        );
        assert_eq!(adc.channel_reference(1).unwrap(), ChannelReference::Ref0);
        assert_eq!(adc.channel_reference(2).unwrap(), ChannelReference::Ground);
        assert_eq!(adc.channel_reference(15).unwrap(), ChannelReference::Ref1);
    }

    #[test]
    fn test_differential_partner() {
        assert_eq!(ChannelReference::differential_partner(0), 1);
        assert_eq!(ChannelReference::differential_partner(1), 0);
        assert_eq!(ChannelReference::differential_partner(6), 7);
    }

    #[test]
    fn test_adc_value_channels_include_unbuffered() {
        let (device, handle) = device_with_handle();
        let adc = device.adc().unwrap();
        handle.poke_register(PersonaKind::ViewPixx, SystemRegisters::adc_value(17), 0x7FFF);

        assert_eq!(adc.channel_value(17).unwrap(), 0x7FFF);
        assert!(matches!(
            adc.channel_value(18),
            Err(PixxError::InvalidChannel {
                channel: 18,
                max: 18,
                ..
            })
        ));
        // Buffered operations still stop at 16
        assert!(adc.is_channel_enabled(16).is_err());
    }

    #[test]
    fn test_dout_value_range() {
        let device = device();
        let mut dout = device.dout().unwrap();
        dout.set_value(0x00FF_FFFF).unwrap();
        assert!(matches!(
            dout.set_value(0x0100_0000),
            Err(PixxError::OutOfRange { .. })
        ));
        dout.set_bit_value(23, false).unwrap();
        assert_eq!(dout.value().unwrap(), 0x007F_FFFF);
        assert!(matches!(
            dout.set_bit_value(24, true),
            Err(PixxError::InvalidChannel { max: 24, .. })
        ));
    }

    #[test]
    fn test_free_run_flag() {
        let (device, handle) = device_with_handle();
        let mut adc = device.adc().unwrap();
        assert!(!adc.is_free_run().unwrap());
        adc.set_free_run(true).unwrap();
        assert!(adc.is_free_run().unwrap());
        assert!(!adc.is_loopback().unwrap());

        let reg = adc.subsystem().block.io_ctrl();
        assert_eq!(
            handle.register(PersonaKind::ViewPixx, reg.offset()) & 0xFFFF,
            IoCtrl::FREE_RUN.bits()
        );
    }

    #[test]
    fn test_typed_kind() {
        let device = device();
        assert_eq!(device.audio_aux().unwrap().kind(), SubsystemKind::AudioAux);
        assert_eq!(device.dout().unwrap().kind(), SubsystemKind::Dout);
        assert_eq!(device.din().unwrap().kind(), SubsystemKind::Din);
        assert_eq!(device.audio_out().unwrap().kind(), SubsystemKind::AudioOut);
    }
}
