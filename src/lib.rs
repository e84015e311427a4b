//! Buffered schedule engine for multi-persona stimulus/response devices.
//!
//! This crate moves timed data between a host and device-resident RAM for a
//! family of real-time I/O devices: analog outputs and inputs, digital outputs
//! and inputs, two audio outputs and a microphone input. Each of these runs a
//! *schedule*: at a fixed rate the device reads the next sample from a ring
//! buffer in its RAM (outputs) or writes the next sample into one (inputs).
//!
//! The transport is not part of this crate. Everything talks to the device
//! through the [`Link`] trait; [`mock::MockLink`] provides simulated hardware.
//!
//! # Architecture
//!
//! ## Device Access
//! - [`DeviceSelector`] - Owns a shared link; scoped, restoring persona selection
//! - [`Device`] - One persona: register cache, RAM access, subsystem claims
//! - [`RegisterCache`] - Host mirror of the register file with dirty tracking
//!
//! ## Schedules
//! - [`ScheduleController`] - Idle/Armed/Running state machine for one subsystem
//! - [`RingBufferDescriptor`] - Base/size/cursor window in device RAM
//! - [`RateUnit`] / [`RateBounds`] - Rate units and per-subsystem domains
//! - [`DacSchedule`], [`AdcSchedule`], [`DoutSchedule`], [`DinSchedule`],
//!   [`AudioOutSchedule`], [`AudioAuxSchedule`], [`MicSchedule`] - Typed facades
//!
//! ## Ambient
//! - [`config`] - Figment-based configuration (TOML + `PIXX_` environment)
//! - [`logging`] - `tracing-subscriber` setup
//!
//! # Example
//!
//! ```
//! use pixx_sched::mock::MockLink;
//! use pixx_sched::{Device, DeviceSelector, Persona, PersonaKind, RateUnit, ScheduleConfig};
//!
//! # fn main() -> pixx_sched::Result<()> {
//! let link = MockLink::new().with_persona(PersonaKind::DataPixx, 0x10000);
//! let handle = link.handle();
//! let selector = DeviceSelector::new(link);
//! let device = Device::open(
//!     &selector,
//!     Persona::with_all_subsystems(PersonaKind::DataPixx, 0x10000)?,
//! )?;
//!
//! let mut dac = device.dac()?;
//! dac.set_buffer(0x1000, 0x2000)?;
//! dac.enable_channel(0)?;
//! dac.configure(ScheduleConfig::new(1000, RateUnit::Hz).countdown(5000))?;
//! dac.start()?;
//!
//! handle.advance_ticks(PersonaKind::DataPixx, 5000);
//! assert!(!dac.is_running()?);
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod config;
pub mod device;
pub mod error;
pub mod facades;
pub mod link;
pub mod logging;
pub mod mock;
pub mod persona;
pub mod rate;
pub mod registers;
pub mod schedule;
pub mod selector;
pub mod subsystem;

pub use buffer::RingBufferDescriptor;
pub use config::PixxConfig;
pub use device::Device;
pub use error::{LinkError, PixxError, Result};
pub use facades::{
    AdcSchedule, AudioAuxSchedule, AudioOutSchedule, ChannelReference, DacSchedule, DinSchedule,
    DoutSchedule, MicSchedule, Schedule,
};
pub use link::{Link, Region};
pub use persona::{Persona, PersonaKind};
pub use rate::{RateBounds, RateDomain, RateUnit};
pub use registers::{CommitMode, IoCtrl, RegisterCache, SystemRegisters};
pub use schedule::{ScheduleConfig, ScheduleController, ScheduleState};
pub use selector::DeviceSelector;
pub use subsystem::{Direction, Subsystem, SubsystemKind};
