//! Generic schedule state machine.
//!
//! One [`ScheduleController`] drives one subsystem of one device. It owns the
//! subsystem's ring buffer descriptor and schedule configuration, stages
//! register changes in the device's register cache, and commits them when the
//! schedule starts or stops.
//!
//! # State Machine
//!
//! ```text
//!            configure()               start()
//!   Idle ───────────────▶ Armed ───────────────▶ Running
//!    ▲  ◀─────────────────  │                       │
//!    │        stop()        │ configure()            │ stop(), or countdown
//!    │                      └──────┘                 │ completion seen by
//!    └───────────────────────────────────────────────┘ is_running()
//! ```
//!
//! `start()` is also accepted from `Idle` once a buffer is set, using the
//! current configuration. While `Running`, the buffer and configuration are
//! frozen; channel masks and channel references remain writable.
//!
//! A start committed for vertical sync stays `Running` on the host while the
//! device has not applied it yet. [`ScheduleController::is_running`] tells
//! the two apart with the device frame counter: the running bit is only
//! expected once a frame has passed since the start.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::buffer::RingBufferDescriptor;
use crate::device::Device;
use crate::error::{PixxError, Result};
use crate::rate::RateUnit;
use crate::registers::{CommitMode, IoCtrl, RegisterCache, SchedCtrl};
use crate::subsystem::{Subsystem, SubsystemKind};

/// Schedule lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ScheduleState {
    /// Not configured since the last stop
    #[default]
    Idle,
    /// Configured, not running
    Armed,
    /// Running on the device
    Running,
}

/// Timing parameters of a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Delay between start and the first tick, in nanoseconds
    #[serde(default)]
    pub onset_ns: u32,
    /// Rate value, interpreted through `rate_unit`
    pub rate_value: u32,
    /// Unit of `rate_value`
    #[serde(default)]
    pub rate_unit: RateUnit,
    /// Tick count; the number of ticks to run when `countdown` is set
    #[serde(default)]
    pub count: u32,
    /// Stop automatically when `count` reaches zero
    #[serde(default)]
    pub countdown: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            onset_ns: 0,
            rate_value: 1_000,
            rate_unit: RateUnit::Hz,
            count: 0,
            countdown: false,
        }
    }
}

impl ScheduleConfig {
    /// Free-running schedule at the given rate.
    pub fn new(rate_value: u32, rate_unit: RateUnit) -> Self {
        Self {
            rate_value,
            rate_unit,
            ..Default::default()
        }
    }

    /// Set the onset delay.
    pub fn with_onset(mut self, onset_ns: u32) -> Self {
        self.onset_ns = onset_ns;
        self
    }

    /// Set the tick count.
    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    /// Enable or disable countdown.
    pub fn with_countdown(mut self, countdown: bool) -> Self {
        self.countdown = countdown;
        self
    }

    /// Run exactly `count` ticks, then stop.
    pub fn countdown(mut self, count: u32) -> Self {
        self.count = count;
        self.countdown = true;
        self
    }
}

/// Whether the device has applied the last start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartLatch {
    Applied,
    /// Waiting for vertical sync; frame counter seen after the commit
    Pending(Option<u32>),
}

/// State machine for one subsystem's schedule.
///
/// Holds a claim on its subsystem for its whole lifetime; dropping the
/// controller releases the claim but does not stop a running schedule.
pub struct ScheduleController {
    device: Device,
    subsystem: Subsystem,
    buffer: RingBufferDescriptor,
    config: ScheduleConfig,
    state: ScheduleState,
    latch: StartLatch,
    log_timetags: bool,
}

impl ScheduleController {
    /// Claim `kind` on `device` and create an idle controller for it.
    ///
    /// # Errors
    ///
    /// [`PixxError::NotSupported`] if the persona lacks the subsystem,
    /// [`PixxError::SubsystemBusy`] if another controller holds it.
    pub fn new(device: Device, kind: SubsystemKind) -> Result<Self> {
        device.claim(kind)?;
        let buffer = RingBufferDescriptor::new(device.ram_size());
        Ok(Self {
            device,
            subsystem: kind.descriptor(),
            buffer,
            config: ScheduleConfig::default(),
            state: ScheduleState::Idle,
            latch: StartLatch::Applied,
            log_timetags: false,
        })
    }

    /// Subsystem capabilities.
    pub fn subsystem(&self) -> &Subsystem {
        &self.subsystem
    }

    /// Subsystem kind.
    pub fn kind(&self) -> SubsystemKind {
        self.subsystem.kind
    }

    /// Device this schedule runs on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Host-side lifecycle state.
    ///
    /// Countdown completion is only observed by [`is_running`](Self::is_running).
    pub fn state(&self) -> ScheduleState {
        self.state
    }

    /// Check if a start is latched for vertical sync and not yet applied by
    /// the device. Cleared once [`is_running`](Self::is_running) sees the
    /// running bit.
    pub fn is_start_pending(&self) -> bool {
        matches!(self.latch, StartLatch::Pending(_))
    }

    /// Current timing parameters.
    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    /// Current ring buffer window.
    pub fn buffer(&self) -> &RingBufferDescriptor {
        &self.buffer
    }

    fn ensure_not_running(&self, operation: &'static str) -> Result<()> {
        if self.state == ScheduleState::Running {
            return Err(PixxError::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    fn ctrl_word(&self, running: bool) -> u32 {
        let mut ctrl = self.config.rate_unit.ctrl_bits();
        ctrl.set(SchedCtrl::COUNTDOWN, self.config.countdown);
        ctrl.set(SchedCtrl::LOG_TIMETAG, self.log_timetags);
        ctrl.set(SchedCtrl::RUNNING, running);
        ctrl.bits()
    }

    fn stage(&self, f: impl FnOnce(&mut RegisterCache) -> Result<()>) -> Result<()> {
        self.device.with_cache(f)
    }

    fn stage_config(&self) -> Result<()> {
        let block = self.subsystem.block;
        let ctrl = self.ctrl_word(false);
        let config = self.config;
        self.stage(|cache| {
            cache.set(block.onset(), config.onset_ns)?;
            cache.set(block.rate(), config.rate_value)?;
            cache.set(block.count(), config.count)?;
            cache.set(block.ctrl(), ctrl)
        })
    }

    fn stage_buffer(&self, next: &RingBufferDescriptor) -> Result<()> {
        let block = self.subsystem.block;
        self.stage(|cache| {
            cache.set(block.buffer_base(), next.base())?;
            cache.set(block.buffer_size(), next.size())?;
            cache.set(block.buffer_cursor(), next.cursor())
        })
    }

    // Stage a register change that is legal while running; a running
    // schedule picks it up at its next tick.
    pub(crate) fn stage_live(&self, f: impl FnOnce(&mut RegisterCache) -> Result<()>) -> Result<()> {
        self.stage(f)?;
        if self.state == ScheduleState::Running {
            self.device.commit(self.device.commit_mode())?;
        }
        Ok(())
    }

    /// Apply a complete timing configuration and arm the schedule.
    ///
    /// A countdown with a count of zero is accepted: the device treats it as
    /// free-running.
    ///
    /// # Errors
    ///
    /// [`PixxError::InvalidState`] while running, [`PixxError::OutOfRange`]
    /// if the rate is outside the subsystem's domain for its unit.
    pub fn configure(&mut self, config: ScheduleConfig) -> Result<()> {
        self.ensure_not_running("configure")?;
        self.subsystem
            .bounds
            .validate(config.rate_value, config.rate_unit)?;

        if config.countdown && config.count == 0 {
            warn!(
                subsystem = %self.kind(),
                "Countdown with count 0 runs free until stopped"
            );
        }

        let previous = self.config;
        self.config = config;
        if let Err(e) = self.stage_config() {
            self.config = previous;
            return Err(e);
        }
        self.state = ScheduleState::Armed;

        debug!(
            subsystem = %self.kind(),
            rate = config.rate_value,
            unit = %config.rate_unit,
            count = config.count,
            countdown = config.countdown,
            onset_ns = config.onset_ns,
            "Schedule configured"
        );
        Ok(())
    }

    /// Start the schedule with the device's default commit mode.
    pub fn start(&mut self) -> Result<()> {
        self.start_with(self.device.commit_mode())
    }

    /// Commit staged registers, then set the running bit.
    ///
    /// The count register is reloaded from the configuration, so a countdown
    /// schedule that completed can be started again as is.
    ///
    /// # Errors
    ///
    /// [`PixxError::InvalidState`] if already running,
    /// [`PixxError::NotConfigured`] without a buffer. Both leave the state
    /// unchanged. A link error leaves the schedule not running.
    pub fn start_with(&mut self, mode: CommitMode) -> Result<()> {
        self.ensure_not_running("start")?;
        if !self.buffer.is_configured() {
            return Err(PixxError::NotConfigured {
                subsystem: self.kind(),
            });
        }

        self.stage_config()?;
        self.device.commit(mode)?;

        let ctrl = self.subsystem.block.ctrl();
        let running = self.ctrl_word(true);
        self.stage(|cache| cache.set(ctrl, running))?;
        if let Err(e) = self.device.commit(mode) {
            let idle = self.ctrl_word(false);
            self.stage(|cache| cache.set(ctrl, idle))?;
            return Err(e);
        }

        self.state = ScheduleState::Running;
        self.latch = match mode {
            CommitMode::Immediate => StartLatch::Applied,
            CommitMode::AtVerticalSync => StartLatch::Pending(self.frame_count()),
        };
        info!(
            persona = %self.device.kind(),
            subsystem = %self.kind(),
            base = format_args!("{:#x}", self.buffer.base()),
            size = self.buffer.size(),
            rate = self.config.rate_value,
            unit = %self.config.rate_unit,
            mode = ?mode,
            "Schedule started"
        );
        Ok(())
    }

    // A frame counter that cannot be read is recorded at the next is_running.
    fn frame_count(&self) -> Option<u32> {
        match self.device.frame_count() {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!(subsystem = %self.kind(), error = %e, "Frame counter unavailable");
                None
            }
        }
    }

    /// Stop the schedule.
    ///
    /// Idempotent: stopping an idle schedule does nothing and performs no
    /// link I/O. An armed schedule returns to idle without link I/O. A stop
    /// issued while the start is still latched is latched behind it.
    pub fn stop(&mut self) -> Result<()> {
        match self.state {
            ScheduleState::Idle => Ok(()),
            ScheduleState::Armed => {
                self.state = ScheduleState::Idle;
                debug!(subsystem = %self.kind(), "Schedule disarmed");
                Ok(())
            }
            ScheduleState::Running => {
                let ctrl = self.subsystem.block.ctrl();
                let idle = self.ctrl_word(false);
                self.stage(|cache| cache.set(ctrl, idle))?;
                let mode = if self.is_start_pending() {
                    CommitMode::AtVerticalSync
                } else {
                    self.device.commit_mode()
                };
                self.device.commit(mode)?;
                self.state = ScheduleState::Idle;
                self.latch = StartLatch::Applied;
                info!(
                    persona = %self.device.kind(),
                    subsystem = %self.kind(),
                    "Schedule stopped"
                );
                Ok(())
            }
        }
    }

    /// Read the device's running bit.
    ///
    /// A schedule the device halted by itself (countdown completion) moves
    /// to idle here. A start still latched for vertical sync reads as not
    /// running and keeps the schedule `Running`.
    pub fn is_running(&mut self) -> Result<bool> {
        let ctrl = SchedCtrl::from_bits_retain(self.device.read_live(self.subsystem.block.ctrl())?);
        if ctrl.contains(SchedCtrl::RUNNING) {
            self.latch = StartLatch::Applied;
            return Ok(true);
        }
        if self.state != ScheduleState::Running {
            return Ok(false);
        }

        if let StartLatch::Pending(seen) = self.latch {
            let frame = self.device.frame_count()?;
            match seen {
                Some(started) if started == frame => {
                    debug!(subsystem = %self.kind(), frame, "Start latched for vertical sync");
                    return Ok(false);
                }
                None => {
                    self.latch = StartLatch::Pending(Some(frame));
                    return Ok(false);
                }
                Some(_) => {}
            }
        }

        self.state = ScheduleState::Idle;
        self.latch = StartLatch::Applied;
        info!(subsystem = %self.kind(), "Schedule completed");
        Ok(false)
    }

    /// Set the rate.
    ///
    /// # Errors
    ///
    /// [`PixxError::OutOfRange`] outside the unit's domain,
    /// [`PixxError::InvalidState`] while running.
    pub fn set_rate(&mut self, value: u32, unit: RateUnit) -> Result<()> {
        self.ensure_not_running("set_rate")?;
        self.subsystem.bounds.validate(value, unit)?;
        self.update_config(|config| {
            config.rate_value = value;
            config.rate_unit = unit;
        })
    }

    /// Last rate set, exactly as given.
    pub fn get_rate(&self) -> (u32, RateUnit) {
        (self.config.rate_value, self.config.rate_unit)
    }

    /// Set the onset delay in nanoseconds.
    pub fn set_onset(&mut self, onset_ns: u32) -> Result<()> {
        self.ensure_not_running("set_onset")?;
        self.update_config(|config| config.onset_ns = onset_ns)
    }

    /// Onset delay in nanoseconds.
    pub fn onset(&self) -> u32 {
        self.config.onset_ns
    }

    /// Set the tick count loaded at start.
    pub fn set_count(&mut self, count: u32) -> Result<()> {
        self.ensure_not_running("set_count")?;
        self.update_config(|config| config.count = count)
    }

    /// Live tick counter. Counts down to zero in countdown mode.
    pub fn count(&self) -> Result<u32> {
        self.device.read_live(self.subsystem.block.count())
    }

    /// Enable or disable countdown.
    pub fn set_countdown(&mut self, countdown: bool) -> Result<()> {
        self.ensure_not_running("set_countdown")?;
        if countdown && self.config.count == 0 {
            warn!(
                subsystem = %self.kind(),
                "Countdown with count 0 runs free until stopped"
            );
        }
        self.update_config(|config| config.countdown = countdown)
    }

    /// Check if countdown is enabled.
    pub fn is_countdown(&self) -> bool {
        self.config.countdown
    }

    fn update_config(&mut self, f: impl FnOnce(&mut ScheduleConfig)) -> Result<()> {
        let previous = self.config;
        f(&mut self.config);
        if let Err(e) = self.stage_config() {
            self.config = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Move the buffer base. The cursor returns to the new base.
    pub fn set_base(&mut self, addr: u32) -> Result<()> {
        self.ensure_not_running("set_base")?;
        let next = self.buffer.with_base(addr)?;
        self.apply_buffer(next)
    }

    /// Resize the buffer.
    pub fn set_size(&mut self, bytes: u32) -> Result<()> {
        self.ensure_not_running("set_size")?;
        let next = self.buffer.with_size(bytes)?;
        self.apply_buffer(next)
    }

    /// Set base and size together. Both are validated before anything is
    /// staged, and all three buffer registers go out in the same commit.
    pub fn set_buffer(&mut self, addr: u32, bytes: u32) -> Result<()> {
        self.ensure_not_running("set_buffer")?;
        let next = self.buffer.with_buffer(addr, bytes)?;
        self.apply_buffer(next)
    }

    /// Set where the device reads (sinks) or writes (sources) next.
    pub fn set_cursor(&mut self, addr: u32) -> Result<()> {
        self.ensure_not_running("set_cursor")?;
        let next = self.buffer.with_cursor(addr)?;
        self.apply_buffer(next)
    }

    /// Live cursor register.
    pub fn cursor(&self) -> Result<u32> {
        self.device.read_live(self.subsystem.block.buffer_cursor())
    }

    fn apply_buffer(&mut self, next: RingBufferDescriptor) -> Result<()> {
        self.stage_buffer(&next)?;
        self.buffer = next;
        debug!(
            subsystem = %self.kind(),
            base = format_args!("{:#x}", next.base()),
            size = next.size(),
            cursor = format_args!("{:#x}", next.cursor()),
            "Buffer staged"
        );
        Ok(())
    }

    /// Prefix acquired samples with a device timetag.
    ///
    /// # Errors
    ///
    /// [`PixxError::NotSupported`] for subsystems without timetags,
    /// [`PixxError::InvalidState`] while running.
    pub fn set_log_timetags(&mut self, enabled: bool) -> Result<()> {
        if !self.subsystem.supports_timetags {
            return Err(PixxError::NotSupported {
                message: format!("{} samples cannot carry timetags", self.kind()),
            });
        }
        self.ensure_not_running("set_log_timetags")?;
        let previous = self.log_timetags;
        self.log_timetags = enabled;
        let ctrl = self.subsystem.block.ctrl();
        let word = self.ctrl_word(false);
        if let Err(e) = self.stage(|cache| cache.set(ctrl, word)) {
            self.log_timetags = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Check if timetag logging is enabled.
    pub fn is_log_timetags(&self) -> bool {
        self.log_timetags
    }

    /// Verify `channel` is inside the buffered range.
    pub(crate) fn check_channel(&self, channel: u32) -> Result<()> {
        self.check_channel_below(channel, self.subsystem.buffered_channels)
    }

    /// Verify `channel` is one of the subsystem's channels, buffered or not.
    pub(crate) fn check_value_channel(&self, channel: u32) -> Result<()> {
        self.check_channel_below(channel, self.subsystem.channels)
    }

    fn check_channel_below(&self, channel: u32, max: u32) -> Result<()> {
        if channel >= max {
            return Err(PixxError::InvalidChannel {
                subsystem: self.kind(),
                channel,
                max,
            });
        }
        Ok(())
    }

    /// Input/output control flags as last written.
    pub(crate) fn io_flags(&self) -> Result<IoCtrl> {
        let reg = self.subsystem.block.io_ctrl();
        Ok(IoCtrl::from_bits_retain(self.device.with_cache(|c| c.get(reg))?))
    }

    /// Set or clear an input/output control flag.
    ///
    /// These flags route signals rather than time the schedule, so they are
    /// written to the device at once in any state.
    pub(crate) fn set_io_flag(&self, flag: IoCtrl, enabled: bool) -> Result<()> {
        let mut flags = self.io_flags()?;
        flags.set(flag, enabled);
        self.device.write_live(self.subsystem.block.io_ctrl(), flags.bits())?;
        debug!(subsystem = %self.kind(), flags = ?flags, "I/O control updated");
        Ok(())
    }
}

impl Drop for ScheduleController {
    fn drop(&mut self) {
        self.device.release(self.kind());
    }
}

impl std::fmt::Debug for ScheduleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleController")
            .field("persona", &self.device.kind())
            .field("subsystem", &self.kind())
            .field("state", &self.state)
            .field("start_pending", &self.is_start_pending())
            .field("buffer", &self.buffer)
            .field("config", &self.config)
            .finish()
    }
}
