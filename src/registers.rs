//! Register map and host-side register cache.
//!
//! The device exposes a small register file of 16-bit words addressed by even
//! byte offsets. 32-bit registers occupy a low/high word pair and must sit on
//! a 4-byte boundary. Every schedule subsystem owns one [`ScheduleBlock`] of
//! identically laid out registers.
//!
//! # Register File Layout
//!
//! ```text
//! 0x000 ┌──────────────────────────────┐
//!       │ device id, frame counter      │
//! 0x040 ├──────────────────────────────┤
//!       │ DAC schedule block            │  stride 0x30
//! 0x070 │ ADC schedule block            │
//! 0x0A0 │ DOUT schedule block           │
//! 0x0D0 │ DIN schedule block            │
//! 0x100 │ AUD schedule block            │
//! 0x130 │ AUX schedule block            │
//! 0x160 │ MIC schedule block            │
//! 0x190 ├──────────────────────────────┤
//!       │ DAC channel values            │  16 words
//! 0x1B0 │ ADC channel values            │  18 words
//! 0x1D4 │ DOUT / DIN bit values         │
//! 0x1DC ├──────────────────────────────┤
//!       │ reserved                      │
//! 0x200 └──────────────────────────────┘
//! ```
//!
//! [`RegisterCache`] mirrors the whole file. Writes land in the cache and mark
//! words dirty; [`RegisterCache::commit`] pushes dirty words to the device.

use std::ops::Range;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{PixxError, Result};
use crate::link::{Link, Region};

/// Size of the register file in bytes.
pub const REGISTER_FILE_BYTES: u16 = 0x200;

const REGISTER_FILE_WORDS: usize = REGISTER_FILE_BYTES as usize / 2;

/// When the device applies a register commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitMode {
    /// Apply as soon as the write arrives
    #[default]
    Immediate,
    /// Latch the write and apply it at the next vertical sync of the video output
    AtVerticalSync,
}

/// Register width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterWidth {
    /// One 16-bit word
    Word,
    /// A 32-bit low/high word pair
    DoubleWord,
}

impl RegisterWidth {
    fn words(self) -> usize {
        match self {
            Self::Word => 1,
            Self::DoubleWord => 2,
        }
    }

    /// Largest value the register can hold.
    pub fn max_value(self) -> u32 {
        match self {
            Self::Word => u32::from(u16::MAX),
            Self::DoubleWord => u32::MAX,
        }
    }
}

/// Address and width of one register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Register {
    offset: u16,
    width: RegisterWidth,
}

impl Register {
    /// A 16-bit register at `offset`.
    pub const fn word(offset: u16) -> Self {
        Self {
            offset,
            width: RegisterWidth::Word,
        }
    }

    /// A 32-bit register at `offset`.
    pub const fn double_word(offset: u16) -> Self {
        Self {
            offset,
            width: RegisterWidth::DoubleWord,
        }
    }

    /// Byte offset in the register file.
    pub fn offset(&self) -> u16 {
        self.offset
    }

    /// Register width.
    pub fn width(&self) -> RegisterWidth {
        self.width
    }

    /// Size in bytes.
    pub fn byte_len(&self) -> usize {
        self.width.words() * 2
    }

    /// Decode a little-endian register value from raw bytes.
    pub fn decode(&self, bytes: &[u8]) -> Option<u32> {
        match self.width {
            RegisterWidth::Word => bytes
                .get(..2)
                .map(|b| u32::from(u16::from_le_bytes([b[0], b[1]]))),
            RegisterWidth::DoubleWord => bytes
                .get(..4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        }
    }
}

bitflags! {
    /// Schedule control word, shared by every schedule block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SchedCtrl: u32 {
        /// Schedule is running; cleared by the device on countdown completion
        const RUNNING = 0x0000_0001;
        /// Rate value is updates per video frame
        const RATE_VIDEO = 0x0000_0010;
        /// Rate value is an update period in nanoseconds
        const RATE_NANO = 0x0000_0020;
        /// Rate unit field
        const RATE_MASK = Self::RATE_VIDEO.bits() | Self::RATE_NANO.bits();
        /// Count decrements and the device halts at zero
        const COUNTDOWN = 0x0000_0100;
        /// Prefix each acquired sample with a device timetag
        const LOG_TIMETAG = 0x0001_0000;
    }
}

bitflags! {
    /// Input routing and conditioning word of a schedule block.
    ///
    /// Unlike the control word these switches are not schedule timing, so
    /// they are written to the device as soon as they change.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IoCtrl: u32 {
        /// Feed the matching output back into this input (DAC → ADC,
        /// DOUT → DIN, AUD → MIC)
        const LOOPBACK = 0x0001;
        /// ADC converts continuously, without a running schedule
        const FREE_RUN = 0x0002;
        /// DIN acquires only on input transitions
        const LOG_EVENTS = 0x0004;
        /// DIN ignores transitions shorter than 30 µs
        const DEBOUNCE = 0x0008;
        /// DIN waits for inputs to settle before logging an event
        const STABILIZE = 0x0010;
    }
}

/// Registers outside the schedule blocks.
#[derive(Debug, Clone, Copy)]
pub struct SystemRegisters;

impl SystemRegisters {
    /// Link id of the persona answering on this register file.
    pub const DEVICE_ID: Register = Register::word(0x000);
    /// Video frames seen by the device; advances at every vertical sync.
    pub const FRAME_COUNT: Register = Register::double_word(0x004);
    /// Digital output bits.
    pub const DOUT_VALUE: Register = Register::double_word(0x1D4);
    /// Digital input bits.
    pub const DIN_VALUE: Register = Register::double_word(0x1D8);

    const DAC_VALUES: u16 = 0x190;
    const ADC_VALUES: u16 = 0x1B0;

    /// Instantaneous value of analog output `channel` (0..16).
    pub fn dac_value(channel: u32) -> Register {
        Register::word(Self::DAC_VALUES + 2 * (channel as u16))
    }

    /// Instantaneous value of analog input `channel` (0..18).
    pub fn adc_value(channel: u32) -> Register {
        Register::word(Self::ADC_VALUES + 2 * (channel as u16))
    }
}

/// Register block of one schedule subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScheduleBlock {
    base: u16,
}

impl ScheduleBlock {
    /// Distance between consecutive blocks.
    pub const STRIDE: u16 = 0x30;
    /// First block offset.
    pub const FIRST: u16 = 0x40;

    const BUFF_BASE: u16 = 0x00;
    const BUFF_CURSOR: u16 = 0x04;
    const BUFF_SIZE: u16 = 0x08;
    const SCHED_ONSET: u16 = 0x0C;
    const SCHED_RATE: u16 = 0x10;
    const SCHED_COUNT: u16 = 0x14;
    const SCHED_CTRL: u16 = 0x18;
    const CHAN_SEL: u16 = 0x1C;
    const CHAN_REF: u16 = 0x20;
    const IO_CTRL: u16 = 0x24;

    /// Block number `index` in the register file.
    pub const fn nth(index: u16) -> Self {
        Self {
            base: Self::FIRST + index * Self::STRIDE,
        }
    }

    /// Byte offset of the block.
    pub fn base(&self) -> u16 {
        self.base
    }

    /// Ring buffer base address.
    pub fn buffer_base(&self) -> Register {
        Register::double_word(self.base + Self::BUFF_BASE)
    }

    /// Ring buffer cursor (read address for sinks, write address for sources).
    pub fn buffer_cursor(&self) -> Register {
        Register::double_word(self.base + Self::BUFF_CURSOR)
    }

    /// Ring buffer size in bytes.
    pub fn buffer_size(&self) -> Register {
        Register::double_word(self.base + Self::BUFF_SIZE)
    }

    /// Delay between start and first tick, in nanoseconds.
    pub fn onset(&self) -> Register {
        Register::double_word(self.base + Self::SCHED_ONSET)
    }

    /// Rate value, interpreted through the rate unit bits of the control word.
    pub fn rate(&self) -> Register {
        Register::double_word(self.base + Self::SCHED_RATE)
    }

    /// Tick counter.
    pub fn count(&self) -> Register {
        Register::double_word(self.base + Self::SCHED_COUNT)
    }

    /// Control word, see [`SchedCtrl`].
    pub fn ctrl(&self) -> Register {
        Register::double_word(self.base + Self::SCHED_CTRL)
    }

    /// Buffered channel enable mask, one bit per channel.
    pub fn channel_select(&self) -> Register {
        Register::word(self.base + Self::CHAN_SEL)
    }

    /// Channel references, two bits per buffered channel.
    pub fn channel_reference(&self) -> Register {
        Register::double_word(self.base + Self::CHAN_REF)
    }

    /// Input routing and conditioning, see [`IoCtrl`].
    pub fn io_ctrl(&self) -> Register {
        Register::word(self.base + Self::IO_CTRL)
    }
}

/// Host-side mirror of the register file with per-word dirty tracking.
#[derive(Debug, Clone)]
pub struct RegisterCache {
    words: Vec<u16>,
    dirty: Vec<bool>,
}

impl Default for RegisterCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterCache {
    /// Create a zeroed, clean cache.
    pub fn new() -> Self {
        Self {
            words: vec![0; REGISTER_FILE_WORDS],
            dirty: vec![false; REGISTER_FILE_WORDS],
        }
    }

    fn word_index(&self, reg: Register) -> Result<usize> {
        let offset = reg.offset();
        if offset % 2 != 0 {
            return Err(PixxError::InvalidRegister {
                offset,
                reason: "register offset must be even".to_string(),
            });
        }
        if reg.width() == RegisterWidth::DoubleWord && offset % 4 != 0 {
            return Err(PixxError::InvalidRegister {
                offset,
                reason: "32-bit register must be 4-byte aligned".to_string(),
            });
        }
        if usize::from(offset) + reg.byte_len() > usize::from(REGISTER_FILE_BYTES) {
            return Err(PixxError::InvalidRegister {
                offset,
                reason: format!("beyond register file end {:#05x}", REGISTER_FILE_BYTES),
            });
        }
        Ok(usize::from(offset) / 2)
    }

    /// Write a register into the cache and mark it dirty.
    ///
    /// The word is marked dirty even when the value is unchanged, so the next
    /// commit always resends it.
    pub fn set(&mut self, reg: Register, value: u32) -> Result<()> {
        let index = self.word_index(reg)?;
        let max = reg.width().max_value();
        if value > max {
            return Err(PixxError::out_of_range(
                format!("register {:#05x} value", reg.offset()),
                u64::from(value),
                0,
                u64::from(max),
            ));
        }

        self.words[index] = value as u16;
        self.dirty[index] = true;
        if reg.width() == RegisterWidth::DoubleWord {
            self.words[index + 1] = (value >> 16) as u16;
            self.dirty[index + 1] = true;
        }
        Ok(())
    }

    /// Read a register from the cache.
    pub fn get(&self, reg: Register) -> Result<u32> {
        let index = self.word_index(reg)?;
        let low = u32::from(self.words[index]);
        Ok(match reg.width() {
            RegisterWidth::Word => low,
            RegisterWidth::DoubleWord => low | (u32::from(self.words[index + 1]) << 16),
        })
    }

    /// Check whether any word of the register is waiting to be committed.
    pub fn is_dirty(&self, reg: Register) -> Result<bool> {
        let index = self.word_index(reg)?;
        Ok(self.dirty[index..index + reg.width().words()]
            .iter()
            .any(|&d| d))
    }

    /// Number of dirty words.
    pub fn dirty_count(&self) -> usize {
        self.dirty.iter().filter(|&&d| d).count()
    }

    /// Record a value read live from the device without dirtying the cache.
    ///
    /// Words with a pending write keep their pending value.
    pub(crate) fn store_clean(&mut self, reg: Register, value: u32) -> Result<()> {
        let index = self.word_index(reg)?;
        let halves = [value as u16, (value >> 16) as u16];
        for (i, half) in halves.iter().take(reg.width().words()).enumerate() {
            if !self.dirty[index + i] {
                self.words[index + i] = *half;
            }
        }
        Ok(())
    }

    /// Record a value that was written to the device directly.
    ///
    /// Any pending write to the same words is superseded and cleared.
    pub(crate) fn store_committed(&mut self, reg: Register, value: u32) -> Result<()> {
        self.set(reg, value)?;
        let index = self.word_index(reg)?;
        for d in &mut self.dirty[index..index + reg.width().words()] {
            *d = false;
        }
        Ok(())
    }

    /// Contiguous runs of dirty word indices, ascending.
    fn dirty_runs(&self) -> Vec<Range<usize>> {
        let mut runs = Vec::new();
        let mut start = None;
        for (i, &dirty) in self.dirty.iter().enumerate() {
            match (dirty, start) {
                (true, None) => start = Some(i),
                (false, Some(s)) => {
                    runs.push(s..i);
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = start {
            runs.push(s..self.dirty.len());
        }
        runs
    }

    /// Push dirty registers to the device.
    ///
    /// Each contiguous run of dirty words goes out as one link write, in
    /// ascending address order. Returns the number of words written.
    ///
    /// # Errors
    ///
    /// On a link failure the failing run and every later run stay dirty so a
    /// retry resends exactly what the device has not confirmed. Runs accepted
    /// before the failure are not rolled back.
    pub fn commit(&mut self, link: &mut dyn Link, mode: CommitMode) -> Result<usize> {
        let runs = self.dirty_runs();
        let mut written = 0;

        for run in runs {
            let offset = (run.start * 2) as u16;
            let bytes: Vec<u8> = self.words[run.clone()]
                .iter()
                .flat_map(|w| w.to_le_bytes())
                .collect();

            if let Err(e) = link.write(Region::registers_with(offset, mode), &bytes) {
                warn!(
                    offset = format_args!("{:#05x}", offset),
                    written,
                    pending = self.dirty_count(),
                    error = %e,
                    "Register commit interrupted; unconfirmed registers stay dirty"
                );
                return Err(e.into());
            }

            for d in &mut self.dirty[run.clone()] {
                *d = false;
            }
            written += run.len();
        }

        if written > 0 {
            debug!(words = written, ?mode, "Committed register cache");
        }
        Ok(written)
    }

    /// Pull the device register file into the cache.
    ///
    /// Dirty words keep their pending value so a refresh never discards a
    /// write that has not been committed yet.
    pub fn refresh(&mut self, link: &mut dyn Link) -> Result<()> {
        let bytes = link.read(Region::registers(0), usize::from(REGISTER_FILE_BYTES))?;
        if bytes.len() != usize::from(REGISTER_FILE_BYTES) {
            return Err(PixxError::Link(crate::error::LinkError::Rejected {
                message: format!(
                    "short register read: {} of {} bytes",
                    bytes.len(),
                    REGISTER_FILE_BYTES
                ),
            }));
        }

        for (i, chunk) in bytes.chunks_exact(2).enumerate() {
            if !self.dirty[i] {
                self.words[i] = u16::from_le_bytes([chunk[0], chunk[1]]);
            }
        }
        debug!(bytes = bytes.len(), "Refreshed register cache");
        Ok(())
    }
}
