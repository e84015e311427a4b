//! Simulated multi-persona hardware for tests and offline development.
//!
//! [`MockLink`] implements [`Link`] against an in-memory model of one or more
//! personas: a register file and RAM per persona, a selected-persona latch,
//! and a schedule clock driven explicitly through [`MockHandle::advance_ticks`].
//! It provides:
//! - Call logging for test verification
//! - One-shot failure injection for writes and persona selects
//! - Vertical-sync latching of register writes and a frame counter
//! - Input loopback from the DAC and digital output value registers
//!
//! The link and its handles share state, so a test can keep a [`MockHandle`]
//! after moving the link into a [`DeviceSelector`](crate::selector::DeviceSelector).
//!
//! # Example
//!
//! ```
//! use pixx_sched::mock::MockLink;
//! use pixx_sched::persona::PersonaKind;
//! use pixx_sched::selector::DeviceSelector;
//!
//! let link = MockLink::new().with_persona(PersonaKind::DataPixx, 0x10000);
//! let handle = link.handle();
//! let selector = DeviceSelector::new(link);
//!
//! selector.with_device(PersonaKind::DataPixx, |_| Ok(())).unwrap();
//! assert_eq!(handle.selected(), Some(PersonaKind::DataPixx));
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use crate::buffer::RingBufferDescriptor;
use crate::error::LinkError;
use crate::link::{Link, Region};
use crate::persona::PersonaKind;
use crate::registers::{
    CommitMode, IoCtrl, Register, SchedCtrl, SystemRegisters, REGISTER_FILE_BYTES,
};
use crate::subsystem::{Direction, SubsystemKind};

/// One transfer seen by the mock, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCall {
    /// Persona select request
    Select(PersonaKind),
    /// Write to the selected persona
    Write {
        /// Persona selected at the time, if any
        persona: Option<PersonaKind>,
        /// Target region
        region: Region,
        /// Payload length in bytes
        len: usize,
    },
    /// Read from the selected persona
    Read {
        /// Persona selected at the time, if any
        persona: Option<PersonaKind>,
        /// Source region
        region: Region,
        /// Requested length in bytes
        len: usize,
    },
}

struct PersonaMemory {
    registers: Vec<u16>,
    ram: Vec<u8>,
}

impl PersonaMemory {
    fn new(persona: PersonaKind, ram_size: u32) -> Self {
        let mut memory = Self {
            registers: vec![0; usize::from(REGISTER_FILE_BYTES) / 2],
            ram: vec![0; ram_size as usize],
        };
        memory.set_reg(SystemRegisters::DEVICE_ID, u32::from(persona.link_id()));
        memory
    }

    fn reg(&self, reg: Register) -> u32 {
        let index = usize::from(reg.offset()) / 2;
        let low = u32::from(self.registers[index]);
        if reg.byte_len() == 4 {
            low | (u32::from(self.registers[index + 1]) << 16)
        } else {
            low
        }
    }

    fn set_reg(&mut self, reg: Register, value: u32) {
        let index = usize::from(reg.offset()) / 2;
        self.registers[index] = value as u16;
        if reg.byte_len() == 4 {
            self.registers[index + 1] = (value >> 16) as u16;
        }
    }

    fn write_registers(&mut self, offset: u16, bytes: &[u8]) {
        let start = usize::from(offset) / 2;
        for (i, chunk) in bytes.chunks_exact(2).enumerate() {
            self.registers[start + i] = u16::from_le_bytes([chunk[0], chunk[1]]);
        }
    }

    fn io_ctrl(&self, kind: SubsystemKind) -> IoCtrl {
        IoCtrl::from_bits_retain(self.reg(kind.descriptor().block.io_ctrl()))
    }

    // Inputs in loopback see the matching outputs instead of their connectors.
    fn apply_loopback(&mut self) {
        if self.io_ctrl(SubsystemKind::Adc).contains(IoCtrl::LOOPBACK) {
            for ch in 0..SubsystemKind::Dac.descriptor().channels {
                let value = self.reg(SystemRegisters::dac_value(ch));
                self.set_reg(SystemRegisters::adc_value(ch), value);
            }
        }
        if self.io_ctrl(SubsystemKind::Din).contains(IoCtrl::LOOPBACK) {
            let value = self.reg(SystemRegisters::DOUT_VALUE) & 0x00FF_FFFF;
            self.set_reg(SystemRegisters::DIN_VALUE, value);
        }
    }

    fn tick(&mut self, kind: SubsystemKind, ticks: u64) {
        let sub = kind.descriptor();
        let block = sub.block;
        let ctrl = SchedCtrl::from_bits_retain(self.reg(block.ctrl()));
        if !ctrl.contains(SchedCtrl::RUNNING) || ticks == 0 {
            return;
        }

        let count = self.reg(block.count());
        let elapsed = if ctrl.contains(SchedCtrl::COUNTDOWN) && count > 0 {
            let elapsed = ticks.min(u64::from(count));
            let remaining = count - elapsed as u32;
            self.set_reg(block.count(), remaining);
            if remaining == 0 {
                self.set_reg(block.ctrl(), (ctrl - SchedCtrl::RUNNING).bits());
                debug!(subsystem = %kind, "Mock schedule countdown complete");
            }
            elapsed
        } else {
            // Free-run, including countdown with count 0
            self.set_reg(block.count(), count.wrapping_add(ticks as u32));
            ticks
        };

        let mask = if sub.has_channel_mask() {
            self.reg(block.channel_select()) & ((1u32 << sub.buffered_channels) - 1)
        } else {
            0
        };
        let per_tick =
            sub.bytes_per_tick(mask.count_ones(), ctrl.contains(SchedCtrl::LOG_TIMETAG));
        let buffer = RingBufferDescriptor::from_raw(
            self.reg(block.buffer_base()),
            self.reg(block.buffer_size()),
            self.reg(block.buffer_cursor()),
            self.ram.len() as u32,
        );
        if !buffer.is_configured()
            || per_tick == 0
            || buffer.base() % 2 != 0
            || buffer.size() % 2 != 0
            || buffer.end() > self.ram.len() as u64
            || buffer.cursor() % 2 != 0
            || !buffer.contains(buffer.cursor())
        {
            return;
        }

        let moved = elapsed * u64::from(per_tick);
        if sub.direction == Direction::Source {
            self.fill_pattern(&buffer, moved);
        }
        self.set_reg(block.buffer_cursor(), buffer.advance(moved));
    }

    // Sources write a running word counter, so tests can tell fresh data from
    // stale RAM. Only the last buffer-full of words is materialized.
    fn fill_pattern(&mut self, buffer: &RingBufferDescriptor, moved: u64) {
        let span = moved.min(u64::from(buffer.size())) & !1;
        let skipped = moved - span;
        for i in (0..span).step_by(2) {
            let addr = buffer.advance(skipped + i) as usize;
            let word = (((skipped + i) / 2) as u16).to_le_bytes();
            self.ram[addr..addr + 2].copy_from_slice(&word);
        }
    }
}

struct PendingWrite {
    persona: PersonaKind,
    offset: u16,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct MockHardware {
    personas: BTreeMap<PersonaKind, PersonaMemory>,
    selected: Option<PersonaKind>,
    calls: Vec<LinkCall>,
    pending_vsync: Vec<PendingWrite>,
    writes_before_fault: Option<usize>,
    fail_next_select: bool,
    disconnected: bool,
}

impl MockHardware {
    fn check_connected(&self) -> Result<(), LinkError> {
        if self.disconnected {
            Err(LinkError::Disconnected)
        } else {
            Ok(())
        }
    }

    fn selected_persona(&self) -> Result<PersonaKind, LinkError> {
        self.selected.ok_or_else(|| LinkError::Rejected {
            message: "no persona selected".to_string(),
        })
    }

    fn memory_mut(&mut self, persona: PersonaKind) -> Result<&mut PersonaMemory, LinkError> {
        self.personas
            .get_mut(&persona)
            .ok_or(LinkError::UnknownPersona { persona })
    }
}

fn check_register_span(offset: u16, len: usize) -> Result<(), LinkError> {
    if offset % 2 != 0 || len % 2 != 0 || usize::from(offset) + len > usize::from(REGISTER_FILE_BYTES)
    {
        return Err(LinkError::Rejected {
            message: format!("register span {:#05x}+{} out of range", offset, len),
        });
    }
    Ok(())
}

fn check_ram_span(addr: u32, len: usize, ram_len: usize) -> Result<usize, LinkError> {
    let start = addr as usize;
    if start + len > ram_len {
        return Err(LinkError::Rejected {
            message: format!("RAM span {:#x}+{} beyond {:#x}", addr, len, ram_len),
        });
    }
    Ok(start)
}

/// Simulated link to one or more personas.
#[derive(Clone, Default)]
pub struct MockLink {
    hw: Arc<Mutex<MockHardware>>,
}

impl MockLink {
    /// Create a link with no personas attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a persona with `ram_size` bytes of zeroed RAM.
    pub fn with_persona(self, persona: PersonaKind, ram_size: u32) -> Self {
        self.hw
            .lock()
            .personas
            .insert(persona, PersonaMemory::new(persona, ram_size));
        self
    }

    /// Test-side handle sharing this link's hardware state.
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            hw: Arc::clone(&self.hw),
        }
    }
}

impl Link for MockLink {
    fn write(&mut self, region: Region, bytes: &[u8]) -> Result<(), LinkError> {
        let mut hw = self.hw.lock();
        let selected = hw.selected;
        hw.calls.push(LinkCall::Write {
            persona: selected,
            region,
            len: bytes.len(),
        });
        hw.check_connected()?;

        if let Some(remaining) = hw.writes_before_fault {
            if remaining == 0 {
                hw.writes_before_fault = None;
                return Err(LinkError::Rejected {
                    message: "injected write failure".to_string(),
                });
            }
            hw.writes_before_fault = Some(remaining - 1);
        }

        let persona = hw.selected_persona()?;
        match region {
            Region::Registers { offset, mode } => {
                check_register_span(offset, bytes.len())?;
                match mode {
                    CommitMode::Immediate => hw.memory_mut(persona)?.write_registers(offset, bytes),
                    CommitMode::AtVerticalSync => hw.pending_vsync.push(PendingWrite {
                        persona,
                        offset,
                        bytes: bytes.to_vec(),
                    }),
                }
            }
            Region::Ram { addr } => {
                let memory = hw.memory_mut(persona)?;
                let start = check_ram_span(addr, bytes.len(), memory.ram.len())?;
                memory.ram[start..start + bytes.len()].copy_from_slice(bytes);
            }
        }
        Ok(())
    }

    fn read(&mut self, region: Region, len: usize) -> Result<Bytes, LinkError> {
        let mut hw = self.hw.lock();
        let selected = hw.selected;
        hw.calls.push(LinkCall::Read {
            persona: selected,
            region,
            len,
        });
        hw.check_connected()?;

        let persona = hw.selected_persona()?;
        let memory = hw.memory_mut(persona)?;
        match region {
            Region::Registers { offset, .. } => {
                check_register_span(offset, len)?;
                memory.apply_loopback();
                let start = usize::from(offset) / 2;
                let bytes: Vec<u8> = memory.registers[start..start + len / 2]
                    .iter()
                    .flat_map(|w| w.to_le_bytes())
                    .collect();
                Ok(Bytes::from(bytes))
            }
            Region::Ram { addr } => {
                let start = check_ram_span(addr, len, memory.ram.len())?;
                Ok(Bytes::copy_from_slice(&memory.ram[start..start + len]))
            }
        }
    }

    fn select_persona(&mut self, persona: PersonaKind) -> Result<(), LinkError> {
        let mut hw = self.hw.lock();
        hw.calls.push(LinkCall::Select(persona));
        hw.check_connected()?;

        if hw.fail_next_select {
            hw.fail_next_select = false;
            return Err(LinkError::Timeout { timeout_ms: 1000 });
        }
        if !hw.personas.contains_key(&persona) {
            return Err(LinkError::UnknownPersona { persona });
        }
        hw.selected = Some(persona);
        Ok(())
    }
}

/// Test-side control over a [`MockLink`]'s hardware.
#[derive(Clone)]
pub struct MockHandle {
    hw: Arc<Mutex<MockHardware>>,
}

impl MockHandle {
    /// Run every running schedule of `persona` for `ticks` ticks.
    ///
    /// Countdown schedules stop by themselves when their count reaches zero.
    /// Onset delays are not simulated.
    pub fn advance_ticks(&self, persona: PersonaKind, ticks: u64) {
        let mut hw = self.hw.lock();
        if let Some(memory) = hw.personas.get_mut(&persona) {
            memory.apply_loopback();
            for kind in SubsystemKind::ALL {
                memory.tick(kind, ticks);
            }
        }
    }

    /// Apply register writes latched for vertical sync and count a frame.
    pub fn vertical_sync(&self) {
        let mut hw = self.hw.lock();
        let pending = std::mem::take(&mut hw.pending_vsync);
        for write in pending {
            if let Some(memory) = hw.personas.get_mut(&write.persona) {
                memory.write_registers(write.offset, &write.bytes);
            }
        }
        for memory in hw.personas.values_mut() {
            let frame = memory.reg(SystemRegisters::FRAME_COUNT);
            memory.set_reg(SystemRegisters::FRAME_COUNT, frame.wrapping_add(1));
        }
    }

    /// Number of register writes waiting for the next vertical sync.
    pub fn pending_vsync_writes(&self) -> usize {
        self.hw.lock().pending_vsync.len()
    }

    /// Raw 32-bit view of the register file at `offset` (low word first).
    ///
    /// Mask with `0xFFFF` to look at a single 16-bit register.
    pub fn register(&self, persona: PersonaKind, offset: u16) -> u32 {
        let hw = self.hw.lock();
        let Some(memory) = hw.personas.get(&persona) else {
            return 0;
        };
        let index = usize::from(offset) / 2;
        let low = memory.registers.get(index).copied().unwrap_or(0);
        let high = memory.registers.get(index + 1).copied().unwrap_or(0);
        u32::from(low) | (u32::from(high) << 16)
    }

    /// Overwrite a device register, as the hardware itself would.
    pub fn poke_register(&self, persona: PersonaKind, reg: Register, value: u32) {
        if let Some(memory) = self.hw.lock().personas.get_mut(&persona) {
            memory.set_reg(reg, value);
        }
    }

    /// Copy of `len` RAM bytes at `addr`.
    pub fn ram(&self, persona: PersonaKind, addr: u32, len: usize) -> Vec<u8> {
        let hw = self.hw.lock();
        hw.personas
            .get(&persona)
            .and_then(|m| m.ram.get(addr as usize..addr as usize + len))
            .map(<[u8]>::to_vec)
            .unwrap_or_default()
    }

    /// Persona the hardware currently routes transfers to.
    pub fn selected(&self) -> Option<PersonaKind> {
        self.hw.lock().selected
    }

    /// Every transfer since the last [`clear_calls`](Self::clear_calls).
    pub fn calls(&self) -> Vec<LinkCall> {
        self.hw.lock().calls.clone()
    }

    /// Clear the call log.
    pub fn clear_calls(&self) {
        self.hw.lock().calls.clear();
    }

    /// Number of logged writes.
    pub fn write_count(&self) -> usize {
        self.hw
            .lock()
            .calls
            .iter()
            .filter(|c| matches!(c, LinkCall::Write { .. }))
            .count()
    }

    /// Accept `n` more writes, then reject the next one. One-shot.
    pub fn fail_write_after(&self, n: usize) {
        self.hw.lock().writes_before_fault = Some(n);
    }

    /// Reject the next persona select with a timeout. One-shot.
    pub fn fail_next_select(&self) {
        self.hw.lock().fail_next_select = true;
    }

    /// Simulate unplugging or replugging the link.
    pub fn set_disconnected(&self, disconnected: bool) {
        self.hw.lock().disconnected = disconnected;
    }
}
