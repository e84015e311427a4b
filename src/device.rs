//! Persona handle owning the register cache and RAM access.
//!
//! A [`Device`] is one persona reached through a shared [`DeviceSelector`].
//! It owns that persona's [`RegisterCache`], tracks which schedule subsystems
//! are claimed by a live controller, and hands out the typed schedules.
//!
//! # Thread Safety
//!
//! `Device` is `Send` and `Sync` and cheap to clone. Link traffic goes
//! through the selector lock; the register cache has its own lock, always
//! taken after the selector lock. Host-side validation takes neither.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::PixxConfig;
use crate::error::{LinkError, PixxError, Result};
use crate::facades::{
    AdcSchedule, AudioAuxSchedule, AudioOutSchedule, DacSchedule, DinSchedule, DoutSchedule,
    MicSchedule, Schedule,
};
use crate::link::{Link, Region};
use crate::persona::{Persona, PersonaKind};
use crate::registers::{CommitMode, Register, RegisterCache, SystemRegisters};
use crate::selector::{DeviceSelector, LinkSession};
use crate::subsystem::SubsystemKind;

/// Internal state shared between a device and its schedules.
struct DeviceInner {
    persona: Persona,
    selector: DeviceSelector,
    cache: Mutex<RegisterCache>,
    claimed: Mutex<HashSet<SubsystemKind>>,
    commit_mode: CommitMode,
}

/// Handle to one persona on a shared link.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    /// Open a persona and load its register file into the cache.
    ///
    /// Commits made without an explicit mode use [`CommitMode::Immediate`].
    ///
    /// # Errors
    ///
    /// Returns a link error if the persona cannot be selected or its
    /// registers cannot be read.
    pub fn open(selector: &DeviceSelector, persona: Persona) -> Result<Self> {
        Self::open_with(selector, persona, CommitMode::Immediate)
    }

    /// Open a persona with a default commit mode for schedule start/stop.
    ///
    /// # Errors
    ///
    /// Returns [`PixxError::PersonaMismatch`] if the register file reports a
    /// different device id than `persona` expects.
    pub fn open_with(
        selector: &DeviceSelector,
        persona: Persona,
        commit_mode: CommitMode,
    ) -> Result<Self> {
        let device = Self {
            inner: Arc::new(DeviceInner {
                persona,
                selector: selector.clone(),
                cache: Mutex::new(RegisterCache::new()),
                claimed: Mutex::new(HashSet::new()),
                commit_mode,
            }),
        };
        device.refresh()?;
        device.check_identity()?;

        info!(
            persona = %device.kind(),
            ram_size = device.ram_size(),
            subsystems = device.inner.persona.subsystems().len(),
            "Opened device"
        );
        Ok(device)
    }

    /// Open the persona profile `kind` described by a loaded configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PixxError::Config`] if the profile is missing or disabled.
    pub fn from_config(
        selector: &DeviceSelector,
        config: &PixxConfig,
        kind: PersonaKind,
    ) -> Result<Self> {
        let persona = config.persona(kind)?;
        Self::open_with(selector, persona, config.link.commit_mode)
    }

    fn check_identity(&self) -> Result<()> {
        let id = self.with_cache(|cache| cache.get(SystemRegisters::DEVICE_ID))? as u16;
        let expected = self.kind();
        if id != u16::from(expected.link_id()) {
            let found = u8::try_from(id).ok().and_then(PersonaKind::from_link_id);
            warn!(persona = %expected, id, found = ?found, "Device id does not match persona");
            return Err(PixxError::PersonaMismatch { expected, id });
        }
        Ok(())
    }

    /// Frame counter, incremented by the device at every vertical sync.
    pub fn frame_count(&self) -> Result<u32> {
        self.read_live(SystemRegisters::FRAME_COUNT)
    }

    /// Persona description.
    pub fn persona(&self) -> &Persona {
        &self.inner.persona
    }

    /// Persona identity.
    pub fn kind(&self) -> PersonaKind {
        self.inner.persona.kind()
    }

    /// Device RAM size in bytes.
    pub fn ram_size(&self) -> u32 {
        self.inner.persona.ram_size()
    }

    /// Check whether the persona has a subsystem.
    pub fn supports(&self, kind: SubsystemKind) -> bool {
        self.inner.persona.supports(kind)
    }

    /// Commit mode used by schedule start/stop.
    pub fn commit_mode(&self) -> CommitMode {
        self.inner.commit_mode
    }

    /// Selector this device shares its link through.
    pub fn selector(&self) -> &DeviceSelector {
        &self.inner.selector
    }

    /// Push every dirty register to the device. Returns the words written.
    pub fn commit(&self, mode: CommitMode) -> Result<usize> {
        self.with_link(|link| self.inner.cache.lock().commit(link, mode))
    }

    /// Reload the register cache from the device, keeping pending writes.
    pub fn refresh(&self) -> Result<()> {
        self.with_link(|link| self.inner.cache.lock().refresh(link))
    }

    /// Number of cached register words waiting to be committed.
    pub fn dirty_count(&self) -> usize {
        self.inner.cache.lock().dirty_count()
    }

    fn check_ram_span(&self, addr: u32, len: usize) -> Result<()> {
        if addr % 2 != 0 {
            return Err(PixxError::InvalidAddress {
                addr,
                reason: "RAM address must be even".to_string(),
            });
        }
        let size = u32::try_from(len).map_err(|_| PixxError::InvalidSize {
            size: u32::MAX,
            reason: "transfer larger than 4 GiB".to_string(),
        })?;
        if size % 2 != 0 {
            return Err(PixxError::InvalidSize {
                size,
                reason: "RAM transfer length must be even".to_string(),
            });
        }
        if u64::from(addr) + u64::from(size) > u64::from(self.ram_size()) {
            return Err(PixxError::InvalidAddress {
                addr,
                reason: format!(
                    "{} bytes at {:#x} exceed device RAM of {:#x} bytes",
                    size,
                    addr,
                    self.ram_size()
                ),
            });
        }
        Ok(())
    }

    /// Copy host data into device RAM, typically to fill a sink's buffer.
    pub fn write_ram(&self, addr: u32, data: &[u8]) -> Result<()> {
        self.check_ram_span(addr, data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        self.with_link(|link| Ok(link.write(Region::ram(addr), data)?))?;
        debug!(addr = format_args!("{:#x}", addr), len = data.len(), "Wrote device RAM");
        Ok(())
    }

    /// Copy device RAM to the host, typically to drain a source's buffer.
    pub fn read_ram(&self, addr: u32, len: usize) -> Result<Bytes> {
        self.check_ram_span(addr, len)?;
        if len == 0 {
            return Ok(Bytes::new());
        }
        let bytes = self.with_link(|link| Ok(link.read(Region::ram(addr), len)?))?;
        if bytes.len() != len {
            return Err(LinkError::Rejected {
                message: format!("short RAM read: {} of {} bytes", bytes.len(), len),
            }
            .into());
        }
        Ok(bytes)
    }

    /// Analog output schedule.
    pub fn dac(&self) -> Result<DacSchedule> {
        Schedule::open(self.clone())
    }

    /// Analog input schedule.
    pub fn adc(&self) -> Result<AdcSchedule> {
        Schedule::open(self.clone())
    }

    /// Digital output schedule.
    pub fn dout(&self) -> Result<DoutSchedule> {
        Schedule::open(self.clone())
    }

    /// Digital input schedule.
    pub fn din(&self) -> Result<DinSchedule> {
        Schedule::open(self.clone())
    }

    /// Audio output schedule.
    pub fn audio_out(&self) -> Result<AudioOutSchedule> {
        Schedule::open(self.clone())
    }

    /// Auxiliary audio output schedule.
    pub fn audio_aux(&self) -> Result<AudioAuxSchedule> {
        Schedule::open(self.clone())
    }

    /// Microphone input schedule.
    pub fn mic(&self) -> Result<MicSchedule> {
        Schedule::open(self.clone())
    }

    /// Run `f` against the link with this persona selected.
    pub(crate) fn with_link<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut LinkSession<'_>) -> Result<T>,
    {
        self.inner.selector.with_device(self.kind(), f)
    }

    /// Run `f` against the register cache without touching the link.
    pub(crate) fn with_cache<T>(&self, f: impl FnOnce(&mut RegisterCache) -> T) -> T {
        f(&mut self.inner.cache.lock())
    }

    /// Read one register from the device, bypassing the cache.
    ///
    /// The value is recorded in the cache unless a write to it is pending.
    pub(crate) fn read_live(&self, reg: Register) -> Result<u32> {
        self.with_link(|link| {
            let bytes = link.read(Region::registers(reg.offset()), reg.byte_len())?;
            let value = reg.decode(&bytes).ok_or_else(|| LinkError::Rejected {
                message: format!(
                    "short register read at {:#05x}: {} bytes",
                    reg.offset(),
                    bytes.len()
                ),
            })?;
            self.inner.cache.lock().store_clean(reg, value)?;
            Ok(value)
        })
    }

    /// Write one register to the device now, using the device commit mode.
    ///
    /// Pending writes to other registers stay pending.
    pub(crate) fn write_live(&self, reg: Register, value: u32) -> Result<()> {
        if value > reg.width().max_value() {
            return Err(PixxError::out_of_range(
                "register value",
                u64::from(value),
                0,
                u64::from(reg.width().max_value()),
            ));
        }
        let mode = self.commit_mode();
        self.with_link(|link| {
            let bytes = value.to_le_bytes();
            link.write(
                Region::registers_with(reg.offset(), mode),
                &bytes[..reg.byte_len()],
            )?;
            self.inner.cache.lock().store_committed(reg, value)
        })?;
        debug!(
            persona = %self.kind(),
            offset = format_args!("{:#05x}", reg.offset()),
            value,
            "Wrote register"
        );
        Ok(())
    }

    /// Mark a subsystem as owned by a controller.
    pub(crate) fn claim(&self, kind: SubsystemKind) -> Result<()> {
        if !self.supports(kind) {
            return Err(PixxError::NotSupported {
                message: format!("{} has no {} subsystem", self.kind(), kind),
            });
        }
        if !self.inner.claimed.lock().insert(kind) {
            return Err(PixxError::SubsystemBusy {
                persona: self.kind(),
                subsystem: kind,
            });
        }
        debug!(persona = %self.kind(), subsystem = %kind, "Claimed subsystem");
        Ok(())
    }

    /// Release a subsystem claimed with [`claim`](Self::claim).
    pub(crate) fn release(&self, kind: SubsystemKind) {
        if self.inner.claimed.lock().remove(&kind) {
            debug!(persona = %self.kind(), subsystem = %kind, "Released subsystem");
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("persona", &self.kind())
            .field("ram_size", &self.ram_size())
            .field("commit_mode", &self.commit_mode())
            .field("dirty_words", &self.dirty_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockHandle, MockLink};
    use crate::registers::ScheduleBlock;

    const RAM: u32 = 0x10000;

    fn open_datapixx(subsystems: &[SubsystemKind]) -> (Device, MockHandle) {
        let link = MockLink::new().with_persona(PersonaKind::DataPixx, RAM);
        let handle = link.handle();
        let selector = DeviceSelector::new(link);
        let persona = Persona::new(PersonaKind::DataPixx, RAM, subsystems.iter().copied()).unwrap();
        (Device::open(&selector, persona).unwrap(), handle)
    }

    #[test]
    fn test_open_loads_registers() {
        let link = MockLink::new().with_persona(PersonaKind::DataPixx, RAM);
        let handle = link.handle();
        let block = ScheduleBlock::nth(0);
        handle.poke_register(PersonaKind::DataPixx, block.rate(), 48_000);

        let selector = DeviceSelector::new(link);
        let device = Device::open(
            &selector,
            Persona::with_all_subsystems(PersonaKind::DataPixx, RAM).unwrap(),
        )
        .unwrap();

        let rate = device.with_cache(|cache| cache.get(block.rate())).unwrap();
        assert_eq!(rate, 48_000);
        assert_eq!(device.dirty_count(), 0);
    }

    #[test]
    fn test_ram_round_trip() {
        let (device, handle) = open_datapixx(&[]);
        device.write_ram(0x100, &[1, 2, 3, 4]).unwrap();
        assert_eq!(handle.ram(PersonaKind::DataPixx, 0x100, 4), vec![1, 2, 3, 4]);
        assert_eq!(&device.read_ram(0x100, 4).unwrap()[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_ram_validation_has_no_io() {
        let (device, handle) = open_datapixx(&[]);
        handle.clear_calls();

        assert!(matches!(
            device.write_ram(0x101, &[0, 0]),
            Err(PixxError::InvalidAddress { .. })
        ));
        assert!(matches!(
            device.write_ram(0x100, &[0, 0, 0]),
            Err(PixxError::InvalidSize { size: 3, .. })
        ));
        assert!(matches!(
            device.read_ram(RAM - 2, 4),
            Err(PixxError::InvalidAddress { .. })
        ));
        assert!(handle.calls().is_empty());
    }

    #[test]
    fn test_missing_subsystem_not_supported() {
        let (device, _) = open_datapixx(&[SubsystemKind::Dac]);
        assert!(matches!(device.mic(), Err(PixxError::NotSupported { .. })));
        assert!(device.dac().is_ok());
    }

    #[test]
    fn test_claim_released_on_drop() {
        let (device, _) = open_datapixx(&[SubsystemKind::Adc]);
        let adc = device.adc().unwrap();
        assert!(matches!(
            device.adc(),
            Err(PixxError::SubsystemBusy {
                subsystem: SubsystemKind::Adc,
                ..
            })
        ));
        drop(adc);
        assert!(device.adc().is_ok());
    }

    #[test]
    fn test_open_rejects_other_persona_id() {
        let link = MockLink::new().with_persona(PersonaKind::DataPixx, RAM);
        let handle = link.handle();
        handle.poke_register(
            PersonaKind::DataPixx,
            SystemRegisters::DEVICE_ID,
            u32::from(PersonaKind::ViewPixx.link_id()),
        );

        let selector = DeviceSelector::new(link);
        let persona = Persona::with_all_subsystems(PersonaKind::DataPixx, RAM).unwrap();
        let err = Device::open(&selector, persona).unwrap_err();
        assert!(matches!(
            err,
            PixxError::PersonaMismatch {
                expected: PersonaKind::DataPixx,
                id,
            } if id == u16::from(PersonaKind::ViewPixx.link_id())
        ));
    }

    #[test]
    fn test_write_live_keeps_other_pending_writes() {
        let (device, handle) = open_datapixx(&[]);
        let pending = ScheduleBlock::nth(0).rate();
        let live = SystemRegisters::dac_value(2);
        device.with_cache(|c| c.set(pending, 1000)).unwrap();
        handle.clear_calls();

        device.write_live(live, 0xBEEF).unwrap();
        assert_eq!(handle.register(PersonaKind::DataPixx, live.offset()) & 0xFFFF, 0xBEEF);
        assert_eq!(handle.register(PersonaKind::DataPixx, pending.offset()), 0);
        assert!(device.with_cache(|c| c.is_dirty(pending)).unwrap());
        assert!(!device.with_cache(|c| c.is_dirty(live)).unwrap());
        assert_eq!(handle.write_count(), 1);

        assert!(matches!(
            device.write_live(live, 0x1_0000),
            Err(PixxError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_frame_count_follows_vertical_sync() {
        let (device, handle) = open_datapixx(&[]);
        assert_eq!(device.frame_count().unwrap(), 0);
        handle.vertical_sync();
        assert_eq!(device.frame_count().unwrap(), 1);
    }

    #[test]
    fn test_read_live_updates_clean_cache() {
        let (device, handle) = open_datapixx(&[]);
        let reg = ScheduleBlock::nth(2).count();
        handle.poke_register(PersonaKind::DataPixx, reg, 77);

        assert_eq!(device.read_live(reg).unwrap(), 77);
        assert_eq!(device.with_cache(|c| c.get(reg)).unwrap(), 77);
        assert!(!device.with_cache(|c| c.is_dirty(reg)).unwrap());
    }
}
