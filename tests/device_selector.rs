//! Persona selection on a shared link.
//!
//! # Test Coverage
//!
//! | Test | Description |
//! |------|-------------|
//! | `restores_after_closure_error` | Closure error wins, enclosing persona restored |
//! | `restores_after_panic` | Unwinding restores the enclosing persona |
//! | `nested_selection_is_a_stack` | Inner call restores the outer persona |
//! | `restore_failure_is_reported` | Successful closure, failed restore → error |
//! | `failed_select_skips_closure` | Closure not run, previous persona restored |
//! | `unknown_persona` | Selecting an absent persona fails |
//! | `threads_do_not_interleave` | Concurrent sessions stay contiguous |
//! | `devices_share_one_link` | Two personas' registers land where they belong |
//! | `disconnected_link` | Transfers fail with `Disconnected`, then recover |

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread;

use anyhow::Result;
use pixx_sched::mock::{LinkCall, MockHandle, MockLink};
use pixx_sched::{
    Device, DeviceSelector, Link, LinkError, Persona, PersonaKind, PixxError, Region,
};

const RAM: u32 = 0x1000;
const DATA: PersonaKind = PersonaKind::DataPixx;
const VIEW: PersonaKind = PersonaKind::ViewPixx;

// =============================================================================
// Helpers
// =============================================================================

fn selector() -> (DeviceSelector, MockHandle) {
    let link = MockLink::new()
        .with_persona(DATA, RAM)
        .with_persona(VIEW, RAM);
    let handle = link.handle();
    (DeviceSelector::new(link), handle)
}

/// Selector with DATA already selected.
fn selector_on_data() -> Result<(DeviceSelector, MockHandle)> {
    let (selector, handle) = selector();
    selector.with_device(DATA, |_| Ok(()))?;
    assert_eq!(handle.selected(), Some(DATA));
    Ok((selector, handle))
}

// =============================================================================
// Restoration
// =============================================================================

#[test]
fn restores_after_closure_error() -> Result<()> {
    let (selector, handle) = selector_on_data()?;

    let err = selector
        .with_device(VIEW, |session| -> pixx_sched::Result<()> {
            session.write(Region::ram(0x10), &[1, 2])?;
            Err(PixxError::NotSupported {
                message: "closure failed".to_string(),
            })
        })
        .unwrap_err();

    assert!(matches!(err, PixxError::NotSupported { .. }));
    assert_eq!(handle.selected(), Some(DATA));
    assert_eq!(selector.selected(), Some(DATA));
    assert_eq!(handle.ram(VIEW, 0x10, 2), vec![1, 2]);
    Ok(())
}

#[test]
fn restores_after_panic() -> Result<()> {
    let (selector, handle) = selector_on_data()?;

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        selector.with_device(VIEW, |_| -> pixx_sched::Result<()> {
            panic!("operation panicked");
        })
    }));
    assert!(outcome.is_err());
    assert_eq!(handle.selected(), Some(DATA));

    // The selector stays usable
    selector.with_device(VIEW, |session| Ok(session.write(Region::ram(0), &[7, 7])?))?;
    assert_eq!(handle.selected(), Some(DATA));
    Ok(())
}

#[test]
fn nested_selection_is_a_stack() -> Result<()> {
    let (selector, handle) = selector_on_data()?;
    handle.clear_calls();

    let inner_seen = selector.with_device(VIEW, |outer| {
        outer.write(Region::ram(0), &[1, 1])?;
        let seen = selector.with_device(DATA, |inner| {
            inner.write(Region::ram(0), &[2, 2])?;
            Ok(handle.selected())
        })?;
        // Back on VIEW for the rest of the outer session
        outer.write(Region::ram(2), &[3, 3])?;
        Ok(seen)
    })?;

    assert_eq!(inner_seen, Some(DATA));
    assert_eq!(handle.selected(), Some(DATA));
    assert_eq!(handle.ram(VIEW, 0, 4), vec![1, 1, 3, 3]);
    assert_eq!(handle.ram(DATA, 0, 2), vec![2, 2]);

    let selects: Vec<PersonaKind> = handle
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            LinkCall::Select(p) => Some(p),
            _ => None,
        })
        .collect();
    assert_eq!(selects, vec![VIEW, DATA, VIEW, DATA]);
    Ok(())
}

#[test]
fn restore_failure_is_reported() -> Result<()> {
    let (selector, handle) = selector_on_data()?;

    let err = selector
        .with_device(VIEW, |_| {
            handle.fail_next_select();
            Ok(42)
        })
        .unwrap_err();
    assert!(matches!(
        err,
        PixxError::Link(LinkError::Timeout { .. })
    ));
    // Unknown after a failed select
    assert_eq!(selector.selected(), None);

    // With a closure error, the closure's error wins
    selector.with_device(DATA, |_| Ok(()))?;
    let err = selector
        .with_device(VIEW, |_| -> pixx_sched::Result<()> {
            handle.fail_next_select();
            Err(PixxError::Config {
                message: "closure failed".to_string(),
            })
        })
        .unwrap_err();
    assert!(matches!(err, PixxError::Config { .. }));
    Ok(())
}

#[test]
fn failed_select_skips_closure() -> Result<()> {
    let (selector, handle) = selector_on_data()?;
    handle.fail_next_select();

    let mut ran = false;
    let err = selector
        .with_device(VIEW, |_| {
            ran = true;
            Ok(())
        })
        .unwrap_err();

    assert!(err.is_link());
    assert!(!ran);
    assert_eq!(handle.selected(), Some(DATA));
    assert_eq!(selector.selected(), Some(DATA));
    Ok(())
}

#[test]
fn unknown_persona() {
    let (selector, _handle) = selector();
    let err = selector
        .with_device(PersonaKind::ProPixx, |_| Ok(()))
        .unwrap_err();
    assert!(matches!(
        err,
        PixxError::Link(LinkError::UnknownPersona {
            persona: PersonaKind::ProPixx
        })
    ));
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn threads_do_not_interleave() -> Result<()> {
    const SESSIONS: usize = 50;
    const WRITES: usize = 4;

    let (selector, handle) = selector();
    thread::scope(|s| {
        for persona in [DATA, VIEW] {
            let selector = &selector;
            s.spawn(move || {
                for _ in 0..SESSIONS {
                    selector
                        .with_device(persona, |session| {
                            for i in 0..WRITES {
                                session.write(Region::ram(2 * i as u32), &[0, 0])?;
                                thread::yield_now();
                            }
                            Ok(())
                        })
                        .unwrap();
                }
            });
        }
    });

    // Group consecutive writes by the persona they reached
    let mut runs: Vec<(PersonaKind, usize)> = Vec::new();
    for call in handle.calls() {
        if let LinkCall::Write { persona, .. } = call {
            let persona = persona.expect("write without a selected persona");
            match runs.last_mut() {
                Some((p, n)) if *p == persona => *n += 1,
                _ => runs.push((persona, 1)),
            }
        }
    }

    for (persona, n) in &runs {
        assert_eq!(n % WRITES, 0, "{persona} session was interleaved");
    }
    for persona in [DATA, VIEW] {
        let total: usize = runs
            .iter()
            .filter(|(p, _)| *p == persona)
            .map(|(_, n)| n)
            .sum();
        assert_eq!(total, SESSIONS * WRITES);
    }
    Ok(())
}

#[test]
fn devices_share_one_link() -> Result<()> {
    let (selector, handle) = selector();
    let data = Device::open(&selector, Persona::with_all_subsystems(DATA, RAM)?)?;
    let view = Device::open(&selector, Persona::with_all_subsystems(VIEW, RAM)?)?;

    let mut data_dout = data.dout()?;
    let mut view_dout = view.dout()?;
    data_dout.set_buffer(0x100, 0x100)?;
    view_dout.set_buffer(0x400, 0x200)?;
    data_dout.start()?;
    view_dout.start()?;

    let block = data_dout.subsystem().block;
    assert_eq!(handle.register(DATA, block.buffer_base().offset()), 0x100);
    assert_eq!(handle.register(VIEW, block.buffer_base().offset()), 0x400);
    assert_eq!(handle.register(VIEW, block.buffer_size().offset()), 0x200);

    data.write_ram(0, &[9, 9])?;
    assert_eq!(handle.ram(DATA, 0, 2), vec![9, 9]);
    assert_eq!(handle.ram(VIEW, 0, 2), vec![0, 0]);
    Ok(())
}

#[test]
fn disconnected_link() -> Result<()> {
    let (selector, handle) = selector();
    let device = Device::open(&selector, Persona::with_all_subsystems(DATA, RAM)?)?;

    handle.set_disconnected(true);
    let err = device.write_ram(0, &[1, 2]).unwrap_err();
    assert!(matches!(err, PixxError::Link(LinkError::Disconnected)));
    assert!(device.read_ram(0, 2).unwrap_err().is_link());

    handle.set_disconnected(false);
    device.write_ram(0, &[1, 2])?;
    assert_eq!(&device.read_ram(0, 2)?[..], &[1, 2]);
    Ok(())
}
