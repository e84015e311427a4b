//! Scoped persona selection on a shared link.
//!
//! Several personas answer on one physical link, but the link only routes
//! transfers to whichever persona was selected last. [`DeviceSelector`] owns
//! the link and serializes access to it: a caller gets the link only inside
//! [`DeviceSelector::with_device`], with its persona selected, and the
//! previously selected persona is put back when the closure returns, fails or
//! panics.
//!
//! # Locking
//!
//! The selector lock is a re-entrant mutex held for the whole
//! select → operate → restore sequence. A nested `with_device` on the same
//! thread re-enters it and restores the enclosing persona on exit, so
//! selections behave like a stack. Other threads block until the outermost
//! call returns, which keeps their transfers from interleaving.

use std::cell::RefCell;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::ReentrantMutex;
use tracing::{debug, error, warn};

use crate::error::{LinkError, Result};
use crate::link::{Link, Region};
use crate::persona::PersonaKind;

struct SelectorState {
    link: Box<dyn Link + Send>,
    selected: Option<PersonaKind>,
}

impl SelectorState {
    fn select(&mut self, persona: PersonaKind) -> std::result::Result<(), LinkError> {
        if self.selected == Some(persona) {
            return Ok(());
        }
        match self.link.select_persona(persona) {
            Ok(()) => {
                debug!(%persona, "Selected persona");
                self.selected = Some(persona);
                Ok(())
            }
            Err(e) => {
                // Link state after a failed select is unknown
                self.selected = None;
                Err(e)
            }
        }
    }
}

type SharedState = Arc<ReentrantMutex<RefCell<SelectorState>>>;

/// Owner of a shared multi-persona link.
///
/// Cloning is cheap; clones share the same link and lock.
#[derive(Clone)]
pub struct DeviceSelector {
    state: SharedState,
}

impl std::fmt::Debug for DeviceSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSelector")
            .field("selected", &self.selected())
            .finish_non_exhaustive()
    }
}

impl DeviceSelector {
    /// Take ownership of a link. No persona is considered selected yet.
    pub fn new(link: impl Link + Send + 'static) -> Self {
        Self {
            state: Arc::new(ReentrantMutex::new(RefCell::new(SelectorState {
                link: Box::new(link),
                selected: None,
            }))),
        }
    }

    /// Persona the link currently routes to, if known.
    pub fn selected(&self) -> Option<PersonaKind> {
        let guard = self.state.lock();
        let selected = guard.borrow().selected;
        selected
    }

    /// Run `f` with `persona` selected, then restore the previous selection.
    ///
    /// Restoration happens on every exit path. If `f` succeeds but restoring
    /// fails, the restore error is returned. If `f` fails, its error wins and
    /// a restore failure is only logged. If selecting `persona` fails, `f` is
    /// not run and the previous persona is still restored.
    ///
    /// With no previous selection there is nothing to restore and `persona`
    /// stays selected.
    pub fn with_device<T, F>(&self, persona: PersonaKind, f: F) -> Result<T>
    where
        F: FnOnce(&mut LinkSession<'_>) -> Result<T>,
    {
        let guard = self.state.lock();
        let cell: &RefCell<SelectorState> = &guard;
        let previous = cell.borrow().selected;

        let mut restore = RestoreOnExit {
            cell,
            previous,
            armed: true,
        };

        let selected = cell.borrow_mut().select(persona);
        if let Err(e) = selected {
            error!(%persona, error = %e, "Persona select failed");
            restore.armed = false;
            if let Err(restore_err) = restore_selection(cell, previous) {
                warn!(error = %restore_err, "Restore after failed select also failed");
            }
            return Err(e.into());
        }

        let mut session = LinkSession { cell, persona };
        let outcome = f(&mut session);

        restore.armed = false;
        let restored = restore_selection(cell, previous);

        match (outcome, restored) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(restore_err)) => {
                warn!(
                    error = %restore_err,
                    "Persona restore failed after operation error"
                );
                Err(e)
            }
        }
    }
}

fn restore_selection(
    cell: &RefCell<SelectorState>,
    previous: Option<PersonaKind>,
) -> std::result::Result<(), LinkError> {
    match previous {
        Some(persona) => cell.borrow_mut().select(persona),
        None => Ok(()),
    }
}

/// Restores the enclosing selection when a closure unwinds.
struct RestoreOnExit<'a> {
    cell: &'a RefCell<SelectorState>,
    previous: Option<PersonaKind>,
    armed: bool,
}

impl Drop for RestoreOnExit<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(persona) = self.previous else {
            return;
        };
        match self.cell.try_borrow_mut() {
            Ok(mut state) => {
                if let Err(e) = state.select(persona) {
                    error!(%persona, error = %e, "Persona restore during unwind failed");
                }
            }
            Err(_) => error!(%persona, "Selector state busy during unwind; restore skipped"),
        }
    }
}

/// Link access granted inside [`DeviceSelector::with_device`].
///
/// Each transfer borrows the shared link only for its own duration, so a
/// closure may call `with_device` again on the same selector.
pub struct LinkSession<'a> {
    cell: &'a RefCell<SelectorState>,
    persona: PersonaKind,
}

impl LinkSession<'_> {
    /// Persona this session was opened for.
    pub fn persona(&self) -> PersonaKind {
        self.persona
    }

    // A nested call may have left another persona selected if its restore
    // failed; make sure transfers reach the persona of this session.
    fn ensure_selected(&self) -> std::result::Result<(), LinkError> {
        self.cell.borrow_mut().select(self.persona)
    }
}

impl Link for LinkSession<'_> {
    fn write(&mut self, region: Region, bytes: &[u8]) -> std::result::Result<(), LinkError> {
        self.ensure_selected()?;
        self.cell.borrow_mut().link.write(region, bytes)
    }

    fn read(&mut self, region: Region, len: usize) -> std::result::Result<Bytes, LinkError> {
        self.ensure_selected()?;
        self.cell.borrow_mut().link.read(region, len)
    }

    fn select_persona(&mut self, persona: PersonaKind) -> std::result::Result<(), LinkError> {
        self.cell.borrow_mut().select(persona)?;
        self.persona = persona;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PixxError;
    use crate::mock::{LinkCall, MockLink};

    fn two_persona_selector() -> (DeviceSelector, crate::mock::MockHandle) {
        let link = MockLink::new()
            .with_persona(PersonaKind::DataPixx, 0x1000)
            .with_persona(PersonaKind::ViewPixx, 0x1000);
        let handle = link.handle();
        (DeviceSelector::new(link), handle)
    }

    #[test]
    fn test_first_selection_sticks() {
        let (selector, handle) = two_persona_selector();
        selector
            .with_device(PersonaKind::DataPixx, |_| Ok(()))
            .unwrap();
        assert_eq!(selector.selected(), Some(PersonaKind::DataPixx));
        assert_eq!(handle.selected(), Some(PersonaKind::DataPixx));
    }

    #[test]
    fn test_redundant_select_skipped() {
        let (selector, handle) = two_persona_selector();
        selector
            .with_device(PersonaKind::DataPixx, |_| Ok(()))
            .unwrap();
        handle.clear_calls();
        selector
            .with_device(PersonaKind::DataPixx, |_| Ok(()))
            .unwrap();
        assert!(handle.calls().is_empty());
    }

    #[test]
    fn test_nested_restores_enclosing() {
        let (selector, handle) = two_persona_selector();
        selector
            .with_device(PersonaKind::DataPixx, |_| {
                selector.with_device(PersonaKind::ViewPixx, |link| {
                    assert_eq!(link.persona(), PersonaKind::ViewPixx);
                    Ok(())
                })?;
                assert_eq!(selector.selected(), Some(PersonaKind::DataPixx));
                Ok(())
            })
            .unwrap();

        let selects: Vec<_> = handle
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                LinkCall::Select(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(
            selects,
            vec![
                PersonaKind::DataPixx,
                PersonaKind::ViewPixx,
                PersonaKind::DataPixx
            ]
        );
    }

    #[test]
    fn test_failed_select_skips_closure() {
        let (selector, handle) = two_persona_selector();
        selector
            .with_device(PersonaKind::DataPixx, |_| Ok(()))
            .unwrap();

        handle.fail_next_select();
        let mut ran = false;
        let err = selector
            .with_device(PersonaKind::ViewPixx, |_| {
                ran = true;
                Ok(())
            })
            .unwrap_err();

        assert!(!ran);
        assert!(matches!(err, PixxError::Link(_)));
        assert_eq!(handle.selected(), Some(PersonaKind::DataPixx));
        assert_eq!(selector.selected(), Some(PersonaKind::DataPixx));
    }
}
