//! Software-only VT backend.
//!
//! Used on seats without kernel VTs. There is no OS resource behind it; the
//! whole state is the shared `active` flag, and switches complete
//! synchronously. The seat's user toggles the VT with Logo+Ctrl+F12.

use std::rc::Rc;

use tracing::debug;

use crate::input::keyboard::keysyms;
use crate::input::{InputEvent, Modifiers};

use super::{Error, Switch, VtAction, VtEvent, VtInner, VtResponse};

pub(super) fn activate(vt: &Rc<VtInner>) -> Result<Switch, Error> {
    if vt.active.get() {
        return Ok(Switch::Complete);
    }
    debug!("Fake VT activated");
    vt.active.set(true);
    let _ = vt.call(&VtEvent {
        action: VtAction::Activate,
        target: -1,
        force: false,
    });
    Ok(Switch::Complete)
}

pub(super) fn deactivate(vt: &Rc<VtInner>, force: bool) -> Result<Switch, Error> {
    if !vt.active.get() {
        return Ok(Switch::Complete);
    }
    let response = vt.call(&VtEvent {
        action: VtAction::Deactivate,
        target: -1,
        force,
    });
    if response == VtResponse::Veto && !force {
        debug!("Client refused to release the fake VT");
        return Err(Error::Refused);
    }
    debug!("Fake VT deactivated");
    vt.active.set(false);
    Ok(Switch::Complete)
}

/// Logo+Ctrl+F12 toggles the fake VT.
pub(super) fn filter_input(vt: &Rc<VtInner>, event: &mut InputEvent) {
    if event.handled {
        return;
    }
    let Some(sym) = event.keysyms.first() else {
        return;
    };
    if event.mods != Modifiers::LOGO | Modifiers::CONTROL || sym.raw() != keysyms::KEY_F12 {
        return;
    }
    event.handled = true;
    let result = if vt.active.get() {
        deactivate(vt, false)
    } else {
        activate(vt)
    };
    if let Err(err) = result {
        debug!("Fake VT toggle failed: {}", err);
    }
}
