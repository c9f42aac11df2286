//! Owner of every VT of one process.
//!
//! The master subscribes to `SIGUSR1`/`SIGUSR2` once per loop and fans both
//! signals out to every VT it owns; each backend decides on its own whether
//! the signal concerns it (real VTs compare the kernel foreground number,
//! fake VTs ignore signals entirely).

use std::{
    cell::RefCell,
    fmt,
    rc::{Rc, Weak},
};

use tracing::trace;

use crate::eloop::{EventLoop, Signal, SignalSource};

use super::{Error, Switch, Vt, VtInner};

/// Which of the two VT signals fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SignalKind {
    /// `SIGUSR1`: the kernel granted a VT to this process
    Acquire,
    /// `SIGUSR2`: the kernel asks this process to release a VT
    Release,
}

pub(crate) struct MasterInner {
    eloop: EventLoop,
    vts: RefCell<Vec<Rc<VtInner>>>,
    // Keeps the subscriptions alive for the lifetime of the master.
    _signals: RefCell<Option<(SignalSource, SignalSource)>>,
}

impl MasterInner {
    fn route(&self, kind: SignalKind) {
        trace!("Routing {:?} to {} VTs", kind, self.vts.borrow().len());
        let vts: Vec<_> = self.vts.borrow().clone();
        for vt in vts {
            VtInner::handle_signal(&vt, kind);
        }
    }

    pub(super) fn add(&self, vt: &Rc<VtInner>) {
        self.vts.borrow_mut().push(vt.clone());
    }

    pub(super) fn remove(&self, vt: &Rc<VtInner>) {
        self.vts.borrow_mut().retain(|v| !Rc::ptr_eq(v, vt));
    }
}

/// Handle to the VT master.
///
/// This is a handle to the inner state, it can be cloned.
#[derive(Clone)]
pub struct VtMaster {
    inner: Rc<MasterInner>,
}

impl fmt::Debug for VtMaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VtMaster")
            .field("vts", &self.inner.vts.borrow().len())
            .finish_non_exhaustive()
    }
}

impl VtMaster {
    /// Create a master and subscribe it to the VT signals on `eloop`.
    pub fn new(eloop: &EventLoop) -> Result<VtMaster, Error> {
        let inner = Rc::new(MasterInner {
            eloop: eloop.clone(),
            vts: RefCell::new(Vec::new()),
            _signals: RefCell::new(None),
        });

        let weak = Rc::downgrade(&inner);
        let acquire = eloop.add_signal(Signal::SIGUSR1, move |_| {
            if let Some(master) = weak.upgrade() {
                master.route(SignalKind::Acquire);
            }
        })?;
        let weak = Rc::downgrade(&inner);
        let release = eloop.add_signal(Signal::SIGUSR2, move |_| {
            if let Some(master) = weak.upgrade() {
                master.route(SignalKind::Release);
            }
        })?;
        *inner._signals.borrow_mut() = Some((acquire, release));

        Ok(VtMaster { inner })
    }

    pub(crate) fn inner(&self) -> &Rc<MasterInner> {
        &self.inner
    }

    pub(crate) fn eloop(&self) -> &EventLoop {
        &self.inner.eloop
    }

    /// Number of VTs currently owned by the master.
    pub fn vt_count(&self) -> usize {
        self.inner.vts.borrow().len()
    }

    /// Request activation of every VT.
    ///
    /// Returns the number of VTs whose switch is still in flight, or the
    /// first error.
    pub fn activate_all(&self) -> Result<usize, Error> {
        let vts: Vec<_> = self.inner.vts.borrow().clone();
        let mut pending = 0;
        for inner in vts {
            if (Vt { inner }).activate()? == Switch::InProgress {
                pending += 1;
            }
        }
        Ok(pending)
    }

    /// Request deactivation of every VT.
    ///
    /// Returns the number of VTs whose switch is still in flight, or the
    /// first error (a veto surfaces as [`Error::Refused`]).
    pub fn deactivate_all(&self) -> Result<usize, Error> {
        let vts: Vec<_> = self.inner.vts.borrow().clone();
        let mut pending = 0;
        for inner in vts {
            if (Vt { inner }).deactivate()? == Switch::InProgress {
                pending += 1;
            }
        }
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{InputManager, XkbConfig};
    use crate::vt::{VtResponse, VtTypes};

    use std::cell::Cell;
    use std::time::Duration;

    #[test]
    fn bulk_activation_of_fake_vts() {
        let eloop = EventLoop::new().unwrap();
        let master = VtMaster::new(&eloop).unwrap();
        let input = InputManager::new(&eloop, &XkbConfig::default(), 250, 50).unwrap();

        let vt_a = Vt::allocate(&master, VtTypes::FAKE, "testseat", &input, None, |_| {
            VtResponse::Accept
        })
        .unwrap();
        let vt_b = Vt::allocate(&master, VtTypes::FAKE, "testseat", &input, None, |_| {
            VtResponse::Accept
        })
        .unwrap();
        assert_eq!(master.vt_count(), 2);

        // Fake switches are synchronous: no switch stays in flight.
        assert_eq!(master.activate_all().unwrap(), 0);
        assert!(vt_a.is_active() && vt_b.is_active());
        assert_eq!(master.deactivate_all().unwrap(), 0);
        assert!(!vt_a.is_active() && !vt_b.is_active());
    }

    #[test]
    fn signals_do_not_disturb_fake_vts() {
        let eloop = EventLoop::new().unwrap();
        let master = VtMaster::new(&eloop).unwrap();
        let input = InputManager::new(&eloop, &XkbConfig::default(), 250, 50).unwrap();

        let activations = Rc::new(Cell::new(0u32));
        let a = activations.clone();
        let vt = Vt::allocate(&master, VtTypes::FAKE, "testseat", &input, None, move |_| {
            a.set(a.get() + 1);
            VtResponse::Accept
        })
        .unwrap();

        nix::sys::signal::raise(Signal::SIGUSR1).unwrap();
        nix::sys::signal::raise(Signal::SIGUSR2).unwrap();
        eloop.dispatch(Some(Duration::from_millis(100))).unwrap();

        assert!(!vt.is_active());
        assert_eq!(activations.get(), 0);
    }
}
