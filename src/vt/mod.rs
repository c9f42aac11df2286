//!
//! Virtual terminal abstraction.
//!
//! A [`Vt`] is one multiplexing slot for a seat: it decides when the seat may
//! use the keyboard+display bundle. Two backends exist:
//!
//! - *real*: drives a kernel VT through the legacy tty interface. Switches
//!   are asynchronous: the kernel acknowledges them with `SIGUSR1`/`SIGUSR2`,
//!   which the owning [`VtMaster`] routes back to every VT it owns.
//! - *fake*: pure software state for seats without kernel VTs; activation is
//!   synchronous and driven by a hotkey or programmatic request.
//!
//! Which backend a seat gets is decided at allocation time, see
//! [`Vt::allocate`]. Clients observe the VT through a single callback that
//! receives [`VtEvent`]s and may veto a non-forced deactivation.

use std::{
    cell::{Cell, RefCell},
    fmt,
    path::{Path, PathBuf},
    rc::{Rc, Weak},
};

use tracing::debug;

use crate::eloop::EventLoop;
use crate::input::{HookToken, InputEvent, InputManager};

mod fake;
pub(crate) mod master;
mod real;

pub use master::VtMaster;

bitflags::bitflags! {
    /// The backends a caller allows at allocation time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VtTypes: u32 {
        /// Kernel VT through the legacy tty interface
        const REAL = 0x01;
        /// Software-only fallback
        const FAKE = 0x02;
    }
}

/// What a [`VtEvent`] asks of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VtAction {
    /// The VT became active; the client owns the seat now
    Activate,
    /// The VT is asked to (or forced to) release the seat
    Deactivate,
    /// The tty fd hung up; the VT is dead
    Hup,
}

/// Event delivered to the VT client callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VtEvent {
    /// The request
    pub action: VtAction,
    /// Switch target VT number, `-1` when unknown or meaningless
    pub target: i32,
    /// On [`VtAction::Deactivate`]: the client cannot veto
    pub force: bool,
}

/// Client answer to a [`VtEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VtResponse {
    /// Proceed
    Accept,
    /// Refuse a deactivation; ignored when `force` is set
    Veto,
}

/// Result of a programmatic switch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Switch {
    /// The VT reached the requested state synchronously
    Complete,
    /// The switch was queued and completes with a kernel signal
    InProgress,
}

/// Errors related to the VT layer
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Neither backend was both allowed and available
    #[error("No allowed VT backend is available for this seat")]
    NotSupported,
    /// Failed to open a tty device
    #[error("Failed to open TTY `{0}`")]
    FailedToOpenTty(String, #[source] nix::Error),
    /// The opened device is not a kernel tty
    #[error("`{0}` is not a TTY device")]
    NotATty(String),
    /// No free VT could be discovered via `VT_OPENQRY`
    #[error("The kernel reported no free VT")]
    NoFreeTty,
    /// A tty setup ioctl failed; the allocation is unwound
    #[error("Failed to set up tty {num} ({what})")]
    SetupTty {
        /// The step that failed
        what: &'static str,
        /// The VT number
        num: i32,
        /// The underlying OS error
        #[source]
        source: nix::Error,
    },
    /// A VT switch ioctl failed
    #[error("Switching VTs failed")]
    SwitchFailed(#[source] nix::Error),
    /// The client vetoed the deactivation
    #[error("The client refused to release the VT")]
    Refused,
    /// The tty fd hung up earlier; the VT is unusable
    #[error("The VT hung up")]
    HungUp,
    /// The event loop refused a registration
    #[error(transparent)]
    Loop(#[from] crate::eloop::Error),
}

type VtCallback = Box<dyn FnMut(&VtEvent) -> VtResponse>;

pub(crate) enum Backend {
    Real(real::RealVt),
    Fake,
}

pub(crate) struct VtInner {
    master: Weak<master::MasterInner>,
    eloop: EventLoop,
    input: InputManager,
    cb: RefCell<VtCallback>,
    active: Cell<bool>,
    dead: Cell<bool>,
    backend: Backend,
    // Keeps the input filter registered for the lifetime of the VT.
    hook: RefCell<Option<HookToken>>,
}

impl VtInner {
    pub(crate) fn call(&self, event: &VtEvent) -> VtResponse {
        (self.cb.borrow_mut())(event)
    }

    fn filter_input(this: &Rc<Self>, event: &mut InputEvent) {
        if this.dead.get() {
            return;
        }
        match &this.backend {
            Backend::Real(_) => real::filter_input(this, event),
            Backend::Fake => fake::filter_input(this, event),
        }
    }

    pub(crate) fn handle_signal(this: &Rc<Self>, kind: master::SignalKind) {
        if this.dead.get() {
            return;
        }
        match (&this.backend, kind) {
            (Backend::Real(_), master::SignalKind::Acquire) => real::on_acquire_signal(this),
            (Backend::Real(_), master::SignalKind::Release) => real::on_release_signal(this),
            // Fake VTs do not participate in kernel signalling.
            (Backend::Fake, _) => {}
        }
    }
}

enum Chosen {
    Real(Option<PathBuf>),
    Fake,
}

/// Decide which backend serves a seat.
///
/// `/dev/ttyF<seat>` is a caller-created marker forcing the fake backend.
/// Only seat0 can drive kernel VTs, and only when `/dev/tty0` exists; every
/// other seat gets the fake backend when allowed.
fn choose(seat_name: &str, types: VtTypes, tty_path: Option<&Path>) -> Result<Chosen, Error> {
    let marker = PathBuf::from(format!("/dev/ttyF{}", seat_name));
    if marker.exists() {
        return if types.contains(VtTypes::FAKE) {
            Ok(Chosen::Fake)
        } else {
            Err(Error::NotSupported)
        };
    }
    if seat_name == "seat0" && Path::new("/dev/tty0").exists() {
        return if types.contains(VtTypes::REAL) {
            Ok(Chosen::Real(tty_path.map(Path::to_path_buf)))
        } else {
            Err(Error::NotSupported)
        };
    }
    if types.contains(VtTypes::FAKE) {
        Ok(Chosen::Fake)
    } else {
        Err(Error::NotSupported)
    }
}

/// Handle to one VT.
///
/// This is a handle to the inner state, it can be cloned. The VT itself is
/// owned by its [`VtMaster`] until [`Vt::deallocate`] is called.
#[derive(Clone)]
pub struct Vt {
    pub(crate) inner: Rc<VtInner>,
}

impl fmt::Debug for Vt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.inner.backend {
            Backend::Real(_) => "real",
            Backend::Fake => "fake",
        };
        f.debug_struct("Vt")
            .field("kind", &kind)
            .field("num", &self.vt_number())
            .field("active", &self.inner.active.get())
            .finish_non_exhaustive()
    }
}

impl Vt {
    /// Allocate a VT on `master` for the given seat.
    ///
    /// The backend is chosen as documented on the module; allocation fails
    /// with [`Error::NotSupported`] when the chosen backend is not in
    /// `types`, and unwinds with the underlying error when tty setup fails.
    /// `tty_path` overrides tty discovery for the real backend.
    pub fn allocate<F>(
        master: &VtMaster,
        types: VtTypes,
        seat_name: &str,
        input: &InputManager,
        tty_path: Option<&Path>,
        cb: F,
    ) -> Result<Vt, Error>
    where
        F: FnMut(&VtEvent) -> VtResponse + 'static,
    {
        let chosen = choose(seat_name, types, tty_path)?;
        let eloop = master.eloop().clone();
        let backend = match chosen {
            Chosen::Fake => {
                debug!("Allocating fake VT for seat {}", seat_name);
                Backend::Fake
            }
            Chosen::Real(path) => {
                let path = real::find_tty(path)?;
                debug!("Allocating real VT on {} for seat {}", path.display(), seat_name);
                Backend::Real(real::RealVt::open(&path)?)
            }
        };

        let inner = Rc::new(VtInner {
            master: Rc::downgrade(master.inner()),
            eloop,
            input: input.clone(),
            cb: RefCell::new(Box::new(cb)),
            active: Cell::new(false),
            dead: Cell::new(false),
            backend,
            hook: RefCell::new(None),
        });

        let weak = Rc::downgrade(&inner);
        let hook = input.register_hook(move |event| {
            if let Some(vt) = weak.upgrade() {
                VtInner::filter_input(&vt, event);
            }
        });
        *inner.hook.borrow_mut() = Some(hook);

        match &inner.backend {
            Backend::Real(_) => {
                if let Err(err) = real::attach(&inner) {
                    // Restore the tty before surfacing the failure.
                    real::destroy(&inner);
                    return Err(err);
                }
            }
            // The fake backend holds a wake reference for its whole lifetime.
            Backend::Fake => input.wake_up(),
        }

        master.inner().add(&inner);
        Ok(Vt { inner })
    }

    /// Request activation.
    ///
    /// Returns [`Switch::Complete`] when the VT is active when the call
    /// returns, [`Switch::InProgress`] when a kernel switch was queued.
    pub fn activate(&self) -> Result<Switch, Error> {
        match &self.inner.backend {
            Backend::Real(_) => real::activate(&self.inner),
            Backend::Fake => fake::activate(&self.inner),
        }
    }

    /// Request deactivation.
    ///
    /// The client callback may veto; a veto surfaces as [`Error::Refused`]
    /// on the fake backend and leaves a real VT active.
    pub fn deactivate(&self) -> Result<Switch, Error> {
        match &self.inner.backend {
            Backend::Real(_) => real::deactivate(&self.inner),
            Backend::Fake => fake::deactivate(&self.inner, false),
        }
    }

    /// Drive a pending switch forward.
    ///
    /// Re-issues the queued `VT_ACTIVATE`, or abandons a switch whose target
    /// never became foreground within the timeout. Called internally from a
    /// retry timer; exposed for callers that want to force a retry cycle.
    pub fn retry(&self) {
        if let Backend::Real(_) = &self.inner.backend {
            real::retry(&self.inner);
        }
    }

    /// Whether the VT currently owns the seat.
    pub fn is_active(&self) -> bool {
        self.inner.active.get()
    }

    /// The kernel VT number; `None` for fake VTs.
    pub fn vt_number(&self) -> Option<i32> {
        match &self.inner.backend {
            Backend::Real(real) => Some(real.num()),
            Backend::Fake => None,
        }
    }

    /// Tear the VT down and restore kernel state.
    ///
    /// The client receives a final forced deactivation if the VT was active.
    /// Idempotent; the handle stays valid but every operation turns into a
    /// no-op afterwards.
    pub fn deallocate(&self) {
        if self.inner.dead.replace(true) {
            return;
        }
        debug!("Deallocating VT {:?}", self.vt_number());
        self.inner.hook.borrow_mut().take();
        match &self.inner.backend {
            Backend::Real(_) => real::destroy(&self.inner),
            Backend::Fake => {
                let _ = fake::deactivate(&self.inner, true);
                self.inner.input.sleep();
            }
        }
        if let Some(master) = self.inner.master.upgrade() {
            master.remove(&self.inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::XkbConfig;

    fn fixtures() -> (EventLoop, VtMaster, InputManager) {
        let eloop = EventLoop::new().unwrap();
        let master = VtMaster::new(&eloop).unwrap();
        let input = InputManager::new(&eloop, &XkbConfig::default(), 250, 50).unwrap();
        (eloop, master, input)
    }

    #[test]
    fn unknown_seat_falls_back_to_fake() {
        assert!(matches!(
            choose("testseat", VtTypes::all(), None),
            Ok(Chosen::Fake)
        ));
    }

    #[test]
    fn fake_disallowed_fails_off_seat0() {
        assert!(matches!(
            choose("testseat", VtTypes::REAL, None),
            Err(Error::NotSupported)
        ));
    }

    #[test]
    fn fake_vt_round_trip() {
        let (_eloop, master, input) = fixtures();
        let log = Rc::new(RefCell::new(Vec::new()));

        let l = log.clone();
        let vt = Vt::allocate(&master, VtTypes::FAKE, "testseat", &input, None, move |ev| {
            l.borrow_mut().push(ev.action);
            VtResponse::Accept
        })
        .unwrap();

        // The fake backend keeps the aggregator awake for its lifetime.
        assert!(input.is_awake());
        assert!(!vt.is_active());
        assert_eq!(vt.vt_number(), None);

        assert_eq!(vt.activate().unwrap(), Switch::Complete);
        assert!(vt.is_active());
        // Activating an active VT is a no-op.
        assert_eq!(vt.activate().unwrap(), Switch::Complete);
        assert_eq!(vt.deactivate().unwrap(), Switch::Complete);
        assert!(!vt.is_active());
        assert_eq!(*log.borrow(), vec![VtAction::Activate, VtAction::Deactivate]);

        vt.deallocate();
        assert!(!input.is_awake());
    }

    #[test]
    fn fake_vt_respects_veto() {
        let (_eloop, master, input) = fixtures();

        let vt = Vt::allocate(&master, VtTypes::FAKE, "testseat", &input, None, |ev| {
            match ev.action {
                VtAction::Deactivate if !ev.force => VtResponse::Veto,
                _ => VtResponse::Accept,
            }
        })
        .unwrap();

        vt.activate().unwrap();
        assert!(matches!(vt.deactivate(), Err(Error::Refused)));
        assert!(vt.is_active());

        // Deallocation forces the client out regardless.
        vt.deallocate();
        assert!(!vt.is_active());
    }

    #[test]
    fn deallocate_is_idempotent() {
        let (_eloop, master, input) = fixtures();
        let vt = Vt::allocate(&master, VtTypes::FAKE, "testseat", &input, None, |_| {
            VtResponse::Accept
        })
        .unwrap();
        assert_eq!(master.vt_count(), 1);
        vt.deallocate();
        vt.deallocate();
        assert_eq!(master.vt_count(), 0);
        assert!(!input.is_awake());
    }
}
