//! Kernel VT backend.
//!
//! The backend takes a tty into `KD_GRAPHICS` and `VT_PROCESS` mode, so every
//! switch away from or towards it must be acknowledged by this process. The
//! kernel raises `SIGUSR1` when the VT becomes foreground and `SIGUSR2` when
//! it wants the VT back; [`super::master::VtMaster`] routes both signals to
//! every real VT, which decides relevance by comparing the foreground VT
//! number from `VT_GETSTATE` with its own.
//!
//! Programmatic switches are asynchronous: `VT_ACTIVATE` queues the request
//! and the matching signal completes it. The pending target is kept with a
//! timestamp and driven by a retry timer; a target that has not become
//! foreground within [`SWITCH_TIMEOUT`] is abandoned.

use std::{
    cell::{Cell, RefCell},
    os::unix::io::RawFd,
    path::{Path, PathBuf},
    rc::Rc,
    time::{Duration, Instant},
};

use nix::fcntl::{open, OFlag};
use nix::sys::signal::Signal;
use nix::sys::stat::{fstat, major, minor, Mode};
use nix::unistd::close;
use tracing::{debug, info, trace, warn};

use crate::eloop::{FdSource, IdleSource, Readiness, TimerSource, TimerSpec};
use crate::input::keyboard::keysyms;
use crate::input::{InputEvent, Modifiers};

use super::{Backend, Error, Switch, VtAction, VtEvent, VtInner, VtResponse};

#[allow(dead_code)]
mod tty {
    use nix::libc::c_int;

    nix::ioctl_write_int_bad!(kd_set_mode, 0x4B3A);
    pub const KD_TEXT: c_int = 0x00;
    pub const KD_GRAPHICS: c_int = 0x01;

    nix::ioctl_read_bad!(kd_get_kb_mode, 0x4B44, c_int);
    nix::ioctl_write_int_bad!(kd_set_kb_mode, 0x4B45);
    pub const K_RAW: c_int = 0x00;
    pub const K_UNICODE: c_int = 0x03;
    pub const K_OFF: c_int = 0x04;

    nix::ioctl_read_bad!(vt_open_qry, 0x5600, c_int);
    nix::ioctl_write_ptr_bad!(vt_set_mode, 0x5602, VtMode);
    nix::ioctl_read_bad!(vt_get_state, 0x5603, VtStat);
    nix::ioctl_write_int_bad!(vt_rel_disp, 0x5605);
    nix::ioctl_write_int_bad!(vt_activate, 0x5606);

    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VtMode {
        /// vt mode
        pub mode: i8,
        /// if set, hang on writes if not active
        pub waitv: i8,
        /// signal to raise on release req
        pub relsig: i16,
        /// signal to raise on acquisition
        pub acqsig: i16,
        /// unused (set to 0)
        pub frsig: i16,
    }
    pub const VT_AUTO: i8 = 0x00;
    pub const VT_PROCESS: i8 = 0x01;
    pub const VT_ACKACQ: c_int = 0x02;

    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VtStat {
        /// active vt
        pub v_active: u16,
        /// signal to send
        pub v_signal: u16,
        /// bitmask of open vts
        pub v_state: u16,
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const TTY_MAJOR: u64 = 4;

/// A queued switch is abandoned when its target has not become foreground
/// within this window.
const SWITCH_TIMEOUT: Duration = Duration::from_secs(3);
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

pub(super) struct RealVt {
    fd: RawFd,
    num: i32,
    saved_num: i32,
    saved_kbmode: i32,
    target: Cell<i32>,
    target_time: Cell<Option<Instant>>,
    delayed: Cell<bool>,
    hup: Cell<bool>,
    watch: RefCell<Option<FdSource>>,
    idle: RefCell<Option<IdleSource>>,
    retry_timer: RefCell<Option<TimerSource>>,
}

impl RealVt {
    pub(super) fn num(&self) -> i32 {
        self.num
    }

    /// Open and claim a tty; unwinds completely on any setup failure.
    pub(super) fn open(path: &Path) -> Result<RealVt, Error> {
        let fd = open(
            path,
            OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(|source| Error::FailedToOpenTty(path.display().to_string(), source))?;

        match Self::setup(fd, path) {
            Ok(vt) => Ok(vt),
            Err(err) => {
                let _ = close(fd);
                Err(err)
            }
        }
    }

    fn setup(fd: RawFd, path: &Path) -> Result<RealVt, Error> {
        let stat = fstat(fd).map_err(|_| Error::NotATty(path.display().to_string()))?;
        if major(stat.st_rdev) != TTY_MAJOR || minor(stat.st_rdev) == 0 {
            return Err(Error::NotATty(path.display().to_string()));
        }
        let num = minor(stat.st_rdev) as i32;
        info!("Using tty {} (VT {})", path.display(), num);

        // The foreground VT at open time; used both for restore-on-exit and
        // as the default deactivation target.
        let state = get_state(fd).map_err(|source| Error::SetupTty {
            what: "VT_GETSTATE",
            num,
            source,
        })?;
        let saved_num = state.v_active as i32;

        unsafe { tty::kd_set_mode(fd, tty::KD_GRAPHICS) }.map_err(|source| Error::SetupTty {
            what: "KDSETMODE",
            num,
            source,
        })?;

        let mode = tty::VtMode {
            mode: tty::VT_PROCESS,
            acqsig: Signal::SIGUSR1 as i16,
            relsig: Signal::SIGUSR2 as i16,
            ..Default::default()
        };
        unsafe { tty::vt_set_mode(fd, &mode) }.map_err(|source| Error::SetupTty {
            what: "VT_SETMODE",
            num,
            source,
        })?;

        let mut saved_kbmode = 0;
        unsafe { tty::kd_get_kb_mode(fd, &mut saved_kbmode) }.map_err(|source| {
            Error::SetupTty {
                what: "KDGKBMODE",
                num,
                source,
            }
        })?;
        unsafe { tty::kd_set_kb_mode(fd, tty::K_RAW) }.map_err(|source| Error::SetupTty {
            what: "KDSKBMODE",
            num,
            source,
        })?;
        // K_OFF keeps the kernel from handling special keys at all; not all
        // kernels accept it, K_RAW is the fallback.
        if let Err(err) = unsafe { tty::kd_set_kb_mode(fd, tty::K_OFF) } {
            debug!("KDSKBMODE K_OFF not supported, staying with K_RAW: {}", err);
        }

        Ok(RealVt {
            fd,
            num,
            saved_num,
            saved_kbmode,
            target: Cell::new(-1),
            target_time: Cell::new(None),
            delayed: Cell::new(false),
            hup: Cell::new(false),
            watch: RefCell::new(None),
            idle: RefCell::new(None),
            retry_timer: RefCell::new(None),
        })
    }
}

fn get_state(fd: RawFd) -> Result<tty::VtStat, nix::Error> {
    let mut state = tty::VtStat::default();
    unsafe { tty::vt_get_state(fd, &mut state) }?;
    Ok(state)
}

fn real(vt: &VtInner) -> &RealVt {
    match &vt.backend {
        Backend::Real(real) => real,
        Backend::Fake => unreachable!("real backend expected"),
    }
}

/// Find the tty to use when the caller did not supply one.
///
/// The tty stderr points at is reused when there is one; otherwise the kernel
/// is asked for a free VT via `VT_OPENQRY` on `/dev/tty0`, falling back to
/// `/dev/tty1`.
pub(super) fn find_tty(supplied: Option<PathBuf>) -> Result<PathBuf, Error> {
    if let Some(path) = supplied {
        return Ok(path);
    }
    if let Ok(stat) = fstat(2) {
        if major(stat.st_rdev) == TTY_MAJOR && minor(stat.st_rdev) != 0 {
            let path = PathBuf::from(format!("/dev/tty{}", minor(stat.st_rdev)));
            debug!("Reusing the controlling tty {}", path.display());
            return Ok(path);
        }
    }
    for base in ["/dev/tty0", "/dev/tty1"] {
        let fd = match open(
            Path::new(base),
            OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC,
            Mode::empty(),
        ) {
            Ok(fd) => fd,
            Err(_) => continue,
        };
        let mut num = 0;
        let res = unsafe { tty::vt_open_qry(fd, &mut num) };
        let _ = close(fd);
        if res.is_ok() && num > 0 {
            debug!("VT_OPENQRY on {} returned VT {}", base, num);
            return Ok(PathBuf::from(format!("/dev/tty{}", num)));
        }
    }
    Err(Error::NoFreeTty)
}

/// Register the loop sources of a freshly opened real VT.
pub(super) fn attach(vt: &Rc<VtInner>) -> Result<(), Error> {
    let rvt = real(vt);

    // Interest mask is empty: the watch exists only for HUP/ERR detection.
    let weak = Rc::downgrade(vt);
    let watch = vt.eloop.add_fd(rvt.fd, Readiness::empty(), move |ready| {
        if let Some(vt) = weak.upgrade() {
            on_tty_ready(&vt, ready);
        }
    })?;
    *rvt.watch.borrow_mut() = Some(watch);

    // When the VT is already foreground the kernel will never signal an
    // acquisition, so schedule the activation for after the current dispatch
    // pass.
    match get_state(rvt.fd) {
        Ok(state) if state.v_active as i32 == rvt.num => {
            rvt.delayed.set(true);
            let weak = Rc::downgrade(vt);
            let idle = vt.eloop.add_idle(move || {
                if let Some(vt) = weak.upgrade() {
                    delayed_activate(&vt);
                }
            });
            *rvt.idle.borrow_mut() = Some(idle);
        }
        Ok(_) => {}
        Err(err) => warn!("VT_GETSTATE after open failed: {}", err),
    }
    Ok(())
}

fn delayed_activate(vt: &Rc<VtInner>) {
    let rvt = real(vt);
    if !rvt.delayed.replace(false) {
        return;
    }
    rvt.idle.borrow_mut().take();
    enter(vt);
}

/// Become active: wake the seat's input and notify the client.
fn enter(vt: &Rc<VtInner>) {
    if vt.active.get() {
        return;
    }
    let rvt = real(vt);
    debug!("VT {} activated", rvt.num);
    vt.input.wake_up();
    vt.active.set(true);
    // The client cannot veto an activation; the return value is meaningless.
    let _ = vt.call(&VtEvent {
        action: VtAction::Activate,
        target: rvt.num,
        force: false,
    });
}

pub(super) fn on_acquire_signal(vt: &Rc<VtInner>) {
    let rvt = real(vt);
    if rvt.hup.get() {
        return;
    }
    let state = match get_state(rvt.fd) {
        Ok(state) => state,
        Err(err) => {
            warn!("VT_GETSTATE failed on SIGUSR1: {}", err);
            return;
        }
    };
    if state.v_active as i32 != rvt.num {
        return;
    }
    trace!("VT {} acquired by the kernel", rvt.num);
    if let Err(err) = unsafe { tty::vt_rel_disp(rvt.fd, tty::VT_ACKACQ) } {
        warn!("VT_RELDISP(VT_ACKACQ) failed: {}", err);
    }
    clear_target(rvt);
    enter(vt);
}

pub(super) fn on_release_signal(vt: &Rc<VtInner>) {
    let rvt = real(vt);
    if rvt.hup.get() {
        return;
    }
    let state = match get_state(rvt.fd) {
        Ok(state) => state,
        Err(err) => {
            warn!("VT_GETSTATE failed on SIGUSR2: {}", err);
            return;
        }
    };
    if state.v_active as i32 != rvt.num || !vt.active.get() {
        return;
    }

    let response = vt.call(&VtEvent {
        action: VtAction::Deactivate,
        target: rvt.target.get(),
        force: false,
    });
    if response == VtResponse::Veto {
        debug!("Client refused to release VT {}", rvt.num);
        if let Err(err) = unsafe { tty::vt_rel_disp(rvt.fd, 0) } {
            warn!("VT_RELDISP(0) failed: {}", err);
        }
        clear_target(rvt);
        return;
    }

    vt.input.sleep();
    vt.active.set(false);
    if let Err(err) = unsafe { tty::vt_rel_disp(rvt.fd, 1) } {
        warn!("VT_RELDISP(1) failed: {}", err);
    }
    clear_target(rvt);
    debug!("VT {} released", rvt.num);
}

pub(super) fn activate(vt: &Rc<VtInner>) -> Result<Switch, Error> {
    let rvt = real(vt);
    if rvt.hup.get() {
        return Err(Error::HungUp);
    }
    if vt.active.get() {
        return Ok(Switch::Complete);
    }
    let state = get_state(rvt.fd).map_err(Error::SwitchFailed)?;
    if state.v_active as i32 == rvt.num {
        // Already foreground, the kernel will not signal anything.
        enter(vt);
        return Ok(Switch::Complete);
    }
    set_target(vt, rvt.num);
    unsafe { tty::vt_activate(rvt.fd, rvt.num) }.map_err(Error::SwitchFailed)?;
    Ok(Switch::InProgress)
}

pub(super) fn deactivate(vt: &Rc<VtInner>) -> Result<Switch, Error> {
    let rvt = real(vt);
    if rvt.hup.get() {
        return Err(Error::HungUp);
    }
    if !vt.active.get() {
        return Ok(Switch::Complete);
    }
    let mut target = rvt.saved_num;
    if target == rvt.num || target <= 0 {
        // Started from our own tty; there is no saved VT to return to.
        target = if rvt.num == 1 { 2 } else { 1 };
    }
    set_target(vt, target);
    unsafe { tty::vt_activate(rvt.fd, target) }.map_err(Error::SwitchFailed)?;
    Ok(Switch::InProgress)
}

/// Called at deallocation time: vacate the seat without waiting for the
/// kernel. The client is told `force` and its answer only logged.
fn force_leave(vt: &Rc<VtInner>) {
    let rvt = real(vt);
    if !vt.active.get() {
        return;
    }
    let response = vt.call(&VtEvent {
        action: VtAction::Deactivate,
        target: rvt.target.get(),
        force: true,
    });
    if response == VtResponse::Veto {
        debug!("Ignoring veto of a forced deactivation");
    }
    vt.input.sleep();
    vt.active.set(false);
}

fn set_target(vt: &Rc<VtInner>, target: i32) {
    let rvt = real(vt);
    rvt.target.set(target);
    rvt.target_time.set(Some(Instant::now()));

    let spec = TimerSpec::repeating(RETRY_INTERVAL, RETRY_INTERVAL);
    let mut timer = rvt.retry_timer.borrow_mut();
    match &*timer {
        Some(existing) => {
            if let Err(err) = existing.update(spec) {
                warn!("Re-arming the VT retry timer failed: {}", err);
            }
        }
        None => {
            let weak = Rc::downgrade(vt);
            match vt.eloop.add_timer(spec, move |_| {
                if let Some(vt) = weak.upgrade() {
                    retry(&vt);
                }
            }) {
                Ok(source) => *timer = Some(source),
                Err(err) => warn!("Creating the VT retry timer failed: {}", err),
            }
        }
    }
}

fn clear_target(rvt: &RealVt) {
    rvt.target.set(-1);
    rvt.target_time.set(None);
    if let Some(timer) = &*rvt.retry_timer.borrow() {
        if let Err(err) = timer.update(TimerSpec::disarmed()) {
            warn!("Disarming the VT retry timer failed: {}", err);
        }
    }
}

pub(super) fn retry(vt: &Rc<VtInner>) {
    let rvt = real(vt);
    let target = rvt.target.get();
    if target < 0 || rvt.hup.get() {
        clear_target(rvt);
        return;
    }
    let expired = rvt
        .target_time
        .get()
        .map(|since| since.elapsed() > SWITCH_TIMEOUT)
        .unwrap_or(true);
    if expired {
        let state = match get_state(rvt.fd) {
            Ok(state) => state,
            Err(err) => {
                warn!("VT_GETSTATE during retry failed: {}", err);
                return;
            }
        };
        if state.v_active as i32 == rvt.num {
            debug!("Abandoning switch to VT {} after timeout", target);
            clear_target(rvt);
            return;
        }
    }
    trace!("Re-issuing VT_ACTIVATE({})", target);
    if let Err(err) = unsafe { tty::vt_activate(rvt.fd, target) } {
        warn!("VT_ACTIVATE({}) retry failed: {}", target, err);
    }
}

/// Keycode filter: Ctrl+Alt+F1..F12 and XF86Switch_VT_1..12 switch VTs.
pub(super) fn filter_input(vt: &Rc<VtInner>, event: &mut InputEvent) {
    let rvt = real(vt);
    if event.handled || !vt.active.get() || rvt.hup.get() {
        return;
    }
    let Some(target) = switch_target(event.mods, event.keysyms.first().copied()) else {
        return;
    };
    // Only react while we really are the kernel foreground VT.
    match get_state(rvt.fd) {
        Ok(state) if state.v_active as i32 == rvt.num => {}
        Ok(_) => return,
        Err(err) => {
            warn!("VT_GETSTATE during hotkey handling failed: {}", err);
            return;
        }
    }
    event.handled = true;
    if target == rvt.num {
        return;
    }
    debug!("Hotkey switch from VT {} to VT {}", rvt.num, target);
    // A pending switch may be re-targeted here.
    set_target(vt, target);
    if let Err(err) = unsafe { tty::vt_activate(rvt.fd, target) } {
        warn!("VT_ACTIVATE({}) failed: {}", target, err);
    }
}

/// The VT a hotkey event asks for, if any.
fn switch_target(mods: Modifiers, sym: Option<crate::input::Keysym>) -> Option<i32> {
    let raw = sym?.raw();
    if (keysyms::KEY_XF86Switch_VT_1..=keysyms::KEY_XF86Switch_VT_12).contains(&raw) {
        return Some((raw - keysyms::KEY_XF86Switch_VT_1 + 1) as i32);
    }
    if mods == Modifiers::CONTROL | Modifiers::ALT
        && (keysyms::KEY_F1..=keysyms::KEY_F12).contains(&raw)
    {
        return Some((raw - keysyms::KEY_F1 + 1) as i32);
    }
    None
}

/// Restore the tty and release every resource. The reverse of
/// [`RealVt::open`] plus a forced deactivation.
pub(super) fn destroy(vt: &Rc<VtInner>) {
    let rvt = real(vt);
    rvt.idle.borrow_mut().take();
    rvt.retry_timer.borrow_mut().take();
    rvt.watch.borrow_mut().take();
    clear_target(rvt);

    force_leave(vt);

    if rvt.hup.get() {
        let _ = close(rvt.fd);
        return;
    }
    if let Err(err) = unsafe { tty::kd_set_kb_mode(rvt.fd, rvt.saved_kbmode) } {
        warn!("Unable to restore the vt keyboard mode: {}", err);
    }
    let mode = tty::VtMode {
        mode: tty::VT_AUTO,
        ..Default::default()
    };
    if let Err(err) = unsafe { tty::vt_set_mode(rvt.fd, &mode) } {
        warn!("Failed to reset vt handling: {}", err);
    }
    if let Err(err) = unsafe { tty::kd_set_mode(rvt.fd, tty::KD_TEXT) } {
        warn!("Unable to restore the vt text mode: {}", err);
    }
    if let Err(err) = close(rvt.fd) {
        warn!("Failed to close the tty fd: {}", err);
    }
}

fn on_tty_ready(vt: &Rc<VtInner>, ready: Readiness) {
    if !ready.intersects(Readiness::HUP | Readiness::ERR) {
        return;
    }
    let rvt = real(vt);
    if rvt.hup.replace(true) {
        return;
    }
    warn!("VT {} hung up", rvt.num);
    rvt.watch.borrow_mut().take();
    clear_target(rvt);
    let _ = vt.call(&VtEvent {
        action: VtAction::Hup,
        target: -1,
        force: false,
    });
}
