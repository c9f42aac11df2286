//! A single evdev keyboard device.
//!
//! The device reads `input_event` batches from its `/dev/input/event*` node,
//! translates `EV_KEY` records through the shared keyboard state and fans the
//! resulting events out through the aggregator. Records of any other type
//! (relative/absolute axes, switches, ...) are not supported and skipped.
//!
//! While the aggregator sleeps the device closes its fd and remembers the
//! kernel's pressed-key bitmap; the next wake diffs the bitmap against the
//! then-current one and injects the missing transitions so no key stays
//! logically stuck.

use std::{
    cell::{Cell, RefCell},
    fmt, mem,
    os::unix::io::RawFd,
    path::{Path, PathBuf},
    rc::{Rc, Weak},
    slice,
    time::Duration,
};

use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{close, read, write};
use tracing::{debug, trace, warn};

use super::keyboard::{xkb, KeyState, KeyboardState, Leds};
use super::{bit_is_set, Error, InputEvent, ManagerInner};
use crate::eloop::{FdSource, Readiness, TimerSource, TimerSpec};

const EV_KEY: u16 = 0x01;
const EV_LED: u16 = 0x11;
const EV_MAX: usize = 0x1f;
const KEY_MAX: usize = 0x2ff;
const LED_MAX: usize = 0x0f;
// A plain keyboard advertises keys below KEY_MUTE; udev's input_id uses the
// same range to tell keyboards from other key-capable devices.
const KEY_MIN_INTERESTING: usize = 113;

const EV_BITS_LEN: usize = EV_MAX / 8 + 1;
const KEY_BITS_LEN: usize = KEY_MAX / 8 + 1;
const LED_BITS_LEN: usize = LED_MAX / 8 + 1;

const EVENT_BATCH: usize = 16;
const RECORD_SIZE: usize = mem::size_of::<libc::input_event>();

mod ioctls {
    // EVIOCGKEY, EVIOCGLED and EVIOCGBIT(0 / EV_KEY, ...) from linux/input.h.
    nix::ioctl_read_buf!(ev_get_bits, b'E', 0x20, u8);
    nix::ioctl_read_buf!(ev_get_key_bits, b'E', 0x21, u8);
    nix::ioctl_read_buf!(ev_get_key_state, b'E', 0x18, u8);
    nix::ioctl_read_buf!(ev_get_led_state, b'E', 0x19, u8);
}

bitflags::bitflags! {
    /// Capabilities a device advertised during the probe.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Capabilities: u32 {
        /// The device has keyboard keys
        const KEYS = 0x01;
        /// The device has LEDs
        const LEDS = 0x02;
    }
}

/// Probe the capabilities of a device node.
pub(crate) fn probe(path: &Path) -> Result<Capabilities, Error> {
    let fd = open(
        path,
        OFlag::O_RDONLY | OFlag::O_NONBLOCK | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(|source| Error::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let result = probe_fd(fd).map_err(|source| Error::Probe {
        path: path.to_path_buf(),
        source,
    });
    if let Err(err) = close(fd) {
        warn!("Failed to close probe fd for {}: {}", path.display(), err);
    }
    result
}

fn probe_fd(fd: RawFd) -> Result<Capabilities, nix::Error> {
    let mut ev_bits = [0u8; EV_BITS_LEN];
    unsafe { ioctls::ev_get_bits(fd, &mut ev_bits) }?;

    let mut caps = Capabilities::empty();
    if bit_is_set(&ev_bits, EV_KEY as usize) {
        let mut key_bits = [0u8; KEY_BITS_LEN];
        unsafe { ioctls::ev_get_key_bits(fd, &mut key_bits) }?;
        if (1..=KEY_MIN_INTERESTING).any(|key| bit_is_set(&key_bits, key)) {
            caps |= Capabilities::KEYS;
        }
    }
    if bit_is_set(&ev_bits, EV_LED as usize) {
        caps |= Capabilities::LEDS;
    }
    Ok(caps)
}

/// Keycodes whose pressed-bit differs between the two snapshots, with the
/// current state.
fn pressed_delta(before: &[u8], now: &[u8]) -> Vec<(u16, bool)> {
    let mut delta = Vec::new();
    for code in 0..=KEY_MAX {
        let was = bit_is_set(before, code);
        let is = bit_is_set(now, code);
        if was != is {
            delta.push((code as u16, is));
        }
    }
    delta
}

pub(crate) struct DeviceInner {
    manager: Weak<ManagerInner>,
    node: PathBuf,
    caps: Capabilities,
    fd: Cell<RawFd>,
    kbd: RefCell<KeyboardState>,
    watch: RefCell<Option<FdSource>>,
    repeat_timer: RefCell<Option<TimerSource>>,
    repeat_event: RefCell<Option<InputEvent>>,
    pressed: RefCell<[u8; KEY_BITS_LEN]>,
}

impl fmt::Debug for DeviceInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("node", &self.node)
            .field("caps", &self.caps)
            .field("fd", &self.fd.get())
            .finish_non_exhaustive()
    }
}

impl DeviceInner {
    pub(crate) fn new(
        manager: &Rc<ManagerInner>,
        node: PathBuf,
        caps: Capabilities,
    ) -> Rc<DeviceInner> {
        Rc::new(DeviceInner {
            manager: Rc::downgrade(manager),
            node,
            caps,
            fd: Cell::new(-1),
            kbd: RefCell::new(KeyboardState::new(manager.keymap())),
            watch: RefCell::new(None),
            repeat_timer: RefCell::new(None),
            repeat_event: RefCell::new(None),
            pressed: RefCell::new([0u8; KEY_BITS_LEN]),
        })
    }

    pub(crate) fn node(&self) -> &Path {
        &self.node
    }

    /// Open the node, resync the keyboard state and start reading.
    pub(crate) fn wake(this: &Rc<Self>) -> Result<(), Error> {
        if this.fd.get() >= 0 {
            return Ok(());
        }
        let Some(manager) = this.manager.upgrade() else {
            return Ok(());
        };

        let fd = open(
            &this.node,
            OFlag::O_RDONLY | OFlag::O_NONBLOCK | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(|source| Error::Open {
            path: this.node.clone(),
            source,
        })?;

        // Rebuild the automaton against the LEDs the device shows right now.
        let mut leds = [0u8; LED_BITS_LEN];
        if this.caps.contains(Capabilities::LEDS) {
            if let Err(err) = unsafe { ioctls::ev_get_led_state(fd, &mut leds) } {
                warn!("EVIOCGLED on {} failed: {}", this.node.display(), err);
                leds = [0u8; LED_BITS_LEN];
            }
        }
        this.kbd.borrow_mut().reset(&leds);

        // Reconcile keys that changed while we were not reading.
        let mut now = [0u8; KEY_BITS_LEN];
        match unsafe { ioctls::ev_get_key_state(fd, &mut now) } {
            Ok(_) => {
                let before = *this.pressed.borrow();
                let mut kbd = this.kbd.borrow_mut();
                for (code, is_down) in pressed_delta(&before, &now) {
                    trace!("Reconciling key {} -> {}", code, is_down);
                    let direction = if is_down {
                        xkb::KeyDirection::Down
                    } else {
                        xkb::KeyDirection::Up
                    };
                    kbd.inject(direction, code);
                }
            }
            Err(err) => warn!("EVIOCGKEY on {} failed: {}", this.node.display(), err),
        }

        let weak = Rc::downgrade(this);
        let watch = match manager.eloop().add_fd(fd, Readiness::READABLE, move |ready| {
            if let Some(dev) = weak.upgrade() {
                DeviceInner::on_ready(&dev, ready);
            }
        }) {
            Ok(watch) => watch,
            Err(err) => {
                let _ = close(fd);
                return Err(err.into());
            }
        };
        this.fd.set(fd);
        *this.watch.borrow_mut() = Some(watch);
        Ok(())
    }

    /// Stop reading, snapshot the pressed keys and close the node.
    pub(crate) fn sleep(&self) {
        let fd = self.fd.get();
        if fd < 0 {
            return;
        }
        let mut bits = [0u8; KEY_BITS_LEN];
        match unsafe { ioctls::ev_get_key_state(fd, &mut bits) } {
            Ok(_) => *self.pressed.borrow_mut() = bits,
            Err(err) => {
                warn!("EVIOCGKEY on {} failed: {}", self.node.display(), err);
                *self.pressed.borrow_mut() = [0u8; KEY_BITS_LEN];
            }
        }
        self.stop_repeat();
        self.watch.borrow_mut().take();
        if let Err(err) = close(fd) {
            warn!("Failed to close {}: {}", self.node.display(), err);
        }
        self.fd.set(-1);
    }

    /// Release all resources without touching the aggregator's device list.
    pub(crate) fn teardown(&self) {
        self.repeat_timer.borrow_mut().take();
        self.repeat_event.borrow_mut().take();
        self.watch.borrow_mut().take();
        let fd = self.fd.get();
        if fd >= 0 {
            let _ = close(fd);
            self.fd.set(-1);
        }
    }

    /// Self-detach: the device found its node dead and removes itself.
    fn destroy(this: &Rc<Self>) {
        debug!("Destroying input device {}", this.node.display());
        if let Some(manager) = this.manager.upgrade() {
            manager.drop_device(this);
        } else {
            this.teardown();
        }
    }

    fn on_ready(this: &Rc<Self>, ready: Readiness) {
        if ready.intersects(Readiness::HUP | Readiness::ERR) {
            debug!("Input device {} hung up", this.node.display());
            DeviceInner::destroy(this);
            return;
        }

        let mut buf: [libc::input_event; EVENT_BATCH] = unsafe { mem::zeroed() };
        loop {
            let fd = this.fd.get();
            if fd < 0 {
                return;
            }
            let bytes = unsafe {
                slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut u8, EVENT_BATCH * RECORD_SIZE)
            };
            match read(fd, bytes) {
                Ok(0) => {
                    debug!("EOF on input device {}", this.node.display());
                    DeviceInner::destroy(this);
                    return;
                }
                Ok(len) if len % RECORD_SIZE != 0 => {
                    warn!(
                        "Unaligned read of {} bytes from {}, dropping",
                        len,
                        this.node.display()
                    );
                    return;
                }
                Ok(len) => {
                    for record in &buf[..len / RECORD_SIZE] {
                        DeviceInner::handle_record(this, record);
                        if this.fd.get() < 0 {
                            // A hook tore the device down.
                            return;
                        }
                    }
                }
                Err(nix::errno::Errno::EAGAIN) => return,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => {
                    warn!("Reading from {} failed: {}", this.node.display(), err);
                    DeviceInner::destroy(this);
                    return;
                }
            }
        }
    }

    fn handle_record(this: &Rc<Self>, record: &libc::input_event) {
        if record.type_ != EV_KEY {
            return;
        }
        let Some(manager) = this.manager.upgrade() else {
            return;
        };

        let key_state = KeyState::from_value(record.value);
        let event = this.kbd.borrow_mut().process(key_state, record.code);
        let led_update = this.kbd.borrow_mut().take_led_update();
        if let Some(update) = led_update {
            this.write_leds(update);
        }

        if key_state == KeyState::Released {
            let repeating = this
                .repeat_event
                .borrow()
                .as_ref()
                .map(|ev| ev.keycode == record.code as u32)
                .unwrap_or(false);
            if repeating {
                this.stop_repeat();
            }
        }

        if let Some(mut event) = event {
            if manager.keymap().key_repeats(record.code) {
                *this.repeat_event.borrow_mut() = Some(event.clone());
                DeviceInner::arm_repeat(this, &manager);
            }
            manager.feed(&mut event);
        }
    }

    fn arm_repeat(this: &Rc<Self>, manager: &Rc<ManagerInner>) {
        let (delay, rate) = manager.repeat_spec();
        let spec = TimerSpec::repeating(
            Duration::from_millis(delay as u64),
            Duration::from_millis(rate as u64),
        );
        let mut timer = this.repeat_timer.borrow_mut();
        match &*timer {
            Some(existing) => {
                if let Err(err) = existing.update(spec) {
                    warn!("Re-arming the repeat timer failed: {}", err);
                }
            }
            None => {
                let weak = Rc::downgrade(this);
                match manager.eloop().add_timer(spec, move |_| {
                    if let Some(dev) = weak.upgrade() {
                        dev.fire_repeat();
                    }
                }) {
                    Ok(source) => *timer = Some(source),
                    Err(err) => warn!("Creating the repeat timer failed: {}", err),
                }
            }
        }
    }

    fn stop_repeat(&self) {
        self.repeat_event.borrow_mut().take();
        if let Some(timer) = &*self.repeat_timer.borrow() {
            if let Err(err) = timer.update(TimerSpec::disarmed()) {
                warn!("Disarming the repeat timer failed: {}", err);
            }
        }
    }

    /// Re-fire the stored repeat event through the hook list.
    fn fire_repeat(&self) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let event = self.repeat_event.borrow().clone();
        match event {
            Some(mut event) => {
                event.handled = false;
                manager.feed(&mut event);
            }
            None => self.stop_repeat(),
        }
    }

    /// Push the indicator set to the device, one `EV_LED` record per known
    /// LED (num, caps, scroll).
    fn write_leds(&self, leds: Leds) {
        let fd = self.fd.get();
        if fd < 0 || !self.caps.contains(Capabilities::LEDS) {
            return;
        }
        let mut records: [libc::input_event; 3] = unsafe { mem::zeroed() };
        for (record, (flag, code)) in records.iter_mut().zip(Leds::CODES) {
            record.type_ = EV_LED;
            record.code = code as u16;
            record.value = leds.contains(flag) as i32;
        }
        let bytes = unsafe {
            slice::from_raw_parts(records.as_ptr() as *const u8, records.len() * RECORD_SIZE)
        };
        // The node is open read-only; treat a refused write as best-effort.
        if let Err(err) = write(fd, bytes) {
            debug!("LED write-back to {} failed: {}", self.node.display(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_state_from_value() {
        assert_eq!(KeyState::from_value(0), KeyState::Released);
        assert_eq!(KeyState::from_value(1), KeyState::Pressed);
        assert_eq!(KeyState::from_value(2), KeyState::Repeated);
        assert_eq!(KeyState::from_value(5), KeyState::Repeated);
    }

    #[test]
    fn pressed_delta_reports_exact_changes() {
        let mut before = [0u8; KEY_BITS_LEN];
        let mut now = [0u8; KEY_BITS_LEN];

        // 30 pressed in both snapshots, 31 released while asleep, 32 pressed
        // while asleep.
        before[30 / 8] |= 1 << (30 % 8);
        now[30 / 8] |= 1 << (30 % 8);
        before[31 / 8] |= 1 << (31 % 8);
        now[32 / 8] |= 1 << (32 % 8);

        let delta = pressed_delta(&before, &now);
        assert_eq!(delta, vec![(31, false), (32, true)]);
    }

    #[test]
    fn empty_delta_for_identical_snapshots() {
        let snapshot = [0xaau8; KEY_BITS_LEN];
        assert!(pressed_delta(&snapshot, &snapshot).is_empty());
    }
}
