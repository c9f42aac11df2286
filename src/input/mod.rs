//!
//! Input device aggregation.
//!
//! An [`InputManager`] owns every keyboard device of one seat. Devices are
//! added by device-node path (hot-plug is driven by an out-of-scope udev
//! collaborator), probed for keyboard capabilities, and fed through a shared
//! XKB keymap. Translated [`InputEvent`]s are fanned out to an ordered list
//! of hook callbacks.
//!
//! The aggregator is reference-counted awake: seats and VT backends each take
//! their own wake reference, and the devices hold their evdev nodes open
//! exactly while at least one reference exists. Sleeping closes every device
//! fd; waking re-opens them and reconciles keys that were pressed or released
//! in between.
//!
//! ## Hook fan-out
//!
//! Every hook observes every event, in registration order, even after an
//! earlier hook marked the event as handled: the seat's hotkey filter must see
//! the `handled` flag of the VT filter before it, while diagnostic observers
//! may still want the event afterwards.

use std::{
    cell::{Cell, RefCell},
    fmt,
    path::{Path, PathBuf},
    rc::{Rc, Weak},
};

use smallvec::SmallVec;
use thiserror::Error;
use tracing::{debug, warn};

use crate::eloop::EventLoop;

mod device;
pub mod keyboard;

pub use keyboard::{KeyState, Keymap, Keysym, Modifiers, XkbConfig};

/// Sentinel codepoint for keysyms without a UCS mapping.
pub const CODEPOINT_INVALID: u32 = u32::MAX;

/// A translated keyboard event.
///
/// The event is handed to every hook of the aggregator by mutable reference;
/// it is not retained once the fan-out returns.
#[derive(Debug, Clone)]
pub struct InputEvent {
    /// Set by a hook that consumed the event. Later hooks still observe the
    /// event and may inspect this flag.
    pub handled: bool,
    /// The raw evdev keycode (without the XKB offset)
    pub keycode: u32,
    /// Best-effort 7-bit representation of the first keysym, `0` if there is
    /// none
    pub ascii: u8,
    /// Modifier mask in effect when the key went down
    pub mods: Modifiers,
    /// The keysyms produced by the keycode
    pub keysyms: SmallVec<[Keysym; 4]>,
    /// `codepoints[i]` is the UTF-32 value of `keysyms[i]`, or
    /// [`CODEPOINT_INVALID`]
    pub codepoints: SmallVec<[u32; 4]>,
}

impl InputEvent {
    /// Number of keysyms carried by this event.
    pub fn num_syms(&self) -> usize {
        self.keysyms.len()
    }
}

pub(crate) fn bit_is_set(bits: &[u8], idx: usize) -> bool {
    bits.get(idx / 8).map_or(false, |byte| byte & (1 << (idx % 8)) != 0)
}

/// Errors related to the input aggregator
#[derive(Debug, Error)]
pub enum Error {
    /// No keymap could be compiled
    #[error(transparent)]
    Keymap(#[from] keyboard::Error),
    /// Opening a device node failed
    #[error("Failed to open input device `{path}`")]
    Open {
        /// The device node
        path: PathBuf,
        /// The underlying OS error
        #[source]
        source: nix::Error,
    },
    /// Querying device capabilities failed
    #[error("Failed to probe input device `{path}`")]
    Probe {
        /// The device node
        path: PathBuf,
        /// The underlying OS error
        #[source]
        source: nix::Error,
    },
    /// The event loop refused a registration
    #[error(transparent)]
    Loop(#[from] crate::eloop::Error),
}

type HookCallback = RefCell<dyn FnMut(&mut InputEvent)>;

/// A registered input hook.
///
/// Dropping the token unregisters the callback.
pub struct HookToken {
    cb: Rc<HookCallback>,
}

impl fmt::Debug for HookToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookToken").finish_non_exhaustive()
    }
}

pub(crate) struct ManagerInner {
    eloop: EventLoop,
    keymap: Rc<Keymap>,
    repeat_delay_ms: u32,
    repeat_rate_ms: u32,
    awake: Cell<u32>,
    hooks: RefCell<Vec<Weak<HookCallback>>>,
    devices: RefCell<Vec<Rc<device::DeviceInner>>>,
}

impl ManagerInner {
    pub(crate) fn eloop(&self) -> &EventLoop {
        &self.eloop
    }

    pub(crate) fn keymap(&self) -> &Rc<Keymap> {
        &self.keymap
    }

    pub(crate) fn repeat_spec(&self) -> (u32, u32) {
        (self.repeat_delay_ms, self.repeat_rate_ms)
    }

    pub(crate) fn feed(&self, event: &mut InputEvent) {
        let hooks: Vec<_> = self.hooks.borrow().clone();
        for weak in hooks {
            if let Some(cb) = weak.upgrade() {
                (cb.borrow_mut())(event);
            }
        }
        self.hooks.borrow_mut().retain(|w| w.strong_count() > 0);
    }

    pub(crate) fn drop_device(&self, dev: &Rc<device::DeviceInner>) {
        dev.teardown();
        self.devices.borrow_mut().retain(|d| !Rc::ptr_eq(d, dev));
    }
}

/// Handle to the input aggregator of one seat.
///
/// This is a handle to the inner state, it can be cloned.
#[derive(Clone)]
pub struct InputManager {
    inner: Rc<ManagerInner>,
}

impl fmt::Debug for InputManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputManager")
            .field("awake", &self.inner.awake.get())
            .field("devices", &self.inner.devices.borrow().len())
            .finish_non_exhaustive()
    }
}

impl InputManager {
    /// Create an aggregator with the given keymap configuration and repeat
    /// timing (both in milliseconds).
    pub fn new(
        eloop: &EventLoop,
        config: &XkbConfig,
        repeat_delay_ms: u32,
        repeat_rate_ms: u32,
    ) -> Result<InputManager, Error> {
        let keymap = Rc::new(Keymap::new(config)?);
        Ok(InputManager {
            inner: Rc::new(ManagerInner {
                eloop: eloop.clone(),
                keymap,
                repeat_delay_ms,
                repeat_rate_ms,
                awake: Cell::new(0),
                hooks: RefCell::new(Vec::new()),
                devices: RefCell::new(Vec::new()),
            }),
        })
    }

    /// The shared keymap of this aggregator.
    pub fn keymap(&self) -> Rc<Keymap> {
        self.inner.keymap.clone()
    }

    /// Register a hook on the event fan-out.
    pub fn register_hook<F>(&self, cb: F) -> HookToken
    where
        F: FnMut(&mut InputEvent) + 'static,
    {
        let rc = Rc::new(RefCell::new(cb));
        let weak = Rc::downgrade(&rc) as Weak<HookCallback>;
        self.inner.hooks.borrow_mut().push(weak);
        HookToken { cb: rc }
    }

    /// Run an event through the hook list.
    ///
    /// This is the same fan-out the devices use; it is public so collaborators
    /// (and tests) can inject synthetic events.
    pub fn feed(&self, event: &mut InputEvent) {
        self.inner.feed(event);
    }

    /// Probe a device node and take ownership of it when it is a keyboard.
    ///
    /// Nodes without keyboard capabilities are silently dropped. When the
    /// aggregator is awake the device is woken immediately; a device that
    /// fails to wake is discarded.
    pub fn add_device<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        let caps = device::probe(path)?;
        if !caps.contains(device::Capabilities::KEYS) {
            debug!("Ignoring input device without keys: {}", path.display());
            return Ok(());
        }
        let dev = device::DeviceInner::new(&self.inner, path.to_path_buf(), caps);
        if self.is_awake() {
            if let Err(err) = device::DeviceInner::wake(&dev) {
                warn!("Could not wake new input device {}: {}", path.display(), err);
                return Ok(());
            }
        }
        debug!("New input device: {} ({:?})", path.display(), caps);
        self.inner.devices.borrow_mut().push(dev);
        Ok(())
    }

    /// Remove (and destroy) the device registered for `path`.
    pub fn remove_device<P: AsRef<Path>>(&self, path: P) {
        let path = path.as_ref();
        let dev = self
            .inner
            .devices
            .borrow()
            .iter()
            .find(|d| d.node() == path)
            .cloned();
        if let Some(dev) = dev {
            debug!("Removing input device: {}", path.display());
            self.inner.drop_device(&dev);
        }
    }

    /// Number of devices currently owned by the aggregator.
    pub fn device_count(&self) -> usize {
        self.inner.devices.borrow().len()
    }

    /// Take a wake reference.
    ///
    /// On the 0 → 1 transition all devices are woken; a device that fails to
    /// wake is destroyed so the aggregator ends up in a consistent state.
    pub fn wake_up(&self) {
        let prev = self.inner.awake.get();
        self.inner.awake.set(prev + 1);
        if prev != 0 {
            return;
        }
        let devices: Vec<_> = self.inner.devices.borrow().clone();
        for dev in devices {
            if let Err(err) = device::DeviceInner::wake(&dev) {
                warn!("Could not wake input device {}: {}", dev.node().display(), err);
                self.inner.drop_device(&dev);
            }
        }
    }

    /// Release a wake reference; on the 1 → 0 transition all devices sleep.
    pub fn sleep(&self) {
        let prev = self.inner.awake.get();
        if prev == 0 {
            warn!("Unbalanced sleep() on the input aggregator");
            return;
        }
        self.inner.awake.set(prev - 1);
        if prev == 1 {
            for dev in self.inner.devices.borrow().iter() {
                dev.sleep();
            }
        }
    }

    /// Whether at least one wake reference exists.
    pub fn is_awake(&self) -> bool {
        self.inner.awake.get() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::keyboard::keysyms;
    use super::*;

    fn manager() -> InputManager {
        let eloop = EventLoop::new().unwrap();
        InputManager::new(&eloop, &XkbConfig::default(), 250, 50).unwrap()
    }

    fn event() -> InputEvent {
        InputEvent {
            handled: false,
            keycode: 30,
            ascii: b'a',
            mods: Modifiers::empty(),
            keysyms: SmallVec::from_slice(&[Keysym::new(keysyms::KEY_a)]),
            codepoints: SmallVec::from_slice(&['a' as u32]),
        }
    }

    #[test]
    fn hooks_run_in_order_and_all_see_handled() {
        let manager = manager();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        let _first = manager.register_hook(move |ev| {
            o.borrow_mut().push((1, ev.handled));
            ev.handled = true;
        });
        let o = order.clone();
        let _second = manager.register_hook(move |ev| {
            o.borrow_mut().push((2, ev.handled));
        });

        let mut ev = event();
        manager.feed(&mut ev);
        assert!(ev.handled);
        assert_eq!(*order.borrow(), vec![(1, false), (2, true)]);
    }

    #[test]
    fn dropped_hook_is_unregistered() {
        let manager = manager();
        let hits = Rc::new(Cell::new(0u32));

        let h = hits.clone();
        let token = manager.register_hook(move |_| h.set(h.get() + 1));
        let mut ev = event();
        manager.feed(&mut ev);
        assert_eq!(hits.get(), 1);

        drop(token);
        manager.feed(&mut ev);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn wake_counter_is_reference_counted() {
        let manager = manager();
        assert!(!manager.is_awake());
        manager.wake_up();
        manager.wake_up();
        assert!(manager.is_awake());
        manager.sleep();
        assert!(manager.is_awake());
        manager.sleep();
        assert!(!manager.is_awake());
    }

    #[test]
    fn non_evdev_node_fails_probe() {
        let manager = manager();
        assert!(matches!(
            manager.add_device("/dev/null"),
            Err(Error::Probe { .. })
        ));
        assert_eq!(manager.device_count(), 0);
    }

    #[test]
    fn bit_helper() {
        let bits = [0b0000_0101u8, 0b1000_0000];
        assert!(bit_is_set(&bits, 0));
        assert!(!bit_is_set(&bits, 1));
        assert!(bit_is_set(&bits, 2));
        assert!(bit_is_set(&bits, 15));
        assert!(!bit_is_set(&bits, 16));
    }
}
