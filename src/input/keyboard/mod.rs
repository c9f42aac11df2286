//! XKB-based keyboard state tracking.
//!
//! A [`Keymap`] bundles an xkbcommon context, a compiled keymap and the
//! resolved indexes of the lock indicators. It is compiled once per
//! aggregator and shared by all keyboard devices on that aggregator. Every
//! device owns a [`KeyboardState`]: the mutable xkb state automaton plus the
//! last known modifier mask and [`Leds`] set.

use std::fmt;
use std::rc::Rc;

use smallvec::SmallVec;
use thiserror::Error;
use tracing::trace;

pub use xkbcommon::xkb::{self, keysyms, Keycode, Keysym};

use super::{bit_is_set, InputEvent, CODEPOINT_INVALID};

mod modifiers_state;
mod xkb_config;

pub use modifiers_state::Modifiers;
pub(crate) use modifiers_state::modifiers_from_state;
pub use xkb_config::XkbConfig;

/// Evdev keycodes are offset by 8 in XKB keymaps, a leftover of X's keycode
/// numbering.
pub(crate) const EVDEV_OFFSET: u32 = 8;

// The three keyboard LEDs and the evdev key codes that toggle them.
pub(crate) const LED_NUML: usize = 0x00;
pub(crate) const LED_CAPSL: usize = 0x01;
pub(crate) const LED_SCROLLL: usize = 0x02;
pub(crate) const KEY_NUMLOCK: u16 = 69;
pub(crate) const KEY_CAPSLOCK: u16 = 58;
pub(crate) const KEY_SCROLLLOCK: u16 = 70;

/// Errors that can be encountered when compiling a keymap
#[derive(Debug, Error)]
pub enum Error {
    /// libxkbcommon could not load any keymap
    #[error("Libxkbcommon could not load the specified keymap")]
    BadKeymap,
}

bitflags::bitflags! {
    /// The three lock indicators of a legacy keyboard.
    ///
    /// A set bit means the indicator is lit. Indicators the keymap does not
    /// define never light up.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Leds: u32 {
        /// Num lock
        const NUM = 0x01;
        /// Caps lock
        const CAPS = 0x02;
        /// Scroll lock
        const SCROLL = 0x04;
    }
}

impl Leds {
    /// Indicators paired with the evdev LED codes that drive them.
    pub(crate) const CODES: [(Leds, usize); 3] = [
        (Leds::NUM, LED_NUML),
        (Leds::CAPS, LED_CAPSL),
        (Leds::SCROLL, LED_SCROLLL),
    ];
}

/// A compiled keymap, shared by every device of one aggregator.
pub struct Keymap {
    context: xkb::Context,
    keymap: xkb::Keymap,
    // xkb index per `Leds::CODES` entry; `None` when the keymap does not
    // define the indicator.
    led_indexes: [Option<xkb::LedIndex>; 3],
}

impl fmt::Debug for Keymap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keymap")
            .field("context", &self.context.get_raw_ptr())
            .field("keymap", &self.keymap.get_raw_ptr())
            .field("led_indexes", &self.led_indexes)
            .finish()
    }
}

impl Keymap {
    /// Compile a keymap from the given configuration.
    ///
    /// A supplied keymap text is preferred; when it does not compile, the
    /// rules/model/layout/variant/options names are tried, and when those
    /// fail as well the all-empty tuple (the system default map) is the last
    /// resort.
    pub fn new(config: &XkbConfig) -> Result<Keymap, Error> {
        let context = xkb::Context::new(xkb::CONTEXT_NO_FLAGS);
        let keymap = match config.compile_keymap(&context) {
            Ok(keymap) => keymap,
            Err(()) => {
                tracing::warn!("Compiling the configured keymap failed, using the system default");
                XkbConfig::default()
                    .compile_keymap(&context)
                    .map_err(|()| Error::BadKeymap)?
            }
        };
        let led_indexes = [xkb::LED_NAME_NUM, xkb::LED_NAME_CAPS, xkb::LED_NAME_SCROLL]
            .map(|name| match keymap.led_get_index(name) {
                xkb::LED_INVALID => None,
                index => Some(index),
            });
        Ok(Keymap {
            context,
            keymap,
            led_indexes,
        })
    }

    /// The keymap in XKB text format.
    pub fn as_string(&self) -> String {
        self.keymap.get_as_string(xkb::KEYMAP_FORMAT_TEXT_V1)
    }

    /// Whether the given evdev keycode auto-repeats under this keymap.
    pub fn key_repeats(&self, code: u16) -> bool {
        self.keymap.key_repeats((code as u32 + EVDEV_OFFSET).into())
    }

    /// The indicators lit under `state`, restricted to those the keymap maps.
    fn lit_leds(&self, state: &xkb::State) -> Leds {
        let mut lit = Leds::empty();
        for ((flag, _), index) in Leds::CODES.iter().zip(self.led_indexes) {
            if index.map_or(false, |idx| state.led_index_is_active(idx)) {
                lit |= *flag;
            }
        }
        lit
    }
}

/// Key transition reported by an evdev record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    /// The key was released (`value == 0`)
    Released,
    /// The key was pressed (`value == 1`)
    Pressed,
    /// Kernel auto-repeat (`value >= 2`)
    Repeated,
}

impl KeyState {
    /// Map an `input_event` value to a key transition.
    pub fn from_value(value: i32) -> KeyState {
        match value {
            0 => KeyState::Released,
            1 => KeyState::Pressed,
            _ => KeyState::Repeated,
        }
    }
}

/// Per-device keyboard state.
pub struct KeyboardState {
    keymap: Rc<Keymap>,
    state: xkb::State,
    mods: Modifiers,
    leds: Leds,
    led_update: Option<Leds>,
}

impl fmt::Debug for KeyboardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyboardState")
            .field("mods", &self.mods)
            .field("leds", &self.leds)
            .finish_non_exhaustive()
    }
}

impl KeyboardState {
    /// Create a fresh state automaton for the shared keymap.
    pub fn new(keymap: &Rc<Keymap>) -> KeyboardState {
        let state = xkb::State::new(&keymap.keymap);
        let mods = modifiers_from_state(&state);
        let leds = keymap.lit_leds(&state);
        KeyboardState {
            keymap: keymap.clone(),
            state,
            mods,
            leds,
            led_update: None,
        }
    }

    /// The current modifier mask.
    pub fn mods(&self) -> Modifiers {
        self.mods
    }

    /// Translate one evdev key record.
    ///
    /// Kernel auto-repeats are discarded; repetition is synthesised by the
    /// per-device repeat timer instead. Releases and keycodes without keysyms
    /// update the automaton but produce no event.
    pub fn process(&mut self, key_state: KeyState, code: u16) -> Option<InputEvent> {
        if key_state == KeyState::Repeated {
            return None;
        }

        let keycode: Keycode = (code as u32 + EVDEV_OFFSET).into();
        let direction = match key_state {
            KeyState::Pressed => xkb::KeyDirection::Down,
            _ => xkb::KeyDirection::Up,
        };

        let keysyms: SmallVec<[Keysym; 4]> = self.state.key_get_syms(keycode).iter().copied().collect();
        let components = self.state.update_key(keycode, direction);
        if components != 0 {
            self.mods = modifiers_from_state(&self.state);
        }
        let lit = self.keymap.lit_leds(&self.state);
        if lit != self.leds {
            self.leds = lit;
            self.led_update = Some(lit);
        }

        if keysyms.is_empty() || key_state == KeyState::Released {
            return None;
        }

        let codepoints: SmallVec<[u32; 4]> = keysyms
            .iter()
            .map(|sym| sym.key_char().map(|c| c as u32).unwrap_or(CODEPOINT_INVALID))
            .collect();
        let ascii = match codepoints[0] {
            cp if cp <= 0x7f => cp as u8,
            _ => 0,
        };
        trace!("Key {} pressed, {} keysyms", code, keysyms.len());
        Some(InputEvent {
            handled: false,
            keycode: code as u32,
            ascii,
            mods: self.mods,
            keysyms,
            codepoints,
        })
    }

    /// Feed a key transition into the automaton without producing an event.
    ///
    /// Used to reconcile keys that changed while the device was asleep.
    pub fn inject(&mut self, direction: xkb::KeyDirection, code: u16) {
        self.state
            .update_key((code as u32 + EVDEV_OFFSET).into(), direction);
        self.mods = modifiers_from_state(&self.state);
        self.leds = self.keymap.lit_leds(&self.state);
    }

    /// Discard the automaton and rebuild it against a device LED snapshot.
    ///
    /// Each lit lock LED is reproduced by toggling the corresponding lock
    /// key, so the fresh automaton agrees with what the device shows. The
    /// device already displays this state, so no LED write-back is queued.
    pub fn reset(&mut self, leds: &[u8]) {
        self.state = xkb::State::new(&self.keymap.keymap);
        for (led, code) in [
            (LED_NUML, KEY_NUMLOCK),
            (LED_CAPSL, KEY_CAPSLOCK),
            (LED_SCROLLL, KEY_SCROLLLOCK),
        ] {
            if bit_is_set(leds, led) {
                let keycode: Keycode = (code as u32 + EVDEV_OFFSET).into();
                self.state.update_key(keycode, xkb::KeyDirection::Down);
                self.state.update_key(keycode, xkb::KeyDirection::Up);
            }
        }
        self.mods = modifiers_from_state(&self.state);
        self.leds = self.keymap.lit_leds(&self.state);
        self.led_update = None;
    }

    /// The indicator set to push to the device, if it changed since the last
    /// call.
    pub fn take_led_update(&mut self) -> Option<Leds> {
        self.led_update.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Evdev codes used below: 30 = A, 42 = left shift, 28 = enter.
    const KEY_A: u16 = 30;
    const KEY_LEFTSHIFT: u16 = 42;
    const KEY_ENTER: u16 = 28;

    fn keymap() -> Rc<Keymap> {
        Rc::new(Keymap::new(&XkbConfig::default()).unwrap())
    }

    #[test]
    fn press_produces_event_release_does_not() {
        let keymap = keymap();
        let mut kbd = KeyboardState::new(&keymap);

        let event = kbd.process(KeyState::Pressed, KEY_A).unwrap();
        assert_eq!(event.keycode, KEY_A as u32);
        assert_eq!(event.keysyms.len(), event.codepoints.len());
        assert_eq!(event.codepoints[0], 'a' as u32);
        assert_eq!(event.ascii, b'a');
        assert!(!event.handled);

        assert!(kbd.process(KeyState::Released, KEY_A).is_none());
    }

    #[test]
    fn kernel_repeats_are_discarded() {
        let keymap = keymap();
        let mut kbd = KeyboardState::new(&keymap);

        kbd.process(KeyState::Pressed, KEY_A).unwrap();
        assert!(kbd.process(KeyState::Repeated, KEY_A).is_none());
    }

    #[test]
    fn shift_changes_modifier_mask() {
        let keymap = keymap();
        let mut kbd = KeyboardState::new(&keymap);

        let event = kbd.process(KeyState::Pressed, KEY_LEFTSHIFT);
        // Shift itself carries a keysym; its ascii representation is 0.
        if let Some(event) = event {
            assert_eq!(event.ascii, 0);
        }
        let event = kbd.process(KeyState::Pressed, KEY_A).unwrap();
        assert!(event.mods.contains(Modifiers::SHIFT));
        assert_eq!(event.codepoints[0], 'A' as u32);

        kbd.process(KeyState::Released, KEY_LEFTSHIFT);
        kbd.process(KeyState::Released, KEY_A);
        let event = kbd.process(KeyState::Pressed, KEY_A).unwrap();
        assert!(!event.mods.contains(Modifiers::SHIFT));
    }

    #[test]
    fn enter_is_control_ascii() {
        let keymap = keymap();
        let mut kbd = KeyboardState::new(&keymap);

        let event = kbd.process(KeyState::Pressed, KEY_ENTER).unwrap();
        assert_eq!(event.ascii, b'\r');
    }

    #[test]
    fn reset_reproduces_led_locks() {
        let keymap = keymap();
        let mut kbd = KeyboardState::new(&keymap);

        // Caps lock LED lit in the snapshot.
        let leds = [1u8 << LED_CAPSL];
        kbd.reset(&leds);
        assert!(kbd.mods().contains(Modifiers::LOCK));

        let event = kbd.process(KeyState::Pressed, KEY_A).unwrap();
        assert_eq!(event.codepoints[0], 'A' as u32);

        kbd.reset(&[0u8]);
        assert!(!kbd.mods().contains(Modifiers::LOCK));
    }

    #[test]
    fn caps_lock_toggle_queues_led_update() {
        let keymap = keymap();
        let mut kbd = KeyboardState::new(&keymap);
        assert!(kbd.take_led_update().is_none());

        kbd.process(KeyState::Pressed, KEY_CAPSLOCK);
        let update = kbd.take_led_update().expect("led update after caps lock");
        assert!(update.contains(Leds::CAPS));
        assert!(kbd.take_led_update().is_none());
    }

    #[test]
    fn keymap_text_roundtrip() {
        let keymap = keymap();
        let text = keymap.as_string();
        assert!(text.contains("xkb_keymap"));

        let config = XkbConfig {
            keymap: Some(text),
            ..Default::default()
        };
        let recompiled = Keymap::new(&config).unwrap();
        let mut kbd = KeyboardState::new(&Rc::new(recompiled));
        assert!(kbd.process(KeyState::Pressed, KEY_A).is_some());
    }
}
