use xkbcommon::xkb;

bitflags::bitflags! {
    /// The modifier mask carried by every input event.
    ///
    /// The bit assignment is stable: hotkey configuration and clients match
    /// against these exact values. Only the five modifiers below are
    /// surfaced; anything else a keymap defines is folded away.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Modifiers: u32 {
        /// The "shift" key
        const SHIFT = 0x01;
        /// The "caps lock" toggle
        const LOCK = 0x02;
        /// The "control" key
        const CONTROL = 0x04;
        /// The "alt" key
        const ALT = 0x08;
        /// The "logo" key, also known as the "windows" key on most keyboards
        const LOGO = 0x10;
    }
}

/// Derive the fixed modifier mask from the effective xkb state.
pub(crate) fn modifiers_from_state(state: &xkb::State) -> Modifiers {
    let mut mods = Modifiers::empty();
    if state.mod_name_is_active(xkb::MOD_NAME_SHIFT, xkb::STATE_MODS_EFFECTIVE) {
        mods |= Modifiers::SHIFT;
    }
    if state.mod_name_is_active(xkb::MOD_NAME_CAPS, xkb::STATE_MODS_EFFECTIVE) {
        mods |= Modifiers::LOCK;
    }
    if state.mod_name_is_active(xkb::MOD_NAME_CTRL, xkb::STATE_MODS_EFFECTIVE) {
        mods |= Modifiers::CONTROL;
    }
    if state.mod_name_is_active(xkb::MOD_NAME_ALT, xkb::STATE_MODS_EFFECTIVE) {
        mods |= Modifiers::ALT;
    }
    if state.mod_name_is_active(xkb::MOD_NAME_LOGO, xkb::STATE_MODS_EFFECTIVE) {
        mods |= Modifiers::LOGO;
    }
    mods
}
