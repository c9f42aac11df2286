pub use xkbcommon::xkb;

/// Configuration for xkbcommon.
///
/// For the fields that are left empty (as set in the `Default` impl),
/// xkbcommon will use the values from the environment variables
/// `XKB_DEFAULT_RULES`, `XKB_DEFAULT_MODEL`, `XKB_DEFAULT_LAYOUT`,
/// `XKB_DEFAULT_VARIANT` and `XKB_DEFAULT_OPTIONS`.
///
/// For details, see the [documentation at xkbcommon.org][docs].
///
/// [docs]: https://xkbcommon.org/doc/current/structxkb__rule__names.html
#[derive(Clone, Debug, Default)]
pub struct XkbConfig {
    /// The rules file to use.
    ///
    /// The rules file describes how to interpret the values of the model,
    /// layout, variant and options fields.
    pub rules: String,
    /// The keyboard model by which to interpret keycodes and LEDs.
    pub model: String,
    /// A comma separated list of layouts (languages) to include in the keymap.
    pub layout: String,
    /// A comma separated list of variants, one per layout, which may modify or
    /// augment the respective layout in various ways.
    pub variant: String,
    /// A comma separated list of options, through which the user specifies
    /// non-layout related preferences, like which key combinations are used
    /// for switching layouts.
    pub options: Option<String>,
    /// A complete keymap in XKB text format. When non-empty it takes
    /// precedence over the rules/model/layout/variant/options tuple.
    pub keymap: Option<String>,
}

impl XkbConfig {
    pub(crate) fn compile_keymap(&self, context: &xkb::Context) -> Result<xkb::Keymap, ()> {
        if let Some(text) = self.keymap.as_deref().filter(|text| !text.is_empty()) {
            if let Some(keymap) = xkb::Keymap::new_from_string(
                context,
                text.to_owned(),
                xkb::KEYMAP_FORMAT_TEXT_V1,
                xkb::KEYMAP_COMPILE_NO_FLAGS,
            ) {
                return Ok(keymap);
            }
            tracing::warn!("Compiling the supplied keymap text failed, falling back to names");
        }
        xkb::Keymap::new_from_names(
            context,
            &self.rules,
            &self.model,
            &self.layout,
            &self.variant,
            self.options.clone(),
            xkb::KEYMAP_COMPILE_NO_FLAGS,
        )
        .ok_or(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    #[test]
    fn keymap_loaded_from_a_file_compiles() {
        let context = xkb::Context::new(xkb::CONTEXT_NO_FLAGS);
        let text = XkbConfig::default()
            .compile_keymap(&context)
            .expect("system default keymap")
            .get_as_string(xkb::KEYMAP_FORMAT_TEXT_V1);

        // A stand-alone keymap file, as a daemon wrapper would ship it.
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file.flush().unwrap();

        let config = XkbConfig {
            keymap: Some(std::fs::read_to_string(file.path()).unwrap()),
            ..Default::default()
        };
        assert!(config.compile_keymap(&context).is_ok());
    }

    #[test]
    fn unparsable_keymap_text_falls_back_to_names() {
        let context = xkb::Context::new(xkb::CONTEXT_NO_FLAGS);
        let config = XkbConfig {
            keymap: Some("xkb_keymap { broken".to_owned()),
            ..Default::default()
        };
        assert!(config.compile_keymap(&context).is_ok());
    }

    #[test]
    fn empty_keymap_text_is_ignored() {
        let context = xkb::Context::new(xkb::CONTEXT_NO_FLAGS);
        let config = XkbConfig {
            keymap: Some(String::new()),
            ..Default::default()
        };
        assert!(config.compile_keymap(&context).is_ok());
    }
}
