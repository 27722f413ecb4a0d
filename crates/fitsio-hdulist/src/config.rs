//! Session configuration.
//!
//! Every toggle that changes how cards are parsed or how data regions are
//! backed lives here and is passed explicitly to the open/parse entry points.

use log::warn;

/// How the block layer reaches the underlying bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    /// Seekable access. Data regions stay unloaded until first use and are
    /// then mapped (or copied when memory mapping is disabled).
    #[default]
    Random,
    /// Strictly sequential access. Data regions are copied as the scan
    /// passes them because the source cannot rewind.
    Stream,
}

/// Environment variable prefix consulted by [`Config::from_env`].
pub const ENV_PREFIX: &str = "FITSIO_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Recognize `KEY = 'field: value'` record-valued keyword cards.
    pub enable_record_valued_keyword_cards: bool,
    /// Match EXTNAME case-sensitively in [`crate::HduList::index_of`].
    pub extension_name_case_sensitive: bool,
    /// Drop trailing blanks from string values when parsing.
    pub strip_header_whitespace: bool,
    /// Map data regions instead of copying them into memory.
    pub use_memmap: bool,
    /// Make malformed cards and header consistency problems fatal.
    pub strict: bool,
    /// Stamp CHECKSUM/DATASUM on every HDU when flushing or writing.
    pub checksum: bool,
    pub access: AccessMode,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            enable_record_valued_keyword_cards: true,
            extension_name_case_sensitive: false,
            strip_header_whitespace: true,
            use_memmap: true,
            strict: false,
            checksum: false,
            access: AccessMode::Random,
        }
    }
}

impl Config {
    /// Defaults overridden by `FITSIO_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden through an arbitrary variable lookup.
    ///
    /// Values are integers: zero disables a toggle, anything else enables it.
    /// Unparsable values leave the default in place.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        let toggles: [(&str, &mut bool); 4] = [
            (
                "ENABLE_RECORD_VALUED_KEYWORD_CARDS",
                &mut config.enable_record_valued_keyword_cards,
            ),
            (
                "EXTENSION_NAME_CASE_SENSITIVE",
                &mut config.extension_name_case_sensitive,
            ),
            (
                "STRIP_HEADER_WHITESPACE",
                &mut config.strip_header_whitespace,
            ),
            ("USE_MEMMAP", &mut config.use_memmap),
        ];
        for (name, slot) in toggles {
            let var = format!("{ENV_PREFIX}{name}");
            if let Some(raw) = lookup(&var) {
                match raw.trim().parse::<i64>() {
                    Ok(n) => *slot = n != 0,
                    Err(_) => warn!("ignoring {var}={raw:?}: expected an integer"),
                }
            }
        }
        config
    }

    /// Copy of this configuration with strict mode switched on or off.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Copy of this configuration with checksum stamping switched on or off.
    pub fn checksum(mut self, checksum: bool) -> Self {
        self.checksum = checksum;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert!(c.enable_record_valued_keyword_cards);
        assert!(!c.extension_name_case_sensitive);
        assert!(c.strip_header_whitespace);
        assert!(c.use_memmap);
        assert!(!c.strict);
        assert!(!c.checksum);
        assert_eq!(c.access, AccessMode::Random);
    }

    #[test]
    fn lookup_overrides_toggles() {
        let c = Config::from_lookup(lookup(&[
            ("FITSIO_USE_MEMMAP", "0"),
            ("FITSIO_EXTENSION_NAME_CASE_SENSITIVE", "1"),
            ("FITSIO_STRIP_HEADER_WHITESPACE", " 0 "),
        ]));
        assert!(!c.use_memmap);
        assert!(c.extension_name_case_sensitive);
        assert!(!c.strip_header_whitespace);
        assert!(c.enable_record_valued_keyword_cards);
    }

    #[test]
    fn non_integer_values_keep_defaults() {
        let c = Config::from_lookup(lookup(&[
            ("FITSIO_USE_MEMMAP", "no"),
            ("FITSIO_ENABLE_RECORD_VALUED_KEYWORD_CARDS", "true"),
        ]));
        assert!(c.use_memmap);
        assert!(c.enable_record_valued_keyword_cards);
    }

    #[test]
    fn any_nonzero_enables() {
        let c = Config::from_lookup(lookup(&[("FITSIO_EXTENSION_NAME_CASE_SENSITIVE", "-3")]));
        assert!(c.extension_name_case_sensitive);
    }

    #[test]
    fn builder_helpers() {
        let c = Config::default().strict(true).checksum(true);
        assert!(c.strict);
        assert!(c.checksum);
    }
}
