//! Dissector options.
//!
//! ```toml
//! desegment = true
//! keylog_path = "/tmp/ssh-keylog.txt"
//! ```

use crate::keylog::{self, KeylogStore};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Ask the reassembler for more bytes when a record spans several segments.
    pub desegment: bool,

    /// File with `<cookie> <private key>` lines, see [`KeylogStore`].
    pub keylog_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            desegment: true,
            keylog_path: None,
        }
    }
}

impl Config {
    pub fn from_toml(s: &str) -> Result<Self, crate::Error> {
        toml::from_str(s).map_err(crate::Error::config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let s = fs::read_to_string(path).map_err(crate::Error::io)?;
        Self::from_toml(&s)
    }

    /// Points the process-wide keylog at `keylog_path`, or resets it when unset.
    pub fn keylog(&self) -> Result<&'static KeylogStore, crate::Error> {
        let store = keylog::global();
        match self.keylog_path {
            Some(ref path) => store.open(path)?,
            None => store.reset(),
        }
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_keys() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert!(config.desegment);

        let config = Config::from_toml(
            r#"
            desegment = false
            keylog_path = "/var/tmp/keys.log"
            "#,
        )
        .unwrap();
        assert!(!config.desegment);
        assert_eq!(config.keylog_path, Some(PathBuf::from("/var/tmp/keys.log")));
    }

    #[test]
    fn rejects_bad_types() {
        assert!(Config::from_toml("desegment = 3").is_err());
    }
}
