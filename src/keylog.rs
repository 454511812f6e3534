//! Out-of-band private keys, indexed by KEXINIT cookie.
//!
//! The file holds one mapping per line:
//!
//! ```text
//! <32 hex digits of the KEXINIT cookie> <hex private key of the side that sent it>
//! ```
//!
//! Blank lines and lines starting with `#` are ignored; malformed lines are skipped.

use crate::crypto::KeyMaterial;
use lazy_static::lazy_static;
use std::{
    collections::HashMap,
    convert::TryInto as _,
    fs,
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock},
    time::SystemTime,
};

pub const COOKIE_LEN: usize = 16;

lazy_static! {
    static ref GLOBAL: KeylogStore = KeylogStore::new();
}

/// The process-wide keylog.
pub fn global() -> &'static KeylogStore {
    &GLOBAL
}

#[derive(Debug, Default)]
pub struct KeylogStore {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    path: Option<PathBuf>,
    stamp: Option<FileStamp>,
    entries: HashMap<[u8; COOKIE_LEN], KeyMaterial>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
}

impl FileStamp {
    fn of(path: &Path) -> Option<Self> {
        let meta = fs::metadata(path).ok()?;
        Some(Self {
            len: meta.len(),
            modified: meta.modified().ok(),
        })
    }
}

impl KeylogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the store to `path` and reads it.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let span = tracing::trace_span!("KeylogStore::open");
        let _enter = span.enter();

        let path = path.as_ref();
        let text = read_text(path)?;

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.entries.clear();
        let n = inner.process_lines(&text);
        inner.stamp = FileStamp::of(path);
        inner.path = Some(path.to_owned());
        tracing::debug!("loaded {} keylog entries from {}", n, path.display());

        Ok(())
    }

    /// Forgets the file and every entry.
    pub fn reset(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *inner = Inner::default();
    }

    /// Adds the entries found in `text`, returning how many were accepted.
    pub fn load_str(&self, text: &str) -> usize {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.process_lines(text)
    }

    pub fn insert(&self, cookie: [u8; COOKIE_LEN], private: KeyMaterial) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.entries.insert(cookie, private);
    }

    /// Returns the private key registered for `cookie`, re-reading the file first
    /// when it changed since the last read.
    pub fn lookup(&self, cookie: &[u8]) -> Option<KeyMaterial> {
        let cookie: [u8; COOKIE_LEN] = cookie.try_into().ok()?;
        self.refresh();
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.entries.get(&cookie).cloned()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn refresh(&self) {
        let path = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            match inner.path {
                Some(ref path) if FileStamp::of(path) != inner.stamp => path.clone(),
                _ => return,
            }
        };

        tracing::trace!("keylog {} changed, reloading", path.display());
        let text = match read_text(&path) {
            Ok(text) => text,
            Err(err) => {
                tracing::debug!("failed to reload keylog {}: {}", path.display(), err);
                return;
            }
        };

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.entries.clear();
        inner.process_lines(&text);
        inner.stamp = FileStamp::of(&path);
    }
}

impl Inner {
    fn process_lines(&mut self, text: &str) -> usize {
        let mut n = 0;
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_line(line) {
                Some((cookie, private)) => {
                    self.entries.insert(cookie, private);
                    n += 1;
                }
                None => tracing::debug!("keylog line {}: invalid format", lineno + 1),
            }
        }
        n
    }
}

fn read_text(path: &Path) -> Result<String, crate::Error> {
    let raw = fs::read(path).map_err(crate::Error::io)?;
    String::from_utf8(raw)
        .map_err(|_| crate::Error::keylog(format!("{} is not valid UTF-8", path.display())))
}

fn parse_line(line: &str) -> Option<([u8; COOKIE_LEN], KeyMaterial)> {
    let mut fields = line.split_whitespace();
    let cookie = fields.next()?;
    let private = fields.next()?;
    if fields.next().is_some() {
        return None;
    }

    let cookie: [u8; COOKIE_LEN] = hex::decode(cookie).ok()?.try_into().ok()?;
    let private = KeyMaterial::from_hex(private)?;
    if private.is_empty() {
        return None;
    }
    Some((cookie, private))
}
