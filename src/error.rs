use std::{error, fmt, io};

#[derive(Debug)]
pub struct Error(ErrorImpl);

#[derive(Debug)]
enum ErrorImpl {
    Io(io::Error),
    Config(toml::de::Error),
    Keylog(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ssh dissector error: {:?}", self.0)
    }
}

impl error::Error for Error {}

impl Error {
    pub(crate) fn io(err: io::Error) -> Self {
        Self(ErrorImpl::Io(err))
    }

    pub(crate) fn config(err: toml::de::Error) -> Self {
        Self(ErrorImpl::Config(err))
    }

    pub(crate) fn keylog(msg: impl Into<String>) -> Self {
        Self(ErrorImpl::Keylog(msg.into()))
    }
}
