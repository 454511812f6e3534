//! A passive SSH transport analyzer.
//!
//! The dissector reconstructs the SSH binary packet protocol from the two byte streams
//! of a captured connection, reports every field to a [`Sink`], and decrypts the
//! records of sessions whose key exchange private key is known from a keylog.

mod consts;
mod error;
mod hostauth;
mod userauth;
mod util;

pub mod cipher;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod kex;
pub mod keylog;
pub mod keys;
pub mod negotiate;
pub mod sink;
pub mod transcript;
pub mod transport;

pub use crate::{
    config::Config,
    connection::{ChannelContext, ChannelId, NoSubsystem, Subsystem, SubsystemDispatch},
    error::Error,
    keylog::KeylogStore,
    sink::{Diagnostic, Field, Recorder, Sink, Source, Span, Value},
    transport::{Context, Direction, FrameId, Progress, ProtocolVersion, SessionState, Sessions},
    util::{ReadError, Reader},
};
