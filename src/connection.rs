//! Connection protocol messages and channel-to-subsystem bindings.

// Refs:
// * https://tools.ietf.org/html/rfc4254

use crate::{
    consts,
    sink::{Field, Tree},
    transport::{Direction, FrameId},
    util::{ReadError, Reader},
};
use std::collections::HashMap;

// === Channel ===

/// A channel number as it appears in the `recipient channel` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u32);

/// Protocols carried inside a channel that have a parser of their own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Subsystem {
    Sftp,
}

impl Subsystem {
    pub fn from_name(name: &[u8]) -> Option<Self> {
        match name {
            b"sftp" => Some(Subsystem::Sftp),
            _ => None,
        }
    }
}

/// Where a chunk of subsystem data came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelContext {
    pub direction: Direction,
    pub channel: ChannelId,
    pub frame: FrameId,
}

/// Receiver of data sent on channels bound to a subsystem.
pub trait SubsystemDispatch {
    fn invoke(&mut self, subsystem: Subsystem, data: &[u8], cx: &ChannelContext);
}

impl<F> SubsystemDispatch for F
where
    F: FnMut(Subsystem, &[u8], &ChannelContext),
{
    fn invoke(&mut self, subsystem: Subsystem, data: &[u8], cx: &ChannelContext) {
        (self)(subsystem, data, cx)
    }
}

/// Drops all subsystem data.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSubsystem;

impl SubsystemDispatch for NoSubsystem {
    fn invoke(&mut self, _: Subsystem, _: &[u8], _: &ChannelContext) {}
}

/// Channel state of one direction, keyed by the recipient numbers that direction uses.
#[derive(Debug, Default)]
pub struct ChannelTable {
    bindings: HashMap<ChannelId, Subsystem>,
    // recipient number of this direction -> recipient number of the other one
    numbers: HashMap<ChannelId, ChannelId>,
}

impl ChannelTable {
    pub fn subsystem(&self, channel: ChannelId) -> Option<Subsystem> {
        self.bindings.get(&channel).copied()
    }

    fn bind(&mut self, other: &mut ChannelTable, channel: ChannelId, subsystem: Option<Subsystem>) {
        let paired = self.numbers.get(&channel).copied();
        match subsystem {
            Some(subsystem) => {
                tracing::trace!("bind {:?} to {:?}", channel, subsystem);
                self.bindings.insert(channel, subsystem);
                if let Some(paired) = paired {
                    other.bindings.insert(paired, subsystem);
                }
            }
            None => {
                self.bindings.remove(&channel);
                if let Some(paired) = paired {
                    other.bindings.remove(&paired);
                }
            }
        }
    }

    fn close(&mut self, other: &mut ChannelTable, channel: ChannelId) {
        self.bind(other, channel, None);
        if let Some(paired) = self.numbers.remove(&channel) {
            other.numbers.remove(&paired);
        }
    }
}

/// The channel tables of the sending direction and of the opposite one.
pub(crate) struct Channels<'a> {
    pub(crate) own: &'a mut ChannelTable,
    pub(crate) other: &'a mut ChannelTable,
}

pub(crate) fn dissect_message(
    msg_code: u8,
    r: &mut Reader<'_>,
    tree: &mut Tree<'_>,
    channels: Channels<'_>,
    cx: ChannelContext,
    subsystems: &mut dyn SubsystemDispatch,
) -> Result<(), ReadError> {
    let Channels { own, other } = channels;

    match msg_code {
        // Global requests described in https://tools.ietf.org/html/rfc4254#section-4
        consts::SSH_MSG_GLOBAL_REQUEST => {
            tracing::trace!("--> GLOBAL_REQUEST");
            tree.text(r, Field::GlobalRequestName)?;
            tree.boolean(r, Field::WantReply)?;
            tree.rest(r, Field::MessagePayload);
        }
        consts::SSH_MSG_REQUEST_SUCCESS | consts::SSH_MSG_REQUEST_FAILURE => {
            tracing::trace!("--> REQUEST_SUCCESS|REQUEST_FAILURE");
            tree.rest(r, Field::MessagePayload);
        }

        consts::SSH_MSG_CHANNEL_OPEN => {
            tracing::trace!("--> CHANNEL_OPEN");
            tree.text(r, Field::ChannelType)?;
            tree.u32(r, Field::SenderChannel)?;
            tree.u32(r, Field::InitialWindowSize)?;
            tree.u32(r, Field::MaximumPacketSize)?;
            tree.rest(r, Field::MessagePayload);
        }
        consts::SSH_MSG_CHANNEL_OPEN_CONFIRMATION => {
            tracing::trace!("--> CHANNEL_OPEN_CONFIRMATION");
            let recipient = ChannelId(tree.u32(r, Field::RecipientChannel)?);
            let sender = ChannelId(tree.u32(r, Field::SenderChannel)?);
            tree.u32(r, Field::InitialWindowSize)?;
            tree.u32(r, Field::MaximumPacketSize)?;
            tree.rest(r, Field::MessagePayload);

            // This side addresses the channel as `recipient` and the other side as `sender`.
            own.numbers.insert(recipient, sender);
            other.numbers.insert(sender, recipient);
        }
        consts::SSH_MSG_CHANNEL_OPEN_FAILURE => {
            tracing::trace!("--> CHANNEL_OPEN_FAILURE");
            tree.u32(r, Field::RecipientChannel)?;
            tree.u32(r, Field::OpenFailureReason)?;
            tree.text(r, Field::Description)?;
            tree.text(r, Field::LanguageTag)?;
        }
        consts::SSH_MSG_CHANNEL_WINDOW_ADJUST => {
            tracing::trace!("--> CHANNEL_WINDOW_ADJUST");
            tree.u32(r, Field::RecipientChannel)?;
            tree.u32(r, Field::WindowAdjustment)?;
        }

        consts::SSH_MSG_CHANNEL_DATA => {
            tracing::trace!("--> CHANNEL_DATA");
            let channel = ChannelId(tree.u32(r, Field::RecipientChannel)?);
            let data = tree.string(r, Field::ChannelData)?;
            if let Some(subsystem) = own.subsystem(channel) {
                subsystems.invoke(subsystem, data, &ChannelContext { channel, ..cx });
            }
        }
        consts::SSH_MSG_CHANNEL_EXTENDED_DATA => {
            tracing::trace!("--> CHANNEL_EXTENDED_DATA");
            tree.u32(r, Field::RecipientChannel)?;
            tree.u32(r, Field::ExtendedDataType)?;
            tree.string(r, Field::ChannelData)?;
        }

        consts::SSH_MSG_CHANNEL_EOF => {
            tracing::trace!("--> CHANNEL_EOF");
            tree.u32(r, Field::RecipientChannel)?;
        }
        consts::SSH_MSG_CHANNEL_CLOSE => {
            tracing::trace!("--> CHANNEL_CLOSE");
            let channel = ChannelId(tree.u32(r, Field::RecipientChannel)?);
            own.close(other, channel);
        }

        consts::SSH_MSG_CHANNEL_REQUEST => {
            tracing::trace!("--> CHANNEL_REQUEST");
            let channel = ChannelId(tree.u32(r, Field::RecipientChannel)?);
            let request = tree.text(r, Field::ChannelRequestName)?;
            tree.boolean(r, Field::WantReply)?;
            match request {
                b"subsystem" => {
                    let name = tree.text(r, Field::SubsystemName)?;
                    own.bind(other, channel, Subsystem::from_name(name));
                }
                b"exit-status" => {
                    tree.u32(r, Field::ExitStatus)?;
                }
                b"exec" => {
                    tree.text(r, Field::Command)?;
                }
                b"env" => {
                    tree.text(r, Field::EnvironmentName)?;
                    tree.text(r, Field::EnvironmentValue)?;
                }
                _ => {
                    tree.rest(r, Field::MessagePayload);
                }
            }
        }
        consts::SSH_MSG_CHANNEL_SUCCESS | consts::SSH_MSG_CHANNEL_FAILURE => {
            tracing::trace!("--> CHANNEL_SUCCESS|CHANNEL_FAILURE");
            tree.u32(r, Field::RecipientChannel)?;
        }

        typ => {
            tracing::trace!("unknown connection message (typ = {})", typ);
            tree.rest(r, Field::MessagePayload);
        }
    }

    Ok(())
}
