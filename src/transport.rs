//! Passive dissection of the SSH transport layer.
//!
//! A [`SessionState`] follows one TCP connection. The caller hands it the bytes of each
//! direction in capture order and gets back either the offset where the next call should
//! start or a request for more bytes. Along the way the session parses identification
//! strings and binary packets, tracks the key exchange and, when the keylog knows a
//! private key of either side, derives the session keys and decrypts what follows.

// Refs:
// * https://tools.ietf.org/html/rfc4253
// * https://tools.ietf.org/html/rfc4251#section-5

use crate::{
    cipher::{CipherContext, Opened, OpenedRecord, PartialRecord, MAX_PACKET_LEN},
    config::Config,
    connection::{self, ChannelContext, ChannelId, ChannelTable, Channels, SubsystemDispatch},
    consts,
    crypto::{CryptoError, HashAlgorithm, KeyMaterial},
    kex::{self, DhGroup, GroupEvent, KexMessage, KeyExchangeMethod},
    keylog::KeylogStore,
    keys::{KeyScheduler, SessionKeys},
    negotiate::{self, DirectionAlgorithms, KexInit, LengthField},
    sink::{Diagnostic, Field, Sink, Source, Tree, Value},
    transcript::{ExchangeValues, TranscriptAccumulator},
    userauth,
    util::{starts_with_ignore_case, ReadError, Reader},
};
use bytes::Bytes;
use std::{collections::HashMap, hash::Hash, num::Wrapping};

/// Cleartext lengths at or above this are treated as garbage.
const MAX_CLEARTEXT_LEN: u32 = 0xffff;

// ==== Direction ====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    pub const BOTH: [Direction; 2] = [Direction::ClientToServer, Direction::ServerToClient];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn opposite(self) -> Self {
        match self {
            Direction::ClientToServer => Direction::ServerToClient,
            Direction::ServerToClient => Direction::ClientToServer,
        }
    }
}

/// The capture frame a chunk of bytes was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    Unknown,
    V1,
    V2,
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        ProtocolVersion::Unknown
    }
}

/// The outcome of one call to [`SessionState::dissect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Everything up to `next_offset` was consumed.
    Complete { next_offset: usize },
    /// The record at `resume_offset` is incomplete. `hint` is the number of missing
    /// bytes, or `None` when only "one more segment" can be asked for.
    NeedMore {
        resume_offset: usize,
        hint: Option<usize>,
    },
}

impl Progress {
    /// The reassembly signal `(need_more, resume_offset, hint_len)`.
    pub fn as_signal(self) -> (bool, usize, Option<usize>) {
        match self {
            Progress::Complete { next_offset } => (false, next_offset, None),
            Progress::NeedMore {
                resume_offset,
                hint,
            } => (true, resume_offset, hint),
        }
    }
}

/// Everything a call to the dissector needs besides the session itself.
pub struct Context<'a> {
    pub config: &'a Config,
    pub keylog: &'a KeylogStore,
    pub sink: &'a mut dyn Sink,
    pub subsystems: &'a mut dyn SubsystemDispatch,
}

// ==== PeerState ====

#[derive(Debug)]
enum CipherState {
    /// Before the first NEWKEYS of this direction.
    Unkeyed,
    Keyed(Box<CipherContext>),
    /// Encrypted but not decryptable.
    Opaque {
        length_field: LengthField,
        mac_length: usize,
    },
}

impl CipherState {
    fn opaque(algs: &DirectionAlgorithms) -> Self {
        CipherState::Opaque {
            length_field: algs.length_field,
            mac_length: algs.mac_length,
        }
    }
}

impl Default for CipherState {
    fn default() -> Self {
        CipherState::Unkeyed
    }
}

/// The state of one direction of a session.
#[derive(Debug, Default)]
pub struct PeerState {
    version_frames: Option<(FrameId, FrameId)>,
    kex_init_frames: Option<(FrameId, FrameId)>,
    kexinit: Option<KexInit>,
    negotiated: DirectionAlgorithms,
    cipher: CipherState,
    sequence_number: Wrapping<u32>,
    pending_fragment: Option<PartialRecord>,
    channels: ChannelTable,
}

impl PeerState {
    /// The sequence number of the next record sent in this direction.
    pub fn sequence_number(&self) -> u32 {
        self.sequence_number.0
    }

    pub fn negotiated(&self) -> &DirectionAlgorithms {
        &self.negotiated
    }

    /// Whether records of this direction are being decrypted.
    pub fn is_keyed(&self) -> bool {
        matches!(self.cipher, CipherState::Keyed(..))
    }

    /// Whether records of this direction are encrypted with unknown keys.
    pub fn is_opaque(&self) -> bool {
        matches!(self.cipher, CipherState::Opaque { .. })
    }

    /// First and last frame in which the identification string was looked for.
    pub fn version_frame_range(&self) -> Option<(FrameId, FrameId)> {
        self.version_frames
    }

    /// First and last frame carrying a KEXINIT of the current key exchange.
    pub fn kex_init_frame_range(&self) -> Option<(FrameId, FrameId)> {
        self.kex_init_frames
    }

    /// The KEXINIT of the current key exchange.
    pub fn kexinit(&self) -> Option<&KexInit> {
        self.kexinit.as_ref()
    }

    pub fn channels(&self) -> &ChannelTable {
        &self.channels
    }

    pub fn pending_fragment(&self) -> Option<&PartialRecord> {
        self.pending_fragment.as_ref()
    }

    fn next_sequence_number(&mut self) -> u32 {
        let n = self.sequence_number.0;
        self.sequence_number += Wrapping(1);
        n
    }

    fn disable_decryption(&mut self) {
        self.pending_fragment = None;
        self.cipher = CipherState::opaque(&self.negotiated);
    }
}

fn mark_frame(range: &mut Option<(FrameId, FrameId)>, frame: FrameId) {
    let start = range.map_or(frame, |(start, _)| start);
    *range = Some((start, frame));
}

fn in_window(range: Option<(FrameId, FrameId)>, frame: FrameId) -> bool {
    range.map_or(true, |(start, end)| start <= frame && frame <= end)
}

fn window(data: &[u8], from: usize, to: usize) -> &[u8] {
    data.get(from..to.min(data.len())).unwrap_or_default()
}

// ==== SessionState ====

#[derive(Debug, Default)]
struct KexRound {
    negotiated: bool,
    newkeys: [bool; 2],
}

/// What the dissector of a single record did.
enum Step {
    Consumed(usize),
    NeedMore(Option<usize>),
}

/// The state of one connection, shared by both directions.
#[derive(Debug, Default)]
pub struct SessionState {
    version: ProtocolVersion,
    negotiated_kex_method: Option<String>,
    host_key_algorithm: Option<String>,
    kex: Option<Box<dyn KeyExchangeMethod>>,
    hash: Option<HashAlgorithm>,
    transcript: TranscriptAccumulator,
    session_id: Option<Bytes>,
    exchange_hash: Option<Bytes>,
    public_e: Option<KeyMaterial>,
    public_f: Option<KeyMaterial>,
    group: Option<DhGroup>,
    derived_secret: Option<KeyMaterial>,
    next_keys: Option<SessionKeys>,
    round: KexRound,
    peers: [PeerState; 2],
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The protocol version announced by the client.
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// The exchange hash of the first key exchange.
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// The exchange hash of the current key exchange, once computed.
    pub fn exchange_hash(&self) -> Option<&[u8]> {
        self.exchange_hash.as_deref()
    }

    pub fn negotiated_kex_method(&self) -> Option<&str> {
        self.negotiated_kex_method.as_deref()
    }

    pub fn host_key_algorithm(&self) -> Option<&str> {
        self.host_key_algorithm.as_deref()
    }

    /// The handler bound to the negotiated key exchange method.
    pub fn kex_method(&self) -> Option<&dyn KeyExchangeMethod> {
        self.kex.as_deref()
    }

    /// The shared secret `K` of the current key exchange, once computed.
    pub fn shared_secret(&self) -> Option<&KeyMaterial> {
        self.derived_secret.as_ref()
    }

    pub fn transcript(&self) -> &TranscriptAccumulator {
        &self.transcript
    }

    pub fn peer(&self, direction: Direction) -> &PeerState {
        &self.peers[direction.index()]
    }

    /// Dissects `data`, the next bytes sent in `direction`.
    pub fn dissect(
        &mut self,
        direction: Direction,
        frame: FrameId,
        data: &[u8],
        cx: &mut Context<'_>,
    ) -> Progress {
        let span = tracing::trace_span!("SessionState::dissect", ?direction, frame = frame.0);
        let _enter = span.enter();

        let mut offset = 0;
        while offset < data.len() {
            let rest = window(data, offset, data.len());
            match self.dissect_record(direction, frame, rest, offset, cx) {
                Step::Consumed(0) => break,
                Step::Consumed(n) => offset += n,
                Step::NeedMore(hint) => {
                    tracing::trace!("--> NeedMore(offset={}, hint={:?})", offset, hint);
                    return Progress::NeedMore {
                        resume_offset: offset,
                        hint,
                    };
                }
            }
        }

        Progress::Complete {
            next_offset: offset,
        }
    }

    fn dissect_record(
        &mut self,
        direction: Direction,
        frame: FrameId,
        data: &[u8],
        base: usize,
        cx: &mut Context<'_>,
    ) -> Step {
        let idx = direction.index();

        if in_window(self.peers[idx].version_frames, frame) && starts_with_ignore_case(data, b"SSH-")
        {
            return self.dissect_banner(direction, frame, data, base, cx);
        }

        match self.version {
            ProtocolVersion::V2 => {}
            ProtocolVersion::V1 => return self.dissect_ssh1(direction, data, base, cx),
            ProtocolVersion::Unknown => {
                // started in the middle of a connection
                let algs = &self.peers[idx].negotiated;
                let mut tree = Tree::new(&mut *cx.sink, Source::Wire, base);
                emit_opaque(&mut tree, data, algs.length_field, algs.mac_length);
                return Step::Consumed(data.len());
            }
        }

        let peer = &mut self.peers[idx];
        let sequence_number = peer.sequence_number.0;
        match peer.cipher {
            CipherState::Unkeyed => self.dissect_cleartext(direction, frame, data, base, cx),
            CipherState::Keyed(ref mut cipher) => {
                let length_field = cipher.length_field();
                let opened = cipher.open_record(sequence_number, data, &mut peer.pending_fragment);
                self.dissect_opened(direction, frame, data, base, length_field, opened, cx)
            }
            CipherState::Opaque {
                length_field,
                mac_length,
            } => self.dissect_opaque(direction, data, base, length_field, mac_length, cx),
        }
    }

    // ==== identification string ====

    fn dissect_banner(
        &mut self,
        direction: Direction,
        frame: FrameId,
        data: &[u8],
        base: usize,
        cx: &mut Context<'_>,
    ) -> Step {
        let line_len = match data.iter().position(|&c| c == b'\n') {
            Some(pos) => pos + 1,
            None if cx.config.desegment => return Step::NeedMore(None),
            None => data.len(),
        };
        let line = window(data, 0, line_len);
        let banner_len = line.len()
            - line
                .iter()
                .rev()
                .take_while(|&&c| c == b'\r' || c == b'\n')
                .count();
        let banner = window(line, 0, banner_len);

        if direction == Direction::ClientToServer {
            // Only the client's version decides how the connection is parsed.
            if starts_with_ignore_case(banner, b"SSH-2.")
                || starts_with_ignore_case(banner, b"SSH-1.99-")
            {
                self.version = ProtocolVersion::V2;
            } else if starts_with_ignore_case(banner, b"SSH-1.") {
                self.version = ProtocolVersion::V1;
            }
        }
        tracing::debug!(
            "--> {:?} version: {:?}",
            direction,
            String::from_utf8_lossy(banner)
        );

        mark_frame(&mut self.peers[direction.index()].version_frames, frame);
        self.transcript.set_version(direction, banner);

        let mut tree = Tree::new(&mut *cx.sink, Source::Wire, base);
        tree.add(Field::Protocol, 0, banner.len(), Value::Text(banner));

        Step::Consumed(line.len())
    }

    // ==== binary packets ====

    fn dissect_cleartext(
        &mut self,
        direction: Direction,
        frame: FrameId,
        data: &[u8],
        base: usize,
        cx: &mut Context<'_>,
    ) -> Step {
        let desegment = cx.config.desegment;
        let mut tree = Tree::new(&mut *cx.sink, Source::Wire, base);

        let packet_length = match Reader::streaming(data).read_u32_be() {
            Ok(len) => len,
            Err(ReadError::NeedMore { .. }) if desegment => return Step::NeedMore(None),
            Err(..) => {
                tree.warn(0, data.len(), Diagnostic::Truncated);
                return Step::Consumed(data.len());
            }
        };

        let available = data.len() - 4;
        let mut len = packet_length as usize;
        if packet_length >= MAX_CLEARTEXT_LEN {
            tree.warn(
                0,
                4,
                Diagnostic::ImplausibleLength {
                    announced: packet_length,
                    available,
                },
            );
            len = available;
        } else if len > available {
            if desegment {
                return Step::NeedMore(Some(len - available));
            }
            tree.warn(0, data.len(), Diagnostic::Truncated);
            len = available;
        }

        tree.add(Field::PacketLength, 0, 4, Value::Uint(packet_length.into()));
        let sequence_number = self.peers[direction.index()].next_sequence_number();
        tree.add(
            Field::SequenceNumber,
            0,
            0,
            Value::Uint(sequence_number.into()),
        );

        let body = window(data, 4, 4 + len);
        let payload = dissect_packet_body(body, packet_length, &mut tree.nested(4));
        self.dispatch_message(
            direction,
            frame,
            payload,
            &mut tree.nested(5),
            cx.keylog,
            &mut *cx.subsystems,
        );

        Step::Consumed(4 + len)
    }

    #[allow(clippy::too_many_arguments)]
    fn dissect_opened(
        &mut self,
        direction: Direction,
        frame: FrameId,
        data: &[u8],
        base: usize,
        length_field: LengthField,
        opened: Result<Opened, CryptoError>,
        cx: &mut Context<'_>,
    ) -> Step {
        let idx = direction.index();

        match opened {
            Ok(Opened::Record(record)) => {
                self.dissect_decrypted(direction, frame, data, base, length_field, record, cx)
            }

            Ok(Opened::NeedMore { hint }) if cx.config.desegment => Step::NeedMore(hint),

            Ok(Opened::NeedMore { .. }) => {
                // The cipher cannot skip the missing bytes, so it is out of step from here.
                tracing::debug!("--> Opaque: {:?} record truncated", direction);
                let peer = &mut self.peers[idx];
                peer.disable_decryption();
                let mut tree = Tree::new(&mut *cx.sink, Source::Wire, base);
                tree.warn(0, data.len(), Diagnostic::Truncated);
                emit_opaque(&mut tree, data, length_field, peer.negotiated.mac_length);
                Step::Consumed(data.len())
            }

            Err(err) => {
                tracing::debug!("--> Opaque: {:?} decryption failed: {}", direction, err);
                let peer = &mut self.peers[idx];
                peer.disable_decryption();
                let mac_length = peer.negotiated.mac_length;
                Tree::new(&mut *cx.sink, Source::Wire, base).warn(
                    0,
                    0,
                    Diagnostic::DecryptionDisabled(err),
                );
                self.dissect_opaque(direction, data, base, length_field, mac_length, cx)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn dissect_decrypted(
        &mut self,
        direction: Direction,
        frame: FrameId,
        data: &[u8],
        base: usize,
        length_field: LengthField,
        record: OpenedRecord,
        cx: &mut Context<'_>,
    ) -> Step {
        let OpenedRecord {
            plaintext,
            packet_length,
            wire_len,
            mac_ok,
        } = record;

        let peer = &mut self.peers[direction.index()];
        let sequence_number = peer.next_sequence_number();
        let mac_len = peer.negotiated.mac_length.min(wire_len.saturating_sub(4));
        let body_end = wire_len - mac_len;

        {
            let mut tree = Tree::new(&mut *cx.sink, Source::Wire, base);
            if length_field.is_readable() {
                tree.add(Field::PacketLength, 0, 4, Value::Uint(packet_length.into()));
            } else {
                let raw = window(data, 0, 4);
                tree.add(Field::PacketLengthEncrypted, 0, 4, Value::Bytes(raw));
            }
            let ciphertext = window(data, 4, body_end);
            tree.add(
                Field::EncryptedPacket,
                4,
                ciphertext.len(),
                Value::Bytes(ciphertext),
            );
            if mac_len > 0 {
                let mac = window(data, body_end, wire_len);
                tree.add(Field::Mac, body_end, mac.len(), Value::Bytes(mac));
            }
            tree.add(
                Field::SequenceNumber,
                0,
                0,
                Value::Uint(sequence_number.into()),
            );
            if mac_ok == Some(false) {
                tracing::debug!("MAC mismatch in {:?} record {}", direction, sequence_number);
                tree.warn(body_end, mac_len, Diagnostic::MacMismatch { sequence_number });
            }
        }

        cx.sink.plaintext(direction, sequence_number, &plaintext);

        let mut tree = Tree::new(
            &mut *cx.sink,
            Source::Decrypted {
                direction,
                sequence_number,
            },
            0,
        );
        tree.add(Field::PacketLength, 0, 4, Value::Uint(packet_length.into()));
        let body = window(&plaintext, 4, plaintext.len());
        let payload = dissect_packet_body(body, packet_length, &mut tree.nested(4));
        self.dispatch_message(
            direction,
            frame,
            payload,
            &mut tree.nested(5),
            cx.keylog,
            &mut *cx.subsystems,
        );

        Step::Consumed(wire_len)
    }

    fn dissect_opaque(
        &mut self,
        direction: Direction,
        data: &[u8],
        base: usize,
        length_field: LengthField,
        mac_length: usize,
        cx: &mut Context<'_>,
    ) -> Step {
        let desegment = cx.config.desegment;
        let mut tree = Tree::new(&mut *cx.sink, Source::Wire, base);

        if !length_field.is_readable() {
            emit_opaque(&mut tree, data, length_field, mac_length);
            return Step::Consumed(data.len());
        }

        let packet_length = match Reader::streaming(data).read_u32_be() {
            Ok(len) => len,
            Err(ReadError::NeedMore { .. }) if desegment => return Step::NeedMore(None),
            Err(..) => {
                tree.warn(0, data.len(), Diagnostic::Truncated);
                return Step::Consumed(data.len());
            }
        };

        if packet_length > MAX_PACKET_LEN {
            tree.warn(
                0,
                4,
                Diagnostic::ImplausibleLength {
                    announced: packet_length,
                    available: data.len() - 4,
                },
            );
            emit_opaque(&mut tree, data, length_field, mac_length);
            return Step::Consumed(data.len());
        }

        let total = 4 + packet_length as usize + mac_length;
        if data.len() < total {
            if desegment {
                return Step::NeedMore(Some(total - data.len()));
            }
            tree.warn(0, data.len(), Diagnostic::Truncated);
            emit_opaque(&mut tree, data, length_field, mac_length);
            return Step::Consumed(data.len());
        }

        emit_opaque(&mut tree, window(data, 0, total), length_field, mac_length);
        let sequence_number = self.peers[direction.index()].next_sequence_number();
        tree.add(
            Field::SequenceNumber,
            0,
            0,
            Value::Uint(sequence_number.into()),
        );
        Step::Consumed(total)
    }

    // ==== SSH 1.x ====

    fn dissect_ssh1(
        &mut self,
        direction: Direction,
        data: &[u8],
        base: usize,
        cx: &mut Context<'_>,
    ) -> Step {
        let desegment = cx.config.desegment;
        let mut tree = Tree::new(&mut *cx.sink, Source::Wire, base);

        let packet_length = match Reader::streaming(data).read_u32_be() {
            Ok(len) => len,
            Err(ReadError::NeedMore { .. }) if desegment => return Step::NeedMore(None),
            Err(..) => {
                tree.warn(0, data.len(), Diagnostic::Truncated);
                return Step::Consumed(data.len());
            }
        };
        let padding = 8 - (packet_length % 8) as usize;
        let available = data.len() - 4;

        let mut len = packet_length as usize;
        if packet_length >= MAX_CLEARTEXT_LEN {
            tree.warn(
                0,
                4,
                Diagnostic::ImplausibleLength {
                    announced: packet_length,
                    available,
                },
            );
            len = available.saturating_sub(padding);
        } else if padding + len > available {
            if desegment {
                return Step::NeedMore(Some(padding + len - available));
            }
            tree.warn(0, data.len(), Diagnostic::Truncated);
            len = available.saturating_sub(padding);
        }

        tree.add(Field::PacketLength, 0, 4, Value::Uint(packet_length.into()));
        let padding_string = window(data, 4, 4 + padding);
        tree.add(
            Field::PaddingString,
            4,
            padding_string.len(),
            Value::Bytes(padding_string),
        );

        let at = 4 + padding;
        let body = window(data, at, at + len);
        let peer = &mut self.peers[direction.index()];
        let sequence_number = peer.next_sequence_number();
        tree.add(
            Field::SequenceNumber,
            0,
            0,
            Value::Uint(sequence_number.into()),
        );

        if peer.is_opaque() {
            tree.add(Field::EncryptedPacket, at, body.len(), Value::Bytes(body));
        } else if let Some((&msg_code, rest)) = body.split_first() {
            tree.add(Field::MessageCode, at, 1, Value::Uint(msg_code.into()));
            let payload_len = rest.len().saturating_sub(4);
            let payload = window(rest, 0, payload_len);
            if !payload.is_empty() {
                tree.add(Field::Payload, at + 1, payload_len, Value::Bytes(payload));
            }
            let crc = window(rest, payload_len, rest.len());
            tree.add(Field::Crc, at + 1 + payload_len, crc.len(), Value::Bytes(crc));

            if direction == Direction::ClientToServer && msg_code == consts::SSH1_CMSG_SESSION_KEY
            {
                tracing::debug!("--> SSH1 session key, encryption starts");
                for peer in &mut self.peers {
                    peer.cipher = CipherState::Opaque {
                        length_field: LengthField::Plain,
                        mac_length: 0,
                    };
                }
            }
        }

        Step::Consumed(at + body.len())
    }

    // ==== messages ====

    fn dispatch_message(
        &mut self,
        direction: Direction,
        frame: FrameId,
        payload: &[u8],
        tree: &mut Tree<'_>,
        keylog: &KeylogStore,
        subsystems: &mut dyn SubsystemDispatch,
    ) {
        let mut r = Reader::new(payload);
        let msg_code = match tree.u8(&mut r, Field::MessageCode) {
            Ok(msg_code) => msg_code,
            Err(..) => return,
        };

        let res = match msg_code {
            1..=19 => dissect_transport_generic(msg_code, &mut r, tree),

            consts::SSH_MSG_KEXINIT => self.on_kexinit(direction, frame, payload, &mut r, tree),
            consts::SSH_MSG_NEWKEYS => {
                self.on_newkeys(direction, tree);
                Ok(())
            }
            20..=29 => {
                tree.rest(&mut r, Field::MessagePayload);
                Ok(())
            }

            30..=49 => self.dissect_kex_message(msg_code, &mut r, tree, keylog),

            50..=79 => userauth::dissect_message(msg_code, &mut r, tree),

            80..=127 => {
                let (client, server) = self.peers.split_at_mut(1);
                let (own, other) = match direction {
                    Direction::ClientToServer => (&mut client[0], &mut server[0]),
                    Direction::ServerToClient => (&mut server[0], &mut client[0]),
                };
                connection::dissect_message(
                    msg_code,
                    &mut r,
                    tree,
                    Channels {
                        own: &mut own.channels,
                        other: &mut other.channels,
                    },
                    ChannelContext {
                        direction,
                        channel: ChannelId(0),
                        frame,
                    },
                    subsystems,
                )
            }

            typ => {
                tracing::trace!("opaque message (typ = {})", typ);
                tree.rest(&mut r, Field::MessagePayload);
                Ok(())
            }
        };

        if let Err(err) = res {
            tracing::debug!("malformed message {}: {}", msg_code, err);
            tree.warn(0, payload.len(), Diagnostic::Malformed { msg_code });
        }
    }

    fn on_kexinit(
        &mut self,
        direction: Direction,
        frame: FrameId,
        payload: &[u8],
        r: &mut Reader<'_>,
        tree: &mut Tree<'_>,
    ) -> Result<(), ReadError> {
        tracing::trace!("--> KEXINIT");
        let kexinit = KexInit::dissect(r, tree)?;

        if self.round.newkeys == [true, true] {
            self.start_round();
        }
        if self.transcript.has_kexinit(direction) {
            tracing::debug!("ignoring repeated KEXINIT from {:?}", direction);
            return Ok(());
        }

        let peer = &mut self.peers[direction.index()];
        mark_frame(&mut peer.kex_init_frames, frame);
        peer.kexinit = Some(kexinit);
        self.transcript.set_kexinit(direction, payload);

        if !self.round.negotiated {
            self.negotiate(tree);
        }
        Ok(())
    }

    fn negotiate(&mut self, tree: &mut Tree<'_>) {
        let negotiated = match (&self.peers[0].kexinit, &self.peers[1].kexinit) {
            (Some(client), Some(server)) => negotiate::negotiate(client, server),
            _ => return,
        };
        self.round.negotiated = true;

        for category in negotiated.unresolved() {
            tracing::debug!("no common algorithm for {:?}", category);
            tree.warn(0, 0, Diagnostic::NoAlgorithm(category));
        }
        for &direction in &Direction::BOTH {
            self.peers[direction.index()].negotiated = negotiated.direction(direction).clone();
        }
        self.host_key_algorithm = negotiated.host_key.clone();
        self.negotiated_kex_method = negotiated.kex.clone();

        if negotiated.is_complete() {
            if let Some(ref name) = negotiated.kex {
                self.kex = kex::method_for(name);
                self.hash = HashAlgorithm::for_kex(name);
                tracing::debug!("--> key exchange method: {} ({:?})", name, self.hash);
            }
        }
    }

    /// Forgets the previous key exchange; the session id and the identification
    /// strings survive.
    fn start_round(&mut self) {
        tracing::debug!("--> re-key");
        self.transcript.reset_round();
        self.kex = None;
        self.hash = None;
        self.exchange_hash = None;
        self.public_e = None;
        self.public_f = None;
        self.group = None;
        self.derived_secret = None;
        self.next_keys = None;
        self.round = KexRound::default();
        for peer in &mut self.peers {
            peer.kexinit = None;
            peer.kex_init_frames = None;
        }
    }

    fn on_newkeys(&mut self, direction: Direction, tree: &mut Tree<'_>) {
        tracing::trace!("--> NEWKEYS");
        self.round.newkeys[direction.index()] = true;

        let peer = &mut self.peers[direction.index()];
        peer.pending_fragment = None;
        peer.cipher = match self.next_keys {
            Some(ref keys) => {
                match CipherContext::new(&peer.negotiated, keys.for_direction(direction)) {
                    Ok(cipher) => CipherState::Keyed(Box::new(cipher)),
                    Err(err) => {
                        tracing::debug!("cannot decrypt {:?}: {}", direction, err);
                        tree.warn(0, 0, Diagnostic::DecryptionDisabled(err));
                        CipherState::opaque(&peer.negotiated)
                    }
                }
            }
            None => CipherState::opaque(&peer.negotiated),
        };
    }

    fn dissect_kex_message(
        &mut self,
        msg_code: u8,
        r: &mut Reader<'_>,
        tree: &mut Tree<'_>,
        keylog: &KeylogStore,
    ) -> Result<(), ReadError> {
        let kex = match self.kex {
            Some(ref kex) => kex,
            None => {
                tree.rest(r, Field::MessagePayload);
                return Ok(());
            }
        };

        match kex.classify(msg_code) {
            KexMessage::GroupRequest | KexMessage::Group => {
                match kex.on_group_message(msg_code, r, tree)? {
                    Some(GroupEvent::Request(bounds)) => self.transcript.set_gex_bounds(bounds),
                    Some(GroupEvent::Group(group)) => self.group = Some(group),
                    None => {}
                }
            }
            KexMessage::Init => {
                self.public_e = Some(kex.on_init(r, tree)?);
            }
            KexMessage::Reply => {
                let reply = kex.on_reply(r, tree)?;
                self.transcript.set_host_key(&reply.host_key);
                self.public_f = Some(reply.public);
                self.try_derive_keys(keylog, tree);
            }
            KexMessage::Unknown => {
                tree.rest(r, Field::MessagePayload);
            }
        }
        Ok(())
    }

    fn try_derive_keys(&mut self, keylog: &KeylogStore, tree: &mut Tree<'_>) {
        let span = tracing::trace_span!("SessionState::try_derive_keys");
        let _enter = span.enter();

        let (kex, hash) = match (self.kex.as_deref(), self.hash) {
            (Some(kex), Some(hash)) => (kex, hash),
            _ => return,
        };
        let (e, f) = match (&self.public_e, &self.public_f) {
            (Some(e), Some(f)) => (e, f),
            _ => {
                tracing::debug!("reply without init, no keys");
                return;
            }
        };
        let (client_cookie, server_cookie) = match (&self.peers[0].kexinit, &self.peers[1].kexinit)
        {
            (Some(client), Some(server)) => (client.cookie, server.cookie),
            _ => return,
        };

        // The private key belongs to the side whose cookie is logged.
        let (private, peer_public) = if let Some(private) = keylog.lookup(&server_cookie) {
            tracing::trace!("found server private key");
            (private, e)
        } else if let Some(private) = keylog.lookup(&client_cookie) {
            tracing::trace!("found client private key");
            (private, f)
        } else {
            tracing::debug!("no private key in keylog, decryption skipped");
            return;
        };

        let shared_secret = match kex.shared_secret(peer_public, &private, self.group.as_ref()) {
            Ok(k) => k,
            Err(err) => {
                tracing::debug!("{}: cannot compute shared secret: {}", kex.name(), err);
                tree.warn(0, 0, Diagnostic::KeyExchangeFailed(err));
                return;
            }
        };

        let values = ExchangeValues {
            kind: kex.kind(),
            group: self.group.as_ref(),
            client_public: e,
            server_public: f,
            shared_secret: &shared_secret,
        };
        let exchange_hash = match self.transcript.exchange_hash(hash, &values) {
            Ok(h) => h,
            Err(err) => {
                tracing::debug!("cannot compute exchange hash: {}", err);
                return;
            }
        };

        // The first exchange hash is used as 'session id'.
        let session_id = self
            .session_id
            .get_or_insert_with(|| exchange_hash.clone())
            .clone();

        tracing::trace!("calculate encryption keys");
        let keys = KeyScheduler::new(hash, &shared_secret, &exchange_hash, &session_id).derive();

        self.next_keys = Some(keys);
        self.exchange_hash = Some(exchange_hash);
        self.derived_secret = Some(shared_secret);
    }
}

/// Dissects padding length, payload and padding, returning the payload.
fn dissect_packet_body<'a>(body: &'a [u8], packet_length: u32, tree: &mut Tree<'_>) -> &'a [u8] {
    let mut r = Reader::new(body);
    let padding_length = match tree.u8(&mut r, Field::PaddingLength) {
        Ok(len) => len,
        Err(..) => return &[],
    };

    let rest = r.rest();
    let mut padding = padding_length as usize;
    if padding > rest.len() {
        tree.warn(
            0,
            1,
            Diagnostic::BadPadding {
                padding_length,
                packet_length,
            },
        );
        padding = rest.len();
    }

    let payload = window(rest, 0, rest.len() - padding);
    tree.add(Field::Payload, 1, payload.len(), Value::Bytes(payload));
    if padding > 0 {
        let padding_string = window(rest, payload.len(), rest.len());
        tree.add(
            Field::PaddingString,
            1 + payload.len(),
            padding,
            Value::Bytes(padding_string),
        );
    }
    payload
}

/// Emits a record that cannot be framed as a whole.
fn emit_opaque(tree: &mut Tree<'_>, data: &[u8], length_field: LengthField, mac_length: usize) {
    if data.len() <= 4 {
        tree.add(Field::EncryptedPacket, 0, data.len(), Value::Bytes(data));
        return;
    }

    match length_field {
        LengthField::Encrypted => {
            tree.add(
                Field::PacketLengthEncrypted,
                0,
                4,
                Value::Bytes(window(data, 0, 4)),
            );
        }
        LengthField::Authenticated | LengthField::Plain => {
            if tree.u32(&mut Reader::new(data), Field::PacketLength).is_err() {
                return;
            }
        }
    }

    let mac_length = mac_length.min(data.len() - 4);
    let body_end = data.len() - mac_length;
    let body = window(data, 4, body_end);
    tree.add(Field::EncryptedPacket, 4, body.len(), Value::Bytes(body));
    if mac_length > 0 {
        let mac = window(data, body_end, data.len());
        tree.add(Field::Mac, body_end, mac.len(), Value::Bytes(mac));
    }
}

fn dissect_transport_generic(
    msg_code: u8,
    r: &mut Reader<'_>,
    tree: &mut Tree<'_>,
) -> Result<(), ReadError> {
    match msg_code {
        consts::SSH_MSG_DISCONNECT => {
            tracing::trace!("--> DISCONNECT");
            tree.u32(r, Field::DisconnectReason)?;
            tree.text(r, Field::Description)?;
            tree.text(r, Field::LanguageTag)?;
        }
        consts::SSH_MSG_IGNORE => {
            tree.string(r, Field::IgnoreData)?;
        }
        consts::SSH_MSG_UNIMPLEMENTED => {
            tree.u32(r, Field::UnimplementedSequenceNumber)?;
        }
        consts::SSH_MSG_DEBUG => {
            tree.boolean(r, Field::AlwaysDisplay)?;
            tree.text(r, Field::DebugMessage)?;
            tree.text(r, Field::LanguageTag)?;
        }
        consts::SSH_MSG_SERVICE_REQUEST | consts::SSH_MSG_SERVICE_ACCEPT => {
            tracing::trace!("--> SERVICE_REQUEST|SERVICE_ACCEPT");
            tree.text(r, Field::ServiceName)?;
        }
        consts::SSH_MSG_EXT_INFO => {
            tracing::trace!("--> EXT_INFO");
            let n = tree.u32(r, Field::ExtensionCount)?;
            for _ in 0..n {
                tree.text(r, Field::ExtensionName)?;
                tree.string(r, Field::ExtensionValue)?;
            }
        }
        _ => {
            tree.rest(r, Field::MessagePayload);
        }
    }
    Ok(())
}

// ==== Sessions ====

/// Session states keyed by flow.
#[derive(Debug)]
pub struct Sessions<K> {
    flows: HashMap<K, SessionState>,
}

impl<K> Default for Sessions<K> {
    fn default() -> Self {
        Self {
            flows: HashMap::new(),
        }
    }
}

impl<K> Sessions<K>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, key: K) -> &mut SessionState {
        self.flows.entry(key).or_insert_with(SessionState::new)
    }

    pub fn get(&self, key: &K) -> Option<&SessionState> {
        self.flows.get(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<SessionState> {
        self.flows.remove(key)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}
