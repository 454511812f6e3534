//! Structured output of the dissector.
//!
//! Every decoded field is reported as a `(Field, Span, Value)` triple. Spans point either
//! into the caller's buffer or into the plaintext of a decrypted record, which is handed
//! to [`Sink::plaintext`] before any of its fields.

use crate::{
    crypto::CryptoError,
    negotiate::Category,
    transport::Direction,
    util::{ReadError, Reader},
};
use std::fmt;

/// The byte source a [`Span`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    /// The buffer passed to the dissector.
    Wire,
    /// The plaintext of a decrypted record.
    Decrypted {
        direction: Direction,
        sequence_number: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub source: Source,
    pub offset: usize,
    pub len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value<'a> {
    Empty,
    Uint(u64),
    Bool(bool),
    Bytes(&'a [u8]),
    Text(&'a [u8]),
}

impl Value<'_> {
    pub fn as_uint(&self) -> Option<u64> {
        match *self {
            Value::Uint(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match *self {
            Value::Bytes(b) | Value::Text(b) => Some(b),
            _ => None,
        }
    }
}

impl fmt::Display for Value<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Value::Empty => Ok(()),
            Value::Uint(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Bytes(b) => f.write_str(&hex::encode(b)),
            Value::Text(b) => f.write_str(&String::from_utf8_lossy(b)),
        }
    }
}

/// Field tags emitted by the dissector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Field {
    // framing
    Protocol,
    PacketLength,
    PacketLengthEncrypted,
    PaddingLength,
    PaddingString,
    Payload,
    EncryptedPacket,
    Mac,
    SequenceNumber,
    Crc,
    MessageCode,
    MessagePayload,

    // key exchange init
    Cookie,
    NameList(Category),
    FirstKexPacketFollows,
    Reserved,

    // key exchange methods
    DhE,
    DhF,
    GexMin,
    GexPreferred,
    GexMax,
    GexModulus,
    GexGenerator,
    EcdhClientPublic,
    EcdhServerPublic,
    HostKey,
    HostKeyType,
    RsaExponent,
    RsaModulus,
    DsaP,
    DsaQ,
    DsaG,
    DsaY,
    EcdsaCurve,
    EcdsaPoint,
    EdwardsKey,
    KeyData,
    Signature,
    SignatureType,
    SignatureData,

    // transport generic
    DisconnectReason,
    Description,
    LanguageTag,
    IgnoreData,
    UnimplementedSequenceNumber,
    AlwaysDisplay,
    DebugMessage,
    ServiceName,
    ExtensionCount,
    ExtensionName,
    ExtensionValue,

    // user authentication
    UserName,
    MethodName,
    HasSignature,
    PublicKeyAlgorithm,
    PublicKeyBlob,
    ChangePassword,
    Password,
    AuthMethods,
    PartialSuccess,
    BannerMessage,

    // connection
    GlobalRequestName,
    WantReply,
    ChannelType,
    SenderChannel,
    RecipientChannel,
    InitialWindowSize,
    MaximumPacketSize,
    OpenFailureReason,
    WindowAdjustment,
    ChannelData,
    ExtendedDataType,
    ChannelRequestName,
    SubsystemName,
    ExitStatus,
    Command,
    EnvironmentName,
    EnvironmentValue,
}

/// Warnings attached to the output; none of them stop the dissection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Diagnostic {
    #[error("implausible packet length {announced} ({available} bytes available)")]
    ImplausibleLength { announced: u32, available: usize },

    #[error("padding length {padding_length} does not fit in packet of length {packet_length}")]
    BadPadding {
        padding_length: u8,
        packet_length: u32,
    },

    #[error("record is truncated")]
    Truncated,

    #[error("MAC mismatch in record {sequence_number}")]
    MacMismatch { sequence_number: u32 },

    #[error("decryption disabled for this direction: {0}")]
    DecryptionDisabled(CryptoError),

    #[error("shared secret could not be computed: {0}")]
    KeyExchangeFailed(CryptoError),

    #[error("malformed message {msg_code}")]
    Malformed { msg_code: u8 },

    #[error("no common algorithm for {0:?}")]
    NoAlgorithm(Category),
}

/// Receiver of the structured output.
pub trait Sink {
    fn field(&mut self, field: Field, span: Span, value: Value<'_>);

    fn diagnostic(&mut self, span: Span, diagnostic: Diagnostic) {
        tracing::debug!("diagnostic at {:?}: {}", span, diagnostic);
    }

    /// Plaintext of a decrypted record, the target of `Source::Decrypted` spans.
    fn plaintext(&mut self, _direction: Direction, _sequence_number: u32, _data: &[u8]) {}
}

// ==== Recorder ====

/// An owned copy of a [`Value`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnedValue {
    Empty,
    Uint(u64),
    Bool(bool),
    Bytes(Vec<u8>),
    Text(String),
}

impl From<Value<'_>> for OwnedValue {
    fn from(v: Value<'_>) -> Self {
        match v {
            Value::Empty => OwnedValue::Empty,
            Value::Uint(v) => OwnedValue::Uint(v),
            Value::Bool(v) => OwnedValue::Bool(v),
            Value::Bytes(b) => OwnedValue::Bytes(b.to_vec()),
            Value::Text(b) => OwnedValue::Text(String::from_utf8_lossy(b).into_owned()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Record {
    pub field: Field,
    pub span: Span,
    pub value: OwnedValue,
}

/// A sink that keeps everything it is given.
#[derive(Debug, Default)]
pub struct Recorder {
    pub records: Vec<Record>,
    pub diagnostics: Vec<(Span, Diagnostic)>,
    pub plaintexts: Vec<(Direction, u32, Vec<u8>)>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, field: Field) -> Option<&Record> {
        self.records.iter().find(|r| r.field == field)
    }

    pub fn all(&self, field: Field) -> impl Iterator<Item = &Record> + '_ {
        self.records.iter().filter(move |r| r.field == field)
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.diagnostics.clear();
        self.plaintexts.clear();
    }
}

impl Sink for Recorder {
    fn field(&mut self, field: Field, span: Span, value: Value<'_>) {
        self.records.push(Record {
            field,
            span,
            value: value.into(),
        });
    }

    fn diagnostic(&mut self, span: Span, diagnostic: Diagnostic) {
        self.diagnostics.push((span, diagnostic));
    }

    fn plaintext(&mut self, direction: Direction, sequence_number: u32, data: &[u8]) {
        self.plaintexts
            .push((direction, sequence_number, data.to_vec()));
    }
}

// ==== Tree ====

/// Field emitter bound to one byte source, with offsets relative to `base`.
pub struct Tree<'s> {
    sink: &'s mut dyn Sink,
    source: Source,
    base: usize,
}

impl<'s> Tree<'s> {
    pub(crate) fn new(sink: &'s mut dyn Sink, source: Source, base: usize) -> Self {
        Self { sink, source, base }
    }

    /// A tree for a nested structure starting at `offset`.
    pub(crate) fn nested(&mut self, offset: usize) -> Tree<'_> {
        Tree {
            sink: &mut *self.sink,
            source: self.source,
            base: self.base + offset,
        }
    }

    fn span(&self, offset: usize, len: usize) -> Span {
        Span {
            source: self.source,
            offset: self.base + offset,
            len,
        }
    }

    pub(crate) fn add(&mut self, field: Field, offset: usize, len: usize, value: Value<'_>) {
        let span = self.span(offset, len);
        self.sink.field(field, span, value);
    }

    pub(crate) fn warn(&mut self, offset: usize, len: usize, diagnostic: Diagnostic) {
        let span = self.span(offset, len);
        self.sink.diagnostic(span, diagnostic);
    }

    pub(crate) fn u8(&mut self, r: &mut Reader<'_>, field: Field) -> Result<u8, ReadError> {
        let at = r.position();
        let v = r.read_u8()?;
        self.add(field, at, 1, Value::Uint(v.into()));
        Ok(v)
    }

    pub(crate) fn boolean(&mut self, r: &mut Reader<'_>, field: Field) -> Result<bool, ReadError> {
        let at = r.position();
        let v = r.read_bool()?;
        self.add(field, at, 1, Value::Bool(v));
        Ok(v)
    }

    pub(crate) fn u32(&mut self, r: &mut Reader<'_>, field: Field) -> Result<u32, ReadError> {
        let at = r.position();
        let v = r.read_u32_be()?;
        self.add(field, at, 4, Value::Uint(v.into()));
        Ok(v)
    }

    /// Reads a binary `string`; the span covers the contents only.
    pub(crate) fn string<'a>(
        &mut self,
        r: &mut Reader<'a>,
        field: Field,
    ) -> Result<&'a [u8], ReadError> {
        let at = r.position();
        let s = r.read_string()?;
        self.add(field, at + 4, s.len(), Value::Bytes(s));
        Ok(s)
    }

    /// Reads a textual `string` or `name-list`.
    pub(crate) fn text<'a>(&mut self, r: &mut Reader<'a>, field: Field) -> Result<&'a [u8], ReadError> {
        let at = r.position();
        let s = r.read_string()?;
        self.add(field, at + 4, s.len(), Value::Text(s));
        Ok(s)
    }

    pub(crate) fn rest<'a>(&mut self, r: &mut Reader<'a>, field: Field) -> &'a [u8] {
        let at = r.position();
        let s = r.rest();
        if !s.is_empty() {
            self.add(field, at, s.len(), Value::Bytes(s));
        }
        let _ = r.skip(s.len());
        s
    }
}
