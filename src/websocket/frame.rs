//! The WebSocket frame model (RFC 6455 §5) and its serializer.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket frame opcode (RFC 6455 §5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    /// Maps the low four bits of the first header byte. Reserved opcodes yield `None`.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value & 0x0F {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    /// Close, ping and pong.
    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    /// Text, binary and continuation.
    pub fn is_data(self) -> bool {
        !self.is_control()
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// WebSocket close status code (RFC 6455 §7.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// 1000
    Normal,
    /// 1001
    GoingAway,
    /// 1002
    ProtocolError,
    /// 1003
    UnsupportedData,
    /// 1005: reported locally when a close frame had no payload; never sent.
    NoStatusReceived,
    /// 1006: reported locally when the transport dropped; never sent.
    AbnormalClosure,
    /// 1007
    InvalidPayload,
    /// 1008
    PolicyViolation,
    /// 1009
    MessageTooBig,
    /// 1010
    MandatoryExtension,
    /// 1011
    InternalError,
    /// 1012
    ServiceRestart,
    /// 1013
    TryAgainLater,
    /// 1014
    BadGateway,
    /// Registered or private-use code in `3000..=4999`.
    Application(u16),
}

impl CloseCode {
    pub fn as_u16(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::GoingAway => 1001,
            Self::ProtocolError => 1002,
            Self::UnsupportedData => 1003,
            Self::NoStatusReceived => 1005,
            Self::AbnormalClosure => 1006,
            Self::InvalidPayload => 1007,
            Self::PolicyViolation => 1008,
            Self::MessageTooBig => 1009,
            Self::MandatoryExtension => 1010,
            Self::InternalError => 1011,
            Self::ServiceRestart => 1012,
            Self::TryAgainLater => 1013,
            Self::BadGateway => 1014,
            Self::Application(code) => code,
        }
    }

    /// Maps a code received on the wire. Codes that may not appear in a close frame
    /// (1004-1006, 1015, unassigned ranges) yield `None`.
    pub fn from_u16(code: u16) -> Option<Self> {
        Some(match code {
            1000 => Self::Normal,
            1001 => Self::GoingAway,
            1002 => Self::ProtocolError,
            1003 => Self::UnsupportedData,
            1007 => Self::InvalidPayload,
            1008 => Self::PolicyViolation,
            1009 => Self::MessageTooBig,
            1010 => Self::MandatoryExtension,
            1011 => Self::InternalError,
            1012 => Self::ServiceRestart,
            1013 => Self::TryAgainLater,
            1014 => Self::BadGateway,
            3000..=4999 => Self::Application(code),
            _ => return None,
        })
    }

    /// `false` for the codes that only exist locally.
    pub fn is_sendable(self) -> bool {
        !matches!(self, Self::NoStatusReceived | Self::AbnormalClosure)
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// Protocol violations detected while parsing or validating frames.
///
/// Every variant maps to the close code the endpoint must send before dropping the
/// connection; see [`FrameError::close_code`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("unknown opcode 0x{0:X}")]
    UnknownOpcode(u8),

    #[error("reserved bits set without a negotiated extension")]
    ReservedBits,

    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlFrameTooLarge(usize),

    #[error("control frames must not be fragmented")]
    FragmentedControlFrame,

    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,

    #[error("new data frame while a fragmented message is in progress")]
    InterleavedDataFrame,

    #[error("payload of {size} bytes exceeds limit of {max}")]
    PayloadTooLarge { size: u64, max: usize },

    #[error("message of {size} bytes exceeds limit of {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("payload length not minimally encoded")]
    NonMinimalLength,

    #[error("64-bit payload length has the most significant bit set")]
    LengthOverflow,

    #[error("client frames must be masked")]
    UnmaskedFrame,

    #[error("server frames must not be masked")]
    UnexpectedMask,

    #[error("close payload of one byte")]
    InvalidClosePayload,

    #[error("invalid close code {0}")]
    InvalidCloseCode(u16),

    #[error("invalid UTF-8 in text payload")]
    InvalidUtf8,
}

impl FrameError {
    /// The close code to answer this error with.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::InvalidUtf8 => CloseCode::InvalidPayload,
            Self::PayloadTooLarge { .. } | Self::MessageTooLarge { .. } => CloseCode::MessageTooBig,
            _ => CloseCode::ProtocolError,
        }
    }
}

/// Byte-wise XOR of `data` with `key`, cycling the key by `index % 4`.
///
/// Applying it twice with the same key restores the input.
///
/// # Examples
///
/// ```
/// use kiln::websocket::apply_mask;
///
/// let key = [0x37, 0xfa, 0x21, 0x3d];
/// let mut data = *b"Hello";
/// apply_mask(&mut data, key);
/// assert_eq!(data, [0x7f, 0x9f, 0x4d, 0x51, 0x58]);
/// apply_mask(&mut data, key);
/// assert_eq!(&data, b"Hello");
/// ```
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// One WebSocket frame.
///
/// `payload` always holds the *unmasked* application bytes; `mask` records the key the
/// frame travels with on the wire. Serializing masks a copy, parsing unmasks, so a
/// parsed frame compares equal to the one that was sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: Opcode,
    pub mask: Option<[u8; 4]>,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Opcode::Text, text.into())
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Binary, data)
    }

    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Ping, payload)
    }

    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Pong, payload)
    }

    /// A continuation frame; `fin` marks the last fragment.
    pub fn continuation(data: impl Into<Bytes>, fin: bool) -> Self {
        Self::new(Opcode::Continuation, data).with_fin(fin)
    }

    /// A close frame carrying `code` and `reason`. `None` sends an empty payload.
    pub fn close(code: Option<CloseCode>, reason: &str) -> Self {
        let payload = match code {
            Some(code) => {
                let mut buf = BytesMut::with_capacity(2 + reason.len());
                buf.put_u16(code.as_u16());
                buf.put(reason.as_bytes());
                buf.freeze()
            }
            None => Bytes::new(),
        };
        Self::new(Opcode::Close, payload)
    }

    #[must_use]
    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    #[must_use]
    pub fn with_mask(mut self, key: [u8; 4]) -> Self {
        self.mask = Some(key);
        self
    }

    /// Masks with a fresh random key, as client-role endpoints must.
    #[must_use]
    pub fn with_random_mask(self) -> Self {
        self.with_mask(rand::random::<[u8; 4]>())
    }

    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    pub fn is_control(&self) -> bool {
        self.opcode.is_control()
    }

    /// Checks the rules a frame must satisfy regardless of direction: control frames
    /// are final and at most 125 bytes, close payloads are well formed.
    pub fn validate(&self) -> Result<(), FrameError> {
        if self.is_control() {
            if self.payload.len() > MAX_CONTROL_PAYLOAD {
                return Err(FrameError::ControlFrameTooLarge(self.payload.len()));
            }
            if !self.fin {
                return Err(FrameError::FragmentedControlFrame);
            }
        }
        if self.opcode == Opcode::Close {
            self.close_payload()?;
        }
        Ok(())
    }

    /// Decodes a close frame's payload into its code and reason.
    ///
    /// Returns `Ok(None)` for an empty payload (or a non-close frame).
    pub fn close_payload(&self) -> Result<Option<(CloseCode, String)>, FrameError> {
        if self.opcode != Opcode::Close || self.payload.is_empty() {
            return Ok(None);
        }
        if self.payload.len() == 1 {
            return Err(FrameError::InvalidClosePayload);
        }
        let raw = u16::from_be_bytes([self.payload[0], self.payload[1]]);
        let code = CloseCode::from_u16(raw).ok_or(FrameError::InvalidCloseCode(raw))?;
        let reason = std::str::from_utf8(&self.payload[2..]).map_err(|_| FrameError::InvalidUtf8)?;
        Ok(Some((code, reason.to_owned())))
    }

    /// Size of the header for a payload of `len` bytes.
    pub fn header_len(len: usize, masked: bool) -> usize {
        let length_bytes = match len {
            0..=125 => 0,
            126..=0xFFFF => 2,
            _ => 8,
        };
        2 + length_bytes + if masked { 4 } else { 0 }
    }

    pub fn encoded_len(&self) -> usize {
        Self::header_len(self.payload.len(), self.is_masked()) + self.payload.len()
    }

    /// Appends the wire form of this frame to `buf`, using the shortest length
    /// encoding and masking the payload if a key is set.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());

        let mut first = self.opcode.as_u8();
        if self.fin {
            first |= 0x80;
        }
        if self.rsv1 {
            first |= 0x40;
        }
        if self.rsv2 {
            first |= 0x20;
        }
        if self.rsv3 {
            first |= 0x10;
        }
        buf.put_u8(first);

        let mask_bit = if self.is_masked() { 0x80 } else { 0x00 };
        let len = self.payload.len();
        match len {
            0..=125 => buf.put_u8(mask_bit | len as u8),
            126..=0xFFFF => {
                buf.put_u8(mask_bit | 126);
                buf.put_u16(len as u16);
            }
            _ => {
                buf.put_u8(mask_bit | 127);
                buf.put_u64(len as u64);
            }
        }

        match self.mask {
            Some(key) => {
                buf.put_slice(&key);
                let start = buf.len();
                buf.put(self.payload.as_ref());
                apply_mask(&mut buf[start..], key);
            }
            None => buf.put(self.payload.as_ref()),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frame(opcode={}, fin={}, masked={}, len={})",
            self.opcode,
            self.fin,
            self.is_masked(),
            self.payload.len()
        )
    }
}

/// Fluent construction of arbitrary frames, including ones that break the rules
/// (useful for exercising a peer's validation).
///
/// # Examples
///
/// ```
/// use kiln::websocket::{FrameBuilder, Opcode};
///
/// let frame = FrameBuilder::new()
///     .opcode(Opcode::Text)
///     .text_payload("part one")
///     .fin(false)
///     .masking_key([1, 2, 3, 4])
///     .build();
/// assert!(!frame.fin);
/// assert_eq!(frame.mask, Some([1, 2, 3, 4]));
/// ```
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    frame: Frame,
}

impl Default for FrameBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuilder {
    pub fn new() -> Self {
        Self {
            frame: Frame::new(Opcode::Text, Bytes::new()),
        }
    }

    #[must_use]
    pub fn fin(mut self, fin: bool) -> Self {
        self.frame.fin = fin;
        self
    }

    #[must_use]
    pub fn rsv1(mut self, on: bool) -> Self {
        self.frame.rsv1 = on;
        self
    }

    #[must_use]
    pub fn rsv2(mut self, on: bool) -> Self {
        self.frame.rsv2 = on;
        self
    }

    #[must_use]
    pub fn rsv3(mut self, on: bool) -> Self {
        self.frame.rsv3 = on;
        self
    }

    #[must_use]
    pub fn opcode(mut self, opcode: Opcode) -> Self {
        self.frame.opcode = opcode;
        self
    }

    #[must_use]
    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.frame.payload = payload.into();
        self
    }

    #[must_use]
    pub fn text_payload(self, text: &str) -> Self {
        self.payload(Bytes::copy_from_slice(text.as_bytes()))
    }

    #[must_use]
    pub fn masking_key(mut self, key: [u8; 4]) -> Self {
        self.frame.mask = Some(key);
        self
    }

    #[must_use]
    pub fn random_masking_key(self) -> Self {
        self.masking_key(rand::random::<[u8; 4]>())
    }

    pub fn build(self) -> Frame {
        self.frame
    }
}
