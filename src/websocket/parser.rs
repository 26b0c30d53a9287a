//! Incremental WebSocket frame decoder.
//!
//! [`FrameParser::parse`] accepts whatever bytes have arrived so far. It copies only
//! what the current state needs, so a frame split across any number of reads decodes
//! the same as one delivered whole:
//!
//! ```text
//! Ready ─► ReadingHeader ─┬─► ReadingExtendedLength ─┬─► ReadingMaskingKey ─┬─► ReadingPayload ─► Ready
//!                         └──────────────────────────┴──────────────────────┘
//! ```
//!
//! Any violation is terminal: the parser remembers the error and returns it from every
//! later call until [`FrameParser::reset`].

use bytes::{Bytes, BytesMut};
use tracing::trace;

use super::frame::{FrameError, MAX_CONTROL_PAYLOAD, Opcode, apply_mask};
use super::Frame;
use crate::stats::Snapshot;

/// Which masking the parser insists on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskPolicy {
    /// Every frame must be masked (a server reading client frames).
    Required,
    /// No frame may be masked (a client reading server frames).
    Forbidden,
    /// Accept either.
    Any,
}

#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// Largest payload accepted for a single frame.
    pub max_payload_size: usize,
    pub mask_policy: MaskPolicy,
    /// Accept RSV1-3, for when an extension has been negotiated.
    pub allow_reserved_bits: bool,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 1024 * 1024,
            mask_policy: MaskPolicy::Any,
            allow_reserved_bits: false,
        }
    }
}

impl ParserConfig {
    /// Config for the server side of a connection: client frames must be masked.
    pub fn server() -> Self {
        Self {
            mask_policy: MaskPolicy::Required,
            ..Self::default()
        }
    }

    /// Config for the client side of a connection: server frames must not be masked.
    pub fn client() -> Self {
        Self {
            mask_policy: MaskPolicy::Forbidden,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_payload_size(mut self, max: usize) -> Self {
        self.max_payload_size = max;
        self
    }

    #[must_use]
    pub fn with_reserved_bits(mut self, allow: bool) -> Self {
        self.allow_reserved_bits = allow;
        self
    }
}

/// Outcome of one [`FrameParser::parse`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseStatus {
    /// A frame finished. `consumed` bytes of the input were used; the rest belongs to
    /// the next frame.
    Complete { frame: Frame, consumed: usize },
    /// All `consumed` bytes were absorbed and more input is needed.
    Incomplete { consumed: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Ready,
    ReadingHeader,
    ReadingExtendedLength(usize),
    ReadingMaskingKey,
    ReadingPayload,
}

#[derive(Debug, Default)]
struct PendingHeader {
    fin: bool,
    rsv: [bool; 3],
    opcode: Option<Opcode>,
    masked: bool,
    length: usize,
    mask: Option<[u8; 4]>,
}

#[derive(Debug)]
pub struct FrameParser {
    config: ParserConfig,
    state: State,
    scratch: BytesMut,
    header: PendingHeader,
    /// Opcode of the data message whose fragments are still arriving.
    open_message: Option<Opcode>,
    track_fragments: bool,
    failed: Option<FrameError>,
    frames_parsed: u64,
    bytes_parsed: u64,
    parse_errors: u64,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new(ParserConfig::default())
    }
}

impl FrameParser {
    pub fn new(config: ParserConfig) -> Self {
        Self {
            config,
            state: State::Ready,
            scratch: BytesMut::new(),
            header: PendingHeader::default(),
            open_message: None,
            track_fragments: true,
            failed: None,
            frames_parsed: 0,
            bytes_parsed: 0,
            parse_errors: 0,
        }
    }

    /// A parser that judges each frame on its own, without fragmentation context.
    pub fn standalone(config: ParserConfig) -> Self {
        Self {
            track_fragments: false,
            ..Self::new(config)
        }
    }

    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    pub fn set_max_payload_size(&mut self, max: usize) {
        self.config.max_payload_size = max;
    }

    /// `true` while a frame is partially decoded.
    pub fn is_parsing(&self) -> bool {
        self.state != State::Ready
    }

    /// `true` while a fragmented data message awaits its final continuation.
    pub fn in_fragmented_message(&self) -> bool {
        self.open_message.is_some()
    }

    /// Clears all state, including a remembered error. Counters are kept.
    pub fn reset(&mut self) {
        self.state = State::Ready;
        self.scratch.clear();
        self.header = PendingHeader::default();
        self.open_message = None;
        self.failed = None;
    }

    pub fn statistics(&self) -> Snapshot {
        let mut stats = Snapshot::new();
        stats.insert("frames_parsed".into(), self.frames_parsed.into());
        stats.insert("bytes_parsed".into(), self.bytes_parsed.into());
        stats.insert("parse_errors".into(), self.parse_errors.into());
        stats.insert("parsing".into(), self.is_parsing().into());
        stats.insert(
            "max_payload_size".into(),
            self.config.max_payload_size.into(),
        );
        stats
    }

    /// Feeds `data` to the parser.
    ///
    /// # Errors
    ///
    /// Returns the [`FrameError`] that violated the protocol. The parser stays failed
    /// until [`reset`](Self::reset).
    pub fn parse(&mut self, data: &[u8]) -> Result<ParseStatus, FrameError> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        let mut pos = 0;
        let result = self.step(data, &mut pos);
        self.bytes_parsed += pos as u64;
        match result {
            Ok(Some(frame)) => {
                self.frames_parsed += 1;
                Ok(ParseStatus::Complete {
                    frame,
                    consumed: pos,
                })
            }
            Ok(None) => Ok(ParseStatus::Incomplete { consumed: pos }),
            Err(err) => {
                trace!(error = %err, "frame rejected");
                self.parse_errors += 1;
                self.failed = Some(err.clone());
                Err(err)
            }
        }
    }

    fn step(&mut self, data: &[u8], pos: &mut usize) -> Result<Option<Frame>, FrameError> {
        loop {
            match self.state {
                State::Ready => {
                    self.header = PendingHeader::default();
                    self.scratch.clear();
                    if *pos == data.len() {
                        return Ok(None);
                    }
                    self.state = State::ReadingHeader;
                }
                State::ReadingHeader => {
                    if !self.fill(data, pos, 2) {
                        return Ok(None);
                    }
                    let (b0, b1) = (self.scratch[0], self.scratch[1]);
                    self.scratch.clear();
                    let short_len = self.read_header(b0, b1)?;
                    match short_len {
                        126 => self.state = State::ReadingExtendedLength(2),
                        127 => self.state = State::ReadingExtendedLength(8),
                        len => self.length_known(usize::from(len))?,
                    }
                }
                State::ReadingExtendedLength(width) => {
                    if !self.fill(data, pos, width) {
                        return Ok(None);
                    }
                    let length = if width == 2 {
                        let len = u16::from_be_bytes([self.scratch[0], self.scratch[1]]);
                        if len < 126 {
                            return Err(FrameError::NonMinimalLength);
                        }
                        u64::from(len)
                    } else {
                        let mut raw = [0u8; 8];
                        raw.copy_from_slice(&self.scratch[..8]);
                        let len = u64::from_be_bytes(raw);
                        if len & (1 << 63) != 0 {
                            return Err(FrameError::LengthOverflow);
                        }
                        if len <= 0xFFFF {
                            return Err(FrameError::NonMinimalLength);
                        }
                        len
                    };
                    self.scratch.clear();
                    let max = self.config.max_payload_size;
                    let length = usize::try_from(length)
                        .map_err(|_| FrameError::PayloadTooLarge { size: length, max })?;
                    self.length_known(length)?;
                }
                State::ReadingMaskingKey => {
                    if !self.fill(data, pos, 4) {
                        return Ok(None);
                    }
                    let mut key = [0u8; 4];
                    key.copy_from_slice(&self.scratch[..4]);
                    self.header.mask = Some(key);
                    self.scratch.clear();
                    self.state = State::ReadingPayload;
                }
                State::ReadingPayload => {
                    if !self.fill(data, pos, self.header.length) {
                        return Ok(None);
                    }
                    let frame = self.finish_frame()?;
                    self.state = State::Ready;
                    return Ok(Some(frame));
                }
            }
        }
    }

    /// Copies bytes from `data` until `scratch` holds `need`. Returns `true` once it does.
    fn fill(&mut self, data: &[u8], pos: &mut usize, need: usize) -> bool {
        let missing = need.saturating_sub(self.scratch.len());
        let take = missing.min(data.len() - *pos);
        self.scratch.extend_from_slice(&data[*pos..*pos + take]);
        *pos += take;
        self.scratch.len() >= need
    }

    /// Decodes and checks the first two header bytes. Returns the 7-bit length field.
    fn read_header(&mut self, b0: u8, b1: u8) -> Result<u8, FrameError> {
        let fin = b0 & 0x80 != 0;
        let rsv = [b0 & 0x40 != 0, b0 & 0x20 != 0, b0 & 0x10 != 0];
        let opcode = Opcode::from_u8(b0).ok_or(FrameError::UnknownOpcode(b0 & 0x0F))?;
        let masked = b1 & 0x80 != 0;

        if rsv.iter().any(|&bit| bit) && !self.config.allow_reserved_bits {
            return Err(FrameError::ReservedBits);
        }
        match (self.config.mask_policy, masked) {
            (MaskPolicy::Required, false) => return Err(FrameError::UnmaskedFrame),
            (MaskPolicy::Forbidden, true) => return Err(FrameError::UnexpectedMask),
            _ => {}
        }
        if opcode.is_control() && !fin {
            return Err(FrameError::FragmentedControlFrame);
        }
        if self.track_fragments {
            match (opcode, self.open_message) {
                (Opcode::Continuation, None) => return Err(FrameError::UnexpectedContinuation),
                (Opcode::Text | Opcode::Binary, Some(_)) => {
                    return Err(FrameError::InterleavedDataFrame);
                }
                _ => {}
            }
        }

        self.header.fin = fin;
        self.header.rsv = rsv;
        self.header.opcode = Some(opcode);
        self.header.masked = masked;
        Ok(b1 & 0x7F)
    }

    fn length_known(&mut self, length: usize) -> Result<(), FrameError> {
        let is_control = self.header.opcode.is_some_and(Opcode::is_control);
        if is_control && length > MAX_CONTROL_PAYLOAD {
            return Err(FrameError::ControlFrameTooLarge(length));
        }
        if length > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: length as u64,
                max: self.config.max_payload_size,
            });
        }
        self.header.length = length;
        self.state = if self.header.masked {
            State::ReadingMaskingKey
        } else {
            State::ReadingPayload
        };
        Ok(())
    }

    fn finish_frame(&mut self) -> Result<Frame, FrameError> {
        let mut payload = self.scratch.split_to(self.header.length);
        if let Some(key) = self.header.mask {
            apply_mask(&mut payload, key);
        }
        let opcode = self.header.opcode.unwrap_or(Opcode::Binary);
        let frame = Frame {
            fin: self.header.fin,
            rsv1: self.header.rsv[0],
            rsv2: self.header.rsv[1],
            rsv3: self.header.rsv[2],
            opcode,
            mask: self.header.mask,
            payload: Bytes::from(payload),
        };

        if opcode == Opcode::Close {
            frame.close_payload()?;
        }
        // A text message carried by a single frame can be checked here; fragmented
        // text is checked once reassembled.
        if opcode == Opcode::Text && frame.fin && !frame.rsv1 {
            std::str::from_utf8(&frame.payload).map_err(|_| FrameError::InvalidUtf8)?;
        }

        if self.track_fragments {
            match opcode {
                Opcode::Text | Opcode::Binary if !frame.fin => self.open_message = Some(opcode),
                Opcode::Continuation if frame.fin => self.open_message = None,
                _ => {}
            }
        }
        Ok(frame)
    }
}

/// Decodes one frame from the front of `buf` without fragmentation context.
///
/// Returns `Ok(None)` when `buf` does not yet hold a whole frame.
pub fn decode_frame(buf: &[u8], config: ParserConfig) -> Result<Option<(Frame, usize)>, FrameError> {
    match FrameParser::standalone(config).parse(buf)? {
        ParseStatus::Complete { frame, consumed } => Ok(Some((frame, consumed))),
        ParseStatus::Incomplete { .. } => Ok(None),
    }
}
