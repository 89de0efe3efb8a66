//! WebSocket frame codec (RFC 6455 section 5)
//!
//! The decoder is incremental over an internal buffer, like the HTTP
//! parser: feed it raw bytes, get complete frames back. Client frames must
//! be masked; server frames are written unmasked. Message assembly,
//! fragmentation rules, and close payload handling live here too.

use crate::errors::WsError;

// ----------------------------------------------------------------------------
// Opcodes and Messages
// ----------------------------------------------------------------------------

/// Frame opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    pub fn from_u4(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    pub fn as_u4(&self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// An assembled message as seen by applications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<(u16, String)>),
}

// ----------------------------------------------------------------------------
// Frame Decoding
// ----------------------------------------------------------------------------

/// A single decoded frame with its payload unmasked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Incremental frame decoder for masked client frames
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_size: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_size,
        }
    }

    /// Seed the decoder with bytes read past the upgrade head
    pub fn new_with_leftover(max_frame_size: usize, leftover: Vec<u8>) -> Self {
        Self {
            buf: leftover,
            max_frame_size,
        }
    }

    /// Feed bytes and collect every complete frame they unlock
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Frame>, WsError> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();
        while let Some(frame) = self.parse_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn parse_one(&mut self) -> Result<Option<Frame>, WsError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let b0 = self.buf[0];
        let b1 = self.buf[1];

        let fin = b0 & 0x80 != 0;
        if b0 & 0x70 != 0 {
            return Err(WsError::protocol("reserved bits set"));
        }
        let opcode = Opcode::from_u4(b0 & 0x0F)
            .ok_or_else(|| WsError::protocol(format!("unknown opcode {:#x}", b0 & 0x0F)))?;
        if b1 & 0x80 == 0 {
            return Err(WsError::protocol("client frame is not masked"));
        }
        let len7 = (b1 & 0x7F) as u64;

        if opcode.is_control() {
            if !fin {
                return Err(WsError::protocol("fragmented control frame"));
            }
            if len7 > 125 {
                return Err(WsError::protocol("control frame payload exceeds 125 bytes"));
            }
        }

        let (payload_len, len_bytes) = match len7 {
            126 => {
                if self.buf.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([self.buf[2], self.buf[3]])), 2)
            }
            127 => {
                if self.buf.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&self.buf[2..10]);
                let len = u64::from_be_bytes(raw);
                if len & (1 << 63) != 0 {
                    return Err(WsError::protocol("payload length high bit set"));
                }
                (len, 8)
            }
            n => (n, 0),
        };

        if payload_len > self.max_frame_size as u64 {
            return Err(WsError::FrameTooLarge {
                size: payload_len as usize,
                max: self.max_frame_size,
            });
        }

        let header_len = 2 + len_bytes + 4;
        let total = header_len + payload_len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }

        let mask_start = 2 + len_bytes;
        let mut key = [0u8; 4];
        key.copy_from_slice(&self.buf[mask_start..mask_start + 4]);

        let mut payload: Vec<u8> = self.buf[header_len..total].to_vec();
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
        self.buf.drain(..total);

        Ok(Some(Frame {
            fin,
            opcode,
            payload,
        }))
    }
}

// ----------------------------------------------------------------------------
// Frame Encoding
// ----------------------------------------------------------------------------

/// Encode a server frame. Server-to-client frames are never masked.
pub fn encode_frame(opcode: Opcode, payload: &[u8], fin: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    let b0 = if fin { 0x80 } else { 0x00 } | opcode.as_u4();
    out.push(b0);
    match payload.len() {
        n if n <= 125 => out.push(n as u8),
        n if n <= u16::MAX as usize => {
            out.push(126);
            out.extend_from_slice(&(n as u16).to_be_bytes());
        }
        n => {
            out.push(127);
            out.extend_from_slice(&(n as u64).to_be_bytes());
        }
    }
    out.extend_from_slice(payload);
    out
}

// ----------------------------------------------------------------------------
// Message Assembly
// ----------------------------------------------------------------------------

/// Assembles data frames into messages, enforcing fragmentation rules and
/// the message size limit. Control frames never enter the assembler.
#[derive(Debug)]
pub struct MessageAssembler {
    max_message_size: usize,
    opcode: Option<Opcode>,
    buf: Vec<u8>,
}

impl MessageAssembler {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            opcode: None,
            buf: Vec::new(),
        }
    }

    /// Push a data frame. Returns a message once its final fragment lands.
    pub fn push(&mut self, frame: Frame) -> Result<Option<WsMessage>, WsError> {
        match frame.opcode {
            Opcode::Text | Opcode::Binary => {
                if self.opcode.is_some() {
                    return Err(WsError::protocol(
                        "new data frame while a fragmented message is in progress",
                    ));
                }
                self.opcode = Some(frame.opcode);
                self.buf = frame.payload;
            }
            Opcode::Continuation => {
                if self.opcode.is_none() {
                    return Err(WsError::protocol("continuation frame without a message"));
                }
                self.buf.extend_from_slice(&frame.payload);
            }
            _ => return Err(WsError::protocol("control frame routed to assembler")),
        }

        if self.buf.len() > self.max_message_size {
            return Err(WsError::MessageTooLarge {
                size: self.buf.len(),
                max: self.max_message_size,
            });
        }

        if !frame.fin {
            return Ok(None);
        }

        let opcode = self.opcode.take().unwrap_or(Opcode::Binary);
        let payload = std::mem::take(&mut self.buf);
        match opcode {
            Opcode::Text => {
                let text = String::from_utf8(payload).map_err(|_| WsError::InvalidUtf8)?;
                Ok(Some(WsMessage::Text(text)))
            }
            _ => Ok(Some(WsMessage::Binary(payload))),
        }
    }
}

// ----------------------------------------------------------------------------
// Close Payloads
// ----------------------------------------------------------------------------

/// Whether a close code may appear on the wire (RFC 6455 section 7.4)
pub fn is_valid_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
}

/// Parse a close frame payload into code and reason
pub fn parse_close_payload(payload: &[u8]) -> Result<Option<(u16, String)>, WsError> {
    match payload.len() {
        0 => Ok(None),
        1 => Err(WsError::protocol("close payload of one byte")),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !is_valid_close_code(code) {
                return Err(WsError::InvalidCloseCode { code });
            }
            let reason =
                std::str::from_utf8(&payload[2..]).map_err(|_| WsError::InvalidUtf8)?;
            Ok(Some((code, reason.to_owned())))
        }
    }
}

/// Build a close frame payload, truncating the reason to fit a control
/// frame without splitting a UTF-8 sequence.
pub fn build_close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + reason.len().min(123));
    out.extend_from_slice(&code.to_be_bytes());
    let mut end = reason.len().min(123);
    while end > 0 && !reason.is_char_boundary(end) {
        end -= 1;
    }
    out.extend_from_slice(reason[..end].as_bytes());
    out
}
