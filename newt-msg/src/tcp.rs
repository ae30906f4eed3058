//! RFC 8323 stream framing.
//!
//! A TCP frame replaces the UDP type/id word with a variable-width
//! length field covering the options + payload-marker + payload region:
//!
//! ```text
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | Len=0..12 | TKL | (no ext)    |
//! | Len=13    | TKL | 1 byte ext  |  length = ext + 13
//! | Len=14    | TKL | 2 bytes ext |  length = ext + 269
//! | Len=15    | TKL | 4 bytes ext |  length = ext + 65805
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Code      | Token ...     | Options ... | 0xFF | Payload ...
//! ```
//!
//! The decoder implements the frame-completeness contract stream
//! transports need: [`FrameError::Incomplete`] until a whole frame is
//! buffered, and a resume offset when more than one frame is.

use newt_cursor::{Appender, Cursor};

use crate::error::FrameError;
use crate::msg::decode_payload;
use crate::opt::Options;
use crate::{Code, Message, Token, MAX_TOKEN_LEN, PAYLOAD_MARKER};

const EXT_8BIT: u8 = 13;
const EXT_16BIT: u8 = 14;
const EXT_32BIT: u8 = 15;

const BIAS_8BIT: usize = 13;
const BIAS_16BIT: usize = 269;
const BIAS_32BIT: usize = 65805;

/// One decoded frame, plus the offset at which the next frame begins
/// when the input held more than one.
#[derive(Clone, Debug, PartialEq)]
pub struct Decoded<'p> {
  /// The decoded message
  pub msg: Message<'p>,
  /// `Some(offset)` when `stream[offset..]` holds (the start of) the
  /// next frame; `None` when the input was exactly one frame
  pub next: Option<usize>,
}

fn ext_len_bytes(len_nibble: u8) -> usize {
  match len_nibble {
    | EXT_8BIT => 1,
    | EXT_16BIT => 2,
    | EXT_32BIT => 4,
    | _ => 0,
  }
}

fn decode_len(len_nibble: u8, cursor: &mut Cursor) -> Result<usize, FrameError> {
  match len_nibble {
    | EXT_8BIT => cursor.next()
                        .map(|b| usize::from(b) + BIAS_8BIT)
                        .ok_or(FrameError::Incomplete),
    | EXT_16BIT => cursor.take_u16()
                         .map(|n| usize::from(n) + BIAS_16BIT)
                         .ok_or(FrameError::Incomplete),
    | EXT_32BIT => cursor.take_u32()
                         .map(|n| n as usize + BIAS_32BIT)
                         .ok_or(FrameError::Incomplete),
    | n => Ok(usize::from(n)),
  }
}

/// Decode the first frame in `stream`.
///
/// Returns [`FrameError::Incomplete`] if `stream` does not yet hold a
/// whole frame — buffer more bytes and call again. If it holds more,
/// [`Decoded::next`] is the offset to resume parsing at.
pub fn decode(stream: &[u8]) -> Result<Decoded<'_>, FrameError> {
  let mut cursor = Cursor::new(stream);

  let byte0 = cursor.next().ok_or(FrameError::Incomplete)?;
  let len_nibble = byte0 >> 4;
  let tkl = usize::from(byte0 & 0b1111);
  if tkl > MAX_TOKEN_LEN {
    return Err(FrameError::Malformed);
  }

  let body_len = decode_len(len_nibble, &mut cursor)?;
  let frame_len = 1 + ext_len_bytes(len_nibble) + 1 + tkl + body_len;
  if stream.len() < frame_len {
    return Err(FrameError::Incomplete);
  }

  let code = Code::from(cursor.next().ok_or(FrameError::Incomplete)?);
  let token = Token::opaque(cursor.take_exact(tkl).ok_or(FrameError::Malformed)?);

  let mut body = Cursor::new(cursor.take_exact(body_len).ok_or(FrameError::Malformed)?);
  let (opts, payload) = if body_len == 0 {
    (Options::new(), &[][..])
  } else {
    let opts = Options::decode(&mut body)?;
    (opts, decode_payload(&mut body)?)
  };

  Ok(Decoded { msg: Message { code,
                              token,
                              opts,
                              payload },
               next: Some(frame_len).filter(|n| *n < stream.len()) })
}

/// Serialize `msg` as one frame into `out`, yielding bytes written.
pub fn encode(msg: &Message, out: &mut [u8]) -> Result<usize, FrameError> {
  let body_len = msg.opts.as_bytes().len()
                 + if msg.payload.is_empty() { 0 } else { 1 + msg.payload.len() };

  let mut app = Appender::new(out);
  let tkl = msg.token.len() as u8;

  match body_len {
    | n if n < BIAS_8BIT => {
      app.push((n as u8) << 4 | tkl)?;
    },
    | n if n < BIAS_16BIT => {
      app.push(EXT_8BIT << 4 | tkl)?;
      app.push((n - BIAS_8BIT) as u8)?;
    },
    | n if n < BIAS_32BIT => {
      app.push(EXT_16BIT << 4 | tkl)?;
      app.append_u16((n - BIAS_16BIT) as u16)?;
    },
    | n => {
      app.push(EXT_32BIT << 4 | tkl)?;
      app.append_u32((n - BIAS_32BIT) as u32)?;
    },
  }

  app.push(msg.code.into())?;
  app.append(msg.token.as_bytes())?;
  app.append(msg.opts.as_bytes())?;
  if !msg.payload.is_empty() {
    app.push(PAYLOAD_MARKER)?;
    app.append(msg.payload)?;
  }

  Ok(app.written())
}
