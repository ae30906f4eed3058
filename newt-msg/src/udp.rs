//! RFC 7252 datagram framing.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Ver| T |  TKL  |      Code     |          Message ID           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Token (if any, TKL bytes) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Options (if any) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |1 1 1 1 1 1 1 1|    Payload (if any) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use newt_cursor::{Appender, Cursor};

use crate::error::FrameError;
use crate::msg::decode_payload;
use crate::opt::Options;
use crate::{Code, CodeKind, Id, Message, Token, Type, Version, MAX_TOKEN_LEN,
            PAYLOAD_MARKER};

/// Fixed UDP header length (before the token)
pub const HEADER_LEN: usize = 4;

/// A full UDP CoAP message: type + id + the transport-independent body
#[derive(Clone, Debug, PartialEq)]
pub struct Datagram<'p> {
  /// Con / Non / Ack / Reset
  pub ty: Type,
  /// Deduplication & ACK correlation id
  pub id: Id,
  /// Code, token, options, payload
  pub msg: Message<'p>,
}

impl<'p> Datagram<'p> {
  /// A datagram around `msg`
  pub fn new(ty: Type, id: Id, msg: Message<'p>) -> Self {
    Self { ty, id, msg }
  }

  /// The Reset answering a CoAP ping (or rejecting `id`)
  pub fn reset(id: Id) -> Self {
    Self::new(Type::Reset, id, Message::new(Code::EMPTY))
  }

  /// The separate-ACK empty message for `id`
  pub fn empty_ack(id: Id) -> Self {
    Self::new(Type::Ack, id, Message::new(Code::EMPTY))
  }
}

// RFC7252 4.1-4.3: combinations of type and code that can never appear
fn header_is_valid(ty: Type, code: Code) -> bool {
  match ty {
    | Type::Ack => code.kind() != CodeKind::Request,
    // Con empty is the CoAP ping
    | Type::Non => code != Code::EMPTY,
    | Type::Reset => code == Code::EMPTY,
    | Type::Con => true,
  }
}

/// Decode one datagram.
///
/// Fails [`FrameError::Malformed`] on: version other than 1, token
/// length over 8, a type/code combination ruled out by RFC 7252, an
/// empty-code message with trailing bytes, a malformed option stream,
/// or a payload marker followed by nothing.
pub fn decode(datagram: &[u8]) -> Result<Datagram<'_>, FrameError> {
  let mut cursor = Cursor::new(datagram);

  let byte1 = cursor.next().ok_or(FrameError::Malformed)?;
  let ver = Version(byte1 >> 6);
  let ty = Type::try_from(byte1 >> 4 & 0b11)?;
  let tkl = usize::from(byte1 & 0b1111);

  if ver != Version::default() || tkl > MAX_TOKEN_LEN {
    return Err(FrameError::Malformed);
  }

  let code = Code::from(cursor.next().ok_or(FrameError::Malformed)?);
  let id = Id(cursor.take_u16().ok_or(FrameError::Malformed)?);

  if !header_is_valid(ty, code) {
    return Err(FrameError::Malformed);
  }
  if code == Code::EMPTY && cursor.remaining() > 0 {
    return Err(FrameError::Malformed);
  }

  let token = Token::opaque(cursor.take_exact(tkl).ok_or(FrameError::Malformed)?);
  let opts = Options::decode(&mut cursor)?;
  let payload = decode_payload(&mut cursor)?;

  Ok(Datagram { ty,
                id,
                msg: Message { code,
                               token,
                               opts,
                               payload } })
}

/// Serialize `d` into `out`, yielding the number of bytes written.
pub fn encode(d: &Datagram, out: &mut [u8]) -> Result<usize, FrameError> {
  let mut app = Appender::new(out);

  let byte1 = Version::default().0 << 6
              | u8::from(d.ty) << 4
              | d.msg.token.len() as u8;
  app.push(byte1)?;
  app.push(d.msg.code.into())?;
  app.append_u16(d.id.0)?;
  app.append(d.msg.token.as_bytes())?;
  app.append(d.msg.opts.as_bytes())?;

  if !d.msg.payload.is_empty() {
    app.push(PAYLOAD_MARKER)?;
    app.append(d.msg.payload)?;
  }

  Ok(app.written())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::opt::num;

  #[test]
  fn round_trip() {
    let mut msg = Message::new(Code::POST);
    msg.token = Token::opaque(&[0x11, 0x22, 0x33, 0x44]);
    msg.add_uri_path("rd").unwrap();
    msg.add_uri_query("ep=name").unwrap();
    let payload = b"</1>;ver=1.2,</1/1>";
    msg.payload = payload;

    let d = Datagram::new(Type::Con, Id(0x2137), msg);
    let mut buf = [0u8; 128];
    let n = encode(&d, &mut buf).unwrap();
    let decoded = decode(&buf[..n]).unwrap();
    assert_eq!(decoded, d);
  }

  #[test]
  fn known_bytes() {
    let mut msg = Message::new(Code::GET);
    msg.token = Token::opaque(&[0xAB]);
    msg.add_uri_path("3").unwrap();

    let d = Datagram::new(Type::Con, Id(0x0102), msg);
    let mut buf = [0u8; 32];
    let n = encode(&d, &mut buf).unwrap();
    assert_eq!(&buf[..n],
               [0b01_00_0001, 0x01, 0x01, 0x02, 0xAB, 0xB1, b'3']);
  }

  #[test]
  fn token_lengths_0_and_8_ok_9_rejected() {
    for tkl in [0usize, 8] {
      let mut msg = Message::new(Code::GET);
      msg.token = Token::opaque(&[7; 8][..tkl]);
      let d = Datagram::new(Type::Con, Id(1), msg);
      let mut buf = [0u8; 32];
      let n = encode(&d, &mut buf).unwrap();
      assert_eq!(decode(&buf[..n]).unwrap().msg.token.len(), tkl);
    }

    let bytes = [0b01_00_1001, 0x01, 0x00, 0x01, 1, 2, 3, 4, 5, 6, 7, 8, 9];
    assert_eq!(decode(&bytes), Err(FrameError::Malformed));
  }

  #[test]
  fn version_must_be_1() {
    let bytes = [0b10_00_0000, 0x01, 0x00, 0x01];
    assert_eq!(decode(&bytes), Err(FrameError::Malformed));
  }

  #[test]
  fn reset_requires_empty_code() {
    let ok = [0b01_11_0000, 0x00, 0x00, 0x07];
    assert_eq!(decode(&ok).unwrap().ty, Type::Reset);

    let bad = [0b01_11_0000, 0x45, 0x00, 0x07];
    assert_eq!(decode(&bad), Err(FrameError::Malformed));
  }

  #[test]
  fn ack_must_not_carry_a_request() {
    let bad = [0b01_10_0000, 0x01, 0x00, 0x07];
    assert_eq!(decode(&bad), Err(FrameError::Malformed));

    // Ack + response is the piggybacked response
    let ok = [0b01_10_0000, 0x44, 0x00, 0x07];
    assert_eq!(decode(&ok).unwrap().msg.code, Code::CHANGED);
  }

  #[test]
  fn non_confirmable_empty_rejected_con_empty_is_ping() {
    let bad = [0b01_01_0000, 0x00, 0x00, 0x07];
    assert_eq!(decode(&bad), Err(FrameError::Malformed));

    let ping = [0b01_00_0000, 0x00, 0x00, 0x07];
    let d = decode(&ping).unwrap();
    assert_eq!((d.ty, d.msg.code), (Type::Con, Code::EMPTY));
  }

  #[test]
  fn empty_code_with_trailing_bytes_rejected() {
    let bad = [0b01_00_0001, 0x00, 0x00, 0x07, 0xAA];
    assert_eq!(decode(&bad), Err(FrameError::Malformed));
  }

  #[test]
  fn marker_with_no_payload_rejected() {
    let bad = [0b01_00_0000, 0x01, 0x00, 0x07, 0xFF];
    assert_eq!(decode(&bad), Err(FrameError::Malformed));
  }

  #[test]
  fn no_payload_no_marker() {
    let mut msg = Message::new(Code::CONTENT);
    msg.opts.add_u16(num::CONTENT_FORMAT, 0).unwrap();
    let d = Datagram::new(Type::Ack, Id(9), msg);
    let mut buf = [0u8; 16];
    let n = encode(&d, &mut buf).unwrap();
    assert_ne!(buf[n - 1], PAYLOAD_MARKER);
  }
}
