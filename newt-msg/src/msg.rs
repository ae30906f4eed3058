use newt_cursor::Cursor;

use crate::error::{FrameError, OptionsError};
use crate::opt::{num, Options};
use crate::{Code, ContentFormat, Token, PAYLOAD_MARKER};

/// The transport-independent part of a CoAP message: code, token,
/// options and payload.
///
/// The UDP-only fields (type, message id) live on
/// [`udp::Datagram`](crate::udp::Datagram); a TCP frame is a `Message`
/// plus the stream length prefix.
///
/// The payload borrows from the datagram it was decoded from (or, on
/// the way out, from the send buffer the payload was staged in) — a
/// message never owns a second copy of a potentially block-sized
/// payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Message<'p> {
  /// Request method / response status
  pub code: Code,
  /// Exchange correlation token
  pub token: Token,
  /// The option table
  pub opts: Options,
  /// Payload, without the 0xFF marker
  pub payload: &'p [u8],
}

impl<'p> Message<'p> {
  /// A message with the given code, no token, no options, no payload
  pub fn new(code: Code) -> Self {
    Self { code,
           token: Token::empty(),
           opts: Options::new(),
           payload: &[] }
  }

  /// The Content-Format option, if present
  pub fn content_format(&self) -> Result<Option<ContentFormat>, OptionsError> {
    ContentFormat::decode(&self.opts)
  }

  /// The Accept option, if present
  pub fn accept(&self) -> Result<Option<ContentFormat>, OptionsError> {
    ContentFormat::decode_accept(&self.opts)
  }

  /// Append one Uri-Path segment
  pub fn add_uri_path(&mut self, segment: &str) -> Result<(), OptionsError> {
    self.opts.add_str(num::URI_PATH, segment)
  }

  /// Append one Uri-Query argument
  pub fn add_uri_query(&mut self, query: &str) -> Result<(), OptionsError> {
    self.opts.add_str(num::URI_QUERY, query)
  }

  /// All Location-Path segment values in order
  pub fn location_paths(&self) -> impl Iterator<Item = &[u8]> + '_ {
    self.opts.get_all(num::LOCATION_PATH)
  }
}

// the region after the options: either nothing, or a marker followed
// by at least one payload byte
pub(crate) fn decode_payload<'p>(cursor: &mut Cursor<'p>) -> Result<&'p [u8], FrameError> {
  match cursor.next() {
    | None => Ok(&[]),
    | Some(PAYLOAD_MARKER) if cursor.remaining() > 0 => Ok(cursor.take_until_end()),
    // a marker with no payload after it is malformed
    | Some(_) => Err(FrameError::Malformed),
  }
}
