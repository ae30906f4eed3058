//! Recognizing what a decoded CoAP message means in LwM2M terms.
//!
//! The mapping is a pure function of the parsed fields — code, Observe
//! presence/value, Accept, Content-Format and the Uri-Path segments —
//! followed by per-operation URI validation.

use newt_msg::opt::{num, observe::Observe, Options};
use newt_msg::{Block, BlockKind, Code, CodeKind, ContentFormat, Message, Token};
use tinyvec::ArrayVec;

use crate::observe::Attributes;
use crate::path::{Level, UriPath, ID_NONE};
use crate::strbuf::StrBuf;

/// Longest Location-Path segment stored
pub const MAX_LOCATION_SEGMENT: usize = 32;

/// Most Location-Path options accepted in a Register response
pub const MAX_LOCATION_PATHS: usize = 4;

/// The registration resource location assigned by the server
pub type LocationPath = ArrayVec<[StrBuf<MAX_LOCATION_SEGMENT>; MAX_LOCATION_PATHS]>;

/// Recognition errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognizeError {
  /// The message cannot be an LwM2M message
  Malformed,
  /// The URI does not fit the recognized operation
  InputArg,
  /// More Location-Path options than [`MAX_LOCATION_PATHS`]
  LocationPaths,
}

/// What the peer is asking for (or answering)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
  /// GET with a non-link-format Accept
  Read,
  /// GET with Accept: link-format
  Discover,
  /// GET + Observe 0
  ObserveStart,
  /// GET + Observe 1
  ObserveCancel,
  /// FETCH
  ReadComposite,
  /// FETCH + Observe 0
  ObserveCompositeStart,
  /// FETCH + Observe 1
  ObserveCompositeCancel,
  /// PUT with a Content-Format
  WriteReplace,
  /// PUT without a Content-Format
  WriteAttributes,
  /// POST on an instance (or on a multiple-instance resource with a
  /// hierarchical Content-Format)
  WritePartial,
  /// iPATCH
  WriteComposite,
  /// POST on a resource with no/plaintext Content-Format
  Execute,
  /// POST on an object
  Create,
  /// DELETE
  Delete,
  /// POST /bs
  BootstrapFinish,
  /// A 2.xx-5.xx response to something we sent
  Response,
  /// Reset (UDP)
  CoapReset,
  /// Confirmable empty message (UDP): answer with Reset
  CoapPing,
  /// Ack-empty: the separate acknowledgement
  CoapEmpty,
}

/// One recognized inbound message, with everything the sessions need
/// pulled out of the option table.
#[derive(Debug)]
pub struct Inbound<'p> {
  /// The recognized operation
  pub op: Operation,
  /// UDP message type
  pub ty: newt_msg::Type,
  /// UDP message id
  pub msg_id: newt_msg::Id,
  /// Request code / response code
  pub code: Code,
  /// Correlation token
  pub token: Token,
  /// Target path (requests only)
  pub path: UriPath,
  /// Content-Format, if present
  pub content_format: Option<ContentFormat>,
  /// Accept, if present
  pub accept: Option<ContentFormat>,
  /// Block1/Block2, if present
  pub block: Option<(BlockKind, Block)>,
  /// Notification / discover attributes from Uri-Query
  pub attrs: Attributes,
  /// Location-Path segments (responses only)
  pub location: LocationPath,
  /// ETag option bytes, if present
  pub etag: Option<ArrayVec<[u8; 8]>>,
  /// The payload
  pub payload: &'p [u8],
}

fn decode_uri_path(opts: &Options) -> Result<(UriPath, bool), RecognizeError> {
  let mut path = UriPath::root();
  let mut iter = 0;
  let mut first = true;

  while let Some(seg) = opts.iter_get(num::URI_PATH, &mut iter) {
    if first && seg == b"bs" {
      return Ok((path, true));
    }
    first = false;

    if seg.is_empty() {
      // an empty first segment is the root path; anywhere else it is
      // nonsense
      return if path.is_root() {
        Ok((path, false))
      } else {
        Err(RecognizeError::Malformed)
      };
    }

    let text = core::str::from_utf8(seg).map_err(|_| RecognizeError::Malformed)?;
    if text.is_empty() || text.len() > 5 || text.bytes().any(|b| !b.is_ascii_digit())
    {
      return Err(RecognizeError::Malformed);
    }
    let id: u32 = text.parse().map_err(|_| RecognizeError::Malformed)?;
    if id >= u32::from(ID_NONE) {
      return Err(RecognizeError::Malformed);
    }
    path = path.push(id as u16).ok_or(RecognizeError::Malformed)?;
  }
  Ok((path, false))
}

fn validate_uri(op: Operation, path: &UriPath) -> Result<(), RecognizeError> {
  let ok = match op {
    | Operation::Read
    | Operation::WritePartial
    | Operation::WriteReplace
    | Operation::ObserveStart
    | Operation::ObserveCancel => path.has(Level::Object),
    | Operation::Discover => !path.has(Level::ResourceInstance),
    | Operation::Execute => path.is(Level::Resource),
    | Operation::Create => path.is(Level::Object),
    | Operation::Delete => !path.is(Level::Resource),
    | _ => true,
  };
  if ok {
    Ok(())
  } else {
    Err(RecognizeError::InputArg)
  }
}

fn recognize_request(code: Code,
                     opts: &Options,
                     is_bs: bool,
                     path: &UriPath,
                     accept: Option<ContentFormat>,
                     content_format: Option<ContentFormat>)
                     -> Result<Operation, RecognizeError> {
  let observe = Observe::decode(opts).map_err(|_| RecognizeError::Malformed)?;

  let op = match code {
    | Code::GET => match observe {
      | Some(Observe::Register) => Operation::ObserveStart,
      | Some(Observe::Deregister) => Operation::ObserveCancel,
      | None if accept == Some(ContentFormat::LinkFormat) => Operation::Discover,
      | None => Operation::Read,
    },
    | Code::FETCH => match observe {
      | Some(Observe::Register) => Operation::ObserveCompositeStart,
      | Some(Observe::Deregister) => Operation::ObserveCompositeCancel,
      | None => Operation::ReadComposite,
    },
    | Code::POST if is_bs => Operation::BootstrapFinish,
    | Code::POST if path.is(Level::Object) => Operation::Create,
    | Code::POST if path.is(Level::Instance) => Operation::WritePartial,
    | Code::POST if path.is(Level::Resource) => {
      // a hierarchical Content-Format makes this a partial write on a
      // multiple-instance resource; plain or absent means Execute
      match content_format {
        | None | Some(ContentFormat::PlainText) => Operation::Execute,
        | Some(_) => Operation::WritePartial,
      }
    },
    | Code::PUT if content_format.is_some() => Operation::WriteReplace,
    | Code::PUT => Operation::WriteAttributes,
    | Code::IPATCH => Operation::WriteComposite,
    | Code::DELETE => Operation::Delete,
    | _ => return Err(RecognizeError::Malformed),
  };
  validate_uri(op, path)?;
  Ok(op)
}

fn decode_location(opts: &Options) -> Result<LocationPath, RecognizeError> {
  let mut location = LocationPath::new();
  for seg in opts.get_all(num::LOCATION_PATH) {
    if location.len() == MAX_LOCATION_PATHS {
      return Err(RecognizeError::LocationPaths);
    }
    let text = core::str::from_utf8(seg).map_err(|_| RecognizeError::Malformed)?;
    let seg = StrBuf::copy_of(text).ok_or(RecognizeError::Malformed)?;
    location.push(seg);
  }
  Ok(location)
}

/// An RFC 8323 signaling message (stream transports reuse small
/// option numbers inside the 7.xx codes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signaling {
  /// 7.01 Capabilities and Settings
  Csm {
    /// Max-Message-Size option (2)
    max_message_size: Option<u32>,
    /// Block-Wise-Transfer capability option (4)
    block_wise: bool,
  },
  /// 7.02 Ping
  Ping {
    /// Custody option (2)
    custody: bool,
  },
  /// 7.03 Pong
  Pong {
    /// Custody option (2)
    custody: bool,
  },
}

/// Recognize a 7.xx signaling message; `Ok(None)` when `msg` is not
/// one.
pub fn recognize_signaling(msg: &Message<'_>) -> Result<Option<Signaling>, RecognizeError> {
  let signaling = match msg.code {
    | Code::CSM => Signaling::Csm { max_message_size:
                                      msg.opts
                                         .get_u32(num::MAX_MESSAGE_SIZE)
                                         .map_err(|_| RecognizeError::Malformed)?,
                                    block_wise:
                                      msg.opts.get_empty(num::BLOCK_WISE_TRANSFER) },
    | Code::PING => Signaling::Ping { custody: msg.opts.get_empty(num::CUSTODY) },
    | Code::PONG => Signaling::Pong { custody: msg.opts.get_empty(num::CUSTODY) },
    | _ => return Ok(None),
  };
  Ok(Some(signaling))
}

/// [`recognize`] with a zero message id, for tests and stream
/// transports
pub fn recognize_msg<'p>(msg: &Message<'p>,
                         ty: newt_msg::Type)
                         -> Result<Inbound<'p>, RecognizeError> {
  recognize(msg, ty, newt_msg::Id(0))
}

/// Recognize a UDP datagram's LwM2M meaning.
///
/// The type separates the NonConfirmable-specific rules (only an
/// Execute may arrive NonConfirmable) and the empty-message forms.
pub fn recognize<'p>(msg: &Message<'p>,
                     ty: newt_msg::Type,
                     msg_id: newt_msg::Id)
                     -> Result<Inbound<'p>, RecognizeError> {
  use newt_msg::Type;

  let content_format = msg.content_format().map_err(|_| RecognizeError::Malformed)?;
  let accept = msg.accept().map_err(|_| RecognizeError::Malformed)?;

  let (op, path, attrs, location) = match (ty, msg.code.kind()) {
    | (Type::Reset, _) => {
      (Operation::CoapReset, UriPath::root(), Attributes::default(),
       LocationPath::new())
    },
    | (Type::Con, CodeKind::Empty) => {
      (Operation::CoapPing, UriPath::root(), Attributes::default(),
       LocationPath::new())
    },
    | (Type::Ack, CodeKind::Empty) => {
      (Operation::CoapEmpty, UriPath::root(), Attributes::default(),
       LocationPath::new())
    },
    | (Type::Con | Type::Non, CodeKind::Request) => {
      let (path, is_bs) = decode_uri_path(&msg.opts)?;
      let op = recognize_request(msg.code, &msg.opts, is_bs, &path, accept,
                                 content_format)?;
      if ty == Type::Non && op != Operation::Execute {
        return Err(RecognizeError::Malformed);
      }
      let attrs = match op {
        | Operation::WriteAttributes
        | Operation::ObserveStart
        | Operation::ObserveCompositeStart
        | Operation::Discover => {
          Attributes::decode(&msg.opts).map_err(|_| RecognizeError::Malformed)?
        },
        | _ => Attributes::default(),
      };
      (op, path, attrs, LocationPath::new())
    },
    | (Type::Ack | Type::Con | Type::Non, CodeKind::Response)
      if msg.code <= Code::PROXYING_NOT_SUPPORTED =>
    {
      (Operation::Response, UriPath::root(), Attributes::default(),
       decode_location(&msg.opts)?)
    },
    | _ => return Err(RecognizeError::Malformed),
  };

  let block = Block::decode(&msg.opts).map_err(|_| RecognizeError::Malformed)?;
  let etag = match msg.opts.get_first(num::ETAG) {
    | Some(bytes) if bytes.len() > 8 => return Err(RecognizeError::Malformed),
    | Some(bytes) => {
      let mut etag = ArrayVec::new();
      etag.extend_from_slice(bytes);
      Some(etag)
    },
    | None => None,
  };

  Ok(Inbound { op,
               ty,
               msg_id,
               code: msg.code,
               token: msg.token,
               path,
               content_format,
               accept,
               block,
               attrs,
               location,
               etag,
               payload: msg.payload })
}

#[cfg(test)]
mod tests {
  use newt_msg::Type;

  use super::*;

  fn request(code: Code, path: &[&str]) -> Message<'static> {
    let mut msg = Message::new(code);
    msg.token = Token::opaque(&[1]);
    for seg in path {
      msg.add_uri_path(seg).unwrap();
    }
    msg
  }

  #[test]
  fn decision_table() {
    // GET + Accept link-format = Discover
    let mut msg = request(Code::GET, &["3"]);
    msg.opts
       .add_u16(num::ACCEPT, ContentFormat::LinkFormat.into())
       .unwrap();
    assert_eq!(recognize_msg(&msg, Type::Con).unwrap().op, Operation::Discover);

    // plain GET = Read
    let msg = request(Code::GET, &["3", "0"]);
    assert_eq!(recognize_msg(&msg, Type::Con).unwrap().op, Operation::Read);

    // GET + Observe 0 / 1
    let mut msg = request(Code::GET, &["3", "0", "9"]);
    msg.opts.add_bytes(num::OBSERVE, &[]).unwrap();
    assert_eq!(recognize_msg(&msg, Type::Con).unwrap().op, Operation::ObserveStart);
    let mut msg = request(Code::GET, &["3", "0", "9"]);
    msg.opts.add_bytes(num::OBSERVE, &[1]).unwrap();
    assert_eq!(recognize_msg(&msg, Type::Con).unwrap().op,
               Operation::ObserveCancel);

    // FETCH variants
    let msg = request(Code::FETCH, &[]);
    assert_eq!(recognize_msg(&msg, Type::Con).unwrap().op,
               Operation::ReadComposite);
    let mut msg = request(Code::FETCH, &[]);
    msg.opts.add_bytes(num::OBSERVE, &[]).unwrap();
    assert_eq!(recognize_msg(&msg, Type::Con).unwrap().op,
               Operation::ObserveCompositeStart);

    // PUT with/without Content-Format
    let mut msg = request(Code::PUT, &["1", "0", "1"]);
    msg.opts.add_u16(num::CONTENT_FORMAT, 112).unwrap();
    assert_eq!(recognize_msg(&msg, Type::Con).unwrap().op, Operation::WriteReplace);
    let mut msg = request(Code::PUT, &["1", "0", "1"]);
    msg.add_uri_query("pmin=10").unwrap();
    assert_eq!(recognize_msg(&msg, Type::Con).unwrap().op,
               Operation::WriteAttributes);

    // POST at each level
    let msg = request(Code::POST, &["bs"]);
    assert_eq!(recognize_msg(&msg, Type::Con).unwrap().op,
               Operation::BootstrapFinish);
    let msg = request(Code::POST, &["2"]);
    assert_eq!(recognize_msg(&msg, Type::Con).unwrap().op, Operation::Create);
    let msg = request(Code::POST, &["1", "0"]);
    assert_eq!(recognize_msg(&msg, Type::Con).unwrap().op, Operation::WritePartial);
    let msg = request(Code::POST, &["1", "0", "8"]);
    assert_eq!(recognize_msg(&msg, Type::Con).unwrap().op, Operation::Execute);
    let mut msg = request(Code::POST, &["1", "0", "8"]);
    msg.opts.add_u16(num::CONTENT_FORMAT, 11544).unwrap();
    assert_eq!(recognize_msg(&msg, Type::Con).unwrap().op, Operation::WritePartial);

    // iPATCH & DELETE
    let msg = request(Code::IPATCH, &[]);
    assert_eq!(recognize_msg(&msg, Type::Con).unwrap().op,
               Operation::WriteComposite);
    let msg = request(Code::DELETE, &["1", "0"]);
    assert_eq!(recognize_msg(&msg, Type::Con).unwrap().op, Operation::Delete);
  }

  #[test]
  fn uri_validation() {
    // Read requires at least an Object
    let msg = request(Code::GET, &[]);
    assert_eq!(recognize_msg(&msg, Type::Con).unwrap_err(),
               RecognizeError::InputArg);

    // Create takes exactly an Object
    let msg = request(Code::POST, &[]);
    assert!(recognize_msg(&msg, Type::Con).is_err());

    // Delete cannot target a Resource
    let msg = request(Code::DELETE, &["1", "0", "1"]);
    assert_eq!(recognize_msg(&msg, Type::Con).unwrap_err(),
               RecognizeError::InputArg);

    // Discover cannot go below Resource
    let mut msg = request(Code::GET, &["1", "0", "1", "0"]);
    msg.opts
       .add_u16(num::ACCEPT, ContentFormat::LinkFormat.into())
       .unwrap();
    assert_eq!(recognize_msg(&msg, Type::Con).unwrap_err(),
               RecognizeError::InputArg);
  }

  #[test]
  fn non_confirmable_only_executes() {
    let msg = request(Code::POST, &["1", "0", "8"]);
    assert_eq!(recognize_msg(&msg, Type::Non).unwrap().op, Operation::Execute);

    let msg = request(Code::GET, &["3", "0"]);
    assert!(recognize_msg(&msg, Type::Non).is_err());
  }

  #[test]
  fn responses_collect_location_paths() {
    let mut msg = Message::new(Code::CREATED);
    msg.token = Token::opaque(&[1]);
    msg.opts.add_str(num::LOCATION_PATH, "rd").unwrap();
    msg.opts.add_str(num::LOCATION_PATH, "5a3f").unwrap();

    let inbound = recognize_msg(&msg, Type::Ack).unwrap();
    assert_eq!(inbound.op, Operation::Response);
    let segs: Vec<&str> = inbound.location.iter().map(|s| s.as_str()).collect();
    assert_eq!(segs, ["rd", "5a3f"]);
  }

  #[test]
  fn too_many_location_paths() {
    let mut msg = Message::new(Code::CREATED);
    for _ in 0..MAX_LOCATION_PATHS + 1 {
      msg.opts.add_str(num::LOCATION_PATH, "x").unwrap();
    }
    assert_eq!(recognize_msg(&msg, Type::Ack).unwrap_err(),
               RecognizeError::LocationPaths);
  }

  #[test]
  fn ping_reset_empty() {
    let msg = Message::new(Code::EMPTY);
    assert_eq!(recognize_msg(&msg, Type::Con).unwrap().op, Operation::CoapPing);
    assert_eq!(recognize_msg(&msg, Type::Reset).unwrap().op, Operation::CoapReset);
    assert_eq!(recognize_msg(&msg, Type::Ack).unwrap().op, Operation::CoapEmpty);
  }

  #[test]
  fn signaling_messages() {
    let mut csm = Message::new(Code::CSM);
    csm.opts.add_u32(num::MAX_MESSAGE_SIZE, 1152).unwrap();
    csm.opts.add_empty(num::BLOCK_WISE_TRANSFER).unwrap();
    assert_eq!(recognize_signaling(&csm).unwrap(),
               Some(Signaling::Csm { max_message_size: Some(1152),
                                     block_wise: true }));

    let mut ping = Message::new(Code::PING);
    ping.opts.add_empty(num::CUSTODY).unwrap();
    assert_eq!(recognize_signaling(&ping).unwrap(),
               Some(Signaling::Ping { custody: true }));

    assert_eq!(recognize_signaling(&Message::new(Code::PONG)).unwrap(),
               Some(Signaling::Pong { custody: false }));
    assert_eq!(recognize_signaling(&Message::new(Code::GET)).unwrap(), None);
  }
}
