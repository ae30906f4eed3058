//! `text/plain` (content format 0): a single value rendered as UTF-8
//! text.
//!
//! Numbers render as decimal, booleans as `0`/`1`, object links as
//! `oid:iid`, times as epoch seconds. On the way in the payload is
//! delivered as string pieces — narrowing `"42"` to an integer
//! resource is the data model's interpretation, made with the
//! [`parse`] helpers.

use core::fmt::Write;

use newt_cbor::Chunk;

use crate::io::buf::Staging;
use crate::io::{InEntry, IoError};
use crate::path::{Level, UriPath};
use crate::strbuf::StrBuf;
use crate::value::{BytesChunk, InValue, OutRecord, OutValue};

pub(crate) fn encode_value(staging: &mut Staging, value: &OutValue) -> Result<(), IoError> {
  let mut text = StrBuf::<{ crate::io::buf::STAGING_LEN }>::new();
  match *value {
    | OutValue::Int(v) => write!(text, "{}", v),
    | OutValue::Uint(v) => write!(text, "{}", v),
    | OutValue::Time(v) => write!(text, "{}", v),
    | OutValue::Double(v) => write!(text, "{}", v),
    | OutValue::Bool(v) => write!(text, "{}", u8::from(v)),
    | OutValue::ObjLink(link) => write!(text, "{}", link),
    | OutValue::Str(data) => {
      // the body streams from the record, nothing is staged
      staging.finish_record(Some(data.len()));
      return Ok(());
    },
    #[cfg(feature = "external-data")]
    | OutValue::ExternalStr(_) => {
      staging.finish_record(Some(1));
      return Ok(());
    },
    // opaque values have their own format (42)
    | _ => return Err(IoError::Type),
  }.map_err(|_| IoError::InputArg)?;

  staging.space()[..text.len()].copy_from_slice(text.as_str().as_bytes());
  staging.commit(text.len());
  staging.finish_record(None);
  Ok(())
}

pub(crate) fn pump_body(staging: &mut Staging,
                        entry: &OutRecord,
                        out: &mut [u8],
                        copied: &mut usize)
                        -> Result<(usize, bool), IoError> {
  match entry.value {
    | OutValue::Str(data) => {
      let offset = staging.body_offset();
      let n = (data.len() - offset).min(out.len() - *copied);
      out[*copied..*copied + n]
        .copy_from_slice(&data.as_bytes()[offset..offset + n]);
      *copied += n;
      staging.offset += n;
      staging.remaining -= n;
      if staging.remaining == 0 {
        staging.reset();
        Ok((*copied, false))
      } else {
        Ok((*copied, true))
      }
    },
    #[cfg(feature = "external-data")]
    | OutValue::ExternalStr(src) => {
      let offset = staging.body_offset();
      let (n, more) = src.read(&mut out[*copied..], offset)
                         .map_err(|_| IoError::InputArg)?;
      *copied += n;
      staging.offset += n;
      if !more {
        staging.reset();
      }
      Ok((*copied, more))
    },
    | _ => Err(IoError::Logic),
  }
}

/// Parsers a data model uses to narrow plaintext values
pub mod parse {
  use crate::value::ObjLink;

  /// Strict decimal signed integer
  pub fn int(s: &str) -> Option<i64> {
    if s.is_empty() || (s != "0" && (s == "-" || trimmed_zeros(s))) {
      return None;
    }
    s.parse().ok()
  }

  /// Strict decimal unsigned integer
  pub fn uint(s: &str) -> Option<u64> {
    if s.is_empty() || s.starts_with('-') || trimmed_zeros(s) {
      return None;
    }
    s.parse().ok()
  }

  /// Decimal float
  pub fn double(s: &str) -> Option<f64> {
    if s.is_empty() {
      return None;
    }
    s.parse().ok()
  }

  /// `"0"` or `"1"`
  pub fn boolean(s: &str) -> Option<bool> {
    match s {
      | "0" => Some(false),
      | "1" => Some(true),
      | _ => None,
    }
  }

  /// `"oid:iid"`
  pub fn objlink(s: &str) -> Option<ObjLink> {
    ObjLink::parse(s)
  }

  fn trimmed_zeros(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    digits.len() > 1 && digits.starts_with('0')
  }
}

/// The plaintext decoder: the raw payload, delivered as string pieces
/// at the request path.
#[derive(Debug)]
pub struct Decoder {
  path: UriPath,
  offset: usize,
  done: bool,
}

impl Decoder {
  pub(crate) fn new(base: &UriPath) -> Result<Self, IoError> {
    if !base.has(Level::Resource) {
      return Err(IoError::InputArg);
    }
    Ok(Self { path: *base,
              offset: 0,
              done: false })
  }

  pub(crate) fn get_entry<'s>(&'s mut self,
                              chunk: &'s mut Chunk<'_>)
                              -> nb::Result<Option<InEntry<'s>>, IoError> {
    if self.done {
      return Ok(None);
    }
    let data = chunk.take_remaining();
    if data.is_empty() && !chunk.is_last() {
      return Err(nb::Error::WouldBlock);
    }

    let offset = self.offset;
    self.offset += data.len();
    let full = chunk.is_last().then_some(self.offset);
    self.done = chunk.is_last();

    if core::str::from_utf8(data).is_err() {
      // piece-boundary splits inside code points are possible for
      // huge values, but a plaintext *value* must be valid overall;
      // only whole-chunk validation is feasible without buffering
      return Err(nb::Error::Other(IoError::Format));
    }

    Ok(Some(InEntry { path: Some(self.path),
                      value: Some(InValue::Str(BytesChunk { offset,
                                                            data,
                                                            full_length: full })) }))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn scalars_render_as_text() {
    for (value, expected) in
      [(OutValue::Int(-42), "-42"),
       (OutValue::Uint(17), "17"),
       (OutValue::Bool(true), "1"),
       (OutValue::Bool(false), "0"),
       (OutValue::Double(4.5), "4.5"),
       (OutValue::ObjLink(crate::value::ObjLink { oid: 1, iid: 2 }), "1:2")]
    {
      let mut staging = Staging::default();
      encode_value(&mut staging, &value).unwrap();
      let mut out = [0u8; 32];
      let n = staging.drain_staged(&mut out);
      assert_eq!(&out[..n], expected.as_bytes(), "{:?}", value);
    }
  }

  #[test]
  fn bytes_are_not_plaintext() {
    let mut staging = Staging::default();
    assert_eq!(encode_value(&mut staging, &OutValue::Bytes(b"xy")),
               Err(IoError::Type));
  }

  #[test]
  fn strict_parsers() {
    assert_eq!(parse::int("-42"), Some(-42));
    assert_eq!(parse::int("042"), None);
    assert_eq!(parse::int(""), None);
    assert_eq!(parse::uint("42"), Some(42));
    assert_eq!(parse::uint("-1"), None);
    assert_eq!(parse::boolean("1"), Some(true));
    assert_eq!(parse::boolean("true"), None);
    assert_eq!(parse::double("4.5"), Some(4.5));
    assert!(parse::objlink("1:2").is_some());
  }

  #[test]
  fn decoder_delivers_pieces() {
    let mut dec = Decoder::new(&UriPath::resource(3, 0, 15)).unwrap();

    let mut first = Chunk::new(b"Europe/", false);
    let entry = dec.get_entry(&mut first).unwrap().unwrap();
    match entry.value {
      | Some(InValue::Str(piece)) => {
        assert_eq!((piece.offset, piece.data, piece.full_length),
                   (0, &b"Europe/"[..], None));
      },
      | other => panic!("{:?}", other),
    }
    assert_eq!(dec.get_entry(&mut first), Err(nb::Error::WouldBlock));

    let mut second = Chunk::new(b"Warsaw", true);
    let entry = dec.get_entry(&mut second).unwrap().unwrap();
    match entry.value {
      | Some(InValue::Str(piece)) => {
        assert_eq!((piece.offset, piece.data, piece.full_length),
                   (7, &b"Warsaw"[..], Some(13)));
        assert!(piece.is_last());
      },
      | other => panic!("{:?}", other),
    }
    assert_eq!(dec.get_entry(&mut second).unwrap(), None);
  }
}
