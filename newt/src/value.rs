use core::fmt;

use crate::path::UriPath;

/// An Object Link: a reference to an object instance, carried in
/// SenML as the string `"oid:iid"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ObjLink {
  /// Object id
  pub oid: u16,
  /// Object Instance id
  pub iid: u16,
}

impl ObjLink {
  /// Parse the `"oid:iid"` form
  pub fn parse(s: &str) -> Option<Self> {
    let (oid, iid) = s.split_once(':')?;
    let strict = |p: &str| {
      (!p.is_empty() && p.len() <= 5 && p.bytes().all(|b| b.is_ascii_digit()))
        .then(|| p.parse::<u32>().ok())
        .flatten()
        .filter(|v| *v <= u32::from(u16::MAX))
        .map(|v| v as u16)
    };
    Some(ObjLink { oid: strict(oid)?,
                   iid: strict(iid)? })
  }
}

impl fmt::Display for ObjLink {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.oid, self.iid)
  }
}

/// A value producer for resources too large to hold in memory.
///
/// The consumer pulls: it calls [`ExternalSource::read`] with a buffer
/// and the absolute offset reached so far, and the producer fills in
/// bytes and says whether more follow. Text sources must produce valid
/// UTF-8 overall, but may split code points between calls — the
/// encoder re-aligns chunks on code-point boundaries itself.
#[cfg(feature = "external-data")]
#[cfg_attr(docsrs, doc(cfg(feature = "external-data")))]
pub trait ExternalSource {
  /// Called once before the first `read`
  fn open(&self) -> Result<(), ValueError> {
    Ok(())
  }

  /// Fill `buf` with bytes starting at `offset`; yields
  /// `(bytes_written, more_follows)`
  fn read(&self, buf: &mut [u8], offset: usize) -> Result<(usize, bool), ValueError>;

  /// Called once after the last `read` (or on abort)
  fn close(&self) {}
}

/// Something was wrong with a supplied value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueError;

/// One resource value on its way OUT (Read response, Notify, Send).
///
/// Bytes/string values borrow the producer's storage; values that do
/// not fit in memory at once use an [`ExternalSource`].
#[derive(Clone, Copy)]
pub enum OutValue<'a> {
  /// Signed integer resource
  Int(i64),
  /// Unsigned integer resource
  Uint(u64),
  /// Float resource
  Double(f64),
  /// Boolean resource
  Bool(bool),
  /// Time resource (epoch seconds)
  Time(i64),
  /// Object link resource
  ObjLink(ObjLink),
  /// Opaque resource, fully in memory
  Bytes(&'a [u8]),
  /// String resource, fully in memory
  Str(&'a str),
  /// Opaque resource streamed from a callback
  #[cfg(feature = "external-data")]
  #[cfg_attr(docsrs, doc(cfg(feature = "external-data")))]
  ExternalBytes(&'a dyn ExternalSource),
  /// String resource streamed from a callback
  #[cfg(feature = "external-data")]
  #[cfg_attr(docsrs, doc(cfg(feature = "external-data")))]
  ExternalStr(&'a dyn ExternalSource),
}

impl fmt::Debug for OutValue<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      | OutValue::Int(v) => write!(f, "Int({})", v),
      | OutValue::Uint(v) => write!(f, "Uint({})", v),
      | OutValue::Double(v) => write!(f, "Double({})", v),
      | OutValue::Bool(v) => write!(f, "Bool({})", v),
      | OutValue::Time(v) => write!(f, "Time({})", v),
      | OutValue::ObjLink(v) => write!(f, "ObjLink({})", v),
      | OutValue::Bytes(v) => write!(f, "Bytes(len {})", v.len()),
      | OutValue::Str(v) => write!(f, "Str({:?})", v),
      #[cfg(feature = "external-data")]
      | OutValue::ExternalBytes(_) => write!(f, "ExternalBytes(..)"),
      #[cfg(feature = "external-data")]
      | OutValue::ExternalStr(_) => write!(f, "ExternalStr(..)"),
    }
  }
}

/// One record handed to a payload encoder.
#[derive(Debug, Clone, Copy)]
pub struct OutRecord<'a> {
  /// Where the value lives
  pub path: UriPath,
  /// SenML time, seconds since epoch; only Send/Notify payloads carry
  /// it
  pub timestamp: Option<f64>,
  /// The value
  pub value: OutValue<'a>,
}

impl<'a> OutRecord<'a> {
  /// A record without a timestamp
  pub fn new(path: UriPath, value: OutValue<'a>) -> Self {
    Self { path,
           timestamp: None,
           value }
  }
}

/// One piece of a byte/text string value on its way IN, delivered
/// incrementally when the value spans CoAP blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BytesChunk<'a> {
  /// Offset of this piece within the whole value
  pub offset: usize,
  /// The bytes of this piece
  pub data: &'a [u8],
  /// Total value length when known up front (definite-length wire
  /// forms); `None` until the final piece otherwise
  pub full_length: Option<usize>,
}

impl BytesChunk<'_> {
  /// Whether this piece completes the value
  pub fn is_last(&self) -> bool {
    self.full_length == Some(self.offset + self.data.len())
  }
}

/// A decoded resource value on its way IN (Write, Create).
///
/// Numeric wire values stay as [`newt_cbor::Number`] — whether `25` is
/// an int, uint or double resource is the data model's call, made via
/// the lossless [`Number::as_i64`](newt_cbor::Number::as_i64) /
/// `as_u64` / `as_f64` conversions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InValue<'a> {
  /// A record with no value (composite Read/Observe path lists)
  None,
  /// Numeric value, type-checked by the consumer
  Number(newt_cbor::Number),
  /// Boolean value
  Bool(bool),
  /// Time value (epoch seconds, fractions truncated)
  Time(i64),
  /// Object link value
  ObjLink(ObjLink),
  /// Opaque value piece
  Bytes(BytesChunk<'a>),
  /// String value piece
  Str(BytesChunk<'a>),
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn objlink_string_form() {
    assert_eq!(ObjLink::parse("17:19"),
               Some(ObjLink { oid: 17,
                              iid: 19 }));
    assert_eq!(ObjLink::parse("65535:0"),
               Some(ObjLink { oid: 65535,
                              iid: 0 }));
    for bad in ["", "1", ":", "1:", ":2", "1:2:3", "a:2", "70000:1"] {
      assert_eq!(ObjLink::parse(bad), None, "{:?}", bad);
    }
  }

  #[test]
  fn chunk_completion() {
    let c = BytesChunk { offset: 10,
                         data: b"abc",
                         full_length: Some(13) };
    assert!(c.is_last());
    let c = BytesChunk { offset: 0,
                         data: b"abc",
                         full_length: None };
    assert!(!c.is_last());
  }
}
