//! The plain CBOR codec (content format 60): exactly one value, no
//! path information on the wire — the request URI is the path.
//!
//! Also home to the value-level helpers every CBOR-based codec shares:
//! [`stage_value`] on the way out, [`extract_value`] and
//! [`ShortString`] on the way in.

use newt_cbor::{dec, enc, Chunk, ValueType};

use crate::io::buf::Staging;
use crate::io::{map_cbor, InEntry, IoError};
use crate::path::{Level, UriPath};
use crate::value::{BytesChunk, InValue, OutValue};

/// Largest `"65534:65534"` objlink rendering
pub(crate) const OBJLNK_STR_MAX: usize = 11;

/// Stage one value's header (and scalar content); yields the length
/// of the body that follows, if any.
///
/// External sources have no length up front: they are staged as an
/// indefinite-length string header and a placeholder body length of 1,
/// resolved when the source reports its end.
pub(crate) fn stage_value(staging: &mut Staging,
                          value: &OutValue)
                          -> Result<Option<usize>, IoError> {
  use core::fmt::Write;

  let n = match *value {
    | OutValue::Int(v) => enc::int(staging.space(), v),
    | OutValue::Uint(v) => enc::uint(staging.space(), v),
    | OutValue::Double(v) => enc::double(staging.space(), v),
    | OutValue::Bool(v) => enc::boolean(staging.space(), v),
    | OutValue::Time(v) => {
      let mut n = enc::tag(staging.space(), newt_cbor::TAG_EPOCH_TIME);
      n += enc::int(&mut staging.space()[n..], v);
      n
    },
    | OutValue::ObjLink(link) => {
      let mut text = crate::strbuf::StrBuf::<OBJLNK_STR_MAX>::new();
      write!(text, "{}", link).map_err(|_| IoError::InputArg)?;
      let mut n = enc::text_begin(staging.space(), text.len());
      staging.space()[n..n + text.len()].copy_from_slice(text.as_str().as_bytes());
      n += text.len();
      n
    },
    | OutValue::Bytes(data) => {
      let n = enc::bytes_begin(staging.space(), data.len());
      staging.commit(n);
      staging.finish_record(Some(data.len()));
      return Ok(Some(data.len()));
    },
    | OutValue::Str(data) => {
      let n = enc::text_begin(staging.space(), data.len());
      staging.commit(n);
      staging.finish_record(Some(data.len()));
      return Ok(Some(data.len()));
    },
    #[cfg(feature = "external-data")]
    | OutValue::ExternalBytes(_) => {
      let n = enc::indefinite_bytes_begin(staging.space());
      staging.commit(n);
      staging.finish_record(Some(1));
      return Ok(Some(1));
    },
    #[cfg(feature = "external-data")]
    | OutValue::ExternalStr(_) => {
      let n = enc::indefinite_text_begin(staging.space());
      staging.commit(n);
      staging.finish_record(Some(1));
      return Ok(Some(1));
    },
  };
  staging.commit(n);
  staging.finish_record(None);
  Ok(None)
}

/// Encode a single value as the whole payload (content format 60)
pub(crate) fn encode_value(staging: &mut Staging, value: &OutValue) -> Result<(), IoError> {
  stage_value(staging, value).map(|_| ())
}

/// Incremental state of a byte/text string value being delivered in
/// pieces.
#[derive(Debug, Default)]
pub(crate) struct ValueStream {
  active: bool,
  text: bool,
  offset: usize,
  last_len: usize,
  full: Option<usize>,
}

impl ValueStream {
  pub(crate) fn is_active(&self) -> bool {
    self.active
  }

  /// Arm the stream for a byte/text string whose header was just
  /// consumed
  pub(crate) fn resume(&mut self, text: bool, total: Option<usize>) {
    self.active = true;
    self.text = text;
    self.offset = 0;
    self.last_len = 0;
    self.full = total;
  }

  /// Pull the next piece; yields
  /// `(offset, full_length, is_text, finished, piece)`
  pub(crate) fn pull<'s>(&mut self,
                         decoder: &'s mut dec::Decoder,
                         chunk: &'s mut Chunk<'_>)
                         -> nb::Result<(usize, Option<usize>, bool, bool, &'s [u8]),
                                       IoError> {
    self.offset += self.last_len;
    let (piece, finished) = decoder.bytes_get_some(chunk).map_err(map_cbor)?;
    self.last_len = piece.len();
    if finished {
      self.active = false;
      self.full = Some(self.offset + piece.len());
    }
    Ok((self.offset, self.full, self.text, finished, piece))
  }
}

/// Read the value the decoder is positioned on (or continue a string
/// value already in flight).
///
/// Numbers come out raw; time tags come out as seconds; text values
/// come out as [`InValue::Str`] — whether a particular string is an
/// objlink is the consumer's interpretation, exactly like every other
/// type narrowing.
pub(crate) fn extract_value<'s>(decoder: &'s mut dec::Decoder,
                                chunk: &'s mut Chunk<'_>,
                                stream: &mut ValueStream)
                                -> nb::Result<InValue<'s>, IoError> {
  if !stream.active {
    let ty = decoder.peek_type(chunk).map_err(map_cbor)?;
    match ty {
      | ValueType::Null => {
        decoder.null(chunk).map_err(map_cbor)?;
        return Ok(InValue::None);
      },
      | ValueType::Bool => {
        let v = decoder.boolean(chunk).map_err(map_cbor)?;
        return Ok(InValue::Bool(v));
      },
      | ValueType::Uint
      | ValueType::NegativeInt
      | ValueType::Float
      | ValueType::Double => {
        let n = decoder.number(chunk).map_err(map_cbor)?;
        return Ok(InValue::Number(n));
      },
      | ValueType::Timestamp => {
        let n = decoder.number(chunk).map_err(map_cbor)?;
        let seconds = n.as_i64(true).map_err(|_| nb::Error::Other(IoError::Format))?;
        return Ok(InValue::Time(seconds));
      },
      | ValueType::Bytes | ValueType::Text => {
        let total = decoder.bytes(chunk).map_err(map_cbor)?;
        stream.active = true;
        stream.text = ty == ValueType::Text;
        stream.offset = 0;
        stream.last_len = 0;
        stream.full = total;
      },
      | ValueType::Array | ValueType::Map => {
        return Err(nb::Error::Other(IoError::Format));
      },
    }
  }

  stream.offset += stream.last_len;
  let (piece, finished) = decoder.bytes_get_some(chunk).map_err(map_cbor)?;
  stream.last_len = piece.len();
  if finished {
    stream.active = false;
    stream.full = Some(stream.offset + piece.len());
  }

  let piece = BytesChunk { offset: stream.offset,
                           data: piece,
                           full_length: stream.full };
  Ok(if stream.text {
       InValue::Str(piece)
     } else {
       InValue::Bytes(piece)
     })
}

/// A short text string (a SenML label, name or objlink) buffered
/// whole before use; re-entrant across payload chunks.
#[derive(Debug)]
pub(crate) struct ShortString<const N: usize> {
  buf: [u8; N],
  len: usize,
  active: bool,
}

impl<const N: usize> Default for ShortString<N> {
  fn default() -> Self {
    Self { buf: [0; N],
           len: 0,
           active: false }
  }
}

impl<const N: usize> ShortString<N> {
  /// Consume a whole text string into this buffer;
  /// [`IoError::Format`] if it does not fit.
  pub(crate) fn read(&mut self,
                     decoder: &mut dec::Decoder,
                     chunk: &mut Chunk<'_>)
                     -> nb::Result<(), IoError> {
    if !self.active {
      decoder.bytes(chunk).map_err(map_cbor)?;
      self.active = true;
      self.len = 0;
    }
    loop {
      let (piece, finished) = decoder.bytes_get_some(chunk).map_err(map_cbor)?;
      if self.len + piece.len() > N {
        return Err(nb::Error::Other(IoError::Format));
      }
      self.buf[self.len..self.len + piece.len()].copy_from_slice(piece);
      self.len += piece.len();
      if finished {
        break;
      }
    }
    self.active = false;
    Ok(())
  }

  pub(crate) fn as_str(&self) -> Result<&str, IoError> {
    core::str::from_utf8(&self.buf[..self.len]).map_err(|_| IoError::Format)
  }

  pub(crate) fn clear(&mut self) {
    self.len = 0;
    self.active = false;
  }
}

/// The single-value decoder for content format 60
#[derive(Debug)]
pub struct Decoder {
  decoder: dec::Decoder,
  path: UriPath,
  stream: ValueStream,
  entry_parsed: bool,
}

impl Decoder {
  pub(crate) fn new(base: &UriPath) -> Result<Self, IoError> {
    if !base.has(Level::Resource) {
      return Err(IoError::Format);
    }
    Ok(Self { decoder: dec::Decoder::new(),
              path: *base,
              stream: ValueStream::default(),
              entry_parsed: false })
  }

  pub(crate) fn get_entry<'s>(&'s mut self,
                              chunk: &'s mut Chunk<'_>)
                              -> nb::Result<Option<InEntry<'s>>, IoError> {
    if !self.stream.is_active() {
      let finished = self.decoder.finished(chunk).map_err(map_cbor)?;
      match (finished, self.entry_parsed) {
        | (true, true) => return Ok(None),
        | (true, false) => return Err(nb::Error::Other(IoError::Format)),
        // a second value after the first is not a valid payload
        | (false, true) => return Err(nb::Error::Other(IoError::Format)),
        | (false, false) => {},
      }
    }

    let path = self.path;
    let value = extract_value(&mut self.decoder, chunk, &mut self.stream)?;
    if !self.stream.is_active() {
      self.entry_parsed = true;
    }
    Ok(Some(InEntry { path: Some(path),
                      value: Some(value) }))
  }
}

#[cfg(test)]
mod tests {
  use newt_cbor::Number;

  use super::*;

  #[test]
  fn single_value_round_trip() {
    let mut staging = Staging::default();
    encode_value(&mut staging, &OutValue::Int(-1000)).unwrap();
    let mut out = [0u8; 16];
    let n = staging.drain_staged(&mut out);
    assert_eq!(&out[..n], [0x39, 0x03, 0xE7]);

    let mut dec = Decoder::new(&UriPath::resource(3, 0, 9)).unwrap();
    let mut chunk = Chunk::new(&out[..n], true);
    let entry = dec.get_entry(&mut chunk).unwrap().unwrap();
    assert_eq!(entry.path, Some(UriPath::resource(3, 0, 9)));
    assert_eq!(entry.value, Some(InValue::Number(Number::Int(-1000))));
    assert_eq!(dec.get_entry(&mut chunk).unwrap(), None);
  }

  #[test]
  fn time_value_is_tagged() {
    let mut staging = Staging::default();
    encode_value(&mut staging, &OutValue::Time(1_000_000)).unwrap();
    let mut out = [0u8; 16];
    let n = staging.drain_staged(&mut out);
    assert_eq!(&out[..n], [0xC1, 0x1A, 0x00, 0x0F, 0x42, 0x40]);

    let mut dec = Decoder::new(&UriPath::resource(3, 0, 13)).unwrap();
    let mut chunk = Chunk::new(&out[..n], true);
    let entry = dec.get_entry(&mut chunk).unwrap().unwrap();
    assert_eq!(entry.value, Some(InValue::Time(1_000_000)));
  }

  #[test]
  fn trailing_value_rejected() {
    let payload = [0x01, 0x02];
    let mut dec = Decoder::new(&UriPath::resource(3, 0, 9)).unwrap();
    let mut chunk = Chunk::new(&payload, true);
    dec.get_entry(&mut chunk).unwrap();
    assert_eq!(dec.get_entry(&mut chunk),
               Err(nb::Error::Other(IoError::Format)));
  }

  #[test]
  fn requires_resource_path() {
    assert!(Decoder::new(&UriPath::instance(3, 0)).is_err());
    assert!(Decoder::new(&UriPath::resource(3, 0, 1)).is_ok());
  }

  #[test]
  fn objlink_renders_as_text() {
    use crate::value::ObjLink;

    let mut staging = Staging::default();
    encode_value(&mut staging,
                 &OutValue::ObjLink(ObjLink { oid: 17,
                                              iid: 19 })).unwrap();
    let mut out = [0u8; 16];
    let n = staging.drain_staged(&mut out);
    assert_eq!(&out[..n], [0x65, b'1', b'7', b':', b'1', b'9']);
  }
}
