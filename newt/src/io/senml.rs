//! SenML+CBOR (content formats 112 & 320).
//!
//! Payloads are an array of records; each record is a map of numeric
//! labels (string labels only for the `"vlo"` objlink extension). The
//! encoder emits the base name once for the request path and relative
//! names after it; the decoder accepts labels in any order and streams
//! oversized byte/text values piece by piece.
//!
//! # Related
//! - [RFC8428#section-6 CBOR Representation](https://datatracker.ietf.org/doc/html/rfc8428#section-6)

use core::fmt::Write;

use newt_cbor::{dec, enc, Chunk, Number, ValueType};

use crate::io::buf::Staging;
use crate::io::cbor::{stage_value, ShortString, ValueStream, OBJLNK_STR_MAX};
use crate::io::{map_cbor, InEntry, InKind, IoError};
use crate::path::{Level, UriPath};
use crate::strbuf::StrBuf;
use crate::value::{BytesChunk, InValue, ObjLink, OutRecord, OutValue};

/// Longest rendered path: `/65534/65534/65534/65534`
pub(crate) const PATH_STR_MAX: usize = 25;

const LABEL_BASE_TIME: i64 = -3;
const LABEL_BASE_NAME: i64 = -2;
const LABEL_NAME: i64 = 0;
const LABEL_VALUE: i64 = 2;
const LABEL_VALUE_STRING: i64 = 3;
const LABEL_VALUE_BOOL: i64 = 4;
const LABEL_TIME: i64 = 6;
const LABEL_VALUE_OPAQUE: i64 = 8;
const LABEL_OBJLNK: &str = "vlo";

fn write_path(out: &mut StrBuf<PATH_STR_MAX>,
              path: &UriPath,
              skip: usize)
              -> Result<(), IoError> {
  if path.len() == skip {
    return Err(IoError::InputArg);
  }
  for id in &path.ids()[skip..] {
    write!(out, "/{}", id).map_err(|_| IoError::InputArg)?;
  }
  Ok(())
}

/// The SenML+CBOR record encoder
#[derive(Debug)]
pub struct Encoder {
  items_left: usize,
  base: UriPath,
  basename_done: bool,
  base_time: Option<f64>,
  encode_time: bool,
}

impl Encoder {
  pub(crate) fn new(base: &UriPath,
                    items: usize,
                    encode_time: bool,
                    staging: &mut Staging)
                    -> Self {
    let n = enc::array_begin(staging.space(), items);
    staging.commit(n);
    Encoder { items_left: items,
              base: *base,
              basename_done: false,
              base_time: None,
              encode_time }
  }

  pub(crate) fn new_entry(&mut self,
                          staging: &mut Staging,
                          record: &OutRecord)
                          -> Result<(), IoError> {
    if staging.remaining != 0 || self.items_left == 0 {
      return Err(IoError::Logic);
    }
    if record.path.outside_base(&self.base) {
      return Err(IoError::InputArg);
    }

    let emit_basename = !self.basename_done && !self.base.is_root();
    // a record at exactly the base path is all base name, no name
    let emit_name = record.path.len() > self.base.len();
    if !emit_name && self.base.is_root() {
      return Err(IoError::InputArg);
    }
    let timestamp = record.timestamp.filter(|_| self.encode_time);
    let emit_base_time = timestamp.is_some() && self.base_time != timestamp;

    let pairs = 1
                + usize::from(emit_name)
                + usize::from(emit_basename)
                + usize::from(emit_base_time);
    let n = enc::map_begin(staging.space(), pairs);
    staging.commit(n);

    if emit_basename {
      let mut basename = StrBuf::new();
      write_path(&mut basename, &self.base, 0)?;
      self.stage_text_pair(staging, LABEL_BASE_NAME, &basename);
      self.basename_done = true;
    }

    if emit_name {
      let mut name = StrBuf::new();
      write_path(&mut name, &record.path, self.base.len())?;
      self.stage_text_pair(staging, LABEL_NAME, &name);
    }

    if let Some(ts) = timestamp.filter(|_| emit_base_time) {
      let mut n = enc::int(staging.space(), LABEL_BASE_TIME);
      n += enc::double(&mut staging.space()[n..], ts);
      staging.commit(n);
      self.base_time = timestamp;
    }

    let n = match record.value {
      | OutValue::Bool(_) => enc::int(staging.space(), LABEL_VALUE_BOOL),
      | OutValue::Str(_) => enc::int(staging.space(), LABEL_VALUE_STRING),
      | OutValue::Bytes(_) => enc::int(staging.space(), LABEL_VALUE_OPAQUE),
      #[cfg(feature = "external-data")]
      | OutValue::ExternalStr(_) => enc::int(staging.space(), LABEL_VALUE_STRING),
      #[cfg(feature = "external-data")]
      | OutValue::ExternalBytes(_) => enc::int(staging.space(), LABEL_VALUE_OPAQUE),
      | OutValue::ObjLink(_) => {
        let mut n = enc::text_begin(staging.space(), LABEL_OBJLNK.len());
        staging.space()[n..n + LABEL_OBJLNK.len()]
               .copy_from_slice(LABEL_OBJLNK.as_bytes());
        n += LABEL_OBJLNK.len();
        n
      },
      | _ => enc::int(staging.space(), LABEL_VALUE),
    };
    staging.commit(n);

    stage_value(staging, &record.value)?;
    self.items_left -= 1;
    Ok(())
  }

  fn stage_text_pair(&self, staging: &mut Staging, label: i64, text: &str) {
    let mut n = enc::int(staging.space(), label);
    n += enc::text_begin(&mut staging.space()[n..], text.len());
    staging.space()[n..n + text.len()].copy_from_slice(text.as_bytes());
    staging.commit(n + text.len());
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Label {
  BaseTime,
  BaseName,
  Name,
  Value,
  ValueString,
  ValueBool,
  Time,
  ValueOpaque,
  ObjLnk,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Cached {
  Nothing,
  Null,
  Number(Number),
  Time(i64),
  Bool(bool),
  ObjLink(ObjLink),
}

/// The SenML+CBOR record decoder
#[derive(Debug)]
pub struct Decoder {
  decoder: dec::Decoder,
  base: UriPath,
  composite: bool,
  entered: bool,
  entry_count: Option<usize>,

  // per-record parse state
  map_entered: bool,
  pairs_remaining: Option<usize>,
  label_ready: bool,
  label: Label,
  has_name: bool,
  has_basename: bool,
  has_value: bool,
  path_processed: bool,
  path: UriPath,
  cached: Cached,
  stream: ValueStream,
  stream_done: bool,
  stream_total: usize,
  final_piece_unnamed: bool,

  name: ShortString<PATH_STR_MAX>,
  basename: ShortString<PATH_STR_MAX>,
  scratch: ShortString<OBJLNK_STR_MAX>,
}

impl Decoder {
  pub(crate) fn new(kind: InKind, base: &UriPath) -> Self {
    let composite = kind == InKind::Composite;
    Decoder { decoder: dec::Decoder::new(),
              base: if composite { UriPath::root() } else { *base },
              composite,
              entered: false,
              entry_count: None,
              map_entered: false,
              pairs_remaining: None,
              label_ready: false,
              label: Label::Value,
              has_name: false,
              has_basename: false,
              has_value: false,
              path_processed: false,
              path: UriPath::root(),
              cached: Cached::Nothing,
              stream: ValueStream::default(),
              stream_done: false,
              stream_total: 0,
              final_piece_unnamed: false,
              name: ShortString::default(),
              basename: ShortString::default(),
              scratch: ShortString::default() }
  }

  fn ensure_entered(&mut self, chunk: &mut Chunk<'_>) -> nb::Result<(), IoError> {
    if !self.entered {
      self.entry_count = self.decoder.enter_array(chunk).map_err(map_cbor)?;
      self.entered = true;
    }
    Ok(())
  }

  pub(crate) fn entry_count(&mut self,
                            chunk: &mut Chunk<'_>)
                            -> nb::Result<Option<usize>, IoError> {
    self.ensure_entered(chunk)?;
    Ok(self.entry_count)
  }

  fn reset_record_state(&mut self) {
    self.map_entered = false;
    self.pairs_remaining = None;
    self.label_ready = false;
    self.has_name = false;
    self.has_basename = false;
    self.has_value = false;
    self.path_processed = false;
    self.cached = Cached::Nothing;
    self.stream = ValueStream::default();
    self.stream_done = false;
    self.stream_total = 0;
    self.final_piece_unnamed = false;
    self.name.clear();
    self.scratch.clear();
  }

  fn pairs_left(&mut self, chunk: &mut Chunk<'_>) -> nb::Result<bool, IoError> {
    match self.pairs_remaining {
      | Some(0) => Ok(false),
      | Some(_) => Ok(true),
      // indefinite map: open until the nesting drops back to the array
      | None => {
        Ok(self.decoder.nesting_level(chunk).map_err(map_cbor)? > 1)
      },
    }
  }

  fn pair_done(&mut self) {
    if let Some(n) = &mut self.pairs_remaining {
      *n -= 1;
    }
    self.label_ready = false;
  }

  fn read_label(&mut self, chunk: &mut Chunk<'_>) -> nb::Result<(), IoError> {
    let ty = self.decoder.peek_type(chunk).map_err(map_cbor)?;
    if ty == ValueType::Text {
      // string labels: only the objlink extension is defined
      self.scratch.read(&mut self.decoder, chunk)?;
      if self.scratch.as_str().map_err(nb::Error::Other)? != LABEL_OBJLNK {
        return Err(nb::Error::Other(IoError::Format));
      }
      self.label = Label::ObjLnk;
      return Ok(());
    }

    let n = self.decoder.number(chunk).map_err(map_cbor)?;
    self.label = match n.as_i64(false)
                       .map_err(|_| nb::Error::Other(IoError::Format))?
    {
      | LABEL_BASE_TIME => Label::BaseTime,
      | LABEL_BASE_NAME => Label::BaseName,
      | LABEL_NAME => Label::Name,
      | LABEL_VALUE => Label::Value,
      | LABEL_VALUE_STRING => Label::ValueString,
      | LABEL_VALUE_BOOL => Label::ValueBool,
      | LABEL_TIME => Label::Time,
      | LABEL_VALUE_OPAQUE => Label::ValueOpaque,
      | _ => return Err(nb::Error::Other(IoError::Format)),
    };
    Ok(())
  }

  fn parse_name(&mut self, chunk: &mut Chunk<'_>) -> nb::Result<(), IoError> {
    if self.has_name {
      return Err(nb::Error::Other(IoError::Format));
    }
    if self.decoder.peek_type(chunk).map_err(map_cbor)? != ValueType::Text {
      return Err(nb::Error::Other(IoError::Format));
    }
    self.name.read(&mut self.decoder, chunk)?;
    self.has_name = true;
    Ok(())
  }

  fn parse_basename(&mut self, chunk: &mut Chunk<'_>) -> nb::Result<(), IoError> {
    if self.has_basename {
      return Err(nb::Error::Other(IoError::Format));
    }
    if self.decoder.peek_type(chunk).map_err(map_cbor)? != ValueType::Text {
      return Err(nb::Error::Other(IoError::Format));
    }
    self.basename.clear();
    self.basename.read(&mut self.decoder, chunk)?;
    self.has_basename = true;
    Ok(())
  }

  // scalar values are cached; byte/text values switch the decoder
  // into streaming and are delivered piece by piece
  fn parse_value(&mut self, chunk: &mut Chunk<'_>) -> nb::Result<(), IoError> {
    if self.composite {
      return Err(nb::Error::Other(IoError::Format));
    }
    if self.has_value {
      return Err(nb::Error::Other(IoError::Format));
    }

    let ty = self.decoder.peek_type(chunk).map_err(map_cbor)?;
    match (ty, self.label) {
      | (ValueType::Null, Label::Value) => {
        self.decoder.null(chunk).map_err(map_cbor)?;
        self.cached = Cached::Null;
        self.has_value = true;
      },
      | (ValueType::Bytes, Label::ValueOpaque)
      | (ValueType::Text, Label::ValueString) => {
        let total = self.decoder.bytes(chunk).map_err(map_cbor)?;
        self.stream = ValueStream::default();
        self.stream_start(ty == ValueType::Text, total);
      },
      | (ValueType::Text, Label::ObjLnk) => {
        self.scratch.clear();
        self.scratch.read(&mut self.decoder, chunk)?;
        let link = ObjLink::parse(self.scratch.as_str().map_err(nb::Error::Other)?)
          .ok_or(nb::Error::Other(IoError::Format))?;
        self.cached = Cached::ObjLink(link);
        self.has_value = true;
      },
      | (ValueType::Bool, Label::ValueBool) => {
        let v = self.decoder.boolean(chunk).map_err(map_cbor)?;
        self.cached = Cached::Bool(v);
        self.has_value = true;
      },
      | (ValueType::Timestamp, Label::Value) => {
        let n = self.decoder.number(chunk).map_err(map_cbor)?;
        let secs = n.as_i64(true)
                    .map_err(|_| nb::Error::Other(IoError::Format))?;
        self.cached = Cached::Time(secs);
        self.has_value = true;
      },
      | (ValueType::Uint | ValueType::NegativeInt | ValueType::Float
         | ValueType::Double,
         Label::Value) => {
        let n = self.decoder.number(chunk).map_err(map_cbor)?;
        self.cached = Cached::Number(n);
        self.has_value = true;
      },
      | _ => return Err(nb::Error::Other(IoError::Format)),
    }
    Ok(())
  }

  fn stream_start(&mut self, text: bool, total: Option<usize>) {
    // mirror the ValueStream bookkeeping extract_value uses
    self.stream = ValueStream::default();
    self.stream.resume(text, total);
  }

  fn record_path(&mut self) -> Result<UriPath, IoError> {
    let mut full = StrBuf::<{ 2 * PATH_STR_MAX }>::new();
    write!(full,
           "{}{}",
           self.basename.as_str()?,
           self.name.as_str()?).map_err(|_| IoError::Format)?;
    let path = UriPath::parse(&full).map_err(|_| IoError::Format)?;
    if path.outside_base(&self.base)
       || (!self.composite && !path.has(Level::Resource))
    {
      return Err(IoError::Format);
    }
    Ok(path)
  }

  pub(crate) fn get_entry<'s>(&'s mut self,
                              chunk: &'s mut Chunk<'_>)
                              -> nb::Result<Option<InEntry<'s>>, IoError> {
    self.ensure_entered(chunk)?;

    if !self.map_entered {
      if self.decoder.finished(chunk).map_err(map_cbor)? {
        return Ok(None);
      }
      if self.decoder.nesting_level(chunk).map_err(map_cbor)? != 1 {
        return Err(nb::Error::Other(IoError::Format));
      }
      self.pairs_remaining = self.decoder.enter_map(chunk).map_err(map_cbor)?;
      self.map_entered = true;
    }

    // a byte/text value in flight takes priority: deliver its pieces
    if self.stream.is_active() {
      return self.deliver_piece(chunk);
    }

    loop {
      if !self.pairs_left(chunk)? {
        break;
      }
      if !self.label_ready {
        self.read_label(chunk)?;
        self.label_ready = true;
      }
      match self.label {
        | Label::Name => self.parse_name(chunk)?,
        | Label::BaseName => self.parse_basename(chunk)?,
        | Label::Value
        | Label::ValueString
        | Label::ValueBool
        | Label::ValueOpaque
        | Label::ObjLnk => {
          self.parse_value(chunk)?;
          if self.stream.is_active() {
            return self.deliver_piece(chunk);
          }
        },
        // times on the way in have no LwM2M meaning
        | Label::BaseTime | Label::Time => {
          return Err(nb::Error::Other(IoError::Format));
        },
      }
      self.pair_done();
    }

    // record complete
    let path = match self.path_processed {
      | true => self.path,
      | false => self.record_path().map_err(nb::Error::Other)?,
    };

    if self.stream_done {
      // the value went out in pieces already; if the name arrived
      // after the last piece, close the record with an empty final
      // piece carrying the path
      let trailing = self.final_piece_unnamed;
      let total = self.stream_total;
      self.reset_record_state();
      if trailing {
        return Ok(Some(InEntry { path: Some(path),
                                 value:
                                   Some(InValue::Bytes(BytesChunk { offset: total,
                                                                    data: &[],
                                                                    full_length:
                                                                      Some(total) })) }));
      }
      return self.get_entry(chunk);
    }

    let value = match self.cached {
      | Cached::Null | Cached::Nothing => None,
      | Cached::Number(n) => Some(InValue::Number(n)),
      | Cached::Time(t) => Some(InValue::Time(t)),
      | Cached::Bool(b) => Some(InValue::Bool(b)),
      | Cached::ObjLink(l) => Some(InValue::ObjLink(l)),
    };
    if value.is_none() && !self.composite && self.cached == Cached::Nothing {
      // plain writes must carry a value
      return Err(nb::Error::Other(IoError::Format));
    }
    self.reset_record_state();
    Ok(Some(InEntry { path: Some(path),
                      value }))
  }

  fn deliver_piece<'s>(&'s mut self,
                       chunk: &'s mut Chunk<'_>)
                       -> nb::Result<Option<InEntry<'s>>, IoError> {
    // settle the path before borrowing the piece, if it can be known
    let value_is_last_pair = self.pairs_remaining == Some(1);
    if !self.path_processed
       && ((self.has_basename && self.has_name) || value_is_last_pair)
    {
      self.path = self.record_path().map_err(nb::Error::Other)?;
      self.path_processed = true;
    }

    let (offset, full, text, finished, piece) =
      self.stream.pull(&mut self.decoder, chunk)?;

    if finished {
      self.has_value = true;
      self.stream_done = true;
      self.stream_total = offset + piece.len();
      self.final_piece_unnamed = !self.path_processed;
      if let Some(n) = &mut self.pairs_remaining {
        *n -= 1;
      }
      self.label_ready = false;
    }

    let bytes = BytesChunk { offset,
                             data: piece,
                             full_length: full };
    Ok(Some(InEntry { path: self.path_processed.then_some(self.path),
                      value: Some(if text {
                                    InValue::Str(bytes)
                                  } else {
                                    InValue::Bytes(bytes)
                                  }) }))
  }
}
