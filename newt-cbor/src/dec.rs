//! Pull decoder, re-entrant on arbitrary chunk boundaries.
//!
//! The decoder never stores a reference to its input. Each read takes
//! the current payload chunk as a [`Chunk`] handle; when the chunk runs
//! out mid-item, the call returns [`nb::Error::WouldBlock`] without
//! side effects, and the caller retries the same read with the next
//! chunk (e.g. the next CoAP block) once it arrives.
//!
//! A 9-byte read-ahead buffer absorbs items split across chunk
//! boundaries, so the decoder may consume a few bytes beyond the item
//! it reports; byte-string bodies are still served zero-copy from the
//! caller's chunk wherever possible.

use tinyvec::ArrayVec;

use crate::{BREAK, EXT_LENGTH_INDEFINITE, MAJOR_ARRAY, MAJOR_BYTES, MAJOR_MAP,
            MAJOR_NEGATIVE, MAJOR_SIMPLE, MAJOR_TAG, MAJOR_TEXT, MAJOR_UINT,
            MAX_NEST_DEPTH, TAG_EPOCH_TIME, VALUE_FALSE, VALUE_NULL,
            VALUE_TRUE};

/// Decoder errors. Running out of input is not an error — it is
/// [`nb::Error::WouldBlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
  /// The payload violates RFC 7049 or exceeds a decoder limit; the
  /// decoder is poisoned and reports `Format` from then on
  Format,
  /// The requested read does not fit the decoder's current position
  /// (wrong type order of calls, or reading past a clean end of
  /// payload)
  Logic,
}

/// One payload chunk being fed to a [`Decoder`].
///
/// Keep handing the *same* `Chunk` to decoder calls until one returns
/// [`nb::Error::WouldBlock`] — at that point the chunk is fully
/// consumed and the next call takes a `Chunk` wrapping the next
/// payload. `last` marks the final chunk of the whole document; if that
/// is unknowable up front, feed everything with `last = false` and
/// finish with [`Chunk::final_empty`].
#[derive(Debug)]
pub struct Chunk<'a> {
  data: &'a [u8],
  pos: usize,
  last: bool,
}

impl<'a> Chunk<'a> {
  /// Wrap a payload chunk; `last` marks the end of the document
  pub fn new(data: &'a [u8], last: bool) -> Self {
    Self { data, pos: 0, last }
  }

  /// The zero-length closing chunk
  pub fn final_empty() -> Chunk<'static> {
    Chunk { data: &[],
            pos: 0,
            last: true }
  }

  /// Whether this is the final chunk of the document
  pub fn is_last(&self) -> bool {
    self.last
  }

  /// Consume and return everything not yet consumed; lets non-CBOR
  /// codecs (plaintext, opaque, TLV) share the chunk-feeding contract
  pub fn take_remaining(&mut self) -> &'a [u8] {
    let out = &self.data[self.pos..];
    self.pos = self.data.len();
    out
  }

  /// Consume and return up to `n` unconsumed bytes
  pub fn take_up_to(&mut self, n: usize) -> &'a [u8] {
    let n = n.min(self.remaining());
    let out = &self.data[self.pos..self.pos + n];
    self.pos += n;
    out
  }

  fn remaining(&self) -> usize {
    self.data.len() - self.pos
  }
}

/// The type of the value the decoder is positioned on.
///
/// Peeking does not consume the item; typed reads do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
  /// Major type 0
  Uint,
  /// Major type 1
  NegativeInt,
  /// Major type 2
  Bytes,
  /// Major type 3
  Text,
  /// Major type 4
  Array,
  /// Major type 5
  Map,
  /// Single-precision (or, when enabled, half-precision) float
  Float,
  /// Double-precision float (also a pending decimal fraction)
  Double,
  /// `true` / `false`
  Bool,
  /// `null`
  Null,
  /// A tag 0/1 time value; reading it yields the underlying number
  Timestamp,
}

/// A number as it appeared on the wire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
  /// Major type 0
  Uint(u64),
  /// Major type 1, already folded to `-1 - n`
  Int(i64),
  /// 16/32-bit float
  Float(f32),
  /// 64-bit float or decimal fraction
  Double(f64),
}

impl Number {
  /// Lossless conversion to `i64`.
  ///
  /// Fractional floats fail with [`Error::Format`] unless
  /// `allow_fractions` (used for time values, which LwM2M rounds
  /// toward zero).
  pub fn as_i64(&self, allow_fractions: bool) -> Result<i64, Error> {
    match *self {
      | Number::Uint(v) if v <= i64::MAX as u64 => Ok(v as i64),
      | Number::Uint(_) => Err(Error::Format),
      | Number::Int(v) => Ok(v),
      | Number::Float(f) => float_to_i64(f.into(), allow_fractions),
      | Number::Double(f) => float_to_i64(f, allow_fractions),
    }
  }

  /// Lossless conversion to `u64`
  pub fn as_u64(&self) -> Result<u64, Error> {
    match *self {
      | Number::Uint(v) => Ok(v),
      | Number::Int(_) => Err(Error::Format),
      | Number::Float(f) => float_to_u64(f.into()),
      | Number::Double(f) => float_to_u64(f),
    }
  }

  /// Conversion to `f64` (may round for 64-bit integers)
  pub fn as_f64(&self) -> f64 {
    match *self {
      | Number::Uint(v) => v as f64,
      | Number::Int(v) => v as f64,
      | Number::Float(f) => f.into(),
      | Number::Double(f) => f,
    }
  }
}

fn float_to_i64(f: f64, allow_fractions: bool) -> Result<i64, Error> {
  const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;
  if f.is_nan() || !(-TWO_POW_63..TWO_POW_63).contains(&f) {
    return Err(Error::Format);
  }
  let truncated = f as i64;
  if !allow_fractions && truncated as f64 != f {
    return Err(Error::Format);
  }
  Ok(truncated)
}

fn float_to_u64(f: f64) -> Result<u64, Error> {
  const TWO_POW_64: f64 = 18_446_744_073_709_551_616.0;
  if f.is_nan() || !(0.0..TWO_POW_64).contains(&f) {
    return Err(Error::Format);
  }
  let truncated = f as u64;
  if truncated as f64 != f {
    return Err(Error::Format);
  }
  Ok(truncated)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
  Ok,
  Finished,
  Poisoned,
}

#[derive(Debug, Clone, Copy, Default)]
struct Nested {
  major: u8,
  // None = indefinite
  all: Option<usize>,
  parsed: usize,
  odd: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct BytesState {
  available: usize,
  indefinite: bool,
  initial_nesting: usize,
}

#[cfg(feature = "string-time")]
const TIME_STRING_MAX: usize = 40;

#[derive(Debug)]
enum Subparser {
  None,
  Bytes(BytesState),
  Text(BytesState),
  EpochTime,
  #[cfg(feature = "string-time")]
  StringTime {
    bs: BytesState,
    buf: [u8; TIME_STRING_MAX],
    len: usize,
    initialized: bool,
  },
  #[cfg(feature = "decimal-fractions")]
  DecimalFraction {
    array_level: usize,
    entered: bool,
    exponent: Option<f64>,
    mantissa: Option<f64>,
  },
}

// where a served byte-string piece lives; the borrow is materialized
// only at the public API boundary
enum Served {
  Pre { off: usize, len: usize },
  Input { pos: usize, len: usize },
  Empty,
}

/// The pull decoder. See the [module docs](self) for the feeding
/// contract.
#[derive(Debug)]
pub struct Decoder {
  state: State,
  needs_preprocessing: bool,
  after_tag: bool,
  initial_byte: u8,
  value_type: ValueType,
  pre: [u8; 9],
  pre_len: usize,
  pre_off: usize,
  nest: ArrayVec<[Nested; MAX_NEST_DEPTH]>,
  sub: Subparser,
}

impl Default for Decoder {
  fn default() -> Self {
    Self::new()
  }
}

impl Decoder {
  /// A decoder positioned before the first item
  pub fn new() -> Self {
    Self { state: State::Ok,
           needs_preprocessing: true,
           after_tag: false,
           initial_byte: 0,
           value_type: ValueType::Null,
           pre: [0; 9],
           pre_len: 0,
           pre_off: 0,
           nest: ArrayVec::new(),
           sub: Subparser::None }
  }

  fn pre_avail(&self) -> usize {
    self.pre_len - self.pre_off
  }

  fn poison(&mut self) -> nb::Error<Error> {
    self.state = State::Poisoned;
    nb::Error::Other(Error::Format)
  }

  // top up the read-ahead buffer to at least `min` bytes; Ok even when
  // short if the input has truly ended (callers detect that)
  fn fill_pre(&mut self, chunk: &mut Chunk, min: usize) -> nb::Result<(), Error> {
    if self.pre_avail() >= min {
      return Ok(());
    }
    if self.pre_off > 0 {
      self.pre.copy_within(self.pre_off..self.pre_len, 0);
      self.pre_len -= self.pre_off;
      self.pre_off = 0;
    }
    let take = (self.pre.len() - self.pre_len).min(chunk.remaining());
    if take > 0 {
      self.pre[self.pre_len..self.pre_len + take]
          .copy_from_slice(&chunk.data[chunk.pos..chunk.pos + take]);
      chunk.pos += take;
      self.pre_len += take;
    }
    if self.pre_avail() < min && !chunk.last {
      return Err(nb::Error::WouldBlock);
    }
    Ok(())
  }

  fn additional_info(&self) -> u8 {
    self.initial_byte & 0x1F
  }

  fn ext_len(&self) -> usize {
    match self.additional_info() {
      | 24 => 1,
      | 25 => 2,
      | 26 => 4,
      | 27 => 8,
      | _ => 0,
    }
  }

  // the integer argument of the current item
  fn parse_arg(&mut self, chunk: &mut Chunk) -> nb::Result<u64, Error> {
    let ext = self.ext_len();
    if ext == 0 {
      let info = self.additional_info();
      if info >= 24 {
        return Err(self.poison());
      }
      return Ok(u64::from(info));
    }
    self.fill_pre(chunk, ext)?;
    if self.pre_avail() < ext {
      return Err(self.poison());
    }
    let mut value = 0u64;
    for i in 0..ext {
      value = value << 8 | u64::from(self.pre[self.pre_off + i]);
    }
    self.pre_off += ext;
    Ok(value)
  }

  fn consume_current(&mut self) {
    self.needs_preprocessing = true;
    self.after_tag = false;
  }

  // an unknown tag: skip its argument and keep scanning
  fn skip_tag_arg(&mut self) {
    let ext = self.ext_len();
    if ext > 0 {
      if self.pre_off + ext > self.pre_len {
        self.state = State::Poisoned;
      } else {
        self.pre_off += ext;
      }
    }
  }

  fn classify_simple(&mut self) {
    match self.additional_info() {
      | VALUE_FALSE | VALUE_TRUE => self.value_type = ValueType::Bool,
      | VALUE_NULL => self.value_type = ValueType::Null,
      | 26 => self.value_type = ValueType::Float,
      | 27 => self.value_type = ValueType::Double,
      #[cfg(feature = "half-float")]
      | 25 => self.value_type = ValueType::Float,
      // undefined, reserved & unassigned simple values
      | _ => self.state = State::Poisoned,
    }
  }

  fn classify_tag(&mut self) -> TagAction {
    let info = self.additional_info();
    #[cfg(feature = "string-time")]
    if u64::from(info) == crate::TAG_STRING_TIME {
      return TagAction::Keep(ValueType::Timestamp);
    }
    #[cfg(feature = "decimal-fractions")]
    if u64::from(info) == crate::TAG_DECIMAL_FRACTION {
      return TagAction::Keep(ValueType::Double);
    }
    if u64::from(info) == TAG_EPOCH_TIME {
      TagAction::Keep(ValueType::Timestamp)
    } else {
      TagAction::Skip
    }
  }

  // move to the next item, resolving breaks, ends of definite frames,
  // and tags; after this, `value_type` describes the next value
  fn preprocess(&mut self, chunk: &mut Chunk) -> nb::Result<(), Error> {
    while self.state == State::Ok {
      while let Some(top) = self.nest.last() {
        match top.all {
          | Some(all) if top.parsed == all => {
            self.nest.pop();
          },
          | _ => break,
        }
      }

      // a tag argument can be up to 8 bytes, read ahead enough to skip
      // one in a single pass
      self.fill_pre(chunk, 9)?;
      if self.pre_avail() == 0 {
        if self.after_tag || !self.nest.is_empty() {
          // tags must be followed by data; structures must be closed
          self.state = State::Poisoned;
        } else {
          self.state = State::Finished;
        }
        return Ok(());
      }

      let byte = self.pre[self.pre_off];
      self.pre_off += 1;

      if byte == BREAK {
        match self.nest.last() {
          | Some(top) if top.all.is_none()
                         && (top.major != MAJOR_MAP || !top.odd) =>
          {
            self.nest.pop();
          },
          | _ => self.state = State::Poisoned,
        }
        continue;
      }

      self.initial_byte = byte;
      match byte >> 5 {
        | MAJOR_UINT => self.value_type = ValueType::Uint,
        | MAJOR_NEGATIVE => self.value_type = ValueType::NegativeInt,
        | MAJOR_BYTES => self.value_type = ValueType::Bytes,
        | MAJOR_TEXT => self.value_type = ValueType::Text,
        | MAJOR_ARRAY => self.value_type = ValueType::Array,
        | MAJOR_MAP => self.value_type = ValueType::Map,
        | MAJOR_SIMPLE => self.classify_simple(),
        | _ => match self.classify_tag() {
          | TagAction::Keep(ty) => {
            if !matches!(self.sub, Subparser::None) {
              self.state = State::Poisoned;
              return Ok(());
            }
            self.value_type = ty;
          },
          | TagAction::Skip => {
            self.skip_tag_arg();
            self.after_tag = true;
            continue;
          },
        },
      }
      self.needs_preprocessing = false;
      break;
    }

    if self.state == State::Poisoned {
      return Ok(());
    }

    if self.initial_byte >> 5 != MAJOR_TAG {
      if let Some(top) = self.nest.last_mut() {
        match top.all {
          | None => top.odd = !top.odd,
          | Some(_) => top.parsed += 1,
        }
      }
    }
    Ok(())
  }

  fn ensure_value(&mut self, chunk: &mut Chunk) -> nb::Result<(), Error> {
    if self.state != State::Ok || !self.needs_preprocessing {
      return Ok(());
    }
    self.preprocess(chunk)
  }

  // Ok / clean-end / poisoned, after making sure a verdict exists
  fn check_readable(&mut self, chunk: &mut Chunk) -> nb::Result<(), Error> {
    self.ensure_value(chunk)?;
    match self.state {
      | State::Ok => Ok(()),
      | State::Finished => Err(nb::Error::Other(Error::Logic)),
      | State::Poisoned => Err(nb::Error::Other(Error::Format)),
    }
  }

  /// Whether the whole document has been cleanly consumed.
  ///
  /// [`Error::Format`] once poisoned; `WouldBlock` when a verdict
  /// needs more input.
  pub fn finished(&mut self, chunk: &mut Chunk) -> nb::Result<bool, Error> {
    self.ensure_value(chunk)?;
    match self.state {
      | State::Ok => Ok(false),
      | State::Finished => Ok(true),
      | State::Poisoned => Err(nb::Error::Other(Error::Format)),
    }
  }

  /// The type of the next value, without consuming it
  pub fn peek_type(&mut self, chunk: &mut Chunk) -> nb::Result<ValueType, Error> {
    match self.sub {
      | Subparser::None => {
        self.check_readable(chunk)?;
        Ok(self.value_type)
      },
      | Subparser::Bytes(_) => Ok(ValueType::Bytes),
      | Subparser::Text(_) => Ok(ValueType::Text),
      | Subparser::EpochTime => Ok(ValueType::Timestamp),
      #[cfg(feature = "string-time")]
      | Subparser::StringTime { .. } => Ok(ValueType::Timestamp),
      #[cfg(feature = "decimal-fractions")]
      | Subparser::DecimalFraction { .. } => Ok(ValueType::Double),
    }
  }

  /// Consume a `null`
  pub fn null(&mut self, chunk: &mut Chunk) -> nb::Result<(), Error> {
    self.check_readable(chunk)?;
    if !matches!(self.sub, Subparser::None) || self.value_type != ValueType::Null {
      return Err(nb::Error::Other(Error::Format));
    }
    self.consume_current();
    Ok(())
  }

  /// Consume a boolean
  pub fn boolean(&mut self, chunk: &mut Chunk) -> nb::Result<bool, Error> {
    self.check_readable(chunk)?;
    if !matches!(self.sub, Subparser::None) || self.value_type != ValueType::Bool {
      return Err(nb::Error::Other(Error::Format));
    }
    let value = self.additional_info() == VALUE_TRUE;
    self.consume_current();
    Ok(value)
  }

  /// Consume a numeric value (integer, float, tagged time value, or
  /// decimal fraction). The result reflects the underlying wire type.
  pub fn number(&mut self, chunk: &mut Chunk) -> nb::Result<Number, Error> {
    self.check_readable(chunk)?;
    match self.sub {
      | Subparser::None if self.value_type != ValueType::Timestamp => {
        self.simple_number(chunk)
      },
      | Subparser::None | Subparser::EpochTime => self.timestamp(chunk),
      #[cfg(feature = "string-time")]
      | Subparser::StringTime { .. } => self.timestamp(chunk),
      #[cfg(feature = "decimal-fractions")]
      | Subparser::DecimalFraction { .. } => {
        self.decimal_fraction(chunk).map(Number::Double)
      },
      | _ => Err(nb::Error::Other(Error::Logic)),
    }
  }

  fn simple_number(&mut self, chunk: &mut Chunk) -> nb::Result<Number, Error> {
    match self.value_type {
      | ValueType::Uint => {
        let v = self.parse_arg(chunk)?;
        self.consume_current();
        Ok(Number::Uint(v))
      },
      | ValueType::NegativeInt => {
        let v = self.parse_arg(chunk)?;
        if v > i64::MAX as u64 {
          return Err(self.poison());
        }
        self.consume_current();
        Ok(Number::Int(-(v as i64) - 1))
      },
      | ValueType::Float => self.read_float(chunk).map(Number::Float),
      | ValueType::Double => {
        #[cfg(feature = "decimal-fractions")]
        if self.initial_byte >> 5 == MAJOR_TAG {
          return self.decimal_fraction(chunk).map(Number::Double);
        }
        self.read_f64(chunk).map(Number::Double)
      },
      | _ => Err(nb::Error::Other(Error::Format)),
    }
  }

  fn read_float(&mut self, chunk: &mut Chunk) -> nb::Result<f32, Error> {
    #[cfg(feature = "half-float")]
    if self.additional_info() == 25 {
      self.fill_pre(chunk, 2)?;
      if self.pre_avail() < 2 {
        return Err(self.poison());
      }
      let half =
        u16::from_be_bytes([self.pre[self.pre_off], self.pre[self.pre_off + 1]]);
      self.pre_off += 2;
      self.consume_current();
      return Ok(decode_half_float(half));
    }

    self.fill_pre(chunk, 4)?;
    if self.pre_avail() < 4 {
      return Err(self.poison());
    }
    let mut bits = 0u32;
    for i in 0..4 {
      bits = bits << 8 | u32::from(self.pre[self.pre_off + i]);
    }
    self.pre_off += 4;
    self.consume_current();
    Ok(f32::from_bits(bits))
  }

  fn read_f64(&mut self, chunk: &mut Chunk) -> nb::Result<f64, Error> {
    self.fill_pre(chunk, 8)?;
    if self.pre_avail() < 8 {
      return Err(self.poison());
    }
    let mut bits = 0u64;
    for i in 0..8 {
      bits = bits << 8 | u64::from(self.pre[self.pre_off + i]);
    }
    self.pre_off += 8;
    self.consume_current();
    Ok(f64::from_bits(bits))
  }

  fn timestamp(&mut self, chunk: &mut Chunk) -> nb::Result<Number, Error> {
    if matches!(self.sub, Subparser::None) {
      #[cfg(feature = "string-time")]
      if u64::from(self.additional_info()) == crate::TAG_STRING_TIME {
        self.sub = Subparser::StringTime { bs: BytesState::default(),
                                           buf: [0; TIME_STRING_MAX],
                                           len: 0,
                                           initialized: false };
        self.needs_preprocessing = true;
        self.after_tag = true;
      }
      if matches!(self.sub, Subparser::None) {
        self.sub = Subparser::EpochTime;
        self.needs_preprocessing = true;
        self.after_tag = true;
      }
    }

    match self.sub {
      | Subparser::EpochTime => {
        self.check_readable(chunk)?;
        let n = self.simple_number(chunk)?;
        self.sub = Subparser::None;
        Ok(n)
      },
      #[cfg(feature = "string-time")]
      | Subparser::StringTime { .. } => self.string_time(chunk),
      | _ => Err(nb::Error::Other(Error::Logic)),
    }
  }

  #[cfg(feature = "string-time")]
  fn string_time(&mut self, chunk: &mut Chunk) -> nb::Result<Number, Error> {
    if let Subparser::StringTime { initialized: false, .. } = self.sub {
      self.init_bytes_state(chunk)?;
      if self.initial_byte >> 5 != MAJOR_TEXT {
        return Err(self.poison());
      }
      if let Subparser::StringTime { initialized, .. } = &mut self.sub {
        *initialized = true;
      }
    }

    loop {
      let (served, finished) = match self.get_some_inner(chunk) {
        | Ok(r) => r,
        | Err(e) => return Err(e),
      };
      let (src_off, n) = match served {
        | Served::Pre { off, len } => (PieceSrc::Pre(off), len),
        | Served::Input { pos, len } => (PieceSrc::Input(pos), len),
        | Served::Empty => (PieceSrc::Input(0), 0),
      };
      if n > 0 {
        // buffer the whole (short) time string before parsing
        let piece_fits = match &mut self.sub {
          | Subparser::StringTime { buf, len, .. } if *len + n < TIME_STRING_MAX => {
            match src_off {
              | PieceSrc::Input(pos) => {
                buf[*len..*len + n].copy_from_slice(&chunk.data[pos..pos + n])
              },
              | PieceSrc::Pre(off) => {
                let pre = self.pre;
                buf[*len..*len + n].copy_from_slice(&pre[off..off + n])
              },
            }
            *len += n;
            true
          },
          | _ => false,
        };
        if !piece_fits {
          return Err(self.poison());
        }
      }
      if finished {
        break;
      }
    }

    let number = match &self.sub {
      | Subparser::StringTime { buf, len, .. } => parse_time_string(&buf[..*len]),
      | _ => Err(Error::Logic),
    };
    self.sub = Subparser::None;
    number.map_err(|e| {
            self.state = State::Poisoned;
            nb::Error::Other(e)
          })
  }

  #[cfg(feature = "decimal-fractions")]
  fn fraction_component(&mut self, chunk: &mut Chunk) -> nb::Result<f64, Error> {
    self.check_readable(chunk)?;
    let level = match &self.sub {
      | Subparser::DecimalFraction { array_level, .. } => *array_level,
      | _ => return Err(nb::Error::Other(Error::Logic)),
    };
    if self.nest.len() != level
       || !matches!(self.value_type, ValueType::Uint | ValueType::NegativeInt)
    {
      return Err(self.poison());
    }
    let negative = self.value_type == ValueType::NegativeInt;
    let raw = self.parse_arg(chunk)?;
    self.consume_current();
    let value = raw as f64;
    Ok(if negative { -value - 1.0 } else { value })
  }

  #[cfg(feature = "decimal-fractions")]
  fn decimal_fraction(&mut self, chunk: &mut Chunk) -> nb::Result<f64, Error> {
    if matches!(self.sub, Subparser::None) {
      let level = self.nest.len();
      self.sub = Subparser::DecimalFraction { array_level: level + 1,
                                              entered: false,
                                              exponent: None,
                                              mantissa: None };
      self.needs_preprocessing = true;
      self.after_tag = true;
    }

    let entered = match &self.sub {
      | Subparser::DecimalFraction { entered, .. } => *entered,
      | _ => return Err(nb::Error::Other(Error::Format)),
    };
    if !entered {
      self.check_readable(chunk)?;
      if self.value_type != ValueType::Array {
        return Err(self.poison());
      }
      self.push_nest(chunk)?;
      self.consume_current();
      if let Subparser::DecimalFraction { entered, .. } = &mut self.sub {
        *entered = true;
      }
    }

    if matches!(&self.sub, Subparser::DecimalFraction { exponent: None, .. }) {
      let e = self.fraction_component(chunk)?;
      if let Subparser::DecimalFraction { exponent, .. } = &mut self.sub {
        *exponent = Some(e);
      }
    }
    if matches!(&self.sub, Subparser::DecimalFraction { mantissa: None, .. }) {
      let m = self.fraction_component(chunk)?;
      if let Subparser::DecimalFraction { mantissa, .. } = &mut self.sub {
        *mantissa = Some(m);
      }
    }

    // the array must hold exactly the two components
    self.ensure_value(chunk)?;
    let level = match &self.sub {
      | Subparser::DecimalFraction { array_level, .. } => *array_level,
      | _ => return Err(nb::Error::Other(Error::Format)),
    };
    if self.state == State::Poisoned
       || (self.state == State::Ok && self.nest.len() == level)
    {
      return Err(self.poison());
    }

    let value = match &self.sub {
      | Subparser::DecimalFraction { exponent: Some(e),
                                     mantissa: Some(m),
                                     .. } => m * pow10(*e as i32),
      | _ => return Err(nb::Error::Other(Error::Logic)),
    };
    self.sub = Subparser::None;
    Ok(value)
  }

  fn push_nest(&mut self, chunk: &mut Chunk) -> nb::Result<(), Error> {
    if self.nest.len() == MAX_NEST_DEPTH {
      return Err(self.poison());
    }
    let major = self.initial_byte >> 5;
    let indefinite = self.additional_info() == EXT_LENGTH_INDEFINITE;

    let all = match (major, indefinite) {
      | (_, true) => None,
      | (MAJOR_MAP, false) => {
        let pairs = self.parse_arg(chunk)?;
        if pairs > (usize::MAX / 2) as u64 {
          return Err(self.poison());
        }
        // a map holds (key, value) pairs: twice the entries
        Some(pairs as usize * 2)
      },
      | (_, false) => {
        let items = self.parse_arg(chunk)?;
        if items > (usize::MAX / 2) as u64 {
          return Err(self.poison());
        }
        Some(items as usize)
      },
    };

    self.nest.push(Nested { major,
                            all,
                            parsed: 0,
                            odd: false });
    Ok(())
  }

  /// Enter an array, yielding its element count (`None` = indefinite,
  /// track the end via [`Decoder::nesting_level`])
  pub fn enter_array(&mut self, chunk: &mut Chunk) -> nb::Result<Option<usize>, Error> {
    self.check_readable(chunk)?;
    if !matches!(self.sub, Subparser::None) || self.value_type != ValueType::Array {
      return Err(nb::Error::Other(Error::Format));
    }
    self.push_nest(chunk)?;
    self.consume_current();
    Ok(self.nest.last().and_then(|top| top.all))
  }

  /// Enter a map, yielding its pair count (`None` = indefinite)
  pub fn enter_map(&mut self, chunk: &mut Chunk) -> nb::Result<Option<usize>, Error> {
    self.check_readable(chunk)?;
    if !matches!(self.sub, Subparser::None) || self.value_type != ValueType::Map {
      return Err(nb::Error::Other(Error::Format));
    }
    self.push_nest(chunk)?;
    self.consume_current();
    Ok(self.nest.last().and_then(|top| top.all.map(|n| n / 2)))
  }

  /// How many arrays/maps the decoder is currently inside. Drops as the
  /// last element of a structure is consumed; 0 after an error.
  pub fn nesting_level(&mut self, chunk: &mut Chunk) -> nb::Result<usize, Error> {
    self.ensure_value(chunk)?;
    if self.state != State::Ok {
      return Ok(0);
    }
    match &self.sub {
      | Subparser::Bytes(bs) | Subparser::Text(bs) if bs.indefinite => {
        Ok(bs.initial_nesting - 1)
      },
      #[cfg(feature = "string-time")]
      | Subparser::StringTime { bs, initialized: true, .. } if bs.indefinite => {
        Ok(bs.initial_nesting - 1)
      },
      #[cfg(feature = "decimal-fractions")]
      | Subparser::DecimalFraction { array_level, .. } => Ok(array_level - 1),
      | _ => Ok(self.nest.len()),
    }
  }

  fn init_bytes_state(&mut self, chunk: &mut Chunk) -> nb::Result<(), Error> {
    self.check_readable(chunk)?;
    if !matches!(self.value_type, ValueType::Bytes | ValueType::Text) {
      return Err(nb::Error::Other(Error::Format));
    }

    let indefinite = self.additional_info() == EXT_LENGTH_INDEFINITE;
    let available = if indefinite {
      self.push_nest(chunk)?;
      self.consume_current();
      0
    } else {
      let n = self.parse_arg(chunk)?;
      if n > (usize::MAX / 2) as u64 {
        return Err(self.poison());
      }
      n as usize
    };

    let bs = BytesState { available,
                          indefinite,
                          initial_nesting: self.nest.len() };
    match &mut self.sub {
      #[cfg(feature = "string-time")]
      | Subparser::StringTime { bs: slot, .. } => *slot = bs,
      | slot => {
        *slot = if self.value_type == ValueType::Text {
          Subparser::Text(bs)
        } else {
          Subparser::Bytes(bs)
        }
      },
    }
    Ok(())
  }

  /// Prepare to consume a byte or text string, yielding its total
  /// length (`None` = indefinite). Follow with [`Decoder::bytes_get_some`]
  /// until it reports the final piece.
  pub fn bytes(&mut self, chunk: &mut Chunk) -> nb::Result<Option<usize>, Error> {
    if !matches!(self.sub, Subparser::None) {
      return Err(nb::Error::Other(Error::Format));
    }
    self.init_bytes_state(chunk)?;
    Ok(match &self.sub {
         | Subparser::Bytes(bs) | Subparser::Text(bs) if !bs.indefinite => {
           Some(bs.available)
         },
         | _ => None,
       })
  }

  fn bytes_state_mut(&mut self) -> Option<&mut BytesState> {
    match &mut self.sub {
      | Subparser::Bytes(bs) | Subparser::Text(bs) => Some(bs),
      #[cfg(feature = "string-time")]
      | Subparser::StringTime { bs, .. } => Some(bs),
      | _ => None,
    }
  }

  // inside an indefinite string: position on the next definite
  // sub-chunk, or detect the closing break
  fn next_string_piece(&mut self, chunk: &mut Chunk) -> nb::Result<bool, Error> {
    self.ensure_value(chunk)?;
    let initial_nesting = match self.bytes_state_mut() {
      | Some(bs) => bs.initial_nesting,
      | None => return Err(nb::Error::Other(Error::Logic)),
    };
    if initial_nesting == self.nest.len() {
      if self.state != State::Ok
         || !matches!(self.value_type, ValueType::Bytes | ValueType::Text)
      {
        return Err(self.poison());
      }
      let n = self.parse_arg(chunk)?;
      match self.bytes_state_mut() {
        | Some(bs) => bs.available = n as usize,
        | None => return Err(nb::Error::Other(Error::Logic)),
      }
      Ok(false)
    } else {
      // the break was consumed and the string frame popped
      Ok(true)
    }
  }

  fn get_some_inner(&mut self, chunk: &mut Chunk) -> nb::Result<(Served, bool), Error> {
    let (available, indefinite) = match self.bytes_state_mut() {
      | Some(bs) => (bs.available, bs.indefinite),
      | None => return Err(nb::Error::Other(Error::Logic)),
    };
    if self.state == State::Poisoned {
      return Err(nb::Error::Other(Error::Format));
    }

    if self.state == State::Ok && indefinite && available == 0 {
      if self.next_string_piece(chunk)? {
        self.sub = Subparser::None;
        return Ok((Served::Empty, true));
      }
    }

    let available = self.bytes_state_mut()
                        .map(|bs| bs.available)
                        .unwrap_or(0);

    let served;
    let take;
    let prebuffered = self.pre_avail();
    if prebuffered > 0 && chunk.pos < prebuffered {
      // bytes were read ahead from an earlier chunk: serve them
      take = prebuffered.min(available);
      served = Served::Pre { off: self.pre_off,
                             len: take };
      self.pre_off += take;
    } else {
      if prebuffered > 0 {
        // everything read ahead came from this chunk: rewind and
        // serve zero-copy
        self.pre_len = self.pre_off;
        chunk.pos -= prebuffered;
      }
      take = chunk.remaining().min(available);
      served = Served::Input { pos: chunk.pos,
                               len: take };
      chunk.pos += take;
    }

    let finished = match self.bytes_state_mut() {
      | Some(bs) => {
        bs.available -= take;
        bs.available == 0 && !bs.indefinite
      },
      | None => return Err(nb::Error::Other(Error::Logic)),
    };

    let exhausted = self.bytes_state_mut()
                        .map(|bs| bs.available == 0)
                        .unwrap_or(true);
    if exhausted {
      self.consume_current();
      if finished {
        self.sub = Subparser::None;
      }
      Ok((served, finished))
    } else if take == 0 {
      if chunk.last {
        Err(self.poison())
      } else {
        Err(nb::Error::WouldBlock)
      }
    } else {
      Ok((served, false))
    }
  }

  /// Consume the next piece of the current byte/text string.
  ///
  /// Yields `(piece, finished)`; the final piece may be empty. Pieces
  /// point into the caller's chunk or the read-ahead buffer — copy
  /// them out before the next decoder call.
  pub fn bytes_get_some<'s>(&'s mut self,
                            chunk: &'s mut Chunk<'_>)
                            -> nb::Result<(&'s [u8], bool), Error> {
    let (served, finished) = loop {
      match self.get_some_inner(chunk)? {
        // empty non-final pieces happen inside indefinite strings;
        // they carry no information
        | (Served::Empty, false) => continue,
        | (Served::Pre { len: 0, .. }, false)
        | (Served::Input { len: 0, .. }, false) => continue,
        | done => break done,
      }
    };

    match served {
      | Served::Pre { off, len } => Ok((&self.pre[off..off + len], finished)),
      | Served::Input { pos, len } => Ok((&chunk.data[pos..pos + len], finished)),
      | Served::Empty => Ok((&[], finished)),
    }
  }
}

enum TagAction {
  Keep(ValueType),
  Skip,
}

#[cfg(feature = "string-time")]
enum PieceSrc {
  Pre(usize),
  Input(usize),
}

#[cfg(feature = "half-float")]
fn exp2f(n: i32) -> f32 {
  // n is always within the normal range for half-float exponents
  f32::from_bits(((n + 127) as u32) << 23)
}

#[cfg(feature = "half-float")]
fn decode_half_float(half: u16) -> f32 {
  // adapted from RFC 7049 appendix D
  let exponent = (half >> 10 & 0x1F) as i32;
  let mantissa = (half & 0x3FF) as f32;
  let value = if exponent == 0 {
    mantissa * exp2f(-24)
  } else if exponent != 31 {
    (mantissa + 1024.0) * exp2f(exponent - 25)
  } else if mantissa == 0.0 {
    f32::INFINITY
  } else {
    f32::NAN
  };
  if half & 0x8000 != 0 {
    -value
  } else {
    value
  }
}

#[cfg(feature = "decimal-fractions")]
fn pow10(exp: i32) -> f64 {
  let mut value = 1.0f64;
  if exp >= 0 {
    for _ in 0..exp.min(400) {
      value *= 10.0;
    }
  } else {
    for _ in 0..(-exp).min(400) {
      value /= 10.0;
    }
  }
  value
}

#[cfg(feature = "string-time")]
fn parse_time_string(s: &[u8]) -> Result<Number, Error> {
  // strict subset of ISO 8601: YYYY-MM-DDThh:mm:ss[.fff...][Z|±hh:mm]
  fn digit(b: u8) -> Result<i64, Error> {
    if b.is_ascii_digit() {
      Ok(i64::from(b - b'0'))
    } else {
      Err(Error::Format)
    }
  }
  fn two(s: &[u8], at: usize) -> Result<i64, Error> {
    Ok(digit(*s.get(at).ok_or(Error::Format)?)? * 10
       + digit(*s.get(at + 1).ok_or(Error::Format)?)?)
  }

  if s.len() < 19 || s[4] != b'-' || s[7] != b'-' {
    return Err(Error::Format);
  }
  let year = two(s, 0)? * 100 + two(s, 2)?;
  let month = two(s, 5)?;
  if !(1..=12).contains(&month) || !matches!(s[10], b'T' | b't') {
    return Err(Error::Format);
  }
  let day = two(s, 8)?;
  if !(1..=31).contains(&day) || s[13] != b':' || s[16] != b':' {
    return Err(Error::Format);
  }
  let hour = two(s, 11)?;
  let minute = two(s, 14)?;
  let second = two(s, 17)?;
  if hour > 23 || minute > 59 || second > 60 {
    return Err(Error::Format);
  }

  let mut timestamp =
    days_from_civil(year, month, day) * 86400 + hour * 3600 + minute * 60 + second;

  let mut index = 19;
  let mut nanosecond: u64 = 0;
  if s.get(index) == Some(&b'.') {
    index += 1;
    let mut digits = 0;
    while digits < 9 && s.get(index).map(u8::is_ascii_digit).unwrap_or(false) {
      nanosecond = nanosecond * 10 + (s[index] - b'0') as u64;
      index += 1;
      digits += 1;
    }
    while digits < 9 {
      nanosecond *= 10;
      digits += 1;
    }
  }

  match s.get(index) {
    | Some(b'Z') | Some(b'z') => index += 1,
    | Some(b'+') | Some(b'-') => {
      let hours = two(s, index + 1)?;
      if s.get(index + 3) != Some(&b':') {
        return Err(Error::Format);
      }
      let minutes = two(s, index + 4)?;
      if minutes > 59 {
        return Err(Error::Format);
      }
      let offset = hours * 3600 + minutes * 60;
      timestamp -= if s[index] == b'-' { -offset } else { offset };
      index += 6;
    },
    | _ => return Err(Error::Format),
  }
  if index != s.len() {
    return Err(Error::Format);
  }

  if nanosecond != 0 {
    Ok(Number::Double(timestamp as f64 + nanosecond as f64 / 1.0e9))
  } else if timestamp >= 0 {
    Ok(Number::Uint(timestamp as u64))
  } else {
    Ok(Number::Int(timestamp))
  }
}

#[cfg(feature = "string-time")]
fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
  // proleptic Gregorian calendar, days since 1970-01-01
  let y = if month <= 2 { year - 1 } else { year };
  let era = y.div_euclid(400);
  let yoe = y - era * 400;
  let mp = (month + 9) % 12;
  let doy = (153 * mp + 2) / 5 + day - 1;
  let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
  era * 146097 + doe - 719468
}
