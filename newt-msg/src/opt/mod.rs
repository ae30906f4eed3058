use core::str::{from_utf8, Utf8Error};

use newt_cursor::Cursor;
use tinyvec::ArrayVec;

use crate::error::OptionsError;
use crate::{MAX_OPTIONS, OPTS_BUFFER_LEN, PAYLOAD_MARKER};

/// Block1 / Block2 option values
pub mod block;

/// Content-Format & Accept option values
pub mod content_format;

/// Well-known option numbers
pub mod num;

/// The Observe option
pub mod observe;

/// A CoAP option number.
///
/// Identifies which option is being set (e.g. Uri-Path is 11).
/// LwM2M's vocabulary lives in [`num`].
///
/// # Related
/// - [RFC7252#section-5.4.6 Option Numbers](https://datatracker.ietf.org/doc/html/rfc7252#section-5.4.6)
#[derive(Copy, Clone, Hash, PartialEq, PartialOrd, Eq, Ord, Debug, Default)]
pub struct OptNumber(pub u16);

#[derive(Copy, Clone, Debug, Default)]
struct Entry {
  number: u16,
  // value location within Options.buf
  off: u16,
  len: u16,
}

/// An ordered, capacity-bounded table of CoAP options.
///
/// The table owns a contiguous byte buffer holding the options in their
/// final delta-encoded wire form; [`Options::as_bytes`] is the exact
/// byte sequence between the message header and the payload marker.
/// Inserting an option with a smaller number than one already present
/// re-encodes the stream so it stays canonical.
///
/// Repeated options keep their insertion order among equal numbers.
///
/// ```
/// use newt_msg::{OptNumber, Options};
///
/// let mut sorted = Options::new();
/// sorted.add_str(OptNumber(11), "rd").unwrap();
/// sorted.add_u16(OptNumber(12), 112).unwrap();
///
/// let mut shuffled = Options::new();
/// shuffled.add_u16(OptNumber(12), 112).unwrap();
/// shuffled.add_str(OptNumber(11), "rd").unwrap();
///
/// assert_eq!(sorted.as_bytes(), shuffled.as_bytes());
/// ```
#[derive(Clone, Debug, Default)]
pub struct Options {
  entries: ArrayVec<[Entry; MAX_OPTIONS]>,
  buf: ArrayVec<[u8; OPTS_BUFFER_LEN]>,
}

impl PartialEq for Options {
  fn eq(&self, other: &Self) -> bool {
    // the buffer is canonical, so it is the identity
    self.buf == other.buf
  }
}

impl Eq for Options {}

fn ext_nibble(val: u16) -> (u8, ArrayVec<[u8; 2]>) {
  let mut ext = ArrayVec::new();
  match val {
    | n if n >= 269 => {
      ext.extend_from_slice(&(n - 269).to_be_bytes());
      (14, ext)
    },
    | n if n >= 13 => {
      ext.push((n - 13) as u8);
      (13, ext)
    },
    | n => (n as u8, ext),
  }
}

fn parse_ext_nibble(head: u8, cursor: &mut Cursor) -> Result<u16, OptionsError> {
  match head {
    | 13 => cursor.next()
                  .map(|b| u16::from(b) + 13)
                  .ok_or(OptionsError::Format),
    | 14 => cursor.take_u16()
                  .and_then(|n| n.checked_add(269))
                  .ok_or(OptionsError::Format),
    | 15 => Err(OptionsError::Format),
    | n => Ok(u16::from(n)),
  }
}

fn encoded_len(delta: u16, value_len: usize) -> usize {
  let nib_len = |v: usize| match v {
    | n if n >= 269 => 2,
    | n if n >= 13 => 1,
    | _ => 0,
  };
  1 + nib_len(delta as usize) + nib_len(value_len) + value_len
}

// appends one delta-encoded option, yielding the offset of its value bytes
fn encode_one(buf: &mut ArrayVec<[u8; OPTS_BUFFER_LEN]>,
              delta: u16,
              value: &[u8])
              -> Result<u16, OptionsError> {
  if buf.len() + encoded_len(delta, value.len()) > OPTS_BUFFER_LEN
     || value.len() > u16::MAX as usize
  {
    return Err(OptionsError::Buffer);
  }

  let (delta_nib, delta_ext) = ext_nibble(delta);
  let (len_nib, len_ext) = ext_nibble(value.len() as u16);

  buf.push(delta_nib << 4 | len_nib);
  buf.extend_from_slice(&delta_ext);
  buf.extend_from_slice(&len_ext);
  let off = buf.len() as u16;
  buf.extend_from_slice(value);
  Ok(off)
}

impl Options {
  /// An empty option table
  pub fn new() -> Self {
    Default::default()
  }

  /// The canonical delta-encoded wire form of the whole table
  pub fn as_bytes(&self) -> &[u8] {
    &self.buf
  }

  /// Number of options stored
  pub fn count(&self) -> usize {
    self.entries.len()
  }

  /// Whether the table holds no options
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Insert an option value, keeping the stream canonical.
  ///
  /// Errors with [`OptionsError::Capacity`] when [`MAX_OPTIONS`] options
  /// are already present, and [`OptionsError::Buffer`] when the encoded
  /// stream would not fit [`OPTS_BUFFER_LEN`].
  pub fn add_bytes(&mut self, n: OptNumber, value: &[u8]) -> Result<(), OptionsError> {
    if self.entries.len() == MAX_OPTIONS {
      return Err(OptionsError::Capacity);
    }

    let idx = self.entries
                  .iter()
                  .position(|e| e.number > n.0)
                  .unwrap_or(self.entries.len());

    if idx == self.entries.len() {
      // in-order insert: append to the stream
      let prev = self.entries.last().map(|e| e.number).unwrap_or(0);
      let off = encode_one(&mut self.buf, n.0 - prev, value)?;
      self.entries.push(Entry { number: n.0,
                                off,
                                len: value.len() as u16 });
      Ok(())
    } else {
      self.splice(idx, n, value)
    }
  }

  /// [`Options::add_bytes`] with a string value
  pub fn add_str(&mut self, n: OptNumber, value: &str) -> Result<(), OptionsError> {
    self.add_bytes(n, value.as_bytes())
  }

  /// Insert a zero-length option
  pub fn add_empty(&mut self, n: OptNumber) -> Result<(), OptionsError> {
    self.add_bytes(n, &[])
  }

  /// Insert an integer option; big-endian with leading zero bytes
  /// stripped, zero encoding as the empty string.
  pub fn add_u16(&mut self, n: OptNumber, value: u16) -> Result<(), OptionsError> {
    self.add_uint(n, &value.to_be_bytes())
  }

  /// [`Options::add_u16`] for u32
  pub fn add_u32(&mut self, n: OptNumber, value: u32) -> Result<(), OptionsError> {
    self.add_uint(n, &value.to_be_bytes())
  }

  /// [`Options::add_u16`] for u64
  pub fn add_u64(&mut self, n: OptNumber, value: u64) -> Result<(), OptionsError> {
    self.add_uint(n, &value.to_be_bytes())
  }

  fn add_uint(&mut self, n: OptNumber, be: &[u8]) -> Result<(), OptionsError> {
    let first_nonzero = be.iter().position(|b| *b != 0).unwrap_or(be.len());
    self.add_bytes(n, &be[first_nonzero..])
  }

  // out-of-order insert: rebuild the stream with the new option where
  // it belongs, then swap the new buffer in
  fn splice(&mut self, idx: usize, n: OptNumber, value: &[u8]) -> Result<(), OptionsError> {
    let mut buf = ArrayVec::<[u8; OPTS_BUFFER_LEN]>::new();
    let mut entries = ArrayVec::<[Entry; MAX_OPTIONS]>::new();
    let mut prev = 0u16;

    for i in 0..=self.entries.len() {
      if i == idx {
        let off = encode_one(&mut buf, n.0 - prev, value)?;
        entries.push(Entry { number: n.0,
                             off,
                             len: value.len() as u16 });
        prev = n.0;
      }
      if i == self.entries.len() {
        break;
      }
      let e = self.entries[i];
      let old_value = &self.buf[e.off as usize..(e.off + e.len) as usize];
      let off = encode_one(&mut buf, e.number - prev, old_value)?;
      entries.push(Entry { number: e.number,
                           off,
                           len: e.len });
      prev = e.number;
    }

    self.buf = buf;
    self.entries = entries;
    Ok(())
  }

  /// Parse a delta-encoded option stream, stopping at the payload
  /// marker (not consumed) or the end of input.
  ///
  /// The running option number rejects any overflow past 65535 and
  /// reserved nibble values with [`OptionsError::Format`].
  pub fn decode(cursor: &mut Cursor) -> Result<Self, OptionsError> {
    let mut opts = Options::new();
    let mut number = 0u16;

    loop {
      match cursor.peek() {
        | None | Some(PAYLOAD_MARKER) => return Ok(opts),
        | Some(byte1) => {
          cursor.next();

          let delta = parse_ext_nibble(byte1 >> 4, cursor)?;
          let len = parse_ext_nibble(byte1 & 0x0F, cursor)? as usize;
          let value = cursor.take_exact(len).ok_or(OptionsError::Format)?;

          number = number.checked_add(delta).ok_or(OptionsError::Format)?;

          if opts.entries.len() == MAX_OPTIONS {
            return Err(OptionsError::Capacity);
          }
          let off = encode_one(&mut opts.buf, delta, value)?;
          opts.entries.push(Entry { number,
                                    off,
                                    len: len as u16 });
        },
      }
    }
  }

  /// Yield the next option with number `n` at or after `*iter`,
  /// advancing the cursor past it; `None` once exhausted.
  ///
  /// Mirrors the iterate-style getters the rest of the stack uses to
  /// walk repeatable options (Uri-Path, Uri-Query, Location-Path).
  pub fn iter_get(&self, n: OptNumber, iter: &mut usize) -> Option<&[u8]> {
    while *iter < self.entries.len() {
      let e = self.entries[*iter];
      *iter += 1;
      if e.number == n.0 {
        return Some(&self.buf[e.off as usize..(e.off + e.len) as usize]);
      }
      if e.number > n.0 {
        break;
      }
    }
    None
  }

  /// The first value for option `n`, if any
  pub fn get_first(&self, n: OptNumber) -> Option<&[u8]> {
    let mut it = 0;
    self.iter_get(n, &mut it)
  }

  /// All values for option `n`, in stored order
  pub fn get_all(&self, n: OptNumber) -> impl Iterator<Item = &[u8]> + '_ {
    self.entries
        .iter()
        .filter(move |e| e.number == n.0)
        .map(move |e| &self.buf[e.off as usize..(e.off + e.len) as usize])
  }

  /// Every `(number, value)` pair, in stream order
  pub fn iter(&self) -> impl Iterator<Item = (OptNumber, &[u8])> + '_ {
    self.entries
        .iter()
        .map(move |e| {
          (OptNumber(e.number), &self.buf[e.off as usize..(e.off + e.len) as usize])
        })
  }

  /// Whether option `n` is present (with any value, including empty)
  pub fn get_empty(&self, n: OptNumber) -> bool {
    self.get_first(n).is_some()
  }

  /// The first value of `n` as a big-endian integer of at most 2 bytes
  pub fn get_u16(&self, n: OptNumber) -> Result<Option<u16>, OptionsError> {
    self.get_uint(n, 2).map(|v| v.map(|v| v as u16))
  }

  /// The first value of `n` as a big-endian integer of at most 4 bytes
  pub fn get_u32(&self, n: OptNumber) -> Result<Option<u32>, OptionsError> {
    self.get_uint(n, 4).map(|v| v.map(|v| v as u32))
  }

  /// The first value of `n` as a big-endian integer of at most 8 bytes
  pub fn get_u64(&self, n: OptNumber) -> Result<Option<u64>, OptionsError> {
    self.get_uint(n, 8)
  }

  fn get_uint(&self, n: OptNumber, max_len: usize) -> Result<Option<u64>, OptionsError> {
    match self.get_first(n) {
      | None => Ok(None),
      | Some(bytes) if bytes.len() > max_len => Err(OptionsError::Format),
      | Some(bytes) => {
        Ok(Some(bytes.iter().fold(0u64, |acc, b| acc << 8 | u64::from(*b))))
      },
    }
  }

  /// The first value of `n` as UTF-8 text
  pub fn get_str(&self, n: OptNumber) -> Result<Option<&str>, Utf8Error> {
    self.get_first(n).map(from_utf8).transpose()
  }
}
