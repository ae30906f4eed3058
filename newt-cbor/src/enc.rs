//! Stateless item-header encoder.
//!
//! Every function writes one item's header into the front of `buf` and
//! returns the byte count written. The caller must reserve
//! [`MAX_ITEM_HEADER_LEN`](crate::MAX_ITEM_HEADER_LEN) bytes of
//! headroom; all staging buffers in the `newt` io layer are sized
//! accordingly, so a short `buf` here is an internal bug and panics.
//!
//! For byte/text strings only the type+length header is written; the
//! body is appended by the caller (possibly over several CoAP blocks).

use crate::{BREAK, EXT_LENGTH_INDEFINITE, MAJOR_ARRAY, MAJOR_BYTES, MAJOR_MAP,
            MAJOR_NEGATIVE, MAJOR_SIMPLE, MAJOR_TAG, MAJOR_TEXT, MAJOR_UINT,
            VALUE_FALSE, VALUE_NULL, VALUE_TRUE};

fn header(buf: &mut [u8], major: u8, value: u64) -> usize {
  let ty = major << 5;
  match value {
    | v if v < 24 => {
      buf[0] = ty | v as u8;
      1
    },
    | v if v <= u64::from(u8::MAX) => {
      buf[0] = ty | 24;
      buf[1] = v as u8;
      2
    },
    | v if v <= u64::from(u16::MAX) => {
      buf[0] = ty | 25;
      buf[1..3].copy_from_slice(&(v as u16).to_be_bytes());
      3
    },
    | v if v <= u64::from(u32::MAX) => {
      buf[0] = ty | 26;
      buf[1..5].copy_from_slice(&(v as u32).to_be_bytes());
      5
    },
    | v => {
      buf[0] = ty | 27;
      buf[1..9].copy_from_slice(&v.to_be_bytes());
      9
    },
  }
}

/// Encode an unsigned integer
pub fn uint(buf: &mut [u8], value: u64) -> usize {
  header(buf, MAJOR_UINT, value)
}

/// Encode a signed integer (negative values use major type 1)
pub fn int(buf: &mut [u8], value: i64) -> usize {
  if value >= 0 {
    uint(buf, value as u64)
  } else {
    header(buf, MAJOR_NEGATIVE, !(value as u64))
  }
}

/// Encode a boolean
pub fn boolean(buf: &mut [u8], value: bool) -> usize {
  buf[0] = MAJOR_SIMPLE << 5 | if value { VALUE_TRUE } else { VALUE_FALSE };
  1
}

/// Encode the simple value `null`
pub fn null(buf: &mut [u8]) -> usize {
  buf[0] = MAJOR_SIMPLE << 5 | VALUE_NULL;
  1
}

/// Encode a single-precision float (always 5 bytes)
pub fn float(buf: &mut [u8], value: f32) -> usize {
  buf[0] = MAJOR_SIMPLE << 5 | 26;
  buf[1..5].copy_from_slice(&value.to_bits().to_be_bytes());
  5
}

/// Encode a double, shrinking to single precision when the value
/// round-trips losslessly (the shortest form servers accept everywhere;
/// half precision is never emitted)
pub fn double(buf: &mut [u8], value: f64) -> usize {
  let single = value as f32;
  if f64::from(single) == value || value.is_nan() {
    float(buf, single)
  } else {
    buf[0] = MAJOR_SIMPLE << 5 | 27;
    buf[1..9].copy_from_slice(&value.to_bits().to_be_bytes());
    9
  }
}

/// Encode a tag header; the tagged item follows
pub fn tag(buf: &mut [u8], value: u64) -> usize {
  header(buf, MAJOR_TAG, value)
}

/// Begin a text string of `len` bytes; the caller appends the body
pub fn text_begin(buf: &mut [u8], len: usize) -> usize {
  header(buf, MAJOR_TEXT, len as u64)
}

/// Begin a byte string of `len` bytes; the caller appends the body
pub fn bytes_begin(buf: &mut [u8], len: usize) -> usize {
  header(buf, MAJOR_BYTES, len as u64)
}

/// Begin a definite-length array of `items` elements
pub fn array_begin(buf: &mut [u8], items: usize) -> usize {
  header(buf, MAJOR_ARRAY, items as u64)
}

/// Begin a definite-length map of `pairs` key/value pairs
pub fn map_begin(buf: &mut [u8], pairs: usize) -> usize {
  header(buf, MAJOR_MAP, pairs as u64)
}

/// Begin an indefinite-length map, closed by [`indefinite_end`]
pub fn indefinite_map_begin(buf: &mut [u8]) -> usize {
  buf[0] = MAJOR_MAP << 5 | EXT_LENGTH_INDEFINITE;
  1
}

/// Begin an indefinite-length array, closed by [`indefinite_end`]
pub fn indefinite_array_begin(buf: &mut [u8]) -> usize {
  buf[0] = MAJOR_ARRAY << 5 | EXT_LENGTH_INDEFINITE;
  1
}

/// Begin an indefinite-length byte string: a sequence of definite
/// chunks closed by [`indefinite_end`]
pub fn indefinite_bytes_begin(buf: &mut [u8]) -> usize {
  buf[0] = MAJOR_BYTES << 5 | EXT_LENGTH_INDEFINITE;
  1
}

/// Begin an indefinite-length text string
pub fn indefinite_text_begin(buf: &mut [u8]) -> usize {
  buf[0] = MAJOR_TEXT << 5 | EXT_LENGTH_INDEFINITE;
  1
}

/// The `0xFF` break closing any indefinite-length structure
pub fn indefinite_end(buf: &mut [u8]) -> usize {
  buf[0] = BREAK;
  1
}

#[cfg(test)]
mod tests {
  use super::*;

  fn enc(f: impl Fn(&mut [u8]) -> usize) -> Vec<u8> {
    let mut buf = [0u8; 9];
    let n = f(&mut buf);
    buf[..n].to_vec()
  }

  #[test]
  fn uint_at_every_width_boundary() {
    assert_eq!(enc(|b| uint(b, 0)), [0x00]);
    assert_eq!(enc(|b| uint(b, 23)), [0x17]);
    assert_eq!(enc(|b| uint(b, 24)), [0x18, 24]);
    assert_eq!(enc(|b| uint(b, 255)), [0x18, 0xFF]);
    assert_eq!(enc(|b| uint(b, 256)), [0x19, 0x01, 0x00]);
    assert_eq!(enc(|b| uint(b, 65535)), [0x19, 0xFF, 0xFF]);
    assert_eq!(enc(|b| uint(b, 65536)), [0x1A, 0x00, 0x01, 0x00, 0x00]);
    assert_eq!(enc(|b| uint(b, u64::from(u32::MAX))),
               [0x1A, 0xFF, 0xFF, 0xFF, 0xFF]);
    assert_eq!(enc(|b| uint(b, u64::from(u32::MAX) + 1)),
               [0x1B, 0, 0, 0, 1, 0, 0, 0, 0]);
    assert_eq!(enc(|b| uint(b, u64::MAX)),
               [0x1B, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
  }

  #[test]
  fn negative_ints() {
    assert_eq!(enc(|b| int(b, -1)), [0x20]);
    assert_eq!(enc(|b| int(b, -24)), [0x37]);
    assert_eq!(enc(|b| int(b, -25)), [0x38, 24]);
    assert_eq!(enc(|b| int(b, -1000)), [0x39, 0x03, 0xE7]);
    assert_eq!(enc(|b| int(b, 25)), [0x18, 0x19]);
    assert_eq!(enc(|b| int(b, i64::MIN)),
               [0x3B, 0x7F, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
  }

  #[test]
  fn simple_values() {
    assert_eq!(enc(|b| boolean(b, false)), [0xF4]);
    assert_eq!(enc(|b| boolean(b, true)), [0xF5]);
    assert_eq!(enc(null), [0xF6]);
  }

  #[test]
  fn doubles_shrink_when_lossless() {
    assert_eq!(enc(|b| double(b, 100000.0)),
               [0xFA, 0x47, 0xC3, 0x50, 0x00]);
    assert_eq!(enc(|b| double(b, 1.5)), [0xFA, 0x3F, 0xC0, 0x00, 0x00]);
    assert_eq!(enc(|b| double(b, -4.1)),
               [0xFB, 0xC0, 0x10, 0x66, 0x66, 0x66, 0x66, 0x66, 0x66]);
  }

  #[test]
  fn strings_and_structures() {
    assert_eq!(enc(|b| text_begin(b, 3)), [0x63]);
    assert_eq!(enc(|b| bytes_begin(b, 200)), [0x58, 0xC8]);
    assert_eq!(enc(|b| array_begin(b, 1)), [0x81]);
    assert_eq!(enc(|b| array_begin(b, 65534)), [0x99, 0xFF, 0xFE]);
    assert_eq!(enc(|b| map_begin(b, 3)), [0xA3]);
    assert_eq!(enc(indefinite_map_begin), [0xBF]);
    assert_eq!(enc(indefinite_bytes_begin), [0x5F]);
    assert_eq!(enc(indefinite_text_begin), [0x7F]);
    assert_eq!(enc(indefinite_end), [0xFF]);
  }

  #[test]
  fn tagged_time() {
    let mut buf = [0u8; 16];
    let mut n = tag(&mut buf, crate::TAG_EPOCH_TIME);
    n += int(&mut buf[n..], 1_000_000);
    assert_eq!(&buf[..n], [0xC1, 0x1A, 0x00, 0x0F, 0x42, 0x40]);
  }
}
