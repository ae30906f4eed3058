//! OMA-TLV decoder (content format 11542), for servers still writing
//! the LwM2M 1.0 binary format.
//!
//! ```text
//! +-------------+------------+------------------+----------+
//! | Type (1B)   | Identifier | Length (0-3B)    | Value    |
//! | bits 7-6 id kind, 5 id width, 4-3 len width, 2-0 len   |
//! +-------------+------------+------------------+----------+
//! ```
//!
//! Values come out as byte pieces; their numeric interpretation
//! (big-endian 1/2/4/8-byte integers, per the resource's declared
//! type) is made by the consumer via [`int_from_bytes`] /
//! [`uint_from_bytes`].

use newt_cbor::Chunk;
use tinyvec::ArrayVec;

use crate::io::{InEntry, IoError};
use crate::path::{Level, UriPath};
use crate::value::{BytesChunk, InValue};

const KIND_OBJECT_INSTANCE: u8 = 0b00;
const KIND_RESOURCE_INSTANCE: u8 = 0b01;
const KIND_MULTIPLE_RESOURCE: u8 = 0b10;
const KIND_RESOURCE: u8 = 0b11;

#[derive(Debug, Clone, Copy, Default)]
struct Frame {
  // where this container's value region ends, as an absolute offset
  end: usize,
}

/// Decode a big-endian 1/2/4/8-byte TLV integer value
pub fn int_from_bytes(bytes: &[u8]) -> Option<i64> {
  match bytes.len() {
    | 1 => Some(i64::from(bytes[0] as i8)),
    | 2 => Some(i64::from(i16::from_be_bytes([bytes[0], bytes[1]]))),
    | 4 => {
      Some(i64::from(i32::from_be_bytes([bytes[0], bytes[1], bytes[2],
                                         bytes[3]])))
    },
    | 8 => {
      let mut raw = [0u8; 8];
      raw.copy_from_slice(bytes);
      Some(i64::from_be_bytes(raw))
    },
    | _ => None,
  }
}

/// Decode a big-endian unsigned TLV integer value
pub fn uint_from_bytes(bytes: &[u8]) -> Option<u64> {
  match bytes.len() {
    | 1 | 2 | 4 | 8 => {
      Some(bytes.iter().fold(0u64, |acc, b| acc << 8 | u64::from(*b)))
    },
    | _ => None,
  }
}

/// The TLV structural decoder.
///
/// Works on a fully buffered payload region per chunk; TLV headers
/// split across chunk boundaries are carried over in a small stash.
#[derive(Debug)]
pub struct Decoder {
  base: UriPath,
  // absolute offset within the whole payload
  consumed: usize,
  containers: ArrayVec<[Frame; 3]>,
  container_path: UriPath,
  // value currently being drained
  value_path: UriPath,
  value_end: usize,
  value_full: usize,
  value_offset: usize,
  stash: ArrayVec<[u8; 6]>,
}

impl Decoder {
  pub(crate) fn new(base: &UriPath) -> Result<Self, IoError> {
    if base.has(Level::ResourceInstance) {
      return Err(IoError::InputArg);
    }
    Ok(Self { base: *base,
              consumed: 0,
              containers: ArrayVec::new(),
              container_path: *base,
              value_path: UriPath::root(),
              value_end: 0,
              value_full: 0,
              value_offset: 0,
              stash: ArrayVec::new() })
  }

  fn pop_finished_containers(&mut self) -> Result<(), IoError> {
    while let Some(top) = self.containers.last() {
      if self.consumed > top.end {
        return Err(IoError::Format);
      }
      if self.consumed == top.end {
        self.containers.pop();
        self.container_path = self.container_path.parent();
      } else {
        break;
      }
    }
    Ok(())
  }

  pub(crate) fn get_entry<'s>(&'s mut self,
                              chunk: &'s mut Chunk<'_>)
                              -> nb::Result<Option<InEntry<'s>>, IoError> {
    // drain the value in flight first
    if self.consumed < self.value_end {
      let want = self.value_end - self.consumed;
      let data = chunk.take_up_to(want);
      if data.is_empty() {
        return if chunk.is_last() {
          Err(nb::Error::Other(IoError::Format))
        } else {
          Err(nb::Error::WouldBlock)
        };
      }
      let offset = self.value_offset;
      self.value_offset += data.len();
      self.consumed += data.len();
      return Ok(Some(InEntry { path: Some(self.value_path),
                               value:
                                 Some(InValue::Bytes(BytesChunk { offset,
                                                                  data,
                                                                  full_length:
                                                                    Some(self.value_full) })) }));
    }

    self.pop_finished_containers().map_err(nb::Error::Other)?;

    // pull a whole header through the stash
    loop {
      let header = self.stash.as_slice();
      if let Some((kind, id, len, used)) = parse_header(header)? {
        self.stash.clear();
        self.consumed += used;
        return self.start_element(kind, id, len, chunk);
      }
      match chunk.take_up_to(1).first() {
        | Some(b) => self.stash.push(*b),
        | None if chunk.is_last() => {
          return if self.stash.is_empty() && self.containers.is_empty() {
            Ok(None)
          } else {
            Err(nb::Error::Other(IoError::Format))
          };
        },
        | None => return Err(nb::Error::WouldBlock),
      }
    }
  }

  fn start_element<'s>(&'s mut self,
                       kind: u8,
                       id: u16,
                       len: usize,
                       chunk: &'s mut Chunk<'_>)
                       -> nb::Result<Option<InEntry<'s>>, IoError> {
    let path = self.container_path
                   .push(id)
                   .ok_or(nb::Error::Other(IoError::Format))?;

    match kind {
      | KIND_OBJECT_INSTANCE | KIND_MULTIPLE_RESOURCE => {
        let expected = if kind == KIND_OBJECT_INSTANCE {
          Level::Instance
        } else {
          Level::Resource
        };
        if !path.is(expected) || self.containers.len() == 3 {
          return Err(nb::Error::Other(IoError::Format));
        }
        self.containers.push(Frame { end: self.consumed + len });
        self.container_path = path;
        // nothing to deliver for the container itself
        self.get_entry(chunk)
      },
      | KIND_RESOURCE | KIND_RESOURCE_INSTANCE => {
        let ok = match kind {
          | KIND_RESOURCE => path.is(Level::Resource),
          | _ => path.is(Level::ResourceInstance),
        };
        if !ok || path.outside_base(&self.base) {
          return Err(nb::Error::Other(IoError::Format));
        }
        self.value_path = path;
        self.value_end = self.consumed + len;
        self.value_full = len;
        self.value_offset = 0;
        if len == 0 {
          return Ok(Some(InEntry { path: Some(path),
                                   value:
                                     Some(InValue::Bytes(BytesChunk { offset: 0,
                                                                      data: &[],
                                                                      full_length:
                                                                        Some(0) })) }));
        }
        self.get_entry(chunk)
      },
      | _ => Err(nb::Error::Other(IoError::Format)),
    }
  }
}

// Some((kind, id, value_len, header_len)) once the stash holds a whole
// header; None = need more bytes
#[allow(clippy::type_complexity)]
fn parse_header(stash: &[u8]) -> nb::Result<Option<(u8, u16, usize, usize)>, IoError> {
  let Some(&type_byte) = stash.first() else {
    return Ok(None);
  };
  let kind = type_byte >> 6;
  let id_len = if type_byte & 0b10_0000 != 0 { 2 } else { 1 };
  let len_width = usize::from(type_byte >> 3 & 0b11);

  let header_len = 1 + id_len + len_width;
  if stash.len() < header_len {
    return Ok(None);
  }

  let id = if id_len == 2 {
    u16::from_be_bytes([stash[1], stash[2]])
  } else {
    u16::from(stash[1])
  };

  let len = if len_width == 0 {
    usize::from(type_byte & 0b111)
  } else {
    stash[1 + id_len..header_len].iter()
                                 .fold(0usize, |acc, b| acc << 8 | usize::from(*b))
  };

  Ok(Some((kind, id, len, header_len)))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn single_resource() {
    // resource 5 with value 0x2A, under /3/0
    let payload = [0b11_0_00_001, 5, 0x2A];
    let mut dec = Decoder::new(&UriPath::instance(3, 0)).unwrap();
    let mut chunk = Chunk::new(&payload, true);
    let entry = dec.get_entry(&mut chunk).unwrap().unwrap();
    assert_eq!(entry.path, Some(UriPath::resource(3, 0, 5)));
    match entry.value {
      | Some(InValue::Bytes(piece)) => {
        assert_eq!(int_from_bytes(piece.data), Some(42));
      },
      | other => panic!("{:?}", other),
    }
    assert_eq!(dec.get_entry(&mut chunk).unwrap(), None);
  }

  #[test]
  fn object_instance_wrapping() {
    // instance 0 { resource 1 = 0x0101, resource 7 = "U" }
    let payload = [0b00_0_00_111, 0, // instance 0, 7 bytes
                   0b11_0_00_010, 1, 0x01, 0x01, 0b11_0_00_001, 7, b'U'];
    let mut dec = Decoder::new(&UriPath::object(1)).unwrap();
    let mut chunk = Chunk::new(&payload, true);

    let first = dec.get_entry(&mut chunk).unwrap().unwrap();
    assert_eq!(first.path, Some(UriPath::resource(1, 0, 1)));
    let second = dec.get_entry(&mut chunk).unwrap().unwrap();
    assert_eq!(second.path, Some(UriPath::resource(1, 0, 7)));
    assert_eq!(dec.get_entry(&mut chunk).unwrap(), None);
  }

  #[test]
  fn multiple_resource_instances() {
    // multiple resource 6 { instance 0 = 1, instance 1 = 5 }
    let payload = [0b10_0_00_110, 6, 0b01_0_00_001, 0, 1, 0b01_0_00_001, 1, 5];
    let mut dec = Decoder::new(&UriPath::instance(1, 0)).unwrap();
    let mut chunk = Chunk::new(&payload, true);

    let first = dec.get_entry(&mut chunk).unwrap().unwrap();
    assert_eq!(first.path, Some(UriPath::resource_instance(1, 0, 6, 0)));
    let second = dec.get_entry(&mut chunk).unwrap().unwrap();
    assert_eq!(second.path, Some(UriPath::resource_instance(1, 0, 6, 1)));
    assert_eq!(dec.get_entry(&mut chunk).unwrap(), None);
  }

  #[test]
  fn truncated_container_is_malformed() {
    let payload = [0b00_0_00_111, 0, 0b11_0_00_010, 1, 0x01];
    let mut dec = Decoder::new(&UriPath::object(1)).unwrap();
    let mut chunk = Chunk::new(&payload, true);
    dec.get_entry(&mut chunk).unwrap();
    assert!(dec.get_entry(&mut chunk).is_err());
  }

  #[test]
  fn integer_widths() {
    assert_eq!(int_from_bytes(&[0xFF]), Some(-1));
    assert_eq!(int_from_bytes(&[0x01, 0x01]), Some(257));
    assert_eq!(uint_from_bytes(&[0x01, 0x01]), Some(257));
    assert_eq!(int_from_bytes(&[1, 2, 3]), None);
  }
}
