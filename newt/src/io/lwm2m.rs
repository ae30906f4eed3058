//! LwM2M+CBOR (content format 11544).
//!
//! The payload is one indefinite-length map nested by path level:
//! Object ids map to maps of Instance ids, to maps of Resource ids, to
//! values (with a fourth level for multiple-instance resources). The
//! encoder closes and reopens only the map levels where consecutive
//! record paths diverge; the decoder mirrors that with a path stack,
//! also accepting the flat `[oid, iid, rid]` array key form.

use newt_cbor::{dec, enc, Chunk, ValueType};
use tinyvec::ArrayVec;

use crate::io::buf::Staging;
use crate::io::cbor::{extract_value, stage_value, ValueStream};
use crate::io::{map_cbor, InEntry, IoError};
use crate::path::{Level, UriPath, ID_NONE};

/// The LwM2M+CBOR record encoder
#[derive(Debug)]
pub struct Encoder {
  items_left: usize,
  base: UriPath,
  last_path: UriPath,
  maps_opened: usize,
}

impl Encoder {
  pub(crate) fn new(base: &UriPath, items: usize, staging: &mut Staging) -> Self {
    let n = enc::indefinite_map_begin(staging.space());
    staging.commit(n);
    Encoder { items_left: items,
              base: *base,
              last_path: UriPath::root(),
              maps_opened: 1 }
  }

  pub(crate) fn items_left(&self) -> usize {
    self.items_left
  }

  pub(crate) fn maps_opened(&self) -> usize {
    self.maps_opened
  }

  pub(crate) fn new_entry(&mut self,
                          staging: &mut Staging,
                          record: &crate::value::OutRecord)
                          -> Result<(), IoError> {
    if staging.remaining != 0 || self.items_left == 0 {
      return Err(IoError::Logic);
    }
    // two equal consecutive paths have no compliant wire form
    if record.path.outside_base(&self.base)
       || !record.path.has(Level::Resource)
       || record.path == self.last_path
    {
      return Err(IoError::InputArg);
    }

    let span = self.last_path.common_prefix_len(&record.path);
    if !self.last_path.is_root() {
      // close the maps below the level where the paths diverge
      for _ in 0..self.last_path.len() - (span + 1) {
        let n = enc::indefinite_end(staging.space());
        staging.commit(n);
        self.maps_opened -= 1;
      }
    }

    for (idx, id) in record.path.ids().iter().enumerate().skip(span) {
      if idx != span {
        let n = enc::indefinite_map_begin(staging.space());
        staging.commit(n);
        self.maps_opened += 1;
      }
      let n = enc::uint(staging.space(), u64::from(*id));
      staging.commit(n);
    }
    self.last_path = record.path;

    stage_value(staging, &record.value)?;

    self.items_left -= 1;
    if self.items_left == 0 {
      // the closing breaks ride along as trailing record bytes
      staging.extended = true;
      staging.remaining += self.maps_opened;
    }
    Ok(())
  }

  /// Emit as many closing breaks as fit; yields whether more remain
  pub(crate) fn emit_map_ends(&mut self,
                              staging: &mut Staging,
                              out: &mut [u8],
                              copied: &mut usize)
                              -> bool {
    let n = (out.len() - *copied).min(self.maps_opened);
    out[*copied..*copied + n].iter_mut().for_each(|b| *b = 0xFF);
    *copied += n;
    self.maps_opened -= n;
    staging.remaining -= n;
    staging.remaining != 0
  }
}

/// The LwM2M+CBOR decoder
#[derive(Debug)]
pub struct Decoder {
  decoder: dec::Decoder,
  base: UriPath,
  entered: bool,
  path: UriPath,
  // how many ids each map key contributed
  seg_lens: ArrayVec<[u8; 4]>,
  current_seg: u8,
  path_parsed: bool,
  expects_map: bool,
  in_path_array: bool,
  stream: ValueStream,
}

impl Decoder {
  pub(crate) fn new(base: &UriPath) -> Self {
    Decoder { decoder: dec::Decoder::new(),
              base: *base,
              entered: false,
              path: UriPath::root(),
              seg_lens: ArrayVec::new(),
              current_seg: 0,
              path_parsed: false,
              expects_map: false,
              in_path_array: false,
              stream: ValueStream::default() }
  }

  fn expected_nesting(&self) -> usize {
    self.seg_lens.len() + 1
  }

  fn push_id(&mut self, id: u16) -> Result<(), IoError> {
    if id == ID_NONE {
      return Err(IoError::Format);
    }
    self.path = self.path.push(id).ok_or(IoError::Format)?;
    self.current_seg += 1;
    Ok(())
  }

  fn pop_segment(&mut self) {
    if let Some(len) = self.seg_lens.pop() {
      for _ in 0..len {
        self.path = self.path.parent();
      }
    }
  }

  fn read_id(&mut self, chunk: &mut Chunk<'_>) -> nb::Result<u16, IoError> {
    let n = self.decoder.number(chunk).map_err(map_cbor)?;
    match n {
      | newt_cbor::Number::Uint(v) if v < u64::from(ID_NONE) => Ok(v as u16),
      | _ => Err(nb::Error::Other(IoError::Format)),
    }
  }

  // one map key: a single id or a flat `[id, id, ...]` array,
  // extending the path stack by one segment
  fn parse_path_fragment(&mut self, chunk: &mut Chunk<'_>) -> nb::Result<bool, IoError> {
    if !self.in_path_array {
      let level = self.decoder.nesting_level(chunk).map_err(map_cbor)?;
      if level == 0 {
        // back outside the outermost map: only a clean end is legal
        return if self.decoder.finished(chunk).map_err(map_cbor)? {
          Ok(true)
        } else {
          Err(nb::Error::Other(IoError::Format))
        };
      }
      if level > self.expected_nesting() {
        return Err(nb::Error::Other(IoError::Format));
      }
      while level < self.expected_nesting() {
        self.pop_segment();
      }

      let ty = self.decoder.peek_type(chunk).map_err(map_cbor)?;
      match ty {
        | ValueType::Array => {
          self.decoder.enter_array(chunk).map_err(map_cbor)?;
          self.in_path_array = true;
        },
        | ValueType::Uint => {
          let id = self.read_id(chunk)?;
          self.push_id(id).map_err(nb::Error::Other)?;
        },
        | _ => return Err(nb::Error::Other(IoError::Format)),
      }
    }

    while self.in_path_array {
      let level = self.decoder.nesting_level(chunk).map_err(map_cbor)?;
      if level != self.expected_nesting() + 1 {
        self.in_path_array = false;
      } else {
        let id = self.read_id(chunk)?;
        self.push_id(id).map_err(nb::Error::Other)?;
      }
    }

    if self.current_seg == 0 {
      return Err(nb::Error::Other(IoError::Format));
    }
    if self.seg_lens.len() == 4 {
      return Err(nb::Error::Other(IoError::Format));
    }
    self.seg_lens.push(self.current_seg);
    self.current_seg = 0;
    Ok(false)
  }

  pub(crate) fn get_entry<'s>(&'s mut self,
                              chunk: &'s mut Chunk<'_>)
                              -> nb::Result<Option<InEntry<'s>>, IoError> {
    if !self.entered {
      self.decoder.enter_map(chunk).map_err(map_cbor)?;
      self.entered = true;
    }

    if !self.stream.is_active() {
      loop {
        if !self.path_parsed {
          if self.parse_path_fragment(chunk)? {
            return Ok(None);
          }
          self.path_parsed = true;
        }

        if !self.expects_map {
          let ty = self.decoder.peek_type(chunk).map_err(map_cbor)?;
          if ty == ValueType::Map {
            self.expects_map = true;
          }
        }
        if !self.expects_map {
          break;
        }

        self.decoder.enter_map(chunk).map_err(map_cbor)?;
        self.path_parsed = false;
        self.expects_map = false;
      }

      if self.path.outside_base(&self.base) {
        return Err(nb::Error::Other(IoError::Format));
      }
    }

    let path = self.path;
    let value = extract_value(&mut self.decoder, chunk, &mut self.stream)?;
    if !self.stream.is_active() {
      self.path_parsed = false;
    }
    Ok(Some(InEntry { path: Some(path),
                      value: Some(value) }))
  }
}

#[cfg(test)]
mod tests {
  use newt_cbor::Number;
  use newt_msg::ContentFormat;

  use super::*;
  use crate::io::{InCtx, InKind, OutCtx, OutKind};
  use crate::value::{InValue, OutRecord, OutValue};

  fn drain_all(ctx: &mut OutCtx, out: &mut [u8], from: usize) -> usize {
    let mut total = from;
    loop {
      let (n, more) = ctx.get_payload(&mut out[total..]).unwrap();
      total += n;
      if !more {
        return total;
      }
    }
  }

  #[test]
  fn nested_maps_share_path_prefixes() {
    let mut ctx = OutCtx::new(OutKind::Read,
                              &UriPath::object(1),
                              2,
                              Some(ContentFormat::Lwm2mCbor)).unwrap();
    let mut out = [0u8; 64];

    ctx.new_entry(OutRecord::new(UriPath::resource(1, 1, 1),
                                 OutValue::Uint(7))).unwrap();
    let total = drain_all(&mut ctx, &mut out, 0);
    ctx.new_entry(OutRecord::new(UriPath::resource(1, 2, 1),
                                 OutValue::Uint(8))).unwrap();
    let total = drain_all(&mut ctx, &mut out, total);

    assert_eq!(&out[..total],
               [0xBF, 0x01, 0xBF, 0x01, 0xBF, 0x01, 0x07, 0xFF, 0x02, 0xBF,
                0x01, 0x08, 0xFF, 0xFF, 0xFF]);
  }

  #[test]
  fn map_ends_split_across_tiny_buffers() {
    let mut ctx = OutCtx::new(OutKind::Read,
                              &UriPath::object(1),
                              1,
                              Some(ContentFormat::Lwm2mCbor)).unwrap();
    ctx.new_entry(OutRecord::new(UriPath::resource(1, 1, 1),
                                 OutValue::Uint(7))).unwrap();

    let mut out = [0u8; 64];
    let mut total = 0;
    loop {
      let (n, more) = ctx.get_payload(&mut out[total..total + 2]).unwrap();
      total += n;
      if !more {
        break;
      }
    }
    assert_eq!(&out[..total],
               [0xBF, 0x01, 0xBF, 0x01, 0xBF, 0x01, 0x07, 0xFF, 0xFF, 0xFF]);
  }

  #[test]
  fn empty_read_is_an_empty_map() {
    let mut ctx = OutCtx::new(OutKind::Read,
                              &UriPath::instance(3, 0),
                              0,
                              Some(ContentFormat::Lwm2mCbor)).unwrap();
    let mut out = [0u8; 8];
    let (n, more) = ctx.get_payload(&mut out).unwrap();
    assert_eq!((&out[..n], more), (&[0xBF, 0xFF][..], false));
  }

  #[test]
  fn equal_consecutive_paths_rejected() {
    let mut ctx = OutCtx::new(OutKind::Read,
                              &UriPath::object(1),
                              2,
                              Some(ContentFormat::Lwm2mCbor)).unwrap();
    let mut out = [0u8; 64];
    ctx.new_entry(OutRecord::new(UriPath::resource(1, 1, 1),
                                 OutValue::Uint(7))).unwrap();
    drain_all(&mut ctx, &mut out, 0);
    assert_eq!(ctx.new_entry(OutRecord::new(UriPath::resource(1, 1, 1),
                                            OutValue::Uint(8))),
               Err(IoError::InputArg));
  }

  #[test]
  fn decode_nested_form() {
    let payload = [0xBF, 0x01, 0xBF, 0x01, 0xBF, 0x01, 0x07, 0xFF, 0x02, 0xBF,
                   0x01, 0x08, 0xFF, 0xFF, 0xFF];
    let mut dec = InCtx::new(InKind::Write, &UriPath::object(1),
                             ContentFormat::Lwm2mCbor).unwrap();
    let mut chunk = Chunk::new(&payload, true);

    let first = dec.get_entry(&mut chunk).unwrap().unwrap();
    assert_eq!(first.path, Some(UriPath::resource(1, 1, 1)));
    assert_eq!(first.value, Some(InValue::Number(Number::Uint(7))));

    let second = dec.get_entry(&mut chunk).unwrap().unwrap();
    assert_eq!(second.path, Some(UriPath::resource(1, 2, 1)));
    assert_eq!(second.value, Some(InValue::Number(Number::Uint(8))));

    assert_eq!(dec.get_entry(&mut chunk).unwrap(), None);
  }

  #[test]
  fn decode_flat_key_form() {
    // {[3, 0, 9]: 42}
    let payload = [0xBF, 0x83, 0x03, 0x00, 0x09, 0x18, 0x2A, 0xFF];
    let mut dec = InCtx::new(InKind::Write, &UriPath::root(),
                             ContentFormat::Lwm2mCbor).unwrap();
    let mut chunk = Chunk::new(&payload, true);
    let entry = dec.get_entry(&mut chunk).unwrap().unwrap();
    assert_eq!(entry.path, Some(UriPath::resource(3, 0, 9)));
    assert_eq!(entry.value, Some(InValue::Number(Number::Uint(42))));
  }

  #[test]
  fn decode_rejects_out_of_base_values() {
    // {2: {0: {0: 1}}} against base /3
    let payload = [0xBF, 0x02, 0xBF, 0x00, 0xBF, 0x00, 0x01, 0xFF, 0xFF, 0xFF];
    let mut dec = InCtx::new(InKind::Write, &UriPath::object(3),
                             ContentFormat::Lwm2mCbor).unwrap();
    let mut chunk = Chunk::new(&payload, true);
    assert_eq!(dec.get_entry(&mut chunk),
               Err(nb::Error::Other(IoError::Format)));
  }
}
