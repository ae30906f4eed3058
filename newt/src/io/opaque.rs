//! `application/octet-stream` (content format 42): the payload *is*
//! the value, byte for byte, chunked in both directions.

use newt_cbor::Chunk;

use crate::io::buf::Staging;
use crate::io::{InEntry, IoError};
use crate::path::{Level, UriPath};
use crate::value::{BytesChunk, InValue, OutRecord, OutValue};

pub(crate) fn prepare(staging: &mut Staging, value: &OutValue) -> Result<(), IoError> {
  match *value {
    | OutValue::Bytes(data) => {
      staging.finish_record(Some(data.len()));
      Ok(())
    },
    #[cfg(feature = "external-data")]
    | OutValue::ExternalBytes(_) => {
      // length unknown until the source reports its end
      staging.finish_record(Some(1));
      Ok(())
    },
    | _ => Err(IoError::Format),
  }
}

pub(crate) fn pump_body(staging: &mut Staging,
                        entry: &OutRecord,
                        out: &mut [u8],
                        copied: &mut usize)
                        -> Result<(usize, bool), IoError> {
  match entry.value {
    | OutValue::Bytes(data) => {
      let offset = staging.body_offset();
      let n = (data.len() - offset).min(out.len() - *copied);
      out[*copied..*copied + n].copy_from_slice(&data[offset..offset + n]);
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
    | OutValue::ExternalBytes(src) => {
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

/// The opaque decoder: raw payload pieces at the request path.
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

    Ok(Some(InEntry { path: Some(self.path),
                      value:
                        Some(InValue::Bytes(BytesChunk { offset,
                                                         data,
                                                         full_length: full })) }))
  }
}
