//! Content-format codecs: the serialization engine between the
//! exchange layer (which moves opaque payload blocks) and the data
//! model (which speaks typed values at paths).
//!
//! The out direction is pull-model: a session feeds records with
//! [`OutCtx::new_entry`] and the exchange engine drains wire bytes
//! with [`OutCtx::get_payload`], one CoAP block at a time; values too
//! large for any block stream through without ever being materialized.
//! The in direction mirrors it around [`InCtx::get_entry`] fed by
//! [`Chunk`]s of received payload.

use newt_cbor::Chunk;
use newt_msg::ContentFormat;

use crate::path::UriPath;
use crate::value::{InValue, OutRecord, OutValue};

pub(crate) mod buf;

/// Plain CBOR single-value codec, and the value-level helpers the
/// other CBOR formats share
#[cfg(any(feature = "cbor", feature = "senml-cbor", feature = "lwm2m-cbor"))]
pub mod cbor;

/// SenML+CBOR codec
#[cfg(feature = "senml-cbor")]
pub mod senml;

/// LwM2M+CBOR codec
#[cfg(feature = "lwm2m-cbor")]
pub mod lwm2m;

/// Plaintext codec
#[cfg(feature = "plaintext")]
pub mod text;

/// Raw byte stream codec
#[cfg(feature = "opaque")]
pub mod opaque;

/// TLV decoder
#[cfg(feature = "tlv")]
pub mod tlv;

/// Link-format writers (register payload, discover)
pub mod link;

mod out_body;

use buf::Staging;

/// Serialization errors. Running out of *input* during decode is
/// [`nb::Error::WouldBlock`], not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
  /// Payload violates its format
  Format,
  /// Calls out of order, or reading past the end
  Logic,
  /// Records rejected before touching the wire (bad path, bad value
  /// for the format)
  InputArg,
  /// Content format not compiled in / not usable for this operation
  UnsupportedFormat,
  /// Value type not expressible in the chosen format
  Type,
}

impl From<newt_cbor::dec::Error> for IoError {
  fn from(e: newt_cbor::dec::Error) -> Self {
    match e {
      | newt_cbor::dec::Error::Format => IoError::Format,
      | newt_cbor::dec::Error::Logic => IoError::Logic,
    }
  }
}

pub(crate) fn map_cbor(e: nb::Error<newt_cbor::dec::Error>) -> nb::Error<IoError> {
  match e {
    | nb::Error::WouldBlock => nb::Error::WouldBlock,
    | nb::Error::Other(inner) => nb::Error::Other(inner.into()),
  }
}

/// What kind of response/request payload is being produced; decides
/// base-name usage and time encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutKind {
  /// Read / Observe response: paths relative to the request path
  Read,
  /// Composite Read/Observe response: absolute paths
  Composite,
  /// Notification: absolute paths, timestamps allowed
  Notify,
  /// Send request: absolute paths, timestamps allowed
  Send,
}

impl OutKind {
  fn uses_base(&self) -> bool {
    *self == OutKind::Read
  }

  fn encodes_time(&self) -> bool {
    matches!(self, OutKind::Notify | OutKind::Send)
  }
}

fn format_supported(format: ContentFormat) -> bool {
  match format {
    #[cfg(feature = "opaque")]
    | ContentFormat::Opaque => true,
    #[cfg(feature = "plaintext")]
    | ContentFormat::PlainText => true,
    #[cfg(feature = "cbor")]
    | ContentFormat::Cbor => true,
    #[cfg(feature = "lwm2m-cbor")]
    | ContentFormat::Lwm2mCbor => true,
    #[cfg(feature = "senml-cbor")]
    | ContentFormat::SenmlCbor | ContentFormat::SenmlEtchCbor => true,
    | _ => false,
  }
}

fn check_format(format: ContentFormat, items: usize, kind: OutKind) -> Result<(), IoError> {
  if !format_supported(format) {
    return Err(IoError::UnsupportedFormat);
  }
  // single-record-only formats fit nothing but a plain Read/Observe
  if matches!(format,
              ContentFormat::Opaque | ContentFormat::Cbor | ContentFormat::PlainText)
     && (items > 1 || kind != OutKind::Read)
  {
    return Err(IoError::Format);
  }
  Ok(())
}

fn choose_format(requested: Option<ContentFormat>) -> ContentFormat {
  match requested {
    | Some(f) => f,
    | None => {
      #[cfg(feature = "lwm2m-cbor")]
      {
        ContentFormat::Lwm2mCbor
      }
      #[cfg(not(feature = "lwm2m-cbor"))]
      {
        ContentFormat::SenmlCbor
      }
    },
  }
}

#[derive(Debug)]
enum OutEnc {
  #[cfg(feature = "cbor")]
  Cbor { entry_added: bool },
  #[cfg(feature = "senml-cbor")]
  Senml(senml::Encoder),
  #[cfg(feature = "lwm2m-cbor")]
  Lwm2m(lwm2m::Encoder),
  #[cfg(feature = "plaintext")]
  Text { entry_added: bool },
  #[cfg(feature = "opaque")]
  Opaque { entry_added: bool },
  Empty,
}

/// A payload being produced.
///
/// One record at a time: [`OutCtx::new_entry`], then
/// [`OutCtx::get_payload`] until it reports no more, then the next
/// record.
#[derive(Debug)]
pub struct OutCtx<'a> {
  format: ContentFormat,
  staging: Staging,
  enc: OutEnc,
  entry: Option<OutRecord<'a>>,
  empty: bool,
}

impl<'a> OutCtx<'a> {
  /// Start a payload of `items` records for the operation `kind`,
  /// in the requested format (or the configured default).
  ///
  /// `base` is the request path the records answer (ignored unless
  /// `kind` uses it).
  pub fn new(kind: OutKind,
             base: &UriPath,
             items: usize,
             requested: Option<ContentFormat>)
             -> Result<Self, IoError> {
    if let Some(f) = requested {
      check_format(f, items, kind)?;
    }
    let format = choose_format(requested);
    let base = if kind.uses_base() { *base } else { UriPath::root() };

    let mut ctx = OutCtx { format,
                           staging: Staging::default(),
                           enc: OutEnc::Empty,
                           entry: None,
                           empty: items == 0 };

    if items == 0 {
      // an empty read is only expressible in the hierarchical formats
      match format {
        #[cfg(feature = "senml-cbor")]
        | ContentFormat::SenmlCbor | ContentFormat::SenmlEtchCbor => {
          ctx.staging.buf[0] = 0x80;
          ctx.staging.len = 1;
          ctx.staging.remaining = 1;
        },
        #[cfg(feature = "lwm2m-cbor")]
        | ContentFormat::Lwm2mCbor => {
          ctx.staging.buf[0] = 0xBF;
          ctx.staging.buf[1] = 0xFF;
          ctx.staging.len = 2;
          ctx.staging.remaining = 2;
        },
        | _ => return Err(IoError::Format),
      }
      return Ok(ctx);
    }

    ctx.enc = match format {
      #[cfg(feature = "plaintext")]
      | ContentFormat::PlainText => OutEnc::Text { entry_added: false },
      #[cfg(feature = "opaque")]
      | ContentFormat::Opaque => OutEnc::Opaque { entry_added: false },
      #[cfg(feature = "cbor")]
      | ContentFormat::Cbor => OutEnc::Cbor { entry_added: false },
      #[cfg(feature = "senml-cbor")]
      | ContentFormat::SenmlCbor | ContentFormat::SenmlEtchCbor => {
        OutEnc::Senml(senml::Encoder::new(&base, items, kind.encodes_time(),
                                          &mut ctx.staging))
      },
      #[cfg(feature = "lwm2m-cbor")]
      | ContentFormat::Lwm2mCbor => {
        OutEnc::Lwm2m(lwm2m::Encoder::new(&base, items, &mut ctx.staging))
      },
      | _ => return Err(IoError::UnsupportedFormat),
    };
    Ok(ctx)
  }

  /// The format actually selected
  pub fn format(&self) -> ContentFormat {
    self.format
  }

  /// Offer the next record.
  ///
  /// Fails with [`IoError::Logic`] if the previous record has not been
  /// fully drained, [`IoError::InputArg`] if the record does not fit
  /// the payload being built.
  pub fn new_entry(&mut self, record: OutRecord<'a>) -> Result<(), IoError> {
    if self.empty {
      return Err(IoError::Logic);
    }

    let result = match &mut self.enc {
      #[cfg(feature = "cbor")]
      | OutEnc::Cbor { entry_added } => {
        if core::mem::replace(entry_added, true) {
          Err(IoError::Logic)
        } else {
          cbor::encode_value(&mut self.staging, &record.value)
        }
      },
      #[cfg(feature = "senml-cbor")]
      | OutEnc::Senml(enc) => enc.new_entry(&mut self.staging, &record),
      #[cfg(feature = "lwm2m-cbor")]
      | OutEnc::Lwm2m(enc) => enc.new_entry(&mut self.staging, &record),
      #[cfg(feature = "plaintext")]
      | OutEnc::Text { entry_added } => {
        if core::mem::replace(entry_added, true) {
          Err(IoError::Logic)
        } else {
          text::encode_value(&mut self.staging, &record.value)
        }
      },
      #[cfg(feature = "opaque")]
      | OutEnc::Opaque { entry_added } => {
        if core::mem::replace(entry_added, true) {
          Err(IoError::Logic)
        } else {
          opaque::prepare(&mut self.staging, &record.value)
        }
      },
      | OutEnc::Empty => Err(IoError::Logic),
    };
    result?;

    #[cfg(feature = "external-data")]
    if let OutValue::ExternalBytes(src) | OutValue::ExternalStr(src) = record.value {
      src.open().map_err(|_| IoError::InputArg)?;
    }

    self.entry = Some(record);
    Ok(())
  }

  /// Copy the next stretch of payload into `out`; yields
  /// `(bytes_copied, more_to_come)`.
  pub fn get_payload(&mut self, out: &mut [u8]) -> Result<(usize, bool), IoError> {
    let result = self.get_payload_inner(out);
    #[cfg(feature = "external-data")]
    {
      let closes = !matches!(result, Ok((_, true)));
      if closes {
        if let Some(OutRecord { value: OutValue::ExternalBytes(src)
                                       | OutValue::ExternalStr(src),
                                .. }) = self.entry
        {
          src.close();
          self.entry = None;
        }
      }
    }
    result
  }

  fn get_payload_inner(&mut self, out: &mut [u8]) -> Result<(usize, bool), IoError> {
    let staging = &mut self.staging;
    let streamable = matches!(self.format,
                              ContentFormat::PlainText | ContentFormat::Opaque);
    if staging.remaining == 0 && !(streamable && staging.extended) && !self.empty {
      return Err(IoError::Logic);
    }

    let mut copied = staging.drain_staged(out);

    if staging.remaining == 0 {
      staging.reset();
      return Ok((copied, false));
    }
    if !staging.extended || copied == out.len() {
      return Ok((copied, true));
    }

    let entry = self.entry.as_ref().ok_or(IoError::Logic)?;
    match (&mut self.enc, self.format) {
      #[cfg(feature = "plaintext")]
      | (_, ContentFormat::PlainText) => {
        text::pump_body(staging, entry, out, &mut copied)
      },
      #[cfg(feature = "opaque")]
      | (_, ContentFormat::Opaque) => {
        opaque::pump_body(staging, entry, out, &mut copied)
      },
      #[cfg(feature = "lwm2m-cbor")]
      | (OutEnc::Lwm2m(enc), _) => {
        let trailing = if enc.items_left() == 0 { enc.maps_opened() } else { 0 };
        let status =
          out_body::pump_cbor_body(staging, entry, out, &mut copied, trailing)?;
        let mut more = status == out_body::Pump::More;
        if enc.items_left() == 0 && staging.remaining <= enc.maps_opened() {
          more = enc.emit_map_ends(staging, out, &mut copied);
        }
        if staging.remaining == 0 {
          staging.reset();
        }
        Ok((copied, more))
      },
      | _ => {
        let status = out_body::pump_cbor_body(staging, entry, out, &mut copied, 0)?;
        Ok((copied, status == out_body::Pump::More))
      },
    }
  }
}

/// One decoded record (or piece of one).
///
/// Large byte/text values arrive as successive entries for the same
/// path with advancing [`BytesChunk`](crate::value::BytesChunk)
/// offsets; `path` may lag behind the first pieces when the payload
/// puts the name after the value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InEntry<'a> {
  /// The absolute path, once known
  pub path: Option<UriPath>,
  /// The value (piece); `None` for valueless records
  pub value: Option<InValue<'a>>,
}

#[derive(Debug)]
enum InDec {
  #[cfg(feature = "cbor")]
  Cbor(cbor::Decoder),
  #[cfg(feature = "senml-cbor")]
  Senml(senml::Decoder),
  #[cfg(feature = "lwm2m-cbor")]
  Lwm2m(lwm2m::Decoder),
  #[cfg(feature = "plaintext")]
  Text(text::Decoder),
  #[cfg(feature = "opaque")]
  Opaque(opaque::Decoder),
  #[cfg(feature = "tlv")]
  Tlv(tlv::Decoder),
}

/// Whether a decoded payload is a composite path list (values
/// optional, paths may be partial) or a write (values required).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InKind {
  /// Write / Create payload against `base`
  Write,
  /// Composite Read/Observe path list: no base, records may omit
  /// values and stop above resource level
  Composite,
}

/// A payload being consumed. Feed [`Chunk`]s of received payload and
/// pull records with [`InCtx::get_entry`].
#[derive(Debug)]
pub struct InCtx {
  dec: InDec,
}

impl InCtx {
  /// Start decoding a payload in `format` addressed at `base`
  pub fn new(kind: InKind, base: &UriPath, format: ContentFormat) -> Result<Self, IoError> {
    let dec = match format {
      #[cfg(feature = "plaintext")]
      | ContentFormat::PlainText => InDec::Text(text::Decoder::new(base)?),
      #[cfg(feature = "opaque")]
      | ContentFormat::Opaque => InDec::Opaque(opaque::Decoder::new(base)?),
      #[cfg(feature = "cbor")]
      | ContentFormat::Cbor => InDec::Cbor(cbor::Decoder::new(base)?),
      #[cfg(feature = "senml-cbor")]
      | ContentFormat::SenmlCbor | ContentFormat::SenmlEtchCbor => {
        InDec::Senml(senml::Decoder::new(kind, base))
      },
      #[cfg(feature = "lwm2m-cbor")]
      | ContentFormat::Lwm2mCbor => InDec::Lwm2m(lwm2m::Decoder::new(base)),
      #[cfg(feature = "tlv")]
      | ContentFormat::Tlv => InDec::Tlv(tlv::Decoder::new(base)?),
      | _ => return Err(IoError::UnsupportedFormat),
    };
    let _ = kind;
    Ok(InCtx { dec })
  }

  /// Pull the next record (piece); `Ok(None)` at the clean end of the
  /// payload, `WouldBlock` when the next chunk is needed.
  pub fn get_entry<'s>(&'s mut self,
                       chunk: &'s mut Chunk<'_>)
                       -> nb::Result<Option<InEntry<'s>>, IoError> {
    match &mut self.dec {
      #[cfg(feature = "cbor")]
      | InDec::Cbor(dec) => dec.get_entry(chunk),
      #[cfg(feature = "senml-cbor")]
      | InDec::Senml(dec) => dec.get_entry(chunk),
      #[cfg(feature = "lwm2m-cbor")]
      | InDec::Lwm2m(dec) => dec.get_entry(chunk),
      #[cfg(feature = "plaintext")]
      | InDec::Text(dec) => dec.get_entry(chunk),
      #[cfg(feature = "opaque")]
      | InDec::Opaque(dec) => dec.get_entry(chunk),
      #[cfg(feature = "tlv")]
      | InDec::Tlv(dec) => dec.get_entry(chunk),
    }
  }

  /// Total record count when the format states it up front
  pub fn entry_count(&mut self, chunk: &mut Chunk<'_>) -> nb::Result<Option<usize>, IoError> {
    match &mut self.dec {
      #[cfg(feature = "senml-cbor")]
      | InDec::Senml(dec) => dec.entry_count(chunk),
      #[cfg(feature = "cbor")]
      | InDec::Cbor(_) => Ok(Some(1)),
      #[cfg(feature = "opaque")]
      | InDec::Opaque(_) => Ok(Some(1)),
      #[cfg(feature = "plaintext")]
      | InDec::Text(_) => Ok(Some(1)),
      | _ => Ok(None),
    }
  }
}
