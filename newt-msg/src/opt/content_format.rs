use crate::error::OptionsError;
use crate::opt::{num, OptNumber, Options};

/// A Content-Format / Accept option value from the LwM2M register.
///
/// # Related
/// - [RFC7252#section-12.3 Content-Format Registry](https://datatracker.ietf.org/doc/html/rfc7252#section-12.3)
/// - OMA-TS-LightweightM2M_Core, "Media Types"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentFormat {
  /// `text/plain; charset=utf-8` (0)
  PlainText,
  /// `application/link-format` (40)
  LinkFormat,
  /// `application/octet-stream` (42)
  Opaque,
  /// `application/cbor` (60)
  Cbor,
  /// `application/senml+cbor` (112)
  SenmlCbor,
  /// `application/senml-etch+cbor` (320)
  SenmlEtchCbor,
  /// `application/vnd.oma.lwm2m+tlv` (11542)
  Tlv,
  /// `application/vnd.oma.lwm2m+cbor` (11544)
  Lwm2mCbor,
  /// Registered elsewhere; carried verbatim
  Other(u16),
}

impl ContentFormat {
  /// Read the Content-Format option; `None` when absent
  pub fn decode(opts: &Options) -> Result<Option<Self>, OptionsError> {
    Self::decode_at(opts, num::CONTENT_FORMAT)
  }

  /// Read the Accept option; `None` when absent
  pub fn decode_accept(opts: &Options) -> Result<Option<Self>, OptionsError> {
    Self::decode_at(opts, num::ACCEPT)
  }

  fn decode_at(opts: &Options, n: OptNumber) -> Result<Option<Self>, OptionsError> {
    Ok(opts.get_u16(n)?.map(Self::from))
  }
}

impl From<u16> for ContentFormat {
  fn from(n: u16) -> Self {
    use ContentFormat::*;
    match n {
      | 0 => PlainText,
      | 40 => LinkFormat,
      | 42 => Opaque,
      | 60 => Cbor,
      | 112 => SenmlCbor,
      | 320 => SenmlEtchCbor,
      | 11542 => Tlv,
      | 11544 => Lwm2mCbor,
      | other => Other(other),
    }
  }
}

impl From<ContentFormat> for u16 {
  fn from(f: ContentFormat) -> u16 {
    use ContentFormat::*;
    match f {
      | PlainText => 0,
      | LinkFormat => 40,
      | Opaque => 42,
      | Cbor => 60,
      | SenmlCbor => 112,
      | SenmlEtchCbor => 320,
      | Tlv => 11542,
      | Lwm2mCbor => 11544,
      | Other(other) => other,
    }
  }
}
