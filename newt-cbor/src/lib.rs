//! Streaming CBOR for the `newt` LwM2M client core.
//!
//! Two halves, mirroring how an LwM2M client actually moves payloads:
//!
//! - [`enc`] — a stateless encoder. Each call appends one item *header*
//!   (at most [`MAX_ITEM_HEADER_LEN`] bytes) to a buffer; byte/text
//!   string bodies are appended by the caller, which is what lets the
//!   content-format layer stream values larger than any single CoAP
//!   block through a fixed staging buffer.
//! - [`dec`] — a pull decoder that is re-entrant on arbitrary input
//!   chunk boundaries. Out of input mid-item, every read returns
//!   [`nb::Error::WouldBlock`] without side effects and can be retried
//!   once the next CoAP block arrives.
//!
//! # Related
//! - [RFC7049 Concise Binary Object Representation](https://datatracker.ietf.org/doc/html/rfc7049)

// docs
#![doc(html_root_url = "https://docs.rs/newt-cbor/0.1.0")]
#![cfg_attr(any(docsrs, feature = "docs"), feature(doc_cfg))]
// -
// deny
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(not(test), deny(unsafe_code))]
// -
// warnings
#![cfg_attr(not(test), warn(unreachable_pub))]
// -
// features
#![cfg_attr(not(feature = "std"), no_std)]

/// Stateless chunked encoder
pub mod enc;

/// Re-entrant pull decoder
pub mod dec;

pub use dec::{Chunk, Decoder, Number, ValueType};

/// The most bytes a single [`enc`] call or item header can occupy:
/// initial byte + 8-byte extended argument.
pub const MAX_ITEM_HEADER_LEN: usize = 9;

/// Structure nesting depth accepted by the decoder. LwM2M-CBOR needs 5
/// (root map, object, instance, resource, resource-instance) plus the
/// decimal-fraction array; deeper payloads are rejected as malformed.
pub const MAX_NEST_DEPTH: usize = 10;

/// Major type 0: unsigned integer
pub(crate) const MAJOR_UINT: u8 = 0;
/// Major type 1: negative integer
pub(crate) const MAJOR_NEGATIVE: u8 = 1;
/// Major type 2: byte string
pub(crate) const MAJOR_BYTES: u8 = 2;
/// Major type 3: text string
pub(crate) const MAJOR_TEXT: u8 = 3;
/// Major type 4: array
pub(crate) const MAJOR_ARRAY: u8 = 4;
/// Major type 5: map
pub(crate) const MAJOR_MAP: u8 = 5;
/// Major type 6: tag
pub(crate) const MAJOR_TAG: u8 = 6;
/// Major type 7: floats & simple values
pub(crate) const MAJOR_SIMPLE: u8 = 7;

pub(crate) const EXT_LENGTH_1BYTE: u8 = 24;
pub(crate) const EXT_LENGTH_2BYTE: u8 = 25;
pub(crate) const EXT_LENGTH_4BYTE: u8 = 26;
pub(crate) const EXT_LENGTH_8BYTE: u8 = 27;
pub(crate) const EXT_LENGTH_INDEFINITE: u8 = 31;

pub(crate) const VALUE_FALSE: u8 = 20;
pub(crate) const VALUE_TRUE: u8 = 21;
pub(crate) const VALUE_NULL: u8 = 22;

pub(crate) const BREAK: u8 = 0xFF;

/// Tag 1: epoch-based date/time
pub const TAG_EPOCH_TIME: u64 = 1;
/// Tag 0: ISO 8601 date/time string
pub const TAG_STRING_TIME: u64 = 0;
/// Tag 4: decimal fraction `[exponent, mantissa]`, value `m * 10^e`
pub const TAG_DECIMAL_FRACTION: u64 = 4;
