use crate::error::OptionsError;
use crate::opt::{num, Options};

/// Highest sequence number that fits the 24-bit Observe option value
pub const MAX_OBSERVE_SEQ: u32 = (1 << 24) - 1;

/// The Observe option as seen in a request.
///
/// Registrations are value 0, deregistrations value 1. Parsing is
/// deliberately lenient: any option value with a nonzero byte is
/// treated as a cancellation, because real servers occasionally emit
/// multi-byte sequence numbers where RFC 7641 calls for a bare 1.
///
/// # Related
/// - [RFC7641#section-2 The Observe Option](https://datatracker.ietf.org/doc/html/rfc7641#section-2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observe {
  /// Observe = 0: start observing
  Register,
  /// Observe = 1 (or any nonzero value): stop observing
  Deregister,
}

impl Observe {
  /// Read the Observe option from a table; `None` when absent,
  /// `Format` when longer than 3 bytes.
  pub fn decode(opts: &Options) -> Result<Option<Observe>, OptionsError> {
    match opts.get_first(num::OBSERVE) {
      | None => Ok(None),
      | Some(bytes) if bytes.len() > 3 => Err(OptionsError::Format),
      | Some(bytes) => {
        if bytes.iter().any(|b| *b != 0) {
          Ok(Some(Observe::Deregister))
        } else {
          Ok(Some(Observe::Register))
        }
      },
    }
  }
}

/// Whether `next` is a plausible successor of `prev` under the
/// RFC 7641 §4.4 reordering window (`2^23` serial-arithmetic span).
pub fn seq_is_newer(prev: u32, next: u32) -> bool {
  let forward = next.wrapping_sub(prev) & MAX_OBSERVE_SEQ;
  forward != 0 && forward < 1 << 23
}
