use crate::error::FrameError;

/// The UDP message type: whether the peer is expected to acknowledge
/// this message.
///
/// # Related
/// - [RFC7252#section-4.2 Messages Transmitted Reliably](https://datatracker.ietf.org/doc/html/rfc7252#section-4.2)
/// - [RFC7252#section-4.3 Messages Transmitted without Reliability](https://datatracker.ietf.org/doc/html/rfc7252#section-4.3)
#[derive(Copy, Clone, Hash, PartialEq, PartialOrd, Eq, Ord, Debug)]
pub enum Type {
  /// Some response is expected; will be retransmitted until one arrives
  Con,
  /// No response expected
  Non,
  /// Acknowledges a Con
  Ack,
  /// Rejects a message, or answers a CoAP ping
  Reset,
}

impl Type {
  /// Whether the peer must acknowledge this message
  pub fn is_confirmable(&self) -> bool {
    *self == Type::Con
  }
}

impl TryFrom<u8> for Type {
  type Error = FrameError;

  fn try_from(b: u8) -> Result<Self, Self::Error> {
    match b {
      | 0 => Ok(Type::Con),
      | 1 => Ok(Type::Non),
      | 2 => Ok(Type::Ack),
      | 3 => Ok(Type::Reset),
      | _ => Err(FrameError::Malformed),
    }
  }
}

impl From<Type> for u8 {
  fn from(t: Type) -> u8 {
    match t {
      | Type::Con => 0,
      | Type::Non => 1,
      | Type::Ack => 2,
      | Type::Reset => 3,
    }
  }
}
