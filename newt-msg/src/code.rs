/// A CoAP message code, packed on the wire as `class(3) . detail(5)`.
///
/// # Examples
/// ```
/// use newt_msg::Code;
///
/// assert_eq!(u8::from(Code::CHANGED), 0b010_00100);
/// assert_eq!(Code::from(0b010_00100u8), Code::new(2, 4));
/// ```
///
/// # Related
/// - [RFC7252#section-12.1 CoAP Code Registries](https://datatracker.ietf.org/doc/html/rfc7252#section-12.1)
/// - [RFC8323#section-5 Signaling](https://datatracker.ietf.org/doc/html/rfc8323#section-5)
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct Code {
  /// `0` request, `2` success, `4` client error, `5` server error,
  /// `7` signaling (TCP)
  pub class: u8,
  /// Granular meaning within the class; `0` for plain requests
  pub detail: u8,
}

/// Whether a code is for a request, response, signaling message, or
/// the empty message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodeKind {
  /// A request code (0.01 - 0.31)
  Request,
  /// A response code (2.xx - 5.xx)
  Response,
  /// A signaling code (7.xx, TCP only)
  Signaling,
  /// EMPTY (0.00)
  Empty,
}

impl Code {
  /// Create a new code
  pub const fn new(class: u8, detail: u8) -> Self {
    Self { class, detail }
  }

  /// Get whether this code is a request, response, signaling message
  /// or the empty message
  ///
  /// ```
  /// use newt_msg::{Code, CodeKind};
  ///
  /// assert_eq!(Code::EMPTY.kind(), CodeKind::Empty);
  /// assert_eq!(Code::GET.kind(), CodeKind::Request);
  /// assert_eq!(Code::CONTENT.kind(), CodeKind::Response);
  /// assert_eq!(Code::CSM.kind(), CodeKind::Signaling);
  /// ```
  pub fn kind(&self) -> CodeKind {
    match (self.class, self.detail) {
      | (0, 0) => CodeKind::Empty,
      | (0, _) => CodeKind::Request,
      | (7, _) => CodeKind::Signaling,
      | _ => CodeKind::Response,
    }
  }

  /// Whether this is a request code (class 0, nonzero detail)
  pub fn is_request(&self) -> bool {
    self.kind() == CodeKind::Request
  }

  /// Whether this is a response code (class 2..=5)
  pub fn is_response(&self) -> bool {
    self.kind() == CodeKind::Response
  }

  /// Whether this is a client or server error response (class 4 or 5)
  pub fn is_error_response(&self) -> bool {
    self.class == 4 || self.class == 5
  }

  /// Render as the dotted human form, e.g. `2.05`
  pub fn to_human(&self) -> [char; 4] {
    let to_char = |d: u8| {
      core::char::from_digit(u32::from(d), 10).unwrap_or('?')
    };
    [to_char(self.class),
     '.',
     to_char(self.detail / 10),
     to_char(self.detail % 10)]
  }

  /// 0.00
  pub const EMPTY: Self = Self::new(0, 0);
  /// 0.01
  pub const GET: Self = Self::new(0, 1);
  /// 0.02
  pub const POST: Self = Self::new(0, 2);
  /// 0.03
  pub const PUT: Self = Self::new(0, 3);
  /// 0.04
  pub const DELETE: Self = Self::new(0, 4);
  /// 0.05 (RFC 8132)
  pub const FETCH: Self = Self::new(0, 5);
  /// 0.07 (RFC 8132)
  pub const IPATCH: Self = Self::new(0, 7);

  /// 2.01
  pub const CREATED: Self = Self::new(2, 1);
  /// 2.02
  pub const DELETED: Self = Self::new(2, 2);
  /// 2.03
  pub const VALID: Self = Self::new(2, 3);
  /// 2.04
  pub const CHANGED: Self = Self::new(2, 4);
  /// 2.05
  pub const CONTENT: Self = Self::new(2, 5);
  /// 2.31 (RFC 7959)
  pub const CONTINUE: Self = Self::new(2, 31);

  /// 4.00
  pub const BAD_REQUEST: Self = Self::new(4, 0);
  /// 4.01
  pub const UNAUTHORIZED: Self = Self::new(4, 1);
  /// 4.02
  pub const BAD_OPTION: Self = Self::new(4, 2);
  /// 4.03
  pub const FORBIDDEN: Self = Self::new(4, 3);
  /// 4.04
  pub const NOT_FOUND: Self = Self::new(4, 4);
  /// 4.05
  pub const METHOD_NOT_ALLOWED: Self = Self::new(4, 5);
  /// 4.06
  pub const NOT_ACCEPTABLE: Self = Self::new(4, 6);
  /// 4.08 (RFC 7959)
  pub const REQUEST_ENTITY_INCOMPLETE: Self = Self::new(4, 8);
  /// 4.13
  pub const REQUEST_ENTITY_TOO_LARGE: Self = Self::new(4, 13);
  /// 4.15
  pub const UNSUPPORTED_CONTENT_FORMAT: Self = Self::new(4, 15);

  /// 5.00
  pub const INTERNAL_SERVER_ERROR: Self = Self::new(5, 0);
  /// 5.01
  pub const NOT_IMPLEMENTED: Self = Self::new(5, 1);
  /// 5.03
  pub const SERVICE_UNAVAILABLE: Self = Self::new(5, 3);
  /// 5.05 — the upper bound of the response code range this client
  /// accepts from a server
  pub const PROXYING_NOT_SUPPORTED: Self = Self::new(5, 5);

  /// 7.01 CSM (RFC 8323)
  pub const CSM: Self = Self::new(7, 1);
  /// 7.02 Ping (RFC 8323)
  pub const PING: Self = Self::new(7, 2);
  /// 7.03 Pong (RFC 8323)
  pub const PONG: Self = Self::new(7, 3);
  /// 7.04 Release (RFC 8323)
  pub const RELEASE: Self = Self::new(7, 4);
  /// 7.05 Abort (RFC 8323)
  pub const ABORT: Self = Self::new(7, 5);
}

impl From<u8> for Code {
  fn from(b: u8) -> Self {
    Code { class: b >> 5,
           detail: b & 0b00011111 }
  }
}

impl From<Code> for u8 {
  fn from(code: Code) -> u8 {
    (code.class << 5) | (code.detail & 0b00011111)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_code() {
    assert_eq!(Code::from(0b01000101u8),
               Code { class: 2,
                      detail: 5 });
  }

  #[test]
  fn serialize_code() {
    assert_eq!(u8::from(Code { class: 2,
                               detail: 5 }),
               0b01000101u8);
  }

  #[test]
  fn method_codes_match_rfc7252_table_5() {
    assert_eq!(u8::from(Code::GET), 1);
    assert_eq!(u8::from(Code::POST), 2);
    assert_eq!(u8::from(Code::PUT), 3);
    assert_eq!(u8::from(Code::DELETE), 4);
    assert_eq!(u8::from(Code::FETCH), 5);
    assert_eq!(u8::from(Code::IPATCH), 7);
  }

  #[test]
  fn kinds() {
    assert!(Code::GET.is_request());
    assert!(!Code::EMPTY.is_request());
    assert!(Code::CONTINUE.is_response());
    assert!(Code::NOT_FOUND.is_error_response());
    assert!(!Code::CONTENT.is_error_response());
    assert_eq!(Code::PONG.kind(), CodeKind::Signaling);
  }

  #[test]
  fn human() {
    assert_eq!(Code::CONTINUE.to_human(), ['2', '.', '3', '1']);
  }
}
