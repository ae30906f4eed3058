use tinyvec::ArrayVec;

/// Message correlation token; 0 to 8 opaque bytes compared byte-exact
/// at matching length.
///
/// The client mints a fresh full-length random token for every new
/// request; notifications reuse the token their observation was
/// established with.
///
/// ```
/// use newt_msg::Token;
///
/// let t = Token::opaque(&[0xAA, 0xBB]);
/// assert_eq!(t.len(), 2);
/// assert_ne!(t, Token::opaque(&[0xAA]));
/// ```
#[derive(Copy, Clone, Hash, PartialEq, PartialOrd, Eq, Ord, Debug, Default)]
pub struct Token(pub ArrayVec<[u8; 8]>);

impl Token {
  /// Create a token from raw bytes, truncating to 8
  pub fn opaque(data: &[u8]) -> Self {
    let mut token = ArrayVec::new();
    token.extend_from_slice(&data[..data.len().min(8)]);
    Token(token)
  }

  /// The empty token
  pub fn empty() -> Self {
    Token(ArrayVec::new())
  }

  /// Token length in bytes
  pub fn len(&self) -> usize {
    self.0.len()
  }

  /// Whether this is the zero-length token
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// The token bytes
  pub fn as_bytes(&self) -> &[u8] {
    &self.0
  }
}
