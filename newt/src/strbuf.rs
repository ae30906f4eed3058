use core::fmt;
use core::ops::Deref;

use tinyvec::ArrayVec;

/// A stack-allocated string with a fixed capacity, used wherever the
/// core renders decimal ids, attribute values or link-format records.
///
/// Writes past the capacity fail with [`fmt::Error`] rather than
/// truncating silently.
///
/// ```
/// use core::fmt::Write;
///
/// use newt::strbuf::StrBuf;
///
/// let mut s = StrBuf::<16>::new();
/// write!(s, "lt={}", 86400).unwrap();
/// assert_eq!(&*s, "lt=86400");
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StrBuf<const N: usize>(ArrayVec<[u8; N]>);

impl<const N: usize> StrBuf<N> {
  /// An empty buffer
  pub fn new() -> Self {
    Self(ArrayVec::new())
  }

  /// Copy of `s`, `None` if it does not fit
  pub fn copy_of(s: &str) -> Option<Self> {
    if s.len() > N {
      None
    } else {
      let mut buf = Self::new();
      buf.0.extend_from_slice(s.as_bytes());
      Some(buf)
    }
  }

  /// The string contents
  pub fn as_str(&self) -> &str {
    // only written through fmt::Write with &str input
    core::str::from_utf8(&self.0).unwrap_or("")
  }

  /// Length in bytes
  pub fn len(&self) -> usize {
    self.0.len()
  }

  /// Whether nothing has been written
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Discard the contents
  pub fn clear(&mut self) {
    self.0.clear()
  }
}

impl<const N: usize> fmt::Write for StrBuf<N> {
  fn write_str(&mut self, s: &str) -> fmt::Result {
    if self.0.len() + s.len() > N {
      Err(fmt::Error)
    } else {
      self.0.extend_from_slice(s.as_bytes());
      Ok(())
    }
  }
}

impl<const N: usize> Deref for StrBuf<N> {
  type Target = str;

  fn deref(&self) -> &str {
    self.as_str()
  }
}

impl<const N: usize> AsRef<str> for StrBuf<N> {
  fn as_ref(&self) -> &str {
    self.as_str()
  }
}

#[cfg(test)]
mod tests {
  use core::fmt::Write;

  use super::*;

  #[test]
  fn overflow_is_an_error_not_a_truncation() {
    let mut s = StrBuf::<4>::new();
    write!(s, "abcd").unwrap();
    assert!(write!(s, "e").is_err());
    assert_eq!(&*s, "abcd");
  }

  #[test]
  fn copy_of_checks_capacity() {
    assert_eq!(StrBuf::<2>::copy_of("abc"), None);
    assert_eq!(StrBuf::<3>::copy_of("abc").unwrap().as_str(), "abc");
  }
}
