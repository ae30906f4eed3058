//! The staging buffer shared by every payload encoder.
//!
//! A record is encoded in two parts: a small *staged* prefix (headers,
//! labels, scalars — at most one record's worth) plus an optional
//! *body* (byte/text string contents) that is pulled straight from the
//! record's storage, or from an external source, while the payload is
//! being copied out block by block.

use tinyvec::ArrayVec;

/// Staging capacity: must hold one SenML record head (array header,
/// map header, base name, name, base time, value header/scalar) or one
/// LwM2M-CBOR path transition plus a value header.
pub(crate) const STAGING_LEN: usize = 96;

#[derive(Debug)]
pub(crate) struct Staging {
  pub(crate) buf: [u8; STAGING_LEN],
  /// bytes staged for the current record
  pub(crate) len: usize,
  /// bytes of the current record already handed out (staged + body)
  pub(crate) offset: usize,
  /// bytes still owed for the current record; for external sources
  /// this is a placeholder until the source reports the end
  pub(crate) remaining: usize,
  /// a body follows the staged bytes
  pub(crate) extended: bool,
  /// trailing UTF-8 continuation bytes held back between external
  /// string chunks
  pub(crate) utf8_tail: ArrayVec<[u8; 3]>,
}

impl Default for Staging {
  fn default() -> Self {
    Staging { buf: [0; STAGING_LEN],
              len: 0,
              offset: 0,
              remaining: 0,
              extended: false,
              utf8_tail: ArrayVec::new() }
  }
}

impl Staging {
  pub(crate) fn reset(&mut self) {
    self.len = 0;
    self.offset = 0;
    self.remaining = 0;
    self.extended = false;
    self.utf8_tail.clear();
  }

  /// The unwritten tail of the staging buffer
  pub(crate) fn space(&mut self) -> &mut [u8] {
    &mut self.buf[self.len..]
  }

  /// Account for `n` bytes just written via [`Staging::space`]
  pub(crate) fn commit(&mut self, n: usize) {
    self.len += n;
    debug_assert!(self.len <= STAGING_LEN);
  }

  /// Close the current record: `body_len` bytes follow the staged
  /// prefix (`None` for scalar records)
  pub(crate) fn finish_record(&mut self, body_len: Option<usize>) {
    self.remaining = self.len + body_len.unwrap_or(0);
    self.extended = body_len.is_some();
  }

  /// Drain staged bytes into `out`, yielding the count copied
  pub(crate) fn drain_staged(&mut self, out: &mut [u8]) -> usize {
    if self.offset >= self.len || self.len == 0 {
      return 0;
    }
    let n = (self.len - self.offset).min(out.len());
    out[..n].copy_from_slice(&self.buf[self.offset..self.offset + n]);
    self.offset += n;
    self.remaining -= n;
    n
  }

  /// Offset into the record *body* (past the staged prefix)
  pub(crate) fn body_offset(&self) -> usize {
    self.offset - self.len
  }
}
