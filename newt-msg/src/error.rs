/// Errors produced by the [`Options`](crate::Options) table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionsError {
  /// The option stream buffer cannot fit the delta-encoded
  /// representation of the option being added
  Buffer,
  /// The option count limit was reached
  Capacity,
  /// Malformed delta/length nibble, reserved value 15, or a stream
  /// that runs past the provided bytes
  Format,
}

/// Errors produced by the UDP/TCP frame codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
  /// A header, token, option stream or payload that violates
  /// RFC 7252 / RFC 8323
  Malformed,
  /// The output buffer is too small for the message
  Buffer,
  /// TCP only: not enough bytes buffered yet to hold one whole frame;
  /// retry once more bytes arrive
  Incomplete,
}

impl From<OptionsError> for FrameError {
  fn from(e: OptionsError) -> Self {
    match e {
      | OptionsError::Buffer | OptionsError::Capacity => FrameError::Buffer,
      | OptionsError::Format => FrameError::Malformed,
    }
  }
}

impl From<newt_cursor::EndOfBuffer> for FrameError {
  fn from(_: newt_cursor::EndOfBuffer) -> Self {
    FrameError::Buffer
  }
}
