//! The transport seam.
//!
//! The core drives exactly one [`Transport`] connection at a time.
//! Every call that could block returns [`nb::Error::WouldBlock`] and
//! is safe to retry on the next [`step`](crate::client::Client::step);
//! any other error ends the active exchange and lets the owning
//! session decide what to do.

use no_std_net::SocketAddr;

/// Where a transport connection stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
  /// No socket
  Closed,
  /// Socket exists but is not connected
  Bound,
  /// Ready to send/recv
  Connected,
  /// Half-closed, waiting for cleanup
  Shutdown,
}

/// A transport-level failure. The core never inspects the inner code
/// beyond logging it; any of these is fatal for the active exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportError(pub i32);

/// A byte-oriented transport binding (UDP datagrams or a TCP stream),
/// typically wrapping a non-blocking socket.
pub trait Transport {
  /// Open a connection to `addr`.
  ///
  /// Called repeatedly until it stops returning `WouldBlock`.
  fn connect(&mut self, addr: SocketAddr) -> nb::Result<(), TransportError>;

  /// Send as much of `buf` as possible, yielding the count accepted
  fn send(&mut self, buf: &[u8]) -> nb::Result<usize, TransportError>;

  /// Receive into `buf`, yielding the count received
  fn recv(&mut self, buf: &mut [u8]) -> nb::Result<usize, TransportError>;

  /// Close the connection, remembering the local port for
  /// [`Transport::reuse_last_port`]
  fn close(&mut self) -> nb::Result<(), TransportError>;

  /// Re-open from the same local port (queue mode relies on this to
  /// keep NAT bindings alive across sleeps)
  fn reuse_last_port(&mut self) -> nb::Result<(), TransportError>;

  /// Where the connection stands
  fn state(&self) -> TransportState;

  /// Usable bytes per message inside this transport (after its own
  /// headers); bounds the CoAP block size
  fn inner_mtu(&self) -> usize;
}
