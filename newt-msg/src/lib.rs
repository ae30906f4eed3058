//! Low-level representation of the CoAP messages spoken by an LwM2M client.
//!
//! This crate is bit-exact [RFC 7252] (CoAP over UDP) and [RFC 8323]
//! (CoAP over TCP) framing:
//!  - [`Message`] — code, token, options, payload
//!  - [`Options`] — a capacity-bounded option table whose backing buffer
//!    *is* the canonical delta-encoded wire stream
//!  - [`udp`] / [`tcp`] — header framing, validation and the
//!    frame-completeness contract for stream transports
//!  - [`Block`] — RFC 7959 block-wise transfer option values
//!
//! ## Allocation
//! Nothing here allocates. All buffers are `tinyvec::ArrayVec`s sized by
//! the capacity constants below, chosen for the worst case an LwM2M
//! client core produces (registration Uri-Query sets, location paths,
//! block options).
//!
//! [RFC 7252]: https://datatracker.ietf.org/doc/html/rfc7252
//! [RFC 8323]: https://datatracker.ietf.org/doc/html/rfc8323

// docs
#![doc(html_root_url = "https://docs.rs/newt-msg/0.1.0")]
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

/// Message code
pub mod code;

/// Message id
pub mod id;

/// Message token
pub mod token;

/// Message type (UDP)
pub mod ty;

/// Message version (UDP)
pub mod ver;

/// Codec errors
pub mod error;

/// Message options
pub mod opt;

/// The transport-independent message body
pub mod msg;

/// RFC 7252 UDP framing
#[cfg(feature = "udp")]
#[cfg_attr(docsrs, doc(cfg(feature = "udp")))]
pub mod udp;

/// RFC 8323 TCP framing
#[cfg(feature = "tcp")]
#[cfg_attr(docsrs, doc(cfg(feature = "tcp")))]
pub mod tcp;

pub use code::{Code, CodeKind};
pub use error::{FrameError, OptionsError};
pub use id::Id;
pub use msg::Message;
pub use opt::block::{Block, BlockKind};
pub use opt::content_format::ContentFormat;
pub use opt::observe::Observe;
pub use opt::{OptNumber, Options};
pub use token::Token;
pub use ty::Type;
pub use ver::Version;

/// Maximum number of bytes in a [`Token`]
pub const MAX_TOKEN_LEN: usize = 8;

/// Maximum number of options in one message
pub const MAX_OPTIONS: usize = 18;

/// Capacity of the canonical option stream buffer owned by [`Options`]
pub const OPTS_BUFFER_LEN: usize = 320;

/// The byte separating options from payload
pub const PAYLOAD_MARKER: u8 = 0xFF;
