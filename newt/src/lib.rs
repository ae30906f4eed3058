//! `newt` is an LwM2M 1.1/1.2 client core for constrained devices.
//!
//! The crate is the device-side protocol machinery and nothing else:
//! the CoAP codec lives in [`newt_msg`], the CBOR engine in
//! [`newt_cbor`], and this crate drives them — registration, updates,
//! bootstrap, observations & notifications, Send, block-wise
//! transfers, retransmission, queue mode — behind a single
//! cooperative [`Client::step`](client::Client::step) loop.
//!
//! ## Seams
//! The application supplies its environment through three traits:
//! - [`net::Transport`] — a non-blocking UDP/TCP byte pipe
//!   (`WouldBlock` is retried on the next step)
//! - [`dm::DataModel`] — the tree of LwM2M objects
//! - a clock: steps take plain milliseconds, produced from any
//!   [`time::Clock`]
//!
//! DTLS, configuration storage and the standard objects' contents stay
//! outside; the core reads Security/Server resources only through the
//! data-model seam.
//!
//! ## No allocator
//! Every table and buffer is capacity-bounded (`tinyvec`). The crate
//! is `no_std`-compatible; `std` (default) only widens the test
//! surface.

// docs
#![doc(html_root_url = "https://docs.rs/newt/0.1.0")]
#![cfg_attr(any(docsrs, feature = "docs"), feature(doc_cfg))]
// -
// deny
#![deny(missing_docs)]
#![cfg_attr(not(test), deny(unsafe_code))]
// -
// warnings
#![cfg_attr(not(test), warn(unreachable_pub))]
// -
// features
#![cfg_attr(not(feature = "std"), no_std)]

/// The cooperative client loop
pub mod client;

/// Runtime configuration
pub mod config;

/// The data-model seam
pub mod dm;

/// The exchange engine (one CoAP transaction at a time)
pub mod exchange;

/// Content-format codecs
pub mod io;

/// The transport seam
pub mod net;

/// Observations, attributes & notification gating
pub mod observe;

/// LwM2M URI paths
pub mod path;

/// Recognizing inbound CoAP messages as LwM2M operations
pub mod req;

/// Retry timing
pub mod retry;

/// The Send queue
pub mod send;

/// Registration & bootstrap sessions
pub mod session;

/// Bounded string rendering
pub mod strbuf;

/// Clocks & durations
pub mod time;

/// Resource values crossing the data-model seam
pub mod value;


pub use client::{Client, Step};
pub use config::Config;
pub use dm::{DataModel, DmError};
pub use net::{Transport, TransportState};
pub use path::UriPath;
pub use value::{InValue, ObjLink, OutRecord, OutValue};
