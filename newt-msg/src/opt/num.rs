//! The option vocabulary an LwM2M client speaks.
//!
//! Numbers from [RFC7252#section-12.2], [RFC7641], [RFC7959] and the
//! RFC 8323 signaling registries. Signaling numbers are only meaningful
//! inside 7.xx messages and reuse small values.
//!
//! [RFC7252#section-12.2]: https://datatracker.ietf.org/doc/html/rfc7252#section-12.2
//! [RFC7641]: https://datatracker.ietf.org/doc/html/rfc7641
//! [RFC7959]: https://datatracker.ietf.org/doc/html/rfc7959

use super::OptNumber;

/// If-Match
pub const IF_MATCH: OptNumber = OptNumber(1);
/// Uri-Host
pub const URI_HOST: OptNumber = OptNumber(3);
/// ETag
pub const ETAG: OptNumber = OptNumber(4);
/// If-None-Match
pub const IF_NONE_MATCH: OptNumber = OptNumber(5);
/// Observe (RFC 7641)
pub const OBSERVE: OptNumber = OptNumber(6);
/// Uri-Port
pub const URI_PORT: OptNumber = OptNumber(7);
/// Location-Path
pub const LOCATION_PATH: OptNumber = OptNumber(8);
/// OSCORE (RFC 8613)
pub const OSCORE: OptNumber = OptNumber(9);
/// Uri-Path
pub const URI_PATH: OptNumber = OptNumber(11);
/// Content-Format
pub const CONTENT_FORMAT: OptNumber = OptNumber(12);
/// Max-Age
pub const MAX_AGE: OptNumber = OptNumber(14);
/// Uri-Query
pub const URI_QUERY: OptNumber = OptNumber(15);
/// Accept
pub const ACCEPT: OptNumber = OptNumber(17);
/// Location-Query
pub const LOCATION_QUERY: OptNumber = OptNumber(20);
/// Block2 (RFC 7959)
pub const BLOCK2: OptNumber = OptNumber(23);
/// Block1 (RFC 7959)
pub const BLOCK1: OptNumber = OptNumber(27);
/// Proxy-Uri
pub const PROXY_URI: OptNumber = OptNumber(35);
/// Proxy-Scheme
pub const PROXY_SCHEME: OptNumber = OptNumber(39);
/// Size1
pub const SIZE1: OptNumber = OptNumber(60);

/// CSM Max-Message-Size (RFC 8323, inside 7.01)
pub const MAX_MESSAGE_SIZE: OptNumber = OptNumber(2);
/// CSM Block-Wise-Transfer capability (RFC 8323, inside 7.01)
pub const BLOCK_WISE_TRANSFER: OptNumber = OptNumber(4);
/// Ping/Pong Custody (RFC 8323, inside 7.02/7.03)
pub const CUSTODY: OptNumber = OptNumber(2);
