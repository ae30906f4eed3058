//! The data-model seam.
//!
//! The core never owns LwM2M objects; it drives everything it needs —
//! server-initiated Read/Write/Execute/Create/Delete, the register
//! payload, discover listings, bootstrap validation — through
//! [`DataModel`]. Enumeration is index-based rather than
//! iterator-based so the register payload writer can suspend between
//! CoAP blocks and resume from a plain cursor.

use newt_msg::Code;

use crate::path::UriPath;
use crate::value::{InValue, OutValue};

/// Well-known object ids the core treats specially
pub mod oid {
  /// Security object (never registered, bootstrap-writable only)
  pub const SECURITY: u16 = 0;
  /// Server object
  pub const SERVER: u16 = 1;
  /// Access Control object
  pub const ACCESS_CONTROL: u16 = 2;
  /// Device object
  pub const DEVICE: u16 = 3;
  /// OSCORE object (never registered)
  pub const OSCORE: u16 = 21;
}

/// Resource ids inside the Security object (id 0)
pub mod security {
  /// Server URI
  pub const SERVER_URI: u16 = 0;
  /// Bootstrap-Server flag
  pub const BOOTSTRAP_SERVER: u16 = 1;
  /// Short Server ID
  pub const SSID: u16 = 10;
  /// Client Hold Off Time
  pub const CLIENT_HOLD_OFF: u16 = 11;
}

/// Resource ids inside the Server object (id 1)
pub mod server {
  /// Short Server ID
  pub const SSID: u16 = 0;
  /// Lifetime
  pub const LIFETIME: u16 = 1;
  /// Default Minimum Period
  pub const DEFAULT_PMIN: u16 = 2;
  /// Default Maximum Period
  pub const DEFAULT_PMAX: u16 = 3;
  /// Disable
  pub const DISABLE: u16 = 4;
  /// Disable Timeout
  pub const DISABLE_TIMEOUT: u16 = 5;
  /// Notification Storing
  pub const NOTIFICATION_STORING: u16 = 6;
  /// Binding
  pub const BINDING: u16 = 7;
  /// Registration Update Trigger
  pub const UPDATE_TRIGGER: u16 = 8;
  /// Bootstrap-Request Trigger
  pub const BOOTSTRAP_TRIGGER: u16 = 9;
  /// Mute Send
  pub const MUTE_SEND: u16 = 23;
  /// (1.2) Default notifications are Confirmable
  pub const DEFAULT_CON: u16 = 26;
}

/// Why a data-model operation was refused; maps onto the 4.xx/5.xx
/// code sent back to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmError {
  /// No such object/instance/resource
  NotFound,
  /// The operation does not apply to this target
  MethodNotAllowed,
  /// The payload or arguments were unusable
  BadRequest,
  /// The value type did not match the resource
  BadType,
  /// Anything else
  Internal,
}

impl DmError {
  /// The response code this error turns into
  pub fn code(&self) -> Code {
    match self {
      | DmError::NotFound => Code::NOT_FOUND,
      | DmError::MethodNotAllowed => Code::METHOD_NOT_ALLOWED,
      | DmError::BadRequest | DmError::BadType => Code::BAD_REQUEST,
      | DmError::Internal => Code::INTERNAL_SERVER_ERROR,
    }
  }
}

/// One object as listed in the register payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo<'a> {
  /// Object id
  pub oid: u16,
  /// Object version, when not the LwM2M default for that object
  pub version: Option<&'a str>,
}

/// One resource as listed in a Discover response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceInfo {
  /// Resource id
  pub rid: u16,
  /// Instance count for multiple-instance resources
  pub dim: Option<u16>,
}

/// The tree of LwM2M objects, seen from the protocol core.
///
/// Index arguments are positions in the implementor's stable ordering;
/// ids must be enumerated in increasing order (the register payload
/// requires it).
pub trait DataModel {
  /// Number of objects present
  fn object_count(&self) -> usize;

  /// The object at `index`
  fn object(&self, index: usize) -> Option<ObjectInfo<'_>>;

  /// Number of instances of `oid`
  fn instance_count(&self, oid: u16) -> usize;

  /// The instance id at `index` within `oid`
  fn instance(&self, oid: u16, index: usize) -> Option<u16>;

  /// Number of resources in `/oid/iid`
  fn resource_count(&self, oid: u16, iid: u16) -> usize;

  /// The resource at `index` within `/oid/iid`
  fn resource(&self, oid: u16, iid: u16, index: usize) -> Option<ResourceInfo>;

  /// The resource-instance id at `index` within a multiple-instance
  /// resource. Implementors with no multiple-instance resources can
  /// keep the default.
  fn resource_instance(&self, oid: u16, iid: u16, rid: u16, index: usize) -> Option<u16> {
    let _ = (oid, iid, rid, index);
    None
  }

  /// Read the value at a Resource or Resource-Instance path
  fn read(&self, path: &UriPath) -> Result<OutValue<'_>, DmError>;

  /// Write one (piece of a) value
  fn write(&mut self, path: &UriPath, value: &InValue) -> Result<(), DmError>;

  /// Execute a resource with the raw argument string
  fn execute(&mut self, path: &UriPath, args: &[u8]) -> Result<(), DmError>;

  /// Create an instance of `oid`, with the server-assigned id if any;
  /// yields the id actually created
  fn create(&mut self, oid: u16, iid: Option<u16>) -> Result<u16, DmError>;

  /// Delete the instance (or resource instance) at `path`
  fn delete(&mut self, path: &UriPath) -> Result<(), DmError>;
}

/// Convenience reads the sessions use for Security/Server resources
pub(crate) fn read_u32(dm: &dyn DataModel, path: &UriPath) -> Option<u32> {
  match dm.read(path) {
    | Ok(OutValue::Int(v)) if v >= 0 => Some(v as u32),
    | Ok(OutValue::Uint(v)) if v <= u64::from(u32::MAX) => Some(v as u32),
    | _ => None,
  }
}

pub(crate) fn read_bool(dm: &dyn DataModel, path: &UriPath) -> Option<bool> {
  match dm.read(path) {
    | Ok(OutValue::Bool(v)) => Some(v),
    | _ => None,
  }
}

pub(crate) fn read_u16(dm: &dyn DataModel, path: &UriPath) -> Option<u16> {
  read_u32(dm, path).filter(|v| *v <= u32::from(u16::MAX))
                    .map(|v| v as u16)
}
