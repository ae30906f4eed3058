//! `application/link-format` writers: the register payload and
//! Discover responses.
//!
//! Both are pull-model like the CBOR encoders — records render into a
//! small staging buffer and drain out one CoAP block at a time, with a
//! plain cursor into the data model marking where to resume.

use core::fmt::Write;

use crate::dm::{oid, DataModel};
use crate::io::buf::Staging;
use crate::io::IoError;
use crate::observe::Attributes;
use crate::path::{Level, UriPath};
use crate::strbuf::StrBuf;

fn stage_str(staging: &mut Staging, s: &str) -> Result<(), IoError> {
  if staging.space().len() < s.len() {
    return Err(IoError::InputArg);
  }
  staging.space()[..s.len()].copy_from_slice(s.as_bytes());
  staging.commit(s.len());
  Ok(())
}

fn stage_link(staging: &mut Staging,
              path: &UriPath,
              version: Option<&str>,
              dim: Option<u16>,
              first: bool)
              -> Result<(), IoError> {
  let mut text = StrBuf::<64>::new();
  let lead = if first { "" } else { "," };
  write!(text, "{}<{}>", lead, path).map_err(|_| IoError::InputArg)?;
  if let Some(dim) = dim {
    if !path.is(Level::Resource) {
      return Err(IoError::InputArg);
    }
    write!(text, ";dim={}", dim).map_err(|_| IoError::InputArg)?;
  }
  if let Some(version) = version {
    if !is_valid_version(version) {
      return Err(IoError::InputArg);
    }
    write!(text, ";ver={}", version).map_err(|_| IoError::InputArg)?;
  }
  stage_str(staging, &text)?;
  staging.finish_record(None);
  Ok(())
}

fn is_valid_version(v: &str) -> bool {
  // "major.minor", one or more digits each
  match v.split_once('.') {
    | Some((major, minor)) => {
      !major.is_empty()
      && !minor.is_empty()
      && major.bytes().all(|b| b.is_ascii_digit())
      && minor.bytes().all(|b| b.is_ascii_digit())
    },
    | None => false,
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegisterCursor {
  Object { index: usize },
  Instance { index: usize, inst: usize },
  Done,
}

/// The register payload: every Object (with its version, when one is
/// declared) and every Instance, as increasing `</oid>` / `</oid/iid>`
/// records — excluding Security and OSCORE, which are never shown to
/// a management server.
#[derive(Debug)]
pub struct RegisterPayload {
  staging: Staging,
  cursor: RegisterCursor,
  first: bool,
}

impl Default for RegisterPayload {
  fn default() -> Self {
    Self::new()
  }
}

impl RegisterPayload {
  /// A payload positioned at the first object
  pub fn new() -> Self {
    Self { staging: Staging::default(),
           cursor: RegisterCursor::Object { index: 0 },
           first: true }
  }

  /// Copy the next stretch of payload; yields `(copied, more)`.
  ///
  /// The data model must enumerate stably between calls — the cursor
  /// is a plain index so the payload can span CoAP blocks.
  pub fn get_payload(&mut self,
                     dm: &dyn DataModel,
                     out: &mut [u8])
                     -> Result<(usize, bool), IoError> {
    let mut copied = 0;
    loop {
      copied += self.staging.drain_staged(&mut out[copied..]);
      if self.staging.remaining > 0 {
        return Ok((copied, true));
      }
      self.staging.reset();

      match self.cursor {
        | RegisterCursor::Done => return Ok((copied, false)),
        | RegisterCursor::Object { index } => {
          match dm.object(index) {
            | None => {
              self.cursor = RegisterCursor::Done;
            },
            | Some(info) if matches!(info.oid, oid::SECURITY | oid::OSCORE) => {
              self.cursor = RegisterCursor::Object { index: index + 1 };
            },
            | Some(info) => {
              stage_link(&mut self.staging,
                         &UriPath::object(info.oid),
                         info.version,
                         None,
                         core::mem::replace(&mut self.first, false))?;
              self.cursor = RegisterCursor::Instance { index, inst: 0 };
            },
          }
        },
        | RegisterCursor::Instance { index, inst } => {
          let info = dm.object(index).ok_or(IoError::Logic)?;
          match dm.instance(info.oid, inst) {
            | None => {
              self.cursor = RegisterCursor::Object { index: index + 1 };
            },
            | Some(iid) => {
              stage_link(&mut self.staging,
                         &UriPath::instance(info.oid, iid),
                         None,
                         None,
                         false)?;
              self.cursor = RegisterCursor::Instance { index, inst: inst + 1 };
            },
          }
        },
      }
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiscoverCursor {
  Target,
  Instance { inst: usize },
  Resource { inst: usize, res: usize },
  Done,
}

/// A Discover response for one target path: the target itself (with
/// its attached attributes), its instances, and their resources with
/// `dim` on multiple-instance ones. `depth` bounds how far below the
/// target the listing goes.
#[derive(Debug)]
pub struct DiscoverPayload {
  staging: Staging,
  target: UriPath,
  depth: u8,
  attrs: Attributes,
  cursor: DiscoverCursor,
  first: bool,
}

impl DiscoverPayload {
  /// List `target` and up to `depth` levels beneath it, annotating
  /// the target with `attrs`
  pub fn new(target: UriPath, depth: Option<u8>, attrs: Attributes) -> Self {
    let default_depth = match target.len() {
      // object discover descends to resources by default
      | 1 => 2,
      | _ => 1,
    };
    Self { staging: Staging::default(),
           target,
           depth: depth.unwrap_or(default_depth),
           attrs,
           cursor: DiscoverCursor::Target,
           first: true }
  }

  /// Copy the next stretch of payload; yields `(copied, more)`.
  pub fn get_payload(&mut self,
                     dm: &dyn DataModel,
                     out: &mut [u8])
                     -> Result<(usize, bool), IoError> {
    let mut copied = 0;
    loop {
      copied += self.staging.drain_staged(&mut out[copied..]);
      if self.staging.remaining > 0 {
        return Ok((copied, true));
      }
      self.staging.reset();

      match self.cursor {
        | DiscoverCursor::Done => return Ok((copied, false)),
        | DiscoverCursor::Target => {
          self.stage_target()?;
          self.cursor = if self.depth == 0 {
            DiscoverCursor::Done
          } else {
            match self.target.len() {
              | 1 => DiscoverCursor::Instance { inst: 0 },
              | 2 => DiscoverCursor::Resource { inst: usize::MAX, res: 0 },
              | _ => DiscoverCursor::Done,
            }
          };
        },
        | DiscoverCursor::Instance { inst } => {
          let oid = self.target.oid().ok_or(IoError::Logic)?;
          match dm.instance(oid, inst) {
            | None => self.cursor = DiscoverCursor::Done,
            | Some(iid) => {
              stage_link(&mut self.staging,
                         &UriPath::instance(oid, iid),
                         None,
                         None,
                         false)?;
              self.cursor = if self.depth >= 2 {
                DiscoverCursor::Resource { inst, res: 0 }
              } else {
                DiscoverCursor::Instance { inst: inst + 1 }
              };
            },
          }
        },
        | DiscoverCursor::Resource { inst, res } => {
          let oid = self.target.oid().ok_or(IoError::Logic)?;
          // usize::MAX marks "the instance named by the target itself"
          let iid = if inst == usize::MAX {
            self.target.iid().ok_or(IoError::Logic)?
          } else {
            match dm.instance(oid, inst) {
              | Some(iid) => iid,
              | None => {
                self.cursor = DiscoverCursor::Done;
                continue;
              },
            }
          };
          match dm.resource(oid, iid, res) {
            | None if inst == usize::MAX => self.cursor = DiscoverCursor::Done,
            | None => self.cursor = DiscoverCursor::Instance { inst: inst + 1 },
            | Some(info) => {
              stage_link(&mut self.staging,
                         &UriPath::resource(oid, iid, info.rid),
                         None,
                         info.dim,
                         false)?;
              self.cursor = DiscoverCursor::Resource { inst, res: res + 1 };
            },
          }
        },
      }
    }
  }

  fn stage_target(&mut self) -> Result<(), IoError> {
    let mut text = StrBuf::<{ buf_len() }>::new();
    write!(text, "<{}>", self.target).map_err(|_| IoError::InputArg)?;
    self.attrs
        .write_link_params(&mut text)
        .map_err(|_| IoError::InputArg)?;
    let first = core::mem::replace(&mut self.first, false);
    debug_assert!(first);
    stage_str(&mut self.staging, &text)?;
    self.staging.finish_record(None);
    Ok(())
  }
}

const fn buf_len() -> usize {
  crate::io::buf::STAGING_LEN
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test::TestDm;

  fn collect(payload: &mut RegisterPayload, dm: &dyn DataModel) -> Vec<u8> {
    let mut out = vec![0u8; 512];
    let mut total = 0;
    loop {
      let (n, more) = payload.get_payload(dm, &mut out[total..]).unwrap();
      total += n;
      if !more {
        out.truncate(total);
        return out;
      }
    }
  }

  #[test]
  fn register_payload_lists_objects_and_instances() {
    let dm = TestDm::default();
    let mut payload = RegisterPayload::new();
    assert_eq!(collect(&mut payload, &dm),
               b"</1>;ver=1.2,</1/1>,</3>,</3/0>");
  }

  #[test]
  fn register_payload_resumes_across_tiny_buffers() {
    let dm = TestDm::default();
    let mut payload = RegisterPayload::new();
    let mut collected = Vec::new();
    let mut out = [0u8; 7];
    loop {
      let (n, more) = payload.get_payload(&dm, &mut out).unwrap();
      collected.extend_from_slice(&out[..n]);
      if !more {
        break;
      }
    }
    assert_eq!(collected, b"</1>;ver=1.2,</1/1>,</3>,</3/0>");
  }

  #[test]
  fn version_grammar() {
    assert!(is_valid_version("1.2"));
    assert!(is_valid_version("10.0"));
    assert!(!is_valid_version("1"));
    assert!(!is_valid_version("1."));
    assert!(!is_valid_version("a.b"));
  }
}
