//! Observations: the registry of what the server watches, the
//! attribute sets that gate notifications, and the pmin/pmax/gt/lt/st
//! decision logic.
//!
//! Timestamps here are plain milliseconds since the client clock's
//! epoch — the registry itself never talks to a clock.

use core::fmt::Write as _;

use newt_msg::opt::num;
use newt_msg::{ContentFormat, Options, Token};
use tinyvec::ArrayVec;

use crate::path::UriPath;
use crate::strbuf::StrBuf;

/// Bound on concurrently tracked observations
pub const MAX_OBSERVATIONS: usize = 8;

/// Bound on paths carrying written attributes
pub const MAX_ATTR_ENTRIES: usize = 8;

/// One notification attribute: absent, explicitly unset (`pmin=`),
/// or set.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Attr<T> {
  /// Nothing written at this level
  #[default]
  Absent,
  /// Written with no value: clears the inherited value
  Unset,
  /// Written with a value
  Set(T),
}

impl<T: Copy> Attr<T> {
  /// The value, if set
  pub fn value(&self) -> Option<T> {
    match self {
      | Attr::Set(v) => Some(*v),
      | _ => None,
    }
  }

  // child overrides parent; an explicit unset hides the parent too
  fn over(self, parent: Attr<T>) -> Attr<T> {
    match self {
      | Attr::Absent => parent,
      | other => other,
    }
  }

  fn apply(&mut self, written: Attr<T>) {
    match written {
      | Attr::Absent => {},
      | Attr::Unset => *self = Attr::Absent,
      | set => *self = set,
    }
  }
}

/// The `<NOTIFICATION>` attribute set (plus Discover's `depth`),
/// decoded from Uri-Query and inherited object → instance → resource.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Attributes {
  /// Minimum period, seconds
  pub pmin: Attr<u32>,
  /// Maximum period, seconds
  pub pmax: Attr<u32>,
  /// Minimum evaluation period, seconds
  pub epmin: Attr<u32>,
  /// Maximum evaluation period, seconds
  pub epmax: Attr<u32>,
  /// Greater-than threshold
  pub gt: Attr<f64>,
  /// Less-than threshold
  pub lt: Attr<f64>,
  /// Step threshold
  pub st: Attr<f64>,
  /// (1.2) notify on rising (1) / falling (0) edge only
  pub edge: Attr<u32>,
  /// (1.2) per-path Confirmable override
  pub con: Attr<u32>,
  /// (1.2) maximum historical queue
  pub hqmax: Attr<u32>,
  /// Discover depth
  pub depth: Attr<u32>,
}

fn parse_u32(s: &str) -> Option<u32> {
  if s.is_empty() || s.len() > 10 || s.bytes().any(|b| !b.is_ascii_digit()) {
    return None;
  }
  s.parse().ok()
}

fn parse_f64(s: &str) -> Option<f64> {
  if s.is_empty() {
    return None;
  }
  s.parse().ok()
}

/// The Uri-Query held an attribute this client cannot parse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadAttributes;

impl Attributes {
  /// Decode attributes from a request's Uri-Query options.
  ///
  /// `pmin=5` sets, `pmin=` and bare `pmin` unset, anything
  /// unparseable is an error. Unknown query arguments are ignored.
  pub fn decode(opts: &Options) -> Result<Self, BadAttributes> {
    let mut attrs = Attributes::default();
    let mut iter = 0;

    while let Some(arg) = opts.iter_get(num::URI_QUERY, &mut iter) {
      let arg = core::str::from_utf8(arg).map_err(|_| BadAttributes)?;
      let (name, value) = match arg.split_once('=') {
        | Some((name, value)) => (name, Some(value).filter(|v| !v.is_empty())),
        | None => (arg, None),
      };

      fn store_u32(slot: &mut Attr<u32>, value: Option<&str>)
                   -> Result<(), BadAttributes> {
        *slot = match value {
          | None => Attr::Unset,
          | Some(v) => Attr::Set(parse_u32(v).ok_or(BadAttributes)?),
        };
        Ok(())
      }
      fn store_f64(slot: &mut Attr<f64>, value: Option<&str>)
                   -> Result<(), BadAttributes> {
        *slot = match value {
          | None => Attr::Unset,
          | Some(v) => Attr::Set(parse_f64(v).ok_or(BadAttributes)?),
        };
        Ok(())
      }

      match name {
        | "pmin" => store_u32(&mut attrs.pmin, value)?,
        | "pmax" => store_u32(&mut attrs.pmax, value)?,
        | "epmin" => store_u32(&mut attrs.epmin, value)?,
        | "epmax" => store_u32(&mut attrs.epmax, value)?,
        | "gt" => store_f64(&mut attrs.gt, value)?,
        | "lt" => store_f64(&mut attrs.lt, value)?,
        | "st" => store_f64(&mut attrs.st, value)?,
        | "edge" => store_u32(&mut attrs.edge, value)?,
        | "con" => store_u32(&mut attrs.con, value)?,
        | "hqmax" => store_u32(&mut attrs.hqmax, value)?,
        | "depth" => store_u32(&mut attrs.depth, value)?,
        | _ => {},
      }
    }
    Ok(attrs)
  }

  /// `self` layered over `parent`
  pub fn over(&self, parent: &Attributes) -> Attributes {
    Attributes { pmin: self.pmin.over(parent.pmin),
                 pmax: self.pmax.over(parent.pmax),
                 epmin: self.epmin.over(parent.epmin),
                 epmax: self.epmax.over(parent.epmax),
                 gt: self.gt.over(parent.gt),
                 lt: self.lt.over(parent.lt),
                 st: self.st.over(parent.st),
                 edge: self.edge.over(parent.edge),
                 con: self.con.over(parent.con),
                 hqmax: self.hqmax.over(parent.hqmax),
                 depth: self.depth.over(parent.depth) }
  }

  /// Apply a Write-Attributes payload onto this stored set
  pub fn apply(&mut self, written: &Attributes) {
    self.pmin.apply(written.pmin);
    self.pmax.apply(written.pmax);
    self.epmin.apply(written.epmin);
    self.epmax.apply(written.epmax);
    self.gt.apply(written.gt);
    self.lt.apply(written.lt);
    self.st.apply(written.st);
    self.edge.apply(written.edge);
    self.con.apply(written.con);
    self.hqmax.apply(written.hqmax);
  }

  /// Render the set attributes as `;name=value` link-format params
  pub fn write_link_params<const N: usize>(&self,
                                           out: &mut StrBuf<N>)
                                           -> core::fmt::Result {
    if let Some(v) = self.pmin.value() {
      write!(out, ";pmin={}", v)?;
    }
    if let Some(v) = self.pmax.value() {
      write!(out, ";pmax={}", v)?;
    }
    if let Some(v) = self.gt.value() {
      write!(out, ";gt={}", v)?;
    }
    if let Some(v) = self.lt.value() {
      write!(out, ";lt={}", v)?;
    }
    if let Some(v) = self.st.value() {
      write!(out, ";st={}", v)?;
    }
    Ok(())
  }
}

/// Attributes written to data-model paths, with level inheritance
#[derive(Debug, Default)]
pub struct AttrStore {
  entries: ArrayVec<[(UriPath, Attributes); MAX_ATTR_ENTRIES]>,
}

/// The attribute table is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrStoreFull;

impl AttrStore {
  /// Apply a Write-Attributes at `path`
  pub fn write(&mut self, path: &UriPath, written: &Attributes) -> Result<(), AttrStoreFull> {
    if let Some((_, stored)) = self.entries.iter_mut().find(|(p, _)| p == path) {
      stored.apply(written);
      return Ok(());
    }
    if self.entries.len() == MAX_ATTR_ENTRIES {
      return Err(AttrStoreFull);
    }
    let mut stored = Attributes::default();
    stored.apply(written);
    self.entries.push((*path, stored));
    Ok(())
  }

  /// The attributes stored exactly at `path`
  pub fn at(&self, path: &UriPath) -> Attributes {
    self.entries
        .iter()
        .find(|(p, _)| p == path)
        .map(|(_, a)| *a)
        .unwrap_or_default()
  }

  /// Attributes effective at `path`: `base` (the Server object
  /// defaults) overridden level by level down the tree
  pub fn effective(&self, path: &UriPath, base: &Attributes) -> Attributes {
    let mut merged = *base;
    let mut prefix = UriPath::root();
    for id in path.ids() {
      prefix = match prefix.push(*id) {
        | Some(next) => next,
        | None => break,
      };
      merged = self.at(&prefix).over(&merged);
    }
    merged
  }
}

/// One active observation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Observation {
  /// The token the observation was established with; notifications
  /// reuse it
  pub token: Token,
  /// What is observed
  pub path: UriPath,
  /// The Accept of the establishing request
  pub format: Option<ContentFormat>,
  /// 24-bit Observe sequence number of the last notification
  pub seq: u32,
  /// When the last notification went out (ms since clock epoch)
  pub last_sent_ms: u64,
  /// The numeric value last notified, for gt/lt/st comparison
  pub last_value: Option<f64>,
  /// A covered path changed since the last notification
  pub pending: bool,
  /// Established by Observe-Composite
  pub composite: bool,
}

impl Observation {
  /// Advance and return the next Observe sequence number
  pub fn next_seq(&mut self) -> u32 {
    self.seq = (self.seq + 1) & newt_msg::opt::observe::MAX_OBSERVE_SEQ;
    self.seq
  }
}

/// Why a notification fires (or when it will)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyVerdict {
  /// Send one now
  Due,
  /// Nothing yet; next decision point in ms-since-epoch
  At(u64),
  /// Nothing, and no timer armed
  Idle,
}

/// Decide whether `obs` owes a notification at `now_ms`.
///
/// `value` is the current numeric value of the observed resource when
/// there is one (threshold attributes only apply to numbers).
pub fn gate(obs: &mut Observation,
            eff: &Attributes,
            now_ms: u64,
            value: Option<f64>)
            -> NotifyVerdict {
  let pmax_deadline = eff.pmax
                         .value()
                         .map(|pmax| obs.last_sent_ms + u64::from(pmax) * 1000);

  if let Some(deadline) = pmax_deadline {
    if now_ms >= deadline {
      return NotifyVerdict::Due;
    }
  }

  if obs.pending {
    if let Some(pmin) = eff.pmin.value() {
      let earliest = obs.last_sent_ms + u64::from(pmin) * 1000;
      if now_ms < earliest {
        return NotifyVerdict::At(match pmax_deadline {
                                   | Some(p) => p.min(earliest),
                                   | None => earliest,
                                 });
      }
    }

    if crosses_threshold(eff, obs.last_value, value) {
      return NotifyVerdict::Due;
    }
    // the change did not cross any configured threshold
    obs.pending = false;
  }

  match pmax_deadline {
    | Some(deadline) => NotifyVerdict::At(deadline),
    | None => NotifyVerdict::Idle,
  }
}

fn crosses_threshold(eff: &Attributes, last: Option<f64>, now: Option<f64>) -> bool {
  let thresholds_configured =
    eff.gt.value().is_some() || eff.lt.value().is_some() || eff.st.value().is_some();
  if !thresholds_configured {
    return true;
  }
  let (Some(last), Some(now)) = (last, now) else {
    // non-numeric values cannot be gated by thresholds
    return true;
  };

  let crossed = |limit: f64| (last <= limit) != (now <= limit);
  eff.gt.value().map(crossed).unwrap_or(false)
  || eff.lt.value().map(crossed).unwrap_or(false)
  || eff.st.value().map(|st| (now - last).abs() >= st).unwrap_or(false)
}

/// The bounded observation registry, keyed by token.
#[derive(Debug, Default)]
pub struct Observations {
  entries: ArrayVec<[Observation; MAX_OBSERVATIONS]>,
}

/// The observation table is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservationsFull;

impl Observations {
  /// Establish an observation, replacing any existing one at the same
  /// path
  pub fn observe(&mut self,
                 token: Token,
                 path: UriPath,
                 format: Option<ContentFormat>,
                 now_ms: u64,
                 value: Option<f64>)
                 -> Result<&mut Observation, ObservationsFull> {
    self.entries.retain(|o| o.path != path);
    if self.entries.len() == MAX_OBSERVATIONS {
      return Err(ObservationsFull);
    }
    self.entries.push(Observation { token,
                                    path,
                                    format,
                                    seq: 0,
                                    last_sent_ms: now_ms,
                                    last_value: value,
                                    pending: false,
                                    composite: false });
    Ok(self.entries.last_mut().unwrap_or_else(|| unreachable!()))
  }

  /// Remove the observation established with `token`
  pub fn cancel(&mut self, token: &Token) -> Option<Observation> {
    let at = self.entries.iter().position(|o| o.token == *token)?;
    Some(self.entries.remove(at))
  }

  /// The observation established with `token`
  pub fn by_token(&mut self, token: &Token) -> Option<&mut Observation> {
    self.entries.iter_mut().find(|o| o.token == *token)
  }

  /// Flag every observation whose subtree overlaps `path`
  pub fn mark_changed(&mut self, path: &UriPath) {
    for obs in self.entries.iter_mut() {
      if path.starts_with(&obs.path) || obs.path.starts_with(path) {
        obs.pending = true;
      }
    }
  }

  /// Iterate over the active observations
  pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Observation> + '_ {
    self.entries.iter_mut()
  }

  /// Number of active observations
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  /// Whether nothing is observed
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Drop everything (a new registration invalidates observations)
  pub fn clear(&mut self) {
    self.entries.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn opts_with_query(args: &[&str]) -> Options {
    let mut opts = Options::new();
    for arg in args {
      opts.add_str(num::URI_QUERY, arg).unwrap();
    }
    opts
  }

  #[test]
  fn decode_set_and_unset_forms() {
    let attrs =
      Attributes::decode(&opts_with_query(&["pmin=5", "pmax=", "gt=99.5",
                                            "con=1"])).unwrap();
    assert_eq!(attrs.pmin, Attr::Set(5));
    assert_eq!(attrs.pmax, Attr::Unset);
    assert_eq!(attrs.gt, Attr::Set(99.5));
    assert_eq!(attrs.con, Attr::Set(1));
    assert_eq!(attrs.lt, Attr::Absent);

    assert!(Attributes::decode(&opts_with_query(&["pmin=abc"])).is_err());
  }

  #[test]
  fn inheritance_and_unset() {
    let mut store = AttrStore::default();
    store.write(&UriPath::object(3),
                &Attributes { pmin: Attr::Set(10),
                              pmax: Attr::Set(300),
                              ..Default::default() })
         .unwrap();
    store.write(&UriPath::resource(3, 0, 9),
                &Attributes { pmin: Attr::Set(2),
                              pmax: Attr::Unset,
                              ..Default::default() })
         .unwrap();

    let eff = store.effective(&UriPath::resource(3, 0, 9),
                              &Attributes::default());
    assert_eq!(eff.pmin.value(), Some(2));
    // resource-level unset hides the object-level pmax
    assert_eq!(eff.pmax.value(), None);

    let sibling = store.effective(&UriPath::resource(3, 0, 1),
                                  &Attributes::default());
    assert_eq!(sibling.pmin.value(), Some(10));
    assert_eq!(sibling.pmax.value(), Some(300));
  }

  #[test]
  fn pmin_defers_pmax_fires() {
    let mut obs = Observation { last_sent_ms: 0,
                                pending: true,
                                ..Default::default() };
    let eff = Attributes { pmin: Attr::Set(100),
                           pmax: Attr::Set(300),
                           ..Default::default() };

    // too early: blocked by pmin
    assert_eq!(gate(&mut obs, &eff, 50_000, None),
               NotifyVerdict::At(100_000));
    // pmin elapsed, change pending, no thresholds: due
    assert_eq!(gate(&mut obs, &eff, 101_000, None), NotifyVerdict::Due);

    // nothing pending: pmax timer runs
    obs.pending = false;
    obs.last_sent_ms = 101_000;
    assert_eq!(gate(&mut obs, &eff, 150_000, None),
               NotifyVerdict::At(401_000));
    assert_eq!(gate(&mut obs, &eff, 401_000, None), NotifyVerdict::Due);
  }

  #[test]
  fn thresholds_gate_numeric_changes() {
    let eff = Attributes { gt: Attr::Set(500.0),
                           ..Default::default() };
    let mut obs = Observation { pending: true,
                                last_value: Some(800.0),
                                ..Default::default() };

    // 800 -> 200 crosses gt=500 downward
    assert_eq!(gate(&mut obs, &eff, 1000, Some(200.0)), NotifyVerdict::Due);

    // 200 -> 300 does not cross
    obs.pending = true;
    obs.last_value = Some(200.0);
    assert_eq!(gate(&mut obs, &eff, 2000, Some(300.0)), NotifyVerdict::Idle);
    assert!(!obs.pending);
  }

  #[test]
  fn step_threshold() {
    let eff = Attributes { st: Attr::Set(10.0),
                           ..Default::default() };
    let mut obs = Observation { pending: true,
                                last_value: Some(20.0),
                                ..Default::default() };
    assert_eq!(gate(&mut obs, &eff, 0, Some(25.0)), NotifyVerdict::Idle);
    obs.pending = true;
    assert_eq!(gate(&mut obs, &eff, 0, Some(31.0)), NotifyVerdict::Due);
  }

  #[test]
  fn registry_replaces_same_path() {
    let mut obs = Observations::default();
    obs.observe(Token::opaque(&[1]), UriPath::resource(3, 0, 9), None, 0, None)
       .unwrap();
    obs.observe(Token::opaque(&[2]), UriPath::resource(3, 0, 9), None, 0, None)
       .unwrap();
    assert_eq!(obs.len(), 1);
    assert!(obs.by_token(&Token::opaque(&[1])).is_none());
    assert!(obs.by_token(&Token::opaque(&[2])).is_some());

    assert!(obs.cancel(&Token::opaque(&[2])).is_some());
    assert!(obs.is_empty());
  }

  #[test]
  fn change_marking_covers_subtrees_both_ways() {
    let mut obs = Observations::default();
    obs.observe(Token::opaque(&[1]), UriPath::instance(3, 0), None, 0, None)
       .unwrap();
    obs.mark_changed(&UriPath::resource(3, 0, 9));
    assert!(obs.by_token(&Token::opaque(&[1])).unwrap().pending);

    let mut obs = Observations::default();
    obs.observe(Token::opaque(&[1]), UriPath::resource(3, 0, 9), None, 0, None)
       .unwrap();
    obs.mark_changed(&UriPath::instance(3, 0));
    assert!(obs.by_token(&Token::opaque(&[1])).unwrap().pending);

    let mut obs = Observations::default();
    obs.observe(Token::opaque(&[1]), UriPath::resource(3, 0, 9), None, 0, None)
       .unwrap();
    obs.mark_changed(&UriPath::resource(3, 1, 9));
    assert!(!obs.by_token(&Token::opaque(&[1])).unwrap().pending);
  }

  #[test]
  fn seq_wraps_at_24_bits() {
    let mut obs = Observation { seq: (1 << 24) - 1,
                                ..Default::default() };
    assert_eq!(obs.next_seq(), 0);
    assert_eq!(obs.next_seq(), 1);
  }
}
