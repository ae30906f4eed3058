use core::fmt;

/// The reserved all-ones id meaning "no id at this level"
pub const ID_NONE: u16 = u16::MAX;

/// The four addressable levels of the LwM2M object tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
  /// `/oid`
  Object = 0,
  /// `/oid/iid`
  Instance = 1,
  /// `/oid/iid/rid`
  Resource = 2,
  /// `/oid/iid/rid/riid`
  ResourceInstance = 3,
}

/// An LwM2M URI path: up to four 16-bit ids addressing
/// Object / Instance / Resource / Resource-Instance. Zero ids is the
/// root path.
///
/// ```
/// use newt::path::{Level, UriPath};
///
/// let p = UriPath::resource(3, 0, 9);
/// assert!(p.is(Level::Resource));
/// assert!(p.has(Level::Instance));
/// assert_eq!(p.oid(), Some(3));
/// assert_eq!(UriPath::parse("/3/0/9"), Ok(p));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct UriPath {
  ids: [u16; 4],
  len: u8,
}

/// The string was not a strict `/N/N/N/N` path with ids below 65535
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadPath;

impl UriPath {
  /// The root path `/`
  pub const fn root() -> Self {
    Self { ids: [ID_NONE; 4],
           len: 0 }
  }

  /// `/oid`
  pub const fn object(oid: u16) -> Self {
    Self { ids: [oid, ID_NONE, ID_NONE, ID_NONE],
           len: 1 }
  }

  /// `/oid/iid`
  pub const fn instance(oid: u16, iid: u16) -> Self {
    Self { ids: [oid, iid, ID_NONE, ID_NONE],
           len: 2 }
  }

  /// `/oid/iid/rid`
  pub const fn resource(oid: u16, iid: u16, rid: u16) -> Self {
    Self { ids: [oid, iid, rid, ID_NONE],
           len: 3 }
  }

  /// `/oid/iid/rid/riid`
  pub const fn resource_instance(oid: u16, iid: u16, rid: u16, riid: u16) -> Self {
    Self { ids: [oid, iid, rid, riid],
           len: 4 }
  }

  /// Number of ids present
  pub fn len(&self) -> usize {
    usize::from(self.len)
  }

  /// Whether this is the root path
  pub fn is_root(&self) -> bool {
    self.len == 0
  }

  /// The ids present, in order
  pub fn ids(&self) -> &[u16] {
    &self.ids[..self.len()]
  }

  /// Whether an id exists at `level` (or deeper)
  pub fn has(&self, level: Level) -> bool {
    self.len() > level as usize
  }

  /// Whether `level` is exactly the deepest id
  pub fn is(&self, level: Level) -> bool {
    self.len() == level as usize + 1
  }

  /// The Object id, if present
  pub fn oid(&self) -> Option<u16> {
    self.ids().first().copied()
  }

  /// The Object Instance id, if present
  pub fn iid(&self) -> Option<u16> {
    self.ids().get(1).copied()
  }

  /// The Resource id, if present
  pub fn rid(&self) -> Option<u16> {
    self.ids().get(2).copied()
  }

  /// The Resource Instance id, if present
  pub fn riid(&self) -> Option<u16> {
    self.ids().get(3).copied()
  }

  /// Append one id; `None` when already 4 deep
  pub fn push(&self, id: u16) -> Option<Self> {
    if self.len() == 4 {
      None
    } else {
      let mut next = *self;
      next.ids[next.len()] = id;
      next.len += 1;
      Some(next)
    }
  }

  /// The path one level up (root stays root)
  pub fn parent(&self) -> Self {
    let mut up = *self;
    if up.len > 0 {
      up.len -= 1;
      up.ids[up.len as usize] = ID_NONE;
    }
    up
  }

  /// Whether `self` is `base` or lies beneath it
  pub fn starts_with(&self, base: &UriPath) -> bool {
    self.len() >= base.len() && self.ids()[..base.len()] == *base.ids()
  }

  /// Whether `self` lies outside the subtree rooted at `base`
  pub fn outside_base(&self, base: &UriPath) -> bool {
    !self.starts_with(base)
  }

  /// Number of leading ids shared with `other`
  pub fn common_prefix_len(&self, other: &UriPath) -> usize {
    self.ids()
        .iter()
        .zip(other.ids())
        .take_while(|(a, b)| a == b)
        .count()
  }

  /// Strict lexicographic order between registration records:
  /// `/1 < /1/1 < /2`
  pub fn increasing(prev: &UriPath, next: &UriPath) -> bool {
    let shared = prev.common_prefix_len(next);
    match (prev.ids().get(shared), next.ids().get(shared)) {
      | (Some(p), Some(n)) => p < n,
      | (None, Some(_)) => true,
      | _ => false,
    }
  }

  /// Parse a strict `/N[/N[/N[/N]]]` path; `"/"` is the root
  pub fn parse(s: &str) -> Result<Self, BadPath> {
    if s.is_empty() {
      return Err(BadPath);
    }
    if s == "/" {
      return Ok(Self::root());
    }

    let mut path = Self::root();
    let mut rest = s;
    while !rest.is_empty() {
      rest = rest.strip_prefix('/').ok_or(BadPath)?;
      let end = rest.find('/').unwrap_or(rest.len());
      let id = parse_id(&rest[..end])?;
      path = path.push(id).ok_or(BadPath)?;
      rest = &rest[end..];
    }
    Ok(path)
  }
}

fn parse_id(s: &str) -> Result<u16, BadPath> {
  if s.is_empty() || s.len() > 5 || s.bytes().any(|b| !b.is_ascii_digit()) {
    return Err(BadPath);
  }
  match s.parse::<u32>() {
    | Ok(id) if id < u32::from(ID_NONE) => Ok(id as u16),
    | _ => Err(BadPath),
  }
}

impl fmt::Display for UriPath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_root() {
      return write!(f, "/");
    }
    for id in self.ids() {
      write!(f, "/{}", id)?;
    }
    Ok(())
  }
}

impl fmt::Debug for UriPath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "UriPath({})", self)
  }
}
