//! The Send queue: client-initiated reporting (POST `/dp`).
//!
//! A bounded FIFO of pending requests. A request is either queued or
//! currently driving the exchange, never both; completion is reported
//! through the request's callback with the id assigned at enqueue
//! time.

use newt_msg::{Code, ContentFormat};
use tinyvec::ArrayVec;

use crate::path::Level;
use crate::value::OutRecord;

/// Bound on queued Send requests
pub const MAX_QUEUED_SENDS: usize = 4;

/// A client-assigned Send request id: monotonically increasing,
/// wrapping past 65535 and skipping the reserved 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SendId(pub u16);

impl SendId {
  /// The reserved "every request" id used by
  /// [`SendQueue::abort_all`]
  pub const ALL: SendId = SendId(0);
}

/// How a Send request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
  /// 2.04 from the server
  Success,
  /// An error response; the code says which
  Rejected(Code),
  /// Aborted locally before (or while) being sent
  Abort,
  /// The exchange timed out
  Timeout,
}

/// Told when a Send request finishes, from whichever call finished it
pub trait SendCompletion {
  /// The request `id` ended with `result`
  fn completed(&self, id: SendId, result: SendResult);
}

/// Why a Send request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
  /// The queue holds [`MAX_QUEUED_SENDS`] requests already
  Full,
  /// The Server object's Mute Send resource is set
  Muted,
  /// Empty record list, or a record above resource level
  InvalidRecords,
}

/// One queued request
#[derive(Debug, Clone, Copy, Default)]
pub struct SendRequest<'a> {
  /// The assigned id
  pub id: u16,
  /// SenML+CBOR or LwM2M+CBOR
  pub format: Option<ContentFormat>,
  /// The records to report (borrowed for the life of the request)
  pub records: Option<&'a [OutRecord<'a>]>,
  /// Completion callback
  pub completion: Option<&'a dyn SendCompletion>,
}

impl<'c> core::fmt::Debug for (dyn SendCompletion + 'c) {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    write!(f, "SendCompletion")
  }
}

/// The FIFO itself.
#[derive(Debug, Default)]
pub struct SendQueue<'a> {
  entries: ArrayVec<[SendRequest<'a>; MAX_QUEUED_SENDS]>,
  next_id: u16,
  /// id of the request currently driving the exchange, if any
  in_flight: Option<SendId>,
}

impl<'a> SendQueue<'a> {
  /// An empty queue; the first id handed out is 1
  pub fn new() -> Self {
    SendQueue { entries: ArrayVec::new(),
                next_id: 1,
                in_flight: None }
  }

  fn alloc_id(&mut self) -> SendId {
    let id = SendId(self.next_id);
    self.next_id = match self.next_id.wrapping_add(1) {
      | 0 => 1,
      | n => n,
    };
    id
  }

  /// Enqueue a request; yields the assigned id.
  pub fn new_request(&mut self,
                     records: &'a [OutRecord<'a>],
                     format: Option<ContentFormat>,
                     completion: Option<&'a dyn SendCompletion>,
                     muted: bool)
                     -> Result<SendId, SendError> {
    if muted {
      return Err(SendError::Muted);
    }
    if records.is_empty()
       || records.iter().any(|r| !r.path.has(Level::Resource))
    {
      return Err(SendError::InvalidRecords);
    }
    if self.entries.len() == MAX_QUEUED_SENDS {
      return Err(SendError::Full);
    }

    let id = self.alloc_id();
    self.entries.push(SendRequest { id: id.0,
                                    format,
                                    records: Some(records),
                                    completion });
    Ok(id)
  }

  /// The request that should drive the exchange next
  pub fn head(&self) -> Option<&SendRequest<'a>> {
    self.entries.first()
  }

  /// Mark the head request as handed to the exchange
  pub fn mark_in_flight(&mut self) {
    self.in_flight = self.entries.first().map(|e| SendId(e.id));
  }

  /// The id driving the exchange, if any
  pub fn in_flight(&self) -> Option<SendId> {
    self.in_flight
  }

  /// Finish the in-flight request: pop it and run its completion
  pub fn complete_in_flight(&mut self, result: SendResult) {
    if let Some(id) = self.in_flight.take() {
      if let Some(at) = self.entries.iter().position(|e| e.id == id.0) {
        let entry = self.entries.remove(at);
        if let Some(completion) = entry.completion {
          completion.completed(id, result);
        }
      }
    }
  }

  /// Abort one request (or every request with [`SendId::ALL`]).
  ///
  /// Yields whether the aborted request was in flight — the caller
  /// must then terminate the exchange.
  pub fn abort(&mut self, id: SendId) -> bool {
    if id == SendId::ALL {
      let was_in_flight = self.in_flight.take().is_some();
      while let Some(entry) = self.entries.first().copied() {
        self.entries.remove(0);
        if let Some(completion) = entry.completion {
          completion.completed(SendId(entry.id), SendResult::Abort);
        }
      }
      return was_in_flight;
    }

    let Some(at) = self.entries.iter().position(|e| e.id == id.0) else {
      return false;
    };
    let entry = self.entries.remove(at);
    let was_in_flight = self.in_flight == Some(id);
    if was_in_flight {
      self.in_flight = None;
    }
    if let Some(completion) = entry.completion {
      completion.completed(id, SendResult::Abort);
    }
    was_in_flight
  }

  /// Whether any request is waiting (or in flight)
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}
