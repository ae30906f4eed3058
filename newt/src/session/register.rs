//! The registration session: the state machine that keeps this client
//! registered with its LwM2M server.
//!
//! The session never touches the wire itself — it says which business
//! request should drive the exchange next ([`Registration::due`]),
//! builds that request's options, and reacts to the outcome. All
//! registration retry policy lives here; the exchange engine below
//! never retries beyond the CoAP transmission counts.

use core::fmt::Write as _;

use log::{debug, warn};
use newt_msg::opt::num;
use newt_msg::{Code, Options};

use crate::config::Config;
use crate::exchange::{Outcome, Request};
use crate::req::{Inbound, LocationPath};
use crate::strbuf::StrBuf;
use crate::time::Millis;

/// Where the registration stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  /// Not started
  Idle,
  /// A Register needs to go out (or is in flight)
  Registering,
  /// Registered; Updates on schedule
  Registered,
  /// A Deregister needs to go out (or is in flight)
  Deregistering,
  /// Deregistered after a Disable; re-registers when the hold
  /// expires
  Suspended,
  /// Socket closed between scheduled work (queue mode)
  QueueMode,
  /// Every retry sequence exhausted
  Failed,
}

/// The business request the session wants on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegRequest {
  /// POST /rd with the full link-format payload
  Register,
  /// POST to the stored location
  Update,
  /// DELETE to the stored location
  Deregister,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct UpdateReasons {
  lifetime: bool,
  binding: bool,
  data_model: bool,
}

/// The registration session.
#[derive(Debug)]
pub struct Registration {
  phase: Phase,
  location: LocationPath,
  lifetime: u32,

  last_success_ms: u64,
  update_due: Option<u64>,
  reasons: UpdateReasons,

  attempt: u16,
  sequence: u16,
  next_attempt_ms: Option<u64>,

  queue_deadline_ms: Option<u64>,
  suspend_until_ms: u64,
  disable_timeout_s: u32,
}

impl Registration {
  /// A session that has not started
  pub fn new(lifetime: u32) -> Self {
    Registration { phase: Phase::Idle,
                   location: LocationPath::new(),
                   lifetime,
                   last_success_ms: 0,
                   update_due: None,
                   reasons: UpdateReasons::default(),
                   attempt: 0,
                   sequence: 0,
                   next_attempt_ms: None,
                   queue_deadline_ms: None,
                   suspend_until_ms: 0,
                   disable_timeout_s: 86_400 }
  }

  /// Where the registration stands
  pub fn phase(&self) -> Phase {
    self.phase
  }

  /// The location path from the last successful Register
  pub fn location(&self) -> &LocationPath {
    &self.location
  }

  /// Begin (or begin again): next step is a fresh Register
  pub fn start(&mut self) {
    self.phase = Phase::Registering;
    self.attempt = 0;
    self.sequence = 0;
    self.next_attempt_ms = None;
    self.queue_deadline_ms = None;
  }

  /// The registered lifetime currently announced
  pub fn lifetime(&self) -> u32 {
    self.lifetime
  }

  /// The Server object's lifetime resource changed
  pub fn lifetime_changed(&mut self, lifetime: u32) {
    if self.lifetime != lifetime {
      self.lifetime = lifetime;
      self.reasons.lifetime = true;
    }
  }

  /// The Server object's binding resource changed
  pub fn binding_changed(&mut self) {
    self.reasons.binding = true;
  }

  /// An Object or Instance appeared/disappeared/changed version
  pub fn data_model_changed(&mut self) {
    self.reasons.data_model = true;
  }

  /// Application-requested early Update
  pub fn trigger_update(&mut self) {
    // any flag forces an update; data_model also refreshes the payload
    self.reasons.binding = true;
  }

  /// Disable-timeout parameter for the next Disable execute
  pub fn set_disable_timeout(&mut self, seconds: u32) {
    self.disable_timeout_s = seconds;
  }

  /// Server object Disable was executed (or the application asked to
  /// deregister)
  pub fn disable(&mut self) {
    if matches!(self.phase,
                Phase::Registered | Phase::QueueMode | Phase::Registering)
    {
      self.phase = Phase::Deregistering;
    }
  }

  /// What (if anything) should drive the exchange at `now_ms`
  pub fn due(&mut self, now_ms: u64) -> Option<RegRequest> {
    match self.phase {
      | Phase::Registering => {
        match self.next_attempt_ms {
          | Some(at) if now_ms < at => None,
          | _ => {
            self.next_attempt_ms = None;
            Some(RegRequest::Register)
          },
        }
      },
      | Phase::Deregistering => Some(RegRequest::Deregister),
      | Phase::Suspended => {
        if now_ms >= self.suspend_until_ms {
          debug!("suspend elapsed, re-registering");
          self.start();
          Some(RegRequest::Register)
        } else {
          None
        }
      },
      | Phase::Registered | Phase::QueueMode => {
        let update_due = self.update_deadline()
                             .map(|at| now_ms >= at)
                             .unwrap_or(false);
        if update_due || self.reasons != UpdateReasons::default() {
          Some(RegRequest::Update)
        } else {
          None
        }
      },
      | _ => None,
    }
  }

  /// Whether the queue-mode idle timer has expired (the caller closes
  /// the socket and flips the phase)
  pub fn queue_timer_expired(&self, now_ms: u64) -> bool {
    self.phase == Phase::Registered
    && self.queue_deadline_ms
           .map(|at| now_ms >= at)
           .unwrap_or(false)
  }

  /// Enter queue mode (socket closed, local port retained)
  pub fn entered_queue_mode(&mut self) {
    self.phase = Phase::QueueMode;
    self.queue_deadline_ms = None;
  }

  /// Back from queue mode (socket reopened)
  pub fn left_queue_mode(&mut self) {
    if self.phase == Phase::QueueMode {
      self.phase = Phase::Registered;
    }
  }

  /// Stretch the queue-mode idle timer (any exchange does)
  pub fn touch(&mut self, now_ms: u64, queue_mode: bool, queue_timeout: Millis) {
    if queue_mode && self.phase == Phase::Registered {
      self.queue_deadline_ms = Some(now_ms + queue_timeout.0);
    }
  }

  /// Build the Uri options for `req`
  pub fn build(&self, req: RegRequest, config: &Config) -> Result<Request, newt_msg::OptionsError> {
    let mut opts = Options::new();
    match req {
      | RegRequest::Register => {
        opts.add_str(num::URI_PATH, "rd")?;
        let mut query = StrBuf::<{ crate::config::MAX_ENDPOINT_NAME + 3 }>::new();
        write!(query, "ep={}", config.endpoint.as_str()).ok();
        opts.add_str(num::URI_QUERY, &query)?;

        let mut lt = StrBuf::<14>::new();
        write!(lt, "lt={}", self.lifetime).ok();
        opts.add_str(num::URI_QUERY, &lt)?;

        let mut ver = StrBuf::<10>::new();
        write!(ver, "lwm2m={}", config.lwm2m_version()).ok();
        opts.add_str(num::URI_QUERY, &ver)?;

        let mut binding = StrBuf::<6>::new();
        write!(binding, "b={}", config.binding.as_str()).ok();
        opts.add_str(num::URI_QUERY, &binding)?;

        if config.queue_mode {
          opts.add_str(num::URI_QUERY, "Q")?;
        }
        Ok(Request { code: Code::POST,
                     opts,
                     confirmable: true,
                     token: None,
                     observe_seq: None })
      },
      | RegRequest::Update => {
        for seg in self.location.iter() {
          opts.add_str(num::URI_PATH, seg)?;
        }
        if self.reasons.lifetime {
          let mut lt = StrBuf::<14>::new();
          write!(lt, "lt={}", self.lifetime).ok();
          opts.add_str(num::URI_QUERY, &lt)?;
        }
        if self.reasons.binding {
          let mut binding = StrBuf::<6>::new();
          write!(binding, "b={}", config.binding.as_str()).ok();
          opts.add_str(num::URI_QUERY, &binding)?;
        }
        Ok(Request { code: Code::POST,
                     opts,
                     confirmable: true,
                     token: None,
                     observe_seq: None })
      },
      | RegRequest::Deregister => {
        for seg in self.location.iter() {
          opts.add_str(num::URI_PATH, seg)?;
        }
        Ok(Request { code: Code::DELETE,
                     opts,
                     confirmable: true,
                     token: None,
                     observe_seq: None })
      },
    }
  }

  /// Whether the Update in flight must carry a fresh link-format
  /// payload (a data-model change)
  pub fn update_needs_payload(&self) -> bool {
    self.reasons.data_model
  }

  /// The exchange driven by `req` ended.
  pub fn on_result(&mut self,
                   req: RegRequest,
                   outcome: Outcome,
                   response: Option<&Inbound<'_>>,
                   config: &Config,
                   now_ms: u64)
                   -> RegEvent {
    let code = response.map(|r| r.code);
    let success = outcome == Outcome::Done
                  && code.map(|c| !c.is_error_response()).unwrap_or(false);

    match (req, success) {
      | (RegRequest::Register, true) if code == Some(Code::CREATED) => {
        // the location is immutable until the next successful Register
        self.location = response.map(|r| r.location.clone())
                                .unwrap_or_default();
        self.phase = Phase::Registered;
        self.attempt = 0;
        self.sequence = 0;
        self.reasons = UpdateReasons::default();
        self.mark_success(now_ms, config);
        debug!("registered, lifetime {}s", self.lifetime);
        RegEvent::Registered
      },
      | (RegRequest::Register, _) => self.register_failed(config, now_ms),
      | (RegRequest::Update, true) => {
        self.reasons = UpdateReasons::default();
        self.mark_success(now_ms, config);
        self.left_queue_mode();
        RegEvent::None
      },
      | (RegRequest::Update, false) => {
        // any Update failure means the server may have lost us
        warn!("update failed ({:?}), re-registering", outcome);
        self.start();
        RegEvent::None
      },
      | (RegRequest::Deregister, _) => {
        // deregistration is best-effort; move on either way
        self.phase = Phase::Suspended;
        self.suspend_until_ms =
          now_ms + u64::from(self.disable_timeout_s) * 1000;
        self.location = LocationPath::new();
        RegEvent::Suspended
      },
    }
  }

  fn mark_success(&mut self, now_ms: u64, config: &Config) {
    self.last_success_ms = now_ms;
    self.update_due = if self.lifetime == 0 {
      None
    } else {
      let lifetime_ms = u64::from(self.lifetime) * 1000;
      let margin =
        (lifetime_ms / 2).max(lifetime_ms.saturating_sub(config.coap
                                                               .max_transmit_wait
                                                               .0));
      Some(now_ms + margin)
    };
    if config.queue_mode {
      self.queue_deadline_ms = Some(now_ms + config.queue_timeout().0);
    }
  }

  fn register_failed(&mut self, config: &Config, now_ms: u64) -> RegEvent {
    let policy = config.registration_retry;
    self.attempt += 1;
    if self.attempt < policy.retry_count {
      let backoff =
        policy.retry_timer.0 << (self.attempt - 1).min(16) as u32;
      self.next_attempt_ms = Some(now_ms + backoff);
      debug!("register attempt {} failed, retry in {}ms", self.attempt, backoff);
      return RegEvent::None;
    }

    self.sequence += 1;
    self.attempt = 0;
    if self.sequence <= policy.seq_retry_count {
      self.next_attempt_ms = Some(now_ms + policy.seq_delay.0);
      debug!("register sequence {} exhausted, pausing", self.sequence);
      return RegEvent::None;
    }

    if config.bootstrap_on_registration_failure {
      warn!("registration retries exhausted, falling back to bootstrap");
      self.phase = Phase::Idle;
      RegEvent::NeedBootstrap
    } else {
      warn!("registration retries exhausted");
      self.phase = Phase::Failed;
      RegEvent::Failed
    }
  }

  /// The earliest instant the session wants another look
  pub fn deadline_ms(&self) -> Option<u64> {
    match self.phase {
      | Phase::Registering => self.next_attempt_ms,
      | Phase::Suspended => Some(self.suspend_until_ms),
      | Phase::Registered => {
        crate::time::sooner_ms(self.update_deadline(), self.queue_deadline_ms)
      },
      | Phase::QueueMode => self.update_deadline(),
      | _ => None,
    }
  }

  fn update_deadline(&self) -> Option<u64> {
    self.update_due
  }
}

/// Things the client must act on after a session transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegEvent {
  /// Nothing beyond the phase change
  None,
  /// A fresh registration exists: observations are void
  Registered,
  /// Deregistered; re-register after the disable timeout
  Suspended,
  /// Start the bootstrap session
  NeedBootstrap,
  /// Terminal failure
  Failed,
}

#[cfg(test)]
mod tests {
  use embedded_time::duration::Milliseconds;

  use super::*;

  fn config() -> Config {
    let mut config = Config::new("name").unwrap();
    config.lifetime = 150;
    config
  }

  fn registered(config: &Config) -> Registration {
    let mut reg = Registration::new(config.lifetime);
    reg.start();
    assert_eq!(reg.due(0), Some(RegRequest::Register));
    let response = ok_response(Code::CREATED, &["rd", "5a3f"]);
    reg.on_result(RegRequest::Register, Outcome::Done, Some(&response), config, 0);
    reg
  }

  fn ok_response(code: Code, location: &[&str]) -> Inbound<'static> {
    let mut loc = LocationPath::new();
    for seg in location {
      loc.push(StrBuf::copy_of(seg).unwrap());
    }
    Inbound { op: crate::req::Operation::Response,
              ty: newt_msg::Type::Ack,
              msg_id: newt_msg::Id(0),
              code,
              token: newt_msg::Token::empty(),
              path: crate::path::UriPath::root(),
              content_format: None,
              accept: None,
              block: None,
              attrs: Default::default(),
              location: loc,
              etag: None,
              payload: &[] }
  }

  #[test]
  fn register_then_update_at_half_lifetime() {
    let config = config();
    let mut reg = registered(&config);
    assert_eq!(reg.phase(), Phase::Registered);
    assert_eq!(reg.location().len(), 2);

    // lifetime 150: margin is max(75, 150 - 93) = 75 s
    assert_eq!(reg.due(74_000), None);
    assert_eq!(reg.due(76_000),
               Some(RegRequest::Update));
  }

  #[test]
  fn zero_lifetime_disables_updates() {
    let mut config = config();
    config.lifetime = 0;
    let mut reg = registered(&config);
    assert_eq!(reg.due(1_000_000_000), None);

    // ... until something changes
    reg.lifetime_changed(100);
    assert_eq!(reg.due(1_000_000_000),
               Some(RegRequest::Update));
  }

  #[test]
  fn update_failure_reregisters() {
    let config = config();
    let mut reg = registered(&config);
    reg.trigger_update();
    assert_eq!(reg.due(1000), Some(RegRequest::Update));
    let err = ok_response(Code::NOT_FOUND, &[]);
    reg.on_result(RegRequest::Update, Outcome::Done, Some(&err), &config, 1000);
    assert_eq!(reg.phase(), Phase::Registering);
  }

  #[test]
  fn retry_policy_walks_sequences_then_bootstraps() {
    let mut config = config();
    config.registration_retry.retry_timer = Milliseconds(1_000);
    config.registration_retry.retry_count = 2;
    config.registration_retry.seq_delay = Milliseconds(10_000);
    config.registration_retry.seq_retry_count = 1;

    let mut reg = Registration::new(config.lifetime);
    reg.start();

    // attempt 1 fails -> backoff 1s
    assert_eq!(reg.on_result(RegRequest::Register, Outcome::Timeout, None,
                             &config, 0),
               RegEvent::None);
    assert_eq!(reg.due(500), None);
    assert_eq!(reg.due(1_000),
               Some(RegRequest::Register));

    // attempt 2 fails -> sequence exhausted -> seq delay
    assert_eq!(reg.on_result(RegRequest::Register, Outcome::Timeout, None,
                             &config, 1_000),
               RegEvent::None);
    assert_eq!(reg.due(5_000), None);
    assert_eq!(reg.due(11_000),
               Some(RegRequest::Register));

    // the second sequence fails out entirely -> bootstrap fallback
    assert_eq!(reg.on_result(RegRequest::Register, Outcome::Timeout, None,
                             &config, 11_000),
               RegEvent::None);
    assert_eq!(reg.due(12_000), Some(RegRequest::Register));
    assert_eq!(reg.on_result(RegRequest::Register, Outcome::Timeout, None,
                             &config, 12_000),
               RegEvent::NeedBootstrap);
  }

  #[test]
  fn disable_deregisters_then_suspends() {
    let config = config();
    let mut reg = registered(&config);
    reg.set_disable_timeout(5);
    reg.disable();
    assert_eq!(reg.due(1000),
               Some(RegRequest::Deregister));
    let response = ok_response(Code::DELETED, &[]);
    assert_eq!(reg.on_result(RegRequest::Deregister, Outcome::Done,
                             Some(&response), &config, 1000),
               RegEvent::Suspended);
    assert_eq!(reg.phase(), Phase::Suspended);

    assert_eq!(reg.due(4_000), None);
    assert_eq!(reg.due(6_000),
               Some(RegRequest::Register));
    assert_eq!(reg.phase(), Phase::Registering);
  }

  #[test]
  fn location_is_used_verbatim_for_update() {
    let config = config();
    let reg = registered(&config);
    let req = reg.build(RegRequest::Update, &config).unwrap();
    let segs: Vec<&[u8]> = req.opts.get_all(num::URI_PATH).collect();
    assert_eq!(segs, [&b"rd"[..], &b"5a3f"[..]]);
    // plain periodic update: no query options
    assert!(req.opts.get_first(num::URI_QUERY).is_none());
  }

  #[test]
  fn register_query_set() {
    let mut config = config();
    config.queue_mode = true;
    let reg = Registration::new(config.lifetime);
    let req = reg.build(RegRequest::Register, &config).unwrap();
    let queries: Vec<&[u8]> = req.opts.get_all(num::URI_QUERY).collect();
    assert_eq!(queries,
               [&b"ep=name"[..], b"lt=150", b"lwm2m=1.2", b"b=U", b"Q"]);
  }
}
