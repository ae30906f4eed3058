//! The bootstrap session: obtain server credentials from a Bootstrap
//! server before registering.
//!
//! The client holds off, POSTs `/bs?ep=<name>&pct=<format>`, then lets
//! the server drive Writes (and Deletes/Discovers) through the data
//! model until Bootstrap-Finish. Absence of server activity for the
//! configured window kills the attempt; failures retry on a fixed
//! delay. Bootstrap always outranks a concurrent registration
//! request.

use core::fmt::Write as _;

use log::{debug, warn};
use newt_msg::opt::num;
use newt_msg::{Code, ContentFormat, Options};

use crate::config::Config;
use crate::exchange::{Outcome, Request};
use crate::strbuf::StrBuf;

/// Where the bootstrap attempt stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  /// Not running
  Idle,
  /// Client hold-off before the request
  Waiting,
  /// Bootstrap-Request needs to go out (or is in flight)
  Requesting,
  /// The server is provisioning us
  InProgress,
  /// Bootstrap-Finish validated; registration may proceed
  Done,
  /// This attempt died; a retry may be scheduled
  Error,
}

/// The bootstrap session.
#[derive(Debug)]
pub struct Bootstrap {
  phase: Phase,
  hold_until_ms: u64,
  activity_deadline_ms: u64,
  retry_at_ms: Option<u64>,
}

impl Bootstrap {
  /// An idle session
  pub fn new() -> Self {
    Bootstrap { phase: Phase::Idle,
                hold_until_ms: 0,
                activity_deadline_ms: 0,
                retry_at_ms: None }
  }

  /// Where the bootstrap stands
  pub fn phase(&self) -> Phase {
    self.phase
  }

  /// Whether a bootstrap is running in any form
  pub fn is_active(&self) -> bool {
    !matches!(self.phase, Phase::Idle | Phase::Done)
  }

  /// Begin, honoring the Security object's Client Hold Off Time
  pub fn start(&mut self, now_ms: u64, hold_off_s: u32) {
    self.phase = Phase::Waiting;
    self.hold_until_ms = now_ms + u64::from(hold_off_s) * 1000;
    self.retry_at_ms = None;
    debug!("bootstrap starts in {}s", hold_off_s);
  }

  /// Whether the Bootstrap-Request should go out now
  pub fn due(&mut self, now_ms: u64) -> bool {
    match self.phase {
      | Phase::Waiting if now_ms >= self.hold_until_ms => {
        self.phase = Phase::Requesting;
        true
      },
      | Phase::Requesting => true,
      | Phase::Error => match self.retry_at_ms {
        | Some(at) if now_ms >= at => {
          self.phase = Phase::Requesting;
          self.retry_at_ms = None;
          true
        },
        | _ => false,
      },
      | _ => false,
    }
  }

  /// Build the Bootstrap-Request
  pub fn build(&self,
               config: &Config,
               preferred: ContentFormat)
               -> Result<Request, newt_msg::OptionsError> {
    let mut opts = Options::new();
    opts.add_str(num::URI_PATH, "bs")?;

    let mut ep = StrBuf::<{ crate::config::MAX_ENDPOINT_NAME + 3 }>::new();
    write!(ep, "ep={}", config.endpoint.as_str()).ok();
    opts.add_str(num::URI_QUERY, &ep)?;

    let mut pct = StrBuf::<10>::new();
    write!(pct, "pct={}", u16::from(preferred)).ok();
    opts.add_str(num::URI_QUERY, &pct)?;

    Ok(Request { code: Code::POST,
                 opts,
                 confirmable: true,
                 token: None,
                 observe_seq: None })
  }

  /// Build a Bootstrap-Pack-Request (`GET /bspack`): the preferred
  /// format travels as Accept, and there is no `pct` query
  pub fn build_pack(&self,
                    config: &Config,
                    preferred: ContentFormat)
                    -> Result<Request, newt_msg::OptionsError> {
    let mut opts = Options::new();
    opts.add_str(num::URI_PATH, "bspack")?;
    opts.add_u16(num::ACCEPT, preferred.into())?;

    let mut ep = StrBuf::<{ crate::config::MAX_ENDPOINT_NAME + 3 }>::new();
    write!(ep, "ep={}", config.endpoint.as_str()).ok();
    opts.add_str(num::URI_QUERY, &ep)?;

    Ok(Request { code: Code::GET,
                 opts,
                 confirmable: true,
                 token: None,
                 observe_seq: None })
  }

  /// The Bootstrap-Request exchange ended.
  pub fn on_request_result(&mut self,
                           outcome: Outcome,
                           code: Option<Code>,
                           config: &Config,
                           now_ms: u64) {
    let accepted = outcome == Outcome::Done
                   && code.map(|c| !c.is_error_response()).unwrap_or(false);
    if accepted {
      self.phase = Phase::InProgress;
      self.activity_deadline_ms = now_ms + config.bootstrap_finish_timeout.0;
      debug!("bootstrap in progress");
    } else {
      self.fail(config, now_ms);
    }
  }

  /// The transport refused to come up (connect error)
  pub fn on_connect_failure(&mut self, config: &Config, now_ms: u64) {
    self.fail(config, now_ms);
  }

  /// Any server-initiated request arrived while provisioning
  pub fn on_server_activity(&mut self, config: &Config, now_ms: u64) {
    if self.phase == Phase::InProgress {
      self.activity_deadline_ms = now_ms + config.bootstrap_finish_timeout.0;
    }
  }

  /// Bootstrap-Finish arrived; `valid` says whether the provisioned
  /// data model holds a usable Security + Server pair
  pub fn on_finish(&mut self, valid: bool, config: &Config, now_ms: u64) {
    if self.phase != Phase::InProgress {
      return;
    }
    if valid {
      self.phase = Phase::Done;
      debug!("bootstrap finished");
    } else {
      warn!("bootstrap finish rejected: data model incomplete");
      self.fail(config, now_ms);
    }
  }

  /// Kill the attempt if the server has gone quiet
  pub fn check_timeout(&mut self, config: &Config, now_ms: u64) {
    if self.phase == Phase::InProgress && now_ms >= self.activity_deadline_ms {
      warn!("bootstrap server went quiet");
      self.fail(config, now_ms);
    }
  }

  /// Registration may proceed; the session returns to idle
  pub fn take_done(&mut self) -> bool {
    if self.phase == Phase::Done {
      self.phase = Phase::Idle;
      true
    } else {
      false
    }
  }

  fn fail(&mut self, config: &Config, now_ms: u64) {
    self.phase = Phase::Error;
    self.retry_at_ms = Some(now_ms + config.bootstrap_retry_timeout.0);
    debug!("bootstrap retry in {}ms", config.bootstrap_retry_timeout.0);
  }

  /// The earliest instant the session wants another look
  pub fn deadline_ms(&self) -> Option<u64> {
    match self.phase {
      | Phase::Waiting => Some(self.hold_until_ms),
      | Phase::InProgress => Some(self.activity_deadline_ms),
      | Phase::Error => self.retry_at_ms,
      | _ => None,
    }
  }
}

impl Default for Bootstrap {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use embedded_time::duration::Milliseconds;

  use super::*;

  fn config() -> Config {
    let mut config = Config::new("name").unwrap();
    config.bootstrap_retry_timeout = Milliseconds(30_000);
    config.bootstrap_finish_timeout = Milliseconds(240_000);
    config
  }

  #[test]
  fn hold_off_then_request() {
    let mut bs = Bootstrap::new();
    bs.start(0, 10);
    assert!(!bs.due(9_000));
    assert!(bs.due(10_000));
    assert_eq!(bs.phase(), Phase::Requesting);
  }

  #[test]
  fn request_query() {
    let bs = Bootstrap::new();
    let config = config();
    let req = bs.build(&config, ContentFormat::SenmlCbor).unwrap();
    let paths: Vec<&[u8]> = req.opts.get_all(num::URI_PATH).collect();
    assert_eq!(paths, [&b"bs"[..]]);
    let queries: Vec<&[u8]> = req.opts.get_all(num::URI_QUERY).collect();
    assert_eq!(queries, [&b"ep=name"[..], b"pct=112"]);
  }

  #[test]
  fn pack_request_uses_accept_and_no_pct() {
    let bs = Bootstrap::new();
    let config = config();
    let req = bs.build_pack(&config, ContentFormat::SenmlCbor).unwrap();
    assert_eq!(req.code, Code::GET);
    let paths: Vec<&[u8]> = req.opts.get_all(num::URI_PATH).collect();
    assert_eq!(paths, [&b"bspack"[..]]);
    let queries: Vec<&[u8]> = req.opts.get_all(num::URI_QUERY).collect();
    assert_eq!(queries, [&b"ep=name"[..]]);
    assert_eq!(req.opts.get_u16(num::ACCEPT), Ok(Some(112)));
  }

  #[test]
  fn happy_path() {
    let config = config();
    let mut bs = Bootstrap::new();
    bs.start(0, 0);
    assert!(bs.due(0));
    bs.on_request_result(Outcome::Done, Some(Code::CHANGED), &config, 0);
    assert_eq!(bs.phase(), Phase::InProgress);

    bs.on_server_activity(&config, 100_000);
    bs.check_timeout(&config, 300_000);
    assert_eq!(bs.phase(), Phase::InProgress);

    bs.on_finish(true, &config, 310_000);
    assert!(bs.take_done());
    assert_eq!(bs.phase(), Phase::Idle);
  }

  #[test]
  fn connect_failure_retries_on_the_clock() {
    let config = config();
    let mut bs = Bootstrap::new();
    bs.start(0, 0);
    assert!(bs.due(0));
    bs.on_connect_failure(&config, 0);
    assert_eq!(bs.phase(), Phase::Error);
    assert!(!bs.due(29_000));
    assert!(bs.due(30_000));
    assert_eq!(bs.phase(), Phase::Requesting);
  }

  #[test]
  fn quiet_server_times_the_attempt_out() {
    let config = config();
    let mut bs = Bootstrap::new();
    bs.start(0, 0);
    bs.due(0);
    bs.on_request_result(Outcome::Done, Some(Code::CHANGED), &config, 0);
    bs.check_timeout(&config, 239_000);
    assert_eq!(bs.phase(), Phase::InProgress);
    bs.check_timeout(&config, 240_000);
    assert_eq!(bs.phase(), Phase::Error);
  }

  #[test]
  fn invalid_finish_fails_the_attempt() {
    let config = config();
    let mut bs = Bootstrap::new();
    bs.start(0, 0);
    bs.due(0);
    bs.on_request_result(Outcome::Done, Some(Code::CHANGED), &config, 0);
    bs.on_finish(false, &config, 1_000);
    assert_eq!(bs.phase(), Phase::Error);
  }
}
