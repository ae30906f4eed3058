use embedded_time::duration::Milliseconds;

use crate::retry::Attempts;
use crate::strbuf::StrBuf;
use crate::time::Millis;

/// Longest endpoint name accepted
pub const MAX_ENDPOINT_NAME: usize = 64;

/// CoAP transmission parameters (RFC 7252 §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Coap {
  /// Base retransmission timeout.
  ///
  /// Defaults to the RFC's 2 s:
  /// ```
  /// use newt::config::Coap;
  /// use embedded_time::duration::Milliseconds;
  ///
  /// assert_eq!(Coap::default().ack_timeout, Milliseconds(2_000));
  /// ```
  pub ack_timeout: Millis,

  /// The jitter factor over [`Coap::ack_timeout`], in percent.
  /// The RFC's ACK_RANDOM_FACTOR of 1.5 is `150`.
  pub ack_random_factor_pct: u16,

  /// Total transmissions allowed for one Confirmable message
  /// (1 original + MAX_RETRANSMIT retries).
  ///
  /// ```
  /// use newt::config::Coap;
  /// use newt::retry::Attempts;
  ///
  /// assert_eq!(Coap::default().max_attempts, Attempts(5));
  /// ```
  pub max_attempts: Attempts,

  /// Upper bound on the total life of a Confirmable exchange
  /// (MAX_TRANSMIT_WAIT). Defaults to the RFC's 93 s.
  pub max_transmit_wait: Millis,
}

impl Default for Coap {
  fn default() -> Self {
    Coap { ack_timeout: Milliseconds(2_000),
           ack_random_factor_pct: 150,
           max_attempts: Attempts(5),
           max_transmit_wait: Milliseconds(93_000) }
  }
}

/// Registration retry policy: `retry_count` attempts spaced by
/// `retry_timer × 2^n`, then a pause of `seq_delay` and another
/// sequence, up to `seq_retry_count` sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationRetry {
  /// Base delay between attempts within a sequence
  pub retry_timer: Millis,
  /// Attempts per sequence
  pub retry_count: u16,
  /// Pause between sequences
  pub seq_delay: Millis,
  /// Number of sequences
  pub seq_retry_count: u16,
}

impl Default for RegistrationRetry {
  fn default() -> Self {
    RegistrationRetry { retry_timer: Milliseconds(60_000),
                        retry_count: 3,
                        seq_delay: Milliseconds(300_000),
                        seq_retry_count: 2 }
  }
}

/// Everything the client core is told at init.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
  /// The globally identifying endpoint name sent at registration
  pub endpoint: StrBuf<MAX_ENDPOINT_NAME>,

  /// Registration lifetime in seconds; 0 disables automatic Updates
  pub lifetime: u32,

  /// The binding announced at registration (`"U"`, `"T"`, …)
  pub binding: StrBuf<4>,

  /// Whether to announce and run queue mode
  pub queue_mode: bool,

  /// How long after the last exchange to drop into queue mode.
  /// `None` uses [`Coap::max_transmit_wait`].
  pub queue_mode_timeout: Option<Millis>,

  /// See [`Coap`]
  pub coap: Coap,

  /// See [`RegistrationRetry`]
  pub registration_retry: RegistrationRetry,

  /// Fall back to Bootstrap once registration retries are exhausted
  /// (requires a Bootstrap Security instance)
  pub bootstrap_on_registration_failure: bool,

  /// Wait this long for bootstrap server activity before declaring
  /// the bootstrap attempt dead
  pub bootstrap_finish_timeout: Millis,

  /// Delay between failed bootstrap attempts
  pub bootstrap_retry_timeout: Millis,

  /// Seed for the process-wide token/message-id/jitter randomness
  pub random_seed: u32,
}

impl Config {
  /// A config for `endpoint` with every default
  pub fn new(endpoint: &str) -> Option<Self> {
    Some(Config { endpoint: StrBuf::copy_of(endpoint)?,
                  lifetime: 86_400,
                  binding: StrBuf::copy_of("U")?,
                  queue_mode: false,
                  queue_mode_timeout: None,
                  coap: Coap::default(),
                  registration_retry: RegistrationRetry::default(),
                  bootstrap_on_registration_failure: true,
                  bootstrap_finish_timeout: Milliseconds(240_000),
                  bootstrap_retry_timeout: Milliseconds(30_000),
                  random_seed: 0 })
  }

  /// The LwM2M protocol version announced at registration
  pub fn lwm2m_version(&self) -> &'static str {
    #[cfg(feature = "lwm2m11")]
    {
      "1.1"
    }
    #[cfg(not(feature = "lwm2m11"))]
    {
      "1.2"
    }
  }

  pub(crate) fn queue_timeout(&self) -> Millis {
    self.queue_mode_timeout.unwrap_or(self.coap.max_transmit_wait)
  }
}
