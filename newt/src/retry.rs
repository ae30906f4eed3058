use embedded_time::duration::Milliseconds;
use rand::{Rng, SeedableRng};

use crate::time::Millis;

/// A number of attempts
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Attempts(pub u16);

/// What to do about the thing that keeps not working
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum Verdict {
  /// Wait longer; ask again at [`RetryTimer::deadline_ms`]
  Wait,
  /// Do it again now
  Retry,
  /// Attempts are exhausted; the work is poisoned
  GiveUp,
}

/// A non-blocking exponential-backoff timer, jittered the way CoAP
/// retransmission wants: the first interval is random in
/// `[initial, initial × factor]`, then doubles per attempt.
///
/// The timer holds no work — it just answers "is it time yet", so it
/// can live alongside whatever state machine owns the retrying.
/// Timestamps are milliseconds since the client clock's epoch.
#[derive(Debug, Clone, Copy)]
pub struct RetryTimer {
  last_attempt_ms: u64,
  interval: Millis,
  attempts: Attempts,
  max_attempts: Attempts,
}

impl RetryTimer {
  /// Start timing from the first attempt made at `now_ms`.
  ///
  /// `initial` is jittered up to `initial × factor_pct / 100` using
  /// `seed` (CoAP's ACK_RANDOM_FACTOR of 1.5 is `factor_pct = 150`).
  pub fn new(now_ms: u64,
             initial: Millis,
             factor_pct: u16,
             max_attempts: Attempts,
             seed: u64)
             -> Self {
    let interval = if factor_pct > 100 && initial.0 > 0 {
      let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(seed);
      let upper = initial.0 * u64::from(factor_pct) / 100;
      Milliseconds(rng.gen_range(initial.0..=upper))
    } else {
      initial
    };
    Self { last_attempt_ms: now_ms,
           interval,
           attempts: Attempts(1),
           max_attempts }
  }

  /// The attempt that failed again — retry, wait, or give up?
  pub fn verdict(&mut self, now_ms: u64) -> Verdict {
    if self.attempts >= self.max_attempts {
      return Verdict::GiveUp;
    }
    if now_ms.saturating_sub(self.last_attempt_ms) >= self.interval.0 {
      self.attempts.0 += 1;
      self.last_attempt_ms = now_ms;
      self.interval = Milliseconds(self.interval.0.saturating_mul(2));
      Verdict::Retry
    } else {
      Verdict::Wait
    }
  }

  /// When [`RetryTimer::verdict`] would next say something other than
  /// [`Verdict::Wait`]
  pub fn deadline_ms(&self) -> u64 {
    self.last_attempt_ms.saturating_add(self.interval.0)
  }

  /// Attempts made so far (the initial send counts as one)
  pub fn attempts(&self) -> Attempts {
    self.attempts
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn doubles_after_each_retry() {
    let mut retry = RetryTimer::new(0, Milliseconds(1000), 100, Attempts(4), 7);

    assert_eq!(retry.verdict(999), Verdict::Wait);
    assert_eq!(retry.verdict(1000), Verdict::Retry);
    assert_eq!(retry.verdict(2999), Verdict::Wait);
    assert_eq!(retry.verdict(3000), Verdict::Retry);
    assert_eq!(retry.verdict(6999), Verdict::Wait);
    assert_eq!(retry.verdict(7000), Verdict::Retry);
    assert_eq!(retry.verdict(20000), Verdict::GiveUp);
  }

  #[test]
  fn jitter_stays_in_the_window() {
    for seed in 0..64 {
      let retry = RetryTimer::new(0, Milliseconds(2000), 150, Attempts(4), seed);
      assert!((2000..=3000).contains(&retry.interval.0), "{}", retry.interval);
    }
  }

  #[test]
  fn deadline_tracks_the_next_retry() {
    let mut retry = RetryTimer::new(0, Milliseconds(500), 100, Attempts(3), 1);
    assert_eq!(retry.deadline_ms(), 500);
    assert_eq!(retry.verdict(600), Verdict::Retry);
    assert_eq!(retry.deadline_ms(), 1600);
  }
}
