use embedded_time::duration::Milliseconds;
use embedded_time::Instant;

/// A duration, in milliseconds
pub type Millis = Milliseconds<u64>;

/// Supertrait of [`embedded_time::Clock`] pinning the tick type to
/// u64, as every deadline in the core does millisecond arithmetic.
pub trait Clock: embedded_time::Clock<T = u64> {}
impl<C: embedded_time::Clock<T = u64>> Clock for C {}

/// Milliseconds from `earlier` to `later`, saturating at zero
pub fn millis_since<C: Clock>(later: Instant<C>, earlier: Instant<C>) -> Millis {
  later.checked_duration_since(&earlier)
       .and_then(|d| Milliseconds::try_from(d).ok())
       .unwrap_or(Milliseconds(0))
}

/// `at + add`, staying put on overflow
pub fn add_millis<C: Clock>(at: Instant<C>, add: Millis) -> Instant<C> {
  at.checked_add(add).unwrap_or(at)
}

/// Seconds as [`Millis`]
pub fn secs(s: u32) -> Millis {
  Milliseconds(u64::from(s) * 1000)
}

/// The earlier of two optional deadlines
pub fn sooner<C: Clock>(a: Option<Instant<C>>,
                        b: Option<Instant<C>>)
                        -> Option<Instant<C>> {
  match (a, b) {
    | (Some(a), Some(b)) => Some(a.min(b)),
    | (some, None) | (None, some) => some,
  }
}

/// [`sooner`] for raw millisecond deadlines
pub fn sooner_ms(a: Option<u64>, b: Option<u64>) -> Option<u64> {
  match (a, b) {
    | (Some(a), Some(b)) => Some(a.min(b)),
    | (some, None) | (None, some) => some,
  }
}

/// Milliseconds since the clock's epoch for `at` — the form every
/// [`Client::step`](crate::client::Client::step) deadline uses
pub fn as_ms<C: Clock>(at: Instant<C>) -> u64 {
  Milliseconds::try_from(at.duration_since_epoch()).map(|Milliseconds(ms)| ms)
                                                   .unwrap_or(0)
}

#[cfg(test)]
mod tests {
  use embedded_time::rate::Fraction;

  use super::*;

  #[derive(Debug)]
  struct MsClock(u64);

  impl embedded_time::Clock for MsClock {
    type T = u64;

    const SCALING_FACTOR: Fraction = Fraction::new(1, 1000);

    fn try_now(&self) -> Result<Instant<Self>, embedded_time::clock::Error> {
      Ok(Instant::new(self.0))
    }
  }

  fn now(ms: u64) -> Instant<MsClock> {
    use embedded_time::Clock as _;
    MsClock(ms).try_now().unwrap_or(Instant::new(0))
  }

  #[test]
  fn instants_flatten_to_millis() {
    assert_eq!(as_ms(now(1234)), 1234);
    assert_eq!(millis_since(now(2000), now(500)), Milliseconds(1500u64));
    // saturates instead of underflowing
    assert_eq!(millis_since(now(500), now(2000)), Milliseconds(0u64));
    assert_eq!(add_millis(now(100), secs(2)), now(2100));
  }

  #[test]
  fn deadline_merging() {
    assert_eq!(sooner(Some(now(5)), Some(now(3))), Some(now(3)));
    assert_eq!(sooner(None, Some(now(3))), Some(now(3)));
    assert_eq!(sooner::<MsClock>(None, None), None);
    assert_eq!(sooner_ms(Some(7), Some(9)), Some(7));
    assert_eq!(sooner_ms(None, Some(9)), Some(9));
  }
}
