//! Expiration Hint Module
//!
//! The closed set of hint variants and their combination rules.

use chrono::{DateTime, Duration, Utc};

use super::{HintType, Validity, MAX_SLIDING_WINDOW_SECS};
use crate::error::{CacheError, Result};

// == Fixed Expiration ==
/// Expires once `now >= absolute_time`.
///
/// `DateTime::<Utc>::MAX_UTC` is the "no expiration" sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedExpiration {
    absolute_time: DateTime<Utc>,
}

impl FixedExpiration {
    /// Creates a hint expiring at `absolute_time`.
    pub fn new(absolute_time: DateTime<Utc>) -> Self {
        Self { absolute_time }
    }

    /// Creates a hint that never expires.
    pub fn never() -> Self {
        Self::new(DateTime::<Utc>::MAX_UTC)
    }

    /// The absolute deadline.
    pub fn absolute_time(&self) -> DateTime<Utc> {
        self.absolute_time
    }

    /// Returns true if this hint carries the "no expiration" sentinel.
    pub fn is_never(&self) -> bool {
        self.absolute_time == DateTime::<Utc>::MAX_UTC
    }

    pub fn evaluate(&self, now: DateTime<Utc>) -> Validity {
        Validity::from_expired(!self.is_never() && now >= self.absolute_time)
    }
}

// == Idle Expiration ==
/// Expires once `now - last_access_time >= sliding_window`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdleExpiration {
    sliding_window: Duration,
    last_access_time: DateTime<Utc>,
}

impl IdleExpiration {
    /// Creates an idle hint whose clock starts at `now`.
    ///
    /// # Errors
    /// `InvalidExpirationWindow` if the window is not positive or is a year or longer.
    pub fn new(sliding_window: Duration, now: DateTime<Utc>) -> Result<Self> {
        validate_window(sliding_window)?;
        Ok(Self {
            sliding_window,
            last_access_time: now,
        })
    }

    pub fn sliding_window(&self) -> Duration {
        self.sliding_window
    }

    pub fn last_access_time(&self) -> DateTime<Utc> {
        self.last_access_time
    }

    pub fn evaluate(&self, now: DateTime<Utc>) -> Validity {
        Validity::from_expired(now - self.last_access_time >= self.sliding_window)
    }

    /// Restarts the window at `now`. The clock never moves backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_access_time {
            self.last_access_time = now;
        }
    }

    fn deadline(&self) -> DateTime<Utc> {
        self.last_access_time + self.sliding_window
    }
}

fn validate_window(window: Duration) -> Result<()> {
    if window <= Duration::zero() {
        return Err(CacheError::InvalidExpirationWindow(format!(
            "sliding window must be positive, got {}ms",
            window.num_milliseconds()
        )));
    }
    if window >= Duration::seconds(MAX_SLIDING_WINDOW_SECS) {
        return Err(CacheError::InvalidExpirationWindow(format!(
            "sliding window must be shorter than one year, got {}s",
            window.num_seconds()
        )));
    }
    Ok(())
}

// == Fixed + Idle Expiration ==
/// Two independent clocks; the entry lapses only when the absolute deadline
/// has passed AND no access happened within the sliding window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedIdleExpiration {
    fixed: FixedExpiration,
    idle: IdleExpiration,
}

impl FixedIdleExpiration {
    pub fn new(fixed: FixedExpiration, idle: IdleExpiration) -> Self {
        Self { fixed, idle }
    }

    pub fn fixed(&self) -> &FixedExpiration {
        &self.fixed
    }

    pub fn idle(&self) -> &IdleExpiration {
        &self.idle
    }

    pub fn evaluate(&self, now: DateTime<Utc>) -> Validity {
        Validity::from_expired(
            self.fixed.evaluate(now).is_expired() && self.idle.evaluate(now).is_expired(),
        )
    }

    /// Resets the idle clock only; the absolute deadline is untouched.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.idle.touch(now);
    }
}

// == Aggregate Expiration ==
/// An ordered sequence of children. The aggregate lapses as soon as ANY
/// child has lapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateExpiration {
    children: Vec<ExpirationHint>,
}

impl AggregateExpiration {
    pub fn children(&self) -> &[ExpirationHint] {
        &self.children
    }

    pub fn evaluate(&self, now: DateTime<Utc>) -> Validity {
        Validity::from_expired(self.children.iter().any(|c| c.evaluate(now).is_expired()))
    }
}

// == Expiration Hint ==
/// Time-based validity policy attached to a single entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpirationHint {
    Fixed(FixedExpiration),
    Idle(IdleExpiration),
    FixedIdle(FixedIdleExpiration),
    Aggregate(AggregateExpiration),
}

impl ExpirationHint {
    // == Constructors ==
    /// Builds a hint from caller-supplied parameters.
    ///
    /// A zero sliding window and an absent (or sentinel) absolute time mean
    /// "no expiration", so `Ok(None)` is returned when neither clock is set.
    /// Both set yields [`FixedIdleExpiration`].
    ///
    /// # Errors
    /// `InvalidExpirationWindow` for a negative or oversized sliding window.
    pub fn from_params(
        absolute: Option<DateTime<Utc>>,
        sliding: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<Option<Self>> {
        let fixed = absolute
            .map(FixedExpiration::new)
            .filter(|f| !f.is_never());
        let idle = match sliding {
            Some(window) if window.is_zero() => None,
            Some(window) => Some(IdleExpiration::new(window, now)?),
            None => None,
        };

        Ok(match (fixed, idle) {
            (Some(fixed), Some(idle)) => Some(Self::FixedIdle(FixedIdleExpiration::new(fixed, idle))),
            (Some(fixed), None) => Some(Self::Fixed(fixed)),
            (None, Some(idle)) => Some(Self::Idle(idle)),
            (None, None) => None,
        })
    }

    /// Combines several hints into one.
    ///
    /// One child is returned as-is. Exactly one fixed and one idle hint pair
    /// into [`FixedIdleExpiration`]; anything else becomes an
    /// [`AggregateExpiration`]. No children means no expiration.
    pub fn compose(children: Vec<ExpirationHint>) -> Option<Self> {
        let mut children = children;
        match children.len() {
            0 => return None,
            1 => return children.pop(),
            _ => {}
        }

        if let [a, b] = children.as_slice() {
            match (a, b) {
                (Self::Fixed(f), Self::Idle(i)) | (Self::Idle(i), Self::Fixed(f)) => {
                    return Some(Self::FixedIdle(FixedIdleExpiration::new(f.clone(), i.clone())));
                }
                _ => {}
            }
        }

        Some(Self::Aggregate(AggregateExpiration { children }))
    }

    // == Accessors ==
    pub fn hint_type(&self) -> HintType {
        match self {
            Self::Fixed(_) => HintType::Fixed,
            Self::Idle(_) => HintType::Idle,
            Self::FixedIdle(_) => HintType::FixedIdle,
            Self::Aggregate(_) => HintType::Aggregate,
        }
    }

    /// Returns true if the hint carries an idle clock, i.e. its validity can
    /// change through `touch`. Fixed-only hints can be scheduled once.
    pub fn is_variant(&self) -> bool {
        match self {
            Self::Fixed(_) => false,
            Self::Idle(_) | Self::FixedIdle(_) => true,
            Self::Aggregate(a) => a.children.iter().any(Self::is_variant),
        }
    }

    // == Evaluate ==
    /// Pure check; never mutates the hint.
    pub fn evaluate(&self, now: DateTime<Utc>) -> Validity {
        match self {
            Self::Fixed(h) => h.evaluate(now),
            Self::Idle(h) => h.evaluate(now),
            Self::FixedIdle(h) => h.evaluate(now),
            Self::Aggregate(h) => h.evaluate(now),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.evaluate(now).is_expired()
    }

    // == Touch ==
    /// Records an access at `now`. No-op for fixed hints.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        match self {
            Self::Fixed(_) => {}
            Self::Idle(h) => h.touch(now),
            Self::FixedIdle(h) => h.touch(now),
            Self::Aggregate(h) => h.children.iter_mut().for_each(|c| c.touch(now)),
        }
    }

    // == Deadline ==
    /// Earliest instant the hint lapses if nobody touches it again, or
    /// `None` if it can never lapse.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Fixed(h) if h.is_never() => None,
            Self::Fixed(h) => Some(h.absolute_time()),
            Self::Idle(h) => Some(h.deadline()),
            Self::FixedIdle(h) if h.fixed.is_never() => None,
            Self::FixedIdle(h) => Some(h.fixed.absolute_time().max(h.idle.deadline())),
            Self::Aggregate(h) => h.children.iter().filter_map(Self::next_deadline).min(),
        }
    }

    /// Remaining time before the hint lapses, saturating at zero.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.next_deadline()
            .map(|deadline| (deadline - now).max(Duration::zero()))
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(secs)
    }

    #[test]
    fn test_fixed_expires_at_deadline() {
        let hint = FixedExpiration::new(t(10));
        assert_eq!(hint.evaluate(t(9)), Validity::Valid);
        assert_eq!(hint.evaluate(t(10)), Validity::Expired);
    }

    #[test]
    fn test_fixed_sentinel_never_expires() {
        let hint = FixedExpiration::never();
        assert!(hint.is_never());
        assert_eq!(hint.evaluate(DateTime::<Utc>::MAX_UTC), Validity::Valid);
    }

    #[test]
    fn test_idle_five_second_window() {
        let mut hint = IdleExpiration::new(Duration::seconds(5), t(0)).unwrap();
        hint.touch(t(0));
        assert_eq!(hint.evaluate(t(4)), Validity::Valid);
        assert_eq!(hint.evaluate(t(6)), Validity::Expired);
    }

    #[test]
    fn test_idle_rejects_bad_windows() {
        assert!(matches!(
            IdleExpiration::new(Duration::zero(), t(0)),
            Err(CacheError::InvalidExpirationWindow(_))
        ));
        assert!(matches!(
            IdleExpiration::new(Duration::seconds(-1), t(0)),
            Err(CacheError::InvalidExpirationWindow(_))
        ));
        assert!(matches!(
            IdleExpiration::new(Duration::days(365), t(0)),
            Err(CacheError::InvalidExpirationWindow(_))
        ));
        assert!(IdleExpiration::new(Duration::days(364), t(0)).is_ok());
    }

    #[test]
    fn test_idle_touch_never_rewinds() {
        let mut hint = IdleExpiration::new(Duration::seconds(5), t(10)).unwrap();
        hint.touch(t(3));
        assert_eq!(hint.last_access_time(), t(10));
    }

    #[test]
    fn test_evaluate_does_not_touch() {
        let hint = ExpirationHint::Idle(IdleExpiration::new(Duration::seconds(5), t(0)).unwrap());
        let before = hint.clone();
        let _ = hint.evaluate(t(3));
        assert_eq!(hint, before);
    }

    #[test]
    fn test_fixed_idle_needs_both_clocks() {
        let fixed = FixedExpiration::new(t(10));
        let idle = IdleExpiration::new(Duration::seconds(5), t(0)).unwrap();
        let mut hint = ExpirationHint::FixedIdle(FixedIdleExpiration::new(fixed, idle));

        // idle lapsed, fixed not yet
        assert!(!hint.is_expired(t(7)));
        // touch keeps the idle clock alive past the fixed deadline
        hint.touch(t(9));
        assert!(!hint.is_expired(t(12)));
        // both lapsed
        assert!(hint.is_expired(t(14)));
    }

    #[test]
    fn test_fixed_idle_touch_leaves_deadline() {
        let fixed = FixedExpiration::new(t(10));
        let idle = IdleExpiration::new(Duration::seconds(5), t(0)).unwrap();
        let mut hint = FixedIdleExpiration::new(fixed, idle);
        hint.touch(t(8));
        assert_eq!(hint.fixed().absolute_time(), t(10));
        assert_eq!(hint.idle().last_access_time(), t(8));
    }

    #[test]
    fn test_from_params_zero_means_absent() {
        assert!(ExpirationHint::from_params(None, Some(Duration::zero()), t(0))
            .unwrap()
            .is_none());
        assert!(
            ExpirationHint::from_params(Some(DateTime::<Utc>::MAX_UTC), None, t(0))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_from_params_variants() {
        let fixed = ExpirationHint::from_params(Some(t(5)), None, t(0)).unwrap().unwrap();
        assert_eq!(fixed.hint_type(), HintType::Fixed);
        assert!(!fixed.is_variant());

        let both = ExpirationHint::from_params(Some(t(5)), Some(Duration::seconds(2)), t(0))
            .unwrap()
            .unwrap();
        assert_eq!(both.hint_type(), HintType::FixedIdle);
        assert!(both.is_variant());

        assert!(ExpirationHint::from_params(None, Some(Duration::seconds(-3)), t(0)).is_err());
    }

    #[test]
    fn test_compose_pairs_fixed_and_idle() {
        let fixed = ExpirationHint::Fixed(FixedExpiration::new(t(10)));
        let idle = ExpirationHint::Idle(IdleExpiration::new(Duration::seconds(5), t(0)).unwrap());

        let composed = ExpirationHint::compose(vec![idle.clone(), fixed.clone()]).unwrap();
        assert_eq!(composed.hint_type(), HintType::FixedIdle);

        let single = ExpirationHint::compose(vec![fixed.clone()]).unwrap();
        assert_eq!(single, fixed);

        assert!(ExpirationHint::compose(vec![]).is_none());
    }

    #[test]
    fn test_aggregate_expires_on_any_child() {
        let early = ExpirationHint::Fixed(FixedExpiration::new(t(5)));
        let late = ExpirationHint::Fixed(FixedExpiration::new(t(50)));
        let hint = ExpirationHint::compose(vec![late, early]).unwrap();

        assert_eq!(hint.hint_type(), HintType::Aggregate);
        assert!(!hint.is_expired(t(4)));
        assert!(hint.is_expired(t(5)));
        assert_eq!(hint.next_deadline(), Some(t(5)));
    }

    #[test]
    fn test_next_deadline_and_remaining() {
        let idle = ExpirationHint::Idle(IdleExpiration::new(Duration::seconds(5), t(2)).unwrap());
        assert_eq!(idle.next_deadline(), Some(t(7)));
        assert_eq!(idle.remaining(t(4)), Some(Duration::seconds(3)));
        assert_eq!(idle.remaining(t(40)), Some(Duration::zero()));

        let never = ExpirationHint::Fixed(FixedExpiration::never());
        assert_eq!(never.next_deadline(), None);
    }
}
