//! Server-side lease state machine shared by blobs and containers.
//!
//! Every transition takes `now` explicitly and first resolves time-based
//! transitions (Leased -> Expired, Breaking -> Broken), so expiry is lazy and
//! checked at the point of use.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::models::{LeaseDuration, LeaseState, LeaseStatus};

pub const MIN_LEASE_SECONDS: u32 = 15;
pub const MAX_LEASE_SECONDS: u32 = 60;
pub const MAX_BREAK_SECONDS: u32 = 60;

/// Requested lease length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeasePeriod {
    Fixed(u32),
    Infinite,
}

impl LeasePeriod {
    /// Fixed period in seconds, validated against 15..=60.
    pub fn fixed(seconds: u32) -> Result<Self, ErrorCode> {
        if (MIN_LEASE_SECONDS..=MAX_LEASE_SECONDS).contains(&seconds) {
            Ok(LeasePeriod::Fixed(seconds))
        } else {
            Err(ErrorCode::InvalidHeaderValue)
        }
    }

    /// Parses `x-ms-lease-duration`: `-1` or a number of seconds in 15..=60.
    pub fn from_header(value: &str) -> Result<Self, ErrorCode> {
        match value.trim().parse::<i64>() {
            Ok(-1) => Ok(LeasePeriod::Infinite),
            Ok(n) if n >= 0 => {
                let seconds = u32::try_from(n).map_err(|_| ErrorCode::InvalidHeaderValue)?;
                LeasePeriod::fixed(seconds)
            }
            _ => Err(ErrorCode::InvalidHeaderValue),
        }
    }

    pub fn as_header(&self) -> String {
        match self {
            LeasePeriod::Fixed(s) => s.to_string(),
            LeasePeriod::Infinite => "-1".to_string(),
        }
    }

    pub fn duration_kind(&self) -> LeaseDuration {
        match self {
            LeasePeriod::Fixed(_) => LeaseDuration::Fixed,
            LeasePeriod::Infinite => LeaseDuration::Infinite,
        }
    }
}

/// Whether a write-gate check concerns a blob or a container; only the error
/// codes differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseScope {
    Blob,
    Container,
}

impl LeaseScope {
    fn mismatch(self) -> ErrorCode {
        match self {
            LeaseScope::Blob => ErrorCode::LeaseIdMismatchWithBlobOperation,
            LeaseScope::Container => ErrorCode::LeaseIdMismatchWithContainerOperation,
        }
    }

    fn not_present(self) -> ErrorCode {
        match self {
            LeaseScope::Blob => ErrorCode::LeaseNotPresentWithBlobOperation,
            LeaseScope::Container => ErrorCode::LeaseNotPresentWithContainerOperation,
        }
    }
}

/// Lease bookkeeping attached to one blob or container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub state: LeaseState,
    pub lease_id: Option<String>,
    pub period: Option<LeasePeriod>,
    pub expires_at: Option<DateTime<Utc>>,
    pub break_at: Option<DateTime<Utc>>,
}

impl LeaseRecord {
    /// Applies transitions that happen by the passage of time.
    pub fn resolve(&mut self, now: DateTime<Utc>) {
        match self.state {
            LeaseState::Leased => {
                if matches!(self.expires_at, Some(at) if at <= now) {
                    self.state = LeaseState::Expired;
                    self.expires_at = None;
                }
            }
            LeaseState::Breaking => {
                if matches!(self.break_at, Some(at) if at <= now) {
                    self.state = LeaseState::Broken;
                    self.break_at = None;
                    self.expires_at = None;
                }
            }
            _ => {}
        }
    }

    /// State as observed at `now`, without mutating.
    pub fn observed(&self, now: DateTime<Utc>) -> LeaseRecord {
        let mut copy = self.clone();
        copy.resolve(now);
        copy
    }

    pub fn status(&self) -> LeaseStatus {
        match self.state {
            LeaseState::Leased | LeaseState::Breaking => LeaseStatus::Locked,
            _ => LeaseStatus::Unlocked,
        }
    }

    /// `x-ms-lease-duration` is only reported while the lease is held.
    pub fn duration(&self) -> Option<LeaseDuration> {
        match self.state {
            LeaseState::Leased => self.period.map(|p| p.duration_kind()),
            _ => None,
        }
    }

    fn start(&mut self, lease_id: &str, period: LeasePeriod, now: DateTime<Utc>) {
        self.state = LeaseState::Leased;
        self.lease_id = Some(lease_id.to_string());
        self.period = Some(period);
        self.break_at = None;
        self.expires_at = match period {
            LeasePeriod::Fixed(s) => Some(now + Duration::seconds(i64::from(s))),
            LeasePeriod::Infinite => None,
        };
    }

    fn holds(&self, lease_id: &str) -> bool {
        self.lease_id.as_deref() == Some(lease_id)
    }

    /// Acquires the lease for `proposed_id`. Re-acquiring with the current id
    /// restarts the lease with the new period.
    pub fn acquire(
        &mut self,
        proposed_id: &str,
        period: LeasePeriod,
        now: DateTime<Utc>,
    ) -> Result<(), ErrorCode> {
        self.resolve(now);
        match self.state {
            LeaseState::Leased if !self.holds(proposed_id) => Err(ErrorCode::LeaseAlreadyPresent),
            LeaseState::Breaking => Err(ErrorCode::LeaseIsBreakingAndCannotBeAcquired),
            _ => {
                self.start(proposed_id, period, now);
                Ok(())
            }
        }
    }

    /// Restarts the lease clock. Fails once the lease has expired or broken.
    pub fn renew(&mut self, lease_id: &str, now: DateTime<Utc>) -> Result<(), ErrorCode> {
        self.resolve(now);
        match self.state {
            LeaseState::Available => Err(ErrorCode::LeaseNotPresentWithLeaseOperation),
            _ if !self.holds(lease_id) => Err(ErrorCode::LeaseIdMismatchWithLeaseOperation),
            LeaseState::Leased => {
                let period = self.period.unwrap_or(LeasePeriod::Infinite);
                self.start(lease_id, period, now);
                Ok(())
            }
            LeaseState::Expired => Err(ErrorCode::LeaseLost),
            LeaseState::Breaking | LeaseState::Broken => {
                Err(ErrorCode::LeaseIsBrokenAndCannotBeRenewed)
            }
        }
    }

    /// Swaps the lease id while keeping the expiry.
    pub fn change(
        &mut self,
        lease_id: &str,
        proposed_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ErrorCode> {
        self.resolve(now);
        match self.state {
            LeaseState::Leased if self.holds(lease_id) || self.holds(proposed_id) => {
                self.lease_id = Some(proposed_id.to_string());
                Ok(())
            }
            LeaseState::Leased => Err(ErrorCode::LeaseIdMismatchWithLeaseOperation),
            LeaseState::Breaking => Err(ErrorCode::LeaseIsBreakingAndCannotBeChanged),
            _ => Err(ErrorCode::LeaseNotPresentWithLeaseOperation),
        }
    }

    /// Releases the lease so it can be acquired immediately.
    pub fn release(&mut self, lease_id: &str, now: DateTime<Utc>) -> Result<(), ErrorCode> {
        self.resolve(now);
        match self.state {
            LeaseState::Available => Err(ErrorCode::LeaseNotPresentWithLeaseOperation),
            _ if !self.holds(lease_id) => Err(ErrorCode::LeaseIdMismatchWithLeaseOperation),
            _ => {
                *self = LeaseRecord::default();
                Ok(())
            }
        }
    }

    /// Breaks the lease. Returns the seconds until it is broken.
    ///
    /// Without a period, a fixed lease breaks when it would have expired and
    /// an infinite lease breaks at once. A requested period never extends a
    /// fixed lease past its own expiry.
    pub fn break_lease(
        &mut self,
        break_period: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<u32, ErrorCode> {
        if matches!(break_period, Some(p) if p > MAX_BREAK_SECONDS) {
            return Err(ErrorCode::InvalidHeaderValue);
        }
        self.resolve(now);
        match self.state {
            LeaseState::Available => Err(ErrorCode::LeaseNotPresentWithLeaseOperation),
            LeaseState::Expired | LeaseState::Broken => {
                self.state = LeaseState::Broken;
                Ok(0)
            }
            LeaseState::Breaking => {
                let remaining = self.seconds_until(self.break_at, now);
                match break_period {
                    Some(p) if p < remaining => {
                        self.schedule_break(p, now);
                        Ok(p)
                    }
                    _ => Ok(remaining),
                }
            }
            LeaseState::Leased => {
                let until_expiry = self.expires_at.map(|at| self.seconds_until(Some(at), now));
                let seconds = match (break_period, until_expiry) {
                    (Some(p), Some(left)) => p.min(left),
                    (Some(p), None) => p,
                    (None, Some(left)) => left,
                    (None, None) => 0,
                };
                self.schedule_break(seconds, now);
                Ok(seconds)
            }
        }
    }

    fn schedule_break(&mut self, seconds: u32, now: DateTime<Utc>) {
        if seconds == 0 {
            self.state = LeaseState::Broken;
            self.break_at = None;
            self.expires_at = None;
        } else {
            self.state = LeaseState::Breaking;
            self.break_at = Some(now + Duration::seconds(i64::from(seconds)));
        }
    }

    /// Whole seconds from `now` to `at`, rounded up.
    fn seconds_until(&self, at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> u32 {
        let Some(at) = at else { return 0 };
        let millis = (at - now).num_milliseconds().max(0);
        u32::try_from((millis + 999) / 1000).unwrap_or(u32::MAX)
    }

    /// Gate for writes and deletes against the leased resource.
    pub fn check_write(
        &mut self,
        provided_id: Option<&str>,
        scope: LeaseScope,
        now: DateTime<Utc>,
    ) -> Result<(), ErrorCode> {
        self.resolve(now);
        match (self.state, provided_id) {
            (LeaseState::Leased | LeaseState::Breaking, None) => Err(ErrorCode::LeaseIdMissing),
            (LeaseState::Leased | LeaseState::Breaking, Some(id)) if !self.holds(id) => {
                Err(scope.mismatch())
            }
            (LeaseState::Leased | LeaseState::Breaking, Some(_)) => Ok(()),
            (LeaseState::Expired | LeaseState::Broken, Some(id)) if self.holds(id) => {
                Err(ErrorCode::LeaseLost)
            }
            (_, Some(_)) => Err(scope.not_present()),
            (_, None) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "11111111-1111-1111-1111-111111111111";
    const B: &str = "22222222-2222-2222-2222-222222222222";

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn secs(n: i64) -> DateTime<Utc> {
        t0() + Duration::seconds(n)
    }

    #[test]
    fn period_validation() {
        assert!(LeasePeriod::fixed(14).is_err());
        assert!(LeasePeriod::fixed(61).is_err());
        assert_eq!(LeasePeriod::from_header("-1"), Ok(LeasePeriod::Infinite));
        assert_eq!(LeasePeriod::from_header("30"), Ok(LeasePeriod::Fixed(30)));
        assert!(LeasePeriod::from_header("-2").is_err());
        assert!(LeasePeriod::from_header("abc").is_err());
    }

    #[test]
    fn second_owner_conflicts_until_release() {
        let mut lease = LeaseRecord::default();
        lease.acquire(A, LeasePeriod::Fixed(30), t0()).unwrap();
        assert_eq!(
            lease.acquire(B, LeasePeriod::Fixed(30), secs(1)),
            Err(ErrorCode::LeaseAlreadyPresent)
        );
        lease.release(A, secs(2)).unwrap();
        lease.acquire(B, LeasePeriod::Fixed(30), secs(3)).unwrap();
        assert_eq!(lease.lease_id.as_deref(), Some(B));
    }

    #[test]
    fn same_owner_reacquire_renews() {
        let mut lease = LeaseRecord::default();
        lease.acquire(A, LeasePeriod::Fixed(15), t0()).unwrap();
        lease.acquire(A, LeasePeriod::Fixed(60), secs(10)).unwrap();
        assert_eq!(lease.expires_at, Some(secs(70)));
    }

    #[test]
    fn expiry_is_lazy() {
        let mut lease = LeaseRecord::default();
        lease.acquire(A, LeasePeriod::Fixed(15), t0()).unwrap();
        assert_eq!(lease.observed(secs(14)).state, LeaseState::Leased);
        assert_eq!(lease.observed(secs(15)).state, LeaseState::Expired);
        assert_eq!(lease.renew(A, secs(16)), Err(ErrorCode::LeaseLost));
        // An expired lease can be taken by anyone.
        lease.acquire(B, LeasePeriod::Infinite, secs(17)).unwrap();
    }

    #[test]
    fn renew_checks_owner() {
        let mut lease = LeaseRecord::default();
        lease.acquire(A, LeasePeriod::Fixed(20), t0()).unwrap();
        assert_eq!(lease.renew(B, secs(1)), Err(ErrorCode::LeaseIdMismatchWithLeaseOperation));
        lease.renew(A, secs(10)).unwrap();
        assert_eq!(lease.expires_at, Some(secs(30)));
    }

    #[test]
    fn break_with_period_then_broken() {
        let mut lease = LeaseRecord::default();
        lease.acquire(A, LeasePeriod::Infinite, t0()).unwrap();
        assert_eq!(lease.break_lease(Some(10), secs(1)), Ok(10));
        assert_eq!(lease.state, LeaseState::Breaking);
        assert_eq!(
            lease.acquire(B, LeasePeriod::Infinite, secs(2)),
            Err(ErrorCode::LeaseIsBreakingAndCannotBeAcquired)
        );
        assert_eq!(lease.renew(A, secs(2)), Err(ErrorCode::LeaseIsBrokenAndCannotBeRenewed));
        assert_eq!(lease.observed(secs(11)).state, LeaseState::Broken);
        lease.acquire(B, LeasePeriod::Fixed(15), secs(12)).unwrap();
    }

    #[test]
    fn break_never_extends_fixed_lease() {
        let mut lease = LeaseRecord::default();
        lease.acquire(A, LeasePeriod::Fixed(20), t0()).unwrap();
        assert_eq!(lease.break_lease(Some(60), secs(15)), Ok(5));
        assert_eq!(lease.break_lease(None, secs(16)), Ok(4));
    }

    #[test]
    fn break_infinite_without_period_is_immediate() {
        let mut lease = LeaseRecord::default();
        lease.acquire(A, LeasePeriod::Infinite, t0()).unwrap();
        assert_eq!(lease.break_lease(None, secs(1)), Ok(0));
        assert_eq!(lease.state, LeaseState::Broken);
        // Breaking a broken lease is idempotent.
        assert_eq!(lease.break_lease(Some(30), secs(2)), Ok(0));
        assert!(lease.break_lease(Some(61), secs(2)).is_err());
    }

    #[test]
    fn break_available_fails() {
        let mut lease = LeaseRecord::default();
        assert_eq!(
            lease.break_lease(None, t0()),
            Err(ErrorCode::LeaseNotPresentWithLeaseOperation)
        );
    }

    #[test]
    fn change_swaps_id() {
        let mut lease = LeaseRecord::default();
        lease.acquire(A, LeasePeriod::Fixed(30), t0()).unwrap();
        lease.change(A, B, secs(1)).unwrap();
        assert_eq!(lease.release(A, secs(2)), Err(ErrorCode::LeaseIdMismatchWithLeaseOperation));
        lease.release(B, secs(2)).unwrap();
        assert_eq!(lease.state, LeaseState::Available);
    }

    #[test]
    fn write_gate() {
        let mut lease = LeaseRecord::default();
        assert!(lease.check_write(None, LeaseScope::Blob, t0()).is_ok());
        assert_eq!(
            lease.check_write(Some(A), LeaseScope::Blob, t0()),
            Err(ErrorCode::LeaseNotPresentWithBlobOperation)
        );

        lease.acquire(A, LeasePeriod::Fixed(15), t0()).unwrap();
        assert_eq!(
            lease.check_write(None, LeaseScope::Blob, secs(1)),
            Err(ErrorCode::LeaseIdMissing)
        );
        assert_eq!(
            lease.check_write(Some(B), LeaseScope::Container, secs(1)),
            Err(ErrorCode::LeaseIdMismatchWithContainerOperation)
        );
        assert!(lease.check_write(Some(A), LeaseScope::Blob, secs(1)).is_ok());

        assert_eq!(
            lease.check_write(Some(A), LeaseScope::Blob, secs(20)),
            Err(ErrorCode::LeaseLost)
        );
        assert!(lease.check_write(None, LeaseScope::Blob, secs(20)).is_ok());
    }
}
