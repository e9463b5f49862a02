//! Client-side lease handle.

use chrono::{DateTime, Duration, Utc};
use http::Method;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

use super::state::{
    LeasePeriod, LeaseScope, MAX_BREAK_SECONDS, MAX_LEASE_SECONDS, MIN_LEASE_SECONDS,
};
use crate::client::required_header;
use crate::error::{BlobError, BlobResult, ErrorCode};
use crate::pipeline::Pipeline;
use crate::transport::TransportRequest;

/// The lease as this handle last saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub lease_id: String,
    pub period: LeasePeriod,
    pub acquired_at: DateTime<Utc>,
    /// `None` for an infinite lease.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Lease {
    fn started(lease_id: String, period: LeasePeriod, now: DateTime<Utc>) -> Self {
        let expires_at = match period {
            LeasePeriod::Fixed(seconds) => Some(now + Duration::seconds(i64::from(seconds))),
            LeasePeriod::Infinite => None,
        };
        Self {
            lease_id,
            period,
            acquired_at: now,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct State {
    lease_id: String,
    lease: Option<Lease>,
}

/// Drives the lease of one blob or container. The handle remembers the
/// lease id it proposes and the lease it last held.
pub struct LeaseClient {
    pipeline: Arc<Pipeline>,
    path: String,
    scope: LeaseScope,
    state: Mutex<State>,
}

impl LeaseClient {
    pub(crate) fn new(
        pipeline: Arc<Pipeline>,
        path: String,
        scope: LeaseScope,
        lease_id: Option<String>,
    ) -> Self {
        let lease_id = lease_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self {
            pipeline,
            path,
            scope,
            state: Mutex::new(State {
                lease_id,
                lease: None,
            }),
        }
    }

    /// Lease id sent with the next operation.
    pub fn lease_id(&self) -> String {
        self.state.lock().lease_id.clone()
    }

    pub fn lease(&self) -> Option<Lease> {
        self.state.lock().lease.clone()
    }

    fn request(&self, action: &str) -> BlobResult<TransportRequest> {
        let mut request = TransportRequest::new(Method::PUT, self.path.clone());
        if self.scope == LeaseScope::Container {
            request = request.with_query("restype", "container");
        }
        request
            .with_query("comp", "lease")
            .with_header("x-ms-lease-action", action)
    }

    /// Acquires the lease, or restarts it if this handle already holds it.
    pub async fn acquire(&self, period: LeasePeriod) -> BlobResult<Lease> {
        if let LeasePeriod::Fixed(seconds) = period {
            if !(MIN_LEASE_SECONDS..=MAX_LEASE_SECONDS).contains(&seconds) {
                return Err(BlobError::InvalidInput(format!(
                    "lease duration {seconds}s outside {MIN_LEASE_SECONDS}..={MAX_LEASE_SECONDS}"
                )));
            }
        }
        let proposed = self.lease_id();
        let request = self
            .request("acquire")?
            .with_header("x-ms-lease-duration", period.as_header())?
            .with_header("x-ms-proposed-lease-id", &proposed)?;
        let response = self.pipeline.send("acquire_lease", request).await?;
        let lease_id = required_header(&response, "acquire_lease", &self.path, "x-ms-lease-id")?;

        let lease = Lease::started(lease_id.clone(), period, Utc::now());
        let mut state = self.state.lock();
        state.lease_id = lease_id;
        state.lease = Some(lease.clone());
        info!(
            resource = %self.path,
            lease_id = %lease.lease_id,
            period = %period.as_header(),
            "lease acquired"
        );
        Ok(lease)
    }

    /// Renews the held lease. A lease this handle knows to have expired is
    /// reported lost without a round trip.
    pub async fn renew(&self) -> BlobResult<Lease> {
        let (lease_id, known) = {
            let state = self.state.lock();
            (state.lease_id.clone(), state.lease.clone())
        };
        if known.as_ref().is_some_and(|lease| lease.is_expired(Utc::now())) {
            return Err(BlobError::LeaseLost {
                operation: "renew_lease",
                resource: self.path.clone(),
                code: ErrorCode::LeaseLost,
            });
        }
        let request = self.request("renew")?.with_header("x-ms-lease-id", &lease_id)?;
        self.pipeline.send("renew_lease", request).await?;

        let period = known.map_or(LeasePeriod::Infinite, |lease| lease.period);
        let lease = Lease::started(lease_id, period, Utc::now());
        self.state.lock().lease = Some(lease.clone());
        debug!(resource = %self.path, lease_id = %lease.lease_id, "lease renewed");
        Ok(lease)
    }

    /// Swaps the lease id for `proposed_id`, keeping the expiry.
    pub async fn change(&self, proposed_id: impl Into<String>) -> BlobResult<String> {
        let proposed_id = proposed_id.into();
        if uuid::Uuid::parse_str(&proposed_id).is_err() {
            return Err(BlobError::InvalidInput(format!(
                "lease id {proposed_id:?} is not a UUID"
            )));
        }
        let request = self
            .request("change")?
            .with_header("x-ms-lease-id", self.lease_id())?
            .with_header("x-ms-proposed-lease-id", &proposed_id)?;
        let response = self.pipeline.send("change_lease", request).await?;
        let new_id = required_header(&response, "change_lease", &self.path, "x-ms-lease-id")?;

        let mut state = self.state.lock();
        state.lease_id = new_id.clone();
        if let Some(ref mut lease) = state.lease {
            lease.lease_id = new_id.clone();
        }
        debug!(resource = %self.path, lease_id = %new_id, "lease id changed");
        Ok(new_id)
    }

    pub async fn release(&self) -> BlobResult<()> {
        let request = self.request("release")?.with_header("x-ms-lease-id", self.lease_id())?;
        self.pipeline.send("release_lease", request).await?;
        self.state.lock().lease = None;
        info!(resource = %self.path, "lease released");
        Ok(())
    }

    /// Breaks the lease held by anyone. Returns the seconds until it is
    /// broken; a fixed lease never outlives its own expiry.
    pub async fn break_lease(&self, break_period: Option<u32>) -> BlobResult<u32> {
        let mut request = self.request("break")?;
        if let Some(seconds) = break_period {
            if seconds > MAX_BREAK_SECONDS {
                return Err(BlobError::InvalidInput(format!(
                    "break period {seconds}s outside 0..={MAX_BREAK_SECONDS}"
                )));
            }
            request.set_header("x-ms-lease-break-period", seconds.to_string())?;
        }
        let response = self.pipeline.send("break_lease", request).await?;
        let remaining = required_header(&response, "break_lease", &self.path, "x-ms-lease-time")?
            .parse::<u32>()
            .map_err(|e| BlobError::malformed("break_lease", self.path.clone(), e))?;
        self.state.lock().lease = None;
        info!(resource = %self.path, remaining, "lease broken");
        Ok(remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_lease_expires() {
        let now = Utc::now();
        let lease = Lease::started("id".into(), LeasePeriod::Fixed(15), now);
        assert!(!lease.is_expired(now + Duration::seconds(14)));
        assert!(lease.is_expired(now + Duration::seconds(15)));

        let infinite = Lease::started("id".into(), LeasePeriod::Infinite, now);
        assert!(!infinite.is_expired(now + Duration::days(365)));
    }
}
