//! Lease handlers for blobs and containers.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, StatusCode};
use std::sync::Arc;
use tracing::debug;

use crate::context::RequestContext;
use crate::emulator::store::MetadataStore;
use crate::error::{ErrorCode, StorageError, StorageResult};
use crate::lease::{LeasePeriod, LeaseRecord};
use crate::transport::TransportResponse;

use super::blob::live_blob;
use super::{add_etag_headers, build_response, common_headers, parse_lease_id, put_header};

/// A parsed `x-ms-lease-action` request.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LeaseAction {
    Acquire { period: LeasePeriod, proposed_id: String },
    Renew { lease_id: String },
    Change { lease_id: String, proposed_id: String },
    Release { lease_id: String },
    Break { period: Option<u32> },
}

fn required_header<'a>(ctx: &'a RequestContext, name: &str) -> StorageResult<&'a str> {
    ctx.header(name).ok_or_else(|| {
        StorageError::with_message(ErrorCode::MissingRequiredHeader, format!("{name} is required"))
    })
}

impl LeaseAction {
    fn from_request(ctx: &RequestContext) -> StorageResult<Self> {
        let action = required_header(ctx, "x-ms-lease-action")?;
        let lease_id = || required_header(ctx, "x-ms-lease-id").and_then(parse_lease_id);
        let proposed_id =
            || required_header(ctx, "x-ms-proposed-lease-id").and_then(parse_lease_id);

        match action.to_ascii_lowercase().as_str() {
            "acquire" => {
                let period = LeasePeriod::from_header(required_header(ctx, "x-ms-lease-duration")?)
                    .map_err(|code| {
                        StorageError::with_message(code, "lease duration must be -1 or 15..=60")
                    })?;
                let proposed_id = match ctx.header("x-ms-proposed-lease-id") {
                    Some(id) => parse_lease_id(id)?,
                    None => uuid::Uuid::new_v4().to_string(),
                };
                Ok(LeaseAction::Acquire { period, proposed_id })
            }
            "renew" => Ok(LeaseAction::Renew { lease_id: lease_id()? }),
            "change" => Ok(LeaseAction::Change {
                lease_id: lease_id()?,
                proposed_id: proposed_id()?,
            }),
            "release" => Ok(LeaseAction::Release { lease_id: lease_id()? }),
            "break" => {
                let period = ctx
                    .header("x-ms-lease-break-period")
                    .map(|v| {
                        v.parse::<u32>()
                            .map_err(|_| StorageError::new(ErrorCode::InvalidHeaderValue))
                    })
                    .transpose()?;
                Ok(LeaseAction::Break { period })
            }
            other => Err(StorageError::with_message(
                ErrorCode::InvalidHeaderValue,
                format!("unknown lease action {other}"),
            )),
        }
    }

    /// Applies the action, writing the lease response headers.
    fn apply(
        &self,
        record: &mut LeaseRecord,
        now: DateTime<Utc>,
        headers: &mut HeaderMap,
    ) -> StorageResult<StatusCode> {
        match self {
            LeaseAction::Acquire { period, proposed_id } => {
                record.acquire(proposed_id, *period, now).map_err(StorageError::new)?;
                put_header(headers, "x-ms-lease-id", proposed_id);
                Ok(StatusCode::CREATED)
            }
            LeaseAction::Renew { lease_id } => {
                record.renew(lease_id, now).map_err(StorageError::new)?;
                put_header(headers, "x-ms-lease-id", lease_id);
                Ok(StatusCode::OK)
            }
            LeaseAction::Change { lease_id, proposed_id } => {
                record.change(lease_id, proposed_id, now).map_err(StorageError::new)?;
                put_header(headers, "x-ms-lease-id", proposed_id);
                Ok(StatusCode::OK)
            }
            LeaseAction::Release { lease_id } => {
                record.release(lease_id, now).map_err(StorageError::new)?;
                Ok(StatusCode::OK)
            }
            LeaseAction::Break { period } => {
                let seconds = record.break_lease(*period, now).map_err(StorageError::new)?;
                put_header(headers, "x-ms-lease-time", &seconds.to_string());
                Ok(StatusCode::ACCEPTED)
            }
        }
    }
}

/// PUT /{container}/{blob}?comp=lease - Blob lease operations.
pub async fn blob_lease(
    ctx: &RequestContext,
    metadata: Arc<dyn MetadataStore>,
) -> StorageResult<TransportResponse> {
    let action = LeaseAction::from_request(ctx)?;
    let mut headers = common_headers(ctx);
    let mut status = StatusCode::OK;

    let blob = metadata
        .write_blob(ctx.container_name()?, ctx.blob_name()?, &mut |slot| {
            let blob = live_blob(slot)?;
            super::check_conditions(ctx, Some(&blob.properties.etag))?;
            status = action.apply(&mut blob.lease, ctx.timestamp, &mut headers)?;
            Ok(())
        })
        .await?
        .ok_or_else(|| StorageError::new(ErrorCode::BlobNotFound))?;
    debug!(blob = %blob.name, action = ?action, "blob lease updated");

    add_etag_headers(&mut headers, &blob.properties.etag, &blob.properties.last_modified);
    Ok(build_response(status, headers, Bytes::new()))
}

/// PUT /{container}?restype=container&comp=lease - Container lease operations.
pub async fn container_lease(
    ctx: &RequestContext,
    metadata: Arc<dyn MetadataStore>,
) -> StorageResult<TransportResponse> {
    let action = LeaseAction::from_request(ctx)?;
    let mut headers = common_headers(ctx);
    let mut status = StatusCode::OK;

    let container = metadata
        .update_container(ctx.container_name()?, &mut |container| {
            status = action.apply(&mut container.lease, ctx.timestamp, &mut headers)?;
            Ok(())
        })
        .await?;
    debug!(container = %container.name, action = ?action, "container lease updated");

    add_etag_headers(&mut headers, &container.etag, &container.last_modified);
    Ok(build_response(status, headers, Bytes::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportRequest;
    use http::Method;

    const ID: &str = "11111111-1111-1111-1111-111111111111";

    fn ctx_with(headers: &[(&str, &str)]) -> RequestContext {
        let mut request = TransportRequest::new(Method::PUT, "/c/b").with_query("comp", "lease");
        for (name, value) in headers {
            request.set_header(name, value).unwrap();
        }
        RequestContext::from_request(request)
    }

    #[test]
    fn parses_acquire() {
        let ctx = ctx_with(&[
            ("x-ms-lease-action", "acquire"),
            ("x-ms-lease-duration", "-1"),
            ("x-ms-proposed-lease-id", ID),
        ]);
        assert_eq!(
            LeaseAction::from_request(&ctx).unwrap(),
            LeaseAction::Acquire {
                period: LeasePeriod::Infinite,
                proposed_id: ID.to_string(),
            }
        );
    }

    #[test]
    fn rejects_bad_duration_and_missing_id() {
        let ctx = ctx_with(&[("x-ms-lease-action", "acquire"), ("x-ms-lease-duration", "5")]);
        assert_eq!(
            LeaseAction::from_request(&ctx).unwrap_err().code,
            ErrorCode::InvalidHeaderValue
        );

        let ctx = ctx_with(&[("x-ms-lease-action", "renew")]);
        assert_eq!(
            LeaseAction::from_request(&ctx).unwrap_err().code,
            ErrorCode::MissingRequiredHeader
        );
    }

    #[test]
    fn break_reports_lease_time() {
        let mut record = LeaseRecord::default();
        let now = Utc::now();
        record.acquire(ID, LeasePeriod::Infinite, now).unwrap();

        let mut headers = HeaderMap::new();
        let status = LeaseAction::Break { period: Some(10) }
            .apply(&mut record, now, &mut headers)
            .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(headers.get("x-ms-lease-time").unwrap(), "10");
    }
}
