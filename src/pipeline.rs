//! Request pipeline: stamps protocol headers, attaches the bearer token,
//! sends through the transport, and turns error responses into `BlobError`s.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::ClientConfig;
use crate::context::format_http_date;
use crate::error::{classify_response, BlobError, BlobResult};
use crate::retry::RetryPolicy;
use crate::transport::{
    AccessToken, ResponseBody, TokenCredential, Transport, TransportRequest, TransportResponse,
};

/// Tokens are refreshed this long before they expire.
const TOKEN_REFRESH_SKEW_SECS: i64 = 300;

/// Shared by every client handle derived from one service client.
pub struct Pipeline {
    transport: Arc<dyn Transport>,
    credential: Option<Arc<dyn TokenCredential>>,
    cached_token: Mutex<Option<AccessToken>>,
    config: ClientConfig,
    retry: RetryPolicy,
}

impl Pipeline {
    pub fn new(
        transport: Arc<dyn Transport>,
        credential: Option<Arc<dyn TokenCredential>>,
        config: ClientConfig,
    ) -> Self {
        let retry = RetryPolicy::new(config.retry.clone());
        Self {
            transport,
            credential,
            cached_token: Mutex::new(None),
            config,
            retry,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns a bearer token, refreshing the cached one when it is close to
    /// expiry.
    async fn bearer_token(
        &self,
        operation: &'static str,
        resource: &str,
    ) -> BlobResult<Option<String>> {
        let Some(credential) = &self.credential else {
            return Ok(None);
        };
        let mut cached = self.cached_token.lock().await;
        let skew = chrono::Duration::seconds(TOKEN_REFRESH_SKEW_SECS);
        let fresh = cached
            .as_ref()
            .filter(|token| !token.expires_within(skew, Utc::now()))
            .map(|token| token.token.clone());
        if let Some(token) = fresh {
            return Ok(Some(token));
        }

        let token = credential
            .get_token()
            .await
            .map_err(|source| BlobError::Transport {
                operation,
                resource: resource.to_string(),
                source,
            })?;
        debug!(expires_at = %token.expires_at, "bearer token refreshed");
        let value = token.token.clone();
        *cached = Some(token);
        Ok(Some(value))
    }

    /// Sends one request without retrying. Non-success responses are
    /// classified; the body of a successful response is left unread.
    pub async fn send_once(
        &self,
        operation: &'static str,
        mut request: TransportRequest,
    ) -> BlobResult<TransportResponse> {
        let resource = request.path.clone();
        request.set_header("x-ms-version", &self.config.api_version)?;
        request.set_header("x-ms-date", format_http_date(&Utc::now()))?;
        if request.header("x-ms-client-request-id").is_none() {
            request.set_header("x-ms-client-request-id", uuid::Uuid::new_v4().to_string())?;
        }
        if let Some(token) = self.bearer_token(operation, &resource).await? {
            request.set_header("authorization", format!("Bearer {token}"))?;
        }
        let if_match = request.header("if-match").map(String::from);

        trace!(operation, resource = %resource, method = %request.method, "sending request");
        let response = self
            .transport
            .send(request)
            .await
            .map_err(|source| BlobError::Transport {
                operation,
                resource: resource.clone(),
                source,
            })?;

        if response.is_success() {
            return Ok(response);
        }

        let status = response.status;
        let headers = response.headers;
        let body = response
            .body
            .collect()
            .await
            .map_err(|source| BlobError::Transport {
                operation,
                resource: resource.clone(),
                source,
            })?;
        let err = classify_response(
            operation,
            &resource,
            status,
            &headers,
            &body,
            if_match.as_deref(),
        );
        debug!(operation, resource = %resource, status = %status, error = %err, "request failed");
        Err(err)
    }

    /// Sends a request under the retry policy.
    pub async fn send(
        &self,
        operation: &'static str,
        request: TransportRequest,
    ) -> BlobResult<TransportResponse> {
        self.send_cancellable(operation, request, None).await
    }

    pub async fn send_cancellable(
        &self,
        operation: &'static str,
        request: TransportRequest,
        cancel: Option<&CancellationToken>,
    ) -> BlobResult<TransportResponse> {
        let resource = request.path.clone();
        self.retry
            .run(operation, &resource, cancel, || self.send_once(operation, request.clone()))
            .await
    }

    /// Sends a request and buffers the response body, retrying the pair.
    pub async fn send_collect(
        &self,
        operation: &'static str,
        request: TransportRequest,
        cancel: Option<&CancellationToken>,
    ) -> BlobResult<(TransportResponse, bytes::Bytes)> {
        let resource = request.path.clone();
        self.retry
            .run(operation, &resource, cancel, || async {
                let mut response = self.send_once(operation, request.clone()).await?;
                let body = std::mem::replace(&mut response.body, ResponseBody::empty())
                    .collect()
                    .await
                    .map_err(|source| BlobError::Transport {
                        operation,
                        resource: resource.clone(),
                        source,
                    })?;
                Ok((response, body))
            })
            .await
    }
}
