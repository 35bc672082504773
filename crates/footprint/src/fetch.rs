//! One query link, fetched through the slot's identity with ban detection and
//! bounded retry-then-rotate.

use crate::error::{CollectError, CollectResult};
use crate::headers::HeaderSource;
use crate::identity::{Identity, IdentityBackend, IdentityController};
use crate::link::QueryLink;
use crate::metrics::WorkerMetrics;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use std::time::Duration;

/// Text Overpass puts in the body when an address has used up its quota.
pub const BAN_MARKER: &str = "quota of your IP address";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

/// Issues a single GET through an identity.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(
        &self,
        identity: &Identity,
        url: &str,
        headers: HeaderMap,
    ) -> CollectResult<RawResponse>;
}

#[derive(Clone, Copy, Debug)]
pub struct HttpTransport {
    pub timeout: Duration,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(
        &self,
        identity: &Identity,
        url: &str,
        headers: HeaderMap,
    ) -> CollectResult<RawResponse> {
        let response = identity
            .client()
            .get(url)
            .headers(headers)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| CollectError::TransportFailure(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| CollectError::TransportFailure(e.to_string()))?;
        Ok(RawResponse { status, body })
    }
}

/// Non-200 statuses and bodies carrying the quota marker are bans.
pub fn classify(response: RawResponse, ban_marker: &str) -> CollectResult<String> {
    if response.status != 200 || response.body.contains(ban_marker) {
        return Err(CollectError::BanSignal {
            status: response.status,
        });
    }
    Ok(response.body)
}

#[derive(Clone, Debug)]
pub struct FetchPolicy {
    pub max_attempts: u32,
    pub ban_marker: String,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            ban_marker: BAN_MARKER.into(),
        }
    }
}

/// Fetches `link`, rotating identity between failed attempts.
///
/// At most `policy.max_attempts` requests are made. Errors that are not a ban
/// or transport failure (including `ConnectivityExhausted` from a rotation)
/// are returned immediately.
pub async fn fetch_with_retry<B, T, H>(
    link: &QueryLink,
    controller: &mut IdentityController<B>,
    transport: &T,
    headers: &H,
    policy: &FetchPolicy,
    metrics: &WorkerMetrics,
) -> CollectResult<String>
where
    B: IdentityBackend,
    T: Transport + ?Sized,
    H: HeaderSource + ?Sized,
{
    let slot = controller.slot();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        metrics.fetch_attempts_total.inc();

        let result = {
            let identity = controller.current()?;
            transport.get(identity, &link.url, headers.headers()).await
        };
        let err = match result.and_then(|response| classify(response, &policy.ban_marker)) {
            Ok(body) => return Ok(body),
            Err(e) if e.is_retryable() => e,
            Err(e) => return Err(e),
        };

        match &err {
            CollectError::BanSignal { status } => {
                metrics.ban_signals_total.inc();
                tracing::warn!(slot, status, attempt, coord = %link.key, "Quota error from query service");
            }
            _ => {
                metrics.transport_failures_total.inc();
                tracing::warn!(slot, attempt, coord = %link.key, error = %err, "Request failed");
            }
        }

        if attempt >= policy.max_attempts {
            return Err(CollectError::RetriesExhausted {
                attempts: attempt,
                last: Box::new(err),
            });
        }

        metrics.identity_rotations_total.inc();
        controller.rotate().await?;
    }
}
