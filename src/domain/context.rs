use crate::error::{Result, TenantError};
use std::future::Future;
use std::time::Duration;
use tracing::Span;

/// Time reserved at the end of a request for flushing logs and metrics.
const TIMEOUT_MARGIN: Duration = Duration::from_secs(5);
/// Timeout assumed when the caller did not set one.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Request-scoped attributes passed explicitly to every operation.
///
/// Carries the caller's timeout, which bounds each store call, and the identity
/// fields that end up on the operation's tracing span.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    timeout: Option<Duration>,
    event_id: Option<String>,
    service: Option<String>,
    attrs: Vec<(String, String)>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_event(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.push((key.into(), value.into()));
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn event_id(&self) -> Option<&str> {
        self.event_id.as_deref()
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .rev()
            .find_map(|(k, v)| (k == key).then_some(v.as_str()))
    }

    /// Makes sure a timeout is set, keeping a margin for post-request work.
    ///
    /// Timeouts shorter than three margins are left untouched.
    pub fn ensure_timeout(mut self) -> Self {
        self.timeout = Some(match self.timeout {
            Some(t) if t > TIMEOUT_MARGIN * 3 => t - TIMEOUT_MARGIN,
            Some(t) => t,
            None => DEFAULT_TIMEOUT - TIMEOUT_MARGIN,
        });
        self
    }

    /// Builds the span for one operation carrying the request's identity fields.
    pub fn span(&self, operation: &'static str) -> Span {
        let attrs = self
            .attrs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        tracing::info_span!(
            "tenantcore",
            op = operation,
            event_id = self.event_id.as_deref().unwrap_or_default(),
            service = self.service.as_deref().unwrap_or_default(),
            attrs = %attrs,
        )
    }

    /// Runs a store call under the request timeout. An elapsed timeout is not retried.
    pub async fn bound<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| TenantError::DeadlineExceeded(limit))?,
            None => fut.await,
        }
    }
}
