use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::clock::{Clock, SystemClock};
use crate::error::KiraError;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one; `None` retries forever.
    pub max_attempts: Option<u32>,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub retryable_statuses: Vec<u16>,
    pub retryable_methods: Vec<Method>,
    pub connect_timeout: Duration,
}

impl RetryPolicy {
    /// Policy for reads: connection failures and throttling/server errors on GET and HEAD.
    pub fn idempotent() -> Self {
        Self {
            max_attempts: Some(10),
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(120),
            retryable_statuses: vec![429, 500, 502, 503, 504],
            retryable_methods: vec![Method::GET, Method::HEAD],
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Policy for job submission, which the aggregator throttles with 420 and 503.
    pub fn submission() -> Self {
        Self {
            max_attempts: Some(250),
            backoff_base: Duration::from_secs(4),
            backoff_cap: Duration::from_secs(120),
            retryable_statuses: vec![420, 503],
            retryable_methods: vec![Method::POST],
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Delay before retry number `retry` (0-based): `base * 2^retry`, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_cap)
            .min(self.backoff_cap)
    }

    pub fn allows_method(&self, method: &Method) -> bool {
        self.retryable_methods.iter().any(|allowed| allowed == method)
    }

    pub fn allows_status(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }

    fn has_attempts_left(&self, attempts: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempts < max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::idempotent()
    }
}

/// Blocking client that owns one connection pool and one retry policy.
#[derive(Clone)]
pub struct ResilientClient {
    client: Client,
    policy: RetryPolicy,
    service: String,
    clock: Arc<dyn Clock>,
}

impl ResilientClient {
    pub fn new(service: &str, policy: RetryPolicy, timeout: Duration) -> Result<Self, KiraError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("kira-bg/", env!("CARGO_PKG_VERSION"))),
        );
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(policy.connect_timeout)
            .timeout(timeout)
            .build()
            .map_err(|err| KiraError::RemoteUnavailable {
                service: service.to_string(),
                attempts: 0,
                reason: err.to_string(),
            })?;
        Ok(Self::from_client(service, policy, client))
    }

    /// Wraps an already configured `reqwest` client.
    pub fn from_client(service: &str, policy: RetryPolicy, client: Client) -> Self {
        Self {
            client,
            policy,
            service: service.to_string(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Same connection pool, different policy.
    pub fn with_policy(&self, policy: RetryPolicy) -> Self {
        Self {
            client: self.client.clone(),
            policy,
            service: self.service.clone(),
            clock: self.clock.clone(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Sends the request built by `make_req`, rebuilding it for every attempt.
    ///
    /// Non-retryable statuses come back as `Ok`; only transport failures and
    /// exhausted retries are errors.
    pub fn execute<F>(&self, mut make_req: F) -> Result<Response, KiraError>
    where
        F: FnMut(&Client) -> RequestBuilder,
    {
        let mut attempts = 0u32;
        loop {
            let request = make_req(&self.client)
                .build()
                .map_err(|err| self.unavailable(attempts, err.to_string()))?;
            let method = request.method().clone();
            let url = request.url().to_string();
            let retryable_method = self.policy.allows_method(&method);
            attempts += 1;

            match self.client.execute(request) {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if !(retryable_method && self.policy.allows_status(status)) {
                        return Ok(resp);
                    }
                    if !self.policy.has_attempts_left(attempts) {
                        return Err(self.unavailable(attempts, format!("last status {status}")));
                    }
                    tracing::debug!(service = %self.service, %method, %url, status, attempts, "retrying");
                }
                Err(err) => {
                    if !(retryable_method && is_retryable_error(&err)) {
                        return Err(self.unavailable(attempts, err.to_string()));
                    }
                    if !self.policy.has_attempts_left(attempts) {
                        return Err(self.unavailable(attempts, err.to_string()));
                    }
                    tracing::debug!(service = %self.service, %method, %url, error = %err, attempts, "retrying");
                }
            }
            self.clock.sleep(self.policy.backoff(attempts - 1));
        }
    }

    /// Like [`ResilientClient::execute`], but a non-success status becomes `RemoteRejected`.
    pub fn execute_ok<F>(&self, make_req: F) -> Result<Response, KiraError>
    where
        F: FnMut(&Client) -> RequestBuilder,
    {
        let response = self.execute(make_req)?;
        self.ensure_success(response)
    }

    pub fn ensure_success(&self, response: Response) -> Result<Response, KiraError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| format!("{} request failed", self.service));
        Err(KiraError::RemoteRejected {
            service: self.service.clone(),
            status,
            message: truncate(&message, 200),
        })
    }

    pub fn invalid(&self, message: impl Into<String>) -> KiraError {
        KiraError::InvalidResponse {
            service: self.service.clone(),
            message: message.into(),
        }
    }

    fn unavailable(&self, attempts: u32, reason: String) -> KiraError {
        KiraError::RemoteUnavailable {
            service: self.service.clone(),
            attempts,
            reason,
        }
    }
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

fn truncate(value: &str, limit: usize) -> String {
    let trimmed = value.trim();
    match trimmed.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        let policy = RetryPolicy {
            backoff_base: Duration::from_millis(100),
            backoff_cap: Duration::from_millis(500),
            ..RetryPolicy::idempotent()
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }

    #[test]
    fn unlimited_policy_always_has_attempts() {
        let policy = RetryPolicy {
            max_attempts: None,
            ..RetryPolicy::submission()
        };
        assert!(policy.has_attempts_left(u32::MAX - 1));
        let bounded = RetryPolicy::idempotent();
        assert!(bounded.has_attempts_left(9));
        assert!(!bounded.has_attempts_left(10));
    }

    #[test]
    fn method_allow_list() {
        let policy = RetryPolicy::submission();
        assert!(policy.allows_method(&Method::POST));
        assert!(!policy.allows_method(&Method::GET));
        assert!(policy.allows_status(420));
        assert!(!policy.allows_status(500));
    }

    #[test]
    fn truncate_long_messages() {
        assert_eq!(truncate("  short ", 10), "short");
        assert_eq!(truncate("abcdef", 3), "abc...");
    }
}
