//! SPDX-License-Identifier: GPL-3.0-or-later
//!
//! Secure HTTP client (spec §4.3). TLS-parameterized `reqwest` client with a
//! cipher-suite allow-list, certificate pinning by SPKI SHA-256, and retry with
//! jittered exponential backoff. Every new client first passes through the policy
//! engine's `enforce` (spec §4.4) before being built.

use crate::error::{ErrorKind, Result, UpdateError};
use crate::policy::SecurityPolicy;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

const COMPONENT: &str = "secure_client";

/// A pinned server identity: one or more accepted SPKI SHA-256 digests (base64),
/// optionally scoped further by expected certificate subject/issuer CN.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PinnedCertificate {
    pub host: String,
    pub spki_sha256_base64: Vec<String>,
    pub expected_subject_cn: Option<String>,
    pub expected_issuer_cn: Option<String>,
}

/// Retry policy: which outcomes are retryable and the backoff schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub retryable_status_codes: Vec<u16>,
    pub retryable_error_substrings: Vec<String>,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub jitter_factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 4,
            retryable_status_codes: vec![408, 500, 502, 503, 504],
            retryable_error_substrings: vec![
                "connection refused".to_string(),
                "connection reset".to_string(),
                "connection closed".to_string(),
                "no such host".to_string(),
                "timeout".to_string(),
                "timed out".to_string(),
                "temporary failure".to_string(),
            ],
            initial_delay: Duration::from_millis(250),
            backoff_factor: 2.0,
            jitter_factor: 0.2,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    pub fn is_status_retryable(&self, status: u16) -> bool {
        self.retryable_status_codes.contains(&status)
    }

    pub fn is_error_retryable(&self, message: &str) -> bool {
        let lower = message.to_ascii_lowercase();
        self.retryable_error_substrings.iter().any(|s| lower.contains(s.as_str()))
    }

    /// Delay before attempt number `attempt` (0-based), per spec.md's formula:
    /// `initial * factor^attempt * (1 + jitter*(2*attempt/max - 1))`, capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let max = self.max_attempts.max(1) as f64;
        let jitter = 1.0 + self.jitter_factor * ((2.0 * attempt as f64 / max) - 1.0);
        let scaled = (base * jitter).max(0.0);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }
}

/// Connection-level security options. Constructed by the caller, then strictly
/// raised by [`SecurityPolicy::enforce`] before a client is built from them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSecurityOptions {
    pub min_tls_version: String,
    pub cipher_suites: Vec<String>,
    pub http2: bool,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_idle_connections: usize,
    pub pinned_certificates: Vec<PinnedCertificate>,
    pub certificate_pinning_enabled: bool,
    pub revocation_check_enabled: bool,
    pub retry: RetryConfig,
}

impl Default for ConnectionSecurityOptions {
    fn default() -> Self {
        ConnectionSecurityOptions {
            min_tls_version: "TLS1.2".to_string(),
            cipher_suites: Vec::new(),
            http2: true,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(90),
            max_idle_connections: 8,
            pinned_certificates: Vec::new(),
            certificate_pinning_enabled: false,
            revocation_check_enabled: false,
            retry: RetryConfig::default(),
        }
    }
}

/// A cancellable deadline: every retry wait and network call observes it.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(duration: Duration) -> Self {
        Deadline { at: Instant::now() + duration }
    }

    pub fn far_future() -> Self {
        Deadline { at: Instant::now() + Duration::from_secs(3600 * 24 * 365) }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }
}

/// A cancellation signal. `CancellationToken::cancel` can be called from another
/// thread; every await point in the retry loop checks it alongside the deadline.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<std::sync::atomic::AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// TLS-parameterized HTTP client. Pinned certs are enforced inside the TLS
/// handshake itself via a custom `rustls` verifier (see [`crate::tls`]); retry
/// config lives behind a reader-writer lock (§5): reads proceed concurrently,
/// mutators are infrequent.
pub struct SecureHttpClient {
    inner: Client,
    retry: Arc<RwLock<RetryConfig>>,
    pins: Arc<RwLock<Vec<PinnedCertificate>>>,
}

impl SecureHttpClient {
    /// Build a client from `options` after routing them through the policy's
    /// `enforce`, so every constructed client already satisfies policy.
    pub fn new(mut options: ConnectionSecurityOptions, policy: &SecurityPolicy) -> Result<Self> {
        policy.enforce(&mut options);
        policy.validate_connection(&options)?;

        let pins = Arc::new(RwLock::new(options.pinned_certificates.clone()));

        let mut builder = Client::builder()
            .connect_timeout(options.connect_timeout)
            .timeout(options.handshake_timeout)
            .pool_idle_timeout(options.idle_timeout)
            .pool_max_idle_per_host(options.max_idle_connections)
            .user_agent("aegis-update");

        if options.certificate_pinning_enabled {
            let tls_config = crate::tls::build_client_config(pins.clone(), &options.min_tls_version).map_err(|e| {
                UpdateError::new(ErrorKind::NetworkPermanent, COMPONENT, "build_client", e.to_string())
            })?;
            builder = builder.use_preconfigured_tls(tls_config);
        } else {
            builder = builder.min_tls_version(to_reqwest_tls_version(&options.min_tls_version)?);
        }

        if !options.http2 {
            builder = builder.http1_only();
        }

        let inner = builder.build().map_err(|e| {
            UpdateError::new(ErrorKind::NetworkPermanent, COMPONENT, "build_client", e.to_string())
        })?;

        Ok(SecureHttpClient {
            inner,
            retry: Arc::new(RwLock::new(options.retry)),
            pins,
        })
    }

    pub fn update_pinned_certificates(&self, pins: Vec<PinnedCertificate>) {
        *self.pins.write().expect("pinned-cert lock poisoned") = pins;
    }

    pub fn update_retry_config(&self, retry: RetryConfig) {
        *self.retry.write().expect("retry-config lock poisoned") = retry;
    }

    /// GET `url`, retrying per policy and honoring `deadline`/`cancel` at every
    /// suspension point. Certificate pinning is enforced during the TLS
    /// handshake itself, before any response is observed here.
    pub fn get(&self, url: &str, deadline: Deadline, cancel: &CancellationToken) -> Result<Response> {
        self.execute_with_retry(|| self.inner.get(url), deadline, cancel)
    }

    /// POST with a body producible again on every retry attempt (spec §4.3: a
    /// streamed body without a regenerating callback abandons the retry).
    pub fn post_with_body<F>(&self, url: &str, body_fn: F, deadline: Deadline, cancel: &CancellationToken) -> Result<Response>
    where
        F: Fn() -> Vec<u8>,
    {
        self.execute_with_retry(|| self.inner.post(url).body(body_fn()), deadline, cancel)
    }

    fn execute_with_retry<F>(&self, make_request: F, deadline: Deadline, cancel: &CancellationToken) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let retry = self.retry.read().expect("retry-config lock poisoned").clone();
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(UpdateError::new(ErrorKind::NetworkPermanent, COMPONENT, "execute", "cancelled"));
            }
            if deadline.expired() {
                return Err(UpdateError::network_transient(COMPONENT, "execute", "deadline expired before request completed"));
            }

            let result = make_request().send();

            match result {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if retry.is_status_retryable(status) && attempt + 1 < retry.max_attempts {
                        attempt += 1;
                        self.wait(&retry, attempt, deadline, cancel)?;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(e) => {
                    let message = e.to_string();
                    if retry.is_error_retryable(&message) && attempt + 1 < retry.max_attempts {
                        attempt += 1;
                        self.wait(&retry, attempt, deadline, cancel)?;
                        continue;
                    }
                    return Err(UpdateError::network_transient(COMPONENT, "execute", message).with_cause(e));
                }
            }
        }
    }

    fn wait(&self, retry: &RetryConfig, attempt: u32, deadline: Deadline, cancel: &CancellationToken) -> Result<()> {
        let delay = retry.delay_for_attempt(attempt).min(deadline.remaining());
        let slept_in = Instant::now();
        while slept_in.elapsed() < delay {
            if cancel.is_cancelled() {
                return Err(UpdateError::new(ErrorKind::NetworkPermanent, COMPONENT, "wait", "cancelled during retry backoff"));
            }
            if deadline.expired() {
                return Err(UpdateError::network_transient(COMPONENT, "wait", "deadline expired during retry backoff"));
            }
            std::thread::sleep(Duration::from_millis(20).min(delay));
        }
        Ok(())
    }
}

fn to_reqwest_tls_version(version: &str) -> Result<reqwest::tls::Version> {
    match version.to_ascii_uppercase().replace(['.', '_'], "").as_str() {
        "TLS12" | "TLSV12" => Ok(reqwest::tls::Version::TLS_1_2),
        "TLS13" | "TLSV13" => Ok(reqwest::tls::Version::TLS_1_3),
        other => Err(UpdateError::new(
            ErrorKind::Incompatibility,
            COMPONENT,
            "to_reqwest_tls_version",
            format!("unsupported minimum TLS version {other} (only TLS1.2/TLS1.3 are accepted)"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_is_exponential_and_capped() {
        let retry = RetryConfig { max_delay: Duration::from_millis(500), ..RetryConfig::default() };
        let d0 = retry.delay_for_attempt(0);
        let d1 = retry.delay_for_attempt(1);
        assert!(d1 >= d0);
        let d_far = retry.delay_for_attempt(20);
        assert!(d_far <= retry.max_delay);
    }

    #[test]
    fn status_and_error_retryability_defaults() {
        let retry = RetryConfig::default();
        assert!(retry.is_status_retryable(503));
        assert!(!retry.is_status_retryable(404));
        assert!(retry.is_error_retryable("Connection Reset by peer"));
        assert!(!retry.is_error_retryable("invalid json"));
    }

    #[test]
    fn enforce_then_build_rejects_nothing_once_raised() {
        let policy = SecurityPolicy::default();
        let opts = ConnectionSecurityOptions::default();
        let client = SecureHttpClient::new(opts, &policy);
        assert!(client.is_ok());
    }

    #[test]
    fn deadline_expiry_is_observable() {
        let d = Deadline::after(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(d.expired());
    }

    #[test]
    fn cancellation_token_reflects_cancel_call() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }
}
