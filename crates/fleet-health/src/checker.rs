//! Health check probe logic.
//!
//! Performs HTTP checks against a unit's `host:port` with the method,
//! expected status and body pattern its app declares, retrying with
//! exponential backoff until the unit answers or the timeout elapses.

use std::time::{Duration, Instant};

use bytes::Bytes;
use http::Method;
use http_body_util::{BodyExt, Empty};
use regex::Regex;
use tracing::{debug, warn};

use fleet_core::HealthcheckConfig;

use crate::error::{HealthError, HealthResult};

const BASE_INTERVAL: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(3);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of a single health probe.
#[derive(Debug)]
pub enum ProbeResult {
    /// The unit answered as the check expects.
    Healthy,
    /// The unit answered, but with the wrong status or body.
    Unhealthy(HealthError),
    /// The probe could not be executed (connection error, probe timeout).
    Failed(String),
}

/// Tracks probe results for one unit while it boots.
#[derive(Debug)]
pub struct HealthTracker {
    /// Wrong answers seen so far. Connection failures are not counted.
    failures: u32,
    allowed_failures: u32,
    current_backoff: Duration,
    base_interval: Duration,
    max_backoff: Duration,
}

impl HealthTracker {
    pub fn new(allowed_failures: u32, interval: Duration) -> Self {
        Self {
            failures: 0,
            allowed_failures,
            current_backoff: interval,
            base_interval: interval,
            max_backoff: MAX_BACKOFF.max(interval),
        }
    }

    /// Record a probe result.
    pub fn record(&mut self, result: &ProbeResult) {
        match result {
            ProbeResult::Healthy => {
                self.failures = 0;
                self.current_backoff = self.base_interval;
            }
            ProbeResult::Unhealthy(_) => {
                self.failures += 1;
                self.current_backoff = (self.current_backoff * 2).min(self.max_backoff);
            }
            ProbeResult::Failed(_) => {
                self.current_backoff = (self.current_backoff * 2).min(self.max_backoff);
            }
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Whether more wrong answers were seen than the check tolerates.
    pub fn exhausted(&self) -> bool {
        self.failures > self.allowed_failures
    }

    /// Current backoff interval before next check.
    pub fn next_interval(&self) -> Duration {
        self.current_backoff
    }
}

/// A validated health check.
struct Check {
    method: Method,
    path: String,
    status: u16,
    body: Option<Regex>,
}

impl Check {
    fn from_config(hc: &HealthcheckConfig) -> HealthResult<Self> {
        let method = Method::from_bytes(hc.method.to_uppercase().as_bytes())
            .map_err(|_| HealthError::BadConfig(format!("invalid method {:?}", hc.method)))?;
        let body = match hc.body_match.as_deref() {
            Some(pattern) if !pattern.is_empty() => Some(
                Regex::new(pattern)
                    .map_err(|e| HealthError::BadConfig(format!("invalid body match: {e}")))?,
            ),
            _ => None,
        };
        let path = if hc.path.starts_with('/') {
            hc.path.clone()
        } else {
            format!("/{}", hc.path)
        };
        Ok(Self {
            method,
            path,
            status: hc.status,
            body,
        })
    }

    async fn run(&self, address: &str, timeout: Duration) -> ProbeResult {
        let uri = format!("http://{address}{}", self.path);

        let result = tokio::time::timeout(timeout, async {
            let stream = match tokio::net::TcpStream::connect(address).await {
                Ok(s) => s,
                Err(e) => return ProbeResult::Failed(format!("connect {uri}: {e}")),
            };

            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
                Ok(pair) => pair,
                Err(e) => return ProbeResult::Failed(format!("handshake {uri}: {e}")),
            };
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let req = match http::Request::builder()
                .method(self.method.clone())
                .uri(&uri)
                .header("host", address)
                .header("user-agent", "fleet-health/0.1")
                .body(Empty::<Bytes>::new())
            {
                Ok(req) => req,
                Err(e) => return ProbeResult::Failed(format!("build request {uri}: {e}")),
            };

            let resp = match sender.send_request(req).await {
                Ok(resp) => resp,
                Err(e) => return ProbeResult::Failed(format!("request {uri}: {e}")),
            };

            let got = resp.status();
            let status_ok = if self.status == 0 {
                got.is_success()
            } else {
                got.as_u16() == self.status
            };
            if !status_ok {
                let want = if self.status == 0 {
                    "2xx".to_string()
                } else {
                    self.status.to_string()
                };
                return ProbeResult::Unhealthy(HealthError::UnexpectedStatus {
                    address: address.to_string(),
                    got: got.as_u16(),
                    want,
                });
            }

            let Some(pattern) = &self.body else {
                return ProbeResult::Healthy;
            };
            let body = match resp.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => return ProbeResult::Failed(format!("read body {uri}: {e}")),
            };
            if pattern.is_match(&String::from_utf8_lossy(&body)) {
                ProbeResult::Healthy
            } else {
                ProbeResult::Unhealthy(HealthError::BodyMismatch {
                    address: address.to_string(),
                    pattern: pattern.as_str().to_string(),
                })
            }
        })
        .await;

        result.unwrap_or_else(|_| ProbeResult::Failed(format!("probe {uri} timed out")))
    }
}

/// Run a single probe of `hc` against `address` (`host:port`).
pub async fn probe(
    address: &str,
    hc: &HealthcheckConfig,
    timeout: Duration,
) -> HealthResult<ProbeResult> {
    let check = Check::from_config(hc)?;
    Ok(check.run(address, timeout).await)
}

/// Poll `address` until it passes `hc` or `timeout` elapses.
///
/// An empty path means the app declares no check, which passes at once.
/// Wrong answers beyond `hc.allowed_failures` abort early with the last
/// answer's error.
pub async fn wait_healthy(
    address: &str,
    hc: &HealthcheckConfig,
    timeout: Duration,
) -> HealthResult<()> {
    if hc.path.trim().is_empty() {
        return Ok(());
    }
    let check = Check::from_config(hc)?;
    let started = Instant::now();
    let deadline = started + timeout;
    let mut tracker = HealthTracker::new(hc.allowed_failures, BASE_INTERVAL);
    let mut last = "no probe completed".to_string();

    loop {
        let now = Instant::now();
        if now >= deadline {
            warn!(%address, path = %check.path, %last, "healthcheck timed out");
            return Err(HealthError::Timeout {
                address: address.to_string(),
                elapsed_ms: started.elapsed().as_millis(),
                last,
            });
        }

        let result = check.run(address, (deadline - now).min(PROBE_TIMEOUT)).await;
        tracker.record(&result);
        match result {
            ProbeResult::Healthy => {
                debug!(%address, path = %check.path, elapsed_ms = started.elapsed().as_millis() as u64, "unit healthy");
                return Ok(());
            }
            ProbeResult::Unhealthy(err) => {
                if tracker.exhausted() {
                    warn!(%address, failures = tracker.failures(), error = %err, "healthcheck failed");
                    return Err(err);
                }
                debug!(%address, failures = tracker.failures(), error = %err, "healthcheck failure within budget");
                last = err.to_string();
            }
            ProbeResult::Failed(reason) => {
                debug!(%address, %reason, "healthcheck probe failed");
                last = reason;
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::sleep(tracker.next_interval().min(remaining)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn hc(path: &str) -> HealthcheckConfig {
        HealthcheckConfig {
            path: path.to_string(),
            method: "GET".to_string(),
            status: 0,
            body_match: None,
            allowed_failures: 0,
        }
    }

    async fn spawn_server() -> String {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/ok", get(|| async { "WORKING" }))
            .route(
                "/fail",
                get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
            )
            .route("/created", post(|| async { (StatusCode::CREATED, "made") }))
            .route(
                "/flaky",
                get(move || {
                    let hits = hits.clone();
                    async move {
                        if hits.fetch_add(1, Ordering::SeqCst) < 2 {
                            (StatusCode::SERVICE_UNAVAILABLE, "warming")
                        } else {
                            (StatusCode::OK, "ready")
                        }
                    }
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr.to_string()
    }

    // ── Tracker ────────────────────────────────────────────────────

    #[test]
    fn tracker_counts_only_wrong_answers() {
        let mut tracker = HealthTracker::new(1, Duration::from_millis(100));
        tracker.record(&ProbeResult::Failed("refused".to_string()));
        tracker.record(&ProbeResult::Failed("refused".to_string()));
        assert_eq!(tracker.failures(), 0);

        let wrong = || {
            ProbeResult::Unhealthy(HealthError::UnexpectedStatus {
                address: "a".to_string(),
                got: 500,
                want: "2xx".to_string(),
            })
        };
        tracker.record(&wrong());
        assert!(!tracker.exhausted());
        tracker.record(&wrong());
        assert!(tracker.exhausted());
    }

    #[test]
    fn tracker_backoff_doubles_and_resets() {
        let mut tracker = HealthTracker::new(0, Duration::from_millis(200));
        tracker.record(&ProbeResult::Failed("x".to_string()));
        assert_eq!(tracker.next_interval(), Duration::from_millis(400));
        for _ in 0..10 {
            tracker.record(&ProbeResult::Failed("x".to_string()));
        }
        assert_eq!(tracker.next_interval(), MAX_BACKOFF);

        tracker.record(&ProbeResult::Healthy);
        assert_eq!(tracker.next_interval(), Duration::from_millis(200));
    }

    // ── Probes ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn healthy_on_2xx() {
        let addr = spawn_server().await;
        wait_healthy(&addr, &hc("/ok"), Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn empty_path_skips_the_check() {
        wait_healthy("127.0.0.1:1", &hc(""), Duration::from_millis(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn exact_status_and_method() {
        let addr = spawn_server().await;
        let mut check = hc("created");
        check.method = "post".to_string();
        check.status = 201;
        wait_healthy(&addr, &check, Duration::from_secs(2)).await.unwrap();

        check.status = 200;
        let err = wait_healthy(&addr, &check, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, HealthError::UnexpectedStatus { got: 201, .. }));
    }

    #[tokio::test]
    async fn wrong_status_fails_without_budget() {
        let addr = spawn_server().await;
        let err = wait_healthy(&addr, &hc("/fail"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, HealthError::UnexpectedStatus { got: 500, .. }));
    }

    #[tokio::test]
    async fn body_match() {
        let addr = spawn_server().await;
        let mut check = hc("/ok");
        check.body_match = Some("WORK.*".to_string());
        wait_healthy(&addr, &check, Duration::from_secs(2)).await.unwrap();

        check.body_match = Some("^ready$".to_string());
        let err = wait_healthy(&addr, &check, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, HealthError::BodyMismatch { .. }));
    }

    #[tokio::test]
    async fn allowed_failures_budget() {
        let addr = spawn_server().await;
        let mut check = hc("/flaky");
        check.allowed_failures = 1;
        assert!(wait_healthy(&addr, &check, Duration::from_secs(5)).await.is_err());

        let addr = spawn_server().await;
        check.allowed_failures = 2;
        wait_healthy(&addr, &check, Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_unit_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = wait_healthy(&addr, &hc("/ok"), Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, HealthError::Timeout { .. }));
    }

    #[tokio::test]
    async fn bad_config_fails_fast() {
        let mut check = hc("/ok");
        check.body_match = Some("(".to_string());
        assert!(matches!(
            wait_healthy("127.0.0.1:1", &check, Duration::from_secs(5)).await,
            Err(HealthError::BadConfig(_))
        ));
        assert!(matches!(
            probe("127.0.0.1:1", &check, Duration::from_secs(1)).await,
            Err(HealthError::BadConfig(_))
        ));
    }

    #[tokio::test]
    async fn single_probe_reports_connection_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let result = probe(&addr, &hc("/ok"), Duration::from_millis(200)).await.unwrap();
        assert!(matches!(result, ProbeResult::Failed(_)));
    }
}
