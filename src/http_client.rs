//! Resilient HTTP client (C5): retry + a circuit breaker shared across
//! replicas via the KV engine + timeout + error classification, for
//! outbound provider and webhook calls. Grounded on the claim/sign/send loop
//! in the teacher's webhook dispatch pattern, generalized into a reusable
//! client rather than a single dispatcher.

use std::time::Duration;

use rand::Rng;
use redis::aio::ConnectionManager;
use reqwest::Method;
use reqwest::StatusCode;

use crate::circuit_breaker::Circuit;
use crate::circuit_breaker::CircuitBreakerConfig;

const RETRYABLE_STATUS: [u16; 6] = [408, 429, 500, 502, 503, 504];

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    fn delay_for(&self, attempt: u32) -> Duration {
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let delay = if self.jitter {
            let jitter_frac = rand::thread_rng().gen_range(-0.25..=0.25);
            (capped * (1.0 + jitter_frac)).max(0.0)
        } else {
            capped
        };
        Duration::from_secs_f64(delay)
    }
}

pub struct RequestOutcome {
    pub success: bool,
    pub status: Option<u16>,
    pub body: Option<String>,
    pub headers: std::collections::HashMap<String, String>,
    pub attempts: u32,
    pub total_latency: Duration,
    pub circuit_breaker_tripped: bool,
    pub error: Option<String>,
}

pub struct ResilientHttpClient {
    http: reqwest::Client,
    redis: ConnectionManager,
    retry: RetryConfig,
    circuit_cfg: CircuitBreakerConfig,
}

impl ResilientHttpClient {
    pub fn new(redis: ConnectionManager, retry: RetryConfig, circuit_cfg: CircuitBreakerConfig) -> Self {
        Self { http: reqwest::Client::new(), redis, retry, circuit_cfg }
    }

    fn circuit_key(host: &str) -> String {
        format!("circuit:http:{host}")
    }

    async fn load_circuit(&self, host: &str) -> Circuit {
        let mut conn = self.redis.clone();
        let raw: Option<String> = redis::AsyncCommands::get(&mut conn, Self::circuit_key(host))
            .await
            .unwrap_or(None);
        raw.and_then(|s| serde_json::from_str(&s).ok()).unwrap_or_default()
    }

    async fn store_circuit(&self, host: &str, circuit: &Circuit) {
        let mut conn = self.redis.clone();
        if let Ok(raw) = serde_json::to_string(circuit) {
            let _: Result<(), redis::RedisError> =
                redis::AsyncCommands::set_ex(&mut conn, Self::circuit_key(host), raw, 3600).await;
        }
    }

    #[tracing::instrument(skip(self, body, headers), fields(url = %url))]
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        headers: &[(String, String)],
        body: Option<String>,
        timeout: Duration,
    ) -> RequestOutcome {
        let host = reqwest::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());

        let start = std::time::Instant::now();
        let now_ms = chrono::Utc::now().timestamp_millis();
        let circuit = self.load_circuit(&host).await;
        let check = circuit.check(&self.circuit_cfg, now_ms);
        if !check.can_proceed {
            self.store_circuit(&host, &check.circuit).await;
            return RequestOutcome {
                success: false,
                status: None,
                body: None,
                headers: std::collections::HashMap::new(),
                attempts: 0,
                total_latency: start.elapsed(),
                circuit_breaker_tripped: true,
                error: Some("circuit breaker open".into()),
            };
        }
        let mut circuit = check.circuit;

        let mut attempts = 0;
        let mut last_error = None;
        let mut last_status = None;
        let mut last_body = None;
        let mut last_headers = std::collections::HashMap::new();

        while attempts < self.retry.max_attempts {
            attempts += 1;
            let mut req = self.http.request(method.clone(), url).timeout(timeout);
            for (k, v) in headers {
                req = req.header(k, v);
            }
            if let Some(b) = &body {
                req = req.body(b.clone());
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    last_headers = resp
                        .headers()
                        .iter()
                        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
                        .collect();
                    let text = resp.text().await.unwrap_or_default();
                    last_status = Some(status.as_u16());
                    last_body = Some(text.clone());

                    if status.is_success() {
                        circuit = circuit.record_success();
                        self.store_circuit(&host, &circuit).await;
                        return RequestOutcome {
                            success: true,
                            status: last_status,
                            body: Some(text),
                            headers: last_headers,
                            attempts,
                            total_latency: start.elapsed(),
                            circuit_breaker_tripped: false,
                            error: None,
                        };
                    }

                    if !is_retryable_status(status) {
                        // Permanent 4xx (other than 408/429): no retry, no breaker trip.
                        return RequestOutcome {
                            success: false,
                            status: last_status,
                            body: last_body,
                            headers: last_headers,
                            attempts,
                            total_latency: start.elapsed(),
                            circuit_breaker_tripped: false,
                            error: Some(format!("permanent error: {status}")),
                        };
                    }

                    last_error = Some(format!("retryable status {status}"));
                    circuit = circuit.record_failure(&self.circuit_cfg, now_ms);
                }
                Err(e) => {
                    last_error = Some(e.to_string());
                    circuit = circuit.record_failure(&self.circuit_cfg, now_ms);
                }
            }

            if attempts < self.retry.max_attempts {
                tokio::time::sleep(self.retry.delay_for(attempts)).await;
            }
        }

        self.store_circuit(&host, &circuit).await;
        RequestOutcome {
            success: false,
            status: last_status,
            body: last_body,
            headers: last_headers,
            attempts,
            total_latency: start.elapsed(),
            circuit_breaker_tripped: false,
            error: last_error,
        }
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    RETRYABLE_STATUS.contains(&status.as_u16())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_status_set_matches_spec() {
        for code in RETRYABLE_STATUS {
            assert!(is_retryable_status(StatusCode::from_u16(code).unwrap()));
        }
        assert!(!is_retryable_status(StatusCode::from_u16(404).unwrap()));
        assert!(!is_retryable_status(StatusCode::from_u16(401).unwrap()));
    }

    #[test]
    fn delay_grows_and_caps() {
        let cfg = RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(cfg.delay_for(0), Duration::from_millis(100));
        assert_eq!(cfg.delay_for(1), Duration::from_millis(200));
        assert_eq!(cfg.delay_for(10), Duration::from_secs(1));
    }
}
