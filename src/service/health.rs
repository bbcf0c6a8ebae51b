//! Health probing of spawned services.
//!
//! Polls `http://localhost:<port>/health` until it answers 200 with
//! `{"status":"ok"}`, sleeping with exponential backoff between failures,
//! within a fixed total budget.

use std::time::Duration;

use tracing::{debug, warn};

use super::error::ServiceError;

/// Timing knobs for the health prober. Defaults carry the production
/// values; tests inject shorter ones.
#[derive(Debug, Clone)]
pub struct HealthOptions {
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// First sleep after a failed probe.
    pub initial_delay: Duration,
    /// Ceiling for the doubling sleep.
    pub max_delay: Duration,
    /// Total probing budget.
    pub budget: Duration,
}

impl Default for HealthOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            budget: Duration::from_secs(300),
        }
    }
}

/// Doubles `current` up to `max`.
fn next_delay(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

/// Waits until the service on `port` reports healthy.
///
/// # Errors
///
/// Returns [`ServiceError::HealthTimeout`] carrying the last probe failure
/// when the budget elapses.
pub async fn wait_for_health(port: u16, options: &HealthOptions) -> Result<(), ServiceError> {
    let url = format!("http://localhost:{port}/health");
    let client = reqwest::Client::builder()
        .timeout(options.request_timeout)
        .build()
        .map_err(|e| ServiceError::HealthTimeout {
            port,
            budget_secs: options.budget.as_secs(),
            last_error: format!("failed to build probe client: {e}"),
        })?;

    let deadline = tokio::time::Instant::now() + options.budget;
    let mut delay = options.initial_delay;
    let mut last_error = "no probe completed".to_string();

    loop {
        match probe_once(&client, &url).await {
            Ok(()) => {
                debug!(port, "service healthy");
                return Ok(());
            }
            Err(reason) => {
                debug!(port, reason = %reason, "health probe failed");
                last_error = reason;
            }
        }

        if tokio::time::Instant::now() + delay > deadline {
            warn!(port, budget_secs = options.budget.as_secs(), "health budget exhausted");
            return Err(ServiceError::HealthTimeout {
                port,
                budget_secs: options.budget.as_secs(),
                last_error,
            });
        }
        tokio::time::sleep(delay).await;
        delay = next_delay(delay, options.max_delay);
    }
}

async fn probe_once(client: &reqwest::Client, url: &str) -> Result<(), String> {
    let response = client.get(url).send().await.map_err(|e| e.to_string())?;
    let status = response.status();
    if !status.is_success() {
        return Err(format!("HTTP {status}"));
    }
    let body: serde_json::Value = response
        .json()
        .await
        .map_err(|e| format!("invalid health body: {e}"))?;
    if body.get("status").and_then(|v| v.as_str()) == Some("ok") {
        Ok(())
    } else {
        Err(format!("unexpected health payload: {body}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_until_ceiling() {
        let max = Duration::from_secs(60);
        let mut delay = Duration::from_secs(1);
        let mut observed = Vec::new();
        for _ in 0..8 {
            observed.push(delay.as_secs());
            delay = next_delay(delay, max);
        }
        assert_eq!(observed, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn test_default_options_match_contract() {
        let options = HealthOptions::default();
        assert_eq!(options.request_timeout, Duration::from_secs(5));
        assert_eq!(options.initial_delay, Duration::from_secs(1));
        assert_eq!(options.max_delay, Duration::from_secs(60));
        assert_eq!(options.budget, Duration::from_secs(300));
    }
}
