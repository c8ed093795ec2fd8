//! Bounded-retry readiness polling.
//!
//! Adapters block `start()` on these helpers until the sandbox's internal
//! services answer. Individual attempt errors are swallowed; only final
//! exhaustion surfaces. Provisioning itself is never retried here; a
//! failed `start()` is reported to the caller, which decides.

use std::time::Duration;

use super::error::SandboxError;

pub const DEFAULT_POLL_ATTEMPTS: u32 = 60;
pub const DEFAULT_POLL_DELAY: Duration = Duration::from_millis(500);

/// A named service endpoint to probe.
#[derive(Debug, Clone)]
pub struct ServiceProbe {
    pub name: String,
    pub url: String,
}

impl ServiceProbe {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

/// Poll `url` until it answers with a 2xx, up to `attempts` tries with a
/// fixed `delay` between them. Returns `Timeout` on exhaustion.
pub async fn wait_for_http_ok(
    client: &reqwest::Client,
    url: &str,
    attempts: u32,
    delay: Duration,
) -> Result<(), SandboxError> {
    for attempt in 1..=attempts.max(1) {
        match client.get(url).send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(url, attempt, "service answered");
                return Ok(());
            }
            Ok(resp) => {
                tracing::trace!(url, attempt, status = %resp.status(), "service not ready");
            }
            Err(e) => {
                tracing::trace!(url, attempt, error = %e, "service unreachable");
            }
        }
        if attempt < attempts {
            tokio::time::sleep(delay).await;
        }
    }
    Err(SandboxError::Timeout)
}

/// Probe several named services concurrently within `timeout`. On
/// exhaustion returns `ServicesNotReady` naming exactly the services that
/// never answered.
pub async fn await_services(
    client: &reqwest::Client,
    probes: &[ServiceProbe],
    timeout: Duration,
    delay: Duration,
) -> Result<(), SandboxError> {
    let attempts = (timeout.as_millis() / delay.as_millis().max(1)).max(1) as u32;

    let results = futures::future::join_all(probes.iter().map(|probe| {
        let client = client.clone();
        async move {
            let outcome = wait_for_http_ok(&client, &probe.url, attempts, delay).await;
            (probe.name.clone(), outcome)
        }
    }))
    .await;

    let stalled: Vec<String> = results
        .into_iter()
        .filter_map(|(name, outcome)| outcome.is_err().then_some(name))
        .collect();

    if stalled.is_empty() {
        Ok(())
    } else {
        Err(SandboxError::ServicesNotReady { services: stalled })
    }
}
