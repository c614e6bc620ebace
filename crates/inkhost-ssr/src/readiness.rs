use std::time::Duration;

use crate::registry::RuntimeRegistry;

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok())
}

/// Timing knobs for the post-start readiness probe.
#[derive(Clone, Debug)]
pub struct ProbeConfig {
    pub interval: Duration,
    pub request_timeout: Duration,
    pub max_wait: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(2),
            max_wait: Duration::from_secs(30),
        }
    }
}

impl ProbeConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            interval: env_u64("INKHOST_PROBE_INTERVAL_MS")
                .map(|v| Duration::from_millis(v.clamp(100, 10_000)))
                .unwrap_or(d.interval),
            request_timeout: env_u64("INKHOST_PROBE_TIMEOUT_MS")
                .map(|v| Duration::from_millis(v.clamp(200, 30_000)))
                .unwrap_or(d.request_timeout),
            max_wait: env_u64("INKHOST_PROBE_MAX_WAIT_MS")
                .map(|v| Duration::from_millis(v.clamp(1_000, 10 * 60 * 1_000)))
                .unwrap_or(d.max_wait),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ready,
    Aborted,
    TimedOut,
}

/// Polls the runtime's root endpoint until it answers, the instance
/// disappears, or the total wait elapses. Purely advisory: nothing blocks on
/// the outcome, the result is only logged. The handle is returned so tests
/// can observe termination; production callers drop it.
pub fn spawn_probe(
    registry: RuntimeRegistry,
    http: reqwest::Client,
    theme: String,
    pid: Option<u32>,
    port: u16,
    config: ProbeConfig,
) -> tokio::task::JoinHandle<ProbeOutcome> {
    tokio::spawn(async move {
        let url = format!("http://127.0.0.1:{port}/");
        let started = tokio::time::Instant::now();
        let deadline = started + config.max_wait;

        loop {
            // The instance we were started for may have exited or been
            // replaced; either way this probe no longer has a subject.
            match registry.get(&theme) {
                Some(entry) if entry.pid == pid => {}
                _ => {
                    tracing::info!(theme, port, "readiness probe aborted, runtime is gone");
                    return ProbeOutcome::Aborted;
                }
            }

            let probe = http.get(&url).timeout(config.request_timeout).send().await;
            if probe.is_ok() {
                tracing::info!(
                    theme,
                    port,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "ssr runtime is answering http"
                );
                return ProbeOutcome::Ready;
            }

            if tokio::time::Instant::now() + config.interval > deadline {
                tracing::warn!(
                    theme,
                    port,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "readiness probe timed out"
                );
                return ProbeOutcome::TimedOut;
            }
            tokio::time::sleep(config.interval).await;
        }
    })
}
