use std::{collections::BTreeMap, time::Duration};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RestartPolicy {
    Off,
    Always,
    OnFailure,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RestartConfig {
    pub(crate) policy: RestartPolicy,
    pub(crate) max_retries: u32,
    pub(crate) backoff_ms: u64,
    pub(crate) backoff_max_ms: u64,
    /// A run at least this long resets the attempt counter.
    pub(crate) stable_run: Duration,
}

impl Default for RestartConfig {
    fn default() -> Self {
        parse_restart_config(&BTreeMap::new())
    }
}

impl RestartConfig {
    /// Returns the delay before the next attempt, or `None` when the policy or
    /// the retry cap says no.
    pub(crate) fn next_delay(&self, failed: bool, attempts_so_far: u32) -> Option<Duration> {
        let wanted = match self.policy {
            RestartPolicy::Off => false,
            RestartPolicy::Always => true,
            RestartPolicy::OnFailure => failed,
        };
        if !wanted || attempts_so_far >= self.max_retries {
            return None;
        }
        Some(Duration::from_millis(compute_backoff_ms(
            *self,
            attempts_so_far.saturating_add(1),
        )))
    }
}

pub(crate) fn parse_restart_config(params: &BTreeMap<String, String>) -> RestartConfig {
    let policy = match params
        .get("restart_policy")
        .map(|s| s.trim().to_ascii_lowercase())
        .as_deref()
    {
        Some("off") | Some("never") | Some("no") => RestartPolicy::Off,
        Some("always") => RestartPolicy::Always,
        _ => RestartPolicy::OnFailure,
    };

    let max_retries = params
        .get("restart_max_retries")
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(5)
        .clamp(0, 1000);
    let backoff_ms = params
        .get("restart_backoff_ms")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(1000)
        .clamp(100, 10 * 60 * 1000);
    let backoff_max_ms = params
        .get("restart_backoff_max_ms")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(30_000)
        .clamp(backoff_ms, 60 * 60 * 1000);
    let stable_run_ms = params
        .get("stable_run_ms")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(10_000)
        .clamp(500, 60 * 60 * 1000);

    RestartConfig {
        policy,
        max_retries,
        backoff_ms,
        backoff_max_ms,
        stable_run: Duration::from_millis(stable_run_ms),
    }
}

pub(crate) fn compute_backoff_ms(cfg: RestartConfig, attempt: u32) -> u64 {
    // attempt is 1-based.
    let pow = attempt.saturating_sub(1).min(30);
    let mult = 1u64.checked_shl(pow).unwrap_or(u64::MAX);
    cfg.backoff_ms.saturating_mul(mult).min(cfg.backoff_max_ms)
}
