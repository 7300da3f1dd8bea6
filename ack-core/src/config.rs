use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Knobs for one coordinator run. Durations are stored as integers so the
/// struct reads naturally from env vars and JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Soft deadline on reaching `Escalating`, measured from receipt.
    pub response_budget_secs: u64,
    pub tool_timeout_secs: u64,
    pub retry_backoff_ms: u64,
    pub max_tool_calls: usize,
    pub max_turns: u32,
    pub escalation_attempts: u32,
    pub escalation_backoff_ms: u64,
    pub fallback_team: String,
    pub human_idle_secs: u64,
    pub thread_poll_ms: u64,
    /// Base URL for evidence citation links served by the HTTP surface.
    pub public_url: String,
    pub lookback_mins: i64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            response_budget_secs: 120,
            tool_timeout_secs: 20,
            retry_backoff_ms: 500,
            max_tool_calls: 16,
            max_turns: 2,
            escalation_attempts: 3,
            escalation_backoff_ms: 1_000,
            fallback_team: "sre".into(),
            human_idle_secs: 4 * 60 * 60,
            thread_poll_ms: 2_000,
            public_url: "http://localhost:8080".into(),
            lookback_mins: 60,
        }
    }
}

impl CoordinatorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            response_budget_secs: env_parse("ACK_RESPONSE_BUDGET_SECS")
                .unwrap_or(defaults.response_budget_secs),
            tool_timeout_secs: env_parse("ACK_TOOL_TIMEOUT_SECS").unwrap_or(defaults.tool_timeout_secs),
            retry_backoff_ms: env_parse("ACK_RETRY_BACKOFF_MS").unwrap_or(defaults.retry_backoff_ms),
            max_tool_calls: env_parse("ACK_MAX_TOOL_CALLS").unwrap_or(defaults.max_tool_calls),
            max_turns: env_parse("ACK_MAX_TURNS").unwrap_or(defaults.max_turns),
            escalation_attempts: env_parse("ACK_ESCALATION_ATTEMPTS")
                .unwrap_or(defaults.escalation_attempts),
            escalation_backoff_ms: env_parse("ACK_ESCALATION_BACKOFF_MS")
                .unwrap_or(defaults.escalation_backoff_ms),
            fallback_team: std::env::var("ACK_FALLBACK_TEAM").unwrap_or(defaults.fallback_team),
            human_idle_secs: env_parse("ACK_HUMAN_IDLE_SECS").unwrap_or(defaults.human_idle_secs),
            thread_poll_ms: env_parse("ACK_THREAD_POLL_MS").unwrap_or(defaults.thread_poll_ms),
            public_url: std::env::var("ACK_PUBLIC_URL").unwrap_or(defaults.public_url),
            lookback_mins: env_parse("ACK_LOOKBACK_MINS").unwrap_or(defaults.lookback_mins),
        }
    }

    pub fn response_budget(&self) -> Duration {
        Duration::from_secs(self.response_budget_secs.max(1))
    }

    /// Per-call timeout, always strictly shorter than the response budget so
    /// one slow integration cannot consume the whole window.
    pub fn tool_timeout(&self) -> Duration {
        let budget = self.response_budget();
        let requested = Duration::from_secs(self.tool_timeout_secs.max(1));
        if requested >= budget {
            budget / 2
        } else {
            requested
        }
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn escalation_backoff(&self) -> Duration {
        Duration::from_millis(self.escalation_backoff_ms)
    }

    pub fn human_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.human_idle_secs)
    }

    pub fn thread_poll_interval(&self) -> Duration {
        Duration::from_millis(self.thread_poll_ms.max(10))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_timeout_stays_below_budget() {
        let config = CoordinatorConfig {
            response_budget_secs: 30,
            tool_timeout_secs: 45,
            ..CoordinatorConfig::default()
        };
        assert_eq!(config.tool_timeout(), Duration::from_secs(15));
        assert_eq!(CoordinatorConfig::default().tool_timeout(), Duration::from_secs(20));
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: CoordinatorConfig =
            serde_json::from_str(r#"{"fallback_team":"platform"}"#).expect("parse");
        assert_eq!(config.fallback_team, "platform");
        assert_eq!(config.response_budget_secs, 120);
    }
}
