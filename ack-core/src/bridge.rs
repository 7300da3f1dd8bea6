use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::model::ChannelRef;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub id: String,
    pub author: String,
    pub text: String,
    pub posted_at: DateTime<Utc>,
}

/// Conversational surface the coordinator publishes to and reads follow-ups
/// from. Alert ownership changes (acknowledge, reassign) go through the tool
/// gateway instead, since they target PagerDuty rather than chat.
#[async_trait]
pub trait ChannelBridge: Send + Sync {
    async fn create_channel(&self, name: &str) -> Result<ChannelRef, BridgeError>;

    async fn invite(&self, channel: &ChannelRef, users: &[String]) -> Result<(), BridgeError>;

    /// Posts markdown and returns the message id.
    async fn post_message(&self, channel: &ChannelRef, markdown: &str) -> Result<String, BridgeError>;

    /// Human messages in the channel thread newer than `after`, oldest first.
    /// The bridge's own posts are not returned.
    async fn read_thread(
        &self,
        channel: &ChannelRef,
        after: Option<&str>,
    ) -> Result<Vec<ThreadMessage>, BridgeError>;
}

/// Channel names must be lowercase, at most 80 chars, `[a-z0-9-_]`.
pub fn channel_name(incident_id: &str, service: &str) -> String {
    let raw = format!("inc-{incident_id}-{service}").to_lowercase();
    let mut name = String::with_capacity(raw.len());
    for c in raw.chars() {
        let c = if c.is_ascii_alphanumeric() || c == '_' { c } else { '-' };
        if c == '-' && name.ends_with('-') {
            continue;
        }
        name.push(c);
    }
    name.trim_end_matches('-').chars().take(80).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names_are_sanitized() {
        assert_eq!(channel_name("Q1W2E3", "payments-api"), "inc-q1w2e3-payments-api");
        assert_eq!(channel_name("PD 7", "Ledger / Worker"), "inc-pd-7-ledger-worker");
        assert_eq!(channel_name("X", &"a".repeat(200)).len(), 80);
    }
}
