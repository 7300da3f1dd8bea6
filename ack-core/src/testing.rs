//! Deterministic integrations and chat bridge for tests and local demos.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::bridge::{ChannelBridge, ThreadMessage};
use crate::error::{BridgeError, ToolError};
use crate::gateway::Integration;
use crate::model::{ChannelRef, IntegrationKind};
use crate::tools::ToolOperation;

type Handler = dyn Fn(&ToolOperation) -> Result<Value, ToolError> + Send + Sync;

/// An integration whose responses come from a closure.
pub struct ScriptedIntegration {
    kind: IntegrationKind,
    handler: Box<Handler>,
    latency: Duration,
    calls: Mutex<Vec<ToolOperation>>,
}

impl ScriptedIntegration {
    pub fn new<F>(kind: IntegrationKind, handler: F) -> Self
    where
        F: Fn(&ToolOperation) -> Result<Value, ToolError> + Send + Sync + 'static,
    {
        Self {
            kind,
            handler: Box::new(handler),
            latency: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every call sleeps this long (tokio time) before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> Vec<ToolOperation> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Integration for ScriptedIntegration {
    fn kind(&self) -> IntegrationKind {
        self.kind
    }

    async fn call(&self, operation: &ToolOperation) -> Result<Value, ToolError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(operation.clone());
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        (self.handler)(operation)
    }
}

#[derive(Default)]
struct BridgeState {
    channels: Vec<ChannelRef>,
    invites: Vec<(String, Vec<String>)>,
    posts: Vec<(String, String)>,
    thread: Vec<(String, ThreadMessage)>,
    create_failures: u32,
    invite_failures: u32,
    next_id: u64,
}

/// In-memory chat surface that records everything it is asked to do.
#[derive(Clone, Default)]
pub struct RecordingBridge {
    state: Arc<Mutex<BridgeState>>,
}

impl RecordingBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` channel creations fail as unavailable.
    pub fn fail_creates(&self, n: u32) {
        self.with_state(|s| s.create_failures = n);
    }

    /// The next `n` invites fail as unavailable.
    pub fn fail_invites(&self, n: u32) {
        self.with_state(|s| s.invite_failures = n);
    }

    pub fn channels(&self) -> Vec<ChannelRef> {
        self.with_state(|s| s.channels.clone())
    }

    /// Users invited per channel id, in call order.
    pub fn invites(&self) -> Vec<(String, Vec<String>)> {
        self.with_state(|s| s.invites.clone())
    }

    pub fn invited_users(&self) -> Vec<String> {
        self.with_state(|s| s.invites.iter().flat_map(|(_, u)| u.clone()).collect())
    }

    /// `(channel id, markdown)` for every post.
    pub fn posts(&self) -> Vec<(String, String)> {
        self.with_state(|s| s.posts.clone())
    }

    /// Simulates a human writing in the channel thread.
    pub fn push_thread_message(&self, channel_id: &str, author: &str, text: &str) -> String {
        self.with_state(|s| {
            s.next_id += 1;
            let id = format!("m{:06}", s.next_id);
            s.thread.push((
                channel_id.to_string(),
                ThreadMessage {
                    id: id.clone(),
                    author: author.to_string(),
                    text: text.to_string(),
                    posted_at: Utc::now(),
                },
            ));
            id
        })
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut BridgeState) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

#[async_trait]
impl ChannelBridge for RecordingBridge {
    async fn create_channel(&self, name: &str) -> Result<ChannelRef, BridgeError> {
        self.with_state(|s| {
            if s.create_failures > 0 {
                s.create_failures -= 1;
                return Err(BridgeError::Unavailable("create_channel".into()));
            }
            if let Some(existing) = s.channels.iter().find(|c| c.name == name) {
                return Ok(existing.clone());
            }
            let channel = ChannelRef {
                id: format!("C{:04}", s.channels.len() + 1),
                name: name.to_string(),
            };
            s.channels.push(channel.clone());
            Ok(channel)
        })
    }

    async fn invite(&self, channel: &ChannelRef, users: &[String]) -> Result<(), BridgeError> {
        self.with_state(|s| {
            if s.invite_failures > 0 {
                s.invite_failures -= 1;
                return Err(BridgeError::Unavailable("invite".into()));
            }
            s.invites.push((channel.id.clone(), users.to_vec()));
            Ok(())
        })
    }

    async fn post_message(&self, channel: &ChannelRef, markdown: &str) -> Result<String, BridgeError> {
        self.with_state(|s| {
            s.next_id += 1;
            s.posts.push((channel.id.clone(), markdown.to_string()));
            Ok(format!("m{:06}", s.next_id))
        })
    }

    async fn read_thread(
        &self,
        channel: &ChannelRef,
        after: Option<&str>,
    ) -> Result<Vec<ThreadMessage>, BridgeError> {
        self.with_state(|s| {
            Ok(s.thread
                .iter()
                .filter(|(id, _)| *id == channel.id)
                .map(|(_, m)| m)
                .filter(|m| after.map_or(true, |after| m.id.as_str() > after))
                .cloned()
                .collect())
        })
    }
}
