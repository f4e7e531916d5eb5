//! In-process channel with scripted outcomes, for dry runs and tests.
//!
//! Records every attempt and accepts messages unless a failure or hang was
//! scripted for that call number (1-based) or phone.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::{ChannelError, ConnectionStatus, MessageChannel};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub phone: String,
    pub text: String,
    pub accepted: bool,
}

#[derive(Default)]
struct Script {
    failing_calls: HashMap<usize, String>,
    failing_phones: HashMap<String, String>,
    hanging_calls: HashSet<usize>,
}

pub struct ScriptedChannel {
    script: Mutex<Script>,
    attempts: Mutex<Vec<SentMessage>>,
    status: Mutex<ConnectionStatus>,
    started: AtomicUsize,
    latency: Option<Duration>,
    progress: Notify,
}

impl ScriptedChannel {
    /// A connected channel that accepts everything.
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script::default()),
            attempts: Mutex::new(Vec::new()),
            status: Mutex::new(ConnectionStatus::Connected),
            started: AtomicUsize::new(0),
            latency: None,
            progress: Notify::new(),
        }
    }

    /// Simulated round-trip applied to every send.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn failing_call(self, call: usize, reason: &str) -> Self {
        self.script.lock().failing_calls.insert(call, reason.to_string());
        self
    }

    pub fn failing_phone(self, phone: &str, reason: &str) -> Self {
        self.script
            .lock()
            .failing_phones
            .insert(phone.to_string(), reason.to_string());
        self
    }

    /// The given call never completes.
    pub fn hanging_call(self, call: usize) -> Self {
        self.script.lock().hanging_calls.insert(call);
        self
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        *self.status.lock() = status;
    }

    /// Every attempt in call order.
    pub fn attempts(&self) -> Vec<SentMessage> {
        self.attempts.lock().clone()
    }

    /// Messages the channel accepted.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.attempts.lock().iter().filter(|m| m.accepted).cloned().collect()
    }

    /// Completed attempts; a hanging call is not counted.
    pub fn call_count(&self) -> usize {
        self.attempts.lock().len()
    }

    /// Wait until at least `calls` sends have completed.
    pub async fn wait_for_calls(&self, calls: usize) {
        loop {
            let notified = self.progress.notified();
            if self.call_count() >= calls {
                return;
            }
            notified.await;
        }
    }

    fn record(&self, phone: &str, text: &str, accepted: bool) {
        self.attempts.lock().push(SentMessage {
            phone: phone.to_string(),
            text: text.to_string(),
            accepted,
        });
        self.progress.notify_waiters();
    }
}

impl Default for ScriptedChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageChannel for ScriptedChannel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn connection_status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    async fn send_message(&self, phone: &str, text: &str) -> Result<String, ChannelError> {
        if *self.status.lock() != ConnectionStatus::Connected {
            return Err(ChannelError::NotConnected);
        }

        let call = self.started.fetch_add(1, Ordering::SeqCst) + 1;
        let (hang, failure) = {
            let script = self.script.lock();
            let failure = script
                .failing_calls
                .get(&call)
                .or_else(|| script.failing_phones.get(phone))
                .cloned();
            (script.hanging_calls.contains(&call), failure)
        };

        if hang {
            debug!(call, phone = %phone, "Scripted send hanging");
            std::future::pending::<()>().await;
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        match failure {
            Some(reason) => {
                self.record(phone, text, false);
                Err(ChannelError::Other(reason))
            }
            None => {
                self.record(phone, text, true);
                debug!(call, phone = %phone, "Scripted send accepted");
                Ok(format!("scripted-{}", Uuid::new_v4()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_outcomes() {
        let ch = ScriptedChannel::new()
            .failing_call(2, "bad number")
            .failing_phone("+999", "blocked");

        assert!(ch.send_message("+1", "a").await.is_ok());
        let err = ch.send_message("+2", "b").await.unwrap_err();
        assert_eq!(err.to_string(), "bad number");
        assert!(ch.send_message("+999", "c").await.is_err());
        assert!(ch.send_message("+3", "d").await.is_ok());

        assert_eq!(ch.call_count(), 4);
        let sent: Vec<String> = ch.sent().into_iter().map(|m| m.phone).collect();
        assert_eq!(sent, vec!["+1", "+3"]);
    }

    #[tokio::test]
    async fn test_disconnected_rejects() {
        let ch = ScriptedChannel::new();
        ch.set_status(ConnectionStatus::Disconnected);
        assert!(matches!(
            ch.send_message("+1", "a").await,
            Err(ChannelError::NotConnected)
        ));
        assert_eq!(ch.call_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_calls() {
        let ch = std::sync::Arc::new(ScriptedChannel::new());
        let sender = ch.clone();
        let task = tokio::spawn(async move {
            for i in 0..3 {
                sender.send_message(&format!("+{}", i), "x").await.unwrap();
            }
        });
        ch.wait_for_calls(3).await;
        assert_eq!(ch.call_count(), 3);
        task.await.unwrap();
    }
}
