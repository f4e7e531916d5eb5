//! The per-run send loop: one pass over the pending recipients fetched when
//! the run was launched, in store order, one send at a time.

use std::sync::Arc;
use std::time::Duration;

use bulksend_channels::{ChannelError, MessageChannel};
use bulksend_core::config::DispatcherConfig;
use bulksend_core::error::StoreError;
use bulksend_core::event_bus::{make_event, CampaignEventType, EventSink};
use bulksend_core::pacing::Pacer;
use bulksend_core::store::RecipientStore;
use bulksend_core::templates::{interpolate, TemplateFields};
use bulksend_core::types::{Campaign, CampaignStatus, MessageLogEntry, Recipient, RecipientStatus};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::log_buffer::LogBuffer;
use crate::retry::with_retry;
use crate::state_machine::CampaignStateMachine;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LoopOutcome {
    /// Every fetched recipient reached a terminal status.
    Completed { sent: u32, failed: u32 },
    /// Stopped by `pause`; `processed` recipients were handled this run.
    Paused { processed: u32 },
    /// Stopped by shutdown. Persisted status is left `running`.
    Aborted { processed: u32 },
    /// A store write kept failing; the campaign was parked as `paused`.
    Stalled { processed: u32, error: String },
}

/// Cooperative cancellation flags for one run.
#[derive(Debug, Clone, Default)]
pub(crate) struct RunSignals {
    /// Set by `pause`.
    pub(crate) stop: CancellationToken,
    /// Set by shutdown.
    pub(crate) abort: CancellationToken,
}

pub(crate) struct SendLoop {
    pub(crate) campaign: Campaign,
    pub(crate) recipients: Vec<Recipient>,
    pub(crate) store: Arc<dyn RecipientStore>,
    pub(crate) channel: Arc<dyn MessageChannel>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) pacer: Arc<Mutex<Pacer>>,
    pub(crate) config: DispatcherConfig,
    pub(crate) signals: RunSignals,
}

enum Step {
    Continue,
    Stall(String),
}

impl SendLoop {
    pub(crate) async fn run(self) -> LoopOutcome {
        let campaign_id = self.campaign.id;
        let total = self.recipients.len();
        let mut logs = LogBuffer::new(self.config.log_batch_size);
        let mut sent = 0u32;
        let mut failed = 0u32;

        info!(campaign_id, recipients = total, "Send loop started");

        for (idx, recipient) in self.recipients.iter().enumerate() {
            let processed = idx as u32;

            if self.signals.stop.is_cancelled() {
                logs.flush(self.store.as_ref()).await;
                return self.park_paused(processed).await;
            }
            if self.signals.abort.is_cancelled() {
                logs.flush(self.store.as_ref()).await;
                info!(campaign_id, processed, "Send loop aborted");
                self.events.emit(make_event(
                    CampaignEventType::CampaignAborted,
                    campaign_id,
                    None,
                    None,
                ));
                return LoopOutcome::Aborted { processed };
            }

            let message = interpolate(
                &self.campaign.message_text,
                &TemplateFields::new(recipient.name.as_deref(), &recipient.phone),
            );

            let step = match self.deliver(&recipient.phone, &message).await {
                Ok(message_id) => {
                    debug!(campaign_id, recipient_id = recipient.id, message_id = %message_id, "Recipient sent");
                    let step = self.record(recipient, RecipientStatus::Sent, None).await;
                    if matches!(step, Step::Continue) {
                        sent += 1;
                    }
                    logs.push(self.log_entry(recipient, &message, None), self.store.as_ref())
                        .await;
                    step
                }
                Err(e) => {
                    let reason = e.to_string();
                    warn!(campaign_id, recipient_id = recipient.id, error = %reason, "Recipient send failed");
                    let step = self
                        .record(recipient, RecipientStatus::Failed, Some(&reason))
                        .await;
                    if matches!(step, Step::Continue) {
                        failed += 1;
                    }
                    logs.push(
                        self.log_entry(recipient, &message, Some(reason)),
                        self.store.as_ref(),
                    )
                    .await;
                    step
                }
            };

            if let Step::Stall(error) = step {
                logs.flush(self.store.as_ref()).await;
                return self.park_stalled(processed, error).await;
            }

            if idx + 1 < total {
                self.pace().await;
            }
        }

        logs.flush(self.store.as_ref()).await;

        if let Err(e) = self
            .settle(CampaignStatus::Completed, "complete campaign")
            .await
        {
            return self.park_stalled(total as u32, e).await;
        }

        info!(campaign_id, sent, failed, "Campaign completed");
        self.events.emit(make_event(
            CampaignEventType::CampaignCompleted,
            campaign_id,
            None,
            Some(format!("sent={} failed={}", sent, failed)),
        ));
        LoopOutcome::Completed { sent, failed }
    }

    /// One channel send, bounded by the configured timeout.
    async fn deliver(&self, phone: &str, text: &str) -> Result<String, ChannelError> {
        let timeout_secs = self.config.send_timeout_secs;
        match tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            self.channel.send_message(phone, text),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout(timeout_secs)),
        }
    }

    /// Persist the terminal status and counter for one recipient.
    async fn record(
        &self,
        recipient: &Recipient,
        status: RecipientStatus,
        error_message: Option<&str>,
    ) -> Step {
        let store = self.store.as_ref();
        let campaign_id = self.campaign.id;
        let recipient_id = recipient.id;
        let policy = &self.config.store_retry;

        let marked = with_retry(policy, "update recipient status", move || {
            store.update_recipient_status(recipient_id, status, error_message)
        })
        .await;
        match marked {
            Ok(()) => {}
            Err(StoreError::RecipientAlreadyFinal(_)) => {
                warn!(campaign_id, recipient_id, "Recipient already finalized, not counted");
                return Step::Continue;
            }
            Err(e) => return Step::Stall(e.to_string()),
        }

        let (sent_delta, failed_delta, event_type) = match status {
            RecipientStatus::Sent => (1, 0, CampaignEventType::RecipientSent),
            _ => (0, 1, CampaignEventType::RecipientFailed),
        };
        let counted = with_retry(policy, "increment campaign counters", move || {
            store.increment_campaign_counters(campaign_id, sent_delta, failed_delta)
        })
        .await;
        if let Err(e) = counted {
            return Step::Stall(e.to_string());
        }

        match status {
            RecipientStatus::Sent => metrics::counter!("dispatch.sent").increment(1),
            _ => metrics::counter!("dispatch.failed").increment(1),
        }
        self.events.emit(make_event(
            event_type,
            campaign_id,
            Some(recipient_id),
            error_message.map(str::to_string),
        ));
        Step::Continue
    }

    fn log_entry(
        &self,
        recipient: &Recipient,
        message: &str,
        error_message: Option<String>,
    ) -> MessageLogEntry {
        MessageLogEntry {
            campaign_id: self.campaign.id,
            recipient_phone: recipient.phone.clone(),
            message_text: message.to_string(),
            status: if error_message.is_some() {
                RecipientStatus::Failed
            } else {
                RecipientStatus::Sent
            },
            error_message,
            timestamp: Utc::now(),
        }
    }

    /// Randomized wait before the next send. Returns early on pause or
    /// shutdown unless the delay is configured as non-interruptible.
    async fn pace(&self) {
        let delay = self
            .pacer
            .lock()
            .next_delay(self.campaign.min_delay_sec, self.campaign.max_delay_sec);
        debug!(campaign_id = self.campaign.id, delay_secs = delay.as_secs(), "Pacing before next send");

        if !self.config.interruptible_delay {
            tokio::time::sleep(delay).await;
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.signals.stop.cancelled() => {
                debug!(campaign_id = self.campaign.id, "Pacing interrupted by pause");
            }
            _ = self.signals.abort.cancelled() => {
                debug!(campaign_id = self.campaign.id, "Pacing interrupted by shutdown");
            }
        }
    }

    /// Move the campaign out of `running` along a state machine edge and
    /// persist the new status with retry.
    async fn settle(&self, to: CampaignStatus, operation: &'static str) -> Result<(), String> {
        let mut machine = CampaignStateMachine::new(self.campaign.status);
        machine.transition(to).map_err(|e| e.to_string())?;

        let campaign_id = self.campaign.id;
        let store = self.store.as_ref();
        with_retry(&self.config.store_retry, operation, move || {
            store.update_campaign_status(campaign_id, to)
        })
        .await
        .map_err(|e| e.to_string())
    }

    async fn park_paused(&self, processed: u32) -> LoopOutcome {
        let campaign_id = self.campaign.id;
        if let Err(e) = self.settle(CampaignStatus::Paused, "pause campaign").await {
            return self.park_stalled(processed, e).await;
        }

        info!(campaign_id, processed, "Campaign paused");
        self.events.emit(make_event(
            CampaignEventType::CampaignPaused,
            campaign_id,
            None,
            None,
        ));
        LoopOutcome::Paused { processed }
    }

    /// Stop after exhausted store retries. The status write is a single
    /// best-effort attempt since the store is already failing.
    async fn park_stalled(&self, processed: u32, error: String) -> LoopOutcome {
        let campaign_id = self.campaign.id;
        error!(campaign_id, processed, error = %error, "Store writes failing, stopping campaign");

        if !CampaignStateMachine::can_transition(self.campaign.status, CampaignStatus::Paused) {
            warn!(campaign_id, from = %self.campaign.status, "Stalled run not in a pausable state");
        } else if let Err(e) = self
            .store
            .update_campaign_status(campaign_id, CampaignStatus::Paused)
            .await
        {
            error!(campaign_id, error = %e, "Could not persist paused status");
        }

        self.events.emit(make_event(
            CampaignEventType::CampaignStalled,
            campaign_id,
            None,
            Some(error.clone()),
        ));
        LoopOutcome::Stalled { processed, error }
    }
}
