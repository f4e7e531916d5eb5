//! Campaign event bus: emitting lifecycle and delivery events.
//!
//! The dispatcher accepts an `Arc<dyn EventSink>` so a UI bridge can push
//! progress without polling the store.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CampaignEventType {
    CampaignStarted,
    CampaignResumed,
    CampaignPaused,
    CampaignCompleted,
    CampaignAborted,
    CampaignStalled,
    RecipientSent,
    RecipientFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignEvent {
    pub event_id: Uuid,
    pub event_type: CampaignEventType,
    pub campaign_id: i64,
    pub recipient_id: Option<i64>,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl CampaignEvent {
    pub fn new(
        event_type: CampaignEventType,
        campaign_id: i64,
        recipient_id: Option<i64>,
        detail: Option<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            campaign_id,
            recipient_id,
            detail,
            timestamp: Utc::now(),
        }
    }

    pub fn is_recipient_event(&self) -> bool {
        matches!(
            self.event_type,
            CampaignEventType::RecipientSent | CampaignEventType::RecipientFailed
        )
    }
}

/// Receives campaign events. `emit` is called from the send loop and must
/// return without waiting on I/O.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: CampaignEvent);
}

struct Discard;

impl EventSink for Discard {
    fn emit(&self, _event: CampaignEvent) {}
}

/// Writes each event to the log: lifecycle events at `info`, per-recipient
/// events at `debug`.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: CampaignEvent) {
        if event.is_recipient_event() {
            debug!(
                event = ?event.event_type,
                campaign_id = event.campaign_id,
                recipient_id = event.recipient_id,
                detail = event.detail.as_deref(),
                "Campaign event"
            );
        } else {
            info!(
                event = ?event.event_type,
                campaign_id = event.campaign_id,
                detail = event.detail.as_deref(),
                "Campaign event"
            );
        }
    }
}

/// Keeps every event in memory, in emit order.
#[derive(Default)]
pub struct CaptureSink {
    captured: Mutex<Vec<CampaignEvent>>,
}

impl CaptureSink {
    pub fn events(&self) -> Vec<CampaignEvent> {
        self.captured.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.captured.lock().len()
    }

    pub fn count_type(&self, event_type: CampaignEventType) -> usize {
        self.captured
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    /// Events for one campaign, oldest first.
    pub fn for_campaign(&self, campaign_id: i64) -> Vec<CampaignEvent> {
        self.captured
            .lock()
            .iter()
            .filter(|e| e.campaign_id == campaign_id)
            .cloned()
            .collect()
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: CampaignEvent) {
        self.captured.lock().push(event);
    }
}

pub fn make_event(
    event_type: CampaignEventType,
    campaign_id: i64,
    recipient_id: Option<i64>,
    detail: Option<String>,
) -> CampaignEvent {
    CampaignEvent::new(event_type, campaign_id, recipient_id, detail)
}

/// Sink that drops everything; the dispatcher default.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(Discard)
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::default())
}
