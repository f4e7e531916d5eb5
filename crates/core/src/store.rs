//! Recipient store contract and an in-memory implementation backed by DashMap.
//!
//! Production: back the trait with SQLite or Postgres. The in-memory store
//! provides the same surface for development, dry runs and tests.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::types::{
    Campaign, CampaignStatus, MessageLogEntry, NewCampaign, NewRecipient, Recipient,
    RecipientStatus,
};

/// Durable campaign, recipient and message-log storage used by the dispatcher.
#[async_trait]
pub trait RecipientStore: Send + Sync {
    /// Persist a new campaign in `draft` with zero counters.
    async fn create_campaign(&self, campaign: NewCampaign, total_recipients: u32)
        -> StoreResult<Campaign>;

    /// Attach `pending` recipients to a campaign, preserving input order.
    async fn create_recipients(
        &self,
        campaign_id: i64,
        recipients: Vec<NewRecipient>,
    ) -> StoreResult<Vec<Recipient>>;

    async fn get_campaign(&self, id: i64) -> StoreResult<Option<Campaign>>;

    /// Recipients of a campaign in insertion order, optionally filtered by status.
    async fn get_campaign_recipients(
        &self,
        campaign_id: i64,
        status: Option<RecipientStatus>,
    ) -> StoreResult<Vec<Recipient>>;

    async fn update_campaign_status(&self, id: i64, status: CampaignStatus) -> StoreResult<()>;

    /// Move a recipient to a terminal status. Fails if it already has one.
    async fn update_recipient_status(
        &self,
        id: i64,
        status: RecipientStatus,
        error_message: Option<&str>,
    ) -> StoreResult<()>;

    async fn increment_campaign_counters(
        &self,
        id: i64,
        sent_delta: u32,
        failed_delta: u32,
    ) -> StoreResult<()>;

    async fn create_message_logs_batch(&self, entries: &[MessageLogEntry]) -> StoreResult<()>;
}

/// Thread-safe in-memory store.
pub struct InMemoryStore {
    campaigns: DashMap<i64, Campaign>,
    recipients: DashMap<i64, Recipient>,
    message_logs: Mutex<Vec<MessageLogEntry>>,
    next_campaign_id: AtomicI64,
    next_recipient_id: AtomicI64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        info!("Recipient store initialized (in-memory)");
        Self {
            campaigns: DashMap::new(),
            recipients: DashMap::new(),
            message_logs: Mutex::new(Vec::new()),
            next_campaign_id: AtomicI64::new(1),
            next_recipient_id: AtomicI64::new(1),
        }
    }

    /// Message log entries written for a campaign, in write order.
    pub fn message_logs(&self, campaign_id: i64) -> Vec<MessageLogEntry> {
        self.message_logs
            .lock()
            .iter()
            .filter(|e| e.campaign_id == campaign_id)
            .cloned()
            .collect()
    }

    pub fn get_recipient(&self, id: i64) -> Option<Recipient> {
        self.recipients.get(&id).map(|r| r.value().clone())
    }

    /// Adds recipients to a campaign after creation and bumps its total.
    pub fn append_recipients(
        &self,
        campaign_id: i64,
        recipients: Vec<NewRecipient>,
    ) -> StoreResult<Vec<Recipient>> {
        let added = self.insert_recipients(campaign_id, recipients)?;
        if let Some(mut campaign) = self.campaigns.get_mut(&campaign_id) {
            campaign.total_recipients += added.len() as u32;
            campaign.updated_at = Utc::now();
        }
        Ok(added)
    }

    fn insert_recipients(
        &self,
        campaign_id: i64,
        recipients: Vec<NewRecipient>,
    ) -> StoreResult<Vec<Recipient>> {
        if !self.campaigns.contains_key(&campaign_id) {
            return Err(StoreError::NotFound {
                entity: "campaign",
                id: campaign_id,
            });
        }

        let created: Vec<Recipient> = recipients
            .into_iter()
            .map(|r| {
                let recipient = Recipient {
                    id: self.next_recipient_id.fetch_add(1, Ordering::SeqCst),
                    campaign_id,
                    phone: r.phone,
                    name: r.name,
                    status: RecipientStatus::Pending,
                    sent_at: None,
                    error_message: None,
                };
                self.recipients.insert(recipient.id, recipient.clone());
                recipient
            })
            .collect();
        Ok(created)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecipientStore for InMemoryStore {
    async fn create_campaign(
        &self,
        campaign: NewCampaign,
        total_recipients: u32,
    ) -> StoreResult<Campaign> {
        let now = Utc::now();
        let created = Campaign {
            id: self.next_campaign_id.fetch_add(1, Ordering::SeqCst),
            name: campaign.name,
            message_text: campaign.message_text,
            status: CampaignStatus::Draft,
            total_recipients,
            sent_count: 0,
            failed_count: 0,
            min_delay_sec: campaign.min_delay_sec,
            max_delay_sec: campaign.max_delay_sec,
            created_at: now,
            updated_at: now,
        };
        self.campaigns.insert(created.id, created.clone());
        Ok(created)
    }

    async fn create_recipients(
        &self,
        campaign_id: i64,
        recipients: Vec<NewRecipient>,
    ) -> StoreResult<Vec<Recipient>> {
        self.insert_recipients(campaign_id, recipients)
    }

    async fn get_campaign(&self, id: i64) -> StoreResult<Option<Campaign>> {
        Ok(self.campaigns.get(&id).map(|r| r.value().clone()))
    }

    async fn get_campaign_recipients(
        &self,
        campaign_id: i64,
        status: Option<RecipientStatus>,
    ) -> StoreResult<Vec<Recipient>> {
        let mut recipients: Vec<Recipient> = self
            .recipients
            .iter()
            .filter(|r| r.campaign_id == campaign_id)
            .filter(|r| status.map_or(true, |s| r.status == s))
            .map(|r| r.value().clone())
            .collect();
        recipients.sort_by_key(|r| r.id);
        Ok(recipients)
    }

    async fn update_campaign_status(&self, id: i64, status: CampaignStatus) -> StoreResult<()> {
        let mut entry = self
            .campaigns
            .get_mut(&id)
            .ok_or(StoreError::NotFound {
                entity: "campaign",
                id,
            })?;
        debug!(campaign_id = id, from = %entry.status, to = %status, "Campaign status updated");
        entry.status = status;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn update_recipient_status(
        &self,
        id: i64,
        status: RecipientStatus,
        error_message: Option<&str>,
    ) -> StoreResult<()> {
        let mut entry = self
            .recipients
            .get_mut(&id)
            .ok_or(StoreError::NotFound {
                entity: "recipient",
                id,
            })?;

        if entry.status.is_terminal() {
            return Err(StoreError::RecipientAlreadyFinal(id));
        }
        if !status.is_terminal() {
            return Ok(());
        }

        entry.status = status;
        entry.sent_at = Some(Utc::now());
        entry.error_message = error_message.map(str::to_string);
        Ok(())
    }

    async fn increment_campaign_counters(
        &self,
        id: i64,
        sent_delta: u32,
        failed_delta: u32,
    ) -> StoreResult<()> {
        let mut entry = self
            .campaigns
            .get_mut(&id)
            .ok_or(StoreError::NotFound {
                entity: "campaign",
                id,
            })?;

        let headroom = entry.total_recipients.saturating_sub(entry.processed());
        if sent_delta + failed_delta > headroom {
            warn!(
                campaign_id = id,
                sent_delta,
                failed_delta,
                headroom,
                "Counter increment exceeds total recipients, clamping"
            );
        }
        let sent = sent_delta.min(headroom);
        let failed = failed_delta.min(headroom - sent);
        entry.sent_count += sent;
        entry.failed_count += failed;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn create_message_logs_batch(&self, entries: &[MessageLogEntry]) -> StoreResult<()> {
        self.message_logs
            .lock()
            .extend_from_slice(entries);
        Ok(())
    }
}
