use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a bulk campaign.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Running,
    Paused,
    Completed,
    Cancelled,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Running => "running",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CampaignStatus::Completed | CampaignStatus::Cancelled)
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery status of a single recipient. `Sent` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecipientStatus {
    Pending,
    Sent,
    Failed,
}

impl RecipientStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RecipientStatus::Pending)
    }
}

/// A bulk-send job: one template, many recipients, one pacing range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: i64,
    pub name: String,
    pub message_text: String,
    pub status: CampaignStatus,
    pub total_recipients: u32,
    pub sent_count: u32,
    pub failed_count: u32,
    pub min_delay_sec: u64,
    pub max_delay_sec: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// Recipients that have reached a terminal status.
    pub fn processed(&self) -> u32 {
        self.sent_count + self.failed_count
    }
}

/// Request to create a campaign in `draft`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCampaign {
    pub name: String,
    pub message_text: String,
    pub min_delay_sec: u64,
    pub max_delay_sec: u64,
}

impl NewCampaign {
    /// Checks the pacing range and message before anything is persisted.
    pub fn validate(&self) -> Result<(), String> {
        if self.message_text.trim().is_empty() {
            return Err("message text is empty".to_string());
        }
        if self.min_delay_sec == 0 {
            return Err("min_delay_sec must be greater than zero".to_string());
        }
        if self.min_delay_sec > self.max_delay_sec {
            return Err(format!(
                "min_delay_sec ({}) exceeds max_delay_sec ({})",
                self.min_delay_sec, self.max_delay_sec
            ));
        }
        Ok(())
    }
}

/// One (phone, name) target of a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub id: i64,
    pub campaign_id: i64,
    pub phone: String,
    pub name: Option<String>,
    pub status: RecipientStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Recipient row before it is attached to a campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRecipient {
    pub phone: String,
    pub name: Option<String>,
}

impl NewRecipient {
    pub fn new(phone: impl Into<String>, name: Option<&str>) -> Self {
        Self {
            phone: phone.into(),
            name: name.map(str::to_string),
        }
    }
}

/// Append-only record of one attempted send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageLogEntry {
    pub campaign_id: i64,
    pub recipient_phone: String,
    pub message_text: String,
    pub status: RecipientStatus,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// In-memory view of the dispatcher, as polled by the UI.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActiveCampaignStatus {
    pub is_running: bool,
    pub is_paused: bool,
    pub campaign_id: Option<i64>,
}

/// Acknowledgement returned by pause/resume.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlAck {
    pub success: bool,
}

impl ControlAck {
    pub fn ok() -> Self {
        Self { success: true }
    }
}

/// Store snapshot of one campaign combined with the dispatcher flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignStatusView {
    pub campaign: Campaign,
    pub pending: u32,
    pub sent: u32,
    pub failed: u32,
    pub is_active: bool,
    pub last_error: Option<String>,
}
