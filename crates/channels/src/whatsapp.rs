//! WhatsApp Business Cloud API channel.

use async_trait::async_trait;
use bulksend_core::config::WhatsAppConfig;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{ChannelError, ConnectionStatus, MessageChannel};

pub struct WhatsAppChannel {
    config: WhatsAppConfig,
    client: reqwest::Client,
    status: Mutex<ConnectionStatus>,
}

impl WhatsAppChannel {
    pub fn new(config: WhatsAppConfig) -> Self {
        info!(
            base = %config.api_base_url,
            phone_id = %config.phone_number_id,
            token_len = config.access_token.len(),
            "WhatsApp channel initialized"
        );
        Self {
            config,
            client: reqwest::Client::new(),
            status: Mutex::new(ConnectionStatus::Disconnected),
        }
    }

    /// Verify credentials against the phone-number endpoint and mark the
    /// session connected.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        if self.config.access_token.is_empty() || self.config.phone_number_id.is_empty() {
            return Err(ChannelError::Other(
                "WhatsApp access_token and phone_number_id must be configured".to_string(),
            ));
        }

        *self.status.lock() = ConnectionStatus::Connecting;
        let url = format!(
            "{}/{}",
            self.config.api_base_url.trim_end_matches('/'),
            self.config.phone_number_id
        );

        let result = self
            .client
            .get(&url)
            .bearer_auth(&self.config.access_token)
            .send()
            .await;

        let response = match result {
            Ok(r) => r,
            Err(e) => {
                *self.status.lock() = ConnectionStatus::Disconnected;
                return Err(e.into());
            }
        };

        if response.status().is_success() {
            *self.status.lock() = ConnectionStatus::Connected;
            info!(phone_id = %self.config.phone_number_id, "WhatsApp session connected");
            Ok(())
        } else {
            *self.status.lock() = ConnectionStatus::Disconnected;
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            warn!(status, "WhatsApp credential check failed");
            Err(ChannelError::Rejected { status, body })
        }
    }

    /// Reduce a phone to the digits-only international form the Cloud API expects.
    pub fn normalize_number(&self, phone: &str) -> Result<String, ChannelError> {
        let international = phone.trim_start().starts_with('+');
        let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            return Err(ChannelError::InvalidNumber(phone.to_string()));
        }

        match &self.config.default_country_code {
            Some(cc) if !international && !digits.starts_with(cc.as_str()) => {
                Ok(format!("{}{}", cc, digits.trim_start_matches('0')))
            }
            _ => Ok(digits),
        }
    }
}

#[async_trait]
impl MessageChannel for WhatsAppChannel {
    fn name(&self) -> &str {
        "whatsapp"
    }

    async fn connection_status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    async fn send_message(&self, phone: &str, text: &str) -> Result<String, ChannelError> {
        if *self.status.lock() != ConnectionStatus::Connected {
            return Err(ChannelError::NotConnected);
        }

        let to = self.normalize_number(phone)?;
        let url = format!(
            "{}/{}/messages",
            self.config.api_base_url.trim_end_matches('/'),
            self.config.phone_number_id
        );
        let body = serde_json::json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "text",
            "text": {
                "preview_url": false,
                "body": text
            }
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.access_token)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            metrics::counter!("whatsapp.rejected").increment(1);
            return Err(ChannelError::Rejected { status, body });
        }

        let result: serde_json::Value = response.json().await?;
        let message_id = result["messages"][0]["id"]
            .as_str()
            .unwrap_or("unknown")
            .to_string();

        metrics::counter!("whatsapp.accepted").increment(1);
        debug!(to = %to, message_id = %message_id, body_len = text.len(), "WhatsApp message accepted");
        Ok(message_id)
    }
}
