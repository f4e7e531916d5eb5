use serde::Deserialize;

/// Root application configuration. Loaded from an optional `bulksend.toml`
/// and environment variables with the prefix `BULKSEND__`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub campaign_defaults: CampaignDefaults,
    #[serde(default)]
    pub whatsapp: WhatsAppConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    /// Log entries buffered before a batch write.
    #[serde(default = "default_log_batch_size")]
    pub log_batch_size: usize,
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    /// When false the inter-send delay always runs to completion and a
    /// pause is only observed at the next recipient.
    #[serde(default = "default_interruptible_delay")]
    pub interruptible_delay: bool,
    #[serde(default)]
    pub store_retry: StoreRetryConfig,
    /// Fixed seed for the pacing RNG; entropy when unset.
    #[serde(default)]
    pub pacing_seed: Option<u64>,
}

/// Exponential backoff for store writes made by the send loop.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreRetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CampaignDefaults {
    #[serde(default = "default_min_delay_sec")]
    pub min_delay_sec: u64,
    #[serde(default = "default_max_delay_sec")]
    pub max_delay_sec: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppConfig {
    #[serde(default = "default_whatsapp_base_url")]
    pub api_base_url: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub phone_number_id: String,
    /// Prepended to numbers that carry no country code.
    #[serde(default)]
    pub default_country_code: Option<String>,
}

// Default functions
fn default_log_batch_size() -> usize {
    10
}
fn default_send_timeout_secs() -> u64 {
    30
}
fn default_interruptible_delay() -> bool {
    true
}
fn default_max_retries() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    200
}
fn default_max_backoff_ms() -> u64 {
    5000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_min_delay_sec() -> u64 {
    5
}
fn default_max_delay_sec() -> u64 {
    15
}
fn default_whatsapp_base_url() -> String {
    "https://graph.facebook.com/v21.0".to_string()
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            log_batch_size: default_log_batch_size(),
            send_timeout_secs: default_send_timeout_secs(),
            interruptible_delay: default_interruptible_delay(),
            store_retry: StoreRetryConfig::default(),
            pacing_seed: None,
        }
    }
}

impl Default for StoreRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl StoreRetryConfig {
    /// Backoff before retry number `attempt` (0-indexed).
    pub fn backoff_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let base_ms = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped_ms = base_ms.min(self.max_backoff_ms as f64);
        std::time::Duration::from_millis(capped_ms as u64)
    }
}

impl Default for CampaignDefaults {
    fn default() -> Self {
        Self {
            min_delay_sec: default_min_delay_sec(),
            max_delay_sec: default_max_delay_sec(),
        }
    }
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_whatsapp_base_url(),
            access_token: String::new(),
            phone_number_id: String::new(),
            default_country_code: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional config file and environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("bulksend").required(false))
            .add_source(
                config::Environment::with_prefix("BULKSEND")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
