//! bulksend: paced bulk messaging from a CSV recipient list.
//!
//! Loads recipients, creates a campaign and drives it through the dispatcher
//! until it completes. Ctrl-C pauses the campaign and shuts down cleanly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bulksend_channels::scripted::ScriptedChannel;
use bulksend_channels::whatsapp::WhatsAppChannel;
use bulksend_channels::MessageChannel;
use bulksend_core::config::AppConfig;
use bulksend_core::event_bus::TracingSink;
use bulksend_core::ingest::parse_recipients_csv;
use bulksend_core::store::InMemoryStore;
use bulksend_core::types::NewCampaign;
use bulksend_dispatcher::{CampaignDispatcher, LoopOutcome};
use clap::Parser;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "bulksend")]
#[command(about = "Paced bulk messaging over a single outbound channel")]
#[command(version)]
struct Cli {
    /// CSV file with a phone column and an optional name column
    #[arg(long)]
    csv: PathBuf,

    /// Message template; supports {{name}} and {{phone}}
    #[arg(long, env = "BULKSEND__MESSAGE")]
    message: String,

    /// Campaign name
    #[arg(long, default_value = "bulk campaign")]
    name: String,

    /// Minimum delay between sends in seconds (overrides config)
    #[arg(long, env = "BULKSEND__CAMPAIGN_DEFAULTS__MIN_DELAY_SEC")]
    min_delay: Option<u64>,

    /// Maximum delay between sends in seconds (overrides config)
    #[arg(long, env = "BULKSEND__CAMPAIGN_DEFAULTS__MAX_DELAY_SEC")]
    max_delay: Option<u64>,

    /// Send through an in-process channel instead of WhatsApp
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bulksend=info,bulksend_dispatcher=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("bulksend starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });
    if let Some(min) = cli.min_delay {
        config.campaign_defaults.min_delay_sec = min;
    }
    if let Some(max) = cli.max_delay {
        config.campaign_defaults.max_delay_sec = max;
    }

    let csv = std::fs::read_to_string(&cli.csv)
        .with_context(|| format!("reading {}", cli.csv.display()))?;
    let report = parse_recipients_csv(&csv)?;
    for warning in &report.warnings {
        warn!(warning = %warning, "Skipped CSV row");
    }
    info!(
        recipients = report.recipients.len(),
        skipped = report.warnings.len(),
        "Recipients loaded"
    );

    let channel: Arc<dyn MessageChannel> = if cli.dry_run {
        info!("Dry run, messages are not delivered");
        Arc::new(ScriptedChannel::new().with_latency(Duration::from_millis(50)))
    } else {
        let whatsapp = WhatsAppChannel::new(config.whatsapp.clone());
        whatsapp
            .connect()
            .await
            .context("connecting to WhatsApp Cloud API")?;
        Arc::new(whatsapp)
    };

    let store = Arc::new(InMemoryStore::new());
    let dispatcher = Arc::new(
        CampaignDispatcher::new(store, channel, config.dispatcher.clone())
            .with_event_sink(Arc::new(TracingSink)),
    );

    let campaign = dispatcher
        .create_campaign(
            NewCampaign {
                name: cli.name,
                message_text: cli.message,
                min_delay_sec: config.campaign_defaults.min_delay_sec,
                max_delay_sec: config.campaign_defaults.max_delay_sec,
            },
            report.recipients,
        )
        .await?;
    dispatcher.start_campaign(campaign.id).await?;

    let outcome = tokio::select! {
        outcome = dispatcher.wait_for_active() => outcome,
        _ = tokio::signal::ctrl_c() => {
            info!(campaign_id = campaign.id, "Interrupt received, pausing campaign");
            if let Err(e) = dispatcher.pause_campaign(campaign.id) {
                warn!(error = %e, "Pause rejected");
            }
            dispatcher.shutdown().await
        }
    };

    match &outcome {
        Some(LoopOutcome::Completed { sent, failed }) => {
            info!(campaign_id = campaign.id, sent, failed, "Campaign finished");
        }
        Some(other) => warn!(campaign_id = campaign.id, outcome = ?other, "Campaign stopped early"),
        None => warn!(campaign_id = campaign.id, "Send loop ended without an outcome"),
    }

    let status = dispatcher.campaign_status(campaign.id).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);

    Ok(())
}
