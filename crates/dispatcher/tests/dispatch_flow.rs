use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bulksend_channels::scripted::ScriptedChannel;
use bulksend_channels::ConnectionStatus;
use bulksend_core::config::{DispatcherConfig, StoreRetryConfig};
use bulksend_core::error::{DispatchError, StoreError, StoreResult};
use bulksend_core::event_bus::{capture_sink, CampaignEventType, CaptureSink};
use bulksend_core::store::{InMemoryStore, RecipientStore};
use bulksend_core::types::{
    ActiveCampaignStatus, Campaign, CampaignStatus, MessageLogEntry, NewCampaign, NewRecipient,
    Recipient, RecipientStatus,
};
use bulksend_dispatcher::{CampaignDispatcher, LoopOutcome};
use tokio::sync::Notify;
use tokio::time::Instant;

fn config() -> DispatcherConfig {
    DispatcherConfig {
        pacing_seed: Some(42),
        ..DispatcherConfig::default()
    }
}

fn recipients(n: usize) -> Vec<NewRecipient> {
    (1..=n)
        .map(|i| {
            let name = format!("Guest {}", i);
            NewRecipient::new(format!("+1555000{:04}", i), Some(name.as_str()))
        })
        .collect()
}

struct Harness {
    dispatcher: CampaignDispatcher,
    store: Arc<InMemoryStore>,
    channel: Arc<ScriptedChannel>,
    events: Arc<CaptureSink>,
}

impl Harness {
    fn new(channel: ScriptedChannel) -> Self {
        Self::with_config(channel, config())
    }

    fn with_config(channel: ScriptedChannel, config: DispatcherConfig) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let channel = Arc::new(channel);
        let events = capture_sink();
        let dispatcher = CampaignDispatcher::new(store.clone(), channel.clone(), config)
            .with_event_sink(events.clone());
        Self {
            dispatcher,
            store,
            channel,
            events,
        }
    }

    async fn campaign(&self, n: usize, min_delay: u64, max_delay: u64) -> Campaign {
        self.dispatcher
            .create_campaign(
                NewCampaign {
                    name: "spring promo".to_string(),
                    message_text: "Hi {{name}}, your code is ready ({{phone}})".to_string(),
                    min_delay_sec: min_delay,
                    max_delay_sec: max_delay,
                },
                recipients(n),
            )
            .await
            .unwrap()
    }

    async fn stored(&self, id: i64) -> Campaign {
        self.store.get_campaign(id).await.unwrap().unwrap()
    }

    async fn with_status(&self, id: i64, status: RecipientStatus) -> Vec<Recipient> {
        self.store
            .get_campaign_recipients(id, Some(status))
            .await
            .unwrap()
    }
}

#[tokio::test(start_paused = true)]
async fn test_all_recipients_sent_completes_campaign() {
    let h = Harness::new(ScriptedChannel::new());
    let campaign = h.campaign(4, 1, 3).await;

    h.dispatcher.start_campaign(campaign.id).await.unwrap();
    let outcome = h.dispatcher.wait_for_active().await;
    assert_eq!(outcome, Some(LoopOutcome::Completed { sent: 4, failed: 0 }));

    let stored = h.stored(campaign.id).await;
    assert_eq!(stored.status, CampaignStatus::Completed);
    assert_eq!(stored.sent_count, 4);
    assert_eq!(stored.failed_count, 0);
    assert_eq!(h.with_status(campaign.id, RecipientStatus::Sent).await.len(), 4);

    let attempts = h.channel.attempts();
    assert_eq!(attempts[0].phone, "+15550000001");
    assert_eq!(attempts[0].text, "Hi Guest 1, your code is ready (+15550000001)");
    assert_eq!(attempts[3].phone, "+15550000004");

    assert_eq!(h.events.count_type(CampaignEventType::CampaignStarted), 1);
    assert_eq!(h.events.count_type(CampaignEventType::RecipientSent), 4);
    assert_eq!(h.events.count_type(CampaignEventType::CampaignCompleted), 1);
    assert_eq!(h.dispatcher.active_campaign_status(), ActiveCampaignStatus::default());
}

#[tokio::test(start_paused = true)]
async fn test_delivery_failure_recorded_and_loop_continues() {
    let h = Harness::new(ScriptedChannel::new().failing_call(3, "invalid number"));
    let campaign = h.campaign(5, 1, 1).await;

    h.dispatcher.start_campaign(campaign.id).await.unwrap();
    let outcome = h.dispatcher.wait_for_active().await;
    assert_eq!(outcome, Some(LoopOutcome::Completed { sent: 4, failed: 1 }));

    let stored = h.stored(campaign.id).await;
    assert_eq!(stored.status, CampaignStatus::Completed);
    assert_eq!((stored.sent_count, stored.failed_count), (4, 1));

    let failed = h.with_status(campaign.id, RecipientStatus::Failed).await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].phone, "+15550000003");
    assert_eq!(failed[0].error_message.as_deref(), Some("invalid number"));
    assert!(failed[0].sent_at.is_some());

    let logs = h.store.message_logs(campaign.id);
    assert_eq!(logs.len(), 5);
    assert_eq!(logs[2].status, RecipientStatus::Failed);
    assert_eq!(logs[2].error_message.as_deref(), Some("invalid number"));
    assert_eq!(h.events.count_type(CampaignEventType::RecipientFailed), 1);
}

#[tokio::test(start_paused = true)]
async fn test_second_campaign_rejected_while_one_runs() {
    let h = Harness::new(ScriptedChannel::new());
    let a = h.campaign(3, 60, 60).await;
    let b = h.campaign(2, 1, 1).await;

    h.dispatcher.start_campaign(a.id).await.unwrap();
    let err = h.dispatcher.start_campaign(b.id).await.unwrap_err();
    assert!(matches!(err, DispatchError::AlreadyRunning { running } if running == a.id));

    let stored_b = h.stored(b.id).await;
    assert_eq!(stored_b.status, CampaignStatus::Draft);
    assert_eq!(h.with_status(b.id, RecipientStatus::Pending).await.len(), 2);

    h.dispatcher.pause_campaign(a.id).unwrap();
    assert_eq!(
        h.dispatcher.wait_for_active().await,
        Some(LoopOutcome::Paused { processed: 0 })
    );
    assert_eq!(h.channel.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_pause_interrupts_delay() {
    let h = Harness::new(ScriptedChannel::new());
    let campaign = h.campaign(5, 60, 60).await;
    let began = Instant::now();

    h.dispatcher.start_campaign(campaign.id).await.unwrap();
    h.channel.wait_for_calls(1).await;
    let ack = h.dispatcher.pause_campaign(campaign.id).unwrap();
    assert!(ack.success);

    // Pausing window: flag set, loop not yet stopped.
    assert_eq!(
        h.dispatcher.active_campaign_status(),
        ActiveCampaignStatus {
            is_running: true,
            is_paused: true,
            campaign_id: Some(campaign.id),
        }
    );

    let outcome = h.dispatcher.wait_for_active().await;
    assert_eq!(outcome, Some(LoopOutcome::Paused { processed: 1 }));
    assert!(began.elapsed() < Duration::from_secs(60));

    assert_eq!(h.stored(campaign.id).await.status, CampaignStatus::Paused);
    assert_eq!(h.with_status(campaign.id, RecipientStatus::Pending).await.len(), 4);
    assert_eq!(h.channel.call_count(), 1);
    assert_eq!(
        h.dispatcher.active_campaign_status(),
        ActiveCampaignStatus {
            is_running: false,
            is_paused: true,
            campaign_id: Some(campaign.id),
        }
    );
    assert_eq!(h.events.count_type(CampaignEventType::CampaignPaused), 1);
}

#[tokio::test(start_paused = true)]
async fn test_non_interruptible_delay_pauses_at_next_recipient() {
    let config = DispatcherConfig {
        interruptible_delay: false,
        ..config()
    };
    let h = Harness::with_config(ScriptedChannel::new(), config);
    let campaign = h.campaign(3, 60, 60).await;
    let began = Instant::now();

    h.dispatcher.start_campaign(campaign.id).await.unwrap();
    h.channel.wait_for_calls(1).await;
    h.dispatcher.pause_campaign(campaign.id).unwrap();

    let outcome = h.dispatcher.wait_for_active().await;
    assert_eq!(outcome, Some(LoopOutcome::Paused { processed: 1 }));
    assert!(began.elapsed() >= Duration::from_secs(60));
    assert_eq!(h.channel.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_resume_sends_only_remaining_recipients() {
    let h = Harness::new(ScriptedChannel::new());
    let campaign = h.campaign(5, 10, 20).await;

    h.dispatcher.start_campaign(campaign.id).await.unwrap();
    h.channel.wait_for_calls(2).await;
    h.dispatcher.pause_campaign(campaign.id).unwrap();
    assert_eq!(
        h.dispatcher.wait_for_active().await,
        Some(LoopOutcome::Paused { processed: 2 })
    );

    let ack = h.dispatcher.resume_campaign(campaign.id).await.unwrap();
    assert!(ack.success);
    assert_eq!(
        h.dispatcher.wait_for_active().await,
        Some(LoopOutcome::Completed { sent: 3, failed: 0 })
    );

    let phones: Vec<String> = h.channel.attempts().into_iter().map(|m| m.phone).collect();
    let expected: Vec<String> = recipients(5).into_iter().map(|r| r.phone).collect();
    assert_eq!(phones, expected);

    let stored = h.stored(campaign.id).await;
    assert_eq!(stored.status, CampaignStatus::Completed);
    assert_eq!(stored.sent_count, 5);
    assert_eq!(h.events.count_type(CampaignEventType::CampaignResumed), 1);
    assert_eq!(h.dispatcher.active_campaign_status(), ActiveCampaignStatus::default());
}

#[tokio::test(start_paused = true)]
async fn test_control_surface_preconditions() {
    let h = Harness::new(ScriptedChannel::new());
    let campaign = h.campaign(2, 30, 30).await;

    assert!(matches!(
        h.dispatcher.start_campaign(999).await,
        Err(DispatchError::NotFound(999))
    ));
    assert!(matches!(
        h.dispatcher.resume_campaign(campaign.id).await,
        Err(DispatchError::NotPaused(_))
    ));
    assert!(matches!(
        h.dispatcher.pause_campaign(campaign.id),
        Err(DispatchError::NotRunning(_))
    ));

    h.dispatcher.start_campaign(campaign.id).await.unwrap();
    assert!(matches!(
        h.dispatcher.resume_campaign(campaign.id).await,
        Err(DispatchError::NotPaused(_))
    ));
    // Pause is idempotent while the loop is winding down.
    h.dispatcher.pause_campaign(campaign.id).unwrap();
    h.dispatcher.pause_campaign(campaign.id).unwrap();
    h.dispatcher.wait_for_active().await;

    h.dispatcher.resume_campaign(campaign.id).await.unwrap();
    h.dispatcher.wait_for_active().await;
    assert!(matches!(
        h.dispatcher.start_campaign(campaign.id).await,
        Err(DispatchError::AlreadyCompleted(_))
    ));
    assert!(matches!(
        h.dispatcher.resume_campaign(campaign.id).await,
        Err(DispatchError::NotPaused(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_no_pending_recipients_finalizes_campaign() {
    let h = Harness::new(ScriptedChannel::new());
    let campaign = h.campaign(2, 1, 1).await;
    for r in h.with_status(campaign.id, RecipientStatus::Pending).await {
        h.store
            .update_recipient_status(r.id, RecipientStatus::Sent, None)
            .await
            .unwrap();
        h.store
            .increment_campaign_counters(campaign.id, 1, 0)
            .await
            .unwrap();
    }

    let err = h.dispatcher.start_campaign(campaign.id).await.unwrap_err();
    assert!(matches!(err, DispatchError::NoRecipients(id) if id == campaign.id));

    let stored = h.stored(campaign.id).await;
    assert_eq!(stored.status, CampaignStatus::Completed);
    assert_eq!(stored.processed(), stored.total_recipients);
    assert_eq!(h.channel.call_count(), 0);
    assert!(!h.dispatcher.active_campaign_status().is_running);
    assert_eq!(h.events.count_type(CampaignEventType::CampaignCompleted), 1);
}

#[tokio::test(start_paused = true)]
async fn test_hung_send_times_out_as_failure() {
    let h = Harness::new(ScriptedChannel::new().hanging_call(2));
    let campaign = h.campaign(3, 1, 1).await;
    let began = Instant::now();

    h.dispatcher.start_campaign(campaign.id).await.unwrap();
    let outcome = h.dispatcher.wait_for_active().await;
    assert_eq!(outcome, Some(LoopOutcome::Completed { sent: 2, failed: 1 }));
    assert!(began.elapsed() >= Duration::from_secs(30));

    let failed = h.with_status(campaign.id, RecipientStatus::Failed).await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].phone, "+15550000002");
    assert_eq!(
        failed[0].error_message.as_deref(),
        Some("Send timed out after 30s")
    );
}

#[tokio::test(start_paused = true)]
async fn test_pause_during_hung_send_waits_for_timeout() {
    let h = Harness::new(ScriptedChannel::new().hanging_call(1));
    let campaign = h.campaign(3, 1, 1).await;

    h.dispatcher.start_campaign(campaign.id).await.unwrap();
    // Let the loop reach the hung send.
    tokio::time::sleep(Duration::from_secs(1)).await;
    h.dispatcher.pause_campaign(campaign.id).unwrap();

    let outcome = h.dispatcher.wait_for_active().await;
    assert_eq!(outcome, Some(LoopOutcome::Paused { processed: 1 }));
    assert_eq!(h.with_status(campaign.id, RecipientStatus::Failed).await.len(), 1);
    assert_eq!(h.with_status(campaign.id, RecipientStatus::Pending).await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_message_logs_flushed_in_batches() {
    let h = Harness::new(ScriptedChannel::new());
    let campaign = h.campaign(15, 5, 5).await;

    h.dispatcher.start_campaign(campaign.id).await.unwrap();
    h.channel.wait_for_calls(11).await;
    assert_eq!(h.store.message_logs(campaign.id).len(), 10);

    h.dispatcher.pause_campaign(campaign.id).unwrap();
    assert_eq!(
        h.dispatcher.wait_for_active().await,
        Some(LoopOutcome::Paused { processed: 11 })
    );
    assert_eq!(h.store.message_logs(campaign.id).len(), 11);
}

#[tokio::test(start_paused = true)]
async fn test_recipients_added_mid_run_not_picked_up() {
    let h = Harness::new(ScriptedChannel::new());
    let campaign = h.campaign(2, 30, 30).await;

    h.dispatcher.start_campaign(campaign.id).await.unwrap();
    h.channel.wait_for_calls(1).await;
    h.store
        .append_recipients(campaign.id, vec![NewRecipient::new("+15559999999", None)])
        .unwrap();

    assert_eq!(
        h.dispatcher.wait_for_active().await,
        Some(LoopOutcome::Completed { sent: 2, failed: 0 })
    );
    assert_eq!(h.channel.call_count(), 2);
    let pending = h.with_status(campaign.id, RecipientStatus::Pending).await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].phone, "+15559999999");
}

#[tokio::test(start_paused = true)]
async fn test_leftover_running_status_is_resumable() {
    let h = Harness::new(ScriptedChannel::new());
    let campaign = h.campaign(3, 1, 1).await;

    // State a crashed process leaves behind: running, one recipient done.
    h.store
        .update_campaign_status(campaign.id, CampaignStatus::Running)
        .await
        .unwrap();
    let pending = h.with_status(campaign.id, RecipientStatus::Pending).await;
    let first = &pending[0];
    h.store
        .update_recipient_status(first.id, RecipientStatus::Sent, None)
        .await
        .unwrap();
    h.store
        .increment_campaign_counters(campaign.id, 1, 0)
        .await
        .unwrap();
    assert!(!h.dispatcher.active_campaign_status().is_running);

    h.dispatcher.resume_campaign(campaign.id).await.unwrap();
    assert_eq!(
        h.dispatcher.wait_for_active().await,
        Some(LoopOutcome::Completed { sent: 2, failed: 0 })
    );

    let stored = h.stored(campaign.id).await;
    assert_eq!(stored.status, CampaignStatus::Completed);
    assert_eq!(stored.sent_count, 3);
    assert_eq!(h.channel.call_count(), 2);

    let resumed = h
        .events
        .events()
        .into_iter()
        .find(|e| e.event_type == CampaignEventType::CampaignResumed)
        .unwrap();
    assert_eq!(resumed.detail.as_deref(), Some("recover"));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_aborts_and_leaves_campaign_resumable() {
    let h = Harness::new(ScriptedChannel::new());
    let campaign = h.campaign(3, 60, 60).await;

    h.dispatcher.start_campaign(campaign.id).await.unwrap();
    h.channel.wait_for_calls(1).await;
    let outcome = h.dispatcher.shutdown().await;
    assert_eq!(outcome, Some(LoopOutcome::Aborted { processed: 1 }));

    assert_eq!(h.stored(campaign.id).await.status, CampaignStatus::Running);
    assert_eq!(h.dispatcher.active_campaign_status(), ActiveCampaignStatus::default());
    assert_eq!(h.events.count_type(CampaignEventType::CampaignAborted), 1);
    assert!(matches!(
        h.dispatcher.resume_campaign(campaign.id).await,
        Err(DispatchError::ShuttingDown)
    ));

    // A fresh process picks up from the first pending recipient.
    let restarted = CampaignDispatcher::new(h.store.clone(), h.channel.clone(), config());
    restarted.resume_campaign(campaign.id).await.unwrap();
    assert_eq!(
        restarted.wait_for_active().await,
        Some(LoopOutcome::Completed { sent: 2, failed: 0 })
    );
    assert_eq!(h.channel.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_counters_stay_within_total_while_running() {
    let h = Harness::new(ScriptedChannel::new().failing_call(2, "blocked"));
    let campaign = h.campaign(6, 2, 4).await;

    h.dispatcher.start_campaign(campaign.id).await.unwrap();
    let mut last_processed = 0;
    while h.dispatcher.active_campaign_status().is_running {
        let stored = h.stored(campaign.id).await;
        assert!(stored.processed() <= stored.total_recipients);
        assert!(stored.processed() >= last_processed);
        last_processed = stored.processed();
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    let stored = h.stored(campaign.id).await;
    assert_eq!(stored.status, CampaignStatus::Completed);
    assert_eq!(stored.processed(), stored.total_recipients);
}

/// Delegates to `InMemoryStore`, failing selected writes as unavailable.
struct FlakyStore {
    inner: Arc<InMemoryStore>,
    recipient_failures: AtomicU32,
    status_failures: AtomicU32,
    hold_next_pending_read: AtomicBool,
    held: Notify,
    release: Notify,
}

impl FlakyStore {
    fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            recipient_failures: AtomicU32::new(0),
            status_failures: AtomicU32::new(0),
            hold_next_pending_read: AtomicBool::new(false),
            held: Notify::new(),
            release: Notify::new(),
        }
    }

    /// Park the next pending-recipient read until `release` is notified.
    fn hold_pending_reads(&self) {
        self.hold_next_pending_read.store(true, Ordering::SeqCst);
    }

    fn fail_recipient_writes(&self, times: u32) {
        self.recipient_failures.store(times, Ordering::SeqCst);
    }

    fn fail_status_writes(&self, times: u32) {
        self.status_failures.store(times, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicU32) -> StoreResult<()> {
        let left = counter.load(Ordering::SeqCst);
        if left == 0 {
            return Ok(());
        }
        counter.store(left - 1, Ordering::SeqCst);
        Err(StoreError::Unavailable("database is locked".to_string()))
    }
}

#[async_trait]
impl RecipientStore for FlakyStore {
    async fn create_campaign(&self, campaign: NewCampaign, total: u32) -> StoreResult<Campaign> {
        self.inner.create_campaign(campaign, total).await
    }

    async fn create_recipients(
        &self,
        campaign_id: i64,
        recipients: Vec<NewRecipient>,
    ) -> StoreResult<Vec<Recipient>> {
        self.inner.create_recipients(campaign_id, recipients).await
    }

    async fn get_campaign(&self, id: i64) -> StoreResult<Option<Campaign>> {
        self.inner.get_campaign(id).await
    }

    async fn get_campaign_recipients(
        &self,
        campaign_id: i64,
        status: Option<RecipientStatus>,
    ) -> StoreResult<Vec<Recipient>> {
        if status == Some(RecipientStatus::Pending)
            && self.hold_next_pending_read.swap(false, Ordering::SeqCst)
        {
            self.held.notify_one();
            self.release.notified().await;
        }
        self.inner.get_campaign_recipients(campaign_id, status).await
    }

    async fn update_campaign_status(&self, id: i64, status: CampaignStatus) -> StoreResult<()> {
        Self::take_failure(&self.status_failures)?;
        self.inner.update_campaign_status(id, status).await
    }

    async fn update_recipient_status(
        &self,
        id: i64,
        status: RecipientStatus,
        error_message: Option<&str>,
    ) -> StoreResult<()> {
        Self::take_failure(&self.recipient_failures)?;
        self.inner
            .update_recipient_status(id, status, error_message)
            .await
    }

    async fn increment_campaign_counters(
        &self,
        id: i64,
        sent_delta: u32,
        failed_delta: u32,
    ) -> StoreResult<()> {
        self.inner
            .increment_campaign_counters(id, sent_delta, failed_delta)
            .await
    }

    async fn create_message_logs_batch(&self, entries: &[MessageLogEntry]) -> StoreResult<()> {
        self.inner.create_message_logs_batch(entries).await
    }
}

type FlakyHarness = (
    CampaignDispatcher,
    Arc<FlakyStore>,
    Arc<InMemoryStore>,
    Arc<ScriptedChannel>,
    Arc<CaptureSink>,
);

fn flaky_harness(channel: ScriptedChannel) -> FlakyHarness {
    let inner = Arc::new(InMemoryStore::new());
    let flaky = Arc::new(FlakyStore::new(inner.clone()));
    let channel = Arc::new(channel);
    let events = capture_sink();
    let config = DispatcherConfig {
        store_retry: StoreRetryConfig {
            max_retries: 2,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
        },
        ..config()
    };
    let dispatcher = CampaignDispatcher::new(flaky.clone(), channel.clone(), config)
        .with_event_sink(events.clone());
    (dispatcher, flaky, inner, channel, events)
}

async fn create(dispatcher: &CampaignDispatcher, n: usize) -> Campaign {
    dispatcher
        .create_campaign(
            NewCampaign {
                name: "flaky".to_string(),
                message_text: "Hello {{name}}".to_string(),
                min_delay_sec: 1,
                max_delay_sec: 2,
            },
            recipients(n),
        )
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_transient_store_failures_are_retried() {
    let (dispatcher, flaky, inner, channel, _) = flaky_harness(ScriptedChannel::new());
    let campaign = create(&dispatcher, 3).await;

    dispatcher.start_campaign(campaign.id).await.unwrap();
    flaky.fail_recipient_writes(2);
    assert_eq!(
        dispatcher.wait_for_active().await,
        Some(LoopOutcome::Completed { sent: 3, failed: 0 })
    );

    let stored = inner.get_campaign(campaign.id).await.unwrap().unwrap();
    assert_eq!(stored.sent_count, 3);
    assert_eq!(channel.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_persistent_store_failure_stalls_campaign() {
    let (dispatcher, flaky, inner, channel, events) = flaky_harness(ScriptedChannel::new());
    let campaign = create(&dispatcher, 3).await;

    dispatcher.start_campaign(campaign.id).await.unwrap();
    flaky.fail_recipient_writes(u32::MAX);
    let outcome = dispatcher.wait_for_active().await;
    assert!(matches!(
        outcome,
        Some(LoopOutcome::Stalled { processed: 0, ref error }) if error.contains("database is locked")
    ));

    let stored = inner.get_campaign(campaign.id).await.unwrap().unwrap();
    assert_eq!(stored.status, CampaignStatus::Paused);
    assert_eq!(stored.processed(), 0);
    assert_eq!(channel.call_count(), 1);
    assert_eq!(events.count_type(CampaignEventType::CampaignStalled), 1);

    let status = dispatcher.campaign_status(campaign.id).await.unwrap();
    assert!(!status.is_active);
    assert_eq!(status.pending, 3);
    assert!(status.last_error.is_some());
    assert_eq!(
        dispatcher.active_campaign_status(),
        ActiveCampaignStatus {
            is_running: false,
            is_paused: true,
            campaign_id: Some(campaign.id),
        }
    );

    // The unconfirmed recipient is sent again once the store recovers.
    flaky.fail_recipient_writes(0);
    dispatcher.resume_campaign(campaign.id).await.unwrap();
    assert_eq!(
        dispatcher.wait_for_active().await,
        Some(LoopOutcome::Completed { sent: 3, failed: 0 })
    );
    assert_eq!(channel.call_count(), 4);
    assert!(dispatcher
        .campaign_status(campaign.id)
        .await
        .unwrap()
        .last_error
        .is_none());
}

#[tokio::test(start_paused = true)]
async fn test_completion_write_failure_stalls_campaign() {
    let (dispatcher, flaky, inner, _, _) = flaky_harness(ScriptedChannel::new());
    let campaign = create(&dispatcher, 1).await;

    dispatcher.start_campaign(campaign.id).await.unwrap();
    // Exhaust the completion write; the single paused write afterwards lands.
    flaky.fail_status_writes(3);
    let outcome = dispatcher.wait_for_active().await;
    assert!(matches!(outcome, Some(LoopOutcome::Stalled { processed: 1, .. })));

    let stored = inner.get_campaign(campaign.id).await.unwrap().unwrap();
    assert_eq!(stored.status, CampaignStatus::Paused);
    assert_eq!(stored.sent_count, 1);

    let err = dispatcher.resume_campaign(campaign.id).await.unwrap_err();
    assert!(matches!(err, DispatchError::NoRecipients(_)));
    let stored = inner.get_campaign(campaign.id).await.unwrap().unwrap();
    assert_eq!(stored.status, CampaignStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_pause_rejected_while_launch_is_preparing() {
    let (dispatcher, flaky, inner, channel, events) = flaky_harness(ScriptedChannel::new());
    let campaign = create(&dispatcher, 2).await;
    channel.set_status(ConnectionStatus::Connecting);
    flaky.hold_pending_reads();

    let pause_mid_launch = async {
        flaky.held.notified().await;
        let rejected = dispatcher.pause_campaign(campaign.id);
        // The reservation still excludes other launches.
        assert!(dispatcher.active_campaign_status().is_running);
        flaky.release.notify_one();
        rejected
    };
    let (launched, paused) =
        tokio::join!(dispatcher.start_campaign(campaign.id), pause_mid_launch);

    assert!(matches!(paused, Err(DispatchError::NotRunning(id)) if id == campaign.id));
    assert!(matches!(launched, Err(DispatchError::ChannelNotReady(_))));
    assert!(matches!(
        dispatcher.pause_campaign(campaign.id),
        Err(DispatchError::NotRunning(_))
    ));

    let stored = inner.get_campaign(campaign.id).await.unwrap().unwrap();
    assert_eq!(stored.status, CampaignStatus::Draft);
    assert_eq!(channel.call_count(), 0);
    assert_eq!(events.count_type(CampaignEventType::CampaignPaused), 0);
    assert_eq!(dispatcher.active_campaign_status(), ActiveCampaignStatus::default());
}
