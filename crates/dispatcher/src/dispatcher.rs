//! Campaign control surface.
//!
//! One `CampaignDispatcher` is built at process start and shared behind an
//! `Arc`. It owns the running flag, so at most one send loop exists per
//! process and the channel never sees two sends in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bulksend_channels::{ConnectionStatus, MessageChannel};
use bulksend_core::config::DispatcherConfig;
use bulksend_core::error::{DispatchError, DispatchResult};
use bulksend_core::event_bus::{make_event, noop_sink, CampaignEventType, EventSink};
use bulksend_core::pacing::Pacer;
use bulksend_core::store::RecipientStore;
use bulksend_core::types::{
    ActiveCampaignStatus, Campaign, CampaignStatus, CampaignStatusView, ControlAck, NewCampaign,
    NewRecipient, Recipient, RecipientStatus,
};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::send_loop::{LoopOutcome, RunSignals, SendLoop};
use crate::state_machine::CampaignStateMachine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaunchKind {
    Start,
    Resume,
}

struct ActiveRun {
    run_id: u64,
    campaign_id: i64,
    /// False while the launch is still checking preconditions.
    launched: bool,
    signals: RunSignals,
    done: watch::Receiver<Option<LoopOutcome>>,
}

#[derive(Default)]
struct DispatcherState {
    /// Reserved from the moment a launch passes the exclusion check until
    /// its loop has exited.
    active: Option<ActiveRun>,
    /// Campaign most recently stopped by pause or a stall.
    paused: Option<i64>,
    last_errors: HashMap<i64, String>,
}

pub struct CampaignDispatcher {
    store: Arc<dyn RecipientStore>,
    channel: Arc<dyn MessageChannel>,
    events: Arc<dyn EventSink>,
    pacer: Arc<Mutex<Pacer>>,
    config: DispatcherConfig,
    state: Arc<Mutex<DispatcherState>>,
    next_run_id: AtomicU64,
    shutdown: CancellationToken,
}

impl CampaignDispatcher {
    pub fn new(
        store: Arc<dyn RecipientStore>,
        channel: Arc<dyn MessageChannel>,
        config: DispatcherConfig,
    ) -> Self {
        let pacer = Pacer::from_seed_option(config.pacing_seed);
        Self {
            store,
            channel,
            events: noop_sink(),
            pacer: Arc::new(Mutex::new(pacer)),
            config,
            state: Arc::new(Mutex::new(DispatcherState::default())),
            next_run_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Create a `draft` campaign with its recipients. Nothing is sent.
    pub async fn create_campaign(
        &self,
        campaign: NewCampaign,
        recipients: Vec<NewRecipient>,
    ) -> DispatchResult<Campaign> {
        campaign.validate().map_err(DispatchError::InvalidCampaign)?;
        if recipients.is_empty() {
            return Err(DispatchError::InvalidCampaign(
                "campaign has no recipients".to_string(),
            ));
        }

        let total = recipients.len() as u32;
        let created = self.store.create_campaign(campaign, total).await?;
        self.store.create_recipients(created.id, recipients).await?;

        info!(
            campaign_id = created.id,
            name = %created.name,
            recipients = total,
            "Campaign created"
        );
        Ok(created)
    }

    /// Begin sending to every `pending` recipient. Returns once the send
    /// loop has been spawned.
    pub async fn start_campaign(&self, campaign_id: i64) -> DispatchResult<()> {
        self.launch(campaign_id, LaunchKind::Start).await
    }

    /// Continue a `paused` campaign, or one left `running` by a crash.
    /// Only recipients still `pending` are sent to.
    pub async fn resume_campaign(&self, campaign_id: i64) -> DispatchResult<ControlAck> {
        self.launch(campaign_id, LaunchKind::Resume).await?;
        Ok(ControlAck::ok())
    }

    /// Ask the active loop to stop at its next checkpoint. The persisted
    /// status stays `running` until the loop observes the request. A launch
    /// still checking preconditions has no loop yet and is `NotRunning`.
    pub fn pause_campaign(&self, campaign_id: i64) -> DispatchResult<ControlAck> {
        let state = self.state.lock();
        match &state.active {
            Some(run) if run.campaign_id == campaign_id && run.launched => {
                if !run.signals.stop.is_cancelled() {
                    info!(campaign_id, "Pause requested");
                    run.signals.stop.cancel();
                }
                Ok(ControlAck::ok())
            }
            _ => Err(DispatchError::NotRunning(campaign_id)),
        }
    }

    /// In-memory flags only; the store may lag by one loop iteration.
    pub fn active_campaign_status(&self) -> ActiveCampaignStatus {
        let state = self.state.lock();
        match (&state.active, state.paused) {
            (Some(run), _) => ActiveCampaignStatus {
                is_running: true,
                is_paused: run.signals.stop.is_cancelled(),
                campaign_id: Some(run.campaign_id),
            },
            (None, Some(campaign_id)) => ActiveCampaignStatus {
                is_running: false,
                is_paused: true,
                campaign_id: Some(campaign_id),
            },
            (None, None) => ActiveCampaignStatus::default(),
        }
    }

    /// Store snapshot of one campaign plus per-status recipient counts.
    pub async fn campaign_status(&self, campaign_id: i64) -> DispatchResult<CampaignStatusView> {
        let campaign = self
            .store
            .get_campaign(campaign_id)
            .await?
            .ok_or(DispatchError::NotFound(campaign_id))?;
        let recipients = self
            .store
            .get_campaign_recipients(campaign_id, None)
            .await?;

        let count = |status: RecipientStatus| {
            recipients.iter().filter(|r| r.status == status).count() as u32
        };
        let (is_active, last_error) = {
            let state = self.state.lock();
            (
                state
                    .active
                    .as_ref()
                    .is_some_and(|run| run.campaign_id == campaign_id),
                state.last_errors.get(&campaign_id).cloned(),
            )
        };

        Ok(CampaignStatusView {
            pending: count(RecipientStatus::Pending),
            sent: count(RecipientStatus::Sent),
            failed: count(RecipientStatus::Failed),
            campaign,
            is_active,
            last_error,
        })
    }

    /// Wait for the active loop to exit. `None` when nothing is running.
    pub async fn wait_for_active(&self) -> Option<LoopOutcome> {
        let mut done = self.state.lock().active.as_ref().map(|run| run.done.clone())?;
        let outcome = done.wait_for(|outcome| outcome.is_some()).await.ok()?.clone();
        outcome
    }

    /// Abort the active loop at its next checkpoint and wait for it. The
    /// campaign keeps its persisted `running` status and can be resumed
    /// after restart. Later launches are rejected.
    pub async fn shutdown(&self) -> Option<LoopOutcome> {
        info!("Dispatcher shutting down");
        self.shutdown.cancel();
        self.wait_for_active().await
    }

    async fn launch(&self, campaign_id: i64, kind: LaunchKind) -> DispatchResult<()> {
        let (run_id, signals, done_tx) = self.reserve(campaign_id, kind)?;

        match self.prepare(campaign_id, kind).await {
            Ok((campaign, recipients)) => {
                {
                    let mut state = self.state.lock();
                    if let Some(run) = state.active.as_mut().filter(|run| run.run_id == run_id) {
                        run.launched = true;
                    }
                    state.paused = None;
                    state.last_errors.remove(&campaign_id);
                }
                self.spawn_loop(run_id, campaign, recipients, signals, done_tx);
                Ok(())
            }
            Err(e) => {
                self.release(run_id);
                Err(e)
            }
        }
    }

    /// Check-and-set on the running flag, before any await point.
    fn reserve(
        &self,
        campaign_id: i64,
        kind: LaunchKind,
    ) -> DispatchResult<(u64, RunSignals, watch::Sender<Option<LoopOutcome>>)> {
        if self.shutdown.is_cancelled() {
            return Err(DispatchError::ShuttingDown);
        }

        let mut state = self.state.lock();
        if let Some(run) = &state.active {
            if kind == LaunchKind::Resume && run.campaign_id == campaign_id {
                return Err(DispatchError::NotPaused(campaign_id));
            }
            warn!(
                campaign_id,
                running = run.campaign_id,
                "Launch rejected, another campaign is running"
            );
            return Err(DispatchError::AlreadyRunning {
                running: run.campaign_id,
            });
        }

        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        let signals = RunSignals {
            stop: CancellationToken::new(),
            abort: self.shutdown.child_token(),
        };
        let (done_tx, done_rx) = watch::channel(None);
        state.active = Some(ActiveRun {
            run_id,
            campaign_id,
            launched: false,
            signals: signals.clone(),
            done: done_rx,
        });
        Ok((run_id, signals, done_tx))
    }

    fn release(&self, run_id: u64) {
        let mut state = self.state.lock();
        if state.active.as_ref().is_some_and(|run| run.run_id == run_id) {
            state.active = None;
        }
    }

    /// Validate preconditions and move the campaign to `running`.
    async fn prepare(
        &self,
        campaign_id: i64,
        kind: LaunchKind,
    ) -> DispatchResult<(Campaign, Vec<Recipient>)> {
        let mut campaign = self
            .store
            .get_campaign(campaign_id)
            .await?
            .ok_or(DispatchError::NotFound(campaign_id))?;

        match (kind, campaign.status) {
            (LaunchKind::Start, CampaignStatus::Completed) => {
                return Err(DispatchError::AlreadyCompleted(campaign_id));
            }
            (LaunchKind::Resume, CampaignStatus::Paused | CampaignStatus::Running) => {}
            (LaunchKind::Resume, _) => return Err(DispatchError::NotPaused(campaign_id)),
            (LaunchKind::Start, _) => {}
        }

        let from = campaign.status;
        let mut machine = CampaignStateMachine::new(from);
        let pending = self
            .store
            .get_campaign_recipients(campaign_id, Some(RecipientStatus::Pending))
            .await?;

        if pending.is_empty() {
            machine.transition(CampaignStatus::Completed)?;
            self.store
                .update_campaign_status(campaign_id, CampaignStatus::Completed)
                .await?;
            info!(campaign_id, "No pending recipients, campaign finalized");
            self.events.emit(make_event(
                CampaignEventType::CampaignCompleted,
                campaign_id,
                None,
                Some("no pending recipients".to_string()),
            ));
            return Err(DispatchError::NoRecipients(campaign_id));
        }

        if self.channel.connection_status().await != ConnectionStatus::Connected {
            return Err(DispatchError::ChannelNotReady(self.channel.name().to_string()));
        }

        machine.transition(CampaignStatus::Running)?;
        self.store
            .update_campaign_status(campaign_id, CampaignStatus::Running)
            .await?;
        campaign.status = machine.state;

        let trigger = CampaignStateMachine::trigger(from, CampaignStatus::Running);
        let event_type = match kind {
            LaunchKind::Start => CampaignEventType::CampaignStarted,
            LaunchKind::Resume => CampaignEventType::CampaignResumed,
        };
        info!(
            campaign_id,
            pending = pending.len(),
            trigger = trigger.unwrap_or_default(),
            "Campaign running"
        );
        self.events.emit(make_event(
            event_type,
            campaign_id,
            None,
            trigger.map(str::to_string),
        ));

        Ok((campaign, pending))
    }

    fn spawn_loop(
        &self,
        run_id: u64,
        campaign: Campaign,
        recipients: Vec<Recipient>,
        signals: RunSignals,
        done_tx: watch::Sender<Option<LoopOutcome>>,
    ) {
        let campaign_id = campaign.id;
        let send_loop = SendLoop {
            campaign,
            recipients,
            store: self.store.clone(),
            channel: self.channel.clone(),
            events: self.events.clone(),
            pacer: self.pacer.clone(),
            config: self.config.clone(),
            signals,
        };
        let state = self.state.clone();

        tokio::spawn(async move {
            let outcome = match tokio::spawn(send_loop.run()).await {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    error!(campaign_id, error = %e, "Send loop terminated unexpectedly");
                    None
                }
            };
            finish_run(&state, run_id, campaign_id, outcome.as_ref());
            done_tx.send_replace(outcome);
        });
    }
}

/// Clear the running flag and remember why the run stopped.
fn finish_run(
    state: &Mutex<DispatcherState>,
    run_id: u64,
    campaign_id: i64,
    outcome: Option<&LoopOutcome>,
) {
    let mut state = state.lock();
    if state.active.as_ref().is_some_and(|run| run.run_id == run_id) {
        state.active = None;
    }
    match outcome {
        Some(LoopOutcome::Paused { .. }) => state.paused = Some(campaign_id),
        Some(LoopOutcome::Stalled { error, .. }) => {
            state.paused = Some(campaign_id);
            state.last_errors.insert(campaign_id, error.clone());
        }
        Some(LoopOutcome::Completed { .. }) | Some(LoopOutcome::Aborted { .. }) => {}
        None => {
            state
                .last_errors
                .insert(campaign_id, "send loop terminated unexpectedly".to_string());
        }
    }
}
