//! Conversational campaigns.
//!
//! Each contact walks the campaign graph on its own [`ContactSession`]. A
//! walk runs until it reaches something that needs the outside world to move
//! again: a sent message waiting for a reply, a condition waiting for text,
//! or a delay timer. Walks for one session never overlap; every entry point
//! takes the session lock before loading the row.

use crate::business_hours::{is_within_window, next_window_start, BusinessHoursConfig};
use crate::content::render_text;
use crate::db;
use crate::error::{DispatchError, REASON_CAMPAIGN_MISSING, REASON_NOT_REACHABLE};
use crate::events::{self, INTERACTIVE_STARTED, SESSION_FINISHED};
use crate::flow::evaluator::{evaluate_condition, select_edge, trigger_matches};
use crate::flow::{FlowGraph, IntegrationKind, NodeKind, TriggerConfig, MAX_DELAY_SECONDS};
use crate::gateway::with_timeout;
use crate::session::{normalize_phone, ContactSession, SessionLocks};
use crate::timers::DelayTimers;
use crate::types::{
    Contact, IncomingMessage, InboundOutcome, InteractiveCampaign, InteractiveStatus, SendPayload, SenderAccount,
    SessionStatus,
};
use crate::AppState;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const MAX_STEPS: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInteractiveCampaign {
    pub tenant_id: String,
    pub name: String,
    pub graph: FlowGraph,
    #[serde(default)]
    pub sender_account_id: Option<String>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub business_hours: Option<BusinessHoursConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub campaign_id: String,
    pub contacts: usize,
    pub started: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Set when publishing was pushed to the next business-hours window.
    pub deferred_until: Option<DateTime<Utc>>,
}

enum Walk {
    Waiting(String),
    Delayed { node_id: String, wake_at: DateTime<Utc> },
    Completed,
    Failed(String),
}

enum Seed {
    Started,
    Failed,
    Skipped,
}

struct EngineInner {
    state: AppState,
    timers: DelayTimers,
    locks: SessionLocks,
}

#[derive(Clone)]
pub struct FlowEngine {
    inner: Arc<EngineInner>,
}

fn message_payload(kind: &NodeKind, contact: &Contact) -> Result<SendPayload> {
    let render = |text: &str| render_text(text, contact);
    let render_opt = |text: &Option<String>| {
        text.as_deref()
            .map(render)
            .filter(|text| !text.trim().is_empty())
    };
    let payload = match kind {
        NodeKind::Text(cfg) => {
            let text = render(&cfg.text);
            if text.trim().is_empty() {
                return Err(anyhow!("text node has no text"));
            }
            SendPayload::Text { text }
        }
        NodeKind::Image(cfg) => SendPayload::Image {
            url: render(&cfg.url),
            caption: render_opt(&cfg.caption),
        },
        NodeKind::Video(cfg) => SendPayload::Video {
            url: render(&cfg.url),
            caption: render_opt(&cfg.caption),
        },
        NodeKind::Audio(cfg) => SendPayload::Audio { url: render(&cfg.url) },
        NodeKind::Document(cfg) => SendPayload::Document {
            url: render(&cfg.url),
            filename: render_opt(&cfg.filename),
            caption: render_opt(&cfg.caption),
        },
        other => return Err(anyhow!("{} node carries no message", other.tag())),
    };
    Ok(payload)
}

fn wake_time(now: DateTime<Utc>, seconds: u64) -> Option<DateTime<Utc>> {
    if seconds > MAX_DELAY_SECONDS {
        return None;
    }
    let seconds = i64::try_from(seconds).ok()?;
    now.checked_add_signed(chrono::TimeDelta::try_seconds(seconds)?)
}

fn is_terminal(outcome: &InboundOutcome) -> bool {
    matches!(outcome, InboundOutcome::Completed { .. } | InboundOutcome::Failed { .. })
}

fn ignored(reason: &str) -> InboundOutcome {
    InboundOutcome::Ignored {
        reason: reason.to_string(),
    }
}

/// Timer body for a delay node. Kept out of `async fn` so the engine's
/// futures do not become self-referential.
fn fire_delay(engine: FlowEngine, session_id: String, node_id: String, generation: u64) -> BoxFuture<'static, ()> {
    async move {
        engine.inner.timers.disarm(&session_id, generation);
        match engine.resume_after_delay(&session_id, &node_id).await {
            Ok(outcome) => debug!(session_id = %session_id, ?outcome, "delay continuation finished"),
            Err(err) => error!(session_id = %session_id, "delay continuation failed: {err:?}"),
        }
    }
    .boxed()
}

impl FlowEngine {
    pub fn new(state: AppState) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                state,
                timers: DelayTimers::default(),
                locks: SessionLocks::default(),
            }),
        }
    }

    pub fn state(&self) -> &AppState {
        &self.inner.state
    }

    pub fn timers(&self) -> &DelayTimers {
        &self.inner.timers
    }

    // -- campaign lifecycle -------------------------------------------------

    pub async fn create(&self, request: NewInteractiveCampaign) -> Result<InteractiveCampaign, DispatchError> {
        request
            .graph
            .validate()
            .map_err(|err| DispatchError::Configuration(err.to_string()))?;
        if let Some(hours) = request.business_hours.as_ref() {
            hours
                .validate()
                .map_err(|err| DispatchError::Configuration(err.to_string()))?;
        }

        let now = Utc::now();
        let campaign = InteractiveCampaign {
            id: Uuid::new_v4().to_string(),
            tenant_id: request.tenant_id,
            name: request.name,
            graph: request.graph,
            status: if request.scheduled_at.is_some() {
                InteractiveStatus::Scheduled
            } else {
                InteractiveStatus::Draft
            },
            sender_account_id: request.sender_account_id,
            scheduled_at: request.scheduled_at,
            created_at: now,
            updated_at: now,
        };
        let state = self.state();
        db::insert_interactive_campaign(&state.pool, state.db_kind, &campaign).await?;
        if let Some(hours) = request.business_hours.as_ref() {
            db::upsert_business_hours(&state.pool, state.db_kind, &campaign.id, hours).await?;
        }
        Ok(campaign)
    }

    async fn load(&self, id: &str) -> Result<InteractiveCampaign, DispatchError> {
        let state = self.state();
        db::get_interactive_campaign(&state.pool, state.db_kind, id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("interactive campaign {id}")))
    }

    async fn transition(
        &self,
        campaign: &InteractiveCampaign,
        to: InteractiveStatus,
    ) -> Result<InteractiveCampaign, DispatchError> {
        if !campaign.status.can_transition_to(to) {
            return Err(DispatchError::transition(campaign.status, to));
        }
        let state = self.state();
        let moved = db::transition_interactive(&state.pool, state.db_kind, &campaign.id, campaign.status, to).await?;
        let current = self.load(&campaign.id).await?;
        if !moved {
            return Err(DispatchError::transition(current.status, to));
        }
        Ok(current)
    }

    async fn live_accounts(
        &self,
        campaign: &InteractiveCampaign,
        trigger: &TriggerConfig,
    ) -> Result<Vec<SenderAccount>> {
        let state = self.state();
        let accounts = db::list_sender_accounts(&state.pool, state.db_kind, &campaign.tenant_id).await?;
        let matches = |account: &SenderAccount, wanted: &str| account.id == wanted || account.name == wanted;
        Ok(accounts
            .into_iter()
            .filter(|account| account.is_working())
            .filter(|account| match campaign.sender_account_id.as_deref() {
                Some(bound) => matches(account, bound),
                None => {
                    trigger.sender_accounts.is_empty()
                        || trigger.sender_accounts.iter().any(|wanted| matches(account, wanted))
                }
            })
            .collect())
    }

    /// Seeds one session per targeted contact and walks each of them up to
    /// its first wait point. A PAUSED campaign may be published again; contacts
    /// that already have a session are skipped.
    pub async fn publish(&self, id: &str) -> Result<DispatchReport, DispatchError> {
        let campaign = self.load(id).await?;
        if !matches!(
            campaign.status,
            InteractiveStatus::Draft | InteractiveStatus::Scheduled | InteractiveStatus::Paused
        ) {
            return Err(DispatchError::transition(campaign.status, InteractiveStatus::Started));
        }
        match self.publish_checked(&campaign).await {
            Err(DispatchError::Configuration(reason)) => {
                let state = self.state();
                if campaign.status != InteractiveStatus::Paused {
                    db::transition_interactive(
                        &state.pool,
                        state.db_kind,
                        &campaign.id,
                        campaign.status,
                        InteractiveStatus::Paused,
                    )
                    .await?;
                }
                warn!(campaign_id = %campaign.id, "publish refused: {reason}");
                Err(DispatchError::Configuration(reason))
            }
            other => other,
        }
    }

    async fn publish_checked(&self, campaign: &InteractiveCampaign) -> Result<DispatchReport, DispatchError> {
        campaign
            .graph
            .validate()
            .map_err(|err| DispatchError::Configuration(err.to_string()))?;
        let trigger = campaign
            .graph
            .trigger()
            .ok_or_else(|| DispatchError::Configuration("flow has no trigger node".to_string()))?;
        let NodeKind::Trigger(trigger_cfg) = &trigger.kind else {
            return Err(DispatchError::Configuration("flow has no trigger node".to_string()));
        };

        let state = self.state();
        let mut report = DispatchReport {
            campaign_id: campaign.id.clone(),
            ..DispatchReport::default()
        };

        if campaign.status != InteractiveStatus::Paused {
            if let Some(hours) = db::get_business_hours(&state.pool, state.db_kind, &campaign.id).await? {
                let now = Utc::now();
                if !is_within_window(&hours, now) {
                    let until = next_window_start(&hours, now).ok_or_else(|| {
                        DispatchError::Configuration("business hours never open".to_string())
                    })?;
                    db::schedule_interactive(&state.pool, state.db_kind, &campaign.id, until).await?;
                    info!(campaign_id = %campaign.id, %until, "publish deferred to next business window");
                    report.deferred_until = Some(until);
                    return Ok(report);
                }
            }
        }

        let accounts = self.live_accounts(campaign, trigger_cfg).await?;
        if accounts.is_empty() {
            return Err(DispatchError::Configuration(
                "no live sender account for this campaign".to_string(),
            ));
        }
        let contacts = db::list_contacts_in_categories(
            &state.pool,
            state.db_kind,
            &campaign.tenant_id,
            &trigger_cfg.categories,
        )
        .await?;

        let started = self.transition(campaign, InteractiveStatus::Started).await?;
        events::emit(
            &state.events,
            INTERACTIVE_STARTED,
            json!({"campaign_id": campaign.id, "contacts": contacts.len()}),
        );

        report.contacts = contacts.len();
        for (index, contact) in contacts.iter().enumerate() {
            let account = &accounts[index % accounts.len()];
            match self.seed_contact(&started, &trigger.id, contact, account).await {
                Ok(Seed::Started) => report.started += 1,
                Ok(Seed::Failed) => report.failed += 1,
                Ok(Seed::Skipped) => report.skipped += 1,
                Err(err) => {
                    error!(campaign_id = %campaign.id, contact_id = %contact.id, "seeding failed: {err}");
                    report.failed += 1;
                }
            }
        }
        info!(
            campaign_id = %campaign.id,
            started = report.started,
            failed = report.failed,
            skipped = report.skipped,
            "interactive campaign published"
        );
        Ok(report)
    }

    async fn seed_contact(
        &self,
        campaign: &InteractiveCampaign,
        trigger_id: &str,
        contact: &Contact,
        account: &SenderAccount,
    ) -> Result<Seed, DispatchError> {
        let state = self.state();
        let fresh = ContactSession::start(&campaign.id, contact, trigger_id, Some(&account.name));
        let (mut session, created) = db::upsert_contact_session(&state.pool, state.db_kind, &fresh).await?;
        if !created {
            return Ok(Seed::Skipped);
        }

        let guard = self.inner.locks.acquire(&session.id).await;
        let check = with_timeout(
            state.call_timeout(),
            "contact check",
            state.gateway.check_contact_exists(&account.name, &session.phone),
        )
        .await;
        let outcome = match check {
            Ok(check) if check.exists => {
                session.chat_id = check.chat_id;
                let walk = self
                    .walk(campaign, &mut session, contact, trigger_id.to_string(), None)
                    .await;
                self.settle(&mut session, walk).await?
            }
            Ok(_) => self.abort(&mut session, trigger_id, REASON_NOT_REACHABLE).await?,
            Err(err) => self.abort(&mut session, trigger_id, &err.to_string()).await?,
        };
        drop(guard);
        self.release_if_done(&session.id, &outcome);

        Ok(match outcome {
            InboundOutcome::Failed { .. } => Seed::Failed,
            _ => Seed::Started,
        })
    }

    /// Publishes SCHEDULED campaigns whose start time has come.
    pub async fn publish_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let state = self.state();
        let scheduled =
            db::list_interactive_by_status(&state.pool, state.db_kind, InteractiveStatus::Scheduled).await?;
        let mut published = 0;
        for campaign in scheduled
            .iter()
            .filter(|c| c.scheduled_at.map(|at| at <= now).unwrap_or(true))
        {
            match self.publish(&campaign.id).await {
                Ok(report) if report.deferred_until.is_none() => published += 1,
                Ok(_) => {}
                Err(err) => error!(campaign_id = %campaign.id, "scheduled publish failed: {err}"),
            }
        }
        Ok(published)
    }

    pub async fn pause(&self, id: &str) -> Result<InteractiveCampaign, DispatchError> {
        let campaign = self.load(id).await?;
        let paused = self.transition(&campaign, InteractiveStatus::Paused).await?;
        self.cancel_campaign_timers(id).await?;
        Ok(paused)
    }

    pub async fn resume(&self, id: &str) -> Result<InteractiveCampaign, DispatchError> {
        let campaign = self.load(id).await?;
        let resumed = self.transition(&campaign, InteractiveStatus::Started).await?;
        let armed = self.rearm_delays(Some(id)).await?;
        debug!(campaign_id = id, armed, "delay timers re-armed");
        Ok(resumed)
    }

    pub async fn complete(&self, id: &str) -> Result<InteractiveCampaign, DispatchError> {
        let campaign = self.load(id).await?;
        let completed = self.transition(&campaign, InteractiveStatus::Completed).await?;
        self.cancel_campaign_timers(id).await?;
        Ok(completed)
    }

    async fn cancel_campaign_timers(&self, campaign_id: &str) -> Result<()> {
        let state = self.state();
        let waiting = db::list_sessions_awaiting_wake(&state.pool, state.db_kind, Some(campaign_id)).await?;
        for session in waiting {
            self.inner.timers.cancel(&session.id);
        }
        Ok(())
    }

    /// Arms timers for sessions parked on a delay node, e.g. after a restart.
    /// Overdue sessions fire right away.
    pub async fn rearm_delays(&self, campaign_id: Option<&str>) -> Result<usize> {
        let state = self.state();
        let waiting = db::list_sessions_awaiting_wake(&state.pool, state.db_kind, campaign_id).await?;
        let mut running: HashMap<String, bool> = HashMap::new();
        let mut armed = 0;
        for session in waiting {
            let started = match running.get(&session.campaign_id) {
                Some(started) => *started,
                None => {
                    let started = db::get_interactive_campaign(&state.pool, state.db_kind, &session.campaign_id)
                        .await?
                        .map(|c| c.status == InteractiveStatus::Started)
                        .unwrap_or(false);
                    running.insert(session.campaign_id.clone(), started);
                    started
                }
            };
            if !started {
                continue;
            }
            if let (Some(node_id), Some(wake_at)) = (session.current_node_id.as_deref(), session.wake_at) {
                self.arm_delay(&session.id, node_id, wake_at);
                armed += 1;
            }
        }
        Ok(armed)
    }

    /// Marks sessions idle for longer than the configured expiry as EXPIRED.
    /// Each candidate is re-checked under its session lock, so a walk in
    /// flight either finishes first or sees the EXPIRED row.
    pub async fn expire_idle_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        let state = self.state();
        let expiry = chrono::Duration::days(state.config.sessions.expiry_days.max(1));
        let cutoff = now - expiry;
        let candidates = db::list_idle_sessions(&state.pool, state.db_kind, cutoff).await?;

        let mut expired = 0;
        for id in candidates {
            let guard = self.inner.locks.acquire(&id).await;
            let idle = db::get_contact_session(&state.pool, state.db_kind, &id)
                .await?
                .map(|session| session.is_idle(now, expiry))
                .unwrap_or(false);
            let done = idle && db::expire_session(&state.pool, state.db_kind, &id, cutoff).await?;
            drop(guard);
            self.inner.locks.forget(&id);
            if done {
                self.inner.timers.cancel(&id);
                expired += 1;
            }
        }
        if expired > 0 {
            info!(count = expired, "expired idle sessions");
        }
        Ok(expired)
    }

    pub async fn run_publisher(self) {
        let mut interval = tokio::time::interval(self.state().config.scheduler.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(err) = self.publish_due(Utc::now()).await {
                error!("scheduled publish sweep failed: {err:?}");
            }
        }
    }

    pub async fn run_expiry_sweep(self) {
        let every = Duration::from_secs(self.state().config.sessions.sweep_interval_seconds.max(1));
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(err) = self.expire_idle_sessions(Utc::now()).await {
                error!("session expiry sweep failed: {err:?}");
            }
        }
    }

    // -- inbound ------------------------------------------------------------

    /// Single entry point for replies coming from the webhook layer.
    pub async fn process_incoming_message(&self, message: IncomingMessage) -> InboundOutcome {
        match self.handle_incoming(&message).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(phone = %message.contact_phone, "inbound processing failed: {err}");
                InboundOutcome::Failed {
                    session_id: None,
                    error: err.to_string(),
                }
            }
        }
    }

    async fn handle_incoming(&self, message: &IncomingMessage) -> Result<InboundOutcome, DispatchError> {
        let phone = normalize_phone(&message.contact_phone);
        if phone.is_empty() {
            return Ok(ignored("message has no contact phone"));
        }
        if let Some(session_id) = self.locate_session(&phone, message.session_hint.as_deref()).await? {
            return self.advance_on_reply(&session_id, &message.message_content).await;
        }
        self.try_trigger(&phone, &message.message_content).await
    }

    /// Most recent ACTIVE session of a running campaign for this phone, the
    /// hinted one first.
    async fn locate_session(&self, phone: &str, hint: Option<&str>) -> Result<Option<String>> {
        let state = self.state();
        let sessions = db::find_active_sessions_by_phone(&state.pool, state.db_kind, phone).await?;
        if let Some(hint) = hint {
            if let Some(session) = sessions.iter().find(|s| s.id == hint || s.campaign_id == hint) {
                return Ok(Some(session.id.clone()));
            }
        }
        for session in &sessions {
            let campaign = db::get_interactive_campaign(&state.pool, state.db_kind, &session.campaign_id).await?;
            if campaign.map(|c| c.status == InteractiveStatus::Started).unwrap_or(false) {
                return Ok(Some(session.id.clone()));
            }
        }
        Ok(None)
    }

    async fn contact_for(&self, session: &ContactSession) -> Result<Contact> {
        let state = self.state();
        let stored = db::get_contact(&state.pool, state.db_kind, &session.contact_id).await?;
        Ok(stored.unwrap_or_else(|| Contact {
            id: session.contact_id.clone(),
            tenant_id: session.tenant_id.clone(),
            phone: session.phone.clone(),
            name: None,
            email: None,
            categories: Vec::new(),
            fields: Map::new(),
        }))
    }

    async fn advance_on_reply(&self, session_id: &str, text: &str) -> Result<InboundOutcome, DispatchError> {
        let guard = self.inner.locks.acquire(session_id).await;
        let outcome = self.advance_locked(session_id, text).await?;
        drop(guard);
        self.release_if_done(session_id, &outcome);
        Ok(outcome)
    }

    async fn advance_locked(&self, session_id: &str, text: &str) -> Result<InboundOutcome, DispatchError> {
        let state = self.state();
        let Some(mut session) = db::get_contact_session(&state.pool, state.db_kind, session_id).await? else {
            return Ok(ignored("session not found"));
        };
        if !session.is_active() {
            return Ok(ignored("session is no longer active"));
        }
        let Some(campaign) = db::get_interactive_campaign(&state.pool, state.db_kind, &session.campaign_id).await?
        else {
            let node_id = session.current_node_id.clone().unwrap_or_default();
            return self.abort(&mut session, &node_id, REASON_CAMPAIGN_MISSING).await;
        };
        if campaign.status != InteractiveStatus::Started {
            return Ok(ignored("campaign is not running"));
        }

        session.record_reply(text, Utc::now());
        let current_id = session.current_node_id.clone().unwrap_or_default();
        let start = match campaign.graph.node(&current_id).map(|node| &node.kind) {
            None => {
                let reason = format!("node '{current_id}' is not in the graph");
                return self.abort(&mut session, &current_id, &reason).await;
            }
            Some(NodeKind::Delay(_)) => {
                // the timer moves the session on; keep the text for what follows
                session.touch();
                self.persist(&session).await?;
                return Ok(InboundOutcome::Advanced {
                    session_id: session.id.clone(),
                    next_node_id: current_id,
                });
            }
            Some(NodeKind::Condition(_)) | Some(NodeKind::Trigger(_)) => current_id.clone(),
            Some(_) => match campaign.graph.first_target(&current_id) {
                Some(next) => next.to_string(),
                None => return self.settle(&mut session, Walk::Completed).await,
            },
        };

        let contact = self.contact_for(&session).await?;
        let walk = self.walk(&campaign, &mut session, &contact, start, Some(text)).await;
        self.settle(&mut session, walk).await
    }

    /// Starts a session for a known contact whose message matches the
    /// trigger of a running campaign they are not yet part of.
    async fn try_trigger(&self, phone: &str, text: &str) -> Result<InboundOutcome, DispatchError> {
        let state = self.state();
        let contacts = db::find_contacts_by_phone(&state.pool, state.db_kind, phone).await?;
        if contacts.is_empty() {
            return Ok(ignored("unknown contact"));
        }
        let running =
            db::list_interactive_by_status(&state.pool, state.db_kind, InteractiveStatus::Started).await?;

        for contact in &contacts {
            for campaign in running.iter().filter(|c| c.tenant_id == contact.tenant_id) {
                let Some(trigger) = campaign.graph.trigger() else {
                    continue;
                };
                let NodeKind::Trigger(cfg) = &trigger.kind else {
                    continue;
                };
                let in_category = cfg.categories.is_empty()
                    || contact.categories.iter().any(|c| cfg.categories.contains(c));
                if !in_category || !trigger_matches(cfg, text) {
                    continue;
                }
                let existing =
                    db::find_session_for_contact(&state.pool, state.db_kind, &campaign.id, &contact.id).await?;
                if existing.is_some() {
                    continue;
                }
                let accounts = self.live_accounts(campaign, cfg).await?;
                let Some(account) = accounts.first() else {
                    warn!(campaign_id = %campaign.id, "trigger matched but no live sender account");
                    continue;
                };

                let fresh = ContactSession::start(&campaign.id, contact, &trigger.id, Some(&account.name));
                let (mut session, created) = db::upsert_contact_session(&state.pool, state.db_kind, &fresh).await?;
                if !created {
                    continue;
                }
                let guard = self.inner.locks.acquire(&session.id).await;
                session.record_reply(text, Utc::now());
                let walk = self
                    .walk(campaign, &mut session, contact, trigger.id.clone(), Some(text))
                    .await;
                let outcome = self.settle(&mut session, walk).await?;
                drop(guard);
                self.release_if_done(&session.id, &outcome);
                info!(campaign_id = %campaign.id, session_id = %session.id, "session started by trigger");
                return Ok(outcome);
            }
        }
        Ok(ignored("no active session or matching trigger"))
    }

    async fn resume_after_delay(&self, session_id: &str, node_id: &str) -> Result<InboundOutcome, DispatchError> {
        let guard = self.inner.locks.acquire(session_id).await;
        let outcome = self.resume_locked(session_id, node_id).await?;
        drop(guard);
        self.release_if_done(session_id, &outcome);
        Ok(outcome)
    }

    async fn resume_locked(&self, session_id: &str, node_id: &str) -> Result<InboundOutcome, DispatchError> {
        let state = self.state();
        let Some(mut session) = db::get_contact_session(&state.pool, state.db_kind, session_id).await? else {
            return Ok(ignored("session not found"));
        };
        if !session.is_active() || session.current_node_id.as_deref() != Some(node_id) {
            return Ok(ignored("session moved on"));
        }
        let Some(campaign) = db::get_interactive_campaign(&state.pool, state.db_kind, &session.campaign_id).await?
        else {
            return self.abort(&mut session, node_id, REASON_CAMPAIGN_MISSING).await;
        };
        if campaign.status != InteractiveStatus::Started {
            // wake_at stays set; resume() re-arms it
            return Ok(ignored("campaign is not running"));
        }
        session.wake_at = None;
        let Some(next) = campaign.graph.first_target(node_id).map(str::to_string) else {
            return self.settle(&mut session, Walk::Completed).await;
        };

        // a reply that arrived while waiting feeds the next condition
        let delay_started = session
            .visited
            .iter()
            .rev()
            .find(|visit| visit.node_id == node_id)
            .map(|visit| visit.visited_at);
        let pending_reply = match (session.last_message_at, delay_started) {
            (Some(replied), Some(started)) if replied > started => session.last_message.clone(),
            _ => None,
        };

        let contact = self.contact_for(&session).await?;
        let walk = self
            .walk(&campaign, &mut session, &contact, next, pending_reply.as_deref())
            .await;
        self.settle(&mut session, walk).await
    }

    // -- walking --------------------------------------------------------------

    async fn walk(
        &self,
        campaign: &InteractiveCampaign,
        session: &mut ContactSession,
        contact: &Contact,
        start: String,
        inbound: Option<&str>,
    ) -> Walk {
        let graph = &campaign.graph;
        let mut inbound = inbound;
        let mut cursor = start;

        for _ in 0..MAX_STEPS {
            let Some(node) = graph.node(&cursor) else {
                let reason = format!("node '{cursor}' is not in the graph");
                session.record_visit(&cursor, false, Some(reason.clone()));
                return Walk::Failed(reason);
            };
            session.current_node_id = Some(node.id.clone());

            let next = match &node.kind {
                NodeKind::Trigger(_) => {
                    session.record_visit(&node.id, false, None);
                    graph.first_target(&node.id)
                }
                NodeKind::Text(_)
                | NodeKind::Image(_)
                | NodeKind::Video(_)
                | NodeKind::Audio(_)
                | NodeKind::Document(_) => {
                    let rendered = session.render_contact(contact);
                    let sent = match message_payload(&node.kind, &rendered) {
                        Ok(payload) => self.send(session, &payload).await,
                        Err(err) => Err(err),
                    };
                    if let Err(err) = sent {
                        let reason = err.to_string();
                        session.record_visit(&node.id, false, Some(reason.clone()));
                        return Walk::Failed(reason);
                    }
                    session.record_visit(&node.id, true, None);
                    inbound = None;
                    match graph.first_target(&node.id) {
                        None => return Walk::Completed,
                        Some(next) if graph.node(next).map(|n| n.kind.is_auto_advance()).unwrap_or(false) => {
                            Some(next)
                        }
                        Some(_) => return Walk::Waiting(node.id.clone()),
                    }
                }
                NodeKind::Condition(cfg) => {
                    let Some(text) = inbound else {
                        return Walk::Waiting(node.id.clone());
                    };
                    let outcome = evaluate_condition(cfg, text, &session.variables);
                    session.merge_variables(outcome.variables(&node.id));
                    session.record_visit(&node.id, false, None);
                    let edges = graph.outgoing(&node.id);
                    select_edge(&edges, &outcome).map(|edge| edge.target.as_str())
                }
                NodeKind::Delay(cfg) => {
                    if graph.first_target(&node.id).is_none() {
                        session.record_visit(&node.id, false, None);
                        return Walk::Completed;
                    }
                    let Some(wake_at) = wake_time(Utc::now(), cfg.seconds) else {
                        let reason = format!("delay of {}s is out of range", cfg.seconds);
                        session.record_visit(&node.id, false, Some(reason.clone()));
                        return Walk::Failed(reason);
                    };
                    session.record_visit(&node.id, false, None);
                    return Walk::Delayed {
                        node_id: node.id.clone(),
                        wake_at,
                    };
                }
                NodeKind::Integration(kind, cfg) => {
                    self.run_integration(session, &node.id, *kind, &cfg.action, &cfg.payload)
                        .await;
                    graph.first_target(&node.id)
                }
                NodeKind::Action(cfg) => {
                    match cfg.integration {
                        Some(kind) => {
                            self.run_integration(session, &node.id, kind, &cfg.action, &cfg.payload)
                                .await
                        }
                        None => {
                            debug!(node_id = %node.id, action = %cfg.action, "legacy action passed through");
                            session.record_visit(&node.id, false, None);
                        }
                    }
                    graph.first_target(&node.id)
                }
                NodeKind::Stop(_) => {
                    session.record_visit(&node.id, false, None);
                    return Walk::Completed;
                }
            };

            match next {
                Some(next) => cursor = next.to_string(),
                None => return Walk::Completed,
            }
        }

        let reason = format!("flow did not settle within {MAX_STEPS} steps");
        session.record_visit(&cursor, false, Some(reason.clone()));
        Walk::Failed(reason)
    }

    async fn send(&self, session: &ContactSession, payload: &SendPayload) -> Result<()> {
        let state = self.state();
        let account = session
            .sender_account
            .as_deref()
            .ok_or_else(|| anyhow!("session has no sender account"))?;
        with_timeout(
            state.call_timeout(),
            "send",
            state
                .gateway
                .send_message(account, &session.phone, payload, session.chat_id.as_deref()),
        )
        .await?;
        Ok(())
    }

    /// Integration results are recorded, never fatal to the walk.
    async fn run_integration(
        &self,
        session: &mut ContactSession,
        node_id: &str,
        kind: IntegrationKind,
        action: &str,
        payload: &Value,
    ) {
        let state = self.state();
        let result = match state.integrations.get(kind) {
            None => Err(anyhow!("{} integration is not configured", kind.as_str())),
            Some(gateway) => with_timeout(
                state.call_timeout(),
                kind.as_str(),
                gateway.execute(&session.tenant_id, &session.phone, action, payload),
            )
            .await
            .and_then(|accepted| {
                if accepted {
                    Ok(())
                } else {
                    Err(anyhow!("{} refused action '{}'", kind.as_str(), action))
                }
            }),
        };
        match result {
            Ok(()) => session.record_visit(node_id, true, None),
            Err(err) => {
                warn!(session_id = %session.id, node_id, "integration failed: {err}");
                session.record_visit(node_id, false, Some(err.to_string()));
            }
        }
    }

    // -- persistence ------------------------------------------------------------

    async fn settle(&self, session: &mut ContactSession, walk: Walk) -> Result<InboundOutcome, DispatchError> {
        let state = self.state();
        session.touch();
        let outcome = match walk {
            Walk::Waiting(node_id) => {
                session.wake_at = None;
                self.persist(session).await?;
                InboundOutcome::Advanced {
                    session_id: session.id.clone(),
                    next_node_id: node_id,
                }
            }
            Walk::Delayed { node_id, wake_at } => {
                session.wake_at = Some(wake_at);
                self.persist(session).await?;
                self.arm_delay(&session.id, &node_id, wake_at);
                InboundOutcome::Advanced {
                    session_id: session.id.clone(),
                    next_node_id: node_id,
                }
            }
            Walk::Completed => {
                session.finish(SessionStatus::Completed);
                self.persist(session).await?;
                InboundOutcome::Completed {
                    session_id: session.id.clone(),
                }
            }
            Walk::Failed(error) => {
                session.finish(SessionStatus::Failed);
                self.persist(session).await?;
                InboundOutcome::Failed {
                    session_id: Some(session.id.clone()),
                    error,
                }
            }
        };
        if is_terminal(&outcome) {
            self.inner.timers.cancel(&session.id);
            events::emit(
                &state.events,
                SESSION_FINISHED,
                json!({"session_id": session.id, "campaign_id": session.campaign_id, "status": session.status}),
            );
        }
        Ok(outcome)
    }

    async fn persist(&self, session: &ContactSession) -> Result<()> {
        let state = self.state();
        if !db::save_contact_session(&state.pool, state.db_kind, session).await? {
            warn!(session_id = %session.id, "session left ACTIVE while being handled; update dropped");
        }
        Ok(())
    }

    async fn abort(
        &self,
        session: &mut ContactSession,
        node_id: &str,
        reason: &str,
    ) -> Result<InboundOutcome, DispatchError> {
        session.record_visit(node_id, false, Some(reason.to_string()));
        self.settle(session, Walk::Failed(reason.to_string())).await
    }

    fn release_if_done(&self, session_id: &str, outcome: &InboundOutcome) {
        if is_terminal(outcome) {
            self.inner.locks.forget(session_id);
        }
    }

    fn arm_delay(&self, session_id: &str, node_id: &str, wake_at: DateTime<Utc>) {
        let delay = (wake_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let generation = self.inner.timers.generation();
        let task = fire_delay(self.clone(), session_id.to_string(), node_id.to_string(), generation);
        self.inner.timers.arm(session_id, generation, delay, task);
    }
}
