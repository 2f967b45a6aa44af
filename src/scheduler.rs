//! Throttled bulk dispatch.
//!
//! Every tick promotes due campaigns, advances each RUNNING campaign by at
//! most one message, and closes out PAUSED campaigns whose queue drained.
//! Campaigns advance concurrently with each other; within a campaign the
//! in-flight set keeps sends strictly sequential.

use crate::business_hours::{is_within_window, next_window_start};
use crate::campaigns::MAX_SEND_DELAY_SECONDS;
use crate::content::{build_payload, resolve_content, sequence_items, wait_duration, SequenceItem};
use crate::db::{self, Counter};
use crate::error::{REASON_CAMPAIGN_MISSING, REASON_DUPLICATE, REASON_NOT_REACHABLE};
use crate::events::{self, CAMPAIGN_COMPLETED, CAMPAIGN_PAUSED, CAMPAIGN_STARTED, MESSAGE_FAILED, MESSAGE_SENT};
use crate::gateway::with_timeout;
use crate::types::{Campaign, CampaignMessage, CampaignStatus, Contact, MessageStatus, MessageType, SenderAccount, SendPayload};
use crate::AppState;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Per-campaign rotation over the live sender accounts.
///
/// Cursors live in memory only; after a restart rotation starts again from
/// the first account.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursors: Mutex<HashMap<String, usize>>,
}

impl RoundRobin {
    /// Accounts are ordered by name so the rotation is stable across ticks
    /// even when the live set is read in a different order.
    pub fn next(&self, campaign_id: &str, live: &[SenderAccount]) -> Option<SenderAccount> {
        if live.is_empty() {
            return None;
        }
        let mut sorted = live.to_vec();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));

        let mut cursors = self.cursors.lock().unwrap_or_else(|e| e.into_inner());
        let cursor = cursors.entry(campaign_id.to_string()).or_insert(0);
        let pick = sorted[*cursor % sorted.len()].clone();
        *cursor = cursor.wrapping_add(1);
        Some(pick)
    }

    pub fn forget(&self, campaign_id: &str) {
        self.cursors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(campaign_id);
    }
}

/// Draw a pre-send pause in `[min, max]` seconds, capped at
/// [`MAX_SEND_DELAY_SECONDS`].
pub fn random_delay(min_secs: u64, max_secs: u64) -> Duration {
    let (low, high) = if min_secs <= max_secs {
        (min_secs, max_secs)
    } else {
        (max_secs, min_secs)
    };
    let (low, high) = (low.min(MAX_SEND_DELAY_SECONDS), high.min(MAX_SEND_DELAY_SECONDS));
    if high == 0 {
        return Duration::ZERO;
    }
    let millis = rand::thread_rng().gen_range(low.saturating_mul(1000)..=high.saturating_mul(1000));
    Duration::from_millis(millis)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MessageOutcome {
    Sent { message_id: String },
    Failed { message_id: String, reason: String },
    /// Outside business hours; retried on a later tick.
    Deferred { until: Option<DateTime<Utc>> },
    /// Campaign stopped running while the message was in flight.
    Released { message_id: String },
    /// No live sender account; the campaign was paused.
    NoSenders,
    /// Another worker claimed the message first.
    Contended,
    NotRunning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Advance {
    Busy,
    Idle,
    Completed,
    Processed(MessageOutcome),
}

#[derive(Debug, Default, Serialize)]
pub struct TickReport {
    pub promoted: usize,
    pub completed: usize,
    pub reaped: usize,
    pub outcomes: Vec<(String, MessageOutcome)>,
}

pub struct Scheduler {
    state: AppState,
    cursors: RoundRobin,
    in_flight: Mutex<HashSet<String>>,
}

struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    campaign_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.campaign_id);
    }
}

impl Scheduler {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            cursors: RoundRobin::default(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn cursors(&self) -> &RoundRobin {
        &self.cursors
    }

    fn enter(&self, campaign_id: &str) -> Option<InFlight<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(campaign_id.to_string()) {
            return None;
        }
        Some(InFlight {
            set: &self.in_flight,
            campaign_id: campaign_id.to_string(),
        })
    }

    /// Runs forever: one tick per interval, ticks may overlap.
    pub async fn run(self: Arc<Self>) {
        match self.recover().await {
            Ok(0) => {}
            Ok(count) => info!(count, "released messages left in PROCESSING"),
            Err(err) => error!("scheduler recovery failed: {err:?}"),
        }

        let mut interval = tokio::time::interval(self.state.config.scheduler.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let scheduler = self.clone();
            tokio::spawn(async move {
                if let Err(err) = scheduler.tick().await {
                    error!("scheduler tick failed: {err:?}");
                }
            });
        }
    }

    pub async fn recover(&self) -> Result<u64> {
        db::release_stale_processing(&self.state.pool, self.state.db_kind).await
    }

    pub async fn tick(&self) -> Result<TickReport> {
        let now = Utc::now();
        let mut report = TickReport {
            promoted: self.promote_due(now).await?,
            ..TickReport::default()
        };

        let running =
            db::list_campaigns_by_status(&self.state.pool, self.state.db_kind, CampaignStatus::Running).await?;
        let results = join_all(running.iter().map(|campaign| self.advance_campaign(&campaign.id))).await;
        for (campaign, result) in running.iter().zip(results) {
            match result {
                Ok(Advance::Completed) => report.completed += 1,
                Ok(Advance::Processed(outcome)) => report.outcomes.push((campaign.id.clone(), outcome)),
                Ok(Advance::Idle) | Ok(Advance::Busy) => {}
                Err(err) => error!(campaign_id = %campaign.id, "campaign advance failed: {err:?}"),
            }
        }

        report.reaped = self.reap_paused().await?;
        Ok(report)
    }

    /// PENDING campaigns that are due move to RUNNING.
    pub async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let pending =
            db::list_campaigns_by_status(&self.state.pool, self.state.db_kind, CampaignStatus::Pending).await?;
        let mut promoted = 0;
        for campaign in pending.iter().filter(|c| c.is_due(now)) {
            let moved = db::transition_campaign(
                &self.state.pool,
                self.state.db_kind,
                &campaign.id,
                CampaignStatus::Pending,
                CampaignStatus::Running,
            )
            .await?;
            if moved {
                info!(campaign_id = %campaign.id, "campaign started");
                events::emit(&self.state.events, CAMPAIGN_STARTED, json!({"campaign_id": campaign.id}));
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    /// PAUSED campaigns with nothing left to send are completed.
    pub async fn reap_paused(&self) -> Result<usize> {
        let paused =
            db::list_campaigns_by_status(&self.state.pool, self.state.db_kind, CampaignStatus::Paused).await?;
        let mut reaped = 0;
        for campaign in paused {
            let open = db::count_messages_by_status(
                &self.state.pool,
                self.state.db_kind,
                &campaign.id,
                &[MessageStatus::Pending, MessageStatus::Processing],
            )
            .await?;
            if open == 0 && self.complete(&campaign.id, CampaignStatus::Paused).await? {
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    async fn complete(&self, campaign_id: &str, from: CampaignStatus) -> Result<bool> {
        let done = db::transition_campaign(
            &self.state.pool,
            self.state.db_kind,
            campaign_id,
            from,
            CampaignStatus::Completed,
        )
        .await?;
        if done {
            self.cursors.forget(campaign_id);
            info!(campaign_id, "campaign completed");
            events::emit(&self.state.events, CAMPAIGN_COMPLETED, json!({"campaign_id": campaign_id}));
        }
        Ok(done)
    }

    /// One step for one RUNNING campaign.
    pub async fn advance_campaign(&self, campaign_id: &str) -> Result<Advance> {
        let Some(_guard) = self.enter(campaign_id) else {
            debug!(campaign_id, "campaign still busy from a previous tick");
            return Ok(Advance::Busy);
        };

        let next = db::next_pending_message(&self.state.pool, self.state.db_kind, campaign_id).await?;
        match next {
            Some(message) => Ok(Advance::Processed(self.process_message(campaign_id, message).await?)),
            None => {
                let processing = db::count_messages_by_status(
                    &self.state.pool,
                    self.state.db_kind,
                    campaign_id,
                    &[MessageStatus::Processing],
                )
                .await?;
                if processing == 0 && self.complete(campaign_id, CampaignStatus::Running).await? {
                    return Ok(Advance::Completed);
                }
                Ok(Advance::Idle)
            }
        }
    }

    /// Full send path for one queued message.
    pub async fn process_message(&self, campaign_id: &str, message: CampaignMessage) -> Result<MessageOutcome> {
        let Some(campaign) = db::get_campaign(&self.state.pool, self.state.db_kind, campaign_id).await? else {
            return self.fail(campaign_id, &message.id, REASON_CAMPAIGN_MISSING, None, None).await;
        };
        if campaign.status != CampaignStatus::Running {
            return Ok(MessageOutcome::NotRunning);
        }

        if let Some(hours) = db::get_business_hours(&self.state.pool, self.state.db_kind, &campaign.id).await? {
            let now = Utc::now();
            if !is_within_window(&hours, now) {
                let until = next_window_start(&hours, now);
                debug!(campaign_id, ?until, "outside business hours");
                return Ok(MessageOutcome::Deferred { until });
            }
        }

        if !db::claim_campaign_message(&self.state.pool, self.state.db_kind, &message.id).await? {
            return Ok(MessageOutcome::Contended);
        }

        match self.deliver(&campaign, &message).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                error!(campaign_id, message_id = %message.id, "delivery aborted: {err:?}");
                self.fail(campaign_id, &message.id, &err.to_string(), None, None).await
            }
        }
    }

    async fn live_accounts(&self, campaign: &Campaign) -> Result<Vec<SenderAccount>> {
        let accounts = db::list_sender_accounts(&self.state.pool, self.state.db_kind, &campaign.tenant_id).await?;
        Ok(accounts
            .into_iter()
            .filter(|account| account.is_working())
            .filter(|account| {
                campaign.sender_accounts.is_empty()
                    || campaign
                        .sender_accounts
                        .iter()
                        .any(|name| name == &account.name || name == &account.id)
            })
            .collect())
    }

    async fn load_contact(&self, message: &CampaignMessage, tenant_id: &str) -> Result<Contact> {
        let stored = db::get_contact(&self.state.pool, self.state.db_kind, &message.contact_id).await?;
        Ok(stored.unwrap_or_else(|| Contact {
            id: message.contact_id.clone(),
            tenant_id: tenant_id.to_string(),
            phone: message.phone.clone(),
            name: message.contact_name.clone(),
            email: None,
            categories: Vec::new(),
            fields: Map::new(),
        }))
    }

    /// Runs with the message already claimed.
    async fn deliver(&self, campaign: &Campaign, message: &CampaignMessage) -> Result<MessageOutcome> {
        let live = self.live_accounts(campaign).await?;
        let Some(account) = self.cursors.next(&campaign.id, &live) else {
            warn!(campaign_id = %campaign.id, "no live sender account, pausing campaign");
            db::release_campaign_message(&self.state.pool, self.state.db_kind, &message.id).await?;
            let paused = db::transition_campaign(
                &self.state.pool,
                self.state.db_kind,
                &campaign.id,
                CampaignStatus::Running,
                CampaignStatus::Paused,
            )
            .await?;
            if paused {
                events::emit(
                    &self.state.events,
                    CAMPAIGN_PAUSED,
                    json!({"campaign_id": campaign.id, "reason": "no live sender account"}),
                );
            }
            return Ok(MessageOutcome::NoSenders);
        };

        let delay = random_delay(campaign.min_delay, campaign.max_delay);
        if !delay.is_zero() {
            sleep(delay).await;
        }

        let Some(current) = db::get_campaign(&self.state.pool, self.state.db_kind, &campaign.id).await? else {
            return self
                .fail(&campaign.id, &message.id, REASON_CAMPAIGN_MISSING, Some(&account.name), None)
                .await;
        };
        if current.status != CampaignStatus::Running {
            db::release_campaign_message(&self.state.pool, self.state.db_kind, &message.id).await?;
            return Ok(MessageOutcome::Released {
                message_id: message.id.clone(),
            });
        }

        let contact = self.load_contact(message, &current.tenant_id).await?;
        let variation = resolve_content(&current.content, &contact);

        let duplicate = db::contact_already_sent(
            &self.state.pool,
            self.state.db_kind,
            &current.id,
            &message.contact_id,
            &message.id,
        )
        .await?;
        if duplicate {
            return self
                .fail(&current.id, &message.id, REASON_DUPLICATE, Some(&account.name), Some(&variation))
                .await;
        }

        let limit = self.state.call_timeout();
        let check = with_timeout(
            limit,
            "contact check",
            self.state.gateway.check_contact_exists(&account.name, &message.phone),
        )
        .await;
        let chat_id = match check {
            Ok(check) if check.exists => check.chat_id,
            Ok(_) => {
                return self
                    .fail(&current.id, &message.id, REASON_NOT_REACHABLE, Some(&account.name), Some(&variation))
                    .await
            }
            Err(err) => {
                return self
                    .fail(&current.id, &message.id, &err.to_string(), Some(&account.name), Some(&variation))
                    .await
            }
        };

        match self
            .send_content(&current, &account, &message.phone, chat_id.as_deref(), &variation, &contact)
            .await
        {
            Ok(provider_id) => {
                let marked = db::mark_message_sent(
                    &self.state.pool,
                    self.state.db_kind,
                    &message.id,
                    &account.name,
                    &variation,
                    provider_id.as_deref(),
                )
                .await?;
                if marked {
                    db::increment_campaign_counter(&self.state.pool, self.state.db_kind, &current.id, Counter::Sent)
                        .await?;
                    events::emit(
                        &self.state.events,
                        MESSAGE_SENT,
                        json!({"campaign_id": current.id, "message_id": message.id, "account": account.name}),
                    );
                }
                Ok(MessageOutcome::Sent {
                    message_id: message.id.clone(),
                })
            }
            Err(err) => {
                warn!(campaign_id = %current.id, message_id = %message.id, "send failed: {err}");
                self.fail(&current.id, &message.id, &err.to_string(), Some(&account.name), Some(&variation))
                    .await
            }
        }
    }

    async fn send_one(
        &self,
        account: &SenderAccount,
        phone: &str,
        chat_id: Option<&str>,
        payload: &SendPayload,
    ) -> Result<String> {
        let sent = with_timeout(
            self.state.call_timeout(),
            "send",
            self.state.gateway.send_message(&account.name, phone, payload, chat_id),
        )
        .await?;
        Ok(sent.id)
    }

    /// Sends the resolved content; returns the last provider message id.
    async fn send_content(
        &self,
        campaign: &Campaign,
        account: &SenderAccount,
        phone: &str,
        chat_id: Option<&str>,
        content: &Value,
        contact: &Contact,
    ) -> Result<Option<String>> {
        match campaign.message_type {
            MessageType::Generated => {
                let generator = self
                    .state
                    .generator
                    .as_ref()
                    .ok_or_else(|| anyhow!("no content generator configured"))?;
                let generated = with_timeout(
                    self.state.call_timeout(),
                    "content generation",
                    generator.generate(content, contact, &campaign.tenant_id),
                )
                .await?;
                if !generated.success {
                    return Err(anyhow!(
                        "content generation failed: {}",
                        generated.error.unwrap_or_else(|| "unknown error".to_string())
                    ));
                }
                let text = generated
                    .message
                    .filter(|text| !text.trim().is_empty())
                    .ok_or_else(|| anyhow!("content generation returned no text"))?;
                let payload = SendPayload::Text { text };
                Ok(Some(self.send_one(account, phone, chat_id, &payload).await?))
            }
            MessageType::Sequence => {
                let items = sequence_items(content)?;
                let gap = self.state.config.scheduler.sequence_item_delay();
                let mut last = None;
                for (index, item) in items.iter().enumerate() {
                    if index > 0 && !gap.is_zero() {
                        sleep(gap).await;
                    }
                    match item {
                        SequenceItem::Send(payload) => {
                            last = Some(self.send_one(account, phone, chat_id, payload).await?);
                        }
                        SequenceItem::Wait(pause) => sleep(*pause).await,
                    }
                }
                if last.is_none() {
                    return Err(anyhow!("sequence has nothing to send"));
                }
                Ok(last)
            }
            MessageType::Wait => {
                sleep(wait_duration(content)).await;
                Ok(None)
            }
            single => {
                let payload = build_payload(single, content)?;
                Ok(Some(self.send_one(account, phone, chat_id, &payload).await?))
            }
        }
    }

    async fn fail(
        &self,
        campaign_id: &str,
        message_id: &str,
        reason: &str,
        account: Option<&str>,
        variation: Option<&Value>,
    ) -> Result<MessageOutcome> {
        let marked =
            db::mark_message_failed(&self.state.pool, self.state.db_kind, message_id, reason, account, variation)
                .await?;
        if marked {
            db::increment_campaign_counter(&self.state.pool, self.state.db_kind, campaign_id, Counter::Failed)
                .await?;
            events::emit(
                &self.state.events,
                MESSAGE_FAILED,
                json!({"campaign_id": campaign_id, "message_id": message_id, "reason": reason}),
            );
        }
        Ok(MessageOutcome::Failed {
            message_id: message_id.to_string(),
            reason: reason.to_string(),
        })
    }
}
