use crate::business_hours::BusinessHoursConfig;
use crate::db;
use crate::error::DispatchError;
use crate::events::{self, CAMPAIGN_DELETED, CAMPAIGN_PAUSED};
use crate::session::normalize_phone;
use crate::types::{Campaign, CampaignStatus, MessageType};
use crate::AppState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::info;
use uuid::Uuid;

/// Longest pause the dispatcher takes before one send (one hour).
pub const MAX_SEND_DELAY_SECONDS: u64 = 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCampaign {
    pub tenant_id: String,
    pub name: String,
    #[serde(default)]
    pub target_categories: Vec<String>,
    #[serde(default)]
    pub sender_accounts: Vec<String>,
    pub message_type: MessageType,
    pub content: Value,
    #[serde(default)]
    pub min_delay: u64,
    #[serde(default)]
    pub max_delay: Option<u64>,
    #[serde(default)]
    pub start_immediately: bool,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub business_hours: Option<BusinessHoursConfig>,
}

/// Validates the request, snapshots the targeted contacts into a message
/// queue and stores everything as a PENDING campaign.
pub async fn create_campaign(state: &AppState, request: NewCampaign) -> Result<Campaign, DispatchError> {
    let max_delay = request.max_delay.unwrap_or(request.min_delay);
    if max_delay > MAX_SEND_DELAY_SECONDS {
        return Err(DispatchError::Configuration(format!(
            "max_delay {max_delay} exceeds the {MAX_SEND_DELAY_SECONDS}s limit"
        )));
    }
    if request.min_delay > max_delay {
        return Err(DispatchError::Configuration(format!(
            "min_delay {} exceeds max_delay {}",
            request.min_delay, max_delay
        )));
    }
    if request.content.is_null() {
        return Err(DispatchError::Configuration("campaign has no content".to_string()));
    }
    if let Some(hours) = request.business_hours.as_ref() {
        hours
            .validate()
            .map_err(|err| DispatchError::Configuration(err.to_string()))?;
    }

    let contacts = db::list_contacts_in_categories(
        &state.pool,
        state.db_kind,
        &request.tenant_id,
        &request.target_categories,
    )
    .await?;

    let now = Utc::now();
    let campaign_id = Uuid::new_v4().to_string();
    let mut seen_contacts = HashSet::new();
    let mut seen_phones = HashSet::new();
    let messages: Vec<_> = contacts
        .iter()
        .filter(|contact| {
            let phone = normalize_phone(&contact.phone);
            !phone.is_empty() && seen_contacts.insert(contact.id.clone()) && seen_phones.insert(phone)
        })
        .map(|contact| db::new_campaign_message(&campaign_id, contact, now))
        .collect();

    let campaign = Campaign {
        id: campaign_id,
        tenant_id: request.tenant_id,
        name: request.name,
        target_categories: request.target_categories,
        sender_accounts: request.sender_accounts,
        message_type: request.message_type,
        content: request.content,
        min_delay: request.min_delay,
        max_delay,
        start_immediately: request.start_immediately,
        scheduled_for: request.scheduled_for,
        status: CampaignStatus::Pending,
        total_contacts: messages.len() as i64,
        sent_count: 0,
        failed_count: 0,
        created_at: now,
        started_at: None,
        completed_at: None,
    };

    db::insert_campaign_with_messages(&state.pool, state.db_kind, &campaign, &messages).await?;
    if let Some(hours) = request.business_hours.as_ref() {
        db::upsert_business_hours(&state.pool, state.db_kind, &campaign.id, hours).await?;
    }
    info!(campaign_id = %campaign.id, contacts = messages.len(), "campaign created");
    Ok(campaign)
}

async fn load(state: &AppState, id: &str) -> Result<Campaign, DispatchError> {
    db::get_campaign(&state.pool, state.db_kind, id)
        .await?
        .ok_or_else(|| DispatchError::NotFound(format!("campaign {id}")))
}

async fn transition(
    state: &AppState,
    campaign: &Campaign,
    to: CampaignStatus,
) -> Result<Campaign, DispatchError> {
    if !campaign.status.can_transition_to(to) {
        return Err(DispatchError::transition(campaign.status, to));
    }
    let moved = db::transition_campaign(&state.pool, state.db_kind, &campaign.id, campaign.status, to).await?;
    if !moved {
        let current = load(state, &campaign.id).await?;
        return Err(DispatchError::transition(current.status, to));
    }
    load(state, &campaign.id).await
}

/// Asks the scheduler to pick a PENDING campaign up on its next tick.
pub async fn start_campaign(state: &AppState, id: &str) -> Result<Campaign, DispatchError> {
    let campaign = load(state, id).await?;
    if campaign.status != CampaignStatus::Pending {
        return Err(DispatchError::transition(campaign.status, CampaignStatus::Running));
    }
    db::request_immediate_start(&state.pool, state.db_kind, id).await?;
    load(state, id).await
}

/// Flips RUNNING to PAUSED. A message already in flight notices at its
/// pre-send checkpoint and goes back to the queue.
pub async fn pause_campaign(state: &AppState, id: &str) -> Result<Campaign, DispatchError> {
    let campaign = load(state, id).await?;
    let paused = transition(state, &campaign, CampaignStatus::Paused).await?;
    events::emit(&state.events, CAMPAIGN_PAUSED, json!({"campaign_id": id, "reason": "requested"}));
    Ok(paused)
}

pub async fn resume_campaign(state: &AppState, id: &str) -> Result<Campaign, DispatchError> {
    let campaign = load(state, id).await?;
    if campaign.status != CampaignStatus::Paused {
        return Err(DispatchError::transition(campaign.status, CampaignStatus::Running));
    }
    transition(state, &campaign, CampaignStatus::Running).await
}

pub async fn get_campaign(state: &AppState, id: &str) -> Result<Campaign, DispatchError> {
    load(state, id).await
}

/// Drops the campaign with its queue and business hours. A message already
/// claimed by the scheduler fails as "campaign missing" at its next check.
pub async fn delete_campaign(state: &AppState, id: &str) -> Result<(), DispatchError> {
    let campaign = load(state, id).await?;
    db::delete_campaign(&state.pool, state.db_kind, id).await?;
    info!(campaign_id = %id, status = %campaign.status.as_str(), "campaign deleted");
    events::emit(&state.events, CAMPAIGN_DELETED, json!({"campaign_id": id}));
    Ok(())
}
