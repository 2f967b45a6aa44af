use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Lifecycle notification fanned out to in-process subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignEvent {
    pub event: String,
    pub payload: Value,
}

pub const CAMPAIGN_STARTED: &str = "campaign.started";
pub const CAMPAIGN_PAUSED: &str = "campaign.paused";
pub const CAMPAIGN_COMPLETED: &str = "campaign.completed";
pub const CAMPAIGN_DELETED: &str = "campaign.deleted";
pub const MESSAGE_SENT: &str = "message.sent";
pub const MESSAGE_FAILED: &str = "message.failed";
pub const INTERACTIVE_STARTED: &str = "interactive.started";
pub const SESSION_FINISHED: &str = "session.finished";

/// Fire and forget; having no subscribers is normal.
pub fn emit(tx: &broadcast::Sender<CampaignEvent>, event: &str, payload: Value) {
    let _ = tx.send(CampaignEvent {
        event: event.to_string(),
        payload,
    });
}
