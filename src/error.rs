use thiserror::Error;

pub const REASON_DUPLICATE: &str = "duplicate: contact already received this campaign";
pub const REASON_NOT_REACHABLE: &str = "not reachable: number is not on WhatsApp";
pub const REASON_CAMPAIGN_MISSING: &str = "campaign missing";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("campaign missing: {0}")]
    CampaignMissing(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("cannot move from {from} to {to}")]
    InvalidTransition { from: String, to: String },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl DispatchError {
    pub fn transition(from: impl ToString, to: impl ToString) -> Self {
        DispatchError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}
