use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

macro_rules! status_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value.trim().to_uppercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(anyhow::anyhow!(
                        concat!("unknown ", stringify!($name), " '{}'"),
                        other
                    )),
                }
            }
        }
    };
}

status_enum!(CampaignStatus {
    Pending => "PENDING",
    Running => "RUNNING",
    Paused => "PAUSED",
    Completed => "COMPLETED",
    Failed => "FAILED",
});

status_enum!(MessageStatus {
    Pending => "PENDING",
    Processing => "PROCESSING",
    Sent => "SENT",
    Failed => "FAILED",
});

status_enum!(InteractiveStatus {
    Draft => "DRAFT",
    Scheduled => "SCHEDULED",
    Started => "STARTED",
    Paused => "PAUSED",
    Completed => "COMPLETED",
});

status_enum!(SessionStatus {
    Active => "ACTIVE",
    Completed => "COMPLETED",
    Failed => "FAILED",
    Expired => "EXPIRED",
});

impl CampaignStatus {
    /// Lifecycle only moves forward, except RUNNING and PAUSED which may alternate.
    pub fn can_transition_to(self, next: CampaignStatus) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Paused, Running)
                | (Paused, Completed)
                | (Paused, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CampaignStatus::Completed | CampaignStatus::Failed)
    }
}

impl InteractiveStatus {
    pub fn can_transition_to(self, next: InteractiveStatus) -> bool {
        use InteractiveStatus::*;
        matches!(
            (self, next),
            (Draft, Scheduled)
                | (Draft, Started)
                | (Draft, Paused)
                | (Scheduled, Started)
                | (Scheduled, Paused)
                | (Started, Paused)
                | (Started, Completed)
                | (Paused, Started)
                | (Paused, Completed)
        )
    }
}

pub const ACCOUNT_WORKING: &str = "WORKING";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub tenant_id: String,
    pub phone: String,
    pub name: Option<String>,
    pub email: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub fields: serde_json::Map<String, Value>,
}

impl Contact {
    /// Value used for `{{field}}` placeholders. Built-in columns shadow custom fields.
    pub fn field(&self, key: &str) -> Option<String> {
        let key = key.strip_prefix("contact.").unwrap_or(key);
        match key {
            "id" => Some(self.id.clone()),
            "phone" => Some(self.phone.clone()),
            "name" => self.name.clone(),
            "email" => self.email.clone(),
            _ => self.fields.get(key).map(value_to_text),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderAccount {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub status: String,
}

impl SenderAccount {
    pub fn is_working(&self) -> bool {
        self.status.eq_ignore_ascii_case(ACCOUNT_WORKING)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    Video,
    Audio,
    Document,
    Generated,
    Sequence,
    Wait,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
            MessageType::Video => "video",
            MessageType::Audio => "audio",
            MessageType::Document => "document",
            MessageType::Generated => "generated",
            MessageType::Sequence => "sequence",
            MessageType::Wait => "wait",
        }
    }
}

impl FromStr for MessageType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "text" => Ok(MessageType::Text),
            "image" => Ok(MessageType::Image),
            "video" => Ok(MessageType::Video),
            "audio" => Ok(MessageType::Audio),
            "document" => Ok(MessageType::Document),
            "generated" | "ai" => Ok(MessageType::Generated),
            "sequence" => Ok(MessageType::Sequence),
            "wait" => Ok(MessageType::Wait),
            other => Err(anyhow::anyhow!("unknown message type '{}'", other)),
        }
    }
}

/// What actually goes over the wire to the messaging provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SendPayload {
    Text {
        text: String,
    },
    Image {
        url: String,
        caption: Option<String>,
    },
    Video {
        url: String,
        caption: Option<String>,
    },
    Audio {
        url: String,
    },
    Document {
        url: String,
        filename: Option<String>,
        caption: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentMessage {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactCheck {
    pub exists: bool,
    pub chat_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedContent {
    pub success: bool,
    pub message: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub target_categories: Vec<String>,
    pub sender_accounts: Vec<String>,
    pub message_type: MessageType,
    pub content: Value,
    pub min_delay: u64,
    pub max_delay: u64,
    pub start_immediately: bool,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub status: CampaignStatus,
    pub total_contacts: i64,
    pub sent_count: i64,
    pub failed_count: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Campaign {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == CampaignStatus::Pending
            && (self.start_immediately || self.scheduled_for.map(|at| at <= now).unwrap_or(false))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignMessage {
    pub id: String,
    pub campaign_id: String,
    pub contact_id: String,
    pub phone: String,
    pub contact_name: Option<String>,
    pub status: MessageStatus,
    pub sender_account: Option<String>,
    pub variation: Option<Value>,
    pub error: Option<String>,
    pub provider_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractiveCampaign {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub graph: crate::flow::FlowGraph,
    pub status: InteractiveStatus,
    pub sender_account_id: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Inbound reply as handed over by the webhook layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub contact_phone: String,
    pub message_content: String,
    #[serde(default)]
    pub session_hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InboundOutcome {
    Advanced {
        session_id: String,
        next_node_id: String,
    },
    Completed {
        session_id: String,
    },
    Failed {
        session_id: Option<String>,
        error: String,
    },
    Ignored {
        reason: String,
    },
}

impl InboundOutcome {
    pub fn processed(&self) -> bool {
        !matches!(self, InboundOutcome::Ignored { .. })
    }
}

pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
