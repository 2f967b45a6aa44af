use crate::types::{Contact, SessionStatus};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

/// Digits only, so `+55 (11) 98888-7777`, `5511988887777` and
/// `5511988887777@s.whatsapp.net` all land on the same key.
pub fn normalize_phone(value: &str) -> String {
    let value = value.trim();
    let value = value.split('@').next().unwrap_or(value);
    value.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// One step of a contact's walk through the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitedNode {
    pub node_id: String,
    pub visited_at: DateTime<Utc>,
    #[serde(default)]
    pub sent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactSession {
    pub id: String,
    pub campaign_id: String,
    pub contact_id: String,
    pub tenant_id: String,
    pub phone: String,
    pub sender_account: Option<String>,
    pub chat_id: Option<String>,
    pub current_node_id: Option<String>,
    pub variables: Map<String, Value>,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub visited: Vec<VisitedNode>,
    /// Set while the session is parked on a delay node.
    pub wake_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContactSession {
    pub fn start(campaign_id: &str, contact: &Contact, node_id: &str, sender_account: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            campaign_id: campaign_id.to_string(),
            contact_id: contact.id.clone(),
            tenant_id: contact.tenant_id.clone(),
            phone: normalize_phone(&contact.phone),
            sender_account: sender_account.map(str::to_string),
            chat_id: None,
            current_node_id: Some(node_id.to_string()),
            variables: Map::new(),
            last_message: None,
            last_message_at: None,
            status: SessionStatus::Active,
            visited: Vec::new(),
            wake_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    pub fn record_visit(&mut self, node_id: &str, sent: bool, error: Option<String>) {
        self.visited.push(VisitedNode {
            node_id: node_id.to_string(),
            visited_at: Utc::now(),
            sent,
            error,
        });
    }

    /// Shallow merge: incoming keys replace existing ones, others are kept.
    pub fn merge_variables(&mut self, incoming: Map<String, Value>) {
        merge_variables(&mut self.variables, incoming);
    }

    pub fn record_reply(&mut self, text: &str, at: DateTime<Utc>) {
        self.last_message = Some(text.to_string());
        self.last_message_at = Some(at);
        let mut vars = Map::new();
        vars.insert("last_message".to_string(), Value::String(text.to_string()));
        self.merge_variables(vars);
    }

    pub fn finish(&mut self, status: SessionStatus) {
        self.status = status;
        self.wake_at = None;
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn is_idle(&self, now: DateTime<Utc>, expiry: Duration) -> bool {
        self.is_active() && self.wake_at.is_none() && now - self.updated_at > expiry
    }

    /// Contact enriched with session variables for placeholder rendering.
    /// Contact columns and custom fields win over variables of the same name.
    pub fn render_contact(&self, contact: &Contact) -> Contact {
        let mut rendered = contact.clone();
        for (key, value) in &self.variables {
            rendered.fields.entry(key.clone()).or_insert_with(|| value.clone());
        }
        rendered
    }
}

pub fn merge_variables(target: &mut Map<String, Value>, incoming: Map<String, Value>) {
    for (key, value) in incoming {
        target.insert(key, value);
    }
}

/// Per-session async locks so one contact's messages are handled in order.
#[derive(Debug, Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    pub async fn acquire(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(session_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Drops the lock entry of a session that reached a terminal state.
    pub fn forget(&self, session_id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lock) = locks.get(session_id) {
            // still held by someone: keep it
            if Arc::strong_count(lock) > 1 {
                return;
            }
        }
        locks.remove(session_id);
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
