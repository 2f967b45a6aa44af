//! Seams to the outside world. The dispatcher and the flow engine only talk
//! to these traits; HTTP implementations live in `channels` and
//! `integrations`, tests plug in fakes.

use crate::flow::IntegrationKind;
use crate::types::{Contact, ContactCheck, GeneratedContent, SendPayload, SentMessage};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait MessagingGateway: Send + Sync {
    async fn send_message(
        &self,
        account: &str,
        phone: &str,
        payload: &SendPayload,
        chat_id: Option<&str>,
    ) -> Result<SentMessage>;

    async fn check_contact_exists(&self, account: &str, phone: &str) -> Result<ContactCheck>;
}

#[async_trait]
pub trait IntegrationGateway: Send + Sync {
    /// Runs one CRM action for a contact. `Ok(false)` means the CRM answered
    /// but refused the action.
    async fn execute(&self, tenant_id: &str, phone: &str, action: &str, payload: &Value) -> Result<bool>;
}

#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, prompt: &Value, contact: &Contact, tenant_id: &str) -> Result<GeneratedContent>;
}

#[derive(Clone, Default)]
pub struct Integrations {
    gateways: HashMap<IntegrationKind, Arc<dyn IntegrationGateway>>,
}

impl Integrations {
    pub fn with(mut self, kind: IntegrationKind, gateway: Arc<dyn IntegrationGateway>) -> Self {
        self.gateways.insert(kind, gateway);
        self
    }

    pub fn get(&self, kind: IntegrationKind) -> Option<Arc<dyn IntegrationGateway>> {
        self.gateways.get(&kind).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.gateways.is_empty()
    }
}

/// Bounds an external call; an elapsed timer becomes an ordinary error.
pub async fn with_timeout<T, F>(limit: Duration, what: &str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("{} timed out after {}s", what, limit.as_secs_f64())),
    }
}
