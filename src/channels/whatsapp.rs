use crate::config::WhatsAppConfig;
use crate::gateway::MessagingGateway;
use crate::session::normalize_phone;
use crate::types::{ContactCheck, IncomingMessage, SendPayload, SentMessage};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppInboundPayload {
    pub peer_id: String,
    pub text: Option<String>,
    pub message_id: Option<String>,
    pub sender_name: Option<String>,
    /// Session or campaign id the sidecar echoes back for quoted replies.
    pub session_hint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: Option<String>,
    message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CheckResponse {
    exists: bool,
    chat_id: Option<String>,
    jid: Option<String>,
}

/// HTTP client for the WhatsApp sidecar that owns the sender sessions.
pub struct WhatsAppSidecar {
    client: Client,
    base_url: String,
}

impl WhatsAppSidecar {
    pub fn new(config: &WhatsAppConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .build()?;
        Ok(Self {
            client,
            base_url: config.sidecar_url.trim_end_matches('/').to_string(),
        })
    }

    fn account_url(&self, account: &str, tail: &str) -> String {
        format!(
            "{}/accounts/{}/{}",
            self.base_url,
            utf8_percent_encode(account, NON_ALPHANUMERIC),
            tail
        )
    }
}

#[async_trait]
impl MessagingGateway for WhatsAppSidecar {
    async fn send_message(
        &self,
        account: &str,
        phone: &str,
        payload: &SendPayload,
        chat_id: Option<&str>,
    ) -> Result<SentMessage> {
        let body = serde_json::json!({
            "to": chat_id.unwrap_or(phone),
            "phone": phone,
            "message": payload,
        });
        let resp = self
            .client
            .post(self.account_url(account, "messages"))
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("whatsapp sidecar error: {} {}", status, body));
        }
        let parsed: SendResponse = resp.json().await?;
        let id = parsed
            .id
            .or(parsed.message_id)
            .ok_or_else(|| anyhow!("whatsapp sidecar returned no message id"))?;
        Ok(SentMessage { id })
    }

    async fn check_contact_exists(&self, account: &str, phone: &str) -> Result<ContactCheck> {
        let resp = self
            .client
            .post(self.account_url(account, "contacts/check"))
            .json(&serde_json::json!({ "phone": phone }))
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("whatsapp sidecar check failed: {} {}", status, body));
        }
        let parsed: CheckResponse = resp.json().await?;
        Ok(ContactCheck {
            exists: parsed.exists,
            chat_id: parsed.chat_id.or(parsed.jid),
        })
    }
}

pub fn normalize_whatsapp_inbound(payload: WhatsAppInboundPayload) -> IncomingMessage {
    IncomingMessage {
        contact_phone: normalize_phone(&payload.peer_id),
        message_content: payload.text.unwrap_or_default(),
        session_hint: payload.session_hint.filter(|hint| !hint.trim().is_empty()),
    }
}
