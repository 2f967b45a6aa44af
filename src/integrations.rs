use crate::config::{EndpointConfig, IntegrationsConfig};
use crate::flow::IntegrationKind;
use crate::gateway::{ContentGenerator, IntegrationGateway, Integrations};
use crate::types::{Contact, GeneratedContent};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn endpoint_client(endpoint: &EndpointConfig) -> Result<Client> {
    Ok(Client::builder()
        .timeout(Duration::from_secs(endpoint.timeout_seconds.max(1)))
        .build()?)
}

fn authorize(req: RequestBuilder, endpoint: &EndpointConfig) -> RequestBuilder {
    match endpoint.api_token.as_ref() {
        Some(token) => req.bearer_auth(token),
        None => req,
    }
}

#[derive(Debug, Deserialize)]
struct ActionResponse {
    #[serde(default = "default_success")]
    success: bool,
}

fn default_success() -> bool {
    true
}

/// CRM reachable over a JSON HTTP endpoint: `POST {url}/actions`.
pub struct HttpCrmGateway {
    name: &'static str,
    client: Client,
    endpoint: EndpointConfig,
}

impl HttpCrmGateway {
    pub fn new(kind: IntegrationKind, endpoint: &EndpointConfig) -> Result<Self> {
        Ok(Self {
            name: kind.as_str(),
            client: endpoint_client(endpoint)?,
            endpoint: endpoint.clone(),
        })
    }
}

#[async_trait]
impl IntegrationGateway for HttpCrmGateway {
    async fn execute(&self, tenant_id: &str, phone: &str, action: &str, payload: &Value) -> Result<bool> {
        let url = format!("{}/actions", self.endpoint.url.trim_end_matches('/'));
        let body = json!({
            "tenant_id": tenant_id,
            "phone": phone,
            "action": action,
            "payload": payload,
        });
        let resp = authorize(self.client.post(url), &self.endpoint)
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("{} integration error: {} {}", self.name, status, body));
        }
        let text = resp.text().await.unwrap_or_default();
        if text.trim().is_empty() {
            return Ok(true);
        }
        let parsed: ActionResponse = serde_json::from_str(&text)?;
        Ok(parsed.success)
    }
}

pub struct HttpContentGenerator {
    client: Client,
    endpoint: EndpointConfig,
}

impl HttpContentGenerator {
    pub fn new(endpoint: &EndpointConfig) -> Result<Self> {
        Ok(Self {
            client: endpoint_client(endpoint)?,
            endpoint: endpoint.clone(),
        })
    }
}

#[async_trait]
impl ContentGenerator for HttpContentGenerator {
    async fn generate(&self, prompt: &Value, contact: &Contact, tenant_id: &str) -> Result<GeneratedContent> {
        let body = json!({
            "tenant_id": tenant_id,
            "prompt": prompt,
            "contact": contact,
        });
        let resp = authorize(self.client.post(&self.endpoint.url), &self.endpoint)
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("content generator error: {} {}", status, body));
        }
        Ok(resp.json().await?)
    }
}

pub fn integrations_from_config(config: &IntegrationsConfig) -> Result<Integrations> {
    let mut integrations = Integrations::default();
    if let Some(endpoint) = config.crm_a.as_ref() {
        integrations = integrations.with(
            IntegrationKind::CrmA,
            Arc::new(HttpCrmGateway::new(IntegrationKind::CrmA, endpoint)?),
        );
    }
    if let Some(endpoint) = config.crm_b.as_ref() {
        integrations = integrations.with(
            IntegrationKind::CrmB,
            Arc::new(HttpCrmGateway::new(IntegrationKind::CrmB, endpoint)?),
        );
    }
    Ok(integrations)
}
