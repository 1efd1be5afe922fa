//! Outbound mail, the operator's only notification channel. The Witness
//! escalates stuck workers through it and Convoys announce completion.

use crate::{Config, Error, Result};
use async_trait::async_trait;
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tracing::info;

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<()>;
}

/// Delivers through the configured HTTP mail gateway.
pub struct GatewayMailer {
    endpoint: String,
    client: reqwest::Client,
}

impl GatewayMailer {
    pub fn new(endpoint: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("reqwest client");
        Self { endpoint, client }
    }
}

#[async_trait]
impl Mailer for GatewayMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "to": to, "subject": subject, "body": body }))
            .send()
            .await
            .map_err(|e| Error::MailError(format!("gateway unreachable: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::MailError(format!(
                "gateway returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Fallback when no gateway is configured: the send is logged and counts
/// as delivered so controllers behave identically in dev clusters.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, to: &str, subject: &str, _body: &str) -> Result<()> {
        info!("mail (no gateway configured) to={} subject={}", to, subject);
        Ok(())
    }
}

pub fn mailer_from_config(config: &Config) -> Arc<dyn Mailer> {
    match &config.mail_gateway {
        Some(endpoint) => Arc::new(GatewayMailer::new(endpoint.clone())),
        None => Arc::new(LogMailer),
    }
}
