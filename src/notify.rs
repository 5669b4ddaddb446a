//! Webhook notifications for operators.
//!
//! Every alert and fulfillment report is logged first; the webhook post is
//! best effort and its failures are only logged.

use alloy_primitives::{B256, U256};
use async_trait::async_trait;
use serde_json::json;
use std::fmt;
use std::time::Duration;
use tracing::{error, info, warn};

/// Webhook posts give up after this long.
pub const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// Discord rejects messages over 2000 characters.
const MAX_CONTENT_CHARS: usize = 1900;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => f.write_str("INFO"),
            Self::Warning => f.write_str("WARNING"),
            Self::Critical => f.write_str("CRITICAL"),
        }
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, severity: Severity, message: &str);
}

/// A successful fulfillment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FulfillmentReport {
    pub request_id: U256,
    pub seed: U256,
    pub tx_hash: B256,
    /// Blocks between the request and its fulfillment.
    pub blocks_to_fulfill: u64,
}

#[async_trait]
pub trait FulfillmentSink: Send + Sync {
    async fn report(&self, report: &FulfillmentReport);
}

/// Posts `{"content": ...}` to a Discord-style webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: Option<String>,
    http: reqwest::Client,
    label: String,
}

impl WebhookNotifier {
    /// `label` prefixes every message so several relays can share a channel.
    pub fn new(url: Option<String>, label: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()?;
        Ok(Self {
            url: url.filter(|u| !u.trim().is_empty()),
            http,
            label: label.into(),
        })
    }

    async fn post(&self, content: String) {
        let Some(url) = &self.url else {
            return;
        };
        let content: String = content.chars().take(MAX_CONTENT_CHARS).collect();
        match self.http.post(url).json(&json!({ "content": content })).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!(status = %resp.status(), "Webhook rejected message"),
            Err(e) => warn!(error = %e, "Webhook post failed"),
        }
    }
}

#[async_trait]
impl AlertSink for WebhookNotifier {
    async fn notify(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Info => info!(label = %self.label, "{message}"),
            Severity::Warning => warn!(label = %self.label, "{message}"),
            Severity::Critical => error!(label = %self.label, "{message}"),
        }
        self.post(format!("[{severity}] {}: {message}", self.label))
            .await;
    }
}

#[async_trait]
impl FulfillmentSink for WebhookNotifier {
    async fn report(&self, report: &FulfillmentReport) {
        info!(
            request_id = %report.request_id,
            tx_hash = %report.tx_hash,
            blocks = report.blocks_to_fulfill,
            "Fulfillment reported"
        );
        self.post(format!(
            "{}: SUCCESS - {} blocks - request {} - seed {} - {}",
            self.label, report.blocks_to_fulfill, report.request_id, report.seed, report.tx_hash
        ))
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn alert_posts_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "content": "[CRITICAL] base-immediate: entropy gone"
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(Some(server.uri()), "base-immediate").unwrap();
        notifier.notify(Severity::Critical, "entropy gone").await;
    }

    #[tokio::test]
    async fn report_includes_latency_and_hash() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(Some(server.uri()), "relay").unwrap();
        notifier
            .report(&FulfillmentReport {
                request_id: U256::from(7u64),
                seed: U256::from(1u64),
                tx_hash: B256::repeat_byte(0xab),
                blocks_to_fulfill: 2,
            })
            .await;

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        let content = body["content"].as_str().unwrap();
        assert!(content.contains("SUCCESS - 2 blocks"));
        assert!(content.contains(&B256::repeat_byte(0xab).to_string()));
    }

    #[tokio::test]
    async fn long_messages_are_truncated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(Some(server.uri()), "relay").unwrap();
        notifier.notify(Severity::Warning, &"x".repeat(5000)).await;

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["content"].as_str().unwrap().chars().count(), MAX_CONTENT_CHARS);
    }

    #[tokio::test]
    async fn webhook_failure_is_not_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(Some(server.uri()), "relay").unwrap();
        notifier.notify(Severity::Info, "still running").await;
    }

    #[tokio::test]
    async fn missing_url_only_logs() {
        let notifier = WebhookNotifier::new(Some("  ".into()), "relay").unwrap();
        assert!(notifier.url.is_none());
        notifier.notify(Severity::Warning, "nobody listening").await;
    }
}
