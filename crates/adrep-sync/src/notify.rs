//! End-of-run notification. Delivery is best-effort: a failed post is logged, never raised.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, succeeded: &[String], failed: &[String]);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, succeeded: &[String], failed: &[String]) {
        info!(?succeeded, ?failed, "no webhook configured; skipping notification");
    }
}

/// Slack blocks message: a header, the succeeded jobs, and the failed ones when there are any.
pub fn slack_payload(succeeded: &[String], failed: &[String]) -> JsonValue {
    let mut blocks = vec![
        json!({
            "type": "header",
            "text": { "type": "plain_text", "text": "Report Generation Completed!" }
        }),
        json!({
            "type": "section",
            "text": { "type": "mrkdwn", "text": format!("*Success:*\n{}", bullet_list(succeeded)) }
        }),
    ];
    if !failed.is_empty() {
        blocks.push(json!({
            "type": "section",
            "text": { "type": "mrkdwn", "text": format!("*Fails:*\n{}", bullet_list(failed)) }
        }));
    }
    json!({ "blocks": blocks })
}

fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        return "_none_".to_string();
    }
    items
        .iter()
        .map(|item| format!("• {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone)]
pub struct SlackNotifier {
    client: reqwest::Client,
    webhook_url: String,
}

impl SlackNotifier {
    pub fn new(webhook_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            webhook_url: webhook_url.into(),
        })
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, succeeded: &[String], failed: &[String]) {
        let payload = slack_payload(succeeded, failed);
        match self.client.post(&self.webhook_url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!(succeeded = succeeded.len(), failed = failed.len(), "notification sent");
            }
            Ok(resp) => warn!(status = %resp.status(), "notification rejected by webhook"),
            Err(err) => warn!(error = %err, "notification failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn failures_section_only_when_something_failed() {
        let ok = slack_payload(&names(&["exchange", "analytics"]), &[]);
        let blocks = ok["blocks"].as_array().expect("blocks");
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0]["text"]["text"], "Report Generation Completed!");
        assert_eq!(blocks[1]["text"]["text"], "*Success:*\n• exchange\n• analytics");

        let mixed = slack_payload(&names(&["exchange"]), &names(&["quality"]));
        let blocks = mixed["blocks"].as_array().expect("blocks");
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[2]["text"]["text"], "*Fails:*\n• quality");
    }

    #[test]
    fn empty_success_list_is_spelled_out() {
        let payload = slack_payload(&[], &names(&["unknown failure"]));
        assert_eq!(payload["blocks"][1]["text"]["text"], "*Success:*\n_none_");
    }

    #[tokio::test]
    async fn unreachable_webhook_does_not_panic() {
        let notifier = SlackNotifier::new("http://127.0.0.1:9/hook", Duration::from_millis(200))
            .expect("client");
        notifier.notify(&names(&["exchange"]), &[]).await;
    }
}
