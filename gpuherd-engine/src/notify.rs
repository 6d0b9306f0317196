use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use serde_json::json;

use gpuherd_common::types::format_money;
use gpuherd_common::AccountBudget;

/// Outbound notification seam. Fire-and-forget: callers log failures and
/// move on, enforcement never waits on delivery.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn post_message(
        &self,
        webhook_url: &str,
        payload: serde_json::Value,
    ) -> anyhow::Result<()>;
}

pub struct DiscordSink {
    client: reqwest::Client,
}

impl DiscordSink {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl NotificationSink for DiscordSink {
    async fn post_message(
        &self,
        webhook_url: &str,
        payload: serde_json::Value,
    ) -> anyhow::Result<()> {
        let resp = self.client.post(webhook_url).json(&payload).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("webhook post failed: status={} body={}", status, body);
        }
        Ok(())
    }
}

/// Discord embed for a spending milestone or a budget breach.
pub fn budget_embed(budget: &AccountBudget, over_budget: bool, now: i64) -> serde_json::Value {
    let (color, title, description) = if over_budget {
        (
            0xFF0000,
            format!("⚠️ Budget Exceeded: {}", budget.account),
            format!(
                "**Account:** {}\n**Spent:** {}\n**Limit:** {}\n**Over by:** {}\n\n\
                 Instances without 'OVERBUDGET' in name will be terminated.",
                budget.account,
                format_money(budget.spent_cents),
                format_money(budget.limit_cents),
                format_money(budget.spent_cents - budget.limit_cents),
            ),
        )
    } else {
        (
            0xFFA500,
            format!("💰 Spending Milestone: {}", budget.account),
            format!(
                "**Account:** {}\n**Spent:** {}\n**Limit:** {}\n**Remaining:** {}",
                budget.account,
                format_money(budget.spent_cents),
                format_money(budget.limit_cents),
                format_money(budget.remaining_cents()),
            ),
        )
    };

    let timestamp = DateTime::from_timestamp(now, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default();

    json!({
        "embeds": [{
            "title": title,
            "description": description,
            "color": color,
            "timestamp": timestamp,
            "footer": { "text": "gpuherd budget monitor" }
        }]
    })
}

/// Post a budget event, logging delivery failure. Returns whether delivery
/// succeeded so the caller can decide to record the notification as sent.
pub async fn send_budget_notification(
    sink: &dyn NotificationSink,
    webhook_url: &str,
    budget: &AccountBudget,
    over_budget: bool,
    now: i64,
) -> bool {
    let payload = budget_embed(budget, over_budget, now);
    match sink.post_message(webhook_url, payload).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(
                account = %budget.account,
                "failed to send budget notification: {:#}",
                e
            );
            false
        }
    }
}
