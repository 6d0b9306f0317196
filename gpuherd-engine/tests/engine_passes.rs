use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use gpuherd_common::config::{AccountConfig, GlobalConfig};
use gpuherd_common::{PolicySettings, RetryPolicy};
use gpuherd_engine::notify::NotificationSink;
use gpuherd_engine::store::Store;
use gpuherd_engine::{availability, budget, collector, sweep, AccountContext};
use gpuherd_providers::inventory::{DiscoveredInstance, TypeOffering};
use gpuherd_providers::mock::MockProvider;

const HOUR: i64 = 3600;
const POLL: i64 = 60;
const T0: i64 = 1_700_000_000;

fn retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(1),
        timeout: Duration::from_secs(1),
    }
}

fn test_cfg(dir: &TempDir) -> GlobalConfig {
    GlobalConfig {
        db_path: dir.path().join("state.db"),
        accounts_path: dir.path().join("accounts.toml"),
        min_runtime_hours: 4.0,
        idle_shutdown_hours: 2.0,
        poll_interval_secs: POLL,
        sample_retention_hours: 168,
        availability_retention_hours: 168,
        ssh_config_path: dir.path().join("ssh_config"),
        ssh_user: "ubuntu".to_string(),
        ssh_keys_dir: dir.path().to_path_buf(),
        ssh_identity: None,
        backup_dir: dir.path().join("backups"),
        budget_limit_default_cents: 500_000,
        budget_milestone_interval_cents: 100_000,
        lock_stale_secs: 600,
    }
}

fn account_config(
    name: &str,
    limit_cents: i64,
    milestone_interval_cents: i64,
    webhook: Option<&str>,
) -> AccountConfig {
    AccountConfig {
        name: name.to_string(),
        api_key: "secret_test".to_string(),
        limit_cents,
        milestone_interval_cents,
        discord_webhook: webhook.map(Into::into),
    }
}

fn context(config: AccountConfig, provider: Arc<MockProvider>) -> AccountContext {
    AccountContext {
        config,
        provider,
    }
}

fn discovered(id: &str, name: &str, gpu_count: i64, hourly_cost_cents: i64) -> DiscoveredInstance {
    DiscoveredInstance {
        id: id.to_string(),
        name: name.to_string(),
        ip: Some(format!("10.0.0.{}", id.len())),
        region: "us-west-1".to_string(),
        instance_type: "gpu_8x_a100".to_string(),
        gpu_count,
        hourly_cost_cents,
        ssh_key_names: vec!["herd-key".to_string()],
        launched_at: None,
    }
}

#[derive(Default)]
struct RecordingSink {
    posts: Mutex<Vec<(String, serde_json::Value)>>,
}

impl RecordingSink {
    fn count_with_color(&self, color: i64) -> usize {
        self.posts
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, payload)| payload["embeds"][0]["color"] == color)
            .count()
    }

    fn breach_count(&self) -> usize {
        self.count_with_color(0xFF0000)
    }

    fn milestone_count(&self) -> usize {
        self.count_with_color(0xFFA500)
    }

    fn total(&self) -> usize {
        self.posts.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl NotificationSink for RecordingSink {
    async fn post_message(
        &self,
        webhook_url: &str,
        payload: serde_json::Value,
    ) -> anyhow::Result<()> {
        self.posts
            .lock()
            .unwrap()
            .push((webhook_url.to_string(), payload));
        Ok(())
    }
}

// --- monitor pass ---

#[tokio::test]
async fn monitor_pass_records_instances_and_samples() {
    let dir = TempDir::new().unwrap();
    let cfg = test_cfg(&dir);
    let store = Store::open_in_memory().await.unwrap();

    let provider = Arc::new(MockProvider::new());
    provider.push_instance(discovered("i-busy", "trainer", 2, 3600));
    provider.push_instance(discovered("i-idle", "scratch", 1, 1200));
    provider.set_utilization("i-busy", vec![80, 30]);
    provider.set_utilization("i-idle", vec![0]);

    let contexts = vec![context(
        account_config("default", 500_000, 100_000, None),
        provider,
    )];

    let summary = collector::run_monitor_pass(&store, &contexts, &cfg, &retry(), T0)
        .await
        .unwrap();
    assert_eq!(summary.accounts_ok, 1);
    assert_eq!(summary.instances_seen, 2);
    assert_eq!(summary.samples_written, 2);
    assert_eq!(summary.ssh_entries, 2);

    let busy = store.get_instance("i-busy").await.unwrap().unwrap();
    assert_eq!(busy.name, "trainer");
    // First observation is charged one poll interval: 3600 c/h * 60s.
    assert_eq!(busy.cost_accrued_cents, 60);

    let sample = store.latest_sample("i-busy").await.unwrap().unwrap();
    assert_eq!(sample.per_gpu_percent, vec![80, 30]);
    assert_eq!(sample.cost_accrued_cents, 60);

    // SSH config carries both hosts.
    let ssh = std::fs::read_to_string(&cfg.ssh_config_path).unwrap();
    assert!(ssh.contains("Host trainer"));
    assert!(ssh.contains("Host scratch"));
}

#[tokio::test]
async fn monitor_pass_skips_failed_instance_and_keeps_the_rest() {
    let dir = TempDir::new().unwrap();
    let cfg = test_cfg(&dir);
    let store = Store::open_in_memory().await.unwrap();

    let provider = Arc::new(MockProvider::new());
    provider.push_instance(discovered("i-ok", "healthy", 1, 1200));
    provider.push_instance(discovered("i-bad", "unreachable", 1, 1200));
    provider.set_utilization("i-ok", vec![10]);
    provider.fail_utilization_for("i-bad");

    let contexts = vec![context(
        account_config("default", 500_000, 100_000, None),
        provider,
    )];

    let summary = collector::run_monitor_pass(&store, &contexts, &cfg, &retry(), T0)
        .await
        .unwrap();
    assert_eq!(summary.instances_seen, 2);
    assert_eq!(summary.samples_written, 1);

    // Both are tracked; only the reachable one got a sample.
    assert!(store.get_instance("i-bad").await.unwrap().is_some());
    assert!(store.latest_sample("i-bad").await.unwrap().is_none());
    assert!(store.latest_sample("i-ok").await.unwrap().is_some());
}

#[tokio::test]
async fn monitor_pass_ends_absent_instances_but_not_on_outage() {
    let dir = TempDir::new().unwrap();
    let cfg = test_cfg(&dir);
    let store = Store::open_in_memory().await.unwrap();

    let provider = Arc::new(MockProvider::new());
    provider.push_instance(discovered("i-1", "steady", 1, 1200));
    provider.push_instance(discovered("i-2", "ephemeral", 1, 1200));

    let contexts = vec![context(
        account_config("default", 500_000, 100_000, None),
        provider.clone(),
    )];

    collector::run_monitor_pass(&store, &contexts, &cfg, &retry(), T0)
        .await
        .unwrap();

    // Outage: listing fails, nothing may be marked ended.
    provider.set_listing_down(true);
    let summary = collector::run_monitor_pass(&store, &contexts, &cfg, &retry(), T0 + POLL)
        .await
        .unwrap();
    assert_eq!(summary.accounts_failed, 1);
    assert_eq!(summary.instances_ended, 0);
    assert_eq!(store.active_instances(None).await.unwrap().len(), 2);

    // Provider back, one instance genuinely gone.
    provider.set_listing_down(false);
    provider.remove_instance("i-2");
    let summary = collector::run_monitor_pass(&store, &contexts, &cfg, &retry(), T0 + 2 * POLL)
        .await
        .unwrap();
    assert_eq!(summary.instances_ended, 1);

    let gone = store.get_instance("i-2").await.unwrap().unwrap();
    assert!(gone.ended_at.is_some());
    // The row survives for spend accounting.
    assert_eq!(store.active_instances(None).await.unwrap().len(), 1);

    // And it left the SSH config.
    let ssh = std::fs::read_to_string(&cfg.ssh_config_path).unwrap();
    assert!(ssh.contains("Host steady"));
    assert!(!ssh.contains("Host ephemeral"));
}

#[tokio::test]
async fn cost_accrual_is_clamped_across_polling_gaps() {
    let dir = TempDir::new().unwrap();
    let cfg = test_cfg(&dir);
    let store = Store::open_in_memory().await.unwrap();

    let provider = Arc::new(MockProvider::new());
    provider.push_instance(discovered("i-1", "trainer", 1, 3600));
    provider.set_utilization("i-1", vec![50]);

    let contexts = vec![context(
        account_config("default", 500_000, 100_000, None),
        provider,
    )];

    collector::run_monitor_pass(&store, &contexts, &cfg, &retry(), T0)
        .await
        .unwrap();
    // The poller was down for an hour; only 2x the poll interval is billed.
    collector::run_monitor_pass(&store, &contexts, &cfg, &retry(), T0 + HOUR)
        .await
        .unwrap();

    let inst = store.get_instance("i-1").await.unwrap().unwrap();
    // 60s (first) + 120s (clamped gap) at 3600 cents/hour = 1 cent/second.
    assert_eq!(inst.cost_accrued_cents, 60 + 120);
}

// --- sweep pass ---

fn sweep_settings() -> PolicySettings {
    PolicySettings {
        min_runtime_secs: HOUR,
        idle_shutdown_secs: 30 * 60,
        poll_interval_secs: POLL,
    }
}

/// Seed an instance directly into the store with an idle sample trail.
async fn seed_idle_instance(store: &Store, id: &str, name: &str, launched_at: i64, idle_since: i64, now: i64) {
    let mut inst = discovered(id, name, 1, 1200);
    inst.launched_at = Some(launched_at);
    store.upsert_instance(&inst, "default", now).await.unwrap();
    let mut t = idle_since;
    while t <= now {
        store.append_sample(id, t, &[0], 0).await.unwrap();
        t += POLL;
    }
}

#[tokio::test]
async fn sweep_terminates_idle_spares_whitelisted_and_protected() {
    let store = Store::open_in_memory().await.unwrap();
    let provider = Arc::new(MockProvider::new());
    let contexts = vec![context(
        account_config("default", 500_000, 100_000, None),
        provider.clone(),
    )];

    let now = T0;
    // Idle past the 30 minute threshold, runtime past the minimum.
    seed_idle_instance(&store, "i-idle", "old-idle", now - 5 * HOUR, now - HOUR, now).await;
    // Same shape but whitelisted by name.
    seed_idle_instance(&store, "i-wl", "whitelist-idle", now - 5 * HOUR, now - HOUR, now).await;
    // Same idle trail but too young to terminate.
    seed_idle_instance(&store, "i-young", "fresh", now - 30 * 60, now - HOUR, now).await;

    let summary = sweep::run_sweep_pass(&store, &contexts, &sweep_settings(), &retry(), now, false)
        .await
        .unwrap();

    assert_eq!(summary.evaluated, 3);
    assert_eq!(summary.terminations_requested, 1);
    assert_eq!(provider.terminated_ids(), vec!["i-idle".to_string()]);
}

#[tokio::test]
async fn sweep_dry_run_calls_no_provider() {
    let store = Store::open_in_memory().await.unwrap();
    let provider = Arc::new(MockProvider::new());
    let contexts = vec![context(
        account_config("default", 500_000, 100_000, None),
        provider.clone(),
    )];

    let now = T0;
    seed_idle_instance(&store, "i-idle", "old-idle", now - 5 * HOUR, now - HOUR, now).await;

    let summary = sweep::run_sweep_pass(&store, &contexts, &sweep_settings(), &retry(), now, true)
        .await
        .unwrap();
    assert_eq!(summary.terminations_requested, 1);
    assert!(provider.terminated_ids().is_empty());
}

#[tokio::test]
async fn rejected_termination_is_retried_next_cycle() {
    let store = Store::open_in_memory().await.unwrap();
    let provider = Arc::new(MockProvider::new());
    provider.set_reject_terminations(true);
    let contexts = vec![context(
        account_config("default", 500_000, 100_000, None),
        provider.clone(),
    )];

    let now = T0;
    seed_idle_instance(&store, "i-idle", "old-idle", now - 5 * HOUR, now - HOUR, now).await;

    let summary = sweep::run_sweep_pass(&store, &contexts, &sweep_settings(), &retry(), now, false)
        .await
        .unwrap();
    assert_eq!(summary.terminations_rejected, 1);
    // Still active: nothing in the store pretends the terminate succeeded.
    assert_eq!(store.active_instances(None).await.unwrap().len(), 1);

    // Next cycle the instance still decides Terminate and is re-requested.
    seed_idle_instance(&store, "i-idle", "old-idle", now - 5 * HOUR, now, now + POLL).await;
    sweep::run_sweep_pass(&store, &contexts, &sweep_settings(), &retry(), now + POLL, false)
        .await
        .unwrap();
    assert_eq!(provider.terminated_ids().len(), 2);
}

// --- budget pass ---

#[tokio::test]
async fn breach_terminates_all_but_overbudget_named_with_one_notification() {
    let store = Store::open_in_memory().await.unwrap();
    let provider = Arc::new(MockProvider::new());
    let sink = RecordingSink::default();
    let contexts = vec![context(
        account_config("research", 1_000, 100_000, Some("https://hook.example/w")),
        provider.clone(),
    )];

    for (id, name) in [
        ("i-1", "batch-a"),
        ("i-2", "batch-b"),
        ("i-3", "prod-OVERBUDGET"),
    ] {
        store
            .upsert_instance(&discovered(id, name, 1, 1200), "research", T0)
            .await
            .unwrap();
    }
    // Spend lands exactly on the limit: >= means breached.
    store.add_cost("i-1", 400).await.unwrap();
    store.add_cost("i-2", 400).await.unwrap();
    store.add_cost("i-3", 200).await.unwrap();

    let summary = budget::run_budget_pass(&store, &contexts, &sink, &retry(), T0, false)
        .await
        .unwrap();

    assert_eq!(summary.breaches, 1);
    assert_eq!(sink.breach_count(), 1);
    let mut terminated = provider.terminated_ids();
    terminated.sort();
    assert_eq!(terminated, vec!["i-1".to_string(), "i-2".to_string()]);

    // Second evaluation inside the same breach event: enforcement repeats
    // (at-least-once), the notification does not.
    budget::run_budget_pass(&store, &contexts, &sink, &retry(), T0 + 300, false)
        .await
        .unwrap();
    assert_eq!(sink.breach_count(), 1);
}

#[tokio::test]
async fn missing_webhook_suppresses_notification_not_enforcement() {
    let store = Store::open_in_memory().await.unwrap();
    let provider = Arc::new(MockProvider::new());
    let sink = RecordingSink::default();
    let contexts = vec![context(
        account_config("research", 1_000, 100_000, None),
        provider.clone(),
    )];

    store
        .upsert_instance(&discovered("i-1", "batch", 1, 1200), "research", T0)
        .await
        .unwrap();
    store.add_cost("i-1", 2_000).await.unwrap();

    budget::run_budget_pass(&store, &contexts, &sink, &retry(), T0, false)
        .await
        .unwrap();

    assert_eq!(sink.total(), 0);
    assert_eq!(provider.terminated_ids(), vec!["i-1".to_string()]);
}

#[tokio::test]
async fn milestones_notify_once_each_and_catch_up() {
    let store = Store::open_in_memory().await.unwrap();
    let provider = Arc::new(MockProvider::new());
    let sink = RecordingSink::default();
    let contexts = vec![context(
        account_config("research", 500_000, 500, Some("https://hook.example/w")),
        provider.clone(),
    )];

    store
        .upsert_instance(&discovered("i-1", "batch", 1, 1200), "research", T0)
        .await
        .unwrap();
    // Jump straight past two milestones (500 and 1000).
    store.add_cost("i-1", 1_200).await.unwrap();

    budget::run_budget_pass(&store, &contexts, &sink, &retry(), T0, false)
        .await
        .unwrap();
    assert_eq!(sink.milestone_count(), 2);

    // No crossing since the last evaluation: no new notifications.
    budget::run_budget_pass(&store, &contexts, &sink, &retry(), T0 + 300, false)
        .await
        .unwrap();
    assert_eq!(sink.milestone_count(), 2);

    // One more crossing, one more notification.
    store.add_cost("i-1", 400).await.unwrap();
    budget::run_budget_pass(&store, &contexts, &sink, &retry(), T0 + 600, false)
        .await
        .unwrap();
    assert_eq!(sink.milestone_count(), 3);
    assert_eq!(provider.terminated_ids().len(), 0);
}

#[tokio::test]
async fn budget_dry_run_terminates_nothing() {
    let store = Store::open_in_memory().await.unwrap();
    let provider = Arc::new(MockProvider::new());
    let sink = RecordingSink::default();
    let contexts = vec![context(
        account_config("research", 1_000, 100_000, None),
        provider.clone(),
    )];

    store
        .upsert_instance(&discovered("i-1", "batch", 1, 1200), "research", T0)
        .await
        .unwrap();
    store.add_cost("i-1", 2_000).await.unwrap();

    let summary = budget::run_budget_pass(&store, &contexts, &sink, &retry(), T0, true)
        .await
        .unwrap();
    assert_eq!(summary.terminations_requested, 1);
    assert!(provider.terminated_ids().is_empty());
}

// --- availability pass ---

#[tokio::test]
async fn availability_pass_accumulates_range_queryable_history() {
    let dir = TempDir::new().unwrap();
    let cfg = test_cfg(&dir);
    let store = Store::open_in_memory().await.unwrap();

    let provider = Arc::new(MockProvider::new());
    provider.set_offerings(vec![
        TypeOffering {
            name: "gpu_8x_a100".to_string(),
            description: "8x A100 (80 GB)".to_string(),
            price_cents_per_hour: 1200,
            gpu_count: 8,
            regions_with_capacity: vec!["us-west-1".to_string()],
        },
        TypeOffering {
            name: "gpu_1x_a10".to_string(),
            description: "1x A10 (24 GB)".to_string(),
            price_cents_per_hour: 75,
            gpu_count: 1,
            regions_with_capacity: vec!["us-west-1".to_string(), "us-east-1".to_string()],
        },
    ]);

    let contexts = vec![context(
        account_config("default", 500_000, 100_000, None),
        provider.clone(),
    )];

    let rows = availability::run_availability_pass(&store, &contexts, &cfg, &retry(), T0)
        .await
        .unwrap();
    assert_eq!(rows, 4);

    // Capacity shifts; both observations must survive side by side.
    provider.set_offerings(vec![TypeOffering {
        name: "gpu_8x_a100".to_string(),
        description: "8x A100 (80 GB)".to_string(),
        price_cents_per_hour: 1200,
        gpu_count: 8,
        regions_with_capacity: vec!["us-west-1".to_string()],
    }]);
    availability::run_availability_pass(&store, &contexts, &cfg, &retry(), T0 + 1800)
        .await
        .unwrap();

    let history = store
        .availability_range("gpu_8x_a100", "us-west-1", T0, T0 + HOUR)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].taken_at, T0);
    assert_eq!(history[1].taken_at, T0 + 1800);
    assert!(history.iter().all(|s| s.available));
}
