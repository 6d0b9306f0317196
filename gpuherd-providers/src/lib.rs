use anyhow::Result;
use async_trait::async_trait;

use gpuherd_common::RetryPolicy;

/// A GPU cloud provider scoped to one account (the client carries the
/// account's API key). Termination is fire-and-forget: a successful call
/// means the request was accepted, not that the instance is gone; the next
/// collector pass observes the disappearance.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Currently active instances on the account.
    async fn list_instances(&self) -> Result<Vec<inventory::DiscoveredInstance>>;

    /// Catalog of instance types with pricing and per-region capacity.
    async fn list_instance_types(&self) -> Result<Vec<inventory::TypeOffering>>;

    /// Request termination. Returns the ids the provider accepted; an id
    /// missing from the result was rejected and should be retried next cycle.
    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<Vec<String>>;

    /// Current per-GPU utilization percentages, one entry per GPU. The array
    /// is opaque to callers; how it is read is the provider's business.
    async fn gpu_utilization(&self, instance: &inventory::DiscoveredInstance) -> Result<Vec<i64>>;
}

pub mod inventory {
    #[derive(Clone, Debug)]
    pub struct DiscoveredInstance {
        pub id: String,
        pub name: String,
        pub ip: Option<String>,
        pub region: String,
        pub instance_type: String,
        pub gpu_count: i64,
        pub hourly_cost_cents: i64,
        pub ssh_key_names: Vec<String>,
        pub launched_at: Option<i64>,
    }

    #[derive(Clone, Debug)]
    pub struct TypeOffering {
        pub name: String,
        pub description: String,
        pub price_cents_per_hour: i64,
        pub gpu_count: i64,
        pub regions_with_capacity: Vec<String>,
    }
}

/// Run a provider call under the given retry policy. Failures short of the
/// attempt budget back off and retry; the final error is surfaced to the
/// caller, which treats the entity as unknown for this cycle.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_err = None;

    for attempt in 1..=max_attempts {
        let delay = policy.delay_before(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::warn!(attempt, max_attempts, "{} failed: {:#}", label, e);
                last_err = Some(e);
            }
        }
    }

    Err(last_err.expect("at least one attempt was made"))
}

#[cfg(feature = "lambda")]
pub mod lambda;

#[cfg(feature = "mock")]
pub mod mock;
