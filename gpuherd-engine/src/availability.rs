use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use gpuherd_common::{AvailabilitySnapshot, FleetError, GlobalConfig, RetryPolicy};
use gpuherd_providers::inventory::TypeOffering;
use gpuherd_providers::with_retry;

use crate::store::Store;
use crate::AccountContext;

/// Availability pass: snapshot the provider catalog into append-only
/// (type, region) rows. The catalog is account-independent, so the first
/// configured account's client is used. An unreachable catalog records
/// nothing this cycle and is retried on the next scheduled invocation.
pub async fn run_availability_pass(
    store: &Store,
    contexts: &[AccountContext],
    cfg: &GlobalConfig,
    retry: &RetryPolicy,
    now: i64,
) -> Result<usize, FleetError> {
    let Some(ctx) = contexts.first() else {
        return Err(FleetError::config("no accounts configured"));
    };

    let offerings = match with_retry(retry, "list_instance_types", || {
        ctx.provider.list_instance_types()
    })
    .await
    {
        Ok(offerings) => offerings,
        Err(e) => {
            warn!(cycle = now, "catalog unavailable, nothing recorded: {:#}", e);
            return Ok(0);
        }
    };

    let snapshots = snapshot_catalog(&offerings, now);
    store.append_availability(&snapshots).await?;
    info!(
        types = offerings.len(),
        rows = snapshots.len(),
        "availability recorded"
    );

    let pruned = store
        .prune_availability(now - cfg.availability_retention_hours * 3600)
        .await?;
    if pruned > 0 {
        debug!(pruned, "pruned old availability rows");
    }

    Ok(snapshots.len())
}

/// One row per (type, region) pair. The catalog only names regions that have
/// capacity, so the region universe for `available = false` rows is the union
/// of regions seen anywhere in this same response.
pub fn snapshot_catalog(offerings: &[TypeOffering], now: i64) -> Vec<AvailabilitySnapshot> {
    let universe: BTreeSet<&str> = offerings
        .iter()
        .flat_map(|o| o.regions_with_capacity.iter().map(String::as_str))
        .collect();

    let mut snapshots = Vec::new();
    for offering in offerings {
        for region in &universe {
            snapshots.push(AvailabilitySnapshot {
                taken_at: now,
                region: (*region).to_string(),
                instance_type: offering.name.clone(),
                available: offering
                    .regions_with_capacity
                    .iter()
                    .any(|r| r == region),
                price_cents: offering.price_cents_per_hour,
            });
        }
    }
    snapshots
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offering(name: &str, price: i64, regions: &[&str]) -> TypeOffering {
        TypeOffering {
            name: name.to_string(),
            description: name.to_string(),
            price_cents_per_hour: price,
            gpu_count: 8,
            regions_with_capacity: regions.iter().map(|r| r.to_string()).collect(),
        }
    }

    #[test]
    fn unavailable_regions_come_from_the_observed_universe() {
        let offerings = vec![
            offering("gpu_8x_a100", 1200, &["us-west-1"]),
            offering("gpu_1x_a10", 75, &["us-west-1", "us-east-1"]),
        ];
        let snapshots = snapshot_catalog(&offerings, 100);

        // 2 types x 2 observed regions.
        assert_eq!(snapshots.len(), 4);
        let a100_east = snapshots
            .iter()
            .find(|s| s.instance_type == "gpu_8x_a100" && s.region == "us-east-1")
            .unwrap();
        assert!(!a100_east.available);
        let a100_west = snapshots
            .iter()
            .find(|s| s.instance_type == "gpu_8x_a100" && s.region == "us-west-1")
            .unwrap();
        assert!(a100_west.available);
        assert_eq!(a100_west.price_cents, 1200);
    }

    #[test]
    fn empty_catalog_records_nothing() {
        assert!(snapshot_catalog(&[], 100).is_empty());
        // A type with no capacity anywhere contributes no region universe.
        let offerings = vec![offering("gpu_8x_h100", 2000, &[])];
        assert!(snapshot_catalog(&offerings, 100).is_empty());
    }
}
