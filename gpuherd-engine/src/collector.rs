use std::collections::HashSet;

use tracing::{debug, info, warn};

use gpuherd_common::{FleetError, GlobalConfig, RetryPolicy};
use gpuherd_providers::with_retry;

use crate::ssh_config::{self, SshSettings};
use crate::store::Store;
use crate::AccountContext;

#[derive(Debug, Default)]
pub struct MonitorSummary {
    pub accounts_ok: usize,
    pub accounts_failed: usize,
    pub instances_seen: usize,
    pub samples_written: usize,
    pub instances_ended: usize,
    pub ssh_entries: usize,
}

/// One polling pass: upsert instance state and append one utilization sample
/// per active instance, stamp instances the provider stopped reporting, then
/// rewrite the managed SSH block. Partial failure never aborts the pass: a
/// bad instance or a whole unreachable account is skipped for this cycle.
pub async fn run_monitor_pass(
    store: &Store,
    contexts: &[AccountContext],
    cfg: &GlobalConfig,
    retry: &RetryPolicy,
    now: i64,
) -> Result<MonitorSummary, FleetError> {
    let mut summary = MonitorSummary::default();

    for ctx in contexts {
        let account = ctx.config.name.as_str();

        let listed = match with_retry(retry, "list_instances", || ctx.provider.list_instances())
            .await
        {
            Ok(listed) => listed,
            Err(e) => {
                // Unknown this cycle: nothing is sampled and nothing is
                // marked ended, because absence was not observed.
                warn!(account, cycle = now, "provider unavailable, skipping account: {:#}", e);
                summary.accounts_failed += 1;
                continue;
            }
        };

        let known_before: Vec<String> = store
            .active_instances(Some(account))
            .await?
            .into_iter()
            .map(|inst| inst.id)
            .collect();
        let listed_ids: HashSet<&str> = listed.iter().map(|d| d.id.as_str()).collect();

        for discovered in &listed {
            store.upsert_instance(discovered, account, now).await?;
            summary.instances_seen += 1;

            let utilization = match with_retry(retry, "gpu_utilization", || {
                ctx.provider.gpu_utilization(discovered)
            })
            .await
            {
                Ok(utilization) => utilization,
                Err(e) => {
                    warn!(
                        account,
                        instance = %discovered.id,
                        cycle = now,
                        "utilization read failed, no sample this cycle: {:#}",
                        e
                    );
                    continue;
                }
            };

            // Incremental cost since the last sample. The clamp keeps a
            // polling outage from billing hours into one sample; the
            // provider's invoice is authoritative across outages.
            let elapsed = match store.latest_sample(&discovered.id).await? {
                Some(last) => now - last.taken_at,
                None => cfg.poll_interval_secs,
            }
            .clamp(0, 2 * cfg.poll_interval_secs);
            let delta_cents = discovered.hourly_cost_cents * elapsed / 3600;

            let total_cents = store.add_cost(&discovered.id, delta_cents).await?;
            store
                .append_sample(&discovered.id, now, &utilization, total_cents)
                .await?;
            summary.samples_written += 1;

            debug!(
                account,
                instance = %discovered.id,
                utilization = ?utilization,
                accrued_cents = total_cents,
                "sampled"
            );
        }

        // Listing succeeded, so absence is real: instances the provider no
        // longer reports leave the active fleet.
        for id in known_before {
            if !listed_ids.contains(id.as_str()) {
                if store.mark_ended(&id, now).await? {
                    info!(account, instance = %id, "no longer reported by provider, marking ended");
                    store
                        .log_action("instance_ended", Some(account), Some(&id), None, now)
                        .await?;
                    summary.instances_ended += 1;
                }
            }
        }

        summary.accounts_ok += 1;
    }

    // SSH config reflects the whole active fleet, accounts that failed this
    // cycle included (their instances are stale, not gone).
    let active = store.active_instances(None).await?;
    let settings = SshSettings {
        user: cfg.ssh_user.clone(),
        keys_dir: cfg.ssh_keys_dir.clone(),
    };
    let block = ssh_config::render_managed_block(&active, &settings);
    let changed = ssh_config::sync_managed_block(&cfg.ssh_config_path, &block)?;
    summary.ssh_entries = active
        .iter()
        .filter(|inst| inst.ip.as_deref().is_some_and(|ip| !ip.trim().is_empty()))
        .count();
    info!(
        entries = summary.ssh_entries,
        changed,
        path = %cfg.ssh_config_path.display(),
        "ssh config synced"
    );

    let pruned = store
        .prune_samples(now - cfg.sample_retention_hours * 3600)
        .await?;
    if pruned > 0 {
        debug!(pruned, "pruned old samples");
    }

    Ok(summary)
}
