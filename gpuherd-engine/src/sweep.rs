use tracing::{info, warn};

use gpuherd_common::{FleetError, InstanceStatus, PolicySettings, RetryPolicy};
use gpuherd_providers::with_retry;

use crate::policy;
use crate::store::Store;
use crate::AccountContext;

#[derive(Debug, Default)]
pub struct SweepSummary {
    pub evaluated: usize,
    pub terminations_requested: usize,
    pub terminations_rejected: usize,
}

/// Policy pass: recompute every active instance's status from its current
/// name and sample history, and request termination for the ones that
/// qualified. Termination is fire-and-forget: the instance disappears from
/// a later collector listing, and a rejected request simply recurs next
/// cycle because status is never cached.
pub async fn run_sweep_pass(
    store: &Store,
    contexts: &[AccountContext],
    settings: &PolicySettings,
    retry: &RetryPolicy,
    now: i64,
    dry_run: bool,
) -> Result<SweepSummary, FleetError> {
    let mut summary = SweepSummary::default();

    // Enough history to decide: the idle window plus the gap tolerance.
    let since = now - settings.idle_shutdown_secs - 2 * settings.poll_interval_secs;

    for ctx in contexts {
        let account = ctx.config.name.as_str();

        for instance in store.active_instances(Some(account)).await? {
            let samples = store.samples_since(&instance.id, since).await?;
            let status = policy::decide(&instance, &samples, now, settings);
            summary.evaluated += 1;

            info!(
                account,
                instance = %instance.id,
                name = %instance.name,
                status = status.as_str(),
                cycle = now,
                "evaluated"
            );

            if status != InstanceStatus::Terminate {
                continue;
            }

            if dry_run {
                info!(account, instance = %instance.id, name = %instance.name, "would terminate (idle)");
                summary.terminations_requested += 1;
                continue;
            }

            let ids = [instance.id.clone()];
            match with_retry(retry, "terminate_instances", || {
                ctx.provider.terminate_instances(&ids)
            })
            .await
            {
                Ok(accepted) if accepted.contains(&instance.id) => {
                    info!(account, instance = %instance.id, name = %instance.name, "termination requested (idle)");
                    store
                        .log_action(
                            "idle_terminate",
                            Some(account),
                            Some(&instance.id),
                            Some(&format!("name={}", instance.name)),
                            now,
                        )
                        .await?;
                    summary.terminations_requested += 1;
                }
                Ok(_) => {
                    // Stays flagged Terminate; retried next cycle.
                    let err = FleetError::TerminationFailure {
                        instance: instance.id.clone(),
                        detail: "provider did not accept the request".to_string(),
                    };
                    warn!(account, cycle = now, "{}", err);
                    summary.terminations_rejected += 1;
                }
                Err(e) => {
                    warn!(
                        account,
                        instance = %instance.id,
                        cycle = now,
                        "terminate call failed, will retry next cycle: {:#}",
                        e
                    );
                    summary.terminations_rejected += 1;
                }
            }
        }
    }

    Ok(summary)
}
