use tracing::{info, warn};

use gpuherd_common::types::format_money;
use gpuherd_common::{AccountBudget, FleetError, RetryPolicy};
use gpuherd_providers::with_retry;

use crate::notify::{send_budget_notification, NotificationSink};
use crate::store::Store;
use crate::AccountContext;

const KIND_MILESTONE: &str = "milestone";
const KIND_BREACH: &str = "breach";

#[derive(Debug, Default)]
pub struct BudgetSummary {
    pub accounts_evaluated: usize,
    pub milestones_notified: usize,
    pub breaches: usize,
    pub terminations_requested: usize,
}

/// Budget pass: recompute each account's spend from the store, notify newly
/// crossed milestones exactly once, and on breach terminate everything not
/// carrying the OVERBUDGET name override. Spend is read from the store, so
/// the pass always acts on the latest completed collector aggregation.
pub async fn run_budget_pass(
    store: &Store,
    contexts: &[AccountContext],
    sink: &dyn NotificationSink,
    retry: &RetryPolicy,
    now: i64,
    dry_run: bool,
) -> Result<BudgetSummary, FleetError> {
    let mut summary = BudgetSummary::default();

    for ctx in contexts {
        match evaluate_account(store, ctx, sink, retry, now, dry_run, &mut summary).await {
            Ok(()) => summary.accounts_evaluated += 1,
            Err(e) => {
                // One account's failure never blocks enforcement on the rest.
                warn!(account = %ctx.config.name, cycle = now, "budget evaluation failed: {}", e);
            }
        }
    }

    Ok(summary)
}

async fn evaluate_account(
    store: &Store,
    ctx: &AccountContext,
    sink: &dyn NotificationSink,
    retry: &RetryPolicy,
    now: i64,
    dry_run: bool,
    summary: &mut BudgetSummary,
) -> Result<(), FleetError> {
    let account = ctx.config.name.as_str();
    let webhook = ctx.config.discord_webhook.as_deref();

    let budget = AccountBudget {
        account: account.to_string(),
        limit_cents: ctx.config.limit_cents,
        spent_cents: store.account_spend(account).await?,
    };

    info!(
        account,
        spent = %format_money(budget.spent_cents),
        limit = %format_money(budget.limit_cents),
        "budget evaluated"
    );

    notify_crossed_milestones(store, ctx, sink, &budget, now, summary).await?;

    if !budget.is_breached() {
        let remaining = budget.remaining_cents();
        if budget.limit_cents > 0 && remaining * 5 < budget.limit_cents {
            warn!(
                account,
                remaining = %format_money(remaining),
                "less than 20% of budget remaining"
            );
        }
        return Ok(());
    }

    // Breach. One notification per breach event, keyed by the limit in
    // force, never one per instance. Missing webhook suppresses the
    // notification but not the enforcement below.
    summary.breaches += 1;
    info!(
        account,
        over_by = %format_money(budget.spent_cents - budget.limit_cents),
        "over budget, enforcing"
    );

    if let Some(webhook) = webhook {
        if !store
            .notification_recorded(account, budget.limit_cents, KIND_BREACH)
            .await?
        {
            if send_budget_notification(sink, webhook, &budget, true, now).await {
                store
                    .record_notification(account, budget.limit_cents, KIND_BREACH, now)
                    .await?;
            }
        }
    }

    for instance in store.active_instances(Some(account)).await? {
        if instance.is_overbudget_allowed() {
            info!(account, instance = %instance.id, name = %instance.name, "has OVERBUDGET in name, sparing");
            continue;
        }

        if dry_run {
            info!(account, instance = %instance.id, name = %instance.name, "would terminate (over budget)");
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
                info!(account, instance = %instance.id, name = %instance.name, "termination requested (over budget)");
                store
                    .log_action(
                        "budget_terminate",
                        Some(account),
                        Some(&instance.id),
                        Some(&format!(
                            "name={} spent={} limit={}",
                            instance.name,
                            format_money(budget.spent_cents),
                            format_money(budget.limit_cents)
                        )),
                        now,
                    )
                    .await?;
                summary.terminations_requested += 1;
            }
            Ok(_) => {
                let err = FleetError::TerminationFailure {
                    instance: instance.id.clone(),
                    detail: "provider did not accept the request".to_string(),
                };
                warn!(account, cycle = now, "{}", err);
            }
            Err(e) => {
                warn!(
                    account,
                    instance = %instance.id,
                    cycle = now,
                    "terminate call failed, will retry next cycle: {:#}",
                    e
                );
            }
        }
    }

    Ok(())
}

/// Notify every milestone boundary crossed so far that has not been notified
/// yet. Recording happens only after a successful send, so a failed delivery
/// retries on the next evaluation; between crossings this is a no-op.
async fn notify_crossed_milestones(
    store: &Store,
    ctx: &AccountContext,
    sink: &dyn NotificationSink,
    budget: &AccountBudget,
    now: i64,
    summary: &mut BudgetSummary,
) -> Result<(), FleetError> {
    let Some(webhook) = ctx.config.discord_webhook.as_deref() else {
        return Ok(());
    };
    let interval = ctx.config.milestone_interval_cents;
    if interval <= 0 {
        return Ok(());
    }

    let mut milestone = interval;
    while milestone <= budget.spent_cents {
        if !store
            .notification_recorded(&budget.account, milestone, KIND_MILESTONE)
            .await?
        {
            info!(
                account = %budget.account,
                milestone = %format_money(milestone),
                "spending milestone crossed"
            );
            if send_budget_notification(sink, webhook, budget, budget.is_breached(), now).await {
                store
                    .record_notification(&budget.account, milestone, KIND_MILESTONE, now)
                    .await?;
                summary.milestones_notified += 1;
            }
        }
        milestone += interval;
    }

    Ok(())
}
