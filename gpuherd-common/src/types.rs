use serde::{Deserialize, Serialize};

// --- Enums ---

/// Derived per-cycle status of an instance. Never persisted: recomputed from
/// the current name and sample history on every evaluation, so renaming an
/// instance immediately changes its eligibility.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Active,      // Recent utilization above zero
    Idle,        // Latest sample all-zero, not yet past the idle threshold
    Protected,   // Would terminate, but still inside the minimum runtime
    Terminate,   // Idle past the threshold; terminate this cycle
    Whitelisted, // Name opts the instance out of idle termination
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Active => "active",
            InstanceStatus::Idle => "idle",
            InstanceStatus::Protected => "protected",
            InstanceStatus::Terminate => "terminate",
            InstanceStatus::Whitelisted => "whitelisted",
        }
    }
}

// --- Entities (SQLx Mapped) ---

/// One tracked cloud instance, keyed by the provider-assigned id.
/// `ended_at` is set when the provider stops reporting the instance; the row
/// is kept so the account's spend keeps counting terminated instances.
#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct Instance {
    pub id: String,
    pub account: String,
    pub name: String,
    pub ip: Option<String>,
    pub region: String,
    pub instance_type: String,
    pub gpu_count: i64,
    pub hourly_cost_cents: i64,
    pub ssh_key_name: Option<String>,
    pub launched_at: i64,
    pub first_seen: i64,
    pub last_seen: i64,
    pub cost_accrued_cents: i64,
    pub ended_at: Option<i64>,
}

impl Instance {
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Name-based opt-out from idle auto-termination.
    pub fn is_whitelisted(&self) -> bool {
        self.name.to_lowercase().contains("whitelist")
    }

    /// Name-based opt-out from budget-triggered termination.
    pub fn is_overbudget_allowed(&self) -> bool {
        self.name.to_lowercase().contains("overbudget")
    }
}

/// One utilization sample: per-GPU percentages plus the instance's cumulative
/// accrued cost at sampling time. Append-only, one per poll cycle.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct UtilizationSample {
    pub instance_id: String,
    pub taken_at: i64,
    pub per_gpu_percent: Vec<i64>,
    pub cost_accrued_cents: i64,
}

impl UtilizationSample {
    /// True when every GPU on the instance reports 0%.
    pub fn all_idle(&self) -> bool {
        !self.per_gpu_percent.is_empty() && self.per_gpu_percent.iter().all(|u| *u == 0)
    }
}

/// Point-in-time capacity observation for one (region, instance type) pair.
#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct AvailabilitySnapshot {
    pub taken_at: i64,
    pub region: String,
    pub instance_type: String,
    pub available: bool,
    pub price_cents: i64,
}

/// Resolved budget state for one account. `spent_cents` is always recomputed
/// from instance costs, never stored on its own.
#[derive(Debug, Clone)]
pub struct AccountBudget {
    pub account: String,
    pub limit_cents: i64,
    pub spent_cents: i64,
}

impl AccountBudget {
    pub fn is_breached(&self) -> bool {
        self.spent_cents >= self.limit_cents
    }

    pub fn remaining_cents(&self) -> i64 {
        self.limit_cents - self.spent_cents
    }
}

/// Format integer cents as a dollar string for logs and notifications.
pub fn format_money(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.abs();
    format!("{}${}.{:02}", sign, abs / 100, abs % 100)
}
