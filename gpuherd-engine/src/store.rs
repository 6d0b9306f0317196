use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};

use gpuherd_common::{AvailabilitySnapshot, FleetError, Instance, UtilizationSample};
use gpuherd_providers::inventory::DiscoveredInstance;

// Kept as individual statements: sqlite runs one statement per execute().
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS instances (
        id TEXT PRIMARY KEY,
        account TEXT NOT NULL,
        name TEXT NOT NULL,
        ip TEXT,
        region TEXT NOT NULL,
        instance_type TEXT NOT NULL,
        gpu_count INTEGER NOT NULL,
        hourly_cost_cents INTEGER NOT NULL,
        ssh_key_name TEXT,
        launched_at INTEGER NOT NULL,
        first_seen INTEGER NOT NULL,
        last_seen INTEGER NOT NULL,
        cost_accrued_cents INTEGER NOT NULL DEFAULT 0,
        ended_at INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS samples (
        instance_id TEXT NOT NULL,
        taken_at INTEGER NOT NULL,
        gpu_util TEXT NOT NULL,
        cost_accrued_cents INTEGER NOT NULL,
        PRIMARY KEY (instance_id, taken_at)
    )",
    "CREATE TABLE IF NOT EXISTS budget_notifications (
        account TEXT NOT NULL,
        threshold_cents INTEGER NOT NULL,
        kind TEXT NOT NULL,
        sent_at INTEGER NOT NULL,
        PRIMARY KEY (account, threshold_cents, kind)
    )",
    "CREATE TABLE IF NOT EXISTS availability (
        taken_at INTEGER NOT NULL,
        region TEXT NOT NULL,
        instance_type TEXT NOT NULL,
        available INTEGER NOT NULL,
        price_cents INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_availability_type_region_time
        ON availability (instance_type, region, taken_at)",
    "CREATE TABLE IF NOT EXISTS run_lock (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        holder TEXT NOT NULL,
        acquired_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS action_log (
        id TEXT PRIMARY KEY,
        action TEXT NOT NULL,
        account TEXT,
        instance_id TEXT,
        detail TEXT,
        created_at INTEGER NOT NULL
    )",
];

/// Durable fleet state: instance registry, utilization samples, budget
/// notification ledger, availability history, and the cycle lock.
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    pub async fn open(path: &Path) -> Result<Self, FleetError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        Self::connect(opts, 5).await
    }

    /// Private throwaway database for tests.
    pub async fn open_in_memory() -> Result<Self, FleetError> {
        let opts = SqliteConnectOptions::new().filename(":memory:");
        // A second connection to :memory: would see a different database.
        Self::connect(opts, 1).await
    }

    async fn connect(opts: SqliteConnectOptions, max_connections: u32) -> Result<Self, FleetError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    // --- cycle lock ---

    /// Claim the single-writer lock. A live holder wins; a holder older than
    /// `stale_after_secs` is presumed crashed and taken over.
    pub async fn acquire_lock(
        &self,
        holder: &str,
        now: i64,
        stale_after_secs: i64,
    ) -> Result<(), FleetError> {
        let res = sqlx::query(
            "INSERT INTO run_lock (id, holder, acquired_at) VALUES (1, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                holder = excluded.holder,
                acquired_at = excluded.acquired_at
             WHERE run_lock.acquired_at < ?",
        )
        .bind(holder)
        .bind(now)
        .bind(now - stale_after_secs)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(FleetError::LockContention);
        }
        Ok(())
    }

    /// Release the lock if we still hold it. A stale takeover by someone else
    /// makes this a no-op, which is the correct outcome.
    pub async fn release_lock(&self, holder: &str) -> Result<(), FleetError> {
        sqlx::query("DELETE FROM run_lock WHERE id = 1 AND holder = ?")
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- instances ---

    /// Insert on first observation, refresh on every later one. `first_seen`
    /// and `launched_at` are preserved across updates; a reappearing id is
    /// returned to the active fleet.
    pub async fn upsert_instance(
        &self,
        discovered: &DiscoveredInstance,
        account: &str,
        now: i64,
    ) -> Result<(), FleetError> {
        sqlx::query(
            "INSERT INTO instances
                (id, account, name, ip, region, instance_type, gpu_count,
                 hourly_cost_cents, ssh_key_name, launched_at, first_seen,
                 last_seen, cost_accrued_cents, ended_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, NULL)
             ON CONFLICT(id) DO UPDATE SET
                account = excluded.account,
                name = excluded.name,
                ip = excluded.ip,
                region = excluded.region,
                instance_type = excluded.instance_type,
                gpu_count = excluded.gpu_count,
                hourly_cost_cents = excluded.hourly_cost_cents,
                ssh_key_name = excluded.ssh_key_name,
                last_seen = excluded.last_seen,
                ended_at = NULL",
        )
        .bind(&discovered.id)
        .bind(account)
        .bind(&discovered.name)
        .bind(&discovered.ip)
        .bind(&discovered.region)
        .bind(&discovered.instance_type)
        .bind(discovered.gpu_count)
        .bind(discovered.hourly_cost_cents)
        .bind(discovered.ssh_key_names.first())
        .bind(discovered.launched_at.unwrap_or(now))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_instance(&self, id: &str) -> Result<Option<Instance>, FleetError> {
        let row = sqlx::query_as::<_, Instance>("SELECT * FROM instances WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Active fleet (not yet ended), optionally scoped to one account.
    pub async fn active_instances(
        &self,
        account: Option<&str>,
    ) -> Result<Vec<Instance>, FleetError> {
        let rows = match account {
            Some(account) => {
                sqlx::query_as::<_, Instance>(
                    "SELECT * FROM instances
                     WHERE ended_at IS NULL AND account = ?
                     ORDER BY name",
                )
                .bind(account)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Instance>(
                    "SELECT * FROM instances WHERE ended_at IS NULL ORDER BY name",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }

    /// Remove an instance from the active fleet. The row stays so the
    /// account's spend keeps counting it.
    pub async fn mark_ended(&self, id: &str, now: i64) -> Result<bool, FleetError> {
        let res = sqlx::query("UPDATE instances SET ended_at = ? WHERE id = ? AND ended_at IS NULL")
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Add incremental cost and return the new cumulative total. Callers pass
    /// non-negative deltas, which keeps the accrued cost monotone.
    pub async fn add_cost(&self, id: &str, delta_cents: i64) -> Result<i64, FleetError> {
        let total: i64 = sqlx::query_scalar(
            "UPDATE instances SET cost_accrued_cents = cost_accrued_cents + ?
             WHERE id = ?
             RETURNING cost_accrued_cents",
        )
        .bind(delta_cents.max(0))
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    // --- samples ---

    /// Append one sample. Samples are never mutated; a duplicate timestamp
    /// for the same instance is dropped rather than overwritten.
    pub async fn append_sample(
        &self,
        instance_id: &str,
        taken_at: i64,
        per_gpu_percent: &[i64],
        cost_accrued_cents: i64,
    ) -> Result<(), FleetError> {
        let gpu_util = serde_json::to_string(per_gpu_percent).unwrap_or_else(|_| "[]".to_string());
        sqlx::query(
            "INSERT INTO samples (instance_id, taken_at, gpu_util, cost_accrued_cents)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(instance_id, taken_at) DO NOTHING",
        )
        .bind(instance_id)
        .bind(taken_at)
        .bind(gpu_util)
        .bind(cost_accrued_cents)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Samples newer than `since`, ascending by time.
    pub async fn samples_since(
        &self,
        instance_id: &str,
        since: i64,
    ) -> Result<Vec<UtilizationSample>, FleetError> {
        let rows: Vec<(String, i64, String, i64)> = sqlx::query_as(
            "SELECT instance_id, taken_at, gpu_util, cost_accrued_cents
             FROM samples
             WHERE instance_id = ? AND taken_at > ?
             ORDER BY taken_at",
        )
        .bind(instance_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(sample_from_row).collect())
    }

    pub async fn latest_sample(
        &self,
        instance_id: &str,
    ) -> Result<Option<UtilizationSample>, FleetError> {
        let row: Option<(String, i64, String, i64)> = sqlx::query_as(
            "SELECT instance_id, taken_at, gpu_util, cost_accrued_cents
             FROM samples
             WHERE instance_id = ?
             ORDER BY taken_at DESC
             LIMIT 1",
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(sample_from_row))
    }

    pub async fn prune_samples(&self, older_than: i64) -> Result<u64, FleetError> {
        let res = sqlx::query("DELETE FROM samples WHERE taken_at < ?")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    // --- budget ledger ---

    /// Spend is always derived: the sum of accrued cost over every instance
    /// row tied to the account, ended ones included.
    pub async fn account_spend(&self, account: &str) -> Result<i64, FleetError> {
        let spent: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(cost_accrued_cents), 0) FROM instances WHERE account = ?",
        )
        .bind(account)
        .fetch_one(&self.pool)
        .await?;
        Ok(spent)
    }

    pub async fn notification_recorded(
        &self,
        account: &str,
        threshold_cents: i64,
        kind: &str,
    ) -> Result<bool, FleetError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(
                SELECT 1 FROM budget_notifications
                WHERE account = ? AND threshold_cents = ? AND kind = ?
            )",
        )
        .bind(account)
        .bind(threshold_cents)
        .bind(kind)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    pub async fn record_notification(
        &self,
        account: &str,
        threshold_cents: i64,
        kind: &str,
        now: i64,
    ) -> Result<(), FleetError> {
        sqlx::query(
            "INSERT INTO budget_notifications (account, threshold_cents, kind, sent_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(account, threshold_cents, kind) DO NOTHING",
        )
        .bind(account)
        .bind(threshold_cents)
        .bind(kind)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- availability ---

    pub async fn append_availability(
        &self,
        snapshots: &[AvailabilitySnapshot],
    ) -> Result<(), FleetError> {
        for snap in snapshots {
            sqlx::query(
                "INSERT INTO availability (taken_at, region, instance_type, available, price_cents)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(snap.taken_at)
            .bind(&snap.region)
            .bind(&snap.instance_type)
            .bind(snap.available)
            .bind(snap.price_cents)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn availability_range(
        &self,
        instance_type: &str,
        region: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<AvailabilitySnapshot>, FleetError> {
        let rows = sqlx::query_as::<_, AvailabilitySnapshot>(
            "SELECT taken_at, region, instance_type, available, price_cents
             FROM availability
             WHERE instance_type = ? AND region = ? AND taken_at >= ? AND taken_at <= ?
             ORDER BY taken_at",
        )
        .bind(instance_type)
        .bind(region)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn prune_availability(&self, older_than: i64) -> Result<u64, FleetError> {
        let res = sqlx::query("DELETE FROM availability WHERE taken_at < ?")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    // --- action log ---

    /// Persist one fleet-mutating decision so it can be reconstructed later.
    pub async fn log_action(
        &self,
        action: &str,
        account: Option<&str>,
        instance_id: Option<&str>,
        detail: Option<&str>,
        now: i64,
    ) -> Result<(), FleetError> {
        sqlx::query(
            "INSERT INTO action_log (id, action, account, instance_id, detail, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(action)
        .bind(account)
        .bind(instance_id)
        .bind(detail)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn sample_from_row((instance_id, taken_at, gpu_util, cost_accrued_cents): (String, i64, String, i64)) -> UtilizationSample {
    UtilizationSample {
        instance_id,
        taken_at,
        per_gpu_percent: serde_json::from_str(&gpu_util).unwrap_or_default(),
        cost_accrued_cents,
    }
}
