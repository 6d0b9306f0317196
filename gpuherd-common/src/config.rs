use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::FleetError;

/// Global engine configuration, read from the environment (a `config.env`
/// loaded via dotenv by the binary). Budget limits are in integer cents.
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub db_path: PathBuf,
    pub accounts_path: PathBuf,
    pub min_runtime_hours: f64,
    pub idle_shutdown_hours: f64,
    pub poll_interval_secs: i64,
    pub sample_retention_hours: i64,
    pub availability_retention_hours: i64,
    pub ssh_config_path: PathBuf,
    pub ssh_user: String,
    pub ssh_keys_dir: PathBuf,
    /// Private key the utilization probe presents; None lets ssh pick.
    pub ssh_identity: Option<PathBuf>,
    /// Consumed by the external backup cron, not by the engine itself.
    pub backup_dir: PathBuf,
    pub budget_limit_default_cents: i64,
    pub budget_milestone_interval_cents: i64,
    pub lock_stale_secs: i64,
}

/// The subset of config the pure policy function needs, in seconds.
#[derive(Debug, Clone, Copy)]
pub struct PolicySettings {
    pub min_runtime_secs: i64,
    pub idle_shutdown_secs: i64,
    pub poll_interval_secs: i64,
}

/// One account with resolved settings: the `"default"` limit sentinel and
/// missing fields are already folded in.
#[derive(Debug, Clone)]
pub struct AccountConfig {
    pub name: String,
    pub api_key: String,
    pub limit_cents: i64,
    pub milestone_interval_cents: i64,
    pub discord_webhook: Option<String>,
}

/// Accounts that survived resolution plus the ones skipped for bad config,
/// so the caller can log them loudly and carry on.
#[derive(Debug, Default)]
pub struct ResolvedAccounts {
    pub accounts: Vec<AccountConfig>,
    pub skipped: Vec<(String, String)>,
}

impl GlobalConfig {
    pub fn from_env() -> Result<Self, FleetError> {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Ok(Self {
            db_path: env_path("GPUHERD_DB_PATH", "data/state.db"),
            accounts_path: env_path("GPUHERD_ACCOUNTS_PATH", "data/accounts.toml"),
            min_runtime_hours: env_parse("MIN_RUNTIME_HOURS", 4.0)?,
            idle_shutdown_hours: env_parse("IDLE_SHUTDOWN_HOURS", 2.0)?,
            poll_interval_secs: env_parse("POLL_INTERVAL_SECS", 60)?,
            sample_retention_hours: env_parse("SAMPLE_RETENTION_HOURS", 168)?,
            availability_retention_hours: env_parse("AVAILABILITY_RETENTION_HOURS", 168)?,
            ssh_config_path: env_path("SSH_CONFIG_PATH", &format!("{}/.ssh/config", home)),
            ssh_user: std::env::var("SSH_USER").unwrap_or_else(|_| "ubuntu".to_string()),
            ssh_keys_dir: env_path("SSH_KEYS_DIR", &format!("{}/.ssh", home)),
            ssh_identity: std::env::var("SSH_KEY_PATH").ok().map(PathBuf::from),
            backup_dir: env_path("BACKUP_DIR", "data/backups"),
            budget_limit_default_cents: env_parse("BUDGET_LIMIT_DEFAULT", 500_000)?,
            budget_milestone_interval_cents: env_parse("BUDGET_MILESTONE_INTERVAL", 100_000)?,
            lock_stale_secs: env_parse("LOCK_STALE_SECS", 600)?,
        })
    }

    pub fn policy(&self) -> PolicySettings {
        PolicySettings {
            min_runtime_secs: (self.min_runtime_hours * 3600.0) as i64,
            idle_shutdown_secs: (self.idle_shutdown_hours * 3600.0) as i64,
            poll_interval_secs: self.poll_interval_secs,
        }
    }
}

fn env_path(key: &str, default: &str) -> PathBuf {
    PathBuf::from(std::env::var(key).unwrap_or_else(|_| default.to_string()))
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, FleetError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| FleetError::config(format!("{} has invalid value '{}'", key, raw))),
        Err(_) => Ok(default),
    }
}

// --- accounts.toml ---
//
// [defaults]
// limit_cents = 500000
// milestone_interval_cents = 100000
//
// [accounts.research]
// api_key = "secret_..."
// limit_cents = 250000          # integer cents, or the string "default"
// discord_webhook = "https://discord.com/api/webhooks/..."

#[derive(Debug, Deserialize, Default)]
struct RawAccountsFile {
    #[serde(default)]
    defaults: RawDefaults,
    #[serde(default)]
    accounts: BTreeMap<String, RawAccount>,
}

#[derive(Debug, Deserialize, Default)]
struct RawDefaults {
    limit_cents: Option<i64>,
    milestone_interval_cents: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RawAccount {
    api_key: Option<String>,
    limit_cents: Option<LimitSpec>,
    discord_webhook: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LimitSpec {
    Cents(i64),
    Sentinel(String),
}

/// Load and resolve the accounts file. A missing file with `API_KEY` set in
/// the environment synthesizes a single "default" account, so single-account
/// setups need no accounts file at all.
pub fn load_accounts(path: &Path, global: &GlobalConfig) -> Result<ResolvedAccounts, FleetError> {
    let raw: RawAccountsFile = if path.exists() {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| FleetError::config(format!("{}: {}", path.display(), e)))?
    } else {
        RawAccountsFile::default()
    };

    let mut resolved = resolve_accounts(raw, global);

    if resolved.accounts.is_empty() && resolved.skipped.is_empty() {
        if let Ok(key) = std::env::var("API_KEY") {
            let key = key.trim().to_string();
            if !key.is_empty() {
                resolved.accounts.push(AccountConfig {
                    name: "default".to_string(),
                    api_key: key,
                    limit_cents: global.budget_limit_default_cents,
                    milestone_interval_cents: global.budget_milestone_interval_cents,
                    discord_webhook: None,
                });
            }
        }
    }

    Ok(resolved)
}

fn resolve_accounts(raw: RawAccountsFile, global: &GlobalConfig) -> ResolvedAccounts {
    let default_limit = raw
        .defaults
        .limit_cents
        .unwrap_or(global.budget_limit_default_cents);
    let milestone_interval = raw
        .defaults
        .milestone_interval_cents
        .unwrap_or(global.budget_milestone_interval_cents);

    let mut resolved = ResolvedAccounts::default();

    for (name, account) in raw.accounts {
        let api_key = match account.api_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => {
                resolved.skipped.push((name, "missing api_key".to_string()));
                continue;
            }
        };

        let limit_cents = match account.limit_cents {
            None => default_limit,
            Some(LimitSpec::Cents(cents)) if cents > 0 => cents,
            Some(LimitSpec::Cents(cents)) => {
                resolved
                    .skipped
                    .push((name, format!("non-positive limit_cents {}", cents)));
                continue;
            }
            Some(LimitSpec::Sentinel(s)) if s == "default" => default_limit,
            Some(LimitSpec::Sentinel(s)) => {
                resolved
                    .skipped
                    .push((name, format!("unrecognized limit_cents '{}'", s)));
                continue;
            }
        };

        resolved.accounts.push(AccountConfig {
            name,
            api_key,
            limit_cents,
            milestone_interval_cents: milestone_interval,
            discord_webhook: account
                .discord_webhook
                .filter(|url| !url.trim().is_empty()),
        });
    }

    resolved
}
