pub mod availability;
pub mod budget;
pub mod collector;
pub mod notify;
pub mod policy;
pub mod ssh_config;
pub mod store;
pub mod sweep;

use std::sync::Arc;

use gpuherd_common::config::AccountConfig;
use gpuherd_providers::CloudProvider;

/// One configured account paired with its provider client. Passes iterate
/// these; a failure on one never aborts the others.
pub struct AccountContext {
    pub config: AccountConfig,
    pub provider: Arc<dyn CloudProvider>,
}
