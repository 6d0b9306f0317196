use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use gpuherd_common::RetryPolicy;

use crate::{inventory, CloudProvider};

const BASE_URL: &str = "https://cloud.lambda.ai/api/v1";
const SSH_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Lambda Cloud client for one account. Utilization is not exposed by the
/// HTTP API, so it is probed over SSH with `nvidia-smi` using the control
/// host's key material.
pub struct LambdaProvider {
    client: Client,
    api_key: String,
    ssh_user: String,
    ssh_identity: Option<PathBuf>,
}

impl LambdaProvider {
    pub fn new(
        api_key: String,
        ssh_user: String,
        ssh_identity: Option<PathBuf>,
        policy: &RetryPolicy,
    ) -> Result<Self> {
        // Without an overall timeout a stalled API call can hang a cron pass
        // past its cadence.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(policy.timeout)
            .build()?;
        Ok(Self {
            client,
            api_key: api_key.trim().to_string(),
            ssh_user,
            ssh_identity,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        let url = format!("{}{}", BASE_URL, endpoint);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("GET {} failed: status={} body={}", endpoint, status, body);
        }
        Ok(resp.json::<T>().await?)
    }
}

// --- wire types ---

#[derive(Deserialize)]
struct ListInstancesResponse {
    #[serde(default)]
    data: Vec<ApiInstance>,
}

#[derive(Deserialize)]
struct ApiInstance {
    id: String,
    name: Option<String>,
    ip: Option<String>,
    status: Option<String>,
    region: Option<ApiName>,
    instance_type: Option<ApiInstanceType>,
    #[serde(default)]
    ssh_key_names: Vec<String>,
}

#[derive(Deserialize)]
struct ApiName {
    name: String,
}

#[derive(Deserialize)]
struct ApiInstanceType {
    name: String,
    description: Option<String>,
    price_cents_per_hour: Option<i64>,
    specs: Option<ApiSpecs>,
}

#[derive(Deserialize)]
struct ApiSpecs {
    gpus: Option<i64>,
}

#[derive(Deserialize)]
struct TypesResponse {
    #[serde(default)]
    data: BTreeMap<String, ApiTypeEntry>,
}

#[derive(Deserialize)]
struct ApiTypeEntry {
    instance_type: Option<ApiInstanceType>,
    #[serde(default)]
    regions_with_capacity_available: Vec<ApiName>,
}

#[derive(Deserialize)]
struct TerminateResponse {
    data: TerminateData,
}

#[derive(Deserialize)]
struct TerminateData {
    #[serde(default)]
    terminated_instances: Vec<ApiTerminated>,
}

#[derive(Deserialize)]
struct ApiTerminated {
    id: String,
}

#[async_trait]
impl CloudProvider for LambdaProvider {
    async fn list_instances(&self) -> Result<Vec<inventory::DiscoveredInstance>> {
        let resp: ListInstancesResponse = self.get_json("/instances").await?;

        Ok(resp
            .data
            .into_iter()
            .filter(|inst| inst.status.as_deref() == Some("active"))
            .map(|inst| {
                let itype = inst.instance_type.as_ref();
                inventory::DiscoveredInstance {
                    name: inst
                        .name
                        .clone()
                        .filter(|n| !n.trim().is_empty())
                        .unwrap_or_else(|| format!("lambda-{}", &inst.id[..inst.id.len().min(8)])),
                    ip: inst.ip,
                    region: inst.region.map(|r| r.name).unwrap_or_default(),
                    instance_type: itype.map(|t| t.name.clone()).unwrap_or_default(),
                    gpu_count: itype
                        .and_then(|t| t.specs.as_ref())
                        .and_then(|s| s.gpus)
                        .unwrap_or(0),
                    hourly_cost_cents: itype.and_then(|t| t.price_cents_per_hour).unwrap_or(0),
                    ssh_key_names: inst.ssh_key_names,
                    // The API does not report launch time; first observation
                    // stands in for it downstream.
                    launched_at: None,
                    id: inst.id,
                }
            })
            .collect())
    }

    async fn list_instance_types(&self) -> Result<Vec<inventory::TypeOffering>> {
        let resp: TypesResponse = self.get_json("/instance-types").await?;

        Ok(resp
            .data
            .into_iter()
            .map(|(name, entry)| {
                let itype = entry.instance_type.as_ref();
                inventory::TypeOffering {
                    description: itype
                        .and_then(|t| t.description.clone())
                        .unwrap_or_else(|| name.clone()),
                    price_cents_per_hour: itype.and_then(|t| t.price_cents_per_hour).unwrap_or(0),
                    gpu_count: itype
                        .and_then(|t| t.specs.as_ref())
                        .and_then(|s| s.gpus)
                        .unwrap_or(0),
                    regions_with_capacity: entry
                        .regions_with_capacity_available
                        .into_iter()
                        .map(|r| r.name)
                        .collect(),
                    name,
                }
            })
            .collect())
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<Vec<String>> {
        if instance_ids.is_empty() {
            return Ok(vec![]);
        }

        let url = format!("{}/instance-operations/terminate", BASE_URL);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&json!({ "instance_ids": instance_ids }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("terminate failed: status={} body={}", status, body);
        }

        let parsed: TerminateResponse = resp.json().await?;
        Ok(parsed
            .data
            .terminated_instances
            .into_iter()
            .map(|t| t.id)
            .collect())
    }

    async fn gpu_utilization(&self, instance: &inventory::DiscoveredInstance) -> Result<Vec<i64>> {
        let Some(ip) = instance.ip.as_deref().filter(|s| !s.trim().is_empty()) else {
            anyhow::bail!("instance {} has no ip yet", instance.id);
        };

        let mut cmd = tokio::process::Command::new("ssh");
        cmd.arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            .arg("-o")
            .arg("ConnectTimeout=10")
            .arg("-o")
            .arg("BatchMode=yes");
        if let Some(identity) = &self.ssh_identity {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg(format!("{}@{}", self.ssh_user, ip))
            .arg("nvidia-smi --query-gpu=utilization.gpu --format=csv,noheader,nounits");

        let output = tokio::time::timeout(SSH_PROBE_TIMEOUT, cmd.output())
            .await
            .map_err(|_| anyhow::anyhow!("ssh probe to {} timed out", ip))??;

        if !output.status.success() {
            anyhow::bail!(
                "nvidia-smi probe on {} failed: {}",
                ip,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut utils = Vec::new();
        for line in stdout.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            utils.push(
                line.parse::<i64>()
                    .map_err(|_| anyhow::anyhow!("unparseable nvidia-smi output: '{}'", line))?,
            );
        }
        if utils.is_empty() {
            anyhow::bail!("nvidia-smi on {} returned no GPUs", ip);
        }
        Ok(utils)
    }
}
