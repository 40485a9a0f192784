// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Inventory adapter backed by the host's VM administration command.
//!
//! Runs `<command> <args...> [owner_uuid=<uuid>]` (by default
//! `vmadm lookup -j`) and parses the JSON array it prints. A non-zero exit
//! is reported with the command's stderr, untouched.

use crate::domain::agent_config::InventoryConfig;
use crate::domain::inventory::{InventoryError, VmFilter, VmInventory};
use crate::domain::vm::{normalize_tags, Vm};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

pub struct VmadmInventory {
    command: String,
    args: Vec<String>,
    timeout: Duration,
    server_uuid: Option<Uuid>,
}

impl VmadmInventory {
    pub fn new(command: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            args,
            timeout,
            server_uuid: None,
        }
    }

    pub fn from_config(config: &InventoryConfig, server_uuid: Option<Uuid>) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            server_uuid,
        }
    }

    fn command_args(&self, filter: &VmFilter) -> Vec<String> {
        let mut args = self.args.clone();
        if let Some(owner) = filter.owner_uuid {
            args.push(format!("owner_uuid={}", owner));
        }
        args
    }
}

#[async_trait]
impl VmInventory for VmadmInventory {
    async fn list(&self, filter: &VmFilter) -> Result<Vec<Vm>, InventoryError> {
        let args = self.command_args(filter);
        debug!(command = %self.command, args = ?args, "Listing local VMs");

        let mut cmd = tokio::process::Command::new(&self.command);
        cmd.args(&args).kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(InventoryError::ListFailed(format!(
                    "failed to run {}: {}",
                    self.command, e
                )))
            }
            Err(_) => {
                return Err(InventoryError::ListFailed(format!(
                    "{} timed out after {}s",
                    self.command,
                    self.timeout.as_secs()
                )))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(InventoryError::ListFailed(if stderr.is_empty() {
                format!("{} exited with {}", self.command, output.status)
            } else {
                stderr
            }));
        }

        parse_vmadm_output(&output.stdout, self.server_uuid)
    }
}

#[derive(Deserialize)]
struct VmadmRecord {
    uuid: Uuid,
    owner_uuid: Uuid,
    #[serde(default)]
    firewall_enabled: bool,
    #[serde(default)]
    tags: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    nics: Vec<VmadmNic>,
    #[serde(default)]
    server_uuid: Option<Uuid>,
}

#[derive(Deserialize)]
struct VmadmNic {
    #[serde(default)]
    ip: Option<String>,
}

/// Parse `vmadm lookup -j` output. NICs whose `ip` is not an address
/// (`dhcp`, `addrconf`) are skipped.
pub fn parse_vmadm_output(stdout: &[u8], server_uuid: Option<Uuid>) -> Result<Vec<Vm>, InventoryError> {
    let records: Vec<VmadmRecord> =
        serde_json::from_slice(stdout).map_err(|e| InventoryError::Parse(e.to_string()))?;

    Ok(records
        .into_iter()
        .map(|record| Vm {
            uuid: record.uuid,
            owner_uuid: record.owner_uuid,
            firewall_enabled: record.firewall_enabled,
            tags: record.tags.map(normalize_tags).unwrap_or_default(),
            ips: record
                .nics
                .iter()
                .filter_map(|nic| nic.ip.as_deref())
                .filter_map(|ip| ip.parse::<IpAddr>().ok())
                .collect(),
            server_uuid: record.server_uuid.or(server_uuid),
            local: true,
        })
        .collect())
}
