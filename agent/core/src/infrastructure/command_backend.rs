// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Firewall backend adapter that hands each operation to an external command.
//!
//! The command receives one JSON document on stdin:
//!
//! ```json
//! {"action": "apply", "changeset": {"add_rules": [...], "vms": [...]}}
//! {"action": "teardown", "vm": {"uuid": "...", ...}}
//! ```
//!
//! Exit status zero means the operation was applied. Anything else fails the
//! run with the command's stderr.

use crate::domain::agent_config::BackendConfig;
use crate::domain::backend::{BackendError, FirewallBackend, FirewallChangeset};
use crate::domain::vm::Vm;
use async_trait::async_trait;
use serde::Serialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

#[derive(Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum BackendRequest<'a> {
    Apply { changeset: &'a FirewallChangeset },
    Teardown { vm: &'a Vm },
}

pub struct CommandBackend {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandBackend {
    pub fn new(command: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            args,
            timeout,
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        Self::new(
            config.command.clone(),
            config.args.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    /// Run the command with `request` on stdin. Errors are plain messages;
    /// callers wrap them in the variant matching the operation.
    async fn run(&self, request: &BackendRequest<'_>) -> Result<(), String> {
        let payload = serde_json::to_vec(request).map_err(|e| e.to_string())?;
        debug!(command = %self.command, bytes = payload.len(), "Invoking firewall backend");

        let mut child = tokio::process::Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to run {}: {}", self.command, e))?;

        let exchange = async {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(&payload).await?;
                stdin.shutdown().await?;
            }
            child.wait_with_output().await
        };

        let output = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(format!("{} failed: {}", self.command, e)),
            Err(_) => {
                return Err(format!(
                    "{} timed out after {}s",
                    self.command,
                    self.timeout.as_secs()
                ))
            }
        };

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(if stderr.is_empty() {
                format!("{} exited with {}", self.command, output.status)
            } else {
                stderr
            })
        }
    }
}

#[async_trait]
impl FirewallBackend for CommandBackend {
    async fn apply(&self, changeset: &FirewallChangeset) -> Result<(), BackendError> {
        self.run(&BackendRequest::Apply { changeset })
            .await
            .map_err(BackendError::ApplyFailed)
    }

    async fn teardown(&self, vm: &Vm) -> Result<(), BackendError> {
        self.run(&BackendRequest::Teardown { vm })
            .await
            .map_err(BackendError::TeardownFailed)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn vm() -> Vm {
        Vm {
            uuid: Uuid::new_v4(),
            owner_uuid: Uuid::new_v4(),
            firewall_enabled: true,
            tags: Default::default(),
            ips: vec![],
            server_uuid: None,
            local: true,
        }
    }

    #[tokio::test]
    async fn test_apply_pipes_changeset_to_stdin() {
        let dir = TempDir::new().unwrap();
        let sink = dir.path().join("request.json");
        let backend = CommandBackend::new(
            "sh",
            vec!["-c".into(), format!("cat > {}", sink.display())],
            Duration::from_secs(5),
        );

        let changeset = FirewallChangeset {
            vms: vec![vm()],
            ..Default::default()
        };
        backend.apply(&changeset).await.unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&sink).unwrap()).unwrap();
        assert_eq!(written["action"], "apply");
        assert_eq!(written["changeset"]["vms"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_teardown_failure_carries_stderr() {
        let backend = CommandBackend::new(
            "sh",
            vec!["-c".into(), "cat > /dev/null; echo 'ipf: device busy' >&2; exit 3".into()],
            Duration::from_secs(5),
        );
        let err = backend.teardown(&vm()).await.unwrap_err();
        assert!(matches!(err, BackendError::TeardownFailed(ref msg) if msg == "ipf: device busy"));
    }

    #[tokio::test]
    async fn test_missing_command() {
        let backend = CommandBackend::new("/nonexistent/fwadm", vec![], Duration::from_secs(5));
        let err = backend.apply(&FirewallChangeset::default()).await.unwrap_err();
        assert!(matches!(err, BackendError::ApplyFailed(_)));
    }
}
