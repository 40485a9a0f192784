// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Policy Service HTTP Adapter
//
// Anti-Corruption Layer for the cluster policy service.
// POST {endpoint}/resolve with a RuleQuery, answered by {"rules": [...]}.

use crate::domain::agent_config::ServiceEndpoint;
use crate::domain::policy::{PolicyClient, RuleQuery};
use crate::domain::resolver::ResolutionError;
use crate::domain::rule::FirewallRule;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

pub struct HttpPolicyClient {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

#[derive(Deserialize)]
struct ResolveResponse {
    #[serde(default)]
    rules: Vec<FirewallRule>,
}

impl HttpPolicyClient {
    pub fn new(endpoint: String, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            timeout,
        }
    }

    pub fn from_config(config: &ServiceEndpoint) -> Self {
        Self::new(config.endpoint.clone(), config.timeout())
    }
}

#[async_trait]
impl PolicyClient for HttpPolicyClient {
    async fn rules_for_vm(&self, query: &RuleQuery) -> Result<Vec<FirewallRule>, ResolutionError> {
        let url = format!("{}/resolve", self.endpoint.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(query)
            .send()
            .await
            .map_err(|e| ResolutionError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ResolutionError::Status { status, body });
        }

        let body: ResolveResponse = response
            .json()
            .await
            .map_err(|e| ResolutionError::Malformed(e.to_string()))?;
        Ok(body.rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::vm::Vm;
    use mockito::Matcher;
    use serde_json::json;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn vm() -> Vm {
        Vm {
            uuid: Uuid::new_v4(),
            owner_uuid: Uuid::new_v4(),
            firewall_enabled: true,
            tags: BTreeMap::from([("role".to_string(), "www".to_string())]),
            ips: vec![],
            server_uuid: None,
            local: true,
        }
    }

    #[tokio::test]
    async fn test_rules_for_vm_posts_query() {
        let vm = vm();
        let rule_uuid = Uuid::new_v4();
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/resolve")
            .match_body(Matcher::Json(json!({
                "owner_uuid": vm.owner_uuid,
                "vms": [vm.uuid],
                "tags": { "role": ["www"] }
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "rules": [{
                        "uuid": rule_uuid,
                        "owner_uuid": vm.owner_uuid,
                        "rule": "FROM tag role = db TO tag role = www ALLOW tcp PORT 80"
                    }]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = HttpPolicyClient::new(server.url(), Duration::from_secs(5));
        let rules = client.rules_for_vm(&RuleQuery::for_vm(&vm)).await.unwrap();

        mock.assert_async().await;
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].uuid, rule_uuid);
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/resolve")
            .with_status(503)
            .with_body("policy store unavailable")
            .create_async()
            .await;

        let client = HttpPolicyClient::new(server.url(), Duration::from_secs(5));
        let err = client.rules_for_vm(&RuleQuery::for_vm(&vm())).await.unwrap_err();
        match err {
            ResolutionError::Status { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "policy store unavailable");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unparseable_rule_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/resolve")
            .with_status(200)
            .with_body(json!({ "rules": [{ "uuid": Uuid::new_v4(), "global": true, "rule": "FROM" }] }).to_string())
            .create_async()
            .await;

        let client = HttpPolicyClient::new(server.url(), Duration::from_secs(5));
        let err = client.rules_for_vm(&RuleQuery::for_vm(&vm())).await.unwrap_err();
        assert!(matches!(err, ResolutionError::Malformed(_)));
    }
}
