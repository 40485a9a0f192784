// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// VM Directory HTTP Adapter
//
// Anti-Corruption Layer for the cluster VM directory.
// GET {endpoint}/vms?owner_uuid=<uuid>&predicate=<json>, answered by a JSON
// array of VM records.

use crate::domain::agent_config::ServiceEndpoint;
use crate::domain::resolver::{ResolutionError, ResolveRequest, ResolverClient};
use crate::domain::vm::RemoteVm;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

pub struct HttpResolverClient {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpResolverClient {
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

/// Directory predicate for `request`: an `or` of `eq` clauses, one per tag
/// value and VM uuid. `None` when the request covers every VM of the scope.
/// A tag requested without value is matched with `*`.
pub fn predicate_for(request: &ResolveRequest) -> Option<Value> {
    if request.all_vms {
        return None;
    }

    let mut clauses: Vec<Value> = request
        .tag_pairs()
        .map(|(name, value)| json!({ "eq": [format!("tag.{}", name), value.unwrap_or("*")] }))
        .collect();
    clauses.extend(
        request
            .vms
            .iter()
            .map(|uuid| json!({ "eq": ["uuid", uuid.to_string()] })),
    );

    match clauses.len() {
        0 => None,
        1 => clauses.pop(),
        _ => Some(json!({ "or": clauses })),
    }
}

#[async_trait]
impl ResolverClient for HttpResolverClient {
    async fn resolve(&self, request: &ResolveRequest) -> Result<Vec<RemoteVm>, ResolutionError> {
        let url = format!("{}/vms", self.endpoint.trim_end_matches('/'));

        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(owner) = request.owner_uuid {
            query.push(("owner_uuid", owner.to_string()));
        }
        if let Some(predicate) = predicate_for(request) {
            query.push(("predicate", predicate.to_string()));
        }

        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .query(&query)
            .send()
            .await
            .map_err(|e| ResolutionError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ResolutionError::Status { status, body });
        }

        response
            .json()
            .await
            .map_err(|e| ResolutionError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::rule::Scope;
    use mockito::Matcher;
    use uuid::Uuid;

    #[test]
    fn test_predicate_shapes() {
        let mut request = ResolveRequest::for_scope(Scope::Global);
        assert_eq!(predicate_for(&request), None);

        request.add_tag("role", Some("db"));
        assert_eq!(predicate_for(&request), Some(json!({ "eq": ["tag.role", "db"] })));

        let vm = Uuid::new_v4();
        request.add_tag("internal", None);
        request.add_vm(vm);
        assert_eq!(
            predicate_for(&request),
            Some(json!({ "or": [
                { "eq": ["tag.internal", "*"] },
                { "eq": ["tag.role", "db"] },
                { "eq": ["uuid", vm.to_string()] }
            ] }))
        );

        request.all_vms = true;
        assert_eq!(predicate_for(&request), None);
    }

    #[tokio::test]
    async fn test_resolve_sends_owner_and_predicate() {
        let owner = Uuid::new_v4();
        let remote = Uuid::new_v4();
        let mut request = ResolveRequest::for_scope(Scope::Owner(owner));
        request.add_tag("role", Some("db"));

        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/vms")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("owner_uuid".into(), owner.to_string()),
                Matcher::UrlEncoded("predicate".into(), r#"{"eq":["tag.role","db"]}"#.into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!([{
                    "uuid": remote,
                    "owner_uuid": owner,
                    "tags": { "role": "db" },
                    "ips": ["10.0.2.7"],
                    "state": "running"
                }])
                .to_string(),
            )
            .create_async()
            .await;

        let client = HttpResolverClient::new(server.url(), Duration::from_secs(5));
        let vms = client.resolve(&request).await.unwrap();

        mock.assert_async().await;
        assert_eq!(vms.len(), 1);
        assert_eq!(vms[0].uuid, remote);
        assert_eq!(vms[0].tags.get("role").map(String::as_str), Some("db"));
    }

    #[tokio::test]
    async fn test_transport_failure() {
        // Nothing listens on port 1.
        let client = HttpResolverClient::new("http://127.0.0.1:1".to_string(), Duration::from_secs(2));
        let mut request = ResolveRequest::for_scope(Scope::Global);
        request.all_vms = true;
        let err = client.resolve(&request).await.unwrap_err();
        assert!(matches!(err, ResolutionError::Transport(_)));
    }

    #[tokio::test]
    async fn test_non_array_body_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/vms")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"message":"not a list"}"#)
            .create_async()
            .await;

        let client = HttpResolverClient::new(server.url(), Duration::from_secs(5));
        let mut request = ResolveRequest::for_scope(Scope::Global);
        request.all_vms = true;
        let err = client.resolve(&request).await.unwrap_err();
        assert!(matches!(err, ResolutionError::Malformed(_)));
    }
}
