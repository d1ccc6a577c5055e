use crate::config::{
    BlockAgePolicy, ProjectConfig, RoutingThresholds, Timeouts, UpstreamConfig, UpstreamKind,
};
use crate::jsonrpc::JsonRpcRequest;
use crate::sync_status::{SyncStatus, SyncStatusError, SyncStatusSource};
use crate::transport::{TransportError, UpstreamTransport};
use crate::upstream::Upstream;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use url::Url;

pub fn upstream_config(id: &str, kind: UpstreamKind, priority: i32) -> UpstreamConfig {
    UpstreamConfig {
        id: id.to_string(),
        url: Url::parse(&format!("http://{id}.internal:8545")).unwrap(),
        status_url: None,
        kind,
        priority,
        ignored_methods: vec![],
        activation_height: None,
    }
}

pub fn full(id: &str, priority: i32) -> UpstreamConfig {
    upstream_config(id, UpstreamKind::Full, priority)
}

pub fn archive(id: &str, priority: i32) -> UpstreamConfig {
    upstream_config(id, UpstreamKind::Archive, priority)
}

pub fn project_config(id: &str, upstreams: Vec<UpstreamConfig>) -> ProjectConfig {
    ProjectConfig {
        id: id.to_string(),
        upstreams,
        routing: RoutingThresholds::default(),
        block_age: BlockAgePolicy::default(),
        sync_status: None,
        timeouts: Timeouts::default(),
        historical_methods: None,
    }
}

pub fn sync_status(earliest_height: u64, latest_height: u64) -> SyncStatus {
    SyncStatus {
        earliest_height,
        latest_height,
        catching_up: false,
        refreshed_at: SystemTime::now(),
    }
}

pub fn ids(upstreams: &[std::sync::Arc<Upstream>]) -> Vec<&str> {
    upstreams.iter().map(|u| u.id.as_str()).collect()
}

#[derive(Clone)]
pub enum MockBehaviour {
    Respond(Value),
    Fail,
    Hang,
}

/// Transport that answers from a script and records which upstream each call went to.
/// Upstreams without a script echo their own id as the result.
#[derive(Default)]
pub struct MockTransport {
    behaviours: Mutex<HashMap<String, MockBehaviour>>,
    calls: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, upstream: &str, behaviour: MockBehaviour) {
        self.behaviours.lock().insert(upstream.to_string(), behaviour);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl UpstreamTransport for MockTransport {
    async fn send(
        &self,
        upstream: &Upstream,
        request: &JsonRpcRequest,
    ) -> Result<Value, TransportError> {
        self.calls.lock().push(upstream.id.clone());
        let behaviour = self.behaviours.lock().get(&upstream.id).cloned();

        match behaviour {
            Some(MockBehaviour::Respond(value)) => Ok(value),
            Some(MockBehaviour::Fail) => Err(TransportError::InvalidResponse(
                "scripted failure".to_string(),
            )),
            Some(MockBehaviour::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(TransportError::InvalidResponse("unreachable".to_string()))
            }
            None => Ok(json!({
                "jsonrpc": "2.0",
                "id": request.id,
                "result": upstream.id,
            })),
        }
    }
}

/// Sync status source returning a fixed document.
pub struct StaticSyncStatus(pub Option<SyncStatus>);

#[async_trait]
impl SyncStatusSource for StaticSyncStatus {
    async fn fetch_status(&self, _url: &Url) -> Result<SyncStatus, SyncStatusError> {
        self.0
            .clone()
            .ok_or_else(|| SyncStatusError::InvalidHeight("unavailable".to_string()))
    }
}
