//! Project registry.
//!
//! Maps project ids (the request path) to their orchestrators. Each project has its own
//! roster, health tracker and sync status cache; nothing is shared between projects
//! except the outbound transport.
//!
//! Built once at startup from configuration and immutable afterwards.

use crate::config::ProjectConfig;
use crate::orchestrator::Orchestrator;
use crate::sync_status::SyncStatusSource;
use crate::transport::UpstreamTransport;
use indexmap::IndexMap;
use serde_json::{Map, Value, json};
use std::sync::Arc;

pub struct Projects {
    projects: IndexMap<String, Arc<Orchestrator>>,
}

impl Projects {
    pub fn new(
        configs: Vec<ProjectConfig>,
        transport: Arc<dyn UpstreamTransport>,
        sync_source: Arc<dyn SyncStatusSource>,
    ) -> Self {
        let projects = configs
            .into_iter()
            .map(|config| {
                let id = config.id.clone();
                let orchestrator =
                    Orchestrator::new(config, transport.clone(), sync_source.clone());
                (id, Arc::new(orchestrator))
            })
            .collect();

        Self { projects }
    }

    pub fn get(&self, project: &str) -> Option<Arc<Orchestrator>> {
        self.projects.get(project).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Orchestrator>> {
        self.projects.values()
    }

    /// Kicks off the first sync status fetch of every project in the background.
    pub fn start_sync_status(&self) {
        for orchestrator in self.iter() {
            if let Some(cache) = orchestrator.sync_status() {
                let cache = cache.clone();
                tokio::spawn(async move { cache.refresh().await });
            }
        }
    }

    /// Ready once every project with a sync status source has finished its first fetch.
    pub fn is_ready(&self) -> bool {
        self.iter()
            .filter_map(|o| o.sync_status())
            .all(|cache| cache.is_ready())
    }

    /// Health and sync state of every project, keyed by project id.
    pub fn status_report(&self) -> Value {
        let mut report = Map::new();
        for orchestrator in self.iter() {
            let sync_status = orchestrator
                .sync_status()
                .and_then(|cache| cache.cached())
                .map(|status| {
                    json!({
                        "earliestHeight": status.earliest_height,
                        "latestHeight": status.latest_height,
                        "catchingUp": status.catching_up,
                    })
                });

            report.insert(
                orchestrator.project().to_string(),
                json!({
                    "upstreams": orchestrator.health().snapshot(),
                    "syncStatus": sync_status,
                }),
            );
        }
        Value::Object(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncStatusConfig;
    use crate::testutils::{
        MockTransport, StaticSyncStatus, archive, full, project_config, sync_status,
    };
    use url::Url;

    fn projects(source: StaticSyncStatus) -> Projects {
        let mut mainnet = project_config("mainnet", vec![full("m1", 0), archive("m2", 1)]);
        mainnet.sync_status = Some(SyncStatusConfig {
            url: Some(Url::parse("http://trusted:26657/status").unwrap()),
            refresh_interval_secs: 60,
        });
        let testnet = project_config("testnet", vec![full("t1", 0)]);

        Projects::new(
            vec![mainnet, testnet],
            Arc::new(MockTransport::new()),
            Arc::new(source),
        )
    }

    #[test]
    fn test_lookup() {
        let projects = projects(StaticSyncStatus(None));
        assert_eq!(projects.get("mainnet").unwrap().roster().len(), 2);
        assert_eq!(projects.get("testnet").unwrap().roster().len(), 1);
        assert!(projects.get("unknown").is_none());

        let order: Vec<_> = projects.iter().map(|o| o.project()).collect();
        assert_eq!(order, ["mainnet", "testnet"]);
    }

    #[tokio::test]
    async fn test_ready_after_first_sync_fetch() {
        let projects = projects(StaticSyncStatus(Some(sync_status(10, 20))));
        assert!(!projects.is_ready());

        projects.get("mainnet").unwrap().sync_status().unwrap().refresh().await;
        assert!(projects.is_ready());

        let report = projects.status_report();
        assert_eq!(report["mainnet"]["syncStatus"]["earliestHeight"], 10);
        assert_eq!(report["mainnet"]["upstreams"][0]["id"], "m1");
        assert_eq!(report["mainnet"]["upstreams"][1]["healthy"], true);
        assert_eq!(report["testnet"]["syncStatus"], Value::Null);
    }

    #[tokio::test]
    async fn test_ready_even_when_first_fetch_fails() {
        let projects = projects(StaticSyncStatus(None));
        projects.start_sync_status();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(projects.is_ready());
    }
}
