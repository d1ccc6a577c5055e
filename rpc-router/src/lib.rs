pub mod block;
pub mod config;
pub mod errors;
pub mod health;
pub mod jsonrpc;
pub mod metrics_defs;
pub mod orchestrator;
pub mod pipeline;
pub mod project;
pub mod service;
pub mod sync_status;
pub mod trace;
pub mod transport;
pub mod upstream;

#[cfg(test)]
mod testutils;

use crate::errors::RouterError;
use crate::project::Projects;
use crate::service::RpcService;
use crate::sync_status::HttpSyncStatusSource;
use crate::transport::HttpTransport;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::sync::Arc;

pub async fn run(config: config::Config) -> Result<(), RouterError> {
    config.validate()?;

    let client = reqwest::Client::builder().build()?;
    let projects = Arc::new(Projects::new(
        config.projects,
        Arc::new(HttpTransport::new(client.clone())),
        Arc::new(HttpSyncStatusSource::new(client)),
    ));
    projects.start_sync_status();

    let ready_projects = projects.clone();
    let status_projects = projects.clone();
    let admin_service: AdminService<_, _, RouterError> = AdminService::new(
        move || ready_projects.is_ready(),
        move || status_projects.status_report(),
    );

    let rpc_task = run_http_service(
        &config.listener.host,
        config.listener.port,
        RpcService::new(projects),
    );
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        admin_service,
    );

    tokio::try_join!(rpc_task, admin_task)?;
    Ok(())
}
