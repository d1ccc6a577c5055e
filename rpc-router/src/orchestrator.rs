use crate::block::BlockExtractor;
use crate::config::{BlockAgePolicy, ProjectConfig};
use crate::errors::RouteError;
use crate::health::HealthTracker;
use crate::jsonrpc::JsonRpcRequest;
use crate::metrics_defs::{
    ROUTE_EMERGENCY_SELECTION, ROUTE_STAGE_ERRORS, UPSTREAM_REQUEST_DURATION,
};
use crate::pipeline::{Flow, PIPELINE, RoutingContext, Stage};
use crate::sync_status::{SyncStatusCache, SyncStatusSource};
use crate::trace::RouteTrace;
use crate::transport::UpstreamTransport;
use crate::upstream::{Roster, Upstream};
use serde_json::Value;
use shared::{counter, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;

/// What happened to one call.
#[derive(Debug)]
pub struct RouteOutcome {
    /// The upstream the call was sent to, if any
    pub upstream: Option<String>,
    /// The upstream's response object, passed through verbatim
    pub result: Result<Value, RouteError>,
}

/// Routes calls for one project: runs the pipeline, sends the call to the chosen
/// upstream and feeds the outcome back into the health tracker.
pub struct Orchestrator {
    project: String,
    roster: Roster,
    health: Arc<HealthTracker>,
    extractor: BlockExtractor,
    block_age: BlockAgePolicy,
    sync_status: Option<SyncStatusCache>,
    transport: Arc<dyn UpstreamTransport>,
    upstream_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        config: ProjectConfig,
        transport: Arc<dyn UpstreamTransport>,
        sync_source: Arc<dyn SyncStatusSource>,
    ) -> Self {
        let sync_status = match (&config.sync_status, config.sync_status_url()) {
            (Some(sync_config), Some(url)) => Some(SyncStatusCache::new(
                config.id.clone(),
                url.clone(),
                sync_source,
                Duration::from_secs(sync_config.refresh_interval_secs),
                Duration::from_secs(config.timeouts.sync_status_timeout_secs),
            )),
            (Some(_), None) => {
                tracing::warn!(
                    project = %config.id,
                    "sync status enabled without a status url, all heights treated as historical"
                );
                None
            }
            _ => None,
        };

        let extractor = match config.historical_methods {
            Some(methods) => BlockExtractor::new(methods),
            None => BlockExtractor::default(),
        };

        let roster = Roster::new(config.upstreams);
        let health = Arc::new(HealthTracker::for_roster(config.routing, &roster));

        Self {
            project: config.id,
            roster,
            health,
            extractor,
            block_age: config.block_age,
            sync_status,
            transport,
            upstream_timeout: Duration::from_secs(config.timeouts.upstream_timeout_secs),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    pub fn sync_status(&self) -> Option<&SyncStatusCache> {
        self.sync_status.as_ref()
    }

    /// Routes one call and returns the upstream's answer or the reason there is none.
    ///
    /// Dropping the returned future before it completes abandons the call without
    /// recording an outcome for the upstream.
    pub async fn route(&self, request: &JsonRpcRequest, trace: &mut RouteTrace) -> RouteOutcome {
        let upstream = match self.select(request, trace) {
            Ok(upstream) => upstream,
            Err(error) => {
                tracing::debug!(
                    project = %self.project,
                    method = %request.method,
                    %error,
                    "no upstream for call"
                );
                return RouteOutcome {
                    upstream: None,
                    result: Err(error),
                };
            }
        };

        let result = self.dispatch(&upstream, request).await;
        RouteOutcome {
            upstream: Some(upstream.id.clone()),
            result,
        }
    }

    /// Runs the pipeline and resolves the upstream to call.
    pub fn select(
        &self,
        request: &JsonRpcRequest,
        trace: &mut RouteTrace,
    ) -> Result<Arc<Upstream>, RouteError> {
        self.run_stages(&PIPELINE, request, trace)
    }

    fn run_stages(
        &self,
        stages: &[Stage],
        request: &JsonRpcRequest,
        trace: &mut RouteTrace,
    ) -> Result<Arc<Upstream>, RouteError> {
        let block = self.extractor.extract(&request.method, &request.params);
        let sync_status = self.sync_status.as_ref().and_then(|cache| cache.current());
        let mut ctx = RoutingContext::new(
            request,
            block,
            &self.roster,
            &self.health,
            self.block_age,
            sync_status,
        );

        let mut halted = false;
        let mut halted_by: Option<(&'static str, String)> = None;
        let mut captured: Option<RouteError> = None;

        for &stage in stages {
            if !stage.should_run(&ctx, halted) {
                continue;
            }

            trace.start(stage.name());
            let started = Instant::now();

            match stage.run(&ctx) {
                Ok(result) => {
                    trace.result(stage.name(), &result.reason, started.elapsed());
                    debug_assert!(
                        result.candidates.iter().all(|u| self.roster.contains(&u.id)),
                        "stage {} produced an upstream outside the roster",
                        stage.name()
                    );

                    ctx.candidates = result.candidates;
                    if ctx.selected.is_none() {
                        ctx.selected = result.selected;
                    }
                    if result.error.is_some() {
                        captured = result.error;
                    }

                    halted = result.flow == Flow::Stop;
                    if halted && !stage.is_terminal() {
                        halted_by = Some((stage.name(), result.reason));
                    }
                }
                Err(e) => {
                    // Skip the stage and keep its input
                    tracing::error!(
                        project = %self.project,
                        stage = stage.name(),
                        error = %e,
                        "routing stage failed"
                    );
                    counter!(ROUTE_STAGE_ERRORS, "stage" => stage.name()).increment(1);
                    trace.error(stage.name(), e.to_string(), started.elapsed());
                }
            }
        }

        if let Some(upstream) = ctx.selected {
            return Ok(upstream);
        }

        // Only reached when a stage halts with candidates left and nothing selected
        if let Some(upstream) = ctx.candidates.first().cloned() {
            tracing::warn!(
                project = %self.project,
                upstream = %upstream.id,
                method = %request.method,
                "pipeline selected nothing, using first remaining candidate"
            );
            counter!(ROUTE_EMERGENCY_SELECTION, "upstream" => upstream.id.clone()).increment(1);
            if let Err(e) = self.health.record_selection(&upstream.id, &request.method) {
                tracing::error!(upstream = %upstream.id, error = %e, "failed to record selection");
            }
            return Ok(upstream);
        }

        Err(captured.unwrap_or_else(|| {
            let (stage, reason) =
                halted_by.unwrap_or(("pipeline", "no candidates left".to_string()));
            RouteError::NoUpstream { stage, reason }
        }))
    }

    async fn dispatch(
        &self,
        upstream: &Upstream,
        request: &JsonRpcRequest,
    ) -> Result<Value, RouteError> {
        let started = Instant::now();
        let result = timeout(self.upstream_timeout, self.transport.send(upstream, request)).await;
        let latency = started.elapsed();

        let result = match result {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(e)) => Err(RouteError::UpstreamFailed {
                upstream: upstream.id.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(RouteError::UpstreamTimeout(upstream.id.clone())),
        };

        let status = if result.is_ok() { "ok" } else { "error" };
        histogram!(
            UPSTREAM_REQUEST_DURATION,
            "upstream" => upstream.id.clone(),
            "status" => status
        )
        .record(latency.as_secs_f64());

        if let Err(e) = &result {
            tracing::warn!(
                project = %self.project,
                upstream = %upstream.id,
                error = %e,
                "upstream call failed"
            );
        }
        if let Err(e) = self
            .health
            .record_outcome(&upstream.id, result.is_ok(), latency)
        {
            tracing::error!(upstream = %upstream.id, error = %e, "failed to record outcome");
        }

        result
    }
}
