//! The routing pipeline.
//!
//! Seven stages run in a fixed order over one [`RoutingContext`]. Each stage narrows
//! (or, for emergency archive, re-seeds) the candidate list and may pick the upstream
//! that serves the call. The order is:
//!
//! 1. Recovery: flips unhealthy candidates whose cooldown has elapsed back to healthy
//! 2. Method compatibility: drops upstreams that ignore the method
//! 3. Block age: drops upstreams that can't serve the block, prefers archive or full nodes
//! 4. Health and priority: drops unhealthy upstreams, orders by priority
//! 5. Emergency archive: when nothing is left, falls back to archive nodes regardless of health
//! 6. Final selection: picks the first remaining candidate
//! 7. Metrics: records the selection
//!
//! A stage that returns [`Flow::Stop`] halts the pipeline. After a halt only the emergency
//! archive stage may still run (when no candidates are left), and it resumes the
//! pipeline if it finds any. Once an upstream is selected the remaining filter stages
//! are skipped. The metrics stage always runs.

mod stages;

use crate::block::BlockRef;
use crate::config::{BlockAgePolicy, RoutingThresholds};
use crate::errors::RouteError;
use crate::health::{HealthError, HealthTracker};
use crate::jsonrpc::JsonRpcRequest;
use crate::sync_status::SyncStatus;
use crate::upstream::{Roster, Upstream};
use std::sync::Arc;
use std::time::Instant;

#[derive(thiserror::Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Health(#[from] HealthError),
}

/// Per-request state threaded through the stages.
pub struct RoutingContext<'a> {
    pub request: &'a JsonRpcRequest,
    pub block: Option<BlockRef>,
    pub candidates: Vec<Arc<Upstream>>,
    pub roster: &'a Roster,
    pub health: &'a HealthTracker,
    pub block_age: BlockAgePolicy,
    pub sync_status: Option<SyncStatus>,
    pub selected: Option<Arc<Upstream>>,
    /// Clock used for health decisions made while routing this request
    pub now: Instant,
}

impl<'a> RoutingContext<'a> {
    /// Starts a context with every roster upstream as a candidate.
    pub fn new(
        request: &'a JsonRpcRequest,
        block: Option<BlockRef>,
        roster: &'a Roster,
        health: &'a HealthTracker,
        block_age: BlockAgePolicy,
        sync_status: Option<SyncStatus>,
    ) -> Self {
        Self {
            request,
            block,
            candidates: roster.candidates(),
            roster,
            health,
            block_age,
            sync_status,
            selected: None,
            now: Instant::now(),
        }
    }

    pub fn thresholds(&self) -> &RoutingThresholds {
        self.health.thresholds()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Output of one stage.
#[derive(Clone, Debug)]
pub struct StageResult {
    pub candidates: Vec<Arc<Upstream>>,
    pub selected: Option<Arc<Upstream>>,
    pub reason: String,
    pub flow: Flow,
    /// A routing failure to report if no upstream ends up selected
    pub error: Option<RouteError>,
}

impl StageResult {
    pub fn proceed(candidates: Vec<Arc<Upstream>>, reason: impl Into<String>) -> Self {
        Self {
            candidates,
            selected: None,
            reason: reason.into(),
            flow: Flow::Continue,
            error: None,
        }
    }

    pub fn halt(candidates: Vec<Arc<Upstream>>, reason: impl Into<String>) -> Self {
        Self {
            flow: Flow::Stop,
            ..Self::proceed(candidates, reason)
        }
    }

    pub fn with_selected(mut self, upstream: Arc<Upstream>) -> Self {
        self.selected = Some(upstream);
        self
    }

    pub fn with_error(mut self, error: RouteError) -> Self {
        self.error = Some(error);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Recovery,
    MethodCompatibility,
    BlockAge,
    HealthPriority,
    EmergencyArchive,
    FinalSelection,
    Metrics,
}

pub const PIPELINE: [Stage; 7] = [
    Stage::Recovery,
    Stage::MethodCompatibility,
    Stage::BlockAge,
    Stage::HealthPriority,
    Stage::EmergencyArchive,
    Stage::FinalSelection,
    Stage::Metrics,
];

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Recovery => "recovery",
            Stage::MethodCompatibility => "method_compatibility",
            Stage::BlockAge => "block_age",
            Stage::HealthPriority => "health_priority",
            Stage::EmergencyArchive => "emergency_archive",
            Stage::FinalSelection => "final_selection",
            Stage::Metrics => "metrics",
        }
    }

    pub fn run(&self, ctx: &RoutingContext) -> Result<StageResult, StageError> {
        match self {
            Stage::Recovery => stages::recovery(ctx),
            Stage::MethodCompatibility => Ok(stages::method_compatibility(ctx)),
            Stage::BlockAge => Ok(stages::block_age(ctx)),
            Stage::HealthPriority => stages::health_priority(ctx),
            Stage::EmergencyArchive => Ok(stages::emergency_archive(ctx)),
            Stage::FinalSelection => Ok(stages::final_selection(ctx)),
            Stage::Metrics => stages::metrics(ctx),
        }
    }

    /// The terminal stage only reports; it never narrows the search.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Metrics)
    }

    /// Whether this stage runs given the state left by the stages before it.
    pub fn should_run(&self, ctx: &RoutingContext, halted: bool) -> bool {
        match self {
            _ if self.is_terminal() => true,
            _ if ctx.selected.is_some() => false,
            Stage::EmergencyArchive if halted => ctx.candidates.is_empty(),
            _ => !halted,
        }
    }
}
