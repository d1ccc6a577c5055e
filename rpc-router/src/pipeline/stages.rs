use super::{RoutingContext, StageError, StageResult};
use crate::block::BlockRef;
use crate::config::BlockAgePolicy;
use crate::errors::RouteError;
use crate::metrics_defs::ROUTE_SELECTED;
use crate::sync_status::SyncStatus;
use crate::upstream::Upstream;
use shared::counter;
use std::sync::Arc;

pub(super) fn recovery(ctx: &RoutingContext) -> Result<StageResult, StageError> {
    if ctx.candidates.is_empty() {
        return Ok(StageResult::proceed(
            ctx.roster.candidates(),
            "no candidates, starting from the full roster",
        ));
    }

    let mut recovered = Vec::new();
    for upstream in &ctx.candidates {
        if !ctx.health.is_healthy(&upstream.id)?
            && ctx.health.attempt_recovery_at(&upstream.id, ctx.now)?
        {
            recovered.push(upstream.id.as_str());
        }
    }

    let reason = if recovered.is_empty() {
        "no upstreams recovered".to_string()
    } else {
        format!("recovered {}", recovered.join(", "))
    };
    Ok(StageResult::proceed(ctx.candidates.clone(), reason))
}

pub(super) fn method_compatibility(ctx: &RoutingContext) -> StageResult {
    let method = &ctx.request.method;
    let total = ctx.candidates.len();
    let supported: Vec<_> = ctx
        .candidates
        .iter()
        .filter(|u| !u.ignores(method))
        .cloned()
        .collect();

    if supported.is_empty() {
        return StageResult::halt(supported, format!("no candidate supports {method}"))
            .with_error(RouteError::MethodNotSupported(method.clone()));
    }

    let reason = format!("{} of {total} candidates support {method}", supported.len());
    StageResult::proceed(supported, reason)
}

/// Heights below the trusted node's earliest retained block plus the buffer can only
/// be served by archive nodes. Without a sync status every explicit height counts.
fn is_historical(height: u64, sync_status: Option<&SyncStatus>, policy: &BlockAgePolicy) -> bool {
    match sync_status {
        Some(status) => height < status.earliest_height.saturating_add(policy.retention_buffer),
        None => true,
    }
}

pub(super) fn block_age(ctx: &RoutingContext) -> StageResult {
    let compatible: Vec<_> = ctx
        .candidates
        .iter()
        .filter(|u| u.supports_block(ctx.block))
        .cloned()
        .collect();

    if compatible.is_empty() {
        let result = StageResult::proceed(compatible, "no candidate supports the requested block");
        return match ctx.block {
            Some(BlockRef::Number(height)) => {
                result.with_error(RouteError::UnsupportedBlock(height))
            }
            _ => result,
        };
    }

    let (archive, full): (Vec<_>, Vec<_>) =
        compatible.iter().cloned().partition(|u| u.is_archive());

    let prefer_archive = match ctx.block {
        Some(BlockRef::Number(height)) => {
            is_historical(height, ctx.sync_status.as_ref(), &ctx.block_age)
        }
        Some(BlockRef::Latest) | None => false,
    };

    if prefer_archive {
        if archive.is_empty() {
            StageResult::proceed(compatible, "historical block, no archive candidates, keeping all")
        } else {
            StageResult::proceed(archive, "historical block, preferring archive nodes")
        }
    } else if full.is_empty() {
        StageResult::proceed(archive, "recent block, only archive candidates left")
    } else {
        StageResult::proceed(full, "recent block, preferring full nodes")
    }
}

pub(super) fn health_priority(ctx: &RoutingContext) -> Result<StageResult, StageError> {
    let mut healthy = Vec::with_capacity(ctx.candidates.len());
    for upstream in &ctx.candidates {
        if ctx.health.is_healthy(&upstream.id)? {
            healthy.push(upstream.clone());
        }
    }

    if healthy.is_empty() {
        return Ok(StageResult::halt(healthy, "no healthy candidates"));
    }

    // Stable sort keeps roster order between equal priorities
    healthy.sort_by_key(|u| u.priority);
    let reason = format!(
        "{} of {} candidates healthy",
        healthy.len(),
        ctx.candidates.len()
    );
    Ok(StageResult::proceed(healthy, reason))
}

pub(super) fn emergency_archive(ctx: &RoutingContext) -> StageResult {
    if !ctx.candidates.is_empty() {
        return StageResult::proceed(ctx.candidates.clone(), "candidates available, not needed");
    }

    // Health is ignored here; method and activation height still apply
    let mut pool: Vec<Arc<Upstream>> = ctx
        .roster
        .iter()
        .filter(|u| {
            u.is_archive() && u.supports_block(ctx.block) && !u.ignores(&ctx.request.method)
        })
        .cloned()
        .collect();

    if pool.is_empty() {
        return StageResult::halt(pool, "no archive upstreams to fall back to");
    }

    pool.sort_by_key(|u| u.priority);
    tracing::warn!(
        method = %ctx.request.method,
        archives = pool.len(),
        "no healthy candidates, falling back to archive upstreams"
    );
    let reason = format!("falling back to {} archive upstreams", pool.len());
    StageResult::proceed(pool, reason)
}

pub(super) fn final_selection(ctx: &RoutingContext) -> StageResult {
    match ctx.candidates.first() {
        Some(upstream) => {
            StageResult::proceed(ctx.candidates.clone(), format!("selected {}", upstream.id))
                .with_selected(upstream.clone())
        }
        None => StageResult::halt(vec![], "no candidates to select from"),
    }
}

pub(super) fn metrics(ctx: &RoutingContext) -> Result<StageResult, StageError> {
    let Some(upstream) = &ctx.selected else {
        return Ok(StageResult::halt(ctx.candidates.clone(), "nothing selected"));
    };

    ctx.health
        .record_selection(&upstream.id, &ctx.request.method)?;
    counter!(
        ROUTE_SELECTED,
        "upstream" => upstream.id.clone(),
        "method" => ctx.request.method.clone()
    )
    .increment(1);

    Ok(StageResult::proceed(
        vec![upstream.clone()],
        format!("recorded selection of {}", upstream.id),
    ))
}
