use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::block::BlockParam;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Empty project id")]
    EmptyProjectId,

    #[error("Duplicate project id: {0}")]
    DuplicateProject(String),

    #[error("Project {0} has no upstreams")]
    NoUpstreams(String),

    #[error("Duplicate upstream id in project {project}: {upstream}")]
    DuplicateUpstream { project: String, upstream: String },

    #[error("Empty upstream id in project {0}")]
    EmptyUpstreamId(String),

    #[error("Error rate threshold must be in (0, 1], got {0}")]
    InvalidErrorRateThreshold(f64),

    #[error("Error rate window cannot be 0")]
    ZeroWindow,

    #[error("Consecutive failure limit cannot be 0")]
    ZeroFailureLimit,

    #[error("{name} must be at most {max} seconds, got {value}")]
    DurationTooLong {
        name: &'static str,
        value: u64,
        max: u64,
    },

    #[error("{0} cannot be 0")]
    ZeroTimeout(&'static str),
}

/// Upper bound for any configured duration
pub const MAX_DURATION_SECS: u64 = 7 * 24 * 3600;

fn check_duration(name: &'static str, value: u64) -> Result<(), ValidationError> {
    if value > MAX_DURATION_SECS {
        return Err(ValidationError::DurationTooLong {
            name,
            value,
            max: MAX_DURATION_SECS,
        });
    }
    Ok(())
}

/// Router configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Main listener for JSON-RPC requests
    pub listener: Listener,
    /// Admin listener for health, readiness and upstream status
    pub admin_listener: Listener,
    /// Independent deployments served by this process
    pub projects: Vec<ProjectConfig>,
}

impl Config {
    /// Validates the router configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        let mut project_ids = HashSet::new();
        for project in &self.projects {
            if project.id.is_empty() {
                return Err(ValidationError::EmptyProjectId);
            }
            if !project_ids.insert(&project.id) {
                return Err(ValidationError::DuplicateProject(project.id.clone()));
            }
            project.validate()?;
        }

        Ok(())
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

/// One deployment: its roster and the policies applied when routing to it.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ProjectConfig {
    /// Project identifier, also the request path (`POST /{id}`)
    pub id: String,
    pub upstreams: Vec<UpstreamConfig>,
    #[serde(default)]
    pub routing: RoutingThresholds,
    #[serde(default)]
    pub block_age: BlockAgePolicy,
    pub sync_status: Option<SyncStatusConfig>,
    #[serde(default)]
    pub timeouts: Timeouts,
    /// Replaces the built-in table of methods that carry a block reference
    pub historical_methods: Option<HashMap<String, BlockParam>>,
}

impl ProjectConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.upstreams.is_empty() {
            return Err(ValidationError::NoUpstreams(self.id.clone()));
        }

        let mut upstream_ids = HashSet::new();
        for upstream in &self.upstreams {
            if upstream.id.is_empty() {
                return Err(ValidationError::EmptyUpstreamId(self.id.clone()));
            }
            if !upstream_ids.insert(&upstream.id) {
                return Err(ValidationError::DuplicateUpstream {
                    project: self.id.clone(),
                    upstream: upstream.id.clone(),
                });
            }
        }

        self.routing.validate()?;
        self.timeouts.validate()?;
        if let Some(sync_status) = &self.sync_status {
            check_duration("refresh_interval_secs", sync_status.refresh_interval_secs)?;
        }
        Ok(())
    }

    /// The status endpoint of the node whose sync height is trusted.
    ///
    /// An explicit `sync_status.url` wins; otherwise the highest-priority upstream
    /// with a status URL is used.
    pub fn sync_status_url(&self) -> Option<&Url> {
        let sync_status = self.sync_status.as_ref()?;
        if let Some(url) = &sync_status.url {
            return Some(url);
        }
        self.upstreams
            .iter()
            .filter(|u| u.status_url.is_some())
            .min_by_key(|u| u.priority)
            .and_then(|u| u.status_url.as_ref())
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamKind {
    Full,
    Archive,
}

/// Backend node configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    /// Unique identifier for this upstream within its project
    pub id: String,
    /// JSON-RPC endpoint
    pub url: Url,
    /// Node status endpoint, used as a sync status source
    pub status_url: Option<Url>,
    pub kind: UpstreamKind,
    /// Lower is preferred
    #[serde(default)]
    pub priority: i32,
    /// Exact method names, or prefixes ending in `*`
    #[serde(default)]
    pub ignored_methods: Vec<String>,
    /// Earliest block height this upstream can serve
    pub activation_height: Option<u64>,
}

/// Circuit breaker thresholds
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoutingThresholds {
    /// Upstream is opened when the windowed error rate exceeds this value
    pub error_rate_threshold: f64,
    /// Sliding window over which failures are counted
    pub window_secs: u64,
    /// How long an opened upstream stays excluded before recovery is attempted
    pub cooldown_secs: u64,
    /// Upstream is opened when this many failures happen in a row
    pub consecutive_failure_limit: u32,
}

impl Default for RoutingThresholds {
    fn default() -> Self {
        Self {
            error_rate_threshold: 0.5,
            window_secs: 60,
            cooldown_secs: 30,
            consecutive_failure_limit: 5,
        }
    }
}

impl RoutingThresholds {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(self.error_rate_threshold > 0.0 && self.error_rate_threshold <= 1.0) {
            return Err(ValidationError::InvalidErrorRateThreshold(
                self.error_rate_threshold,
            ));
        }
        if self.window_secs == 0 {
            return Err(ValidationError::ZeroWindow);
        }
        if self.consecutive_failure_limit == 0 {
            return Err(ValidationError::ZeroFailureLimit);
        }
        check_duration("window_secs", self.window_secs)?;
        check_duration("cooldown_secs", self.cooldown_secs)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Archive/full boundary for historical requests
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BlockAgePolicy {
    /// Blocks above the trusted node's earliest retained height that are still
    /// considered too old for full nodes
    pub retention_buffer: u64,
}

impl Default for BlockAgePolicy {
    fn default() -> Self {
        Self {
            retention_buffer: 128,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct SyncStatusConfig {
    pub url: Option<Url>,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

fn default_refresh_interval_secs() -> u64 {
    5
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Timeouts {
    /// Bound on a single outbound JSON-RPC call
    pub upstream_timeout_secs: u64,
    /// Bound on a single sync status fetch
    pub sync_status_timeout_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            upstream_timeout_secs: 10,
            sync_status_timeout_secs: 2,
        }
    }
}

impl Timeouts {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.upstream_timeout_secs == 0 {
            return Err(ValidationError::ZeroTimeout("upstream_timeout_secs"));
        }
        if self.sync_status_timeout_secs == 0 {
            return Err(ValidationError::ZeroTimeout("sync_status_timeout_secs"));
        }
        check_duration("upstream_timeout_secs", self.upstream_timeout_secs)?;
        check_duration("sync_status_timeout_secs", self.sync_status_timeout_secs)
    }
}
