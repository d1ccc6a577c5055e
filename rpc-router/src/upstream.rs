use crate::block::BlockRef;
use crate::config::{UpstreamConfig, UpstreamKind};
use std::sync::Arc;
use url::Url;

/// A configured backend node. Built once at startup and never mutated.
#[derive(Clone, Debug, PartialEq)]
pub struct Upstream {
    pub id: String,
    pub url: Url,
    pub status_url: Option<Url>,
    pub kind: UpstreamKind,
    pub priority: i32,
    pub ignored_methods: Vec<String>,
    pub activation_height: Option<u64>,
}

impl From<UpstreamConfig> for Upstream {
    fn from(config: UpstreamConfig) -> Self {
        Self {
            id: config.id,
            url: config.url,
            status_url: config.status_url,
            kind: config.kind,
            priority: config.priority,
            ignored_methods: config.ignored_methods,
            activation_height: config.activation_height,
        }
    }
}

impl Upstream {
    pub fn is_archive(&self) -> bool {
        self.kind == UpstreamKind::Archive
    }

    /// True if any ignored-method pattern matches `method`.
    pub fn ignores(&self, method: &str) -> bool {
        self.ignored_methods
            .iter()
            .any(|pattern| is_ignored(method, pattern))
    }

    /// False only when the request names a height below this upstream's activation height.
    pub fn supports_block(&self, block: Option<BlockRef>) -> bool {
        match (block, self.activation_height) {
            (Some(BlockRef::Number(height)), Some(activation)) => height >= activation,
            _ => true,
        }
    }
}

/// Matches a method against one ignored-method pattern. A trailing `*` matches any
/// method sharing the prefix; anything else must match exactly.
pub fn is_ignored(method: &str, pattern: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => method.starts_with(prefix),
        None => method == pattern,
    }
}

/// The immutable, ordered list of upstreams of one project.
#[derive(Clone, Debug)]
pub struct Roster {
    upstreams: Arc<[Arc<Upstream>]>,
}

impl Roster {
    pub fn new(configs: Vec<UpstreamConfig>) -> Self {
        Self {
            upstreams: configs
                .into_iter()
                .map(|config| Arc::new(Upstream::from(config)))
                .collect(),
        }
    }

    /// Candidate list containing every upstream, in configuration order
    pub fn candidates(&self) -> Vec<Arc<Upstream>> {
        self.upstreams.to_vec()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Upstream>> {
        self.upstreams.iter()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Upstream>> {
        self.upstreams.iter().find(|u| u.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }
}
