use crate::config::{LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(thiserror::Error, Debug)]
pub enum TelemetryError {
    #[error("invalid sentry dsn: {0}")]
    InvalidDsn(#[from] sentry::types::ParseDsnError),
    #[error("could not build statsd recorder: {0}")]
    Statsd(#[from] metrics_exporter_statsd::StatsdError),
    #[error("could not install metrics recorder: {0}")]
    Recorder(String),
}

/// Installs the global tracing subscriber, with a sentry layer when a DSN is configured.
///
/// The returned guard flushes pending sentry events when dropped and must be held for
/// the lifetime of the process.
pub fn init_logging(
    config: Option<&LoggingConfig>,
) -> Result<Option<sentry::ClientInitGuard>, TelemetryError> {
    let default_config = LoggingConfig::default();
    let config = config.unwrap_or(&default_config);

    let guard = match &config.sentry_dsn {
        Some(dsn) => Some(sentry::init(sentry::ClientOptions {
            dsn: Some(dsn.parse()?),
            release: sentry::release_name!(),
            environment: config.environment.clone().map(Into::into),
            ..Default::default()
        })),
        None => None,
    };

    let level = if config.level.is_empty() {
        "info"
    } else {
        config.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let sentry_layer = guard
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_layer)
        .init();

    Ok(guard)
}

/// Installs a statsd recorder as the global metrics recorder. Without a config every
/// metric is a no-op.
pub fn init_metrics(config: Option<&MetricsConfig>) -> Result<(), TelemetryError> {
    let Some(config) = config else {
        tracing::info!("metrics disabled");
        return Ok(());
    };

    let recorder = StatsdBuilder::from(config.statsd_host.clone(), config.statsd_port)
        .build(Some(&config.prefix))?;
    metrics::set_global_recorder(recorder).map_err(|e| TelemetryError::Recorder(e.to_string()))?;

    shared::metrics_defs::describe_all(rpc_router::metrics_defs::ALL_METRICS);
    tracing::info!(
        host = %config.statsd_host,
        port = config.statsd_port,
        "sending metrics to statsd"
    );
    Ok(())
}
