//! Ready-made subscriber for binaries built on this crate.

use tracing::level_filters::LevelFilter;
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, fmt};

/// Installs a global subscriber that prints events to stderr and renders the
/// dispatch progress bars. `RUST_LOG` takes priority over the default `info`
/// level.
pub fn init() -> Result<(), TryInitError> {
    init_with(LevelFilter::INFO)
}

pub fn init_with(level: LevelFilter) -> Result<(), TryInitError> {
    let indicatif_layer = IndicatifLayer::new();

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(indicatif_layer.get_stderr_writer())
                .compact(),
        )
        .with(indicatif_layer)
        .try_init()
}
