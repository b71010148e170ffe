use std::env::var;

use tracing::{level_filters::LevelFilter, warn};
use tracing_subscriber::{
    Layer, Registry,
    filter::EnvFilter,
    layer::{Layered, SubscriberExt},
    util::SubscriberInitExt,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Install the global subscriber at `INFO`, overridable through `RUST_LOG`.
///
/// Panics if a global subscriber was already installed.
pub fn init() {
    init_with_level(LevelFilter::INFO);
}

/// Install the global subscriber with a custom default level.
pub fn init_with_level(level: LevelFilter) {
    build(level, false).init();
}

/// Install a subscriber that writes through the test harness capture.
///
/// Safe to call from every test; only the first call takes effect.
pub fn init_for_tests() {
    let _ = build(LevelFilter::DEBUG, true).try_init();
}

fn build(level: LevelFilter, test_writer: bool) -> Layered<BoxedLayer, Registry> {
    let env_filter = EnvFilter::builder().with_default_directive(level.into()).from_env_lossy();

    let log_format = var("RUST_LOG_FORMAT")
        .inspect_err(|error| {
            if !test_writer {
                warn!("Failed to read RUST_LOG_FORMAT, falling back to default: {error}")
            }
        })
        .unwrap_or_default();

    let log_layer: BoxedLayer = match (log_format.as_str(), test_writer) {
        ("json", false) => tracing_subscriber::fmt::layer().json().with_filter(env_filter).boxed(),
        ("json", true) => tracing_subscriber::fmt::layer()
            .json()
            .with_test_writer()
            .with_filter(env_filter)
            .boxed(),
        (_, false) => tracing_subscriber::fmt::layer()
            .compact()
            .without_time()
            .with_filter(env_filter)
            .boxed(),
        (_, true) => tracing_subscriber::fmt::layer()
            .compact()
            .without_time()
            .with_test_writer()
            .with_filter(env_filter)
            .boxed(),
    };

    tracing_subscriber::registry().with(log_layer)
}
