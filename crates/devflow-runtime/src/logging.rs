//! Process-wide `tracing` subscriber setup.

use std::sync::Once;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogConfig, LogFormat};

static INIT: Once = Once::new();

/// Builds the filter: `RUST_LOG` when set and valid, else `config.level`,
/// else `info`.
fn env_filter(config: &LogConfig) -> EnvFilter {
    let from_env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    build_filter(from_env.as_deref(), &config.level)
}

fn build_filter(from_env: Option<&str>, level: &str) -> EnvFilter {
    from_env
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_new(level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Installs the global subscriber. Later calls are no-ops.
pub fn init_logging(config: &LogConfig) {
    INIT.call_once(|| {
        let filter = env_filter(config);
        let result = match config.format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_current_span(true))
                .try_init(),
            LogFormat::Console => tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_target(true))
                .try_init(),
        };
        if let Err(e) = result {
            eprintln!("devflow: logging already initialised: {e}");
        }
    });
}
