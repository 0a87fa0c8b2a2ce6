use std::sync::Once;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static LOG_INIT: Once = Once::new();

/// Filter used when neither `RUST_LOG` nor an explicit default is provided
const DEFAULT_FILTER: &str = "info,cosmian_block_cipher=debug,cosmian_hsm_cipher=debug";

/// Install the global tracing subscriber once per process.
///
/// `RUST_LOG` wins over `default_filter`, which wins over `DEFAULT_FILTER`.
/// Subsequent calls are no-ops, so every test may call it.
pub fn log_init(default_filter: Option<&str>) {
    LOG_INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter.unwrap_or(DEFAULT_FILTER)));
        tracing_setup(filter);
    });
}

fn tracing_setup(filter: EnvFilter) {
    let format = tracing_subscriber::fmt::layer()
        .with_level(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true)
        .compact();

    // a subscriber may already be installed by the host application
    drop(
        tracing_subscriber::registry()
            .with(filter)
            .with(format)
            .try_init(),
    );
}
