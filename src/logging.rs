use std::panic;
use std::sync::OnceLock;

use tracing::error;
use tracing_subscriber::{EnvFilter, Layer, prelude::*};

use crate::config::LogConfig;

static INSTALLED: OnceLock<()> = OnceLock::new();

fn filter(level: &str) -> EnvFilter {
    EnvFilter::new(format!("{}={}", env!("CARGO_CRATE_NAME"), level))
}

/// Installs the global subscriber once. Later calls do nothing.
pub fn init_tracing(config: &LogConfig) {
    INSTALLED.get_or_init(|| {
        const WITH_FILE_PATH: bool = cfg!(debug_assertions);
        let default_layer = || {
            tracing_subscriber::fmt::layer()
                .compact()
                .with_file(WITH_FILE_PATH)
                .with_line_number(WITH_FILE_PATH)
                .with_target(!WITH_FILE_PATH)
                .with_thread_ids(true)
                .with_ansi(false)
        };

        let result = match config.directory.as_deref() {
            Some(dir) => {
                let writer = tracing_appender::rolling::never(dir, &config.file_name);
                tracing::subscriber::set_global_default(
                    tracing_subscriber::registry().with(
                        default_layer()
                            .with_writer(writer)
                            .with_filter(filter(&config.level)),
                    ),
                )
            }
            None => tracing::subscriber::set_global_default(
                tracing_subscriber::registry().with(
                    default_layer()
                        .with_writer(std::io::stderr)
                        .with_filter(filter(&config.level)),
                ),
            ),
        };
        if result.is_err() {
            // another subscriber owns the process; keep it
            return;
        }

        panic::set_hook(Box::new(|panic| error!("{}", panic)));
    });
}

