// src/logging.rs

use crate::settings::LogSettings;

/// Installs the process-wide logger.
///
/// `RUST_LOG` wins over `log.level` when set. With `observability` a
/// `tracing-subscriber` fmt layer is installed instead of `env_logger`;
/// `log` records are bridged into it so both facades end up in one stream.
#[cfg(not(feature = "observability"))]
pub fn init_logging(settings: &LogSettings) {
    let env = env_logger::Env::default().default_filter_or(settings.level.as_str());
    if env_logger::Builder::from_env(env).try_init().is_err() {
        eprintln!("Logger already initialised, keeping the existing one");
    }
    if settings.json {
        log::warn!("log.json requires the observability feature; using plain output");
    }
}

#[cfg(feature = "observability")]
pub fn init_logging(settings: &LogSettings) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.level.as_str()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let result = if settings.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = result {
        eprintln!("Logger already initialised, keeping the existing one: {}", e);
    }
}
