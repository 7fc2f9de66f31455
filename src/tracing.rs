use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};

/// Default filter for the collector binary when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,incremental_collector=info,sqlx=warn,reqwest=warn";

/// Sets up the global tracing subscriber with a fmt formatter and env filter.
///
/// The caller provides a fallback filter string that is used when `RUST_LOG` is
/// not set. `LOG_FORMAT=compact` drops file and line locations for terser
/// scheduler logs.
pub fn init_tracing(default_filter: &str) -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let compact = crate::util::env::env_opt("LOG_FORMAT")
        .is_some_and(|v| v.eq_ignore_ascii_case("compact"));

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(!compact)
        .with_file(!compact)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}
