//! Process-wide `tracing` subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::hub_config::LogFormat;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "fleet_hub=info";

/// Build the filter: `RUST_LOG` wins, then `--verbose`, then the default.
pub fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("fleet_hub=debug,tower_http=debug")
        } else {
            EnvFilter::new(DEFAULT_FILTER)
        }
    })
}

/// Install the global subscriber. A second call is a no-op.
pub fn init_logging(verbose: bool, format: LogFormat) {
    let filter = env_filter(verbose);
    let _ = match format {
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_twice_is_harmless() {
        init_logging(false, LogFormat::Pretty);
        init_logging(true, LogFormat::Json);
        tracing::info!("still logging");
    }
}
