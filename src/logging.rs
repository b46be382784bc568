use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT_TRACING: Once = Once::new();

/// Install a compact fmt subscriber. `RUST_LOG` takes precedence over `default_filter`.
/// Later calls are no-ops, as is a call made after another global subscriber was set.
pub fn init_tracing(default_filter: &str) {
    INIT_TRACING.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .compact()
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}
