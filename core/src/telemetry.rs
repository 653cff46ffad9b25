// Tracing setup shared by binaries and ad-hoc tools
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    /// Reads `WARREN_LOG_FORMAT`; anything other than `json` means text.
    pub fn from_env() -> Self {
        match std::env::var("WARREN_LOG_FORMAT") {
            Ok(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

/// Installs the global subscriber.
///
/// `RUST_LOG` wins over `default_filter`. Calling this twice (tests, embedded
/// use) is not an error; the second call leaves the first subscriber in place.
pub fn init_tracing(default_filter: &str) -> bool {
    init_tracing_with(default_filter, LogFormat::from_env())
}

pub fn init_tracing_with(default_filter: &str, format: LogFormat) -> bool {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let installed = match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
            .is_ok(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
            .is_ok(),
    };

    if installed {
        info!(target: "telemetry", format = ?format, "Tracing initialized");
    }
    installed
}
