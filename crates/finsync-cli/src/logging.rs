use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    /// `LOG_FORMAT=json|text`; anything else falls back to text.
    fn parse(raw: Option<&str>) -> Self {
        match raw.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("json") => Self::Json,
            _ => Self::Text,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Text => "text",
        }
    }
}

/// Installs the process-wide subscriber. `RUST_LOG` overrides `default_level`.
pub fn init_logging(command: &str, default_level: &str) -> LogFormat {
    let format = LogFormat::parse(std::env::var("LOG_FORMAT").ok().as_deref());
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if let Err(err) = install(format, filter) {
        // Keep the existing subscriber and say so through it.
        tracing::warn!(error = %err, "tracing subscriber already installed; keeping it");
    }

    tracing::info!(
        command,
        log_format = format.as_str(),
        version = env!("CARGO_PKG_VERSION"),
        "initialized logging"
    );
    format
}

fn install(format: LogFormat, filter: EnvFilter) -> Result<(), TryInitError> {
    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true)
                    .with_span_list(false)
                    .flatten_event(true),
            )
            .try_init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
    }
}
