//! Structured logging for the droptest binaries.
//!
//! Events are written to stderr so stdout only carries command output. Plain
//! text is the default; `json_format` switches to one JSON object per line
//! for log shippers. `RUST_LOG` overrides the configured level.

use tracing::{Level, Subscriber};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Crates whose events pass the filter when `RUST_LOG` is unset.
const LOGGED_CRATES: [&str; 2] = ["dt_core", "dt_cli"];

/// How log events are filtered and rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: Level,
    pub json_format: bool,
    /// Emit an event when a span opens and closes.
    pub include_spans: bool,
    /// Source file and line of each event.
    pub include_location: bool,
    /// Module path of each event.
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
            include_spans: false,
            include_location: false,
            include_target: true,
        }
    }
}

impl LoggingConfig {
    /// Debug level with span and location details, for `--verbose` runs.
    pub fn verbose() -> Self {
        Self {
            level: Level::DEBUG,
            include_spans: true,
            include_location: true,
            ..Self::default()
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_json(mut self, json_format: bool) -> Self {
        self.json_format = json_format;
        self
    }

    /// Filter directive used when `RUST_LOG` is not set.
    pub fn default_directive(&self) -> String {
        LOGGED_CRATES
            .iter()
            .map(|krate| format!("{}={}", krate, self.level))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// `RUST_LOG` if it parses, otherwise [`Self::default_directive`].
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.default_directive()))
    }
}

/// Assembles a subscriber that renders through `config` into `writer`.
pub fn build_subscriber<W>(
    config: &LoggingConfig,
    filter: EnvFilter,
    writer: W,
) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let span_events = if config.include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = fmt::layer()
        .with_writer(writer)
        .with_span_events(span_events)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_target(config.include_target);
    let layer: Box<dyn Layer<Registry> + Send + Sync> = if config.json_format {
        layer.json().boxed()
    } else {
        layer.boxed()
    };

    Box::new(tracing_subscriber::registry().with(layer).with(filter))
}

/// Installs stderr logging with the default configuration.
pub fn init_logging() {
    init_logging_with_config(LoggingConfig::default());
}

/// Installs stderr logging. Only the first call in a process takes effect.
pub fn init_logging_with_config(config: LoggingConfig) {
    let subscriber = build_subscriber(&config, config.env_filter(), std::io::stderr);
    let _ = subscriber.try_init();
}

/// Creates a span for work on one decision.
#[macro_export]
macro_rules! decision_span {
    ($decision_id:expr) => {
        tracing::info_span!("decision", decision_id = %$decision_id)
    };
    ($decision_id:expr, $($field:tt)*) => {
        tracing::info_span!("decision", decision_id = %$decision_id, $($field)*)
    };
}
