//! Logging setup for the scheduler and its worker processes
//!
//! Everything logs through `tracing`; this module only installs the
//! subscriber. Worker processes log to stderr because their stdout carries
//! the wire protocol.

use std::path::Path;
use tracing::Level;
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{
    filter::Directive,
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    Stderr,
    /// Daily-rotated files
    File { directory: String, prefix: String },
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    pub output: LogOutput,
    /// Emit span open/close events
    pub span_events: bool,
    /// Extra directives, e.g. `analysis_scheduler::pool=trace`
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Compact,
            output: LogOutput::Stderr,
            span_events: false,
            filter: None,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

/// Install the global subscriber.
///
/// Keep the returned guard alive until exit so buffered lines are flushed.
/// Returns `None` if a subscriber was already installed.
pub fn init_logging(config: LogConfig) -> Option<WorkerGuard> {
    let filter = build_filter(&config);

    let (layer, guard) = match &config.output {
        LogOutput::Stdout => {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
            (format_layer(config.format, writer, config.span_events), guard)
        }
        LogOutput::Stderr => {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
            (format_layer(config.format, writer, config.span_events), guard)
        }
        LogOutput::File { directory, prefix } => {
            let (writer, guard) = tracing_appender::non_blocking(rolling::daily(directory, prefix));
            (format_layer(config.format, writer, config.span_events), guard)
        }
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
        .ok()
        .map(|()| guard)
}

fn format_layer<W>(format: LogFormat, writer: W, span_events: bool) -> BoxedLayer
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_span_events(span_events_config(span_events));

    match format {
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

fn build_filter(config: &LogConfig) -> EnvFilter {
    let base = EnvFilter::from_default_env().add_directive(config.level.into());

    match &config.filter {
        Some(directives) => directives
            .split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .fold(base, |filter, directive| match directive.parse::<Directive>() {
                Ok(parsed) => filter.add_directive(parsed),
                Err(e) => {
                    tracing::warn!(directive, error = %e, "Invalid filter directive");
                    filter
                }
            }),
        None => base,
    }
}

fn span_events_config(enabled: bool) -> FmtSpan {
    if enabled {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

/// Verbose, human-readable logging on stderr.
pub fn init_dev_logging() -> Option<WorkerGuard> {
    init_logging(LogConfig {
        level: Level::DEBUG,
        format: LogFormat::Pretty,
        output: LogOutput::Stderr,
        span_events: true,
        filter: Some("analysis_scheduler=debug".to_string()),
    })
}

/// JSON lines into daily files under `log_dir`.
pub fn init_prod_logging(log_dir: impl AsRef<Path>) -> Option<WorkerGuard> {
    init_logging(LogConfig {
        level: Level::INFO,
        format: LogFormat::Json,
        output: LogOutput::File {
            directory: log_dir.as_ref().to_string_lossy().to_string(),
            prefix: "analysis-scheduler".to_string(),
        },
        span_events: false,
        filter: Some("analysis_scheduler=info".to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = LogConfig::new()
            .with_level(Level::DEBUG)
            .with_format(LogFormat::Json)
            .with_output(LogOutput::Stdout)
            .with_span_events(true)
            .with_filter("analysis_scheduler::pool=trace");

        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.output, LogOutput::Stdout);
        assert!(config.span_events);
        assert_eq!(config.filter.as_deref(), Some("analysis_scheduler::pool=trace"));
    }

    #[test]
    fn test_invalid_directives_are_skipped() {
        let config = LogConfig::new()
            .with_filter("analysis_scheduler=debug, ,analysis_scheduler::pool=loud");
        let filter = build_filter(&config);
        assert!(filter.to_string().contains("analysis_scheduler=debug"));
    }

    #[test]
    fn test_second_install_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let output = LogOutput::File {
            directory: dir.path().to_string_lossy().to_string(),
            prefix: "test".to_string(),
        };
        let _first = init_logging(LogConfig::new().with_output(output.clone()));
        assert!(init_logging(LogConfig::new().with_output(output)).is_none());
    }
}
