//! Project-wide utility for initializing tracing output.
use serde::Deserialize;
use snafu::ResultExt;
use std::env;
use tracing::Subscriber;
use tracing_subscriber::{filter::LevelFilter, fmt, layer::SubscriberExt, EnvFilter, Registry};

const DEFAULT_FILTER_DIRECTIVE: LevelFilter = LevelFilter::INFO;

const LOG_FILTER_ENV_VAR: &str = "NODEREFRESH_LOG_FILTER";
const LOG_FORMAT_ENV_VAR: &str = "NODEREFRESH_LOG_FORMAT";
const LOG_ANSI_ENV_VAR: &str = "NODEREFRESH_LOG_ANSI";

/// Logging configuration gathered from the environment: the event format and whether ANSI
/// colors are emitted. The filter directive is handled separately by `EnvFilter`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct LoggingConfig {
    format: LogFormat,
    ansi: bool,
}

/// The format used for emitted tracing events.
///
/// See https://docs.rs/tracing-subscriber/latest/tracing_subscriber/fmt/format/index.html
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable, single-line logs for each event.
    #[default]
    Full,
    /// A variant of the default formatter optimized for short line lengths.
    Compact,
    /// Pretty-formatted multi-line logs optimized for human readability.
    Pretty,
    /// Newline-delimited JSON logs.
    Json,
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self> {
        let format = match env::var(LOG_FORMAT_ENV_VAR) {
            Ok(raw) => serde_plain::from_str(&raw).context(error::LogFormatEnvSnafu {
                env_value: raw.clone(),
            })?,
            Err(_) => LogFormat::default(),
        };

        let ansi = match env::var(LOG_ANSI_ENV_VAR) {
            Ok(raw) => raw
                .to_lowercase()
                .parse()
                .context(error::LogAnsiEnvSnafu { env_value: raw })?,
            Err(_) => false,
        };

        Ok(Self { format, ansi })
    }

    /// Adds the configured formatting layer to a tracing event subscriber.
    fn add_format_layer<S>(&self, event_subscriber: S) -> Box<dyn Subscriber + Send + Sync>
    where
        S: SubscriberExt + Send + Sync + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    {
        // Quite repetitious, but the layers are all different types and the subscriber won't
        // accept them boxed.
        match self.format {
            LogFormat::Full => Box::new(event_subscriber.with(fmt::layer().with_ansi(self.ansi))),
            LogFormat::Compact => {
                Box::new(event_subscriber.with(fmt::layer().compact().with_ansi(self.ansi)))
            }
            LogFormat::Pretty => {
                Box::new(event_subscriber.with(fmt::layer().pretty().with_ansi(self.ansi)))
            }
            LogFormat::Json => {
                Box::new(event_subscriber.with(fmt::layer().json().with_ansi(self.ansi)))
            }
        }
    }
}

pub fn init_telemetry_from_env() -> Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(DEFAULT_FILTER_DIRECTIVE.into())
        .with_env_var(LOG_FILTER_ENV_VAR)
        .from_env_lossy();

    let subscriber = Registry::default().with(env_filter);
    let subscriber = LoggingConfig::from_env()?.add_format_layer(subscriber);

    tracing::subscriber::set_global_default(subscriber).context(error::TracingConfigurationSnafu)?;

    Ok(())
}

pub mod error {
    use std::str::ParseBoolError;

    use super::*;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum TelemetryConfigError {
        #[snafu(display("Error configuring tracing: '{}'", source))]
        TracingConfiguration {
            source: tracing::subscriber::SetGlobalDefaultError,
        },

        #[snafu(display(
            "Could not parse log format from environment variable '{}={}': '{}'",
            LOG_FORMAT_ENV_VAR,
            env_value,
            source
        ))]
        LogFormatEnv {
            source: serde_plain::Error,
            env_value: String,
        },

        #[snafu(display(
            "Could not parse ANSI enablement from environment variable '{}={}': '{}'",
            LOG_ANSI_ENV_VAR,
            env_value,
            source
        ))]
        LogAnsiEnv {
            source: ParseBoolError,
            env_value: String,
        },
    }
}

type Result<T> = std::result::Result<T, TelemetryConfigError>;
pub use error::TelemetryConfigError;
