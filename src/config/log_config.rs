use serde::Deserialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;

#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Compact,
    #[default]
    Full,
}

#[derive(Deserialize, Clone, Debug)]
pub struct LogConfig {
    #[serde(default = "default_filter_level")]
    pub filter_level: String,
    #[serde(default = "default_true")]
    pub with_ansi: bool,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default = "default_true")]
    pub with_target: bool,
    #[serde(default = "default_true")]
    pub with_source_location: bool,
}

fn default_filter_level() -> String {
    "info".into()
}

fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter_level: default_filter_level(),
            with_ansi: true,
            format: LogFormat::default(),
            with_target: true,
            with_source_location: true,
        }
    }
}

impl LogConfig {
    /// Init tracing.
    ///
    /// Caller should hold the guard.
    pub fn guard(&self) -> WorkerGuard {
        let (non_blocking, guard) =
            tracing_appender::non_blocking(std::io::stdout());

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or(tracing_subscriber::EnvFilter::new(
                        &self.filter_level,
                    )),
            )
            .with_ansi(self.with_ansi)
            .with_writer(non_blocking);

        let subscriber = subscriber.event_format(
            fmt::format()
                .with_target(self.with_target)
                .with_source_location(self.with_source_location),
        );

        match self.format {
            LogFormat::Pretty => subscriber.pretty().init(),
            LogFormat::Compact => subscriber.compact().init(),
            LogFormat::Full => subscriber.init(),
        }

        guard
    }
}
