use super::config_holder::{DATA_DIR_PREFIX, PathPrefixes};
use concepts::HandlerName;
use concepts::storage::DEFAULT_LEDGER_RETENTION;
use concepts::time::ClockFn;
use db_sqlite::sqlite_dao::SqliteConfig;
use guard::invocation_monitor::{DEFAULT_THRESHOLD, DEFAULT_WINDOW, MonitorConfig};
use guard::ledger_retention::RetentionConfig;
use log::{LoggingConfig, LoggingStyle};
use serde::Deserialize;
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

const DEFAULT_SQLITE_FILE_IF_PROJECT_DIRS: &str =
    const_format::formatcp!("{}tripwire.sqlite", DATA_DIR_PREFIX);
const DEFAULT_SQLITE_FILE: &str = "tripwire.sqlite";
const DEFAULT_LISTENING_ADDR: &str = "127.0.0.1:5006";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub(crate) struct ConfigToml {
    #[serde(default)]
    pub(crate) api: ApiConfig,
    #[serde(default)]
    pub(crate) sqlite: SqliteConfigToml,
    #[serde(default)]
    pub(crate) dispatcher: DispatcherConfigToml,
    #[serde(default)]
    pub(crate) monitor: MonitorConfigToml,
    #[serde(default)]
    pub(crate) retention: RetentionConfigToml,
    #[serde(default)]
    pub(crate) handlers: HandlersConfigToml,
    #[cfg(feature = "otlp")]
    #[serde(default)]
    pub(crate) otlp: Option<otlp::OtlpConfig>,
    #[serde(default)]
    pub(crate) log: LoggingConfig,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub(crate) enabled: bool,
    #[serde(default = "default_listening_addr")]
    pub(crate) listening_addr: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            listening_addr: default_listening_addr(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub(crate) struct SqliteConfigToml {
    #[serde(default)]
    file: Option<String>,
    queue_capacity: Option<usize>,
    low_prio_threshold: Option<usize>,
    #[serde(default)]
    metrics_threshold: Option<DurationConfig>,
}

impl SqliteConfigToml {
    pub(crate) async fn get_sqlite_file(
        &self,
        path_prefixes: &PathPrefixes,
    ) -> Result<PathBuf, anyhow::Error> {
        let sqlite_file = self.file.as_deref().unwrap_or_else(|| {
            if path_prefixes.project_dirs.is_some() {
                DEFAULT_SQLITE_FILE_IF_PROJECT_DIRS
            } else {
                DEFAULT_SQLITE_FILE
            }
        });
        path_prefixes.replace_file_prefix_mkdir_parent(sqlite_file).await
    }

    pub(crate) fn as_config(&self) -> SqliteConfig {
        let def = SqliteConfig::default();
        SqliteConfig {
            queue_capacity: self.queue_capacity.unwrap_or(def.queue_capacity),
            low_prio_threshold: self.low_prio_threshold.unwrap_or(def.low_prio_threshold),
            metrics_threshold: self.metrics_threshold.map(Duration::from),
            ..def
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub(crate) struct DispatcherConfigToml {
    #[serde(default)]
    pub(crate) max_inflight: InflightSemaphore,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct MonitorConfigToml {
    #[serde(default = "default_enabled")]
    pub(crate) enabled: bool,
    #[serde(default = "default_monitor_window")]
    tick_sleep: DurationConfig,
    #[serde(default = "default_monitor_window")]
    window: DurationConfig,
    #[serde(default = "default_threshold")]
    default_threshold: u64,
    /// Per-handler overrides of `default_threshold`.
    #[serde(default)]
    thresholds: hashbrown::HashMap<String, u64>,
}

impl Default for MonitorConfigToml {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            tick_sleep: default_monitor_window(),
            window: default_monitor_window(),
            default_threshold: default_threshold(),
            thresholds: hashbrown::HashMap::new(),
        }
    }
}

impl MonitorConfigToml {
    /// Keys of `thresholds` are matched against `known` ignoring case, as the config
    /// loader may lowercase them.
    pub(crate) fn as_config<C: ClockFn>(
        &self,
        known: &[HandlerName],
        clock_fn: C,
    ) -> MonitorConfig<C> {
        MonitorConfig {
            tick_sleep: self.tick_sleep.into(),
            window: self.window.into(),
            default_threshold: self.default_threshold,
            thresholds: self
                .thresholds
                .iter()
                .map(|(name, threshold)| {
                    let handler_name = known
                        .iter()
                        .find(|known| known.eq_ignore_ascii_case(name))
                        .cloned()
                        .unwrap_or_else(|| HandlerName::from(name.as_str()));
                    (handler_name, *threshold)
                })
                .collect(),
            clock_fn,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RetentionConfigToml {
    #[serde(default = "default_enabled")]
    pub(crate) enabled: bool,
    #[serde(default = "default_retention_tick_sleep")]
    tick_sleep: DurationConfig,
    #[serde(default = "default_retention_horizon")]
    horizon: DurationConfig,
    #[serde(default = "default_retention_batch_size")]
    batch_size: u32,
}

impl Default for RetentionConfigToml {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            tick_sleep: default_retention_tick_sleep(),
            horizon: default_retention_horizon(),
            batch_size: default_retention_batch_size(),
        }
    }
}

impl RetentionConfigToml {
    pub(crate) fn as_config<C: ClockFn>(&self, clock_fn: C) -> RetentionConfig<C> {
        RetentionConfig {
            tick_sleep: self.tick_sleep.into(),
            horizon: self.horizon.into(),
            batch_size: self.batch_size,
            clock_fn,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub(crate) struct HandlersConfigToml {
    /// Names of handlers that must not be dispatched.
    #[serde(default)]
    pub(crate) disabled: Vec<String>,
}

#[cfg(feature = "otlp")]
pub(crate) mod otlp {
    use super::{Deserialize, log};
    use log::EnvFilter;

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub(crate) struct OtlpConfig {
        pub(crate) enabled: bool,
        #[serde(default)]
        pub(crate) level: EnvFilter,
        #[serde(default = "default_service_name")]
        pub(crate) service_name: String,
        #[serde(default = "default_otlp_endpoint")]
        pub(crate) otlp_endpoint: String,
    }

    fn default_service_name() -> String {
        "tripwire-server".to_string()
    }

    fn default_otlp_endpoint() -> String {
        // Default OTLP gRPC port
        "http://localhost:4317".to_string()
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Hash, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub(crate) enum DurationConfig {
    Secs(u64),
    Millis(u64),
}

impl From<DurationConfig> for Duration {
    fn from(value: DurationConfig) -> Self {
        match value {
            DurationConfig::Millis(millis) => Duration::from_millis(millis),
            DurationConfig::Secs(secs) => Duration::from_secs(secs),
        }
    }
}

pub(crate) mod log {
    use super::{Deserialize, default_out_style};
    use serde_with::serde_as;
    use std::str::FromStr;

    #[derive(Debug, Deserialize, Default)]
    #[serde(deny_unknown_fields)]
    pub(crate) struct LoggingConfig {
        #[serde(default)]
        pub(crate) file: Option<AppenderRollingFile>,
        #[serde(default)]
        pub(crate) stdout: Option<AppenderOut>,
    }

    #[derive(Debug, Deserialize, Default, Copy, Clone)]
    #[serde(rename_all = "snake_case")]
    pub(crate) enum SpanConfig {
        /// spans are ignored (this is the default)
        #[default]
        None,
        /// one event when span is created
        New,
        /// one event per enter of a span
        Enter,
        /// one event per exit of a span
        Exit,
        /// one event when the span is dropped
        Close,
        /// one event per enter/exit of a span
        Active,
        /// events at all points (new, enter, exit, drop)
        Full,
    }

    impl From<SpanConfig> for tracing_subscriber::fmt::format::FmtSpan {
        fn from(value: SpanConfig) -> Self {
            match value {
                SpanConfig::None => Self::NONE,
                SpanConfig::New => Self::NEW,
                SpanConfig::Enter => Self::ENTER,
                SpanConfig::Exit => Self::EXIT,
                SpanConfig::Close => Self::CLOSE,
                SpanConfig::Active => Self::ACTIVE,
                SpanConfig::Full => Self::FULL,
            }
        }
    }

    #[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
    #[serde(rename_all = "snake_case")]
    pub(crate) enum LoggingStyle {
        #[default]
        Plain,
        PlainCompact,
        Json,
    }

    #[serde_as]
    #[derive(Debug, Deserialize, Default)]
    #[serde(deny_unknown_fields)]
    pub(crate) struct AppenderCommon {
        #[serde(default)]
        pub(crate) level: EnvFilter,
        #[serde(default)]
        pub(crate) span: SpanConfig,
        #[serde(default)]
        pub(crate) target: bool,
    }

    #[derive(Debug, serde_with::DeserializeFromStr)]
    pub(crate) struct EnvFilter(pub(crate) tracing_subscriber::EnvFilter);
    impl FromStr for EnvFilter {
        type Err = tracing_subscriber::filter::ParseError;

        fn from_str(directives: &str) -> Result<Self, Self::Err> {
            tracing_subscriber::EnvFilter::builder()
                .parse(directives)
                .map(Self)
        }
    }
    impl Default for EnvFilter {
        fn default() -> Self {
            Self::from_str("info,tripwire=debug,tripwire_guard=debug")
                .expect("default directives must parse")
        }
    }

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub(crate) struct AppenderOut {
        pub(crate) enabled: bool,
        #[serde(flatten, default)]
        pub(crate) common: AppenderCommon,
        #[serde(default = "default_out_style")]
        pub(crate) style: LoggingStyle,
    }

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub(crate) struct AppenderRollingFile {
        #[serde(flatten, default)]
        pub(crate) common: AppenderCommon,
        pub(crate) directory: String,
        pub(crate) prefix: String,
        pub(crate) rotation: Rotation,
        #[serde(default)]
        pub(crate) style: LoggingStyle,
    }

    #[derive(Debug, Deserialize, Clone, Copy)]
    #[serde(rename_all = "snake_case")]
    pub(crate) enum Rotation {
        Minutely,
        Hourly,
        Daily,
        Never,
    }
    impl From<Rotation> for tracing_appender::rolling::Rotation {
        fn from(value: Rotation) -> Self {
            match value {
                Rotation::Minutely => Self::MINUTELY,
                Rotation::Hourly => Self::HOURLY,
                Rotation::Daily => Self::DAILY,
                Rotation::Never => Self::NEVER,
            }
        }
    }
}

#[derive(Debug, Deserialize, Hash)]
#[serde(untagged)]
pub(crate) enum InflightSemaphore {
    Unlimited(Unlimited),
    Some(u32),
}

impl Default for InflightSemaphore {
    fn default() -> Self {
        Self::Some(100)
    }
}

#[derive(Debug, Default, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Unlimited {
    #[default]
    Unlimited,
}

impl From<&InflightSemaphore> for Option<Arc<tokio::sync::Semaphore>> {
    fn from(value: &InflightSemaphore) -> Self {
        match value {
            InflightSemaphore::Unlimited(_) => None,
            InflightSemaphore::Some(permits) => Some(Arc::new(tokio::sync::Semaphore::new(
                usize::try_from(*permits).expect("usize >= u32"),
            ))),
        }
    }
}

const fn default_api_enabled() -> bool {
    true
}

fn default_listening_addr() -> SocketAddr {
    DEFAULT_LISTENING_ADDR
        .parse()
        .expect("default listening address must parse")
}

const fn default_enabled() -> bool {
    true
}

const fn default_monitor_window() -> DurationConfig {
    DurationConfig::Secs(DEFAULT_WINDOW.as_secs())
}

const fn default_threshold() -> u64 {
    DEFAULT_THRESHOLD
}

const fn default_retention_tick_sleep() -> DurationConfig {
    DurationConfig::Secs(60 * 60)
}

const fn default_retention_horizon() -> DurationConfig {
    DurationConfig::Secs(DEFAULT_LEDGER_RETENTION.as_secs())
}

const fn default_retention_batch_size() -> u32 {
    500
}

fn default_out_style() -> LoggingStyle {
    LoggingStyle::PlainCompact
}

#[cfg(test)]
mod tests {
    use super::*;
    use concepts::time::Now;

    fn parse(toml: &str) -> ConfigToml {
        ::toml::from_str(toml).unwrap()
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = parse("");
        assert!(config.api.enabled);
        assert_eq!(
            "127.0.0.1:5006".parse::<SocketAddr>().unwrap(),
            config.api.listening_addr
        );
        let monitor = config.monitor.as_config(&[], Now);
        assert_eq!(Duration::from_secs(300), monitor.window);
        assert_eq!(1000, monitor.default_threshold);
        let retention = config.retention.as_config(Now);
        assert_eq!(Duration::from_secs(7 * 24 * 60 * 60), retention.horizon);
        assert_eq!(500, retention.batch_size);
        assert!(config.handlers.disabled.is_empty());
    }

    #[test]
    fn monitor_thresholds_and_durations() {
        let config = parse(
            r#"
            [monitor]
            tick_sleep.millis = 500
            window.secs = 60
            default_threshold = 10
            thresholds = { incrementlogincount = 3 }
            "#,
        );
        let monitor = config
            .monitor
            .as_config(&[HandlerName::from("incrementLoginCount")], Now);
        assert_eq!(Duration::from_millis(500), monitor.tick_sleep);
        assert_eq!(Duration::from_secs(60), monitor.window);
        assert_eq!(
            Some(&3),
            monitor.thresholds.get(&HandlerName::from("incrementLoginCount"))
        );
    }

    #[test]
    fn inflight_semaphore_accepts_number_or_unlimited() {
        let config = parse("dispatcher.max_inflight = \"unlimited\"");
        let limiter: Option<Arc<tokio::sync::Semaphore>> =
            (&config.dispatcher.max_inflight).into();
        assert!(limiter.is_none());

        let config = parse("dispatcher.max_inflight = 4");
        let limiter: Option<Arc<tokio::sync::Semaphore>> =
            (&config.dispatcher.max_inflight).into();
        assert_eq!(4, limiter.unwrap().available_permits());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(::toml::from_str::<ConfigToml>("[monitor]\nwindoww.secs = 1").is_err());
    }

    #[test]
    fn log_stdout_style() {
        let config = parse(
            r#"
            [log.stdout]
            enabled = true
            level = "debug"
            style = "json"
            "#,
        );
        let stdout = config.log.stdout.unwrap();
        assert!(stdout.enabled);
        assert_eq!(LoggingStyle::Json, stdout.style);
    }
}
