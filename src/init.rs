use crate::config::toml::ConfigToml;
use crate::config::toml::log::{AppenderCommon, LoggingStyle};
use anyhow::Context as _;
use std::path::Path;
use tracing::Subscriber;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::registry::LookupSpan;

#[cfg(feature = "tokio-console")]
fn tokio_console_layer<S>() -> Option<impl tracing_subscriber::Layer<S>>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    if crate::env_vars::is_env_true(crate::env_vars::SupportedEnvVar::TOKIO_CONSOLE) {
        // Run with
        // TOKIO_CONSOLE=true RUSTFLAGS="--cfg tokio_unstable" cargo run --features tokio-console -- server run
        Some(
            console_subscriber::spawn().with_filter(
                tracing_subscriber::filter::Targets::new()
                    .with_target("tokio", tracing::Level::TRACE)
                    .with_target("runtime", tracing::Level::TRACE),
            ),
        )
    } else {
        None
    }
}
#[cfg(not(feature = "tokio-console"))]
fn tokio_console_layer() -> Option<tracing::level_filters::LevelFilter> {
    None
}

#[cfg(feature = "otlp")]
type TracerProvider = opentelemetry_sdk::trace::SdkTracerProvider;
#[cfg(not(feature = "otlp"))]
type TracerProvider = ();

#[cfg(feature = "otlp")]
fn otlp_layer<S>(
    config: &mut ConfigToml,
) -> Result<(Option<impl Layer<S>>, Option<TracerProvider>), anyhow::Error>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_otlp::WithExportConfig as _;
    use opentelemetry_sdk::Resource;
    use opentelemetry_sdk::propagation::TraceContextPropagator;

    let Some(otlp) = config.otlp.as_mut().filter(|otlp| otlp.enabled) else {
        return Ok((None, None));
    };
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(otlp.otlp_endpoint.clone())
        .build()
        .context("cannot setup otlp exporter")?;
    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(
            Resource::builder()
                .with_service_name(otlp.service_name.clone())
                .build(),
        )
        .build();
    let tracer = provider.tracer("tripwire");
    opentelemetry::global::set_tracer_provider(provider.clone());
    // EnvFilter missing Clone
    let env_filter = std::mem::take(&mut otlp.level).0;
    let layer = tracing_opentelemetry::layer()
        .with_tracer(tracer)
        .with_filter(env_filter);
    Ok((Some(layer), Some(provider)))
}
#[cfg(not(feature = "otlp"))]
#[allow(clippy::unnecessary_wraps)]
fn otlp_layer(
    _config: &mut ConfigToml,
) -> Result<(Option<tracing::level_filters::LevelFilter>, Option<TracerProvider>), anyhow::Error> {
    Ok((None, None))
}

fn fmt_layer<S, W>(
    style: LoggingStyle,
    common: &mut AppenderCommon,
    writer: W,
    ansi: bool,
) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    // EnvFilter missing Clone
    let env_filter = std::mem::take(&mut common.level).0;
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(common.target)
        .with_span_events(common.span.into());
    match style {
        LoggingStyle::Plain => layer.with_filter(env_filter).boxed(),
        LoggingStyle::PlainCompact => layer.compact().with_filter(env_filter).boxed(),
        LoggingStyle::Json => layer.json().with_filter(env_filter).boxed(),
    }
}

/// Install the global subscriber. `log_directory` must exist when file logging is configured.
pub(crate) fn init(
    config: &mut ConfigToml,
    log_directory: Option<&Path>,
) -> Result<Guard, anyhow::Error> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let out_layer = config
        .log
        .stdout
        .as_mut()
        .filter(|stdout| stdout.enabled)
        .map(|stdout| fmt_layer(stdout.style, &mut stdout.common, std::io::stdout, true));

    let (file_layer, file_guard) = match (config.log.file.as_mut(), log_directory) {
        (Some(file), Some(log_directory)) => {
            let appender = tracing_appender::rolling::RollingFileAppender::builder()
                .rotation(file.rotation.into())
                .filename_prefix(&file.prefix)
                .build(log_directory)
                .with_context(|| format!("cannot create log file in {log_directory:?}"))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt_layer(file.style, &mut file.common, writer, false)),
                Some(guard),
            )
        }
        _ => (None, None),
    };
    let (otlp_layer, tracer_provider) = otlp_layer(config)?;

    tracing_subscriber::registry()
        .with(tokio_console_layer())
        .with(otlp_layer)
        .with(out_layer)
        .with(file_layer)
        .try_init()
        .context("cannot install the tracing subscriber")?;

    std::panic::set_hook(Box::new(utils::tracing_panic_hook));
    Ok(Guard {
        _file_guard: file_guard,
        tracer_provider,
    })
}

pub(crate) struct Guard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
    #[cfg_attr(not(feature = "otlp"), allow(dead_code))]
    tracer_provider: Option<TracerProvider>,
}

impl Drop for Guard {
    fn drop(&mut self) {
        cfg_if::cfg_if! {
            if #[cfg(feature = "otlp")] {
                if let Some(provider) = self.tracer_provider.take()
                    && let Err(err) = provider.shutdown()
                {
                    eprintln!("cannot shut down the tracer provider - {err:?}");
                }
            }
        }
    }
}
