use concepts::Document;

pub mod sim_clock;

static INIT: std::sync::Once = std::sync::Once::new();

/// Install the test subscriber once per process. Filter with `RUST_LOG`.
pub fn set_up() {
    INIT.call_once(|| {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        std::panic::set_hook(Box::new(utils::tracing_panic_hook));

        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_test_writer()
                    .with_span_events(tracing_subscriber::fmt::format::FmtSpan::NONE),
            )
            .with(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    });
}

/// Build a document from a `json!` object literal.
#[must_use]
pub fn document(value: serde_json::Value) -> Document {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}
