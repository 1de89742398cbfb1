use std::any::Any;

/// Extract the message of a panic payload, if it carries one.
#[must_use]
pub fn panic_message(payload: &(dyn Any + Send)) -> Option<&str> {
    if let Some(s) = payload.downcast_ref::<&str>() {
        Some(*s)
    } else {
        payload.downcast_ref::<String>().map(String::as_str)
    }
}

/// Panic hook that reports through `tracing`, falling back to stderr when no subscriber listens.
pub fn tracing_panic_hook(panic_info: &std::panic::PanicHookInfo) {
    let payload = panic_message(panic_info.payload());
    let location = panic_info.location().map(ToString::to_string);
    let backtrace = std::backtrace::Backtrace::capture();
    let backtrace = (backtrace.status() == std::backtrace::BacktraceStatus::Captured)
        .then(|| backtrace.to_string());
    if tracing::enabled!(tracing::Level::ERROR) {
        tracing::error!(
            panic.payload = payload,
            panic.location = location,
            panic.backtrace = backtrace,
            "A panic occurred"
        );
    } else {
        eprintln!(
            "A panic occurred: {payload} at {location}\n{backtrace}",
            payload = payload.unwrap_or_default(),
            location = location.unwrap_or_default(),
            backtrace = backtrace.unwrap_or_default()
        );
    }
}
