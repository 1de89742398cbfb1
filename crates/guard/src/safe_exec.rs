use concepts::storage::{ErrorSink, FailureRecord};
use concepts::time::ClockFn;
use concepts::{ChangeNotification, HandlerName};
use futures_util::FutureExt;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{Level, error, instrument};

/// Runs handler bodies so that neither errors nor panics escape.
/// Every failure becomes a [`FailureRecord`] in the error sink.
#[derive(Clone)]
pub struct SafeExecutor<C: ClockFn> {
    error_sink: Arc<dyn ErrorSink>,
    clock_fn: C,
}

impl<C: ClockFn> SafeExecutor<C> {
    pub fn new(error_sink: Arc<dyn ErrorSink>, clock_fn: C) -> Self {
        Self {
            error_sink,
            clock_fn,
        }
    }

    /// Returns `None` if the body failed or panicked.
    #[instrument(level = Level::DEBUG, skip_all, fields(%handler_name, event_id = %notification.event_id))]
    pub async fn run<T, E: Display>(
        &self,
        handler_name: &HandlerName,
        notification: &ChangeNotification,
        body: impl Future<Output = Result<T, E>>,
    ) -> Option<T> {
        let error = match AssertUnwindSafe(body).catch_unwind().await {
            Ok(Ok(value)) => return Some(value),
            Ok(Err(err)) => err.to_string(),
            Err(payload) => format!(
                "handler panicked: {}",
                utils::panic_message(&*payload).unwrap_or("unknown panic payload")
            ),
        };
        error!(document_path = %notification.document_path, "Handler failed - {error}");
        let failure = FailureRecord {
            handler_name: handler_name.clone(),
            event_id: notification.event_id.clone(),
            document_path: notification.document_path.clone(),
            error,
            occurred_at: self.clock_fn.now(),
        };
        if let Err(err) = self.error_sink.append_failure(failure.clone()).await {
            error!("Cannot record the failure {failure:?} - {err:?}");
        }
        None
    }
}
