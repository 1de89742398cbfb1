use std::fmt::Debug;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{Level, debug, error, instrument, trace, warn};

/// Handle of a background loop. Closing waits for the current iteration to finish,
/// dropping an unclosed handle aborts the task.
#[derive(derive_more::Debug)]
pub struct TaskHandle {
    name: &'static str,
    #[debug(skip)]
    is_closing: Arc<AtomicBool>,
    #[debug(skip)]
    abort_handle: AbortHandle,
}

impl TaskHandle {
    pub(crate) fn new(
        name: &'static str,
        is_closing: Arc<AtomicBool>,
        abort_handle: AbortHandle,
    ) -> Self {
        Self {
            name,
            is_closing,
            abort_handle,
        }
    }

    #[instrument(level = Level::DEBUG, skip_all, name = "task.close", fields(task = self.name))]
    pub async fn close(&self) {
        trace!("Gracefully closing");
        self.is_closing.store(true, Ordering::Relaxed);
        while !self.abort_handle.is_finished() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        debug!("Gracefully closed {}", self.name);
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        if self.abort_handle.is_finished() {
            return;
        }
        warn!("Aborting the {}", self.name);
        self.abort_handle.abort();
    }
}

/// Log the error unless it is the same as the one reported by the previous tick.
pub(crate) fn log_err_if_new<T, E: PartialEq + Debug>(
    res: Result<T, E>,
    old_err: &mut Option<E>,
    task: &'static str,
) {
    match (res, &old_err) {
        (Ok(_), _) => {
            *old_err = None;
        }
        (Err(err), Some(old)) if err == *old => {}
        (Err(err), _) => {
            error!("{task} tick failed: {err:?}");
            *old_err = Some(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concepts::storage::DbErrorGeneric;

    #[tokio::test]
    async fn close_should_wait_for_the_loop() {
        let is_closing = Arc::new(AtomicBool::default());
        let abort_handle = tokio::spawn({
            let is_closing = is_closing.clone();
            async move {
                while !is_closing.load(Ordering::Relaxed) {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
        })
        .abort_handle();
        let handle = TaskHandle::new("test loop", is_closing, abort_handle.clone());
        handle.close().await;
        assert!(abort_handle.is_finished());
    }

    #[test]
    fn repeated_error_is_remembered() {
        let mut old_err = None;
        log_err_if_new::<(), _>(Err(DbErrorGeneric::Close), &mut old_err, "test");
        assert_eq!(Some(DbErrorGeneric::Close), old_err);
        log_err_if_new::<(), _>(Err(DbErrorGeneric::Close), &mut old_err, "test");
        assert_eq!(Some(DbErrorGeneric::Close), old_err);
        log_err_if_new::<(), DbErrorGeneric>(Ok(()), &mut old_err, "test");
        assert_eq!(None, old_err);
    }
}
