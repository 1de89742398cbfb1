use crate::TaskHandle;
use crate::decision::{DecisionReason, Guard};
use crate::handler::{Effect, Handler, HandlerContext, HandlerError};
use crate::safe_exec::SafeExecutor;
use crate::tagger;
use chrono::{DateTime, Utc};
use concepts::storage::{DbErrorWrite, DbPool, DocumentStore};
use concepts::time::ClockFn;
use concepts::{ChangeNotification, ChangeRecord, HandlerName};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{Instrument, Level, debug, info_span, instrument, trace};

const FEED_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default)]
pub struct DispatcherConfig {
    /// Bounds the number of concurrently running deliveries.
    pub task_limiter: Option<Arc<Semaphore>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Skipped(DecisionReason),
    /// Number of effects written.
    Applied(usize),
    /// The failure was recorded in the error sink.
    Failed,
}

#[derive(Debug, thiserror::Error)]
enum DeliveryError {
    #[error(transparent)]
    Handler(#[from] HandlerError),
    #[error("cannot apply the effects: {0}")]
    Write(#[from] DbErrorWrite),
}

/// Routes committed changes to the registered handlers through the guard.
pub struct Dispatcher<C: ClockFn> {
    handlers: Vec<Arc<dyn Handler>>,
    guard: Guard<C>,
    safe_exec: SafeExecutor<C>,
    document_store: Arc<dyn DocumentStore>,
    clock_fn: C,
}

impl<C: ClockFn> Dispatcher<C> {
    pub fn new(handlers: Vec<Arc<dyn Handler>>, db_pool: &dyn DbPool, clock_fn: C) -> Self {
        Self {
            handlers,
            guard: Guard::new(db_pool.event_ledger(), clock_fn.clone()),
            safe_exec: SafeExecutor::new(db_pool.error_sink(), clock_fn.clone()),
            document_store: db_pool.document_store(),
            clock_fn,
        }
    }

    #[must_use]
    pub fn handlers(&self) -> &[Arc<dyn Handler>] {
        &self.handlers
    }

    fn subscribers<'a>(
        &'a self,
        change: &'a ChangeRecord,
    ) -> impl Iterator<Item = &'a Arc<dyn Handler>> + 'a {
        let kind = change.kind();
        self.handlers
            .iter()
            .filter(move |handler| handler.decl().subscribes_to(&change.document_path, kind))
    }

    /// Deliver the change to every subscribed handler, one after another.
    pub async fn dispatch(&self, change: &ChangeRecord) -> Vec<(HandlerName, DispatchOutcome)> {
        let mut outcomes = Vec::new();
        for handler in self.subscribers(change) {
            let name = handler.decl().name.clone();
            let notification = ChangeNotification::new(change, &name, self.clock_fn.now());
            let outcome = self.deliver(handler.as_ref(), notification).await;
            outcomes.push((name, outcome));
        }
        outcomes
    }

    /// Run a single delivery: guard, handler, then the tagged effects.
    /// Calling this again with the same notification simulates a redelivery.
    #[instrument(level = Level::DEBUG, skip_all, fields(handler_name = %handler.decl().name, event_id = %notification.event_id))]
    pub async fn deliver(
        &self,
        handler: &dyn Handler,
        notification: ChangeNotification,
    ) -> DispatchOutcome {
        let decl = handler.decl();
        let decision = self
            .guard
            .decide(
                &notification.event_id,
                &decl.name,
                notification.before.as_deref(),
                notification.after.as_deref(),
                &decl.watched_fields,
            )
            .await;
        if !decision.proceed {
            return DispatchOutcome::Skipped(decision.reason);
        }
        let ctx = HandlerContext {
            notification,
            changed_fields: decision.changed_fields,
            now: self.clock_fn.now(),
        };
        let applied = self
            .safe_exec
            .run(&decl.name, &ctx.notification, async {
                let effects = handler.handle(&ctx).await?;
                let applied = self.apply(&decl.name, effects, ctx.now).await?;
                Ok::<_, DeliveryError>(applied)
            })
            .await;
        match applied {
            Some(applied) => {
                debug!(changed_fields = ?ctx.changed_fields, "Applied {applied} effect(s)");
                DispatchOutcome::Applied(applied)
            }
            None => DispatchOutcome::Failed,
        }
    }

    async fn apply(
        &self,
        handler_name: &HandlerName,
        effects: Vec<Effect>,
        at: DateTime<Utc>,
    ) -> Result<usize, DbErrorWrite> {
        let mut applied = 0;
        for effect in effects {
            match effect {
                Effect::Update { path, update } => {
                    self.document_store
                        .update(&path, tagger::tag(update, handler_name, at), at)
                        .await?;
                }
                Effect::Create { path, document } => {
                    match self
                        .document_store
                        .create(&path, tagger::tag_document(document, handler_name, at), at)
                        .await
                    {
                        Ok(_) => {}
                        Err(DbErrorWrite::AlreadyExists) => {
                            debug!(%path, "Document was already created");
                        }
                        Err(err) => return Err(err),
                    }
                }
                Effect::Delete { path } => match self.document_store.delete(&path, at).await {
                    Ok(_) => {}
                    Err(DbErrorWrite::NotFound) => debug!(%path, "Document was already deleted"),
                    Err(err) => return Err(err),
                },
            }
            applied += 1;
        }
        Ok(applied)
    }

    /// Consume the store's change feed, spawning one task per subscribed handler and change.
    /// Closing the handle waits for in-flight deliveries.
    pub fn spawn_new(self: Arc<Self>, config: DispatcherConfig) -> TaskHandle {
        let mut feed = self.document_store.subscribe();
        let is_closing = Arc::new(AtomicBool::default());
        let abort_handle = tokio::spawn({
            let is_closing = is_closing.clone();
            async move {
                debug!(handlers = self.handlers.len(), "Spawned dispatcher");
                let mut in_flight = JoinSet::new();
                while !is_closing.load(Ordering::Relaxed) {
                    let change = match tokio::time::timeout(FEED_POLL, feed.recv()).await {
                        Ok(Some(change)) => change,
                        Ok(None) => {
                            debug!("Change feed is closed");
                            break;
                        }
                        Err(_elapsed) => continue,
                    };
                    trace!(change_id = %change.change_id, path = %change.document_path, "Received a change");
                    for handler in self.subscribers(&change) {
                        let permit = acquire(config.task_limiter.as_ref()).await;
                        let name = handler.decl().name.clone();
                        let notification =
                            ChangeNotification::new(&change, &name, self.clock_fn.now());
                        let span = info_span!(parent: None, "delivery", handler_name = %name, event_id = %notification.event_id);
                        let dispatcher = self.clone();
                        let handler = handler.clone();
                        in_flight.spawn(
                            async move {
                                let _permit = permit;
                                dispatcher.deliver(handler.as_ref(), notification).await
                            }
                            .instrument(span),
                        );
                    }
                    while let Some(finished) = in_flight.try_join_next() {
                        if let Err(err) = finished {
                            debug!("Delivery task did not finish: {err}");
                        }
                    }
                }
                while in_flight.join_next().await.is_some() {}
            }
        })
        .abort_handle();
        TaskHandle::new("dispatcher", is_closing, abort_handle)
    }
}

async fn acquire(task_limiter: Option<&Arc<Semaphore>>) -> Option<OwnedSemaphorePermit> {
    match task_limiter {
        Some(task_limiter) => task_limiter.clone().acquire_owned().await.ok(),
        None => None,
    }
}
