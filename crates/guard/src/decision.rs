use crate::field_change::any_changed;
use crate::self_update::is_self_echo;
use concepts::storage::{EventLedger, LedgerClaim};
use concepts::time::ClockFn;
use concepts::{Document, EventId, FieldPath, HandlerName};
use serde::Serialize;
use std::sync::Arc;
use tracing::{Level, debug, instrument, warn};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr, Serialize,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum DecisionReason {
    Proceed,
    DuplicateEvent,
    NoRelevantChange,
    SelfEcho,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub proceed: bool,
    pub reason: DecisionReason,
    /// Watched fields that changed, empty for deletions and skips.
    pub changed_fields: Vec<FieldPath>,
    /// The ledger could not be reached and the event was let through without deduplication.
    pub ledger_degraded: bool,
}

impl Decision {
    fn skip(reason: DecisionReason, ledger_degraded: bool) -> Self {
        Self {
            proceed: false,
            reason,
            changed_fields: Vec::new(),
            ledger_degraded,
        }
    }
}

/// Decides whether a handler should act on a change notification.
#[derive(Clone)]
pub struct Guard<C: ClockFn> {
    ledger: Arc<dyn EventLedger>,
    clock_fn: C,
}

impl<C: ClockFn> Guard<C> {
    pub fn new(ledger: Arc<dyn EventLedger>, clock_fn: C) -> Self {
        Self { ledger, clock_fn }
    }

    /// Checks are evaluated in order and the first failing one wins:
    /// duplicate delivery, no watched field changed, the handler's own echo.
    /// A missing `after` snapshot is a deletion, only the ledger applies to it.
    ///
    /// The ledger claim is recorded before the other checks, so the event is consumed
    /// even when it is skipped for another reason.
    #[instrument(level = Level::DEBUG, skip_all, fields(%event_id, %handler_name))]
    pub async fn decide(
        &self,
        event_id: &EventId,
        handler_name: &HandlerName,
        before: Option<&Document>,
        after: Option<&Document>,
        watched_fields: &[FieldPath],
    ) -> Decision {
        let ledger_degraded = match self
            .ledger
            .record_if_new(event_id, handler_name, self.clock_fn.now())
            .await
        {
            Ok(LedgerClaim::Claimed) => false,
            Ok(LedgerClaim::AlreadyClaimed) => {
                debug!("Skipping duplicate event");
                return Decision::skip(DecisionReason::DuplicateEvent, false);
            }
            Err(err) => {
                warn!("Event ledger is unavailable, proceeding without deduplication - {err}");
                true
            }
        };
        let Some(after) = after else {
            return Decision {
                proceed: true,
                reason: DecisionReason::Proceed,
                changed_fields: Vec::new(),
                ledger_degraded,
            };
        };
        let changes = any_changed(before, after, watched_fields);
        if !changes.changed {
            debug!("Skipping, none of the watched fields changed");
            return Decision::skip(DecisionReason::NoRelevantChange, ledger_degraded);
        }
        if is_self_echo(after, handler_name) {
            debug!(changed_fields = ?changes.changed_fields, "Skipping own echo");
            return Decision::skip(DecisionReason::SelfEcho, ledger_degraded);
        }
        Decision {
            proceed: true,
            reason: DecisionReason::Proceed,
            changed_fields: changes.changed_fields,
            ledger_degraded,
        }
    }
}
