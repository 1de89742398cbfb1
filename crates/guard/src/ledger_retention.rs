use crate::TaskHandle;
use crate::task::log_err_if_new;
use chrono::{DateTime, TimeDelta, Utc};
use concepts::storage::{DEFAULT_LEDGER_RETENTION, DbErrorGeneric, EventLedger};
use concepts::time::ClockFn;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;
use tracing::{Level, debug, info, instrument};

#[derive(Debug, Clone)]
pub struct RetentionConfig<C: ClockFn> {
    pub tick_sleep: Duration,
    /// Entries recorded earlier than `now - horizon` are deleted.
    pub horizon: Duration,
    pub batch_size: u32,
    pub clock_fn: C,
}

impl<C: ClockFn> RetentionConfig<C> {
    pub fn new(clock_fn: C) -> Self {
        Self {
            tick_sleep: Duration::from_secs(60 * 60),
            horizon: DEFAULT_LEDGER_RETENTION,
            batch_size: 500,
            clock_fn,
        }
    }

    #[must_use]
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        TimeDelta::from_std(self.horizon)
            .ok()
            .and_then(|horizon| now.checked_sub_signed(horizon))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Delete expired entries batch by batch until a batch comes back short.
#[instrument(level = Level::DEBUG, skip(ledger))]
pub async fn purge(
    ledger: &dyn EventLedger,
    cutoff: DateTime<Utc>,
    batch_size: u32,
) -> Result<u64, DbErrorGeneric> {
    let batch_size = batch_size.max(1);
    let mut total = 0;
    loop {
        let deleted = ledger.purge_older_than(cutoff, batch_size).await?;
        total += deleted;
        if deleted < u64::from(batch_size) {
            break;
        }
    }
    if total > 0 {
        info!("Purged {total} ledger entries recorded before {cutoff}");
    } else {
        debug!("Nothing to purge");
    }
    Ok(total)
}

pub fn spawn_new<C: ClockFn>(
    ledger: Arc<dyn EventLedger>,
    config: RetentionConfig<C>,
) -> TaskHandle {
    let is_closing = Arc::new(AtomicBool::default());
    let abort_handle = tokio::spawn({
        let is_closing = is_closing.clone();
        async move {
            debug!(horizon = ?config.horizon, "Spawned ledger retention");
            let mut old_err = None;
            while !is_closing.load(Ordering::Relaxed) {
                let cutoff = config.cutoff(config.clock_fn.now());
                let res = purge(ledger.as_ref(), cutoff, config.batch_size).await;
                log_err_if_new(res, &mut old_err, "ledger retention");
                tokio::time::sleep(config.tick_sleep).await;
            }
        }
    })
    .abort_handle();
    TaskHandle::new("ledger retention", is_closing, abort_handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use concepts::storage::{DbPool, DbPoolCloseable};
    use concepts::time::TimeWindow;
    use concepts::{EventId, HandlerName};
    use db_tests::Database;
    use rstest::rstest;
    use test_utils::set_up;
    use test_utils::sim_clock::SimClock;

    #[rstest]
    #[tokio::test]
    async fn entries_past_the_horizon_are_purged(
        #[values(Database::Memory, Database::Sqlite)] database: Database,
    ) {
        set_up();
        let sim_clock = SimClock::default();
        let (_guard, db_pool) = database.set_up().await;
        let ledger = db_pool.event_ledger();
        let handler_name = HandlerName::from("incrementLoginCount");
        for idx in 0..7 {
            ledger
                .record_if_new(&EventId::new(format!("old-{idx}")), &handler_name, sim_clock.now())
                .await
                .unwrap();
        }
        sim_clock.move_time_forward(DEFAULT_LEDGER_RETENTION);
        ledger
            .record_if_new(&EventId::new("fresh"), &handler_name, sim_clock.now())
            .await
            .unwrap();
        sim_clock.move_time_forward(Duration::from_secs(1));

        let mut config = RetentionConfig::new(sim_clock.clone());
        config.batch_size = 3;
        let purged = purge(ledger.as_ref(), config.cutoff(sim_clock.now()), config.batch_size)
            .await
            .unwrap();
        assert_eq!(7, purged);
        let remaining = ledger
            .count_by_handler(TimeWindow {
                start: DateTime::UNIX_EPOCH,
                end: sim_clock.now(),
            })
            .await
            .unwrap();
        assert_eq!(vec![(handler_name, 1)], remaining);
        db_pool.close().await;
    }

    #[test]
    fn cutoff_saturates() {
        let mut config = RetentionConfig::new(SimClock::default());
        config.horizon = Duration::MAX;
        assert_eq!(DateTime::<Utc>::MIN_UTC, config.cutoff(SimClock::default().now()));
    }
}
