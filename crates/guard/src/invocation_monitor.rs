//! Periodic sweep counting handler invocations, the backstop for cascades the guard
//! cannot see, e.g. two handlers triggering each other.
use crate::TaskHandle;
use crate::task::log_err_if_new;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use concepts::HandlerName;
use concepts::storage::{
    AlertRecord, DbErrorGeneric, DbPool, EventLedger, InvocationCountSample, MonitorStore,
};
use concepts::time::{ClockFn, TimeWindow};
use hashbrown::HashMap;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;
use tracing::{Level, debug, error, info, instrument, warn};

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_THRESHOLD: u64 = 1000;

#[derive(Debug, Clone)]
pub struct MonitorConfig<C: ClockFn> {
    pub tick_sleep: Duration,
    pub window: Duration,
    pub default_threshold: u64,
    pub thresholds: HashMap<HandlerName, u64>,
    pub clock_fn: C,
}

impl<C: ClockFn> MonitorConfig<C> {
    pub fn new(clock_fn: C) -> Self {
        Self {
            tick_sleep: DEFAULT_WINDOW,
            window: DEFAULT_WINDOW,
            default_threshold: DEFAULT_THRESHOLD,
            thresholds: HashMap::new(),
            clock_fn,
        }
    }
}

/// Destination of alerts raised by the sweep.
#[async_trait]
pub trait AlertChannel: Send + Sync {
    async fn publish(&self, alert: &AlertRecord);
}

/// Reports alerts as `warn` events.
#[derive(Debug, Clone, Default)]
pub struct LogAlertChannel;

#[async_trait]
impl AlertChannel for LogAlertChannel {
    async fn publish(&self, alert: &AlertRecord) {
        warn!(
            handler_name = %alert.handler_name,
            count = alert.count,
            threshold = alert.threshold,
            "Handler invocation count exceeded the threshold, possible trigger loop"
        );
    }
}

pub struct InvocationMonitor<C: ClockFn> {
    ledger: Arc<dyn EventLedger>,
    monitor_store: Arc<dyn MonitorStore>,
    channels: Vec<Arc<dyn AlertChannel>>,
    config: MonitorConfig<C>,
}

impl<C: ClockFn> InvocationMonitor<C> {
    /// The log channel is always present, `channels` are added to it.
    pub fn new(
        db_pool: &dyn DbPool,
        config: MonitorConfig<C>,
        channels: Vec<Arc<dyn AlertChannel>>,
    ) -> Self {
        let mut all_channels: Vec<Arc<dyn AlertChannel>> = vec![Arc::new(LogAlertChannel)];
        all_channels.extend(channels);
        Self {
            ledger: db_pool.event_ledger(),
            monitor_store: db_pool.monitor_store(),
            channels: all_channels,
            config,
        }
    }

    #[must_use]
    pub fn threshold_for(&self, handler_name: &HandlerName) -> u64 {
        self.config
            .thresholds
            .get(handler_name)
            .copied()
            .unwrap_or(self.config.default_threshold)
    }

    /// Count the invocations of every handler in the window ending at `now`, persist the
    /// samples and raise an alert for every handler above its threshold.
    ///
    /// Only a failing count query fails the sweep. Persistence failures are logged,
    /// the alerts are published regardless.
    #[instrument(level = Level::DEBUG, skip(self))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<AlertRecord>, DbErrorGeneric> {
        let window = TimeWindow::trailing(now, self.config.window);
        let counts = self.ledger.count_by_handler(window).await?;
        let samples: Vec<_> = counts
            .iter()
            .map(|(handler_name, count)| InvocationCountSample {
                handler_name: handler_name.clone(),
                window_start: window.start,
                window_end: window.end,
                count: *count,
            })
            .collect();
        let alerts: Vec<_> = counts
            .into_iter()
            .filter_map(|(handler_name, count)| {
                let threshold = self.threshold_for(&handler_name);
                (count > threshold).then_some(AlertRecord {
                    created_at: now,
                    handler_name,
                    count,
                    threshold,
                })
            })
            .collect();
        debug!(handlers = samples.len(), alerts = alerts.len(), "Swept");
        if !samples.is_empty()
            && let Err(err) = self.monitor_store.append_samples(samples).await
        {
            error!("Cannot persist the invocation samples - {err:?}");
        }
        if !alerts.is_empty() {
            if let Err(err) = self.monitor_store.append_alerts(alerts.clone()).await {
                error!("Cannot persist the alerts - {err:?}");
            }
            for alert in &alerts {
                for channel in &self.channels {
                    channel.publish(alert).await;
                }
            }
        }
        Ok(alerts)
    }

    pub fn spawn_new(self) -> TaskHandle {
        let is_closing = Arc::new(AtomicBool::default());
        let abort_handle = tokio::spawn({
            let is_closing = is_closing.clone();
            async move {
                info!(
                    window = ?self.config.window,
                    default_threshold = self.config.default_threshold,
                    "Spawned invocation monitor"
                );
                let mut old_err = None;
                while !is_closing.load(Ordering::Relaxed) {
                    let res = self.sweep(self.config.clock_fn.now()).await;
                    log_err_if_new(res, &mut old_err, "invocation monitor");
                    tokio::time::sleep(self.config.tick_sleep).await;
                }
            }
        })
        .abort_handle();
        TaskHandle::new("invocation monitor", is_closing, abort_handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use concepts::EventId;
    use concepts::storage::{
        DbErrorRead, DbErrorWrite, DbPoolCloseable, DocumentStore, ErrorSink, LedgerClaim,
        LedgerEntry,
    };
    use db_mem::inmemory_dao::InMemoryPool;
    use db_tests::Database;
    use rstest::rstest;
    use std::sync::Mutex;
    use test_utils::set_up;
    use test_utils::sim_clock::SimClock;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<AlertRecord>>);

    #[async_trait]
    impl AlertChannel for Recorder {
        async fn publish(&self, alert: &AlertRecord) {
            self.0.lock().unwrap().push(alert.clone());
        }
    }

    async fn record_invocations(
        ledger: &dyn EventLedger,
        handler_name: &str,
        count: usize,
        sim_clock: &SimClock,
    ) {
        let handler_name = HandlerName::from(handler_name);
        for idx in 0..count {
            ledger
                .record_if_new(
                    &EventId::new(format!("chg_{idx}.{handler_name}")),
                    &handler_name,
                    sim_clock.now(),
                )
                .await
                .unwrap();
        }
    }

    #[rstest]
    #[tokio::test]
    async fn count_above_threshold_raises_one_alert(
        #[values(Database::Memory, Database::Sqlite)] database: Database,
    ) {
        set_up();
        let sim_clock = SimClock::default();
        let (_guard, db_pool) = database.set_up().await;
        record_invocations(db_pool.event_ledger().as_ref(), "X", 1001, &sim_clock).await;
        record_invocations(db_pool.event_ledger().as_ref(), "Y", 999, &sim_clock).await;
        sim_clock.move_time_forward(Duration::from_secs(60));
        let recorder = Arc::new(Recorder::default());
        let monitor = InvocationMonitor::new(
            &db_pool,
            MonitorConfig::new(sim_clock.clone()),
            vec![recorder.clone() as Arc<dyn AlertChannel>],
        );

        let alerts = monitor.sweep(sim_clock.now()).await.unwrap();
        let expected = vec![AlertRecord {
            created_at: sim_clock.now(),
            handler_name: HandlerName::from("X"),
            count: 1001,
            threshold: 1000,
        }];
        assert_eq!(expected, alerts);
        assert_eq!(expected, *recorder.0.lock().unwrap());

        let everything = TimeWindow {
            start: DateTime::UNIX_EPOCH,
            end: sim_clock.now() + Duration::from_secs(1),
        };
        let monitor_store = db_pool.monitor_store();
        assert_eq!(expected, monitor_store.list_alerts(everything).await.unwrap());
        let samples = monitor_store.list_samples(None, everything).await.unwrap();
        assert_eq!(2, samples.len());
        assert!(samples.iter().any(|sample| &*sample.handler_name == "Y" && sample.count == 999));
        db_pool.close().await;
    }

    #[rstest]
    #[tokio::test]
    async fn count_below_threshold_raises_nothing(
        #[values(Database::Memory, Database::Sqlite)] database: Database,
    ) {
        set_up();
        let sim_clock = SimClock::default();
        let (_guard, db_pool) = database.set_up().await;
        record_invocations(db_pool.event_ledger().as_ref(), "X", 999, &sim_clock).await;
        let monitor =
            InvocationMonitor::new(&db_pool, MonitorConfig::new(sim_clock.clone()), Vec::new());
        sim_clock.move_time_forward(Duration::from_secs(1));
        assert!(monitor.sweep(sim_clock.now()).await.unwrap().is_empty());
        db_pool.close().await;
    }

    #[tokio::test]
    async fn entries_outside_of_the_window_are_not_counted() {
        set_up();
        let sim_clock = SimClock::default();
        let (_guard, db_pool) = Database::Memory.set_up().await;
        record_invocations(db_pool.event_ledger().as_ref(), "X", 1001, &sim_clock).await;
        sim_clock.move_time_forward(DEFAULT_WINDOW + Duration::from_secs(1));
        let monitor =
            InvocationMonitor::new(&db_pool, MonitorConfig::new(sim_clock.clone()), Vec::new());
        assert!(monitor.sweep(sim_clock.now()).await.unwrap().is_empty());
        db_pool.close().await;
    }

    #[tokio::test]
    async fn per_handler_thresholds_are_independent() {
        set_up();
        let sim_clock = SimClock::default();
        let (_guard, db_pool) = Database::Memory.set_up().await;
        record_invocations(db_pool.event_ledger().as_ref(), "busy", 20, &sim_clock).await;
        record_invocations(db_pool.event_ledger().as_ref(), "quiet", 20, &sim_clock).await;
        sim_clock.move_time_forward(Duration::from_secs(1));
        let mut config = MonitorConfig::new(sim_clock.clone());
        config.default_threshold = 10;
        config.thresholds.insert(HandlerName::from("busy"), 50);
        let monitor = InvocationMonitor::new(&db_pool, config, Vec::new());
        assert_eq!(50, monitor.threshold_for(&HandlerName::from("busy")));
        let alerts = monitor.sweep(sim_clock.now()).await.unwrap();
        assert_eq!(1, alerts.len());
        assert_eq!(HandlerName::from("quiet"), alerts[0].handler_name);
        assert_eq!(10, alerts[0].threshold);
        db_pool.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sweep_sees_counts_while_writes_pile_up() {
        set_up();
        let sim_clock = SimClock::default();
        let (_guard, db_pool) = Database::Sqlite.set_up().await;
        record_invocations(db_pool.event_ledger().as_ref(), "X", 1001, &sim_clock).await;
        sim_clock.move_time_forward(Duration::from_secs(60));
        let now = sim_clock.now();
        let monitor =
            InvocationMonitor::new(&db_pool, MonitorConfig::new(sim_clock.clone()), Vec::new());
        let busy = HandlerName::from("Y");

        for round in 0..20 {
            let writers: Vec<_> = (0..400)
                .map(|idx| {
                    let ledger = db_pool.event_ledger();
                    let busy = busy.clone();
                    tokio::spawn(async move {
                        ledger
                            .record_if_new(&EventId::new(format!("y-{round}-{idx}")), &busy, now)
                            .await
                            .unwrap();
                    })
                })
                .collect();
            let alerts = monitor.sweep(now).await.unwrap();
            assert!(
                alerts
                    .iter()
                    .any(|alert| &*alert.handler_name == "X" && alert.count == 1001),
                "round {round}: {alerts:?}"
            );
            for writer in writers {
                writer.await.unwrap();
            }
        }
        db_pool.close().await;
    }

    struct CountsUnavailable;

    #[async_trait]
    impl EventLedger for CountsUnavailable {
        async fn record_if_new(
            &self,
            _event_id: &EventId,
            _handler_name: &HandlerName,
            _recorded_at: DateTime<Utc>,
        ) -> Result<LedgerClaim, DbErrorWrite> {
            Ok(LedgerClaim::Claimed)
        }

        async fn count_by_handler(
            &self,
            _window: TimeWindow,
        ) -> Result<Vec<(HandlerName, u64)>, DbErrorGeneric> {
            Err(DbErrorGeneric::Uncategorized("busy".into()))
        }

        async fn purge_older_than(
            &self,
            _cutoff: DateTime<Utc>,
            _batch_size: u32,
        ) -> Result<u64, DbErrorGeneric> {
            Ok(0)
        }

        async fn get_entry(&self, _event_id: &EventId) -> Result<LedgerEntry, DbErrorRead> {
            Err(DbErrorRead::NotFound)
        }
    }

    struct PoolWithoutCounts(InMemoryPool);

    impl DbPool for PoolWithoutCounts {
        fn event_ledger(&self) -> Arc<dyn EventLedger> {
            Arc::new(CountsUnavailable)
        }

        fn document_store(&self) -> Arc<dyn DocumentStore> {
            self.0.document_store()
        }

        fn error_sink(&self) -> Arc<dyn ErrorSink> {
            self.0.error_sink()
        }

        fn monitor_store(&self) -> Arc<dyn MonitorStore> {
            self.0.monitor_store()
        }
    }

    #[tokio::test]
    async fn failing_count_query_fails_the_sweep() {
        set_up();
        let sim_clock = SimClock::default();
        let db_pool = PoolWithoutCounts(InMemoryPool::new());
        let recorder = Arc::new(Recorder::default());
        let monitor = InvocationMonitor::new(
            &db_pool,
            MonitorConfig::new(sim_clock.clone()),
            vec![recorder.clone() as Arc<dyn AlertChannel>],
        );
        assert_matches!(
            monitor.sweep(sim_clock.now()).await,
            Err(DbErrorGeneric::Uncategorized(_))
        );
        assert!(recorder.0.lock().unwrap().is_empty());
        let everything = TimeWindow {
            start: DateTime::UNIX_EPOCH,
            end: sim_clock.now() + Duration::from_secs(1),
        };
        let samples = db_pool.monitor_store().list_samples(None, everything).await.unwrap();
        assert!(samples.is_empty());
    }
}
