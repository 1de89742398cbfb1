use hashbrown::HashMap;
use hdrhistogram::Histogram;
use std::time::Duration;
use tracing::{debug, info};

// 1us-1s
fn new_histogram() -> Histogram<u32> {
    let mut histogram =
        Histogram::<u32>::new_with_bounds(1, 1_000_000, 3).expect("bounds are statically valid");
    histogram.auto(true);
    histogram
}

fn record(histogram: &mut Histogram<u32>, duration: Duration) {
    if let Ok(value) = u32::try_from(duration.as_micros()) {
        let _ = histogram
            .record(u64::from(value))
            .inspect_err(|err| debug!("metric not recorded - {err:?}"));
    }
}

/// Latency statistics of the command thread, logged periodically when enabled.
pub(crate) struct Histograms {
    metrics_threshold: Option<Duration>,
    // Time a command spends in the queue.
    queue_latency: Histogram<u32>,
    commands: HashMap<&'static str, Histogram<u32>>,
}

impl Histograms {
    pub(crate) fn new(metrics_threshold: Option<Duration>) -> Histograms {
        Histograms {
            metrics_threshold,
            queue_latency: new_histogram(),
            commands: HashMap::new(),
        }
    }

    pub(crate) fn record(
        &mut self,
        queue_latency: Duration,
        command_name: &'static str,
        command_duration: Duration,
    ) {
        if self.metrics_threshold.is_none() {
            return;
        }
        record(&mut self.queue_latency, queue_latency);
        record(
            self.commands
                .entry(command_name)
                .or_insert_with(new_histogram),
            command_duration,
        );
    }

    pub(crate) fn log_if_elapsed(&mut self, metrics_instant: &mut std::time::Instant) {
        if let Some(metrics_threshold) = self.metrics_threshold
            && metrics_instant.elapsed() > metrics_threshold
        {
            info!(
                mean_us = self.queue_latency.mean(),
                count = self.queue_latency.len(),
                "sqlite queue latency"
            );
            self.queue_latency.clear();
            for (name, histogram) in &mut self.commands {
                info!(
                    command = *name,
                    mean_us = histogram.mean(),
                    p99_us = histogram.value_at_quantile(0.99),
                    count = histogram.len(),
                    "sqlite command duration"
                );
                histogram.clear();
            }
            *metrics_instant = std::time::Instant::now();
        }
    }
}
