use slog::{info, o, warn, Logger};
use tokio_util::sync::CancellationToken;

use crate::mackerel::MonitoringSink;
use crate::metrics;

use super::aggregator::GroupedMetrics;

/// Mackerel accepts at most this many values per write.
pub const MAX_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub posted: usize,
    pub failed: usize,
    /// Chunks never sent because the run was cancelled.
    pub skipped: usize,
}

pub struct BatchPublisher<'a, C: ?Sized> {
    sink: &'a C,
    log: Logger,
    batch_size: usize,
}

impl<'a, C> BatchPublisher<'a, C>
where
    C: MonitoringSink + ?Sized,
{
    pub fn new(sink: &'a C, log: &Logger) -> Self {
        Self {
            sink,
            log: log.new(o!("component" => "publisher")),
            batch_size: MAX_BATCH_SIZE,
        }
    }

    /// Smaller chunks than the API limit; clamped to `1..=MAX_BATCH_SIZE`.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
        self
    }

    /// Posts every chunk once, in order. Failed chunks are logged and do not
    /// stop the remaining ones.
    pub async fn publish(&self, grouped: &GroupedMetrics, cancel: &CancellationToken) -> PublishReport {
        let mut report = PublishReport::default();

        for (service, values) in &grouped.services {
            for (i, chunk) in values.chunks(self.batch_size).enumerate() {
                if cancel.is_cancelled() {
                    report.skipped += 1;
                    continue;
                }
                let start = i * self.batch_size;
                info!(self.log, "PostServiceMetricValues {} values[{}:{}]",
                    service, start, start + chunk.len());

                match self.sink.post_service_metric_values(service, chunk).await {
                    Ok(()) => {
                        report.posted += 1;
                        metrics::record_chunk_posted();
                    }
                    Err(e) => {
                        warn!(self.log, "failed to PostServiceMetricValues service:{} {}", service, e);
                        report.failed += 1;
                        metrics::record_chunk_failed();
                    }
                }
            }
        }

        for (i, chunk) in grouped.hosts.chunks(self.batch_size).enumerate() {
            if cancel.is_cancelled() {
                report.skipped += 1;
                continue;
            }
            let start = i * self.batch_size;
            info!(self.log, "PostHostMetricValues values[{}:{}]", start, start + chunk.len());

            match self.sink.post_host_metric_values(chunk).await {
                Ok(()) => {
                    report.posted += 1;
                    metrics::record_chunk_posted();
                }
                Err(e) => {
                    warn!(self.log, "failed to PostHostMetricValues {}", e);
                    report.failed += 1;
                    metrics::record_chunk_failed();
                }
            }
        }

        if report.skipped > 0 {
            warn!(self.log, "publishing cancelled"; "skipped_chunks" => report.skipped);
        }
        report
    }
}
