//! One relay run: fetch from CloudWatch, group by destination, post to Mackerel.

pub mod aggregator;
pub mod fetcher;
pub mod publisher;

use slog::{debug, info, warn, Logger};
use tokio_util::sync::CancellationToken;

use crate::cloudwatch::{MetricDataQuery, MetricDataSource};
use crate::config::TimeWindow;
use crate::mackerel::MonitoringSink;
use crate::{RelayError, Result};

pub use aggregator::{group, GroupedMetrics};
pub use fetcher::{fill_gaps, FetchResults, FetchedSeries, MetricFetcher};
pub use publisher::{BatchPublisher, PublishReport, MAX_BATCH_SIZE};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub series: usize,
    pub values: usize,
    pub publish: PublishReport,
}

pub async fn run<S, C>(
    window: &TimeWindow,
    queries: &[MetricDataQuery],
    source: &S,
    sink: &C,
    log: &Logger,
    cancel: &CancellationToken,
) -> Result<RunSummary>
where
    S: MetricDataSource + ?Sized,
    C: MonitoringSink + ?Sized,
{
    debug!(log, "query"; "count" => queries.len(),
        "start" => %window.start, "end" => %window.end);

    let results = MetricFetcher::new(source, log)
        .fetch(window, queries, cancel)
        .await?;
    debug!(log, "fetched"; "series" => results.len());

    let grouped = group(&results);
    debug!(log, "grouped";
        "services" => grouped.services.len(), "host_values" => grouped.hosts.len());

    let publish = BatchPublisher::new(sink, log).publish(&grouped, cancel).await;
    if publish.skipped > 0 {
        warn!(log, "run cancelled during publish";
            "posted_chunks" => publish.posted, "skipped_chunks" => publish.skipped);
        return Err(RelayError::Cancelled);
    }

    let summary = RunSummary {
        series: results.len(),
        values: grouped.len(),
        publish,
    };
    info!(log, "run complete";
        "series" => summary.series,
        "values" => summary.values,
        "chunks_posted" => publish.posted,
        "chunks_failed" => publish.failed);
    Ok(summary)
}
