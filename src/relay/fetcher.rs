use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use slog::{debug, o, warn, Logger};
use tokio_util::sync::CancellationToken;

use crate::cloudwatch::{GetMetricDataInput, MetricDataQuery, MetricDataSource};
use crate::config::TimeWindow;
use crate::label::Label;
use crate::metrics;
use crate::models::DataPoint;
use crate::{RelayError, Result};

/// Fetched series keyed by their raw label string.
///
/// Everything is held in memory until the run ends; there is no spilling, so
/// very large query sets are bounded by available memory.
pub type FetchResults = BTreeMap<String, FetchedSeries>;

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedSeries {
    pub label: Label,
    /// Ordered by timestamp, unique timestamps.
    pub points: Vec<DataPoint>,
}

impl FetchedSeries {
    pub fn new(label: Label) -> Self {
        Self {
            label,
            points: Vec::new(),
        }
    }

    /// Merges points from another page. A later value for an identical
    /// timestamp replaces the earlier one.
    pub fn merge(&mut self, points: impl IntoIterator<Item = DataPoint>) {
        let mut by_time: BTreeMap<DateTime<Utc>, f64> = self
            .points
            .drain(..)
            .map(|p| (p.timestamp, p.value))
            .collect();
        for point in points {
            by_time.insert(point.timestamp, point.value);
        }
        self.points = by_time
            .into_iter()
            .map(|(timestamp, value)| DataPoint::new(timestamp, value))
            .collect();
    }
}

pub struct MetricFetcher<'a, S: ?Sized> {
    source: &'a S,
    log: Logger,
}

impl<'a, S> MetricFetcher<'a, S>
where
    S: MetricDataSource + ?Sized,
{
    pub fn new(source: &'a S, log: &Logger) -> Self {
        Self {
            source,
            log: log.new(o!("component" => "fetcher")),
        }
    }

    /// Pages through `GetMetricData` for the whole query list, then fills
    /// gaps for `emit_zero` labels. Any page failure or cancellation discards
    /// everything fetched so far.
    pub async fn fetch(
        &self,
        window: &TimeWindow,
        queries: &[MetricDataQuery],
        cancel: &CancellationToken,
    ) -> Result<FetchResults> {
        let mut results = FetchResults::new();
        let mut input = GetMetricDataInput {
            start_time: window.start,
            end_time: window.end,
            metric_data_queries: queries.to_vec(),
            next_token: None,
        };

        loop {
            if cancel.is_cancelled() {
                return Err(RelayError::Cancelled);
            }
            match &input.next_token {
                Some(token) => debug!(self.log, "GetMetricData"; "next_token" => token),
                None => debug!(self.log, "GetMetricData";
                    "start" => %window.start, "end" => %window.end),
            }

            let output = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RelayError::Cancelled),
                output = self.source.get_metric_data(&input) => output?,
            };
            metrics::record_page();

            for message in &output.messages {
                debug!(self.log, "GetMetricData message";
                    "code" => message.code.as_deref().unwrap_or(""),
                    "value" => message.value.as_deref().unwrap_or(""));
            }

            for result in output.metric_data_results {
                let Some(raw) = result.label.as_deref() else {
                    warn!(self.log, "result without label";
                        "id" => result.id.as_deref().unwrap_or(""));
                    metrics::record_dropped_series();
                    continue;
                };
                let Some(label) = self.decode(raw) else {
                    metrics::record_dropped_series();
                    continue;
                };
                results
                    .entry(raw.to_string())
                    .or_insert_with(|| FetchedSeries::new(label))
                    .merge(result.points());
            }

            match output.next_token.filter(|t| !t.is_empty()) {
                Some(token) => input.next_token = Some(token),
                None => break,
            }
        }

        for query in queries {
            let Some(raw) = query.label.as_deref() else {
                continue;
            };
            let Some(label) = self.decode(raw) else {
                continue;
            };
            let Some(period) = query.period().filter(|p| *p > Duration::zero()) else {
                continue;
            };
            if !label.emit_zero {
                continue;
            }

            debug!(self.log, "filling missing data points";
                "label" => raw, "period_secs" => period.num_seconds());
            let series = results
                .entry(raw.to_string())
                .or_insert_with(|| FetchedSeries::new(label));
            let filled = fill_gaps(&mut series.points, window, period);
            metrics::record_zero_filled(filled);
        }

        Ok(results)
    }

    fn decode(&self, raw: &str) -> Option<Label> {
        match Label::decode(raw) {
            Ok(decoded) => {
                for opt in &decoded.ignored {
                    warn!(self.log, "unknown option {} in label {}", opt, raw);
                }
                Some(decoded.label)
            }
            Err(e) => {
                warn!(self.log, "{}", e; "label" => raw);
                None
            }
        }
    }
}

fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    let secs = t.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(60), 0).unwrap_or(t)
}

/// Adds a zero point for every expected tick with no sample and returns how
/// many were added.
///
/// Ticks run from `window.start` truncated to the minute, by `period`, up to
/// but excluding `window.end`. Since the truncated start never passes the
/// end, a series with no samples at all still receives at least one point.
pub fn fill_gaps(points: &mut Vec<DataPoint>, window: &TimeWindow, period: Duration) -> usize {
    if period <= Duration::zero() {
        return 0;
    }
    let present: HashSet<DateTime<Utc>> = points.iter().map(|p| p.timestamp).collect();

    let mut filled = 0;
    let mut tick = truncate_to_minute(window.start);
    while tick < window.end {
        if !present.contains(&tick) {
            points.push(DataPoint::zero(tick));
            filled += 1;
        }
        match tick.checked_add_signed(period) {
            Some(next) => tick = next,
            None => break,
        }
    }
    points.sort_by_key(|p| p.timestamp);
    filled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::capture::Captured;
    use crate::relay::testing::{at, page, query, ScriptedSource};
    use pretty_assertions::assert_eq;
    use slog::Level;

    fn window() -> TimeWindow {
        TimeWindow::new(at(0), at(180)).unwrap()
    }

    fn timestamps(series: &FetchedSeries) -> Vec<i64> {
        series.points.iter().map(|p| p.timestamp.timestamp() - at(0).timestamp()).collect()
    }

    #[tokio::test]
    async fn test_follows_next_token_until_exhausted() {
        let source = ScriptedSource::new(vec![
            Ok(page(vec![("service=prod:a", vec![(0, 1.0)])], Some("t1"))),
            Ok(page(vec![("host=h1:b", vec![(60, 2.0)])], Some("t2"))),
            Ok(page(vec![], None)),
        ]);
        let log = Captured::default().logger();
        let queries = vec![query("service=prod:a", Some(60)), query("host=h1:b", Some(60))];

        let results = MetricFetcher::new(&source, &log)
            .fetch(&window(), &queries, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            source.tokens(),
            vec![None, Some("t1".to_string()), Some("t2".to_string())]
        );
        assert_eq!(results.len(), 2);
        assert_eq!(results["service=prod:a"].label, Label::service("prod", "a"));
        assert_eq!(results["host=h1:b"].points[0].value, 2.0);
    }

    // Overwriting by label would keep only the second page's record; the
    // fetcher merges both pages instead.
    #[tokio::test]
    async fn test_duplicate_label_across_pages_is_merged_not_overwritten() {
        let source = ScriptedSource::new(vec![
            Ok(page(vec![("service=prod:a", vec![(0, 1.0), (60, 2.0)])], Some("t1"))),
            Ok(page(vec![("service=prod:a", vec![(60, 20.0), (120, 3.0)])], None)),
        ]);
        let log = Captured::default().logger();
        let queries = vec![query("service=prod:a", Some(60))];

        let results = MetricFetcher::new(&source, &log)
            .fetch(&window(), &queries, &CancellationToken::new())
            .await
            .unwrap();

        let series = &results["service=prod:a"];
        assert_eq!(timestamps(series), vec![0, 60, 120]);
        let values: Vec<f64> = series.points.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![1.0, 20.0, 3.0]);
    }

    #[tokio::test]
    async fn test_page_failure_aborts_whole_fetch() {
        let source = ScriptedSource::new(vec![
            Ok(page(vec![("service=prod:a", vec![(0, 1.0)])], Some("t1"))),
            Err(RelayError::Fetch("throttled".to_string())),
            Ok(page(vec![], None)),
        ]);
        let log = Captured::default().logger();

        let err = MetricFetcher::new(&source, &log)
            .fetch(&window(), &[query("service=prod:a", None)], &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Fetch(ref msg) if msg == "throttled"));
        assert_eq!(source.tokens().len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_page() {
        let source = ScriptedSource::new(vec![Ok(page(vec![], None))]);
        let log = Captured::default().logger();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = MetricFetcher::new(&source, &log)
            .fetch(&window(), &[], &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Cancelled));
        assert!(source.tokens().is_empty());
    }

    #[tokio::test]
    async fn test_bad_labels_are_dropped_with_warning() {
        let source = ScriptedSource::new(vec![Ok(page(
            vec![
                ("zzz=goo:foo.bar.baz", vec![(0, 1.0)]),
                ("foo.bar.baz", vec![(0, 1.0)]),
                ("service=prod:ok;mystery", vec![(0, 5.0)]),
            ],
            None,
        ))]);
        let captured = Captured::default();
        let log = captured.logger();

        let results = MetricFetcher::new(&source, &log)
            .fetch(&window(), &[], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(results.keys().collect::<Vec<_>>(), vec!["service=prod:ok;mystery"]);
        let warnings = captured.messages(Level::Warning);
        assert_eq!(warnings.len(), 3);
        assert!(warnings.iter().any(|w| w.contains("unknown label type zzz")));
        assert!(warnings
            .iter()
            .any(|w| w == "unknown option mystery in label service=prod:ok;mystery"));
    }

    #[tokio::test]
    async fn test_gap_fill_around_real_point() {
        let source = ScriptedSource::new(vec![Ok(page(
            vec![("host=foo:hoge;emit_zero", vec![(60, 7.0)])],
            None,
        ))]);
        let log = Captured::default().logger();
        let queries = vec![query("host=foo:hoge;emit_zero", Some(60))];

        let results = MetricFetcher::new(&source, &log)
            .fetch(&window(), &queries, &CancellationToken::new())
            .await
            .unwrap();

        let series = &results["host=foo:hoge;emit_zero"];
        assert_eq!(timestamps(series), vec![0, 60, 120]);
        let values: Vec<f64> = series.points.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![0.0, 7.0, 0.0]);
    }

    #[tokio::test]
    async fn test_silent_emit_zero_label_still_produces_series() {
        let source = ScriptedSource::new(vec![Ok(page(vec![], None))]);
        let log = Captured::default().logger();
        let queries = vec![query("service=prod:errors;emit_zero", Some(60))];

        let results = MetricFetcher::new(&source, &log)
            .fetch(&window(), &queries, &CancellationToken::new())
            .await
            .unwrap();

        let series = &results["service=prod:errors;emit_zero"];
        assert_eq!(series.label, Label::service("prod", "errors").with_emit_zero(true));
        assert_eq!(timestamps(series), vec![0, 60, 120]);
        assert!(series.points.iter().all(|p| p.value == 0.0));
    }

    #[tokio::test]
    async fn test_no_gap_fill_without_flag_or_period() {
        let source = ScriptedSource::new(vec![Ok(page(
            vec![
                ("service=prod:plain", vec![(60, 1.0)]),
                ("service=prod:noperiod;emit_zero", vec![(60, 1.0)]),
            ],
            None,
        ))]);
        let log = Captured::default().logger();
        let queries = vec![
            query("service=prod:plain", Some(60)),
            query("service=prod:noperiod;emit_zero", None),
            query("service=prod:zeroperiod;emit_zero", Some(0)),
        ];

        let results = MetricFetcher::new(&source, &log)
            .fetch(&window(), &queries, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(timestamps(&results["service=prod:plain"]), vec![60]);
        assert_eq!(timestamps(&results["service=prod:noperiod;emit_zero"]), vec![60]);
    }

    #[test]
    fn test_fill_gaps_truncates_start_and_never_duplicates() {
        let window = TimeWindow::new(at(30), at(300)).unwrap();
        let mut points = vec![DataPoint::new(at(120), 4.0), DataPoint::new(at(0), 1.0)];

        let filled = fill_gaps(&mut points, &window, Duration::seconds(60));

        assert_eq!(filled, 3);
        let secs: Vec<i64> = points.iter().map(|p| p.timestamp.timestamp() - at(0).timestamp()).collect();
        assert_eq!(secs, vec![0, 60, 120, 180, 240]);
        assert_eq!(points[2].value, 4.0);

        let again = fill_gaps(&mut points, &window, Duration::seconds(60));
        assert_eq!(again, 0);
        assert_eq!(points.len(), 5);
    }

    #[test]
    fn test_merge_large_series_keeps_order_and_latest_values() {
        let points = |offset: f64| -> Vec<DataPoint> {
            (0..100_800)
                .rev()
                .map(|i| DataPoint::new(at(i * 60), i as f64 + offset))
                .collect()
        };
        let mut series = FetchedSeries::new(Label::service("prod", "a"));

        let started = std::time::Instant::now();
        series.merge(points(0.0));
        series.merge(points(0.5));
        assert!(started.elapsed() < std::time::Duration::from_secs(5));

        assert_eq!(series.points.len(), 100_800);
        assert!(series
            .points
            .windows(2)
            .all(|w| w[0].timestamp < w[1].timestamp));
        assert_eq!(series.points[0].value, 0.5);
        assert_eq!(series.points[100_799].value, 100_799.5);
    }

    #[test]
    fn test_fill_gaps_stops_when_period_overflows_time_range() {
        let mut points = Vec::new();
        let period = Duration::try_seconds(i64::MAX / 1_000).unwrap();

        let filled = fill_gaps(&mut points, &window(), period);

        assert_eq!(filled, 1);
        assert_eq!(points, vec![DataPoint::zero(at(0))]);
    }

    #[test]
    fn test_fill_gaps_ignores_non_positive_period() {
        let mut points = Vec::new();
        assert_eq!(fill_gaps(&mut points, &window(), Duration::zero()), 0);
        assert!(points.is_empty());
    }
}
